//! Configuration deployment to the attached device.
//!
//! Deployment is fail-fast on structure and best-effort on hardware: the
//! whole [`MokuConfig`] is validated before anything is sent, then each slot
//! is deployed independently. A slot that cannot be deployed (missing
//! bitstream, instrument rejected by the device) is skipped and reported, and
//! the remaining slots still go out. Losing ownership mid-way aborts, since
//! every later call would fail the same way.
//!
//! The device cannot report back the configuration it is running, so the
//! deployer remembers what the last push deployed, leaving out skipped slots
//! and withheld connections. `get_config` reports that cached copy next to a
//! live slot query so drift is visible.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::moku::device::DeviceHandle;
use crate::moku::error::{ErrorKind, MokuError, MokuResult};
use crate::moku::model::{
    validate_routing, Connection, InstrumentKind, MokuConfig, MokuModel, PlatformDescriptor,
    SlotConfig,
};
use crate::moku::session::SessionManager;

/// A slot that was not deployed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedSlot {
    /// Slot number.
    pub slot: u8,
    /// Instrument that was requested.
    pub instrument: InstrumentKind,
    /// Why the slot was skipped.
    pub reason: String,
}

/// Outcome of [`ConfigurationDeployer::push`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeploymentReport {
    /// Slots deployed successfully.
    pub deployed: Vec<u8>,
    /// Slots skipped, with reasons.
    pub skipped: Vec<SkippedSlot>,
    /// Connections sent to the device.
    pub routing_applied: Vec<Connection>,
    /// Connections withheld because they touch a skipped slot.
    pub routing_skipped: Vec<Connection>,
    /// Routing failure, if the device rejected the connections.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing_error: Option<String>,
}

impl DeploymentReport {
    /// Whether every slot and connection went out.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty() && self.routing_skipped.is_empty() && self.routing_error.is_none()
    }
}

/// State of one slot as seen by [`ConfigurationDeployer::list_slots`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotStatus {
    /// Slot number.
    pub slot: u8,
    /// Instrument the device reports (API name), if known.
    pub instrument: Option<String>,
    /// Instrument in the last pushed configuration, if any.
    pub configured: Option<InstrumentKind>,
}

/// Where slot information came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Queried from the device.
    Device,
    /// Reconstructed from the last pushed configuration.
    LastPushed,
}

/// Outcome of [`ConfigurationDeployer::list_slots`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotListing {
    /// Where the listing came from.
    pub source: Source,
    /// Slots in ascending order.
    pub slots: Vec<SlotStatus>,
    /// Why the live query was not used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Outcome of [`ConfigurationDeployer::snapshot`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigSnapshot {
    /// Last configuration pushed in this session.
    pub config: Option<MokuConfig>,
    /// Live slot state.
    pub live: SlotListing,
    /// Slots where the device disagrees with `config`.
    pub drift: Vec<u8>,
}

/// Outcome of [`ConfigurationDeployer::set_routing`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutingReport {
    /// Connections now active on the device.
    pub applied: Vec<Connection>,
    /// What the connections were validated against.
    pub validated_against: Source,
}

/// Pushes configurations to the attached device.
#[derive(Debug, Default)]
pub struct ConfigurationDeployer {
    last_pushed: Option<MokuConfig>,
}

impl ConfigurationDeployer {
    /// Creates a deployer with no cached configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The last pushed configuration as deployed, if any.
    #[must_use]
    pub const fn last_pushed(&self) -> Option<&MokuConfig> {
        self.last_pushed.as_ref()
    }

    /// Drops the cached configuration (the session it belonged to ended).
    pub fn forget(&mut self) {
        self.last_pushed = None;
    }

    /// Validates `config` and deploys it slot by slot.
    ///
    /// # Errors
    ///
    /// - precondition error if nothing is attached
    /// - validation error if the configuration is inconsistent (nothing is sent)
    /// - conflict error if ownership is lost during deployment
    pub async fn push(
        &mut self,
        sessions: &mut SessionManager,
        config: MokuConfig,
    ) -> MokuResult<DeploymentReport> {
        let handle = sessions.handle()?;
        config.validate()?;

        let mut report = DeploymentReport::default();
        for (&slot, slot_config) in &config.slots {
            match deploy_slot(handle, slot, slot_config).await {
                Ok(()) => {
                    tracing::info!(slot, instrument = slot_config.instrument.api_name(), "Slot deployed");
                    report.deployed.push(slot);
                }
                Err(e) if e.kind() == ErrorKind::Conflict => return Err(e),
                Err(e) => {
                    tracing::warn!(slot, error = %e, "Skipping slot");
                    report.skipped.push(SkippedSlot {
                        slot,
                        instrument: slot_config.instrument,
                        reason: e.to_string(),
                    });
                }
            }
        }

        let deployed: BTreeSet<u8> = report.deployed.iter().copied().collect();
        let (apply, withheld): (Vec<Connection>, Vec<Connection>) = config
            .routing
            .iter()
            .cloned()
            .partition(|connection| connection.slots().iter().all(|s| deployed.contains(s)));

        for connection in &withheld {
            tracing::warn!(%connection, "Withholding connection to skipped slot");
        }

        match handle.set_connections(&apply).await {
            Ok(()) => report.routing_applied = apply,
            Err(e) if e.kind() == ErrorKind::Conflict => return Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "Routing not applied");
                report.routing_error = Some(e.to_string());
            }
        }
        report.routing_skipped = withheld;

        tracing::info!(
            deployed = report.deployed.len(),
            skipped = report.skipped.len(),
            "Configuration pushed"
        );
        self.last_pushed = Some(deployed_view(config, &report));
        Ok(report)
    }

    /// Lists slots, preferring a live query and falling back to the cache.
    ///
    /// # Errors
    ///
    /// Returns a precondition error if nothing is attached, or a conflict if
    /// the device is no longer owned. Transient query failures fall back to
    /// the cached configuration.
    pub async fn list_slots(&self, sessions: &mut SessionManager) -> MokuResult<SlotListing> {
        let handle = sessions.handle()?;
        let configured = |slot: u8| {
            self.last_pushed
                .as_ref()
                .and_then(|config| config.slots.get(&slot))
                .map(|s| s.instrument)
        };

        match handle.list_instruments().await {
            Ok(live) => Ok(SlotListing {
                source: Source::Device,
                slots: live
                    .into_iter()
                    .map(|(slot, instrument)| SlotStatus {
                        slot,
                        instrument,
                        configured: configured(slot),
                    })
                    .collect(),
                warning: None,
            }),
            Err(e) if e.kind() == ErrorKind::Transient => {
                tracing::warn!(error = %e, "Live slot query failed, using last pushed configuration");
                let slots = self
                    .last_pushed
                    .iter()
                    .flat_map(|config| config.slots.iter())
                    .map(|(&slot, s)| SlotStatus {
                        slot,
                        instrument: Some(s.instrument.api_name().to_string()),
                        configured: Some(s.instrument),
                    })
                    .collect();
                Ok(SlotListing {
                    source: Source::LastPushed,
                    slots,
                    warning: Some(e.to_string()),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Reports the cached configuration alongside the live slot state.
    ///
    /// # Errors
    ///
    /// Same as [`list_slots`](Self::list_slots).
    pub async fn snapshot(&self, sessions: &mut SessionManager) -> MokuResult<ConfigSnapshot> {
        let live = self.list_slots(sessions).await?;

        let drift = match (&self.last_pushed, live.source) {
            (Some(config), Source::Device) => {
                let reported: BTreeMap<u8, Option<&str>> = live
                    .slots
                    .iter()
                    .map(|s| (s.slot, s.instrument.as_deref()))
                    .collect();
                config
                    .slots
                    .iter()
                    .filter(|&(slot, s)| {
                        let running = reported
                            .get(slot)
                            .copied()
                            .flatten()
                            .and_then(InstrumentKind::from_api_name);
                        running != Some(s.instrument)
                    })
                    .map(|(&slot, _)| slot)
                    .collect()
            }
            _ => Vec::new(),
        };

        Ok(ConfigSnapshot {
            config: self.last_pushed.clone(),
            live,
            drift,
        })
    }

    /// Validates and applies a new routing table.
    ///
    /// Connections are checked against the last pushed configuration when
    /// there is one, otherwise against the slots the device reports as loaded.
    ///
    /// # Errors
    ///
    /// - precondition error if nothing is attached
    /// - validation error if a connection is malformed or references an
    ///   undefined slot (nothing is sent)
    /// - the device error if the routing call fails
    pub async fn set_routing(
        &mut self,
        sessions: &mut SessionManager,
        connections: Vec<Connection>,
    ) -> MokuResult<RoutingReport> {
        let handle = sessions.handle()?;

        let validated_against = if let Some(config) = &self.last_pushed {
            let defined: BTreeSet<u8> = config.slots.keys().copied().collect();
            validate_routing(&connections, &config.platform, &defined)?;
            Source::LastPushed
        } else {
            let platform = live_platform(handle).await;
            let defined: BTreeSet<u8> = handle
                .list_instruments()
                .await?
                .into_iter()
                .filter_map(|(slot, instrument)| instrument.map(|_| slot))
                .collect();
            validate_routing(&connections, &platform, &defined)?;
            Source::Device
        };

        handle.set_connections(&connections).await?;
        tracing::info!(count = connections.len(), "Routing applied");

        if let Some(config) = &mut self.last_pushed {
            config.routing.clone_from(&connections);
        }

        Ok(RoutingReport {
            applied: connections,
            validated_against,
        })
    }
}

/// Narrows a pushed configuration to what actually reached the device.
fn deployed_view(mut config: MokuConfig, report: &DeploymentReport) -> MokuConfig {
    for skipped in &report.skipped {
        config.slots.remove(&skipped.slot);
    }
    config.routing.clone_from(&report.routing_applied);
    config
}

/// Platform of the attached device, or the most permissive one if unknown.
async fn live_platform(handle: &mut dyn DeviceHandle) -> PlatformDescriptor {
    let model = match handle.device_info().await {
        Ok(info) => info.model.as_deref().and_then(MokuModel::from_name),
        Err(e) => {
            tracing::debug!(error = %e, "Device model unavailable for routing checks");
            None
        }
    };
    PlatformDescriptor::new(model.unwrap_or(MokuModel::Delta))
}

async fn deploy_slot(handle: &mut dyn DeviceHandle, slot: u8, config: &SlotConfig) -> MokuResult<()> {
    config.preflight().map_err(MokuError::validation)?;

    if let Some(path) = &config.bitstream {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            MokuError::validation(format!("cannot read bitstream {}: {e}", path.display()))
        })?;
        handle.upload_bitstream(slot, bytes).await?;
    }

    handle.set_instrument(slot, config.instrument).await?;

    for (&index, &value) in config.control_registers.iter().flatten() {
        handle.set_control(slot, index, value).await?;
    }

    for (name, value) in config.settings.iter().flatten() {
        handle
            .apply_setting(slot, config.instrument, name, value)
            .await?;
    }

    Ok(())
}
