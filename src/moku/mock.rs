//! Simulated devices for running without hardware.
//!
//! [`MockConnector`] keeps a set of [`MockDevice`]s in memory and enforces the
//! same ownership rules as real hardware: one owner at a time, takeover only
//! with `force`, and handles that stop working once ownership moves on. Every
//! mutating call is recorded as a [`MockEvent`] so tests can assert on what
//! reached the "hardware" and in which order.
//!
//! Used by the integration tests and by `moku-mcp --simulate`.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::moku::device::{DeviceConnector, DeviceHandle, DeviceInfo};
use crate::moku::discovery::{DiscoveredService, ServiceBrowser};
use crate::moku::error::{MokuError, MokuResult};
use crate::moku::model::{Connection, InstrumentKind, MokuModel};

/// Owner token used for clients outside this process.
const EXTERNAL_OWNER: u64 = 0;

/// A recorded call against a simulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    /// Ownership claimed.
    Connected {
        /// Device address.
        address: SocketAddr,
        /// Whether takeover was forced.
        force: bool,
    },
    /// Bitstream uploaded to a slot.
    BitstreamUploaded {
        /// Device address.
        address: SocketAddr,
        /// Slot number.
        slot: u8,
        /// Archive size in bytes.
        bytes: usize,
    },
    /// Instrument loaded into a slot.
    InstrumentSet {
        /// Device address.
        address: SocketAddr,
        /// Slot number.
        slot: u8,
        /// Instrument loaded.
        instrument: InstrumentKind,
    },
    /// Control register written.
    ControlSet {
        /// Device address.
        address: SocketAddr,
        /// Slot number.
        slot: u8,
        /// Register index.
        index: u8,
        /// Value written.
        value: u32,
    },
    /// Instrument setting forwarded.
    SettingApplied {
        /// Device address.
        address: SocketAddr,
        /// Slot number.
        slot: u8,
        /// Setting name.
        name: String,
    },
    /// Routing replaced.
    ConnectionsSet {
        /// Device address.
        address: SocketAddr,
        /// Number of connections applied.
        count: usize,
    },
    /// Ownership relinquished (or attempted).
    Released {
        /// Device address.
        address: SocketAddr,
        /// Whether the device accepted the release.
        ok: bool,
    },
}

/// State of one simulated device.
#[derive(Debug, Clone)]
pub struct MockDevice {
    /// Network address.
    pub address: SocketAddr,
    /// Metadata reported by `device_info`.
    pub info: DeviceInfo,
    /// Number of multi-instrument slots.
    pub slot_count: u8,
    /// Instrument loaded per slot.
    pub slots: BTreeMap<u8, InstrumentKind>,
    /// Current routing.
    pub connections: Vec<Connection>,
    /// Control register values keyed by `(slot, index)`.
    pub registers: BTreeMap<(u8, u8), u32>,
    /// Settings applied per slot.
    pub settings: BTreeMap<u8, BTreeMap<String, Value>>,
    /// Slots whose instrument load fails.
    pub failing_slots: BTreeSet<u8>,
    /// Whether ownership release fails.
    pub fail_release: bool,
    /// Whether slot listing fails.
    pub fail_listing: bool,
    owner: Option<u64>,
}

impl MockDevice {
    /// Creates an idle Moku:Go with the given identity.
    #[must_use]
    pub fn new(address: SocketAddr, name: &str, serial: &str) -> Self {
        Self {
            address,
            info: DeviceInfo {
                name: Some(name.to_string()),
                serial: Some(serial.to_string()),
                model: Some(MokuModel::Go.to_string()),
                firmware: Some("sim-1.0".to_string()),
            },
            slot_count: MokuModel::Go.default_slots(),
            slots: BTreeMap::new(),
            connections: Vec::new(),
            registers: BTreeMap::new(),
            settings: BTreeMap::new(),
            failing_slots: BTreeSet::new(),
            fail_release: false,
            fail_listing: false,
            owner: None,
        }
    }

    /// Changes the hardware family.
    #[must_use]
    pub fn with_model(mut self, model: MokuModel) -> Self {
        self.info.model = Some(model.to_string());
        self.slot_count = model.default_slots();
        self
    }

    /// Makes instrument loads into `slot` fail.
    #[must_use]
    pub fn with_failing_slot(mut self, slot: u8) -> Self {
        self.failing_slots.insert(slot);
        self
    }

    /// Whether any client currently owns the device.
    #[must_use]
    pub const fn is_owned(&self) -> bool {
        self.owner.is_some()
    }

    /// Whether a client outside this process owns the device.
    #[must_use]
    pub fn is_owned_externally(&self) -> bool {
        self.owner == Some(EXTERNAL_OWNER)
    }
}

#[derive(Debug, Default)]
struct MockState {
    devices: BTreeMap<SocketAddr, MockDevice>,
    events: Vec<MockEvent>,
    next_token: u64,
}

/// In-memory [`DeviceConnector`].
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    /// Creates a connector with no devices.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        lock_state(&self.state)
    }

    /// Adds (or replaces) a device.
    pub fn add_device(&self, device: MockDevice) {
        self.lock().devices.insert(device.address, device);
    }

    /// Returns a snapshot of the device at `address`.
    #[must_use]
    pub fn device(&self, address: SocketAddr) -> Option<MockDevice> {
        self.lock().devices.get(&address).cloned()
    }

    /// Mutates the device at `address` in place.
    pub fn update(&self, address: SocketAddr, f: impl FnOnce(&mut MockDevice)) {
        if let Some(device) = self.lock().devices.get_mut(&address) {
            f(device);
        }
    }

    /// Marks the device as owned by a client outside this process.
    pub fn claim_elsewhere(&self, address: SocketAddr) {
        self.update(address, |device| device.owner = Some(EXTERNAL_OWNER));
    }

    /// Returns every recorded event, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<MockEvent> {
        self.lock().events.clone()
    }

    /// Forgets recorded events.
    pub fn clear_events(&self) {
        self.lock().events.clear();
    }
}

fn lock_state(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl DeviceConnector for MockConnector {
    async fn connect(&self, address: SocketAddr, force: bool) -> MokuResult<Box<dyn DeviceHandle>> {
        let mut state = self.lock();
        state.next_token += 1;
        let token = state.next_token;

        let device = state
            .devices
            .get_mut(&address)
            .ok_or_else(|| MokuError::transient("claim ownership", format!("{address} is unreachable")))?;

        if device.owner.is_some() && !force {
            return Err(MokuError::conflict(address.to_string()));
        }
        device.owner = Some(token);
        state.events.push(MockEvent::Connected { address, force });

        Ok(Box::new(MockHandle {
            state: Arc::clone(&self.state),
            address,
            token,
        }))
    }
}

struct MockHandle {
    state: Arc<Mutex<MockState>>,
    address: SocketAddr,
    token: u64,
}

impl MockHandle {
    /// Runs `f` against the device if this handle still owns it.
    fn with_owned<T>(
        &self,
        f: impl FnOnce(&mut MockDevice, &mut Vec<MockEvent>) -> MokuResult<T>,
    ) -> MokuResult<T> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        let device = state.devices.get_mut(&self.address).ok_or_else(|| {
            MokuError::transient("device call", format!("{} disappeared", self.address))
        })?;
        if device.owner != Some(self.token) {
            return Err(MokuError::conflict(self.address.to_string()));
        }
        f(device, &mut state.events)
    }
}

#[async_trait]
impl DeviceHandle for MockHandle {
    fn address(&self) -> SocketAddr {
        self.address
    }

    async fn device_info(&mut self) -> MokuResult<DeviceInfo> {
        self.with_owned(|device, _| Ok(device.info.clone()))
    }

    async fn upload_bitstream(&mut self, slot: u8, bitstream: Vec<u8>) -> MokuResult<()> {
        let address = self.address;
        self.with_owned(|_, events| {
            events.push(MockEvent::BitstreamUploaded {
                address,
                slot,
                bytes: bitstream.len(),
            });
            Ok(())
        })
    }

    async fn set_instrument(&mut self, slot: u8, instrument: InstrumentKind) -> MokuResult<()> {
        let address = self.address;
        self.with_owned(|device, events| {
            if slot == 0 || slot > device.slot_count {
                return Err(MokuError::transient(
                    "set instrument",
                    format!("slot {slot} does not exist"),
                ));
            }
            if device.failing_slots.contains(&slot) {
                return Err(MokuError::transient(
                    "set instrument",
                    format!("slot {slot} rejected {}", instrument.api_name()),
                ));
            }
            device.slots.insert(slot, instrument);
            events.push(MockEvent::InstrumentSet {
                address,
                slot,
                instrument,
            });
            Ok(())
        })
    }

    async fn set_control(&mut self, slot: u8, index: u8, value: u32) -> MokuResult<()> {
        let address = self.address;
        self.with_owned(|device, events| {
            device.registers.insert((slot, index), value);
            events.push(MockEvent::ControlSet {
                address,
                slot,
                index,
                value,
            });
            Ok(())
        })
    }

    async fn apply_setting(
        &mut self,
        slot: u8,
        _instrument: InstrumentKind,
        name: &str,
        value: &Value,
    ) -> MokuResult<()> {
        let address = self.address;
        self.with_owned(|device, events| {
            device
                .settings
                .entry(slot)
                .or_default()
                .insert(name.to_string(), value.clone());
            events.push(MockEvent::SettingApplied {
                address,
                slot,
                name: name.to_string(),
            });
            Ok(())
        })
    }

    async fn set_connections(&mut self, connections: &[Connection]) -> MokuResult<()> {
        let address = self.address;
        self.with_owned(|device, events| {
            device.connections = connections.to_vec();
            events.push(MockEvent::ConnectionsSet {
                address,
                count: connections.len(),
            });
            Ok(())
        })
    }

    async fn list_instruments(&mut self) -> MokuResult<BTreeMap<u8, Option<String>>> {
        self.with_owned(|device, _| {
            if device.fail_listing {
                return Err(MokuError::transient("list instruments", "device busy"));
            }
            Ok((1..=device.slot_count)
                .map(|slot| {
                    let loaded = device.slots.get(&slot).map(|kind| kind.api_name().to_string());
                    (slot, loaded)
                })
                .collect())
        })
    }

    async fn release(&mut self) -> MokuResult<()> {
        let mut guard = lock_state(&self.state);
        let state = &mut *guard;
        let Some(device) = state.devices.get_mut(&self.address) else {
            return Ok(());
        };

        if device.fail_release {
            state.events.push(MockEvent::Released {
                address: self.address,
                ok: false,
            });
            return Err(MokuError::transient(
                "relinquish ownership",
                "device did not acknowledge",
            ));
        }

        if device.owner == Some(self.token) {
            device.owner = None;
        }
        state.events.push(MockEvent::Released {
            address: self.address,
            ok: true,
        });
        Ok(())
    }
}

/// A [`ServiceBrowser`] that always "finds" the same services.
#[derive(Debug, Clone, Default)]
pub struct StaticBrowser {
    services: Vec<DiscoveredService>,
}

impl StaticBrowser {
    /// Creates a browser reporting `services`.
    #[must_use]
    pub const fn new(services: Vec<DiscoveredService>) -> Self {
        Self { services }
    }

    /// Creates a browser reporting one service per simulated device.
    #[must_use]
    pub fn for_devices(devices: &[MockDevice]) -> Self {
        Self::new(
            devices
                .iter()
                .map(|device| DiscoveredService {
                    address: device.address.ip(),
                    port: device.address.port(),
                    hostname: device.info.name.as_ref().map(|name| format!("{name}.local.")),
                    properties: BTreeMap::new(),
                })
                .collect(),
        )
    }
}

#[async_trait]
impl ServiceBrowser for StaticBrowser {
    async fn browse(&self, _service_type: &str, timeout: Duration) -> MokuResult<Vec<DiscoveredService>> {
        if timeout.is_zero() {
            return Ok(Vec::new());
        }
        Ok(self.services.clone())
    }
}

/// Address of the device created by [`simulated_lab`].
#[must_use]
pub fn simulated_address() -> SocketAddr {
    SocketAddr::new(IpAddr::from([127, 0, 0, 1]), 8090)
}

/// Builds a connector and browser for a single simulated Moku:Go.
#[must_use]
pub fn simulated_lab() -> (MockConnector, StaticBrowser) {
    let device = MockDevice::new(simulated_address(), "moku-sim", "SIM-000001");
    let browser = StaticBrowser::for_devices(std::slice::from_ref(&device));
    let connector = MockConnector::new();
    connector.add_device(device);
    (connector, browser)
}
