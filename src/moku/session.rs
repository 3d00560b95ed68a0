//! Exclusive device session management.
//!
//! A [`SessionManager`] holds at most one attached device. A second attach
//! fails fast with a conflict instead of queueing, unless the caller asks for
//! a forced takeover. Release is idempotent and always leaves the manager
//! detached, even when the device does not acknowledge the release.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use serde::Serialize;

use crate::moku::cache::{timestamp_now, DeviceCache};
use crate::moku::device::{DeviceConnector, DeviceHandle, HandleGuard};
use crate::moku::error::{MokuError, MokuResult};

/// Public description of an attached session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// Identifier the caller attached with.
    pub identifier: String,
    /// Resolved device address.
    pub address: SocketAddr,
    /// Whether ownership was taken by force.
    pub forced: bool,
    /// When the session started (RFC 3339, UTC).
    pub attached_at: String,
}

/// Result of [`SessionManager::release`].
#[derive(Debug)]
pub enum ReleaseOutcome {
    /// Nothing was attached.
    NotAttached,
    /// The device acknowledged the release.
    Released(SessionInfo),
    /// Local state was cleared but the device-side release failed.
    ReleasedWithError(SessionInfo, MokuError),
}

struct Session {
    info: SessionInfo,
    guard: HandleGuard,
}

/// Resolves a device identifier to a socket address.
///
/// Address-shaped identifiers (`192.168.1.100`, `192.168.1.100:8080`,
/// IPv6 literals) are used as-is and never touch the cache; anything else is
/// looked up by name, serial or cache key.
///
/// # Errors
///
/// Returns [`MokuError::NotFound`] if the identifier is neither an address nor
/// known to the cache.
pub fn resolve_identifier(
    identifier: &str,
    cache: &DeviceCache,
    default_port: u16,
) -> MokuResult<SocketAddr> {
    let trimmed = identifier.trim();

    if let Ok(address) = trimmed.parse::<SocketAddr>() {
        return Ok(address);
    }
    if let Ok(ip) = trimmed.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    match cache.find_by_identifier(trimmed) {
        Some(record) => {
            tracing::info!(identifier = trimmed, address = %record.socket_addr(), "Resolved identifier from cache");
            Ok(record.socket_addr())
        }
        None => {
            tracing::warn!(identifier = trimmed, "Could not resolve device identifier");
            Err(MokuError::not_found(trimmed))
        }
    }
}

/// Owns the single active device connection of a process.
pub struct SessionManager {
    connector: Arc<dyn DeviceConnector>,
    default_port: u16,
    active: Option<Session>,
}

impl SessionManager {
    /// Creates a detached manager.
    #[must_use]
    pub fn new(connector: Arc<dyn DeviceConnector>, default_port: u16) -> Self {
        Self {
            connector,
            default_port,
            active: None,
        }
    }

    /// Connector used to open sessions.
    #[must_use]
    pub fn connector(&self) -> &Arc<dyn DeviceConnector> {
        &self.connector
    }

    /// Whether a device is attached.
    #[must_use]
    pub const fn is_attached(&self) -> bool {
        self.active.is_some()
    }

    /// Describes the attached session, if any.
    #[must_use]
    pub fn info(&self) -> Option<&SessionInfo> {
        self.active.as_ref().map(|session| &session.info)
    }

    /// Borrows the attached device.
    ///
    /// # Errors
    ///
    /// Returns a precondition error when nothing is attached.
    pub fn handle(&mut self) -> MokuResult<&mut dyn DeviceHandle> {
        self.active
            .as_mut()
            .and_then(|session| session.guard.handle())
            .ok_or_else(MokuError::not_attached)
    }

    /// Attaches to the device named by `identifier`.
    ///
    /// If a session is already active, this fails with a conflict unless
    /// `force` is set, in which case the current session is released first
    /// (best-effort) and ownership is claimed by force.
    ///
    /// # Errors
    ///
    /// - [`MokuError::NotFound`] if the identifier cannot be resolved
    /// - [`MokuError::Conflict`] if a session is active or the device is owned
    ///   elsewhere, and `force` is false
    /// - a transient error if the device cannot be reached
    pub async fn attach(
        &mut self,
        identifier: &str,
        force: bool,
        cache: &DeviceCache,
    ) -> MokuResult<SessionInfo> {
        let address = resolve_identifier(identifier, cache, self.default_port)?;

        if let Some(current) = self.info().map(|info| info.address) {
            if !force {
                tracing::warn!(
                    %current,
                    requested = %address,
                    "Attach refused, a session is already active"
                );
                return Err(MokuError::conflict(current.to_string()));
            }
            tracing::info!(%current, "Forced attach, releasing current session");
            if let ReleaseOutcome::ReleasedWithError(info, e) = self.release().await {
                tracing::warn!(address = %info.address, error = %e, "Previous session release failed");
            }
        }

        let handle = self.connector.connect(address, force).await?;
        let info = SessionInfo {
            identifier: identifier.trim().to_string(),
            address,
            forced: force,
            attached_at: timestamp_now(),
        };

        tracing::info!(%address, forced = force, "Session started");
        self.active = Some(Session {
            info: info.clone(),
            guard: HandleGuard::new(handle),
        });

        Ok(info)
    }

    /// Releases the attached device.
    ///
    /// Idempotent. The manager is detached afterwards regardless of whether
    /// the device acknowledged the release.
    pub async fn release(&mut self) -> ReleaseOutcome {
        let Some(mut session) = self.active.take() else {
            return ReleaseOutcome::NotAttached;
        };

        match session.guard.release().await {
            Ok(()) => {
                tracing::info!(address = %session.info.address, "Session ended, device released");
                ReleaseOutcome::Released(session.info)
            }
            Err(e) => {
                tracing::error!(address = %session.info.address, error = %e, "Error releasing device");
                ReleaseOutcome::ReleasedWithError(session.info, e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moku::cache::DeviceRecord;
    use crate::moku::mock::{MockConnector, MockDevice};
    use crate::moku::ErrorKind;

    fn lab() -> (MockConnector, SessionManager) {
        let connector = MockConnector::new();
        connector.add_device(MockDevice::new(
            "192.168.1.100:80".parse().unwrap(),
            "bench",
            "MG-100",
        ));
        connector.add_device(MockDevice::new(
            "192.168.1.101:80".parse().unwrap(),
            "rack",
            "MG-101",
        ));
        let manager = SessionManager::new(Arc::new(connector.clone()), 80);
        (connector, manager)
    }

    #[test]
    fn resolve_literal_addresses() {
        let cache = DeviceCache::in_memory();
        assert_eq!(
            resolve_identifier("192.168.1.100", &cache, 80).unwrap(),
            "192.168.1.100:80".parse().unwrap()
        );
        assert_eq!(
            resolve_identifier("192.168.1.100:8080", &cache, 80).unwrap(),
            "192.168.1.100:8080".parse().unwrap()
        );
        assert!(resolve_identifier("fe80::1", &cache, 80).is_ok());
    }

    #[test]
    fn resolve_unknown_name_fails() {
        let cache = DeviceCache::in_memory();
        let err = resolve_identifier("bench", &cache, 80).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(
            resolve_identifier("192.168.1", &cache, 80).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn resolve_from_cache() {
        let mut cache = DeviceCache::in_memory();
        let mut record = DeviceRecord::new("10.0.0.5".parse().unwrap(), 8080);
        record.name = Some("bench".to_string());
        cache.record_seen(record);

        assert_eq!(
            resolve_identifier("bench", &cache, 80).unwrap(),
            "10.0.0.5:8080".parse().unwrap()
        );
    }

    #[tokio::test]
    async fn attach_then_release() {
        let (connector, mut manager) = lab();
        let cache = DeviceCache::in_memory();

        let info = manager.attach("192.168.1.100", false, &cache).await.unwrap();
        assert_eq!(info.address, "192.168.1.100:80".parse().unwrap());
        assert!(manager.is_attached());
        assert!(connector.device(info.address).unwrap().is_owned());

        assert!(matches!(manager.release().await, ReleaseOutcome::Released(_)));
        assert!(!manager.is_attached());
        assert!(!connector.device(info.address).unwrap().is_owned());

        assert!(matches!(manager.release().await, ReleaseOutcome::NotAttached));
    }

    #[tokio::test]
    async fn failed_release_still_clears_state() {
        let (connector, mut manager) = lab();
        let cache = DeviceCache::in_memory();
        let address: SocketAddr = "192.168.1.100:80".parse().unwrap();
        connector.update(address, |d| d.fail_release = true);

        manager.attach("192.168.1.100", false, &cache).await.unwrap();
        let outcome = manager.release().await;

        assert!(matches!(outcome, ReleaseOutcome::ReleasedWithError(_, _)));
        assert!(!manager.is_attached());
        assert!(manager.handle().is_err());
    }

    #[tokio::test]
    async fn second_attach_conflicts_without_force() {
        let (_connector, mut manager) = lab();
        let cache = DeviceCache::in_memory();

        manager.attach("192.168.1.100", false, &cache).await.unwrap();
        let err = manager
            .attach("192.168.1.101", false, &cache)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(
            manager.info().unwrap().address,
            "192.168.1.100:80".parse().unwrap(),
            "existing session must be untouched"
        );
    }

    #[tokio::test]
    async fn forced_attach_transfers_ownership() {
        let (connector, mut manager) = lab();
        let cache = DeviceCache::in_memory();
        let first: SocketAddr = "192.168.1.100:80".parse().unwrap();
        let second: SocketAddr = "192.168.1.101:80".parse().unwrap();

        manager.attach("192.168.1.100", false, &cache).await.unwrap();
        let info = manager.attach("192.168.1.101", true, &cache).await.unwrap();

        assert_eq!(info.address, second);
        assert!(info.forced);
        assert!(!connector.device(first).unwrap().is_owned());
        assert!(connector.device(second).unwrap().is_owned());
    }

    #[tokio::test]
    async fn device_owned_elsewhere_conflicts() {
        let (connector, mut manager) = lab();
        let cache = DeviceCache::in_memory();
        let address: SocketAddr = "192.168.1.100:80".parse().unwrap();
        connector.claim_elsewhere(address);

        let err = manager.attach("192.168.1.100", false, &cache).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(!manager.is_attached());

        manager.attach("192.168.1.100", true, &cache).await.unwrap();
        assert!(!connector.device(address).unwrap().is_owned_externally());
    }

    #[tokio::test]
    async fn handle_requires_session() {
        let (_connector, mut manager) = lab();
        let Err(err) = manager.handle() else {
            panic!("handle should require a session");
        };
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }
}
