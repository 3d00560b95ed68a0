//! Device discovery over zeroconf (mDNS / DNS-SD).
//!
//! Discovery runs in two phases:
//!
//! 1. **Browse**: listen for `_moku._tcp.local.` announcements for a fixed
//!    window. The window is never extended or retried.
//! 2. **Enrich**: for each candidate, briefly claim ownership (never forced),
//!    read device metadata and release. A device that is busy or unreachable
//!    is logged and reported with whatever the announcement carried. The
//!    device this process is attached to is never claimed a second time.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use serde::Serialize;

use crate::moku::cache::DeviceRecord;
use crate::moku::device::{with_device, DeviceConnector};
use crate::moku::error::{MokuError, MokuResult};

/// DNS-SD service type advertised by Moku devices.
pub const MOKU_SERVICE_TYPE: &str = "_moku._tcp.local.";

/// A service instance seen during the browse phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredService {
    /// Announced address.
    pub address: IpAddr,
    /// Announced port.
    pub port: u16,
    /// Announced host name.
    pub hostname: Option<String>,
    /// TXT record properties.
    pub properties: BTreeMap<String, String>,
}

impl DiscoveredService {
    /// Socket address of the announced service.
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    fn property(&self, keys: &[&str]) -> Option<String> {
        keys.iter()
            .find_map(|key| self.properties.get(*key))
            .filter(|value| !value.is_empty())
            .cloned()
    }

    /// Builds a cache record from the announcement alone.
    #[must_use]
    pub fn to_record(&self) -> DeviceRecord {
        let mut record = DeviceRecord::new(self.address, self.port);
        record.name = self.property(&["name", "device_name"]).or_else(|| {
            self.hostname
                .as_deref()
                .map(|host| host.trim_end_matches('.').trim_end_matches(".local").to_string())
                .filter(|host| !host.is_empty())
        });
        record.serial = self.property(&["serial", "serial_number"]);
        record.model = self.property(&["hardware", "model"]);
        record
    }
}

/// Source of service announcements.
#[async_trait]
pub trait ServiceBrowser: Send + Sync {
    /// Collects announcements of `service_type` for exactly `timeout`.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the browser cannot start.
    async fn browse(&self, service_type: &str, timeout: Duration) -> MokuResult<Vec<DiscoveredService>>;
}

/// [`ServiceBrowser`] backed by a multicast DNS daemon.
#[derive(Debug, Clone, Copy, Default)]
pub struct MdnsBrowser;

impl MdnsBrowser {
    fn service_from_info(info: &ServiceInfo) -> Option<DiscoveredService> {
        let address = info.get_addresses().iter().copied().map(IpAddr::from).min()?;
        let properties = info
            .get_properties()
            .iter()
            .map(|prop| (prop.key().to_string(), prop.val_str().to_string()))
            .collect();

        Some(DiscoveredService {
            address,
            port: info.get_port(),
            hostname: Some(info.get_hostname().to_string()),
            properties,
        })
    }
}

#[async_trait]
impl ServiceBrowser for MdnsBrowser {
    async fn browse(&self, service_type: &str, timeout: Duration) -> MokuResult<Vec<DiscoveredService>> {
        let daemon =
            ServiceDaemon::new().map_err(|e| MokuError::transient("start mDNS daemon", e))?;
        let receiver = daemon
            .browse(service_type)
            .map_err(|e| MokuError::transient("browse for devices", e))?;

        let deadline = Instant::now() + timeout;
        let collected = tokio::task::spawn_blocking(move || {
            let mut found: Vec<DiscoveredService> = Vec::new();
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match receiver.recv_timeout(remaining) {
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        if let Some(service) = Self::service_from_info(&info) {
                            if !found.iter().any(|s| s.socket_addr() == service.socket_addr()) {
                                tracing::debug!(address = %service.address, "Resolved device announcement");
                                found.push(service);
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
            found
        })
        .await
        .map_err(|e| MokuError::transient("browse for devices", e));

        if let Err(e) = daemon.shutdown() {
            tracing::debug!(error = %e, "mDNS daemon shutdown reported an error");
        }

        collected
    }
}

/// Finds devices on the local network.
pub struct DiscoveryClient {
    browser: Box<dyn ServiceBrowser>,
    connector: Arc<dyn DeviceConnector>,
    service_type: String,
    enrich: bool,
}

impl DiscoveryClient {
    /// Creates a discovery client.
    #[must_use]
    pub fn new(
        browser: Box<dyn ServiceBrowser>,
        connector: Arc<dyn DeviceConnector>,
        service_type: impl Into<String>,
        enrich: bool,
    ) -> Self {
        Self {
            browser,
            connector,
            service_type: service_type.into(),
            enrich,
        }
    }

    /// Browses for `timeout` and returns one record per device found.
    ///
    /// A zero timeout returns immediately with no devices. `attached` is the
    /// address of the current session, if any; it is reported without
    /// enrichment so its ownership is left alone.
    ///
    /// # Errors
    ///
    /// Returns a transient error only if browsing itself cannot start;
    /// per-device enrichment failures are logged and skipped.
    pub async fn discover(
        &self,
        timeout: Duration,
        attached: Option<SocketAddr>,
    ) -> MokuResult<Vec<DeviceRecord>> {
        if timeout.is_zero() {
            tracing::debug!("Zero discovery timeout, skipping browse");
            return Ok(Vec::new());
        }

        let services = self.browser.browse(&self.service_type, timeout).await?;
        tracing::info!(count = services.len(), "Browse finished");

        let mut records = Vec::with_capacity(services.len());
        for service in services {
            let mut record = service.to_record();
            if attached == Some(service.socket_addr()) {
                tracing::debug!(address = %service.socket_addr(), "Attached device, not enriching");
            } else if self.enrich {
                self.enrich(&service, &mut record).await;
            }
            records.push(record);
        }

        Ok(records)
    }

    async fn enrich(&self, service: &DiscoveredService, record: &mut DeviceRecord) {
        let address = service.socket_addr();
        let result = with_device(self.connector.as_ref(), address, false, |handle| {
            Box::pin(async move { handle.device_info().await })
        })
        .await;

        match result {
            Ok(info) => record.merge_info(&info),
            Err(e) => {
                tracing::warn!(%address, error = %e, "Skipping metadata enrichment");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moku::mock::{MockConnector, MockDevice, StaticBrowser};

    fn service(ip: [u8; 4], hostname: &str) -> DiscoveredService {
        DiscoveredService {
            address: IpAddr::from(ip),
            port: 80,
            hostname: Some(hostname.to_string()),
            properties: BTreeMap::new(),
        }
    }

    #[test]
    fn record_from_announcement() {
        let mut svc = service([10, 0, 0, 7], "moku-bench.local.");
        svc.properties
            .insert("serial".to_string(), "MP-4242".to_string());

        let record = svc.to_record();
        assert_eq!(record.name.as_deref(), Some("moku-bench"));
        assert_eq!(record.serial.as_deref(), Some("MP-4242"));
        assert_eq!(record.port, 80);
    }

    #[tokio::test]
    async fn zero_timeout_returns_empty() {
        let connector = Arc::new(MockConnector::new());
        let browser = StaticBrowser::new(vec![service([10, 0, 0, 7], "a.local.")]);
        let client = DiscoveryClient::new(Box::new(browser), connector, MOKU_SERVICE_TYPE, true);

        let records = client.discover(Duration::ZERO, None).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn enrichment_failure_is_skipped() {
        let reachable: SocketAddr = "10.0.0.7:80".parse().unwrap();
        let connector = MockConnector::new();
        connector.add_device(MockDevice::new(reachable, "bench", "MG-7"));

        // The second device is announced but not reachable.
        let browser = StaticBrowser::new(vec![
            service([10, 0, 0, 7], "ignored.local."),
            service([10, 0, 0, 8], "ghost.local."),
        ]);
        let client = DiscoveryClient::new(
            Box::new(browser),
            Arc::new(connector.clone()),
            MOKU_SERVICE_TYPE,
            true,
        );

        let records = client
            .discover(Duration::from_millis(10), None)
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].serial.as_deref(), Some("MG-7"));
        assert_eq!(records[0].name.as_deref(), Some("bench"));
        assert_eq!(records[1].name.as_deref(), Some("ghost"));
        assert!(records[1].serial.is_none());

        // Enrichment must hand ownership back.
        assert!(!connector.device(reachable).unwrap().is_owned());
    }

    #[tokio::test]
    async fn owned_device_is_not_taken_over() {
        let address: SocketAddr = "10.0.0.9:80".parse().unwrap();
        let connector = MockConnector::new();
        connector.add_device(MockDevice::new(address, "busy", "MG-9"));
        connector.claim_elsewhere(address);

        let browser = StaticBrowser::new(vec![service([10, 0, 0, 9], "busy.local.")]);
        let client = DiscoveryClient::new(
            Box::new(browser),
            Arc::new(connector.clone()),
            MOKU_SERVICE_TYPE,
            true,
        );

        let records = client.discover(Duration::from_millis(10), None).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].serial.is_none());
        assert!(connector.device(address).unwrap().is_owned_externally());
    }

    #[tokio::test]
    async fn attached_device_is_not_claimed_again() {
        let address: SocketAddr = "10.0.0.9:80".parse().unwrap();
        let connector = MockConnector::new();
        connector.add_device(MockDevice::new(address, "bench", "MG-9"));

        let browser = StaticBrowser::new(vec![service([10, 0, 0, 9], "bench.local.")]);
        let client = DiscoveryClient::new(
            Box::new(browser),
            Arc::new(connector.clone()),
            MOKU_SERVICE_TYPE,
            true,
        );

        let records = client
            .discover(Duration::from_millis(10), Some(address))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name.as_deref(), Some("bench"));
        assert!(records[0].serial.is_none());
        assert!(connector.events().is_empty());
    }
}
