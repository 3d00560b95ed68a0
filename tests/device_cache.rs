//! Integration tests for device cache persistence across server runs.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::tempdir;

use moku_mcp::mcp::ToolContext;
use moku_mcp::moku::discovery::MOKU_SERVICE_TYPE;
use moku_mcp::moku::mock::{MockConnector, MockDevice, StaticBrowser};
use moku_mcp::moku::{DeviceCache, DiscoveryClient, SessionManager};

fn addr() -> SocketAddr {
    "192.168.1.120:80".parse().unwrap()
}

fn context(connector: &MockConnector, browser: StaticBrowser, cache_path: &Path) -> ToolContext {
    let shared = Arc::new(connector.clone());
    let discovery = DiscoveryClient::new(Box::new(browser), shared.clone(), MOKU_SERVICE_TYPE, true);
    ToolContext::new(
        SessionManager::new(shared, 80),
        DeviceCache::load(cache_path),
        discovery,
        Duration::from_millis(20),
    )
}

fn payload(result: &moku_mcp::mcp::ToolCallResult) -> Value {
    serde_json::from_str(result.text()).unwrap()
}

#[tokio::test]
async fn test_discovered_devices_survive_restart() {
    let dir = tempdir().unwrap();
    let cache_path = dir.path().join("cache").join("devices.json");

    let device = MockDevice::new(addr(), "optics", "MG-120");
    let connector = MockConnector::new();
    let browser = StaticBrowser::for_devices(std::slice::from_ref(&device));
    connector.add_device(device);

    let mut first = context(&connector, browser, &cache_path);
    let found = payload(&first.call("discover_mokus", &json!({ "timeout": 0.05 })).await);
    assert_eq!(found["count"], 1);
    assert!(cache_path.exists());

    // Second run: nothing is advertised, the name resolves from disk.
    let mut second = context(&connector, StaticBrowser::default(), &cache_path);
    assert_eq!(second.cache().len(), 1);

    let attached = payload(&second.call("attach_moku", &json!({ "device_id": "optics" })).await);
    assert_eq!(attached["status"], "success", "{attached}");
    assert_eq!(attached["session"]["address"], "192.168.1.120:80");

    second.shutdown().await;
    assert!(!connector.device(addr()).unwrap().is_owned());
}

#[tokio::test]
async fn test_corrupt_cache_starts_empty_and_is_rewritten() {
    let dir = tempdir().unwrap();
    let cache_path = dir.path().join("devices.json");
    std::fs::write(&cache_path, "{ not json").unwrap();

    let device = MockDevice::new(addr(), "optics", "MG-120");
    let connector = MockConnector::new();
    let browser = StaticBrowser::for_devices(std::slice::from_ref(&device));
    connector.add_device(device);

    let mut tools = context(&connector, browser, &cache_path);
    assert!(tools.cache().is_empty());

    tools.call("discover_mokus", &json!({ "timeout": 0.05 })).await;

    let reloaded = DeviceCache::load(&cache_path);
    let record = reloaded.find_by_identifier("MG-120").unwrap();
    assert_eq!(record.name.as_deref(), Some("optics"));
}
