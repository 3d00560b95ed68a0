//! On-disk cache of known devices.
//!
//! Maps a stable key (serial number when known, otherwise the address) to the
//! last thing we learned about each device, so callers can attach by name or
//! serial instead of IP address.
//!
//! # Location
//!
//! - **Linux/macOS:** `~/.moku-mcp/device_cache.json`
//! - **Windows:** `%USERPROFILE%\.moku-mcp\device_cache.json`
//!
//! Single writer, single process. A missing or unreadable file yields an
//! empty cache rather than an error.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::config::default_config_dir;
use crate::error::CacheError;
use crate::moku::device::DeviceInfo;

/// Default HTTP port of the device API.
pub const DEFAULT_DEVICE_PORT: u16 = 80;

/// Returns the default cache file path.
#[must_use]
pub fn default_cache_path() -> Option<PathBuf> {
    default_config_dir().map(|p| p.join("device_cache.json"))
}

/// Current time in the cache's timestamp format.
#[must_use]
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// What we know about one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Network address.
    pub address: IpAddr,
    /// Device API port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// User-assigned name.
    #[serde(default)]
    pub name: Option<String>,
    /// Factory serial number.
    #[serde(default)]
    pub serial: Option<String>,
    /// Hardware family.
    #[serde(default)]
    pub model: Option<String>,
    /// When the device was last seen (RFC 3339, UTC).
    pub last_seen: String,
}

const fn default_port() -> u16 {
    DEFAULT_DEVICE_PORT
}

impl DeviceRecord {
    /// Creates a record seen now.
    #[must_use]
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self {
            address,
            port,
            name: None,
            serial: None,
            model: None,
            last_seen: timestamp_now(),
        }
    }

    /// Socket address of the device API.
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Cache key for this record.
    #[must_use]
    pub fn key(&self) -> String {
        self.serial
            .clone()
            .unwrap_or_else(|| self.address.to_string())
    }

    /// Whether `identifier` names this device.
    ///
    /// Names and serials compare case-insensitively; addresses exactly.
    #[must_use]
    pub fn matches(&self, identifier: &str) -> bool {
        let eq = |field: &Option<String>| {
            field
                .as_deref()
                .is_some_and(|value| value.eq_ignore_ascii_case(identifier))
        };
        eq(&self.name)
            || eq(&self.serial)
            || self.address.to_string() == identifier
            || self.socket_addr().to_string() == identifier
    }

    /// Fills in metadata reported by the device.
    pub fn merge_info(&mut self, info: &DeviceInfo) {
        if info.name.is_some() {
            self.name.clone_from(&info.name);
        }
        if info.serial.is_some() {
            self.serial.clone_from(&info.serial);
        }
        if info.model.is_some() {
            self.model.clone_from(&info.model);
        }
    }
}

/// File-backed map of known devices.
#[derive(Debug, Clone, Default)]
pub struct DeviceCache {
    path: Option<PathBuf>,
    devices: BTreeMap<String, DeviceRecord>,
}

impl DeviceCache {
    /// Creates an empty cache that is never persisted.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Loads the cache stored at `path`.
    ///
    /// A missing file gives an empty cache. A file that cannot be read or
    /// parsed is logged and also gives an empty cache; it is overwritten on
    /// the next save.
    #[must_use]
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let devices = match Self::read(&path) {
            Ok(Some(devices)) => {
                tracing::info!(count = devices.len(), path = %path.display(), "Loaded device cache");
                devices
            }
            Ok(None) => {
                tracing::info!(path = %path.display(), "No device cache found, starting empty");
                BTreeMap::new()
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to load device cache, starting empty");
                BTreeMap::new()
            }
        };

        Self {
            path: Some(path),
            devices,
        }
    }

    fn read(path: &Path) -> Result<Option<BTreeMap<String, DeviceRecord>>, CacheError> {
        if !path.exists() {
            return Ok(None);
        }

        let contents = std::fs::read_to_string(path).map_err(|e| CacheError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| CacheError::ParseError {
                path: path.to_path_buf(),
                source: e,
            })
    }

    /// Writes the cache to disk, creating the parent directory if needed.
    ///
    /// Does nothing for an in-memory cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub fn save(&self) -> Result<(), CacheError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CacheError::WriteError {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let json = serde_json::to_string_pretty(&self.devices).map_err(CacheError::Serialise)?;
        std::fs::write(path, json).map_err(|e| CacheError::WriteError {
            path: path.clone(),
            source: e,
        })?;

        tracing::debug!(count = self.devices.len(), path = %path.display(), "Saved device cache");
        Ok(())
    }

    /// Saves the cache, logging instead of failing.
    pub fn save_or_warn(&self) {
        if let Err(e) = self.save() {
            tracing::warn!(error = %e, "Failed to save device cache");
        }
    }

    /// Path of the backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of known devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether the cache knows no devices.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// All known devices, ordered by key.
    pub fn records(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.values()
    }

    /// Finds a device by cache key, name, serial or address.
    #[must_use]
    pub fn find_by_identifier(&self, identifier: &str) -> Option<&DeviceRecord> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return None;
        }
        self.devices
            .get(identifier)
            .or_else(|| self.devices.values().find(|record| record.matches(identifier)))
    }

    /// Finds a device by network address.
    #[must_use]
    pub fn find_by_address(&self, address: IpAddr) -> Option<&DeviceRecord> {
        self.devices.values().find(|record| record.address == address)
    }

    /// Records a sighting of a device, merging with what is already known.
    ///
    /// An existing entry with the same serial, or failing that the same
    /// address, is updated in place; fields absent from `seen` keep their
    /// previous values. Returns the stored record.
    pub fn record_seen(&mut self, seen: DeviceRecord) -> &DeviceRecord {
        let existing_key = seen
            .serial
            .as_ref()
            .and_then(|serial| {
                self.devices
                    .iter()
                    .find(|(_, r)| r.serial.as_ref() == Some(serial))
                    .map(|(k, _)| k.clone())
            })
            .or_else(|| {
                self.devices
                    .iter()
                    .find(|(_, r)| r.address == seen.address)
                    .map(|(k, _)| k.clone())
            });

        let merged = match existing_key.and_then(|key| self.devices.remove(&key)) {
            Some(mut previous) => {
                previous.address = seen.address;
                previous.port = seen.port;
                previous.last_seen = seen.last_seen;
                if seen.name.is_some() {
                    previous.name = seen.name;
                }
                if seen.serial.is_some() {
                    previous.serial = seen.serial;
                }
                if seen.model.is_some() {
                    previous.model = seen.model;
                }
                previous
            }
            None => seen,
        };

        let key = merged.key();
        self.devices.insert(key.clone(), merged);
        &self.devices[&key]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(ip: [u8; 4], name: Option<&str>, serial: Option<&str>) -> DeviceRecord {
        let mut r = DeviceRecord::new(IpAddr::from(ip), DEFAULT_DEVICE_PORT);
        r.name = name.map(str::to_string);
        r.serial = serial.map(str::to_string);
        r
    }

    #[test]
    fn find_by_name_serial_and_address() {
        let mut cache = DeviceCache::in_memory();
        cache.record_seen(record([192, 168, 1, 20], Some("Lab-Go"), Some("MG-001")));

        assert!(cache.find_by_identifier("lab-go").is_some());
        assert!(cache.find_by_identifier("mg-001").is_some());
        assert!(cache.find_by_identifier("192.168.1.20").is_some());
        assert!(cache.find_by_identifier("192.168.1.20:80").is_some());
        assert!(cache.find_by_identifier("other").is_none());
        assert!(cache.find_by_identifier("  ").is_none());
    }

    #[test]
    fn rediscovery_updates_address() {
        let mut cache = DeviceCache::in_memory();
        cache.record_seen(record([10, 0, 0, 1], Some("pro"), Some("MP-1")));
        cache.record_seen(record([10, 0, 0, 2], None, Some("MP-1")));

        assert_eq!(cache.len(), 1);
        let r = cache.find_by_identifier("MP-1").unwrap();
        assert_eq!(r.address, IpAddr::from([10, 0, 0, 2]));
        assert_eq!(r.name.as_deref(), Some("pro"), "name should be kept");
    }

    #[test]
    fn serial_learned_later_rekeys_entry() {
        let mut cache = DeviceCache::in_memory();
        cache.record_seen(record([10, 0, 0, 3], None, None));
        cache.record_seen(record([10, 0, 0, 3], Some("go"), Some("MG-3")));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.records().next().unwrap().key(), "MG-3");
    }

    #[test]
    fn save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("device_cache.json");

        let mut cache = DeviceCache::load(&path);
        assert!(cache.is_empty());
        cache.record_seen(record([10, 1, 1, 1], Some("bench"), Some("ML-9")));
        cache.save().unwrap();

        let reloaded = DeviceCache::load(&path);
        assert_eq!(reloaded.len(), 1);
        let r = reloaded.find_by_identifier("bench").unwrap();
        assert_eq!(r.serial.as_deref(), Some("ML-9"));
    }

    #[test]
    fn corrupt_file_gives_empty_cache() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("device_cache.json");
        std::fs::write(&path, "{ not json").unwrap();

        let cache = DeviceCache::load(&path);
        assert!(cache.is_empty());
        assert_eq!(cache.path(), Some(path.as_path()));
    }

    #[test]
    fn merge_info_overrides_known_fields() {
        let mut r = record([10, 0, 0, 4], Some("old"), None);
        r.merge_info(&DeviceInfo {
            name: None,
            serial: Some("MG-4".to_string()),
            model: Some("moku:go".to_string()),
            firmware: None,
        });
        assert_eq!(r.name.as_deref(), Some("old"));
        assert_eq!(r.serial.as_deref(), Some("MG-4"));
        assert_eq!(r.model.as_deref(), Some("moku:go"));
    }

    #[test]
    fn default_cache_path_in_config_dir() {
        let path = default_cache_path().unwrap();
        assert!(path.ends_with(".moku-mcp/device_cache.json"));
    }
}
