//! Moku device control: discovery, ownership and configuration.
//!
//! # Layout
//!
//! - [`model`]: configuration types, port grammar and routing rules
//! - [`device`]: the [`DeviceConnector`] / [`DeviceHandle`] hardware seam
//! - [`http`]: REST backend for real devices
//! - [`mock`]: in-memory backend for tests and `--simulate`
//! - [`cache`]: persisted map of known devices
//! - [`discovery`]: zeroconf browse plus metadata enrichment
//! - [`session`]: the single exclusive device session
//! - [`deployer`]: pushes configurations to the attached device

pub mod cache;
pub mod deployer;
pub mod device;
pub mod discovery;
pub mod error;
pub mod http;
pub mod mock;
pub mod model;
pub mod session;

pub use cache::{DeviceCache, DeviceRecord};
pub use deployer::{ConfigurationDeployer, DeploymentReport};
pub use device::{with_device, DeviceConnector, DeviceHandle, DeviceInfo, HandleGuard};
pub use discovery::{DiscoveryClient, MdnsBrowser, ServiceBrowser};
pub use error::{ErrorKind, MokuError, MokuResult};
pub use http::HttpConnector;
pub use model::{Connection, InstrumentKind, MokuConfig, MokuModel, PlatformDescriptor, SlotConfig};
pub use session::{ReleaseOutcome, SessionInfo, SessionManager};
