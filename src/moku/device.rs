//! Hardware seam between the tool layer and a Moku device.
//!
//! A [`DeviceConnector`] claims ownership of a device and hands back a
//! [`DeviceHandle`]; every control call goes through the handle, and ownership
//! lasts until [`DeviceHandle::release`] is called. The HTTP backend talks to
//! real hardware, the mock backend keeps everything in memory.
//!
//! [`HandleGuard`] pairs a handle with a guaranteed release: explicit release
//! on the normal path, and a release scheduled on the runtime if the guard is
//! dropped while still holding the handle (error unwinding, cancelled futures).

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::moku::error::{MokuError, MokuResult};
use crate::moku::model::{Connection, InstrumentKind};

/// Metadata reported by a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// User-assigned device name.
    pub name: Option<String>,
    /// Factory serial number.
    pub serial: Option<String>,
    /// Hardware family, e.g. `moku:pro`.
    pub model: Option<String>,
    /// Firmware version string.
    pub firmware: Option<String>,
}

/// Opens exclusive connections to devices.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    /// Claims ownership of the device at `address`.
    ///
    /// With `force` set, ownership is taken even if another client holds it.
    ///
    /// # Errors
    ///
    /// Returns [`MokuError::Conflict`](crate::moku::MokuError::Conflict) if
    /// the device is owned elsewhere and `force` is false, or a transient
    /// error if the device cannot be reached.
    async fn connect(&self, address: SocketAddr, force: bool) -> MokuResult<Box<dyn DeviceHandle>>;
}

/// An owned connection to a single device.
#[async_trait]
pub trait DeviceHandle: Send {
    /// Address this handle is connected to.
    fn address(&self) -> SocketAddr;

    /// Reads device metadata.
    async fn device_info(&mut self) -> MokuResult<DeviceInfo>;

    /// Uploads a bitstream archive for `slot`.
    async fn upload_bitstream(&mut self, slot: u8, bitstream: Vec<u8>) -> MokuResult<()>;

    /// Loads `instrument` into `slot`.
    async fn set_instrument(&mut self, slot: u8, instrument: InstrumentKind) -> MokuResult<()>;

    /// Writes a Cloud Compile control register.
    async fn set_control(&mut self, slot: u8, index: u8, value: u32) -> MokuResult<()>;

    /// Forwards a single instrument setting.
    async fn apply_setting(
        &mut self,
        slot: u8,
        instrument: InstrumentKind,
        name: &str,
        value: &Value,
    ) -> MokuResult<()>;

    /// Replaces the device's routing with `connections`.
    async fn set_connections(&mut self, connections: &[Connection]) -> MokuResult<()>;

    /// Reports the instrument API name loaded in each slot (`None` if empty).
    async fn list_instruments(&mut self) -> MokuResult<BTreeMap<u8, Option<String>>>;

    /// Relinquishes ownership of the device.
    async fn release(&mut self) -> MokuResult<()>;
}

/// Future returned by operations run under [`with_device`].
pub type HandleFuture<'a, T> = Pin<Box<dyn Future<Output = MokuResult<T>> + Send + 'a>>;

/// A device handle that is released on every exit path.
pub struct HandleGuard {
    handle: Option<Box<dyn DeviceHandle>>,
    address: SocketAddr,
}

impl HandleGuard {
    /// Wraps a freshly connected handle.
    #[must_use]
    pub fn new(handle: Box<dyn DeviceHandle>) -> Self {
        let address = handle.address();
        Self {
            handle: Some(handle),
            address,
        }
    }

    /// Address of the guarded device.
    #[must_use]
    pub const fn address(&self) -> SocketAddr {
        self.address
    }

    /// Borrows the live handle, if it has not been released.
    pub fn handle(&mut self) -> Option<&mut dyn DeviceHandle> {
        match self.handle.as_mut() {
            Some(handle) => Some(&mut **handle),
            None => None,
        }
    }

    /// Releases the device.
    ///
    /// The handle is gone afterwards whether or not the device accepted the
    /// release; the device-side result is returned for reporting.
    ///
    /// # Errors
    ///
    /// Returns the error from the device's release call.
    pub async fn release(&mut self) -> MokuResult<()> {
        match self.handle.take() {
            Some(mut handle) => handle.release().await,
            None => Ok(()),
        }
    }
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };

        let address = self.address;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::debug!(%address, "Releasing device from dropped guard");
                runtime.spawn(async move {
                    if let Err(e) = handle.release().await {
                        tracing::warn!(%address, error = %e, "Deferred release failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(%address, "No runtime available, device ownership not released");
            }
        }
    }
}

/// Connects to `address`, runs `op` against the handle and releases the device.
///
/// The release happens whether `op` succeeds or fails; a release failure is
/// logged and does not replace the result of `op`.
///
/// # Errors
///
/// Returns the connection error, or the error produced by `op`.
pub async fn with_device<T, F>(
    connector: &dyn DeviceConnector,
    address: SocketAddr,
    force: bool,
    op: F,
) -> MokuResult<T>
where
    F: for<'h> FnOnce(&'h mut dyn DeviceHandle) -> HandleFuture<'h, T>,
{
    let mut guard = HandleGuard::new(connector.connect(address, force).await?);

    let result = match guard.handle() {
        Some(handle) => op(handle).await,
        None => Err(MokuError::not_attached()),
    };

    if let Err(e) = guard.release().await {
        tracing::warn!(%address, error = %e, "Failed to release device after scoped operation");
    }

    result
}
