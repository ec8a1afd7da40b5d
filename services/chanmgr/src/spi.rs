//! Driver service provider interface
//!
//! A protocol driver (Modbus, M-Bus, ...) plugs into the manager by
//! implementing [`ChannelDriver`]. The manager is the only caller; drivers
//! never see applications directly.
//!
//! ```text
//! ChannelManager ──► Driver ──► Channel ──► Configuration ──► listeners
//!                      │
//!                      └──► dyn ChannelDriver (read/write/listen/scan)
//! ```

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::listener::{ChannelScanListener, DeviceListener, DeviceScanListener};
use crate::types::{ChannelLocator, DeviceLocator, SampledValueContainer, ValueContainer};

/// Error reported by a protocol driver
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DriverError {
    pub fn unsupported(op: impl Into<String>) -> Self {
        DriverError::Unsupported(op.into())
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, DriverError::Unsupported(_))
    }
}

impl From<std::io::Error> for DriverError {
    fn from(err: std::io::Error) -> Self {
        DriverError::Io(err.to_string())
    }
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Push target handed to a driver together with its listen set.
///
/// Implementations must not block; the manager queues the batch and applies
/// it on its own task in arrival order.
pub trait ChannelUpdateSink: Send + Sync {
    fn channels_updated(&self, updates: Vec<SampledValueContainer>);
}

/// Protocol driver contract
#[async_trait]
pub trait ChannelDriver: Send + Sync + 'static {
    /// Unique id, matched against `DeviceLocator::driver_id`
    fn driver_id(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Fill `sampled_value` of every container. Leaving a slot `None`
    /// reports "no new data" for that channel.
    async fn read_channels(&self, channels: &mut [SampledValueContainer]) -> DriverResult<()>;

    async fn write_channels(&self, values: &[ValueContainer]) -> DriverResult<()>;

    /// Replace the complete set of channels the driver pushes updates for.
    /// An empty set with no sink stops all push delivery.
    async fn listen_channels(
        &self,
        _channels: Vec<ChannelLocator>,
        _sink: Option<Arc<dyn ChannelUpdateSink>>,
    ) -> DriverResult<()> {
        Err(DriverError::unsupported("listen_channels"))
    }

    /// Start an asynchronous device scan. Results and completion are
    /// reported through `listener`, possibly before this call returns.
    async fn start_device_scan(
        &self,
        _interface_id: &str,
        _filter: Option<&str>,
        _listener: Arc<dyn DeviceScanListener>,
    ) -> DriverResult<()> {
        Err(DriverError::unsupported("start_device_scan"))
    }

    async fn abort_device_scan(&self, _interface_id: &str, _filter: Option<&str>) -> DriverResult<()> {
        Err(DriverError::unsupported("abort_device_scan"))
    }

    async fn start_channel_scan(
        &self,
        _device: &DeviceLocator,
        _listener: Arc<dyn ChannelScanListener>,
    ) -> DriverResult<()> {
        Err(DriverError::unsupported("start_channel_scan"))
    }

    async fn get_channel_list(&self, _device: &DeviceLocator) -> DriverResult<Vec<ChannelLocator>> {
        Err(DriverError::unsupported("get_channel_list"))
    }

    /// A channel got its first configuration.
    fn channel_added(&self, _locator: &ChannelLocator) {}

    /// A channel lost its last configuration and was closed.
    fn channel_removed(&self, _locator: &ChannelLocator) {}

    fn add_device_listener(&self, _listener: Arc<dyn DeviceListener>) -> DriverResult<()> {
        Err(DriverError::unsupported("add_device_listener"))
    }

    /// `listener` is the same `Arc` previously passed to `add_device_listener`.
    fn remove_device_listener(&self, _listener: &Arc<dyn DeviceListener>) -> DriverResult<()> {
        Err(DriverError::unsupported("remove_device_listener"))
    }
}
