//! Callback traits implemented by applications (and by the manager's own
//! adapters toward drivers)
//!
//! Every call into listener code is isolated by the manager: a panicking
//! listener is logged and skipped, never unwinding into driver or scheduler
//! code.

use crate::core::ConfigurationKey;
use crate::spi::DriverError;
use crate::types::{ChannelLocator, DeviceLocator, SampledValue};

/// Kind of change a channel update represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Same value and quality, only the timestamp moved
    Updated,
    ValueChanged,
    QualityChanged,
}

/// Update delivered to channel listeners
#[derive(Debug, Clone)]
pub struct ChannelEvent {
    pub event_type: EventType,
    pub locator: ChannelLocator,
    pub value: SampledValue,
    /// Configuration through which the event is delivered
    pub configuration: ConfigurationKey,
}

/// Receives channel updates for the configurations it is registered on.
pub trait ChannelEventListener: Send + Sync {
    fn channel_event(&self, event: &ChannelEvent);
}

/// Device attach/detach notifications.
pub trait DeviceListener: Send + Sync {
    fn device_added(&self, device: &DeviceLocator);
    fn device_removed(&self, device: &DeviceLocator);
}

/// Progress of an asynchronous device scan.
pub trait DeviceScanListener: Send + Sync {
    fn device_found(&self, device: &DeviceLocator);

    /// Fraction in `[0, 1]`
    fn progress(&self, _ratio: f32) {}

    /// Terminal callback; `error` is set when `success` is false.
    fn finished(&self, success: bool, error: Option<&DriverError>);
}

/// Progress of an asynchronous channel scan on one device.
pub trait ChannelScanListener: Send + Sync {
    fn channel_found(&self, channel: &ChannelLocator);

    fn progress(&self, _ratio: f32) {}

    fn finished(&self, success: bool, error: Option<&DriverError>);
}
