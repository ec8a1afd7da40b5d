//! Core value types shared by the manager, its drivers and applications
//!
//! Locators are immutable structural keys used throughout the channel tables.
//! `SampledValue` is one observation of a channel; `Direction` and `Sampling`
//! together decide how a configuration is serviced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Locators
// ============================================================================

/// Address of one physical device reachable through a driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceLocator {
    driver_id: String,
    interface_name: String,
    device_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parameters: Option<String>,
}

impl DeviceLocator {
    pub fn new(
        driver_id: impl Into<String>,
        interface_name: impl Into<String>,
        device_address: impl Into<String>,
    ) -> Self {
        Self {
            driver_id: driver_id.into(),
            interface_name: interface_name.into(),
            device_address: device_address.into(),
            parameters: None,
        }
    }

    /// Attach driver-specific connection parameters (e.g. baud rate).
    pub fn with_parameters(mut self, parameters: impl Into<String>) -> Self {
        self.parameters = Some(parameters.into());
        self
    }

    pub fn driver_id(&self) -> &str {
        &self.driver_id
    }

    pub fn interface_name(&self) -> &str {
        &self.interface_name
    }

    pub fn device_address(&self) -> &str {
        &self.device_address
    }

    pub fn parameters(&self) -> Option<&str> {
        self.parameters.as_deref()
    }

    /// Locator of a channel on this device.
    pub fn channel(&self, channel_address: impl Into<String>) -> ChannelLocator {
        ChannelLocator::new(self.clone(), channel_address)
    }
}

impl fmt::Display for DeviceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.driver_id, self.interface_name, self.device_address
        )?;
        if let Some(params) = &self.parameters {
            write!(f, "?{}", params)?;
        }
        Ok(())
    }
}

/// Address of one data point on one device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelLocator {
    device: DeviceLocator,
    channel_address: String,
}

impl ChannelLocator {
    pub fn new(device: DeviceLocator, channel_address: impl Into<String>) -> Self {
        Self {
            device,
            channel_address: channel_address.into(),
        }
    }

    pub fn device(&self) -> &DeviceLocator {
        &self.device
    }

    pub fn channel_address(&self) -> &str {
        &self.channel_address
    }

    pub fn driver_id(&self) -> &str {
        self.device.driver_id()
    }
}

impl fmt::Display for ChannelLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.channel_address)
    }
}

// ============================================================================
// Application identity
// ============================================================================

/// Opaque identity of the application owning a configuration, scan or listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppId(Arc<str>);

impl AppId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// Fresh identity for one-shot operations that must not share
    /// configurations with any real application.
    pub fn synthetic() -> Self {
        Self::new(format!("oneshot-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AppId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

// ============================================================================
// Values
// ============================================================================

/// Typed measurement carried by a sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(v) => f.write_str(v),
            Value::Bytes(v) => write!(f, "{:02X?}", v),
        }
    }
}

/// Sample quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Good,
    #[default]
    Bad,
}

/// One observation of a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampledValue {
    pub value: Option<Value>,
    pub timestamp: DateTime<Utc>,
    pub quality: Quality,
}

impl SampledValue {
    pub fn new(value: Option<Value>, timestamp: DateTime<Utc>, quality: Quality) -> Self {
        Self {
            value,
            timestamp,
            quality,
        }
    }

    /// Good-quality sample taken now.
    pub fn good(value: impl Into<Value>) -> Self {
        Self::new(Some(value.into()), Utc::now(), Quality::Good)
    }

    /// Bad-quality sample without a value, taken now.
    pub fn bad() -> Self {
        Self::new(None, Utc::now(), Quality::Bad)
    }

    pub fn is_good(&self) -> bool {
        self.quality == Quality::Good
    }
}

// ============================================================================
// Direction & sampling
// ============================================================================

/// Data direction of a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Input,
    Output,
    InOut,
}

impl Direction {
    #[inline]
    pub const fn is_readable(self) -> bool {
        matches!(self, Self::Input | Self::InOut)
    }

    #[inline]
    pub const fn is_writable(self) -> bool {
        matches!(self, Self::Output | Self::InOut)
    }
}

/// Sampling policy requested by the application.
///
/// Serialized as a signed millisecond count: `-1` means listen for pushed
/// updates, `0` (or any other non-positive value) means on demand only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum Sampling {
    OnDemand,
    Listen,
    Period(u64),
}

impl Sampling {
    /// Reserved period value requesting driver push updates.
    pub const LISTEN_FOR_UPDATE: i64 = -1;
    /// Reserved period value for explicit reads only.
    pub const NO_READ_NO_LISTEN: i64 = 0;
    /// Longest period that still fits the signed millisecond form.
    pub const MAX_PERIOD_MS: u64 = i64::MAX as u64;

    pub fn from_millis(period_ms: i64) -> Self {
        match period_ms {
            Self::LISTEN_FOR_UPDATE => Sampling::Listen,
            p if p > 0 => Sampling::Period(p as u64),
            _ => Sampling::OnDemand,
        }
    }

    pub fn as_millis(self) -> i64 {
        match self {
            Sampling::OnDemand => Self::NO_READ_NO_LISTEN,
            Sampling::Listen => Self::LISTEN_FOR_UPDATE,
            Sampling::Period(p) => i64::try_from(p).unwrap_or(i64::MAX),
        }
    }

    /// `false` for a period beyond [`MAX_PERIOD_MS`](Self::MAX_PERIOD_MS).
    pub fn is_valid(self) -> bool {
        !matches!(self, Sampling::Period(p) if p > Self::MAX_PERIOD_MS)
    }
}

impl From<i64> for Sampling {
    fn from(period_ms: i64) -> Self {
        Self::from_millis(period_ms)
    }
}

impl From<Sampling> for i64 {
    fn from(sampling: Sampling) -> Self {
        sampling.as_millis()
    }
}

/// How a configuration is serviced, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigurationType {
    /// Explicit reads and writes only
    OnDemand,
    /// Driver pushes updates
    Listen,
    /// Scheduled by a reader thread
    Polled,
}

impl ConfigurationType {
    pub fn derive(direction: Direction, sampling: Sampling) -> Self {
        if !direction.is_readable() {
            return ConfigurationType::OnDemand;
        }
        match sampling {
            Sampling::Listen => ConfigurationType::Listen,
            Sampling::Period(p) if p > 0 => ConfigurationType::Polled,
            _ => ConfigurationType::OnDemand,
        }
    }
}

// ============================================================================
// Driver batch containers
// ============================================================================

/// In/out slot for one channel in a batched driver read or push.
#[derive(Debug, Clone, PartialEq)]
pub struct SampledValueContainer {
    pub locator: ChannelLocator,
    pub sampled_value: Option<SampledValue>,
}

impl SampledValueContainer {
    pub fn new(locator: ChannelLocator) -> Self {
        Self {
            locator,
            sampled_value: None,
        }
    }

    pub fn with_value(locator: ChannelLocator, sampled_value: SampledValue) -> Self {
        Self {
            locator,
            sampled_value: Some(sampled_value),
        }
    }
}

/// One value in a batched driver write.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueContainer {
    pub locator: ChannelLocator,
    pub value: Value,
}

impl ValueContainer {
    pub fn new(locator: ChannelLocator, value: Value) -> Self {
        Self { locator, value }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> DeviceLocator {
        DeviceLocator::new("modbus", "/dev/ttyUSB0", "p1")
    }

    #[test]
    fn test_locator_structural_equality() {
        let a = device().channel("40001");
        let b = DeviceLocator::new("modbus", "/dev/ttyUSB0", "p1").channel("40001");
        assert_eq!(a, b);
        assert_ne!(a, device().channel("40002"));
        assert_ne!(device(), device().with_parameters("9600"));
        assert_eq!(a.driver_id(), "modbus");
    }

    #[test]
    fn test_locator_display() {
        let loc = device().with_parameters("9600,8N1").channel("40001");
        assert_eq!(loc.to_string(), "modbus:/dev/ttyUSB0:p1?9600,8N1/40001");
    }

    #[test]
    fn test_sampling_from_millis() {
        assert_eq!(Sampling::from_millis(-1), Sampling::Listen);
        assert_eq!(Sampling::from_millis(0), Sampling::OnDemand);
        assert_eq!(Sampling::from_millis(-5), Sampling::OnDemand);
        assert_eq!(Sampling::from_millis(250), Sampling::Period(250));
        assert_eq!(Sampling::Period(250).as_millis(), 250);
        assert_eq!(Sampling::Listen.as_millis(), -1);
    }

    #[test]
    fn test_oversized_period() {
        let huge = Sampling::Period(u64::MAX);
        assert!(!huge.is_valid());
        assert_eq!(huge.as_millis(), i64::MAX);
        assert!(Sampling::Period(Sampling::MAX_PERIOD_MS).is_valid());
        assert!(Sampling::Listen.is_valid());
    }

    #[test]
    fn test_configuration_type_derivation() {
        use ConfigurationType::*;
        assert_eq!(
            ConfigurationType::derive(Direction::Input, Sampling::Period(100)),
            Polled
        );
        assert_eq!(
            ConfigurationType::derive(Direction::InOut, Sampling::Listen),
            Listen
        );
        assert_eq!(
            ConfigurationType::derive(Direction::Input, Sampling::OnDemand),
            OnDemand
        );
        // write-only channels are never scheduled
        assert_eq!(
            ConfigurationType::derive(Direction::Output, Sampling::Period(100)),
            OnDemand
        );
        assert_eq!(
            ConfigurationType::derive(Direction::Output, Sampling::Listen),
            OnDemand
        );
    }

    #[test]
    fn test_direction_flags() {
        assert!(Direction::Input.is_readable());
        assert!(!Direction::Input.is_writable());
        assert!(!Direction::Output.is_readable());
        assert!(Direction::Output.is_writable());
        assert!(Direction::InOut.is_readable() && Direction::InOut.is_writable());
    }

    #[test]
    fn test_synthetic_app_ids_are_unique() {
        assert_ne!(AppId::synthetic(), AppId::synthetic());
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::from(5), Value::Integer(5));
        assert_eq!(Value::from(true), Value::Boolean(true));
        assert_eq!(Value::from("on"), Value::Text("on".to_string()));
        assert!(SampledValue::good(1.5).is_good());
        assert!(!SampledValue::bad().is_good());
    }
}
