//! Error handling for the channel manager
//!
//! Foreground operations surface a single error type carrying the original
//! cause. Background paths (reader loops, listener callbacks, best-effort
//! cleanup) never propagate errors; they log through a `LogLimiter` instead.

use crate::spi::DriverError;
use crate::types::ChannelLocator;
use thiserror::Error;

/// Channel manager error type
#[derive(Error, Debug)]
pub enum ChannelManagerError {
    /// Unknown driver, channel or configuration
    #[error("Not found: {0}")]
    NotFound(String),

    /// Direction or permission violation
    #[error("Permission denied: {0}")]
    Security(String),

    /// Failure reported by the underlying protocol driver
    #[error("Driver {driver_id} failed: {source}")]
    Driver {
        driver_id: String,
        #[source]
        source: DriverError,
    },

    /// Malformed caller input
    #[error("Invalid argument: {0}")]
    Argument(String),

    /// Operation on a closed driver or channel
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Channel closed between table insertion and use; the caller retries
    #[error("Channel closed: {0}")]
    ChannelClosed(ChannelLocator),

    /// Operation not supported for the given input
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Discovery and scan bookkeeping failures
    #[error("IO error: {0}")]
    Io(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Invariant violation
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for the channel manager
pub type Result<T> = std::result::Result<T, ChannelManagerError>;

/// Coarse classification of [`ChannelManagerError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Security,
    Driver,
    Argument,
    InvalidState,
    Unsupported,
    Io,
    Timeout,
    Internal,
}

impl ChannelManagerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Security(_) => ErrorKind::Security,
            Self::Driver { .. } => ErrorKind::Driver,
            Self::Argument(_) | Self::Config(_) => ErrorKind::Argument,
            Self::InvalidState(_) | Self::ChannelClosed(_) => ErrorKind::InvalidState,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::Io(_) => ErrorKind::Io,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the failed operation may succeed when retried from scratch.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ChannelClosed(_))
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn security(msg: impl Into<String>) -> Self {
        Self::Security(msg.into())
    }

    pub fn argument(msg: impl Into<String>) -> Self {
        Self::Argument(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn driver(driver_id: impl Into<String>, source: DriverError) -> Self {
        Self::Driver {
            driver_id: driver_id.into(),
            source,
        }
    }

    pub fn driver_not_found(driver_id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("Driver not found: {}", driver_id))
    }

    pub fn channel_not_found(locator: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("Channel not found: {}", locator))
    }

    /// The driver-side cause, if this error wraps one.
    pub fn driver_error(&self) -> Option<&DriverError> {
        match self {
            Self::Driver { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<figment::Error> for ChannelManagerError {
    fn from(err: figment::Error) -> Self {
        ChannelManagerError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceLocator;
    use std::error::Error as _;

    #[test]
    fn test_driver_error_preserves_cause() {
        let err = ChannelManagerError::driver("modbus", DriverError::Io("port closed".into()));
        assert_eq!(err.kind(), ErrorKind::Driver);
        assert_eq!(err.to_string(), "Driver modbus failed: IO error: port closed");
        let source = err.source().map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("IO error: port closed"));
        assert!(matches!(err.driver_error(), Some(DriverError::Io(_))));
    }

    #[test]
    fn test_channel_closed_is_retryable_invalid_state() {
        let loc = DeviceLocator::new("sim", "bus0", "p1").channel("a");
        let err = ChannelManagerError::ChannelClosed(loc);
        assert!(err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert!(!ChannelManagerError::invalid_state("closed").is_retryable());
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            ChannelManagerError::driver_not_found("x").kind(),
            ErrorKind::NotFound
        );
        assert_eq!(ChannelManagerError::security("w").kind(), ErrorKind::Security);
        assert_eq!(
            ChannelManagerError::Config("bad".into()).kind(),
            ErrorKind::Argument
        );
        assert_eq!(ChannelManagerError::io("dup").kind(), ErrorKind::Io);
    }
}
