//! Error types for blelink

use thiserror::Error;

/// Error reported by the transport boundary
///
/// Carries whatever the radio stack reported, unchanged. The core never
/// retries on these; they are passed through to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (code {code})")]
pub struct TransportError {
    /// Transport-defined error code
    pub code: i32,
    /// Human readable description
    pub message: String,
}

impl TransportError {
    /// Code used when the underlying stack gives no numeric code
    pub const UNKNOWN_CODE: i32 = -1;

    /// Create a new transport error
    pub fn new<S: Into<String>>(code: i32, message: S) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Create a transport error without a specific code
    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::new(Self::UNKNOWN_CODE, message)
    }
}

impl From<btleplug::Error> for TransportError {
    fn from(error: btleplug::Error) -> Self {
        let code = match &error {
            btleplug::Error::PermissionDenied => 1,
            btleplug::Error::DeviceNotFound => 2,
            btleplug::Error::NotConnected => 3,
            btleplug::Error::NotSupported(_) => 4,
            btleplug::Error::TimedOut(_) => 5,
            _ => Self::UNKNOWN_CODE,
        };
        Self::new(code, error.to_string())
    }
}

/// Errors surfaced by peripheral operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeripheralError {
    /// The operation requires a connected peripheral
    #[error("Peripheral is disconnected")]
    Disconnected,

    /// Service discovery did not complete before its timeout
    #[error("Service discovery timed out")]
    ServiceDiscoveryTimeout,

    /// Service discovery completed without reporting any service
    #[error("Peripheral reported no services")]
    NoServices,

    /// Another service discovery is still pending on this peripheral
    #[error("Service discovery already in progress")]
    ServiceDiscoveryInProgress,

    /// Error passed through from the transport
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The peripheral's task is no longer running
    #[error("Peripheral task has stopped")]
    Stopped,
}

impl PeripheralError {
    /// Transport error code, if this error came from the transport
    pub fn transport_code(&self) -> Option<i32> {
        match self {
            Self::Transport(e) => Some(e.code),
            _ => None,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, PeripheralError>;

/// Configuration error type
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error while reading or writing the config file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed config file
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A value is out of range
    #[error("Invalid value for {field}: {reason}")]
    Invalid {
        /// Name of the offending field
        field: &'static str,
        /// Why the value was rejected
        reason: String,
    },
}
