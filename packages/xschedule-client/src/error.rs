//! xSchedule API error types

use thiserror::Error;

/// xSchedule API client errors
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Transport-level failure (connect, timeout, HTTP status)
    #[error("connection to xSchedule failed: {0}")]
    Connection(#[from] reqwest::Error),

    /// The device rejected the configured credential
    #[error("xSchedule authentication failed")]
    Auth,

    /// The device responded but reported failure
    #[error("xSchedule rejected the request: {0}")]
    Rejected(String),

    /// Response body was not valid JSON
    #[error("failed to parse xSchedule response: {0}")]
    Parse(#[from] serde_json::Error),

    /// The configured device address is not a valid URL
    #[error("invalid device address: {0}")]
    Address(#[from] url::ParseError),
}

impl DeviceError {
    /// Check if this error is a transport-level failure.
    ///
    /// Connection failures are the only class the channel-reconnect layer
    /// retries; everything else is surfaced to the caller as-is.
    pub fn is_connection(&self) -> bool {
        matches!(self, DeviceError::Connection(_))
    }

    /// Check if this error means the configured credential was rejected
    pub fn is_auth(&self) -> bool {
        matches!(self, DeviceError::Auth)
    }
}

/// Result type for xSchedule API operations
pub type DeviceResult<T> = Result<T, DeviceError>;
