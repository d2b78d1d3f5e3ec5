//! # Agent Error Types
//!
//! Error types for the periodic tasks and their configuration.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Agent Error Categories                            │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   ReadError     │  │      ApiError           │ │
//! │  │  (fatal)        │  │   (per point)   │  │      (per cycle)        │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Timeout        │  │  Transport              │ │
//! │  │  InvalidUrl     │  │  Unreachable    │  │  Timeout                │ │
//! │  │  ConfigLoad     │  │  Malformed      │  │  Status                 │ │
//! │  │  Validation     │  │  Device         │  │  Decode                 │ │
//! │  │                 │  │  NotNumeric     │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Storage      │  │     Source      │  │      Update             │ │
//! │  │  (DbError)      │  │  (BacnetError)  │  │  (command failures)     │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Propagation
//! Only configuration errors (and failing to open the database or bind the
//! BACnet socket at startup) reach process exit. A `ReadError` becomes a
//! null-valued reading, an `ApiError` or storage error is logged and the
//! task waits for its next tick.

use std::time::Duration;

use thiserror::Error;

use heitz_bacnet::BacnetError;
use heitz_core::ValidationError;
use heitz_db::DbError;

/// Result type alias for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

// =============================================================================
// Read Errors
// =============================================================================

/// A single point could not be read.
///
/// Never aborts a tick: the poller records it as a null-valued reading whose
/// `error` column holds this error's text.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ReadError {
    /// No value within the per-point timeout.
    #[error("read timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The device could not be reached.
    #[error("device unreachable: {0}")]
    Unreachable(String),

    /// The reply could not be decoded.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// The device answered with an error, reject or abort.
    #[error("device error: {0}")]
    Device(String),

    /// The property value was not a number.
    #[error("value is not numeric: {0}")]
    NotNumeric(String),
}

impl From<BacnetError> for ReadError {
    fn from(err: BacnetError) -> Self {
        match err {
            BacnetError::Timeout { timeout } => ReadError::Timeout(timeout),
            BacnetError::Io(io) => ReadError::Unreachable(io.to_string()),
            BacnetError::InvalidAddress(addr) => ReadError::Unreachable(addr),
            BacnetError::Malformed(msg) => ReadError::Malformed(msg),
            BacnetError::UnexpectedValue(msg) => ReadError::NotNumeric(msg),
            device @ (BacnetError::Device { .. }
            | BacnetError::Rejected { .. }
            | BacnetError::Aborted { .. }) => ReadError::Device(device.to_string()),
        }
    }
}

// =============================================================================
// API Errors
// =============================================================================

/// A call to the backend failed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApiError {
    /// Connection refused, DNS failure, TLS failure, ...
    #[error("API transport error: {0}")]
    Transport(String),

    /// The request did not complete within the configured timeout.
    #[error("API request timed out")]
    Timeout,

    /// Non-2xx response.
    #[error("API returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// A 2xx response whose body could not be understood.
    #[error("Could not decode API response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Returns true if the same request may succeed on a later cycle.
    ///
    /// Client errors (4xx other than 408 and 429) point at a request the
    /// backend will keep refusing.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Transport(_) | ApiError::Timeout => true,
            ApiError::Status { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            ApiError::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            ApiError::Status {
                status: status.as_u16(),
                body: String::new(),
            }
        } else {
            ApiError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Decode(err.to_string())
    }
}

// =============================================================================
// Agent Errors
// =============================================================================

/// Agent error type covering configuration, storage, network and update
/// failures.
#[derive(Debug, Error)]
pub enum AgentError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid API base URL.
    #[error("Invalid API URL: {0}")]
    InvalidUrl(String),

    /// Failed to read or parse the config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// A field failed validation.
    #[error("Invalid configuration: {0}")]
    Validation(#[from] ValidationError),

    // =========================================================================
    // Runtime Errors
    // =========================================================================
    /// Local queue failure.
    #[error("Storage error: {0}")]
    Storage(#[from] DbError),

    /// Backend call failure.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Point read failure.
    #[error("Read failed: {0}")]
    Read(#[from] ReadError),

    /// BACnet client failure outside a point read (socket bind).
    #[error("BACnet error: {0}")]
    Bacnet(#[from] BacnetError),

    /// Revision lookup or update command failure.
    #[error("Update failed: {0}")]
    UpdateFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        AgentError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for AgentError {
    fn from(err: toml::de::Error) -> Self {
        AgentError::ConfigLoadFailed(err.to_string())
    }
}

impl From<url::ParseError> for AgentError {
    fn from(err: url::ParseError) -> Self {
        AgentError::InvalidUrl(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl AgentError {
    /// Returns true if the failed operation can be retried on a later cycle.
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::Api(api) => api.is_retryable(),
            AgentError::Storage(_) | AgentError::Read(_) => true,
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            AgentError::InvalidConfig(_)
                | AgentError::InvalidUrl(_)
                | AgentError::ConfigLoadFailed(_)
                | AgentError::Validation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bacnet_errors_map_to_read_errors() {
        let timeout = Duration::from_millis(1500);
        assert_eq!(
            ReadError::from(BacnetError::Timeout { timeout }),
            ReadError::Timeout(timeout)
        );
        assert!(matches!(
            ReadError::from(BacnetError::Device { class: 1, code: 31 }),
            ReadError::Device(_)
        ));
        assert!(matches!(
            ReadError::from(BacnetError::Rejected { reason: 9 }),
            ReadError::Device(_)
        ));
        assert!(matches!(
            ReadError::from(BacnetError::UnexpectedValue("text".into())),
            ReadError::NotNumeric(_)
        ));
        assert!(matches!(
            ReadError::from(BacnetError::Malformed("short".into())),
            ReadError::Malformed(_)
        ));
    }

    #[test]
    fn test_read_error_display() {
        let err = ReadError::Timeout(Duration::from_millis(2000));
        assert_eq!(err.to_string(), "read timed out after 2000ms");
    }

    #[test]
    fn test_api_error_retryable() {
        assert!(ApiError::Timeout.is_retryable());
        assert!(ApiError::Transport("refused".into()).is_retryable());
        assert!(ApiError::Status { status: 503, body: String::new() }.is_retryable());
        assert!(ApiError::Status { status: 429, body: String::new() }.is_retryable());
        assert!(!ApiError::Status { status: 401, body: String::new() }.is_retryable());
        assert!(!ApiError::Decode("not json".into()).is_retryable());
    }

    #[test]
    fn test_agent_error_categories() {
        assert!(AgentError::InvalidConfig("no points".into()).is_config_error());
        assert!(AgentError::Validation(ValidationError::Required {
            field: "device.id".into()
        })
        .is_config_error());
        assert!(!AgentError::InvalidConfig("no points".into()).is_retryable());

        assert!(AgentError::Api(ApiError::Timeout).is_retryable());
        assert!(!AgentError::Api(ApiError::Timeout).is_config_error());
        assert!(AgentError::Storage(DbError::QueryFailed("disk full".into())).is_retryable());
    }
}
