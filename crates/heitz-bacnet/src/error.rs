//! # BACnet Error Types
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Where each error comes from                                            │
//! │                                                                         │
//! │  socket bind / send / recv  ──► Io                                     │
//! │  no matching reply in time  ──► Timeout                                │
//! │  bytes we cannot parse      ──► Malformed                              │
//! │  Error PDU                  ──► Device { class, code }                 │
//! │  Reject PDU                 ──► Rejected                               │
//! │  Abort PDU                  ──► Aborted                                │
//! │  value of the wrong kind    ──► UnexpectedValue                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use thiserror::Error;

/// BACnet client errors.
#[derive(Debug, Error)]
pub enum BacnetError {
    /// Socket I/O failed.
    #[error("BACnet I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Address could not be parsed or used.
    #[error("Invalid BACnet address: {0}")]
    InvalidAddress(String),

    /// No matching reply arrived before the request timeout.
    #[error("No reply within {timeout:?}")]
    Timeout { timeout: Duration },

    /// A reply could not be decoded.
    #[error("Malformed BACnet frame: {0}")]
    Malformed(String),

    /// The device answered with an Error PDU.
    ///
    /// ## Common Codes
    /// - class 1 (object), code 31: unknown object
    /// - class 2 (property), code 32: unknown property
    #[error("Device error: class {class}, code {code}")]
    Device { class: u32, code: u32 },

    /// The device rejected the request.
    #[error("Request rejected, reason {reason}")]
    Rejected { reason: u8 },

    /// The request was aborted.
    #[error("Request aborted, reason {reason}")]
    Aborted { reason: u8 },

    /// The property value was not of the expected kind.
    #[error("Unexpected value: {0}")]
    UnexpectedValue(String),
}

impl BacnetError {
    /// Returns true if the error came back from the device itself.
    pub fn is_device_response(&self) -> bool {
        matches!(
            self,
            BacnetError::Device { .. } | BacnetError::Rejected { .. } | BacnetError::Aborted { .. }
        )
    }
}

/// Result type for BACnet operations.
pub type BacnetResult<T> = Result<T, BacnetError>;
