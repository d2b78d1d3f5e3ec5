//! # Error Types
//!
//! Errors raised while turning configuration text into typed points.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  "analogInput:1"  ──parse──►  ObjectReference                           │
//! │        │ fails                                                          │
//! │        ▼                                                                │
//! │  CoreError::InvalidObjectReference / UnknownObjectType                  │
//! │                                                                         │
//! │  [[points]] table ──validate──► PointDescriptor                         │
//! │        │ fails                                                          │
//! │        ▼                                                                │
//! │  ValidationError ──► AgentError::Validation ──► exit before startup     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Storage, wire and backend failures have their own enums in heitz-db,
//! heitz-bacnet and heitz-agent.

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Point configuration could not be interpreted.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Object type name is not one the reader can address.
    #[error("Unknown object type: {0}")]
    UnknownObjectType(String),

    /// Object reference string could not be parsed.
    ///
    /// ## When This Occurs
    /// - Missing `:` separator (`"analogInput1"`)
    /// - Non-numeric or negative instance (`"analogInput:-1"`)
    /// - Instance beyond the 22-bit BACnet range
    #[error("Invalid object reference '{input}': {reason}")]
    InvalidObjectReference { input: String, reason: String },

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// A configured value broke a field rule.
///
/// Raised at startup so a broken point list never reaches the poller.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{field} is required")]
    Required { field: String },

    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Bad URL, bad point name characters, unknown log level.
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Two points share a name or an object reference.
    #[error("{field} '{value}' already exists")]
    Duplicate { field: String, value: String },
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_reference_message() {
        let err = CoreError::InvalidObjectReference {
            input: "analogInput".to_string(),
            reason: "expected <objectType>:<instance>".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid object reference 'analogInput': expected <objectType>:<instance>"
        );
    }

    #[test]
    fn test_validation_messages() {
        let err = ValidationError::Duplicate {
            field: "point name".to_string(),
            value: "pool_ph".to_string(),
        };
        assert_eq!(err.to_string(), "point name 'pool_ph' already exists");

        let err = ValidationError::OutOfRange {
            field: "bacnet.target_device_id".to_string(),
            min: 0,
            max: 4_194_302,
        };
        assert_eq!(
            err.to_string(),
            "bacnet.target_device_id must be between 0 and 4194302"
        );
    }

    #[test]
    fn test_validation_wraps_into_core_error() {
        let core_err: CoreError = ValidationError::Required {
            field: "points".to_string(),
        }
        .into();
        assert!(matches!(core_err, CoreError::Validation(_)));
        assert_eq!(core_err.to_string(), "Validation error: points is required");
    }
}
