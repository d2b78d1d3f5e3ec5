//! # Validation Module
//!
//! Startup validation for the point list.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Deserialization (serde)                                      │
//! │  ├── Object references parse ("analogInput:1")                         │
//! │  └── Instance within 22-bit range                                      │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: THIS MODULE                                                  │
//! │  ├── Point list not empty                                              │
//! │  ├── Point names well-formed                                           │
//! │  └── Point names unique                                                │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Database (SQLite)                                            │
//! │  └── CHECK constraints on sensor_readings                              │
//! │                                                                         │
//! │  Any failure here aborts startup before a task is spawned.             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use heitz_core::{default_points, validation::validate_points};
//!
//! validate_points(&default_points()).unwrap();
//! assert!(validate_points(&[]).is_err());
//! ```

use std::collections::HashSet;

use crate::error::ValidationError;
use crate::types::PointDescriptor;
use crate::MAX_POINT_NAME_LEN;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// String Validators
// =============================================================================

/// Validates a point name.
///
/// ## Rules
/// - Must not be empty
/// - At most [`MAX_POINT_NAME_LEN`] characters
/// - Only letters, digits, `_`, `-` and `.`
///
/// ## Example
/// ```rust
/// use heitz_core::validation::validate_point_name;
///
/// assert!(validate_point_name("pool_temperature").is_ok());
/// assert!(validate_point_name("").is_err());
/// assert!(validate_point_name("pool temperature").is_err());
/// ```
pub fn validate_point_name(name: &str) -> ValidationResult<()> {
    if name.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "point name".to_string(),
        });
    }

    if name.chars().count() > MAX_POINT_NAME_LEN {
        return Err(ValidationError::TooLong {
            field: "point name".to_string(),
            max: MAX_POINT_NAME_LEN,
        });
    }

    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(ValidationError::InvalidFormat {
            field: "point name".to_string(),
            reason: format!(
                "'{}' must contain only letters, numbers, underscores, hyphens and dots",
                name
            ),
        });
    }

    Ok(())
}

// =============================================================================
// Numeric Validators
// =============================================================================

/// Validates that an interval or size setting is non-zero.
pub fn validate_positive(field: &str, value: u64) -> ValidationResult<()> {
    if value == 0 {
        return Err(ValidationError::MustBePositive {
            field: field.to_string(),
        });
    }

    Ok(())
}

// =============================================================================
// Collection Validators
// =============================================================================

/// Validates the configured point list.
///
/// ## Rules
/// - At least one point
/// - Every name passes [`validate_point_name`]
/// - Names are unique (they key every stored reading)
pub fn validate_points(points: &[PointDescriptor]) -> ValidationResult<()> {
    if points.is_empty() {
        return Err(ValidationError::Required {
            field: "points".to_string(),
        });
    }

    let mut seen = HashSet::with_capacity(points.len());
    for point in points {
        validate_point_name(&point.name)?;

        if !seen.insert(point.name.as_str()) {
            return Err(ValidationError::Duplicate {
                field: "point name".to_string(),
                value: point.name.clone(),
            });
        }
    }

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::default_points;

    #[test]
    fn test_validate_point_name() {
        assert!(validate_point_name("pool_ph").is_ok());
        assert!(validate_point_name("ahu-1.supply_temp").is_ok());

        assert!(validate_point_name("").is_err());
        assert!(validate_point_name("   ").is_err());
        assert!(validate_point_name("has space").is_err());
        assert!(validate_point_name(&"a".repeat(MAX_POINT_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_validate_positive() {
        assert!(validate_positive("batch_size", 1).is_ok());
        assert!(matches!(
            validate_positive("batch_size", 0),
            Err(ValidationError::MustBePositive { .. })
        ));
    }

    #[test]
    fn test_validate_points_rejects_empty_list() {
        assert!(matches!(
            validate_points(&[]),
            Err(ValidationError::Required { .. })
        ));
    }

    #[test]
    fn test_validate_points_rejects_duplicates() {
        let mut points = default_points();
        points.push(points[0].clone());

        match validate_points(&points) {
            Err(ValidationError::Duplicate { value, .. }) => assert_eq!(value, "pool_temperature"),
            other => panic!("expected duplicate error, got {:?}", other),
        }
    }

    #[test]
    fn test_default_catalogue_is_valid() {
        assert!(validate_points(&default_points()).is_ok());
    }
}
