//! # Domain Types
//!
//! Core domain types used throughout the reader.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │ PointDescriptor │   │   NewReading    │   │     Reading     │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  name (key)     │──►│  point_name     │──►│  id (queue)     │       │
//! │  │  object         │   │  value | error  │   │  ...NewReading  │       │
//! │  │  unit           │   │  timestamp      │   │  posted         │       │
//! │  │  description    │   │                 │   │                 │       │
//! │  └────────┬────────┘   └─────────────────┘   └─────────────────┘       │
//! │           │                 built by Poller      stored by Queue        │
//! │  ┌────────▼────────┐                                                    │
//! │  │ ObjectReference │  "analogInput:1" ◄──► (ObjectType, instance)      │
//! │  └─────────────────┘                                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Null Values
//! A failed read is a reading with `value = None` and `error = Some(..)`.
//! A sensor legitimately reporting `0.0` is `value = Some(0.0)`, `error = None`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::{MAX_OBJECT_INSTANCE, PRIORITY_LEVELS};

// =============================================================================
// Object Type
// =============================================================================

/// BACnet object types the reader knows how to address.
///
/// The numeric codes are the BACnet `BACnetObjectType` enumeration values
/// used when encoding an object identifier on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ObjectType {
    AnalogInput,
    AnalogOutput,
    AnalogValue,
    BinaryInput,
    BinaryOutput,
    BinaryValue,
    Device,
    MultiStateInput,
    MultiStateOutput,
    MultiStateValue,
}

impl ObjectType {
    /// Returns the BACnet object type code.
    pub const fn code(&self) -> u16 {
        match self {
            ObjectType::AnalogInput => 0,
            ObjectType::AnalogOutput => 1,
            ObjectType::AnalogValue => 2,
            ObjectType::BinaryInput => 3,
            ObjectType::BinaryOutput => 4,
            ObjectType::BinaryValue => 5,
            ObjectType::Device => 8,
            ObjectType::MultiStateInput => 13,
            ObjectType::MultiStateOutput => 14,
            ObjectType::MultiStateValue => 19,
        }
    }

    /// Looks up an object type by its BACnet code.
    pub const fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(ObjectType::AnalogInput),
            1 => Some(ObjectType::AnalogOutput),
            2 => Some(ObjectType::AnalogValue),
            3 => Some(ObjectType::BinaryInput),
            4 => Some(ObjectType::BinaryOutput),
            5 => Some(ObjectType::BinaryValue),
            8 => Some(ObjectType::Device),
            13 => Some(ObjectType::MultiStateInput),
            14 => Some(ObjectType::MultiStateOutput),
            19 => Some(ObjectType::MultiStateValue),
            _ => None,
        }
    }

    /// Returns the camelCase name used in config files (`analogInput`).
    pub const fn as_str(&self) -> &'static str {
        match self {
            ObjectType::AnalogInput => "analogInput",
            ObjectType::AnalogOutput => "analogOutput",
            ObjectType::AnalogValue => "analogValue",
            ObjectType::BinaryInput => "binaryInput",
            ObjectType::BinaryOutput => "binaryOutput",
            ObjectType::BinaryValue => "binaryValue",
            ObjectType::Device => "device",
            ObjectType::MultiStateInput => "multiStateInput",
            ObjectType::MultiStateOutput => "multiStateOutput",
            ObjectType::MultiStateValue => "multiStateValue",
        }
    }

    /// Returns true if objects of this type carry a priority array.
    ///
    /// Only outputs and values are commandable; inputs are read-only.
    pub const fn is_commandable(&self) -> bool {
        matches!(
            self,
            ObjectType::AnalogOutput
                | ObjectType::AnalogValue
                | ObjectType::BinaryOutput
                | ObjectType::BinaryValue
                | ObjectType::MultiStateOutput
                | ObjectType::MultiStateValue
        )
    }

    /// Returns true for binary (active/inactive) objects.
    pub const fn is_binary(&self) -> bool {
        matches!(
            self,
            ObjectType::BinaryInput | ObjectType::BinaryOutput | ObjectType::BinaryValue
        )
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectType {
    type Err = CoreError;

    /// Accepts `analogInput`, `analog-input`, `analog_input`, `ANALOG_INPUT`
    /// and the two-letter abbreviations (`ai`, `av`, `bv`, ...).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .flat_map(char::to_lowercase)
            .collect();

        match normalized.as_str() {
            "analoginput" | "ai" => Ok(ObjectType::AnalogInput),
            "analogoutput" | "ao" => Ok(ObjectType::AnalogOutput),
            "analogvalue" | "av" => Ok(ObjectType::AnalogValue),
            "binaryinput" | "bi" => Ok(ObjectType::BinaryInput),
            "binaryoutput" | "bo" => Ok(ObjectType::BinaryOutput),
            "binaryvalue" | "bv" => Ok(ObjectType::BinaryValue),
            "device" | "dev" => Ok(ObjectType::Device),
            "multistateinput" | "msi" => Ok(ObjectType::MultiStateInput),
            "multistateoutput" | "mso" => Ok(ObjectType::MultiStateOutput),
            "multistatevalue" | "msv" => Ok(ObjectType::MultiStateValue),
            _ => Err(CoreError::UnknownObjectType(s.to_string())),
        }
    }
}

// =============================================================================
// Object Reference
// =============================================================================

/// A (type, instance) pair addressing one object on the target device.
///
/// Serialized as the string form used in config files: `"analogInput:1"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectReference {
    pub object_type: ObjectType,
    pub instance: u32,
}

impl ObjectReference {
    /// Creates a reference, rejecting instances outside the 22-bit range.
    pub fn new(object_type: ObjectType, instance: u32) -> Result<Self, CoreError> {
        if instance > MAX_OBJECT_INSTANCE {
            return Err(CoreError::InvalidObjectReference {
                input: format!("{}:{}", object_type, instance),
                reason: format!("instance must be at most {}", MAX_OBJECT_INSTANCE),
            });
        }

        Ok(ObjectReference {
            object_type,
            instance,
        })
    }

    /// Reference to the Device object with the given instance.
    pub fn device(instance: u32) -> Result<Self, CoreError> {
        Self::new(ObjectType::Device, instance)
    }
}

impl fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.instance)
    }
}

impl FromStr for ObjectReference {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| CoreError::InvalidObjectReference {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        let (type_part, instance_part) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| invalid("expected <objectType>:<instance>"))?;

        let object_type: ObjectType = type_part.trim().parse()?;
        let instance: u32 = instance_part
            .trim()
            .parse()
            .map_err(|_| invalid("instance must be a non-negative integer"))?;

        ObjectReference::new(object_type, instance)
    }
}

impl TryFrom<String> for ObjectReference {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ObjectReference> for String {
    fn from(value: ObjectReference) -> Self {
        value.to_string()
    }
}

// =============================================================================
// Point Descriptor
// =============================================================================

/// Static description of one configured sensor point.
///
/// Created once when configuration loads and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointDescriptor {
    /// Unique key; stored on every reading as `point_name`.
    pub name: String,

    /// Object on the target device holding this point's present value.
    pub object: ObjectReference,

    /// Engineering unit (informational).
    #[serde(default)]
    pub unit: String,

    /// Human-readable description (informational).
    #[serde(default)]
    pub description: String,
}

impl PointDescriptor {
    pub fn new(
        name: impl Into<String>,
        object: ObjectReference,
        unit: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        PointDescriptor {
            name: name.into(),
            object,
            unit: unit.into(),
            description: description.into(),
        }
    }
}

// =============================================================================
// Point Sample
// =============================================================================

/// A value acquired from a point source, before it becomes a reading.
#[derive(Debug, Clone, PartialEq)]
pub struct PointSample {
    /// Present value.
    pub value: f64,

    /// Priority array for commandable objects (16 slots, `None` = NULL slot).
    pub priority_array: Option<Vec<Option<f64>>>,
}

impl PointSample {
    pub fn new(value: f64) -> Self {
        PointSample {
            value,
            priority_array: None,
        }
    }

    pub fn with_priority_array(mut self, priority_array: Vec<Option<f64>>) -> Self {
        self.priority_array = Some(priority_array);
        self
    }
}

/// Returns the active priority (1-based) of a priority array.
///
/// The active priority is the lowest-numbered slot holding a non-null value.
/// Only the first [`PRIORITY_LEVELS`] slots are considered.
///
/// ```rust
/// use heitz_core::active_priority;
///
/// let mut slots = vec![None; 16];
/// slots[7] = Some(21.5);
/// slots[15] = Some(20.0);
/// assert_eq!(active_priority(&slots), Some(8));
/// ```
pub fn active_priority(priority_array: &[Option<f64>]) -> Option<u8> {
    priority_array
        .iter()
        .take(PRIORITY_LEVELS)
        .position(Option::is_some)
        .map(|index| (index + 1) as u8)
}

// =============================================================================
// Readings
// =============================================================================

/// A reading produced by the poller, not yet assigned a queue id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewReading {
    pub point_name: String,
    /// `None` when the read failed; `error` then says why.
    pub value: Option<f64>,
    pub unit: String,
    pub error: Option<String>,
    pub priority_array: Option<Vec<Option<f64>>>,
    pub active_priority: Option<u8>,
    /// Acquisition instant, assigned by the poller once per tick.
    pub timestamp: DateTime<Utc>,
}

impl NewReading {
    /// Builds a successful reading from a sample.
    ///
    /// Non-finite values cannot be stored or sent as JSON, so they become
    /// failed readings instead.
    pub fn from_sample(
        point: &PointDescriptor,
        sample: PointSample,
        timestamp: DateTime<Utc>,
    ) -> Self {
        if !sample.value.is_finite() {
            return Self::failed(
                point,
                format!("non-finite value: {}", sample.value),
                timestamp,
            );
        }

        let active_priority = sample.priority_array.as_deref().and_then(active_priority);

        NewReading {
            point_name: point.name.clone(),
            value: Some(sample.value),
            unit: point.unit.clone(),
            error: None,
            priority_array: sample.priority_array,
            active_priority,
            timestamp,
        }
    }

    /// Builds the null-valued reading recorded when a point read fails.
    pub fn failed(
        point: &PointDescriptor,
        error: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        NewReading {
            point_name: point.name.clone(),
            value: None,
            unit: point.unit.clone(),
            error: Some(error.into()),
            priority_array: None,
            active_priority: None,
            timestamp,
        }
    }

    /// Returns true if this reading records a failed read.
    pub fn is_failure(&self) -> bool {
        self.value.is_none()
    }
}

/// A reading as stored in the local queue.
///
/// Immutable except for `posted`, which moves from false to true exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Monotonically increasing surrogate key assigned on insert.
    pub id: i64,
    pub point_name: String,
    pub value: Option<f64>,
    pub unit: String,
    pub error: Option<String>,
    pub priority_array: Option<Vec<Option<f64>>>,
    pub active_priority: Option<u8>,
    pub timestamp: DateTime<Utc>,
    pub posted: bool,
    pub posted_at: Option<DateTime<Utc>>,
}

impl Reading {
    pub fn is_failure(&self) -> bool {
        self.value.is_none()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn point() -> PointDescriptor {
        PointDescriptor::new(
            "pool_temperature",
            "analogInput:1".parse().unwrap(),
            "°C",
            "Pool Water Temperature",
        )
    }

    #[test]
    fn test_object_type_parsing_variants() {
        assert_eq!("analogInput".parse::<ObjectType>().unwrap(), ObjectType::AnalogInput);
        assert_eq!("analog-value".parse::<ObjectType>().unwrap(), ObjectType::AnalogValue);
        assert_eq!("BINARY_VALUE".parse::<ObjectType>().unwrap(), ObjectType::BinaryValue);
        assert_eq!("msv".parse::<ObjectType>().unwrap(), ObjectType::MultiStateValue);
        assert!("thermostat".parse::<ObjectType>().is_err());
    }

    #[test]
    fn test_object_type_codes_round_trip() {
        for object_type in [
            ObjectType::AnalogInput,
            ObjectType::BinaryValue,
            ObjectType::Device,
            ObjectType::MultiStateValue,
        ] {
            assert_eq!(ObjectType::from_code(object_type.code()), Some(object_type));
        }
        assert_eq!(ObjectType::from_code(7), None);
    }

    #[test]
    fn test_commandable_types() {
        assert!(!ObjectType::AnalogInput.is_commandable());
        assert!(ObjectType::AnalogValue.is_commandable());
        assert!(ObjectType::BinaryOutput.is_commandable());
        assert!(!ObjectType::Device.is_commandable());
    }

    #[test]
    fn test_object_reference_parse_and_display() {
        let object: ObjectReference = "analogValue: 58317".parse().unwrap();
        assert_eq!(object.object_type, ObjectType::AnalogValue);
        assert_eq!(object.instance, 58317);
        assert_eq!(object.to_string(), "analogValue:58317");
    }

    #[test]
    fn test_object_reference_rejects_bad_input() {
        assert!("analogInput".parse::<ObjectReference>().is_err());
        assert!("analogInput:-1".parse::<ObjectReference>().is_err());
        assert!("analogInput:4194304".parse::<ObjectReference>().is_err());
        assert!("pump:1".parse::<ObjectReference>().is_err());
    }

    #[test]
    fn test_point_descriptor_deserializes_object_string() {
        let json = r#"{"name":"pool_ph","object":"analogInput:2","unit":"pH"}"#;
        let point: PointDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(point.object.instance, 2);
        assert_eq!(point.description, "");

        let bad = r#"{"name":"pool_ph","object":"nope"}"#;
        assert!(serde_json::from_str::<PointDescriptor>(bad).is_err());
    }

    #[test]
    fn test_active_priority() {
        assert_eq!(active_priority(&[None; 16]), None);

        let mut slots = vec![None; 16];
        slots[15] = Some(1.0);
        assert_eq!(active_priority(&slots), Some(16));

        slots[0] = Some(0.0);
        assert_eq!(active_priority(&slots), Some(1));
    }

    #[test]
    fn test_zero_value_is_not_a_failure() {
        let reading = NewReading::from_sample(&point(), PointSample::new(0.0), Utc::now());
        assert_eq!(reading.value, Some(0.0));
        assert!(reading.error.is_none());
        assert!(!reading.is_failure());
    }

    #[test]
    fn test_failed_reading_carries_error_marker() {
        let reading = NewReading::failed(&point(), "timeout", Utc::now());
        assert!(reading.is_failure());
        assert_eq!(reading.error.as_deref(), Some("timeout"));
        assert_eq!(reading.unit, "°C");
    }

    #[test]
    fn test_non_finite_sample_becomes_failure() {
        let reading = NewReading::from_sample(&point(), PointSample::new(f64::NAN), Utc::now());
        assert!(reading.is_failure());
        assert!(reading.error.unwrap().contains("non-finite"));
    }

    #[test]
    fn test_sample_priority_array_sets_active_priority() {
        let mut slots = vec![None; 16];
        slots[9] = Some(24.0);
        let sample = PointSample::new(24.0).with_priority_array(slots);

        let reading = NewReading::from_sample(&point(), sample, Utc::now());
        assert_eq!(reading.active_priority, Some(10));
        assert_eq!(reading.priority_array.unwrap().len(), 16);
    }
}
