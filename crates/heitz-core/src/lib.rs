//! # heitz-core: Domain Types for the Point Reader
//!
//! Everything the reader knows about sensor points and readings, as pure
//! types with zero I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Heitz Reader Architecture                        │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    heitz-agent (periodic tasks)                 │   │
//! │  │    Poller ──► Queue ◄── SyncAgent ──► Backend API               │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ heitz-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌─────────────────┐  ┌─────────────┐  ┌─────────────────┐   │   │
//! │  │   │      types      │  │   points    │  │   validation    │   │   │
//! │  │   │ ObjectReference │  │  catalogue  │  │  point lists    │   │   │
//! │  │   │ PointDescriptor │  │             │  │  object refs    │   │   │
//! │  │   │ Reading         │  │             │  │                 │   │   │
//! │  │   └─────────────────┘  └─────────────┘  └─────────────────┘   │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK                             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Object references, point descriptors, readings
//! - [`points`] - Built-in point catalogue for the aquatic centre plant room
//! - [`error`] - Domain error types
//! - [`validation`] - Point list validation (fail-fast at startup)
//!
//! ## Example Usage
//!
//! ```rust
//! use heitz_core::{ObjectReference, ObjectType};
//!
//! let object: ObjectReference = "analogInput:1".parse().unwrap();
//! assert_eq!(object.object_type, ObjectType::AnalogInput);
//! assert_eq!(object.instance, 1);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod points;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, ValidationError};
pub use points::default_points;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Number of slots in a BACnet priority array.
pub const PRIORITY_LEVELS: usize = 16;

/// Largest valid BACnet object instance number (22-bit field).
pub const MAX_OBJECT_INSTANCE: u32 = 0x3F_FFFF;

/// Maximum length of a point name.
pub const MAX_POINT_NAME_LEN: usize = 64;
