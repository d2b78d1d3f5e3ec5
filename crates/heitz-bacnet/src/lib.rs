//! # heitz-bacnet: BACnet/IP ReadProperty / WriteProperty Client
//!
//! The reader talks to exactly one device. The service loop only reads;
//! the commissioning commands also write and relinquish present values.
//! This crate carries just that slice of BACnet/IP.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  heitz-agent: BacnetSource (PointSource impl), reader write/release    │
//! │       │  read_present_value / read_priority_array / probe_device       │
//! │       │  write_present_value / relinquish                              │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                  heitz-bacnet (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌────────────────────┐        ┌────────────────────────┐     │   │
//! │  │   │     client.rs      │        │       codec.rs         │     │   │
//! │  │   │  UDP socket        │───────►│  BVLC / NPDU / APDU    │     │   │
//! │  │   │  invoke ids        │        │  Read/WriteProperty    │     │   │
//! │  │   │  timeouts          │◄───────│  Simple/Complex-ACK    │     │   │
//! │  │   └────────────────────┘        └────────────────────────┘     │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼  UDP 47808                                                      │
//! │  Target device (e.g. device 100 on the plant-room controller)          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust,ignore
//! use heitz_bacnet::{BacnetClient, BacnetClientConfig};
//!
//! let config = BacnetClientConfig::new(local, target, 100);
//! let client = BacnetClient::bind(config).await?;
//! let name = client.probe_device().await?;
//! let value = client.read_present_value("analogInput:1".parse()?).await?;
//! client.write_present_value("analogValue:3".parse()?, 21.5, 16).await?;
//! ```

pub mod client;
pub mod codec;
pub mod error;

pub use client::{BacnetClient, BacnetClientConfig};
pub use codec::{BacnetValue, PropertyIdentifier, ReadPropertyRequest, WritePropertyRequest};
pub use error::{BacnetError, BacnetResult};

/// Standard BACnet/IP UDP port (0xBAC0).
pub const DEFAULT_PORT: u16 = 47808;
