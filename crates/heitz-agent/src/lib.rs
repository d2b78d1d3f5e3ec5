//! # heitz-agent: Periodic Tasks for the Point Reader
//!
//! Polls sensor points into the local queue and syncs them to the backend,
//! alongside a heartbeat and an update check.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Reader Service Tasks                             │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                  ReaderService (service.rs)                      │  │
//! │  │  health check, source connect, spawn tasks, ordered shutdown     │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │     ┌──────────────┬──────────┴────────┬──────────────────┐            │
//! │     ▼              ▼                   ▼                  ▼             │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────────────┐  ┌─────────────┐     │
//! │  │ Sensor   │  │ Sync     │  │ Liveness         │  │ Update      │     │
//! │  │ Poller   │  │ Agent    │  │ Reporter         │  │ Agent       │     │
//! │  │          │  │          │  │                  │  │             │     │
//! │  │ every    │  │ every    │  │ every            │  │ every       │     │
//! │  │ 30 s     │  │ 5 min    │  │ 5 min            │  │ 5 min       │     │
//! │  └────┬─────┘  └────┬─────┘  └────────┬─────────┘  └──────┬──────┘     │
//! │       │             │                 │                   │            │
//! │       ▼             ▼                 └─────────┬─────────┘            │
//! │  PointSource   ReadingQueue ─────► RemoteApi ◄──┘                      │
//! │  (bacnet or    (heitz-db)          (HTTP, reqwest)                     │
//! │   simulated)                                                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`config`] - `AgentConfig`: defaults, TOML file, environment overrides
//! - [`error`] - `AgentError`, plus per-point `ReadError` and `ApiError`
//! - [`source`] - `PointSource` with BACnet and simulated implementations
//! - [`poller`] - Sensor poller
//! - [`api`] - `RemoteApi` and its HTTP client
//! - [`sync`] - Sync agent
//! - [`heartbeat`] - Liveness reporter
//! - [`update`] - Update agent
//! - [`service`] - Task orchestration

// =============================================================================
// Module Declarations
// =============================================================================

pub mod api;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod poller;
pub mod service;
pub mod source;
pub mod sync;
pub mod update;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::{AckSet, HttpApiClient, RemoteApi, UpdateStatus};
pub use config::AgentConfig;
pub use error::{AgentError, AgentResult, ApiError, ReadError};
pub use heartbeat::{LivenessReporter, LivenessReporterHandle};
pub use poller::{SensorPoller, SensorPollerHandle, TickSummary};
pub use service::ReaderService;
pub use source::{build_source, BacnetSource, PointSource, SimulatedSource};
pub use sync::{SyncAgent, SyncAgentHandle, SyncReport};
pub use update::{UpdateAgent, UpdateAgentHandle, UpdateCheck, UpdateTrigger};
