//! # Point Sources
//!
//! Where point values come from. The poller only sees [`PointSource`]; which
//! implementation sits behind it is decided once, at startup.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   SensorPoller ──── read_point(&PointDescriptor) ────┐                 │
//! │                                                      ▼                 │
//! │                                   ┌──────────────────────────────────┐ │
//! │                                   │        dyn PointSource           │ │
//! │                                   └───────┬──────────────────┬───────┘ │
//! │                                           │                  │         │
//! │                    polling.simulate=false │                  │ true    │
//! │                                           ▼                  ▼         │
//! │                              ┌──────────────────┐  ┌──────────────────┐│
//! │                              │  BacnetSource    │  │ SimulatedSource  ││
//! │                              │  present-value + │  │ kind-based random││
//! │                              │  priority-array  │  │ values           ││
//! │                              └──────────────────┘  └──────────────────┘│
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod bacnet;
mod simulated;

pub use bacnet::BacnetSource;
pub use simulated::SimulatedSource;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use heitz_core::{PointDescriptor, PointSample};

use crate::config::AgentConfig;
use crate::error::{AgentResult, ReadError};

/// A fallible source of point values.
#[async_trait]
pub trait PointSource: Send + Sync {
    /// Short name for logs (`bacnet`, `simulated`).
    fn name(&self) -> &'static str;

    /// One-time startup step, run before the first tick.
    ///
    /// Failing here is fatal; sources that can degrade (a device that does
    /// not answer its probe) log and return `Ok`.
    async fn connect(&self) -> AgentResult<()> {
        Ok(())
    }

    /// Acquires the current value of one point.
    ///
    /// The caller bounds this with its own per-point timeout.
    async fn read_point(&self, point: &PointDescriptor) -> Result<PointSample, ReadError>;
}

/// Builds the source selected by `polling.simulate`.
///
/// ## Errors
/// Binding the BACnet socket is the only fallible step; it is fatal at
/// startup.
pub async fn build_source(config: &AgentConfig) -> AgentResult<Arc<dyn PointSource>> {
    if config.polling.simulate {
        info!("Running in simulation mode (no BACnet traffic)");
        return Ok(Arc::new(SimulatedSource::new()));
    }

    let source = BacnetSource::bind(&config.bacnet).await?;
    Ok(Arc::new(source))
}
