//! Simulated point source for running without a BACnet network.
//!
//! Values are drawn from a range chosen by what the point measures, guessed
//! from its name and unit. Every sample carries a priority array with one
//! commanded slot at a common priority level.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;

use heitz_core::{PointDescriptor, PointSample, PRIORITY_LEVELS};

use crate::error::ReadError;
use crate::source::PointSource;

/// Priority levels a simulated command is written at.
const SIMULATED_PRIORITIES: [usize; 4] = [8, 10, 12, 16];

/// What a point measures, as far as the simulator is concerned.
#[derive(Debug, Clone, Copy, PartialEq)]
enum PointKind {
    Temperature,
    Ph,
    Chlorine,
    Pressure,
    Flow,
    Humidity,
    Status,
    Other,
}

impl PointKind {
    fn of(point: &PointDescriptor) -> Self {
        let name = point.name.to_lowercase();
        let unit = point.unit.to_lowercase();

        if point.object.object_type.is_binary() || name.contains("status") || unit == "status" {
            PointKind::Status
        } else if name.contains("temp") || unit.contains("°c") || unit.contains("celsius") {
            PointKind::Temperature
        } else if unit == "ph" || name.contains("_ph") {
            PointKind::Ph
        } else if name.contains("chlorine") || unit == "ppm" {
            PointKind::Chlorine
        } else if name.contains("pressure") || unit == "bar" || unit.contains("pascal") {
            PointKind::Pressure
        } else if name.contains("flow") || unit.contains("m³/h") {
            PointKind::Flow
        } else if name.contains("humidity") || unit.contains("percent") || unit == "%" {
            PointKind::Humidity
        } else {
            PointKind::Other
        }
    }

    /// Inclusive value range.
    fn range(self) -> (f64, f64) {
        match self {
            PointKind::Temperature => (20.0, 30.0),
            PointKind::Ph => (7.0, 7.8),
            PointKind::Chlorine => (1.0, 3.0),
            PointKind::Pressure => (1.0, 2.5),
            PointKind::Flow => (10.0, 50.0),
            PointKind::Humidity => (40.0, 60.0),
            PointKind::Status => (0.0, 1.0),
            PointKind::Other => (0.0, 100.0),
        }
    }
}

/// Generates plausible values for any configured point.
#[derive(Debug, Default)]
pub struct SimulatedSource;

impl SimulatedSource {
    pub fn new() -> Self {
        SimulatedSource
    }

    fn sample(point: &PointDescriptor) -> PointSample {
        let mut rng = rand::thread_rng();
        let kind = PointKind::of(point);

        let value = match kind {
            PointKind::Status => f64::from(u8::from(rng.gen_bool(0.5))),
            _ => {
                let (min, max) = kind.range();
                (rng.gen_range(min..=max) * 100.0).round() / 100.0
            }
        };

        let active = *SIMULATED_PRIORITIES.choose(&mut rng).unwrap_or(&PRIORITY_LEVELS);
        let mut priority_array = vec![None; PRIORITY_LEVELS];
        priority_array[active - 1] = Some(value);

        PointSample::new(value).with_priority_array(priority_array)
    }
}

#[async_trait]
impl PointSource for SimulatedSource {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn read_point(&self, point: &PointDescriptor) -> Result<PointSample, ReadError> {
        Ok(Self::sample(point))
    }
}
