//! Built-in point catalogue for the aquatic centre plant room.
//!
//! Used when the configuration file declares no `[[points]]`.

use crate::types::{ObjectReference, ObjectType, PointDescriptor};

/// (name, instance, unit, description) for each analog input on the target
/// controller.
const CATALOGUE: &[(&str, u32, &str, &str)] = &[
    ("pool_temperature", 1, "°C", "Pool Water Temperature"),
    ("pool_ph", 2, "pH", "Pool pH Level"),
    ("chlorine_level", 3, "ppm", "Chlorine Concentration"),
    ("water_pressure", 4, "bar", "Water Pressure"),
    ("flow_rate", 5, "m³/h", "Water Flow Rate"),
];

/// Returns the default point list.
pub fn default_points() -> Vec<PointDescriptor> {
    CATALOGUE
        .iter()
        .map(|&(name, instance, unit, description)| {
            PointDescriptor::new(
                name,
                ObjectReference {
                    object_type: ObjectType::AnalogInput,
                    instance,
                },
                unit,
                description,
            )
        })
        .collect()
}
