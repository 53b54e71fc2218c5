//! Unit vocabulary for NIS status fields.
//!
//! Values come off the wire as `<scalar> <unit>` with the unit drawn from a
//! small fixed set. These tables are pure lookups shared by the client's
//! strip-units mode and the sensor discovery pass.

/// All supported units that can appear as a value suffix
pub const ALL_UNITS: &[&str] = &[
    "Minutes",
    "Seconds",
    "Percent",
    "Volts",
    "Watts",
    "Amps",
    "Hz",
    "C",
    "VA",
    "Percent Load Capacity",
];

/// Semantic class of a sensor, keyed off its unit token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Power,
    Voltage,
    Current,
}

pub fn device_class(unit: &str) -> Option<DeviceClass> {
    match unit {
        "Watts" => Some(DeviceClass::Power),
        "Volts" => Some(DeviceClass::Voltage),
        "Amps" => Some(DeviceClass::Current),
        _ => None,
    }
}

/// Display symbol for a unit token, for units that have a conventional one.
pub fn symbol(unit: &str) -> Option<&'static str> {
    match unit {
        "Volts" => Some("V"),
        "Watts" => Some("W"),
        "Amps" => Some("A"),
        "Percent" => Some("%"),
        "Minutes" => Some("min"),
        "Seconds" => Some("s"),
        _ => None,
    }
}

/// Split a raw field value into its scalar part and trailing unit token.
pub fn split_unit(value: &str) -> (&str, Option<&'static str>) {
    for unit in ALL_UNITS.iter().copied() {
        if let Some(scalar) = value.strip_suffix(unit) {
            // Require the space before the unit so bare tokens survive.
            if let Some(scalar) = scalar.strip_suffix(' ') {
                return (scalar, Some(unit));
            }
        }
    }
    (value, None)
}

/// Remove a trailing unit token, if any. Idempotent.
pub fn strip_unit(value: &str) -> &str {
    split_unit(value).0
}
