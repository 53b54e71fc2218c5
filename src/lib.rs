//! Polls an apcupsd-compatible NIS daemon and models its status report as a
//! fixed set of sensors.

pub mod nis;
pub mod sensor;
pub mod units;

pub use nis::{fetch, NisError, StatusRecord};
pub use sensor::{power_usage, SensorSpec, UpsPoller};
