//! Two-phase sensor layer on top of the NIS client.
//!
//! A discovery pass fixes the sensor set once, from a units-retained fetch;
//! steady-state polls strip units and only ever populate that fixed key set.
//! Keys the daemon starts reporting later are ignored rather than growing the
//! sensor set mid-flight.

use std::time::Duration;

use log::debug;

use crate::nis::{self, NisError, StatusRecord};
use crate::units::{self, DeviceClass};

/// One discovered status field and its display metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorSpec {
    pub key: String,
    pub unit: Option<&'static str>,
    pub device_class: Option<DeviceClass>,
}

/// Polls one daemon for the fixed sensor set established at discovery time.
///
/// Cloneable and shareable across tasks; every poll opens its own connection.
#[derive(Debug, Clone)]
pub struct UpsPoller {
    host: String,
    port: u16,
    timeout: Duration,
    sensors: Vec<SensorSpec>,
}

impl UpsPoller {
    /// Run the discovery pass: one units-retained fetch whose fields, units
    /// and device classes become the poller's sensor set.
    pub fn discover(host: &str, port: u16, timeout: Duration) -> Result<Self, NisError> {
        let record = nis::fetch(host, port, timeout, false)?;

        let sensors: Vec<SensorSpec> = record
            .iter()
            .map(|(key, value)| {
                let (_, unit) = units::split_unit(value);
                SensorSpec {
                    key: key.to_string(),
                    unit,
                    device_class: unit.and_then(units::device_class),
                }
            })
            .collect();

        debug!("discovered {} sensors from {host}:{port}", sensors.len());
        Ok(Self {
            host: host.to_string(),
            port,
            timeout,
            sensors,
        })
    }

    pub fn sensors(&self) -> &[SensorSpec] {
        &self.sensors
    }

    /// One units-stripped poll, restricted to the discovered key set.
    ///
    /// Any client error propagates unchanged so the caller can mark the
    /// affected sensors unavailable and decide its own retry policy.
    pub fn poll(&self) -> Result<StatusRecord, NisError> {
        let record = nis::fetch(&self.host, self.port, self.timeout, true)?;

        let mut filtered = StatusRecord::default();
        for spec in &self.sensors {
            if let Some(value) = record.get(&spec.key) {
                filtered.insert(spec.key.clone(), value.to_string());
            }
        }
        Ok(filtered)
    }
}

/// Derived load in watts: `LOADPCT * NOMPOWER / 100`.
///
/// Tolerates both retained and stripped values; `None` when either field is
/// missing or non-numeric.
pub fn power_usage(record: &StatusRecord) -> Option<f64> {
    let load: f64 = units::strip_unit(record.get("LOADPCT")?).parse().ok()?;
    let nominal: f64 = units::strip_unit(record.get("NOMPOWER")?).parse().ok()?;
    Some(load * nominal / 100.0)
}
