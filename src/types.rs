use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RecordError;

/// `GET /time/now`
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TimeNow {
    pub now: i64,
}

/// `GET /deployment/status/{deviceId}`
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DeploymentStatusPayload {
    pub status: u8,
    #[serde(default)]
    pub identity: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentStatus {
    Ready(String),
    NotReady,
}

impl From<DeploymentStatusPayload> for DeploymentStatus {
    fn from(payload: DeploymentStatusPayload) -> Self {
        match (payload.status, payload.identity) {
            (1, Some(identity)) if !identity.is_empty() => DeploymentStatus::Ready(identity),
            _ => DeploymentStatus::NotReady,
        }
    }
}

/// `GET /deployment/config/{identity}`, in the units the service stores:
/// meters, °C, minutes, L/min, minutes, liters and ticks/L. Unset fields come back
/// as `null` and disable the matching condition.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ConfigPayload {
    #[serde(default)]
    pub depth: Option<f64>,
    #[serde(default)]
    pub depth_band: Option<f64>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub temp_band: Option<f64>,
    #[serde(default)]
    pub wait_pump_start: Option<f64>,
    #[serde(default)]
    pub min_flowrate: Option<f64>,
    #[serde(default)]
    pub wait_pump_end: Option<f64>,
    #[serde(default)]
    pub flow_volume: Option<f64>,
    #[serde(default, rename = "ticks_per_L")]
    pub ticks_per_liter: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpAction {
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PumpState {
    #[default]
    Idle,
    Running,
}

/// One line of the per-deployment data file, taken once per second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleRecord {
    pub timestamp: u32,
    pub depth: f32,
    pub temperature: f32,
    pub ticks: u32,
    pub flow_rate: f32,
}

impl fmt::Display for SampleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{:.3},{:.3},{},{:.3}",
            self.timestamp, self.depth, self.temperature, self.ticks, self.flow_rate
        )
    }
}

impl FromStr for SampleRecord {
    type Err = RecordError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut fields = line.trim_end().split(',');
        let record = SampleRecord {
            timestamp: parse_field(fields.next(), "timestamp")?,
            depth: parse_field(fields.next(), "depth")?,
            temperature: parse_field(fields.next(), "temperature")?,
            ticks: parse_field(fields.next(), "ticks")?,
            flow_rate: parse_field(fields.next(), "flow_rate")?,
        };
        if let Some(extra) = fields.next() {
            return Err(RecordError::TrailingField(extra.to_string()));
        }
        Ok(record)
    }
}

fn parse_field<T: FromStr>(raw: Option<&str>, field: &'static str) -> Result<T, RecordError> {
    let raw = raw.ok_or(RecordError::MissingField(field))?;
    raw.trim().parse().map_err(|_| RecordError::InvalidField {
        field,
        value: raw.to_string(),
    })
}
