use std::time::Duration;
use tokio::time;
use tracing::{error, info, warn};

use crate::conditions::{ABS_ZERO_C, MAX_DEPTH_M, MAX_TEMPERATURE_C};
use crate::error::HardwareError;

/// Depth and temperature as read from the pressure/temperature sensor.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Environment {
    pub depth_m: f32,
    pub temperature_c: f32,
}

impl Environment {
    /// Rejects readings the sensor cannot physically produce.
    pub fn checked(self, device: &'static str) -> Result<Self, HardwareError> {
        let reason = if !self.depth_m.is_finite() || self.depth_m > MAX_DEPTH_M {
            format!("depth {} m out of range", self.depth_m)
        } else if !(ABS_ZERO_C..=MAX_TEMPERATURE_C).contains(&self.temperature_c) {
            format!("temperature {} C out of range", self.temperature_c)
        } else {
            return Ok(self);
        };
        Err(HardwareError::Read { device, reason })
    }
}

pub trait Sensors {
    fn init(&mut self) -> Result<(), HardwareError>;
    fn read(&mut self) -> Result<Environment, HardwareError>;
}

pub trait PumpActuator {
    fn set(&mut self, on: bool) -> Result<(), HardwareError>;
}

/// Reader for the tag the operator attaches to identify a new deployment.
pub trait TagReader {
    fn poll(&mut self) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    PoweredOn,
    Uploading,
    AwaitingTag,
    AwaitingConfiguration,
    Deployed,
    Complete,
    Error,
}

pub trait StatusIndicator {
    fn show(&mut self, status: Status);
}

/// Reports status changes through the log in place of LEDs.
#[derive(Debug, Default)]
pub struct LogIndicator {
    current: Option<Status>,
}

impl StatusIndicator for LogIndicator {
    fn show(&mut self, status: Status) {
        if self.current == Some(status) {
            return;
        }
        self.current = Some(status);
        match status {
            Status::Error => error!(?status, "Status"),
            _ => info!(?status, "Status"),
        }
    }
}

/// Brings up a sensor, giving it `attempts` tries `delay` apart.
pub async fn init_with_retry<S: Sensors>(
    sensors: &mut S,
    device: &'static str,
    attempts: u32,
    delay: Duration,
) -> Result<(), HardwareError> {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match sensors.init() {
            Ok(()) => {
                info!(device, attempt, "Sensor initialised");
                return Ok(());
            }
            Err(e) => {
                warn!(device, attempt, error = %e, "Sensor init failed");
                if attempt < attempts {
                    time::sleep(delay).await;
                }
            }
        }
    }
    Err(HardwareError::InitFailed { device, attempts })
}
