use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time;
use uuid::Uuid;

use crate::error::HardwareError;
use crate::flow::TickCounter;
use crate::hardware::{Environment, PumpActuator, Sensors, TagReader};

/// Descent, dwell at the bottom, ascent.
#[derive(Debug, Clone, Copy)]
pub struct DiveProfile {
    pub descent_m_per_s: f32,
    pub max_depth_m: f32,
    pub bottom_secs: f32,
    pub surface_temp_c: f32,
    pub bottom_temp_c: f32,
}

impl Default for DiveProfile {
    fn default() -> Self {
        DiveProfile {
            descent_m_per_s: 0.5,
            max_depth_m: 25.0,
            bottom_secs: 600.0,
            surface_temp_c: 18.0,
            bottom_temp_c: 9.0,
        }
    }
}

impl DiveProfile {
    fn depth_at(&self, secs: f32) -> f32 {
        let descent = self.max_depth_m / self.descent_m_per_s;
        if secs < descent {
            secs * self.descent_m_per_s
        } else if secs < descent + self.bottom_secs {
            self.max_depth_m
        } else {
            (self.max_depth_m - (secs - descent - self.bottom_secs) * self.descent_m_per_s).max(0.0)
        }
    }
}

/// Pressure/temperature sensor following a [`DiveProfile`] from its first read.
pub struct SimulatedSensors {
    profile: DiveProfile,
    started: Option<Instant>,
}

impl SimulatedSensors {
    pub fn new(profile: DiveProfile) -> Self {
        SimulatedSensors {
            profile,
            started: None,
        }
    }
}

impl Sensors for SimulatedSensors {
    fn init(&mut self) -> Result<(), HardwareError> {
        Ok(())
    }

    fn read(&mut self) -> Result<Environment, HardwareError> {
        let started = *self.started.get_or_insert_with(Instant::now);
        let depth = self.profile.depth_at(started.elapsed().as_secs_f32());
        let fraction = (depth / self.profile.max_depth_m).clamp(0.0, 1.0);
        let temperature = self.profile.surface_temp_c
            + (self.profile.bottom_temp_c - self.profile.surface_temp_c) * fraction;

        Ok(Environment {
            depth_m: (depth + (rand::random::<f32>() * 0.1) - 0.05).max(0.0),
            temperature_c: temperature + (rand::random::<f32>() * 0.2) - 0.1,
        })
    }
}

/// Pump whose state is visible to the simulated flow meter.
#[derive(Debug, Clone, Default)]
pub struct SimulatedPump {
    running: Arc<AtomicBool>,
}

impl SimulatedPump {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }
}

impl PumpActuator for SimulatedPump {
    fn set(&mut self, on: bool) -> Result<(), HardwareError> {
        self.running.store(on, Ordering::SeqCst);
        Ok(())
    }
}

/// Pulses `counter` while the pump runs. The rate starts at `pulses_per_sec` and
/// loses `clog_per_sec` of itself every second of pumping.
pub fn spawn_flow_meter(
    counter: Arc<TickCounter>,
    running: Arc<AtomicBool>,
    pulses_per_sec: f32,
    clog_per_sec: f32,
) -> JoinHandle<()> {
    const STEP: Duration = Duration::from_millis(100);
    let decay = (1.0 - clog_per_sec).clamp(0.0, 1.0).powf(STEP.as_secs_f32());

    tokio::spawn(async move {
        let mut interval = time::interval(STEP);
        let mut rate = pulses_per_sec;
        let mut owed = 0.0f32;
        loop {
            interval.tick().await;
            if !running.load(Ordering::SeqCst) {
                continue;
            }
            owed += rate * STEP.as_secs_f32();
            while owed >= 1.0 {
                counter.pulse();
                owed -= 1.0;
            }
            rate *= decay;
        }
    })
}

/// Presents a fresh tag after the operator has been "waiting" for a few polls.
#[derive(Debug)]
pub struct SimulatedTagReader {
    polls_until_attached: u32,
    tag: Option<String>,
}

impl SimulatedTagReader {
    pub fn new(polls_until_attached: u32) -> Self {
        SimulatedTagReader {
            polls_until_attached,
            tag: None,
        }
    }
}

impl TagReader for SimulatedTagReader {
    fn poll(&mut self) -> Option<String> {
        if self.polls_until_attached > 0 {
            self.polls_until_attached -= 1;
            return None;
        }
        let tag = self.tag.get_or_insert_with(|| {
            Uuid::new_v4().simple().to_string()[..8].to_uppercase()
        });
        Some(tag.clone())
    }
}
