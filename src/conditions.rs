//! Pump start/stop decision logic.
//!
//! A deployment arms up to three start conditions and three end conditions. Which of
//! them take part is decided once, when the [`ConditionEngine`] is built from a
//! [`DeploymentConfig`]; every sample afterwards is a pure evaluation against the
//! readings handed in, apart from the two anchor timestamps (dive start and pump
//! start) that the orchestrator latches exactly once each.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{ConfigPayload, PumpAction};

pub const MIN_DEPTH_M: f32 = 1.0;
pub const MAX_DEPTH_M: f32 = 300.0;
pub const MAX_TEMPERATURE_C: f32 = 125.0;
pub const ABS_ZERO_C: f32 = -273.15;
/// Floor used by [`ClogStrategy::Degradation`], in L/min.
pub const MIN_FLOWRATE_L_PER_MIN: f32 = 0.2;

/// Deployment parameters in device units (meters, °C, seconds, ticks).
/// A zero duration, volume or flow threshold leaves that condition disabled.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentConfig {
    pub target_depth_m: f32,
    pub depth_band_m: f32,
    pub target_temperature_c: f32,
    pub temperature_band_c: f32,
    pub wait_pump_start_secs: u32,
    pub min_flow_ticks_per_min: f32,
    pub max_pump_secs: u32,
    pub target_volume_ticks: u32,
    pub ticks_per_liter: f32,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        DeploymentConfig {
            target_depth_m: 0.0,
            depth_band_m: 0.0,
            target_temperature_c: ABS_ZERO_C,
            temperature_band_c: 0.0,
            wait_pump_start_secs: 0,
            min_flow_ticks_per_min: 0.0,
            max_pump_secs: 0,
            target_volume_ticks: 0,
            ticks_per_liter: 0.0,
        }
    }
}

impl From<&ConfigPayload> for DeploymentConfig {
    fn from(payload: &ConfigPayload) -> Self {
        let ticks_per_liter = payload
            .ticks_per_liter
            .filter(|v| v.is_finite() && *v > 0.0)
            .unwrap_or(0.0);

        DeploymentConfig {
            target_depth_m: payload.depth.unwrap_or(0.0) as f32,
            depth_band_m: payload.depth_band.unwrap_or(0.0) as f32,
            target_temperature_c: payload
                .temperature
                .map(|t| t as f32)
                .filter(|t| *t > ABS_ZERO_C)
                .unwrap_or(ABS_ZERO_C),
            temperature_band_c: payload.temp_band.unwrap_or(0.0) as f32,
            wait_pump_start_secs: minutes_to_secs(payload.wait_pump_start),
            min_flow_ticks_per_min: payload
                .min_flowrate
                .filter(|v| *v > 0.0)
                .map(|v| (v * ticks_per_liter) as f32)
                .unwrap_or(0.0),
            max_pump_secs: minutes_to_secs(payload.wait_pump_end),
            target_volume_ticks: payload
                .flow_volume
                .filter(|v| *v > 0.0)
                .map(|liters| counter_units(liters * ticks_per_liter, "flow volume"))
                .unwrap_or(0),
            ticks_per_liter: ticks_per_liter as f32,
        }
    }
}

fn minutes_to_secs(minutes: Option<f64>) -> u32 {
    minutes
        .filter(|m| *m > 0.0)
        .map(|m| counter_units(m * 60.0, "pump duration"))
        .unwrap_or(0)
}

/// Targets beyond the counter range are clamped below `u32::MAX`, which marks
/// a disabled condition.
fn counter_units(value: f64, what: &'static str) -> u32 {
    const LARGEST: u32 = u32::MAX - 1;
    if value.is_nan() {
        return 0;
    }
    if value > LARGEST as f64 {
        warn!(what, value, "Target exceeds the counter range, clamping");
        return LARGEST;
    }
    value as u32
}

/// How the minimum-flow end condition decides the filter is clogged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClogStrategy {
    /// Stop once the flow rate drops to the configured minimum.
    #[default]
    Threshold,
    /// Also stop below the absolute floor, or once flow falls under a tenth of baseline.
    Degradation,
}

/// Everything the engine needs to know about the current second.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readings {
    pub depth_m: f32,
    pub temperature_c: f32,
    pub now: u32,
    pub ticks: u32,
    /// Seconds the pump has spent running so far.
    pub pump_secs: u32,
    /// Ticks per minute.
    pub flow_rate: f32,
    pub baseline_flow_rate: Option<f32>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Anchors {
    dive_start: Option<u32>,
    pump_start: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartCondition {
    Depth,
    Temperature,
    WaitTime,
}

impl StartCondition {
    pub const ALL: [StartCondition; 3] = [
        StartCondition::Depth,
        StartCondition::Temperature,
        StartCondition::WaitTime,
    ];

    fn is_active(self, config: &DeploymentConfig) -> bool {
        match self {
            StartCondition::Depth => {
                (MIN_DEPTH_M..MAX_DEPTH_M).contains(&config.target_depth_m)
                    && config.depth_band_m > 0.0
            }
            StartCondition::Temperature => {
                config.target_temperature_c > ABS_ZERO_C
                    && config.target_temperature_c < MAX_TEMPERATURE_C
                    && config.temperature_band_c > 0.0
            }
            StartCondition::WaitTime => {
                config.wait_pump_start_secs > 0 && config.wait_pump_start_secs < u32::MAX
            }
        }
    }

    fn is_met(self, config: &DeploymentConfig, anchors: &Anchors, readings: &Readings) -> bool {
        match self {
            StartCondition::Depth => {
                (readings.depth_m - config.target_depth_m).abs() <= config.depth_band_m
            }
            StartCondition::Temperature => {
                (readings.temperature_c - config.target_temperature_c).abs()
                    <= config.temperature_band_c
            }
            StartCondition::WaitTime => anchors.dive_start.is_some_and(|start| {
                start <= readings.now && readings.now - start >= config.wait_pump_start_secs
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndCondition {
    Volume,
    Duration,
    MinFlow,
}

impl EndCondition {
    pub const ALL: [EndCondition; 3] = [
        EndCondition::Volume,
        EndCondition::Duration,
        EndCondition::MinFlow,
    ];

    fn is_active(self, config: &DeploymentConfig) -> bool {
        match self {
            EndCondition::Volume => {
                config.target_volume_ticks > 0 && config.target_volume_ticks < u32::MAX
            }
            EndCondition::Duration => config.max_pump_secs > 0 && config.max_pump_secs < u32::MAX,
            EndCondition::MinFlow => config.min_flow_ticks_per_min > 0.0,
        }
    }

    fn is_met(
        self,
        config: &DeploymentConfig,
        anchors: &Anchors,
        readings: &Readings,
        clog: ClogStrategy,
    ) -> bool {
        match self {
            EndCondition::Volume => readings.ticks >= config.target_volume_ticks,
            EndCondition::Duration => {
                anchors.pump_start.is_some_and(|start| start <= readings.now)
                    && readings.pump_secs >= config.max_pump_secs
            }
            EndCondition::MinFlow => {
                let Some(baseline) = readings.baseline_flow_rate.filter(|b| *b > 0.0) else {
                    return false;
                };
                let rate = readings.flow_rate;
                match clog {
                    ClogStrategy::Threshold => rate <= config.min_flow_ticks_per_min,
                    ClogStrategy::Degradation => {
                        let floor = MIN_FLOWRATE_L_PER_MIN * config.ticks_per_liter;
                        rate <= config.min_flow_ticks_per_min
                            || rate <= floor
                            || rate * 10.0 <= baseline
                    }
                }
            }
        }
    }
}

/// Evaluates the armed conditions of one deployment.
#[derive(Debug, Clone)]
pub struct ConditionEngine {
    config: DeploymentConfig,
    clog: ClogStrategy,
    start: Vec<StartCondition>,
    end: Vec<EndCondition>,
    anchors: Anchors,
}

impl ConditionEngine {
    pub fn new(config: DeploymentConfig, clog: ClogStrategy) -> Self {
        let start = StartCondition::ALL
            .into_iter()
            .filter(|c| c.is_active(&config))
            .collect();
        let end = EndCondition::ALL
            .into_iter()
            .filter(|c| c.is_active(&config))
            .collect();
        ConditionEngine {
            config,
            clog,
            start,
            end,
            anchors: Anchors::default(),
        }
    }

    /// A deployment can only be armed with a calibrated flow meter, at least one way
    /// to start the pump and at least one way to stop it.
    pub fn is_valid(&self) -> bool {
        self.config.ticks_per_liter > 0.0 && !self.start.is_empty() && !self.end.is_empty()
    }

    pub fn config(&self) -> &DeploymentConfig {
        &self.config
    }

    pub fn active_start(&self) -> &[StartCondition] {
        &self.start
    }

    pub fn active_end(&self) -> &[EndCondition] {
        &self.end
    }

    /// Latches the dive start. Returns `false` if it was already set.
    pub fn set_dive_start(&mut self, at: u32) -> bool {
        latch(&mut self.anchors.dive_start, at)
    }

    /// Latches the first pump start. Returns `false` if it was already set.
    pub fn set_pump_start(&mut self, at: u32) -> bool {
        latch(&mut self.anchors.pump_start, at)
    }

    pub fn dive_started(&self) -> bool {
        self.anchors.dive_start.is_some()
    }

    /// Stop conditions always win over a simultaneous start trigger.
    pub fn evaluate(&self, readings: &Readings) -> PumpAction {
        let trigger = self
            .start
            .iter()
            .any(|c| c.is_met(&self.config, &self.anchors, readings));
        let stop = self
            .end
            .iter()
            .any(|c| c.is_met(&self.config, &self.anchors, readings, self.clog));

        if trigger && !stop {
            PumpAction::On
        } else {
            PumpAction::Off
        }
    }
}

fn latch(slot: &mut Option<u32>, at: u32) -> bool {
    if slot.is_some() {
        return false;
    }
    *slot = Some(at);
    true
}
