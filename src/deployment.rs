//! Device lifecycle: identity, configuration, sampling and completion.
//!
//! Once armed, every one-second snapshot goes through [`DeploymentStateMachine::on_sample`],
//! which logs the record, feeds the [`ConditionEngine`] and actuates the pump only on
//! a change of decision.

use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::clock::SampleSnapshot;
use crate::conditions::{ConditionEngine, Readings};
use crate::error::DeploymentError;
use crate::flow::FlowRateEstimator;
use crate::hardware::{Environment, PumpActuator};
use crate::storage::{self, DataLog, DiagnosticLog};
use crate::types::{PumpAction, PumpState, SampleRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingIdentity,
    AwaitingConfiguration,
    Sampling,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingSettings {
    /// Depth at which the device counts as submerged.
    pub surface_depth_m: f32,
    /// Seconds of pumping before the baseline flow rate is taken.
    pub baseline_delay_secs: u32,
    /// Consecutive readings above `surface_depth_m` that end a dive.
    pub surface_confirm_samples: u32,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        SamplingSettings {
            surface_depth_m: 2.0,
            baseline_delay_secs: 10,
            surface_confirm_samples: 3,
        }
    }
}

pub struct DeploymentStateMachine<P> {
    phase: Phase,
    identity: Option<String>,
    engine: Option<ConditionEngine>,
    flow: FlowRateEstimator,
    pump: P,
    pump_state: PumpState,
    pump_secs: u32,
    last_timestamp: Option<u32>,
    surface_streak: u32,
    settings: SamplingSettings,
    data_dir: PathBuf,
    data: Option<DataLog>,
    diagnostics: DiagnosticLog,
}

impl<P: PumpActuator> DeploymentStateMachine<P> {
    pub fn new(
        pump: P,
        settings: SamplingSettings,
        data_dir: impl Into<PathBuf>,
        diagnostics: DiagnosticLog,
    ) -> Self {
        DeploymentStateMachine {
            phase: Phase::AwaitingIdentity,
            identity: None,
            engine: None,
            flow: FlowRateEstimator::new(),
            pump,
            pump_state: PumpState::Idle,
            pump_secs: 0,
            last_timestamp: None,
            surface_streak: 0,
            settings,
            data_dir: data_dir.into(),
            data: None,
            diagnostics,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn pump_state(&self) -> PumpState {
        self.pump_state
    }

    pub fn baseline_flow_rate(&self) -> Option<f32> {
        self.flow.baseline()
    }

    pub fn identity_acquired(&mut self, identity: String, now: u32) -> Result<(), DeploymentError> {
        self.expect_phase(Phase::AwaitingIdentity, "acquire an identity")?;
        if !storage::is_safe_identity(&identity) {
            return Err(DeploymentError::InvalidIdentity(identity));
        }
        info!(identity = %identity, "Deployment identity acquired");
        self.note(now, format_args!("Deployment identity {identity}"));
        self.identity = Some(identity);
        self.phase = Phase::AwaitingConfiguration;
        Ok(())
    }

    /// Arms the device with a validated engine and starts the data file.
    pub fn arm(&mut self, engine: ConditionEngine, now: u32) -> Result<(), DeploymentError> {
        self.expect_phase(Phase::AwaitingConfiguration, "arm")?;
        if !engine.is_valid() {
            return Err(DeploymentError::InvalidConfig);
        }
        let identity = self.identity.as_deref().unwrap_or_default();
        let data = DataLog::open(&self.data_dir, identity)?;
        info!(
            identity,
            start = ?engine.active_start(),
            end = ?engine.active_end(),
            file = %data.path().display(),
            "Deployment armed"
        );
        self.note(now, format_args!("Deployed with {:?}", engine.config()));
        self.data = Some(data);
        self.engine = Some(engine);
        self.phase = Phase::Sampling;
        Ok(())
    }

    /// Handles one snapshot: records it and, while sampling, drives the pump.
    pub fn on_sample(
        &mut self,
        snapshot: SampleSnapshot,
        environment: Environment,
    ) -> Result<SampleRecord, DeploymentError> {
        if !matches!(self.phase, Phase::Sampling | Phase::Complete) {
            return Err(DeploymentError::InvalidTransition {
                from: self.phase,
                event: "take a sample",
            });
        }

        let now = snapshot.timestamp;
        let rate = self.flow.record(now, snapshot.ticks);
        if self.pump_state == PumpState::Running {
            if let Some(previous) = self.last_timestamp {
                self.pump_secs = self.pump_secs.saturating_add(now.saturating_sub(previous));
            }
        }
        self.last_timestamp = Some(now);

        let record = SampleRecord {
            timestamp: now,
            depth: environment.depth_m,
            temperature: environment.temperature_c,
            ticks: snapshot.ticks,
            flow_rate: rate.unwrap_or(0.0),
        };
        if let Some(data) = self.data.as_mut() {
            if let Err(e) = data.append(&record) {
                error!(error = %e, "Failed to append sample to data file");
            }
        }

        if self.phase == Phase::Sampling {
            self.control(&record)?;
        }
        Ok(record)
    }

    /// Switches the pump off ahead of a power-down.
    pub fn shutdown(&mut self, now: u32) -> Result<(), DeploymentError> {
        self.apply(PumpAction::Off, now)
    }

    fn control(&mut self, record: &SampleRecord) -> Result<(), DeploymentError> {
        let now = record.timestamp;
        let surface = self.settings.surface_depth_m;
        let Some(engine) = self.engine.as_mut() else {
            return Ok(());
        };

        if record.depth >= surface {
            self.surface_streak = 0;
            if engine.set_dive_start(now) {
                info!(depth = record.depth, "Dive started");
                self.note(now, "Dive started");
            }
        } else if engine.dive_started() {
            self.surface_streak += 1;
        }

        if self.surface_streak >= self.settings.surface_confirm_samples.max(1) {
            self.apply(PumpAction::Off, now)?;
            self.phase = Phase::Complete;
            info!(depth = record.depth, ticks = record.ticks, "Left the water, deployment complete");
            self.note(now, format_args!("Deployment complete after {} ticks", record.ticks));
            return Ok(());
        }

        if self.pump_state == PumpState::Running
            && self.pump_secs >= self.settings.baseline_delay_secs
            && self.flow.capture_baseline()
        {
            info!(baseline = ?self.flow.baseline(), "Baseline flow rate captured");
        }

        let readings = Readings {
            depth_m: record.depth,
            temperature_c: record.temperature,
            now,
            ticks: record.ticks,
            pump_secs: self.pump_secs,
            flow_rate: record.flow_rate,
            baseline_flow_rate: self.flow.baseline(),
        };
        let action = match self.engine.as_ref() {
            Some(engine) => engine.evaluate(&readings),
            None => PumpAction::Off,
        };
        self.apply(action, now)
    }

    /// Actuates only when the decision differs from the current pump state.
    fn apply(&mut self, action: PumpAction, now: u32) -> Result<(), DeploymentError> {
        match (action, self.pump_state) {
            (PumpAction::On, PumpState::Idle) => {
                self.pump.set(true)?;
                self.pump_state = PumpState::Running;
                if let Some(engine) = self.engine.as_mut() {
                    engine.set_pump_start(now);
                }
                info!(now, pump_secs = self.pump_secs, "Pump on");
                self.note(now, "Pump on");
            }
            (PumpAction::Off, PumpState::Running) => {
                self.pump.set(false)?;
                self.pump_state = PumpState::Idle;
                info!(now, pump_secs = self.pump_secs, "Pump off");
                self.note(now, "Pump off");
            }
            _ => {}
        }
        Ok(())
    }

    fn expect_phase(&self, phase: Phase, event: &'static str) -> Result<(), DeploymentError> {
        if self.phase == phase {
            Ok(())
        } else {
            Err(DeploymentError::InvalidTransition {
                from: self.phase,
                event,
            })
        }
    }

    fn note(&self, now: u32, message: impl std::fmt::Display) {
        if let Err(e) = self.diagnostics.append(now, message) {
            warn!(error = %e, "Failed to write diagnostic log");
        }
    }
}
