use anyhow::{Context, Result};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SampleClock, SampleSlot, SyncedClock};
use crate::config::Config;
use crate::deployment::{DeploymentStateMachine, Phase};
use crate::error::UplinkError;
use crate::flow::TickCounter;
use crate::hardware::{self, PumpActuator, Sensors, Status, StatusIndicator, TagReader};
use crate::net::{Transport, UplinkClient};
use crate::storage::{self, DiagnosticLog};
use crate::types::DeploymentStatus;

pub struct Devices<S, P, R, I> {
    pub sensors: S,
    pub pump: P,
    pub tags: R,
    pub status: I,
}

/// Power-up to power-down: bring up the sensor, sync time, flush what the last
/// deployment left behind, obtain an identity and configuration, then sample.
pub async fn run<T, S, P, R, I>(
    config: &Config,
    uplink: UplinkClient<T>,
    devices: Devices<S, P, R, I>,
    counter: Arc<TickCounter>,
    shutdown: impl Future<Output = ()>,
) -> Result<()>
where
    T: Transport,
    S: Sensors,
    P: PumpActuator,
    R: TagReader,
    I: StatusIndicator,
{
    let Devices {
        mut sensors,
        pump,
        mut tags,
        mut status,
    } = devices;
    status.show(Status::PoweredOn);
    storage::init(&config.data_dir).context("preparing data directory")?;

    if let Err(e) = hardware::init_with_retry(
        &mut sensors,
        "pressure sensor",
        config.hardware_init_attempts,
        config.hardware_init_delay(),
    )
    .await
    {
        status.show(Status::Error);
        error!(error = %e, "Hardware initialisation failed, halting");
        return Err(e.into());
    }

    let clock = SyncedClock::new();
    clock.set(uplink.get_time_now().await?);

    let diagnostics = DiagnosticLog::new(&config.data_dir);
    status.show(Status::Uploading);
    let drained = drain_leftovers(&uplink, &config.data_dir, &diagnostics, &clock).await?;
    info!(drained, "Leftover data drained");
    note(&diagnostics, &clock, "Powered on");

    let mut machine = DeploymentStateMachine::new(
        pump,
        config.sampling_settings(),
        &config.data_dir,
        diagnostics.clone(),
    );

    status.show(Status::AwaitingTag);
    let poll_interval = config.retry_policy().interval;
    let identity = acquire_identity(&uplink, &mut tags, poll_interval).await?;
    machine.identity_acquired(identity.clone(), clock.now())?;

    status.show(Status::AwaitingConfiguration);
    let engine = uplink
        .poll_configuration(&identity, config.clog_strategy)
        .await?;
    machine.arm(engine, clock.now())?;
    status.show(Status::Deployed);

    let slot = Arc::new(SampleSlot::new());
    let timer = SampleClock::new(Arc::clone(&counter), clock.clone(), Arc::clone(&slot), config.sample_period()).spawn();
    let result = sample_loop(&mut machine, &mut sensors, &slot, &mut status, shutdown).await;
    timer.abort();

    machine.shutdown(clock.now())?;
    info!(ticks = counter.load(), phase = ?machine.phase(), "Powered down");
    note(&diagnostics, &clock, "Powered down");
    result
}

/// Uploads every data file an earlier deployment left behind, then the
/// diagnostic log under the most recent of those deployments.
pub async fn drain_leftovers<T: Transport>(
    uplink: &UplinkClient<T>,
    dir: &Path,
    diagnostics: &DiagnosticLog,
    clock: &impl Clock,
) -> Result<usize, UplinkError> {
    let leftovers = storage::leftover_data(dir, uplink.chunk_size())?;
    for leftover in &leftovers {
        uplink.upload_data(&leftover.identity, &leftover.job).await?;
        note(diagnostics, clock, format_args!("Uploaded data of {}", leftover.identity));
    }

    match (leftovers.last(), storage::leftover_log(dir, uplink.chunk_size())?) {
        (Some(latest), Some(job)) => uplink.upload_log(&latest.identity, &job).await?,
        (None, Some(_)) => debug!(
            log = %diagnostics.path().display(),
            "No deployment to attach the diagnostic log to, keeping it"
        ),
        _ => {}
    }
    Ok(leftovers.len())
}

/// Waits until the service reports a deployment for this device, or the operator
/// attaches a tag which is then registered as the new deployment.
pub async fn acquire_identity<T: Transport, R: TagReader>(
    uplink: &UplinkClient<T>,
    tags: &mut R,
    interval: Duration,
) -> Result<String, UplinkError> {
    loop {
        if let DeploymentStatus::Ready(identity) = uplink.poll_deployment_status().await? {
            if storage::is_safe_identity(&identity) {
                info!(identity = %identity, "Service already holds a deployment");
                return Ok(identity);
            }
            warn!(identity = %identity, "Ignoring unusable deployment identity");
        }
        match tags.poll() {
            Some(tag) if storage::is_safe_identity(&tag) => {
                info!(tag = %tag, "Tag attached");
                uplink.register_deployment(&tag).await?;
                return Ok(tag);
            }
            Some(tag) => warn!(tag = %tag, "Ignoring unusable tag"),
            None => {}
        }
        time::sleep(interval).await;
    }
}

/// Consumes one snapshot per tick until `shutdown` resolves. A snapshot that is
/// already waiting is handled before shutting down.
pub async fn sample_loop<P, S, I>(
    machine: &mut DeploymentStateMachine<P>,
    sensors: &mut S,
    slot: &SampleSlot,
    status: &mut I,
    shutdown: impl Future<Output = ()>,
) -> Result<()>
where
    P: PumpActuator,
    S: Sensors,
    I: StatusIndicator,
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            biased;
            snapshot = slot.next() => {
                let environment = match sensors.read().and_then(|e| e.checked("pressure sensor")) {
                    Ok(environment) => environment,
                    Err(e) => {
                        warn!(error = %e, timestamp = snapshot.timestamp, "Skipping sample");
                        continue;
                    }
                };
                let was_complete = machine.phase() == Phase::Complete;
                let record = machine.on_sample(snapshot, environment)?;
                debug!(?record, pump = ?machine.pump_state(), "Sample");
                if !was_complete && machine.phase() == Phase::Complete {
                    info!(
                        identity = machine.identity().unwrap_or_default(),
                        baseline = ?machine.baseline_flow_rate(),
                        ticks = record.ticks,
                        "Deployment complete"
                    );
                    status.show(Status::Complete);
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown requested");
                return Ok(());
            }
        }
    }
}

fn note(diagnostics: &DiagnosticLog, clock: &impl Clock, message: impl std::fmt::Display) {
    if let Err(e) = diagnostics.append(clock.now(), message) {
        warn!(error = %e, "Failed to write diagnostic log");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;
    use crate::clock::SampleSnapshot;
    use crate::conditions::{ClogStrategy, ConditionEngine, DeploymentConfig};
    use crate::deployment::SamplingSettings;
    use crate::error::HardwareError;
    use crate::hardware::Environment;
    use crate::net::testing::ScriptedTransport;
    use crate::retry::RetryPolicy;
    use crate::types::PumpState;
    use std::cell::RefCell;
    use std::fs::{self, File};
    use std::path::PathBuf;
    use std::rc::Rc;
    use std::time::SystemTime;
    use tempfile::tempdir;

    fn client(transport: ScriptedTransport) -> UplinkClient<ScriptedTransport> {
        UplinkClient::new(transport, "5", RetryPolicy::forever(Duration::ZERO), 2048)
    }

    struct Tags(Vec<Option<String>>);

    impl TagReader for Tags {
        fn poll(&mut self) -> Option<String> {
            if self.0.is_empty() {
                None
            } else {
                self.0.remove(0)
            }
        }
    }

    struct FixedSensors(Environment);

    impl Sensors for FixedSensors {
        fn init(&mut self) -> Result<(), HardwareError> {
            Ok(())
        }

        fn read(&mut self) -> Result<Environment, HardwareError> {
            Ok(self.0)
        }
    }

    /// Fails the read with the given zero-based index.
    struct FlakyReads {
        environment: Environment,
        failing_read: usize,
        reads: usize,
    }

    impl Sensors for FlakyReads {
        fn init(&mut self) -> Result<(), HardwareError> {
            Ok(())
        }

        fn read(&mut self) -> Result<Environment, HardwareError> {
            let read = self.reads;
            self.reads += 1;
            if read == self.failing_read {
                return Err(HardwareError::Read {
                    device: "pressure sensor",
                    reason: "crc mismatch".into(),
                });
            }
            Ok(self.environment)
        }
    }

    struct DeadSensors;

    impl Sensors for DeadSensors {
        fn init(&mut self) -> Result<(), HardwareError> {
            Err(HardwareError::Read {
                device: "pressure sensor",
                reason: "no ack".into(),
            })
        }

        fn read(&mut self) -> Result<Environment, HardwareError> {
            unreachable!("read before init")
        }
    }

    #[derive(Default)]
    struct Pump(Vec<bool>);

    impl PumpActuator for Pump {
        fn set(&mut self, on: bool) -> Result<(), HardwareError> {
            self.0.push(on);
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct Shown(Rc<RefCell<Vec<Status>>>);

    impl StatusIndicator for Shown {
        fn show(&mut self, status: Status) {
            self.0.borrow_mut().push(status);
        }
    }

    fn armed_machine(dir: &Path) -> DeploymentStateMachine<Pump> {
        let mut machine = DeploymentStateMachine::new(
            Pump::default(),
            SamplingSettings::default(),
            dir,
            DiagnosticLog::new(dir),
        );
        machine.identity_acquired("04A1B2C3".into(), 0).unwrap();
        let config = DeploymentConfig {
            target_depth_m: 20.0,
            depth_band_m: 5.0,
            max_pump_secs: 300,
            ticks_per_liter: 4600.0,
            ..DeploymentConfig::default()
        };
        machine
            .arm(ConditionEngine::new(config, ClogStrategy::Threshold), 0)
            .unwrap();
        machine
    }

    fn test_config(data_dir: PathBuf) -> Config {
        Config {
            device_id: "5".into(),
            backend_url: "http://localhost:5000".into(),
            data_dir,
            sample_interval_secs: 1,
            retry_interval_ms: 0,
            max_retry_attempts: None,
            chunk_size: 2048,
            hardware_init_attempts: 3,
            hardware_init_delay_ms: 0,
            surface_depth_m: 2.0,
            surface_confirm_samples: 3,
            baseline_delay_secs: 10,
            clog_strategy: ClogStrategy::Threshold,
        }
    }

    fn set_age(path: &Path, secs_since_epoch: u64) {
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs_since_epoch))
            .unwrap();
    }

    #[tokio::test]
    async fn dead_sensor_halts_before_any_uplink_call() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf());
        let transport = ScriptedTransport::new();
        let shown = Shown::default();
        let devices = Devices {
            sensors: DeadSensors,
            pump: Pump::default(),
            tags: Tags(Vec::new()),
            status: shown.clone(),
        };

        let err = run(
            &config,
            client(transport.clone()),
            devices,
            Arc::new(TickCounter::new()),
            std::future::pending(),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<HardwareError>(),
            Some(HardwareError::InitFailed { attempts: 3, .. })
        ));
        assert_eq!(*shown.0.borrow(), [Status::PoweredOn, Status::Error]);
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn unusable_identities_are_skipped() {
        let transport = ScriptedTransport::new()
            .reply(200, r#"{"status": 1, "identity": "../../etc"}"#)
            .reply(200, r#"{"status": 0}"#)
            .reply(200, "");
        let uplink = client(transport.clone());
        let mut tags = Tags(vec![Some("a/b".into()), Some("04A1B2C3".into())]);

        let identity = acquire_identity(&uplink, &mut tags, Duration::ZERO).await.unwrap();
        assert_eq!(identity, "04A1B2C3");
        let requests = transport.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[2].body, b"04A1B2C3");
    }

    #[tokio::test]
    async fn leftovers_upload_oldest_first_and_log_goes_to_latest() {
        let dir = tempdir().unwrap();
        let older = storage::data_path(dir.path(), "OLDER");
        let newer = storage::data_path(dir.path(), "NEWER");
        fs::write(&older, b"1,2.000,9.000,0,0.000\n").unwrap();
        fs::write(&newer, b"2,2.000,9.000,0,0.000\n").unwrap();
        set_age(&older, 1_000_000);
        set_age(&newer, 2_000_000);
        let diagnostics = DiagnosticLog::new(dir.path());
        diagnostics.append(10, "Pump on").unwrap();

        let transport = ScriptedTransport::new().ok_times(3);
        let uplink = client(transport.clone());
        let drained = drain_leftovers(&uplink, dir.path(), &diagnostics, &ManualClock::at(20))
            .await
            .unwrap();

        assert_eq!(drained, 2);
        let paths: Vec<String> = transport.requests().into_iter().map(|r| r.path).collect();
        assert_eq!(
            paths,
            [
                "/deployment/upload/OLDER",
                "/deployment/upload/NEWER",
                "/deployment/upload-log/NEWER",
            ]
        );
        assert!(!older.exists() && !newer.exists());
    }

    #[tokio::test]
    async fn failed_read_keeps_flow_rate_exact() {
        let dir = tempdir().unwrap();
        let mut machine = armed_machine(dir.path());
        let mut sensors = FlakyReads {
            environment: Environment {
                depth_m: 21.0,
                temperature_c: 8.0,
            },
            failing_read: 3,
            reads: 0,
        };
        let slot = SampleSlot::new();
        let mut shown = Shown::default();

        for t in 0..=6 {
            slot.publish(SampleSnapshot { timestamp: t, ticks: t * 100 });
            sample_loop(&mut machine, &mut sensors, &slot, &mut shown, std::future::ready(()))
                .await
                .unwrap();
        }

        let data = fs::read_to_string(storage::data_path(dir.path(), "04A1B2C3")).unwrap();
        let timestamps: Vec<&str> = data.lines().map(|l| l.split(',').next().unwrap()).collect();
        assert_eq!(timestamps, ["0", "1", "2", "4", "5", "6"]);
        assert_eq!(data.lines().last(), Some("6,21.000,8.000,600,6000.000"));
    }

    #[tokio::test]
    async fn existing_deployment_is_used_without_a_tag() {
        let transport =
            ScriptedTransport::new().reply(200, r#"{"status": 1, "identity": "04A1B2C3"}"#);
        let uplink = client(transport.clone());
        let mut tags = Tags(vec![Some("FFFF0000".into())]);

        let identity = acquire_identity(&uplink, &mut tags, Duration::ZERO).await.unwrap();
        assert_eq!(identity, "04A1B2C3");
        assert_eq!(transport.requests().len(), 1);
        assert_eq!(tags.0.len(), 1);
    }

    #[tokio::test]
    async fn attached_tag_is_registered() {
        let transport = ScriptedTransport::new()
            .reply(200, r#"{"status": 0}"#)
            .reply(200, r#"{"status": 0}"#)
            .reply(200, "");
        let uplink = client(transport.clone());
        let mut tags = Tags(vec![None, Some("04A1B2C3".into())]);

        let identity = acquire_identity(&uplink, &mut tags, Duration::ZERO).await.unwrap();
        assert_eq!(identity, "04A1B2C3");

        let requests = transport.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[2].method, "POST");
        assert_eq!(requests[2].path, "/deployment/create/5");
        assert_eq!(requests[2].body, b"04A1B2C3");
    }

    #[tokio::test]
    async fn leftovers_are_uploaded_and_removed() {
        let dir = tempdir().unwrap();
        fs::write(storage::data_path(dir.path(), "04A1B2C3"), vec![b'1'; 3000]).unwrap();
        let diagnostics = DiagnosticLog::new(dir.path());
        diagnostics.append(10, "Pump on").unwrap();

        // Two data chunks, then the log (now also holding the upload note).
        let transport = ScriptedTransport::new().ok_times(3);
        let uplink = client(transport.clone());
        let drained = drain_leftovers(&uplink, dir.path(), &diagnostics, &ManualClock::at(20))
            .await
            .unwrap();

        assert_eq!(drained, 1);
        let paths: Vec<String> = transport.requests().into_iter().map(|r| r.path).collect();
        assert_eq!(
            paths,
            [
                "/deployment/upload/04A1B2C3",
                "/deployment/upload/04A1B2C3",
                "/deployment/upload-log/04A1B2C3",
            ]
        );
        assert!(!storage::data_path(dir.path(), "04A1B2C3").exists());
        assert!(!diagnostics.path().exists());
    }

    #[tokio::test]
    async fn log_without_deployment_is_kept() {
        let dir = tempdir().unwrap();
        let diagnostics = DiagnosticLog::new(dir.path());
        diagnostics.append(10, "Powered on").unwrap();

        let transport = ScriptedTransport::new();
        let uplink = client(transport.clone());
        let drained = drain_leftovers(&uplink, dir.path(), &diagnostics, &ManualClock::at(20))
            .await
            .unwrap();

        assert_eq!(drained, 0);
        assert!(transport.requests().is_empty());
        assert!(diagnostics.path().exists());
    }

    #[tokio::test]
    async fn pending_sample_is_handled_before_shutdown() {
        let dir = tempdir().unwrap();
        let mut machine = armed_machine(dir.path());

        let slot = SampleSlot::new();
        slot.publish(SampleSnapshot { timestamp: 42, ticks: 0 });
        let mut sensors = FixedSensors(Environment {
            depth_m: 21.0,
            temperature_c: 8.0,
        });
        let mut shown = Shown::default();

        sample_loop(&mut machine, &mut sensors, &slot, &mut shown, std::future::ready(()))
            .await
            .unwrap();

        assert_eq!(machine.pump_state(), PumpState::Running);
        assert_eq!(slot.take(), None);
        let data = fs::read_to_string(storage::data_path(dir.path(), "04A1B2C3")).unwrap();
        assert!(data.starts_with("42,21.000,8.000,0,0.000"));
    }
}
