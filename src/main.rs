use anyhow::Result;
use reqwest::Client;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod app;
mod clock;
mod conditions;
mod config;
mod deployment;
mod error;
mod flow;
mod hardware;
mod net;
mod retry;
mod simulate;
mod storage;
mod types;

use app::Devices;
use config::Config;
use flow::TickCounter;
use hardware::LogIndicator;
use net::{HttpTransport, UplinkClient};
use simulate::{DiveProfile, SimulatedPump, SimulatedSensors, SimulatedTagReader};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if env::var("LOG_FORMAT").is_ok_and(|format| format == "json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = match Config::load_from_file() {
        Ok(config) => config,
        Err(_) => {
            let config = Config::from_env()?;
            if let Err(e) = config.save_to_file() {
                warn!(error = %e, "Failed to persist config");
            }
            config
        }
    };
    info!(?config, "Sampler starting");

    let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
    let uplink = UplinkClient::new(
        HttpTransport::new(client, config.backend_url.clone()),
        config.device_id.clone(),
        config.retry_policy(),
        config.chunk_size,
    );

    let counter = Arc::new(TickCounter::new());
    let pump = SimulatedPump::new();
    let meter = simulate::spawn_flow_meter(Arc::clone(&counter), pump.running(), 80.0, 0.002);
    let devices = Devices {
        sensors: SimulatedSensors::new(DiveProfile::default()),
        pump,
        tags: SimulatedTagReader::new(5),
        status: LogIndicator::default(),
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    let result = app::run(&config, uplink, devices, counter, shutdown).await;
    meter.abort();
    result
}
