use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::conditions::ClogStrategy;
use crate::deployment::SamplingSettings;
use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub device_id: String,
    pub backend_url: String,
    pub data_dir: PathBuf,
    pub sample_interval_secs: u64,
    pub retry_interval_ms: u64,
    pub max_retry_attempts: Option<u32>,
    pub chunk_size: usize,
    pub hardware_init_attempts: u32,
    #[serde(default = "default_hardware_init_delay_ms")]
    pub hardware_init_delay_ms: u64,
    pub surface_depth_m: f32,
    #[serde(default = "default_surface_confirm_samples")]
    pub surface_confirm_samples: u32,
    pub baseline_delay_secs: u32,
    pub clog_strategy: ClogStrategy,
}

fn default_hardware_init_delay_ms() -> u64 {
    1000
}

fn default_surface_confirm_samples() -> u32 {
    3
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let device_id = env::var("DEVICE_ID").unwrap_or_else(|_| Uuid::new_v4().to_string());
        let backend_url = env::var("BACKEND_URL").unwrap_or_else(|_| "http://localhost:5000".to_string());
        let data_dir = PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string()));

        let clog_strategy = match env::var("CLOG_STRATEGY") {
            Ok(raw) => serde_json::from_value(serde_json::Value::String(raw.to_lowercase()))?,
            Err(_) => ClogStrategy::default(),
        };

        Ok(Config {
            device_id,
            backend_url,
            data_dir,
            sample_interval_secs: get_env_var("SAMPLE_INTERVAL_SECS", 1),
            retry_interval_ms: get_env_var("RETRY_INTERVAL_MS", 1000),
            max_retry_attempts: env::var("MAX_RETRY_ATTEMPTS").ok().and_then(|v| v.parse().ok()),
            chunk_size: get_env_var("CHUNK_SIZE", 2048),
            hardware_init_attempts: get_env_var("HW_INIT_ATTEMPTS", 5),
            hardware_init_delay_ms: get_env_var("HW_INIT_DELAY_MS", default_hardware_init_delay_ms()),
            surface_depth_m: get_env_var("SURFACE_DEPTH_M", 2.0),
            surface_confirm_samples: get_env_var(
                "SURFACE_CONFIRM_SAMPLES",
                default_surface_confirm_samples(),
            ),
            baseline_delay_secs: get_env_var("BASELINE_DELAY_SECS", 10),
            clog_strategy,
        })
    }

    fn get_config_file_path() -> PathBuf {
        let config_dir = env::var("CONFIG_DIR").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(config_dir).join("sampler_config.json")
    }

    pub fn load_from_file() -> Result<Self> {
        let contents = fs::read_to_string(Self::get_config_file_path())?;
        let config: Config = serde_json::from_str(&contents)?;
        Ok(config)
    }

    pub fn save_to_file(&self) -> Result<()> {
        let config_file_path = Self::get_config_file_path();
        if let Some(parent) = config_file_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        let mut file = fs::File::create(&config_file_path)?;
        file.write_all(contents.as_bytes())?;
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let interval = Duration::from_millis(self.retry_interval_ms);
        match self.max_retry_attempts {
            Some(max) => RetryPolicy::capped(interval, max),
            None => RetryPolicy::forever(interval),
        }
    }

    pub fn sample_period(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs.max(1))
    }

    pub fn sampling_settings(&self) -> SamplingSettings {
        SamplingSettings {
            surface_depth_m: self.surface_depth_m,
            baseline_delay_secs: self.baseline_delay_secs,
            surface_confirm_samples: self.surface_confirm_samples,
        }
    }

    pub fn hardware_init_delay(&self) -> Duration {
        Duration::from_millis(self.hardware_init_delay_ms)
    }
}

fn get_env_var<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}
