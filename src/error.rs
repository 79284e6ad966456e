use thiserror::Error;

use crate::deployment::Phase;

#[derive(Debug, Error)]
pub enum UplinkError {
    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("deployment configuration is not ready")]
    ConfigNotReady,
    #[error("{what} gave up after {attempts} attempts")]
    RetriesExhausted {
        what: &'static str,
        attempts: u32,
        #[source]
        last: Box<UplinkError>,
    },
}

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("{device} did not initialise after {attempts} attempts")]
    InitFailed { device: &'static str, attempts: u32 },
    #[error("{device} read failed: {reason}")]
    Read { device: &'static str, reason: String },
}

#[derive(Debug, Error, PartialEq)]
pub enum RecordError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("invalid value {value:?} for field `{field}`")]
    InvalidField { field: &'static str, value: String },
    #[error("unexpected trailing field {0:?}")]
    TrailingField(String),
}

#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error("cannot {event} while {from:?}")]
    InvalidTransition { from: Phase, event: &'static str },
    #[error("deployment identity {0:?} is not usable as a file name")]
    InvalidIdentity(String),
    #[error("deployment configuration is not valid")]
    InvalidConfig,
    #[error(transparent)]
    Hardware(#[from] HardwareError),
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
}
