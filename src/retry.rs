use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::UplinkError;

/// How an uplink operation retries a failed attempt. Without a cap it keeps
/// trying until it succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::forever(Duration::from_secs(1))
    }
}

impl RetryPolicy {
    pub fn forever(interval: Duration) -> Self {
        RetryPolicy {
            interval,
            max_attempts: None,
        }
    }

    pub fn capped(interval: Duration, max_attempts: u32) -> Self {
        RetryPolicy {
            interval,
            max_attempts: Some(max_attempts.max(1)),
        }
    }

    pub async fn run<T, F, Fut>(&self, what: &'static str, mut attempt: F) -> Result<T, UplinkError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UplinkError>>,
    {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let err = match attempt().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if self.max_attempts.is_some_and(|max| attempts >= max) {
                return Err(UplinkError::RetriesExhausted {
                    what,
                    attempts,
                    last: Box::new(err),
                });
            }

            match err {
                UplinkError::ConfigNotReady => debug!(what, attempts, "Not ready yet, polling again"),
                ref err => warn!(what, attempts, error = %err, "Attempt failed, retrying"),
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}
