//! Retry and deadline helpers for engine operations
//!
//! Answer-time identity resolution retries with backoff; hangup runs under
//! an overall deadline.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{SoftphoneError, SoftphoneResult};

/// Configuration for retry behavior
///
/// Delays are written as `initial_delay_ms`/`max_delay_ms` in serialized
/// form; omitted fields take their default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,
    #[serde(rename = "initial_delay_ms", with = "duration_ms")]
    pub initial_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Whether to add ±10% jitter to delays
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Short retries for interactive operations
    pub fn quick() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 1.5,
            use_jitter: true,
        }
    }

    /// A single attempt
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            use_jitter: false,
            ..Self::default()
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.use_jitter {
            return delay;
        }
        let jitter = (rand::random::<f64>() - 0.5) * 0.2;
        Duration::from_millis((delay.as_millis() as f64 * (1.0 + jitter)) as u64)
    }
}

/// Millisecond serialization for delay fields
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Retry an operation with exponential backoff
///
/// Only errors for which [`SoftphoneError::is_recoverable`] holds are retried.
pub async fn retry_with_backoff<T, F, Fut>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> SoftphoneResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = SoftphoneResult<T>>,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        match operation(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(operation = operation_name, attempt, "Operation succeeded after retries");
                }
                return Ok(result);
            }
            Err(e) if e.is_recoverable() && attempt < config.max_attempts => {
                debug!(
                    operation = operation_name,
                    attempt,
                    error = %e,
                    category = e.category(),
                    next_delay_ms = delay.as_millis() as u64,
                    "Recoverable error, will retry"
                );
                sleep(config.jittered(delay)).await;

                let next_delay_ms = (delay.as_millis() as f64 * config.backoff_multiplier) as u64;
                delay = Duration::from_millis(next_delay_ms).min(config.max_delay);
            }
            Err(e) => {
                warn!(
                    operation = operation_name,
                    attempts = attempt,
                    error = %e,
                    category = e.category(),
                    "Operation failed, not retrying"
                );
                return Err(e);
            }
        }
    }
}

/// Run a future under a deadline, mapping expiry to `OperationTimeout`
pub async fn with_timeout<T, F>(operation_name: &str, timeout: Duration, future: F) -> SoftphoneResult<T>
where
    F: Future<Output = SoftphoneResult<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                operation = operation_name,
                timeout_ms = timeout.as_millis() as u64,
                "Operation timed out"
            );
            Err(SoftphoneError::OperationTimeout {
                duration_ms: timeout.as_millis() as u64,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_config_serializes_delays_in_millis() {
        let value = serde_json::to_value(RetryConfig::default()).unwrap();
        assert_eq!(value["initial_delay_ms"], 250);
        assert_eq!(value["max_delay_ms"], 2000);
        assert!(value.get("initial_delay").is_none());

        let partial: RetryConfig = serde_json::from_str(r#"{ "max_delay_ms": 500 }"#).unwrap();
        assert_eq!(partial.max_delay, Duration::from_millis(500));
        assert_eq!(partial.max_attempts, RetryConfig::default().max_attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_backoff_success() {
        let mut attempts = 0;
        let result = retry_with_backoff("resolve", &RetryConfig::quick(), |_| {
            attempts += 1;
            let outcome = if attempts < 3 {
                Err(SoftphoneError::identity_unresolved("no calls"))
            } else {
                Ok(42)
            };
            async move { outcome }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_non_recoverable() {
        let mut attempts = 0;
        let result: SoftphoneResult<()> = retry_with_backoff("answer", &RetryConfig::default(), |_| {
            attempts += 1;
            async { Err(SoftphoneError::invalid_config("answer_retry", "bad")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_max_attempts() {
        let mut attempts = 0;
        let result: SoftphoneResult<()> = retry_with_backoff("resolve", &RetryConfig::default(), |attempt| {
            attempts = attempt;
            async { Err(SoftphoneError::identity_unresolved("ambiguous")) }
        })
        .await;

        assert!(matches!(result, Err(SoftphoneError::IdentityUnresolved { .. })));
        assert_eq!(attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout() {
        let result: SoftphoneResult<()> = with_timeout("hangup", Duration::from_millis(100), async {
            sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(SoftphoneError::OperationTimeout { duration_ms: 100 })));
    }
}
