//! Backoff math, HTTP retry policy and the sleep seam used by retry loops.

use async_trait::async_trait;
use larkbot_core::error::Result;
use larkbot_core::traits::HttpClient;
use larkbot_core::types::{HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound for task retry delays.
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Delay before retry `attempt` (0-indexed): `min(base * 2^attempt, 300s)`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(MAX_BACKOFF, |d| d.min(MAX_BACKOFF))
}

/// Retry policy for outbound HTTP actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_seconds")]
    pub backoff_seconds: f64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_backoff_seconds")]
    pub max_backoff_seconds: f64,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_backoff_seconds() -> f64 {
    1.0
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_seconds() -> f64 {
    30.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_seconds: default_backoff_seconds(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_seconds: default_max_backoff_seconds(),
        }
    }
}

impl RetryConfig {
    /// Sleep durations (seconds) between consecutive attempts.
    pub fn delays(&self) -> Vec<f64> {
        let mut delays = Vec::new();
        let mut delay = self.backoff_seconds.max(0.0);
        for _ in 1..self.max_attempts.max(1) {
            delays.push(delay.min(self.max_backoff_seconds));
            delay *= self.backoff_multiplier;
        }
        delays
    }
}

/// Sleep seam so retry loops can be observed in tests.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, seconds: f64);
}

/// Real sleeps on the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, seconds: f64) {
        if seconds.is_finite() && seconds > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
        }
    }
}

/// Perform `request`, retrying failures per `retry`. The last error is
/// returned once attempts run out; structural errors are never retried.
pub async fn request_with_retry(
    http: &dyn HttpClient,
    sleeper: &dyn Sleeper,
    request: &HttpRequest,
    retry: &RetryConfig,
) -> Result<HttpResponse> {
    let max_attempts = retry.max_attempts.max(1);
    let mut delay = retry.backoff_seconds.max(0.0);
    let mut attempt = 1;
    loop {
        match http.request(request).await {
            Ok(response) => return Ok(response),
            Err(e) if attempt >= max_attempts || e.is_structural() => return Err(e),
            Err(e) => {
                let wait = delay.min(retry.max_backoff_seconds);
                tracing::warn!(
                    "🔁 {} {} failed (attempt {attempt}/{max_attempts}): {e}; retrying in {wait:.2}s",
                    request.method,
                    request.url
                );
                sleeper.sleep(wait).await;
                delay *= retry.backoff_multiplier;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingSleeper, StubHttp};

    #[test]
    fn test_backoff_doubles_until_cap() {
        let base = Duration::from_secs(10);
        let delays: Vec<u64> = (0..7).map(|k| backoff_delay(base, k).as_secs()).collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 160, 300, 300]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_backoff_never_overflows() {
        assert_eq!(backoff_delay(Duration::from_secs(1), 64), MAX_BACKOFF);
        assert_eq!(backoff_delay(Duration::from_secs(u64::MAX / 2), 3), MAX_BACKOFF);
        assert_eq!(backoff_delay(Duration::ZERO, 5), Duration::ZERO);
    }

    #[test]
    fn test_retry_config_delays() {
        let retry = RetryConfig {
            max_attempts: 4,
            backoff_seconds: 1.0,
            backoff_multiplier: 3.0,
            max_backoff_seconds: 5.0,
        };
        assert_eq!(retry.delays(), vec![1.0, 3.0, 5.0]);
        assert!(RetryConfig::default().delays().is_empty());
    }

    #[tokio::test]
    async fn test_request_with_retry_recovers() {
        let http = StubHttp::failing_times(2);
        let sleeper = RecordingSleeper::default();
        let retry = RetryConfig {
            max_attempts: 3,
            backoff_seconds: 0.01,
            backoff_multiplier: 2.0,
            max_backoff_seconds: 30.0,
        };
        let request = HttpRequest::new("get", "http://example.test/ping");
        let response = request_with_retry(&http, &sleeper, &request, &retry).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(http.requests().len(), 3);
        assert_eq!(sleeper.sleeps(), vec![0.01, 0.02]);
    }

    #[tokio::test]
    async fn test_request_with_retry_gives_up() {
        let http = StubHttp::failing_times(5);
        let sleeper = RecordingSleeper::default();
        let retry = RetryConfig { max_attempts: 2, ..Default::default() };
        let request = HttpRequest::new("POST", "http://example.test/ping");
        let err = request_with_retry(&http, &sleeper, &request, &retry).await.unwrap_err();
        assert!(err.to_string().contains("attempt 2"));
        assert_eq!(sleeper.sleeps(), vec![1.0]);
    }
}
