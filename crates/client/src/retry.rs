//! Retry policy and exponential backoff.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::UploadError;

/// Which failure classes the retry wrapper re-attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOn {
    pub timeouts: bool,
    pub connect: bool,
    /// Transport failures that are neither timeouts nor connect errors,
    /// e.g. a connection reset mid-request.
    pub other_transport: bool,
    /// 5xx responses.
    pub server_errors: bool,
}

impl Default for RetryOn {
    fn default() -> Self {
        Self {
            timeouts: true,
            connect: true,
            other_transport: true,
            server_errors: true,
        }
    }
}

/// TLS settings for the HTTP transport.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Skips certificate verification. Test servers only.
    pub accept_invalid_certs: bool,
    /// Extra trusted root certificates, PEM encoded.
    pub root_certificates_pem: Vec<Vec<u8>>,
}

/// Client-wide configuration: retry policy, TLS trust and request defaults.
#[derive(Debug, Clone)]
pub struct RetryConfiguration {
    /// Total attempts per operation, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    /// Backoff cap.
    pub max_delay: Duration,
    /// Adds ±25% jitter to each delay.
    pub jitter: bool,
    pub retry_on: RetryOn,
    pub tls: TlsConfig,
    /// Per-request timeout. `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
    /// Headers added to every request, e.g. authorization.
    pub headers: Vec<(String, String)>,
}

impl Default for RetryConfiguration {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: true,
            retry_on: RetryOn::default(),
            tls: TlsConfig::default(),
            request_timeout: Some(Duration::from_secs(30)),
            headers: Vec::new(),
        }
    }
}

impl RetryConfiguration {
    /// Delay to wait after the given failed attempt (1-based) before the
    /// next one.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.base_delay.as_secs_f64() * self.backoff_multiplier.max(1.0).powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if !self.jitter || capped <= 0.0 {
            return self.clamp_delay(capped.max(0.0));
        }
        let offset: f64 = rand::thread_rng().gen_range(-1.0..1.0);
        self.clamp_delay((capped + capped * 0.25 * offset).max(0.0))
    }

    // `max_delay` may be `Duration::MAX`, which is not representable as f64 seconds.
    fn clamp_delay(&self, secs: f64) -> Duration {
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
    }

    /// Attempts per operation, never less than one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub(crate) fn header_map(&self) -> Result<HeaderMap, UploadError> {
        let mut map = HeaderMap::new();
        for (name, value) in &self.headers {
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| UploadError::InvalidHeader(name.clone()))?;
            let value =
                HeaderValue::from_str(value).map_err(|_| UploadError::InvalidHeader(name.clone()))?;
            map.append(header, value);
        }
        Ok(map)
    }
}

/// Sleeps for `delay` unless cancelled first.
pub(crate) async fn backoff(cancel: &CancellationToken, delay: Duration) -> Result<(), UploadError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(UploadError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error or runs
/// out of attempts.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfiguration,
    cancel: &CancellationToken,
    operation: &'static str,
    mut op: F,
) -> Result<T, UploadError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UploadError>>,
{
    let max = config.attempts();
    let mut attempt = 1;
    loop {
        let err = match op().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(operation, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable(&config.retry_on) => e,
            Err(e) => return Err(e),
        };

        if attempt >= max {
            error!(operation, attempts = attempt, error = %err, "giving up");
            return Err(UploadError::RetriesExhausted {
                attempts: attempt,
                last: Box::new(err),
            });
        }

        let delay = config.delay_for_attempt(attempt);
        warn!(
            operation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "attempt failed, retrying"
        );
        backoff(cancel, delay).await?;
        attempt += 1;
    }
}
