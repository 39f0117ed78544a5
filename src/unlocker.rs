use crate::capabilities::PageFetcher;
use crate::config::PipelineConfig;
use crate::{PriceError, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

/// Upper bound for one retry delay.
const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// Upper bound for the spacing between two requests.
const MAX_SPACING: Duration = Duration::from_secs(60);

/// The `UnlockerClient` fetches rendered pages through a Web Unlocker zone.
///
/// Requests share a semaphore sized to the configured burst and are spaced by
/// `1 / requests_per_second`. Transient failures are retried with exponential
/// backoff.
pub struct UnlockerClient {
    /// The HTTP client used for making requests.
    client: Client,
    config: PipelineConfig,
    token: String,
    /// The rate limiter used to control the rate of requests.
    rate_limiter: Arc<Semaphore>,
}

#[derive(Debug, Serialize)]
struct UnlockRequest<'a> {
    zone: &'a str,
    url: &'a str,
    format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    country: Option<&'a str>,
}

impl UnlockerClient {
    /// Creates a new `UnlockerClient` with the given configuration.
    ///
    /// # Arguments
    ///
    /// * `config` - The pipeline settings; `unlocker`, `rate_limit`, retries and timeout are used.
    /// * `token` - The unlocker API token.
    ///
    /// # Returns
    ///
    /// A `Result` containing the client, or an error if the HTTP client could not be created.
    pub fn new(config: PipelineConfig, token: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.call_timeout())
            .gzip(true)
            .build()
            .map_err(PriceError::RequestError)?;

        // Initialize rate limiter
        let rate_limiter = Arc::new(Semaphore::new(config.rate_limit.burst_size.max(1)));

        Ok(Self {
            client,
            config,
            token: token.into(),
            rate_limiter,
        })
    }

    /// Fetches `url` with retries.
    ///
    /// Authentication failures are returned immediately; anything else is
    /// retried up to `max_retries` attempts in total.
    #[instrument(skip(self))]
    pub async fn fetch(&self, url: &str) -> Result<String> {
        let max_attempts = self.config.max_retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.try_fetch(url).await {
                Ok(html) => return Ok(html),
                Err(e) if attempt < max_attempts && e.is_retryable() => {
                    let delay = backoff_delay(self.config.retry_backoff(), attempt);
                    warn!(attempt, error = %e, ?delay, "Unlocker fetch failed, retrying");
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_fetch(&self, url: &str) -> Result<String> {
        // Acquire rate limit permit
        let _permit = self
            .rate_limiter
            .acquire()
            .await
            .map_err(|_| PriceError::UnlockerError("rate limiter closed".to_string()))?;
        if let Some(spacing) = request_spacing(self.config.rate_limit.requests_per_second) {
            sleep(spacing).await;
        }

        let body = UnlockRequest {
            zone: &self.config.unlocker.zone,
            url,
            format: "raw",
            country: self.config.unlocker.country.as_deref(),
        };

        let response = self
            .client
            .post(&self.config.unlocker.endpoint)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        debug!(%status, "Unlocker response");

        match status {
            s if s.is_success() => {}
            StatusCode::TOO_MANY_REQUESTS => return Err(PriceError::RateLimitError),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(PriceError::Unauthorized(format!(
                    "unlocker rejected the API token ({})",
                    status
                )))
            }
            _ => {
                let detail = response.text().await.unwrap_or_default();
                return Err(PriceError::UnlockerError(format!(
                    "{}: {}",
                    status,
                    detail.trim()
                )));
            }
        }

        let html = response.text().await?;
        if html.trim().is_empty() {
            return Err(PriceError::UnlockerError(format!(
                "empty page returned for {}",
                url
            )));
        }
        Ok(html)
    }
}

#[async_trait]
impl PageFetcher for UnlockerClient {
    async fn fetch_html(&self, url: &str) -> Result<String> {
        self.fetch(url).await
    }
}

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt - 1)`,
/// capped at [`MAX_BACKOFF`].
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(MAX_BACKOFF)
}

/// Pause before each request for a `requests_per_second` limit. Zero,
/// negative or non-finite rates disable spacing.
fn request_spacing(requests_per_second: f32) -> Option<Duration> {
    if !(requests_per_second.is_finite() && requests_per_second > 0.0) {
        return None;
    }
    let spacing = Duration::try_from_secs_f32(1.0 / requests_per_second).unwrap_or(MAX_SPACING);
    Some(spacing.min(MAX_SPACING))
}
