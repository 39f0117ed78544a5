use crate::{PriceError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Environment variable holding the Web Unlocker API token.
pub const UNLOCKER_TOKEN_VAR: &str = "BRIGHT_DATA_API_TOKEN";
/// Environment variable holding the LLM API key.
pub const LLM_KEY_VAR: &str = "GOOGLE_API_KEY";
/// Accepted alias for [`LLM_KEY_VAR`].
pub const LLM_KEY_ALIAS_VAR: &str = "LLM_API_KEY";
/// Environment variable naming the Web Unlocker zone.
pub const UNLOCKER_ZONE_VAR: &str = "WEB_UNLOCKER_ZONE";

/// The `PipelineConfig` struct holds the tunable settings for a pipeline run.
/// Every field has a default, so a config file only needs the values it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// The number of extraction requests allowed in flight.
    pub concurrent_requests: usize,
    /// Upper bound in seconds for any single outbound call.
    pub call_timeout_secs: u64,
    /// The maximum number of attempts for a page fetch.
    pub max_retries: u32,
    /// Base delay in milliseconds between fetch attempts; doubles each retry.
    pub retry_backoff_ms: u64,
    /// The user agent string to be used in HTTP requests.
    pub user_agent: String,
    /// The rate limit settings for the unlocker.
    pub rate_limit: RateLimit,
    /// Fetch retailer search pages before asking the LLM for URLs.
    pub discovery: bool,
    /// Product-link candidates kept per search page.
    pub max_candidates: usize,
    /// Page text is cut to this many characters before prompting.
    pub max_page_chars: usize,
    /// The configuration settings for the Language Model (LLM).
    pub llm_config: LLMConfig,
    pub unlocker: UnlockerConfig,
    pub confidence: ConfidenceConfig,
}

/// The `RateLimit` struct holds the rate limiting settings for the unlocker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimit {
    /// The number of requests allowed per second.
    pub requests_per_second: f32,
    /// The burst size for rate limiting.
    pub burst_size: usize,
}

/// The `LLMConfig` struct holds the settings for the chat-completions endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LLMConfig {
    /// Full URL of an OpenAI-compatible `chat/completions` endpoint.
    pub endpoint: String,
    pub model: String,
    /// The temperature setting for the LLM, controlling the randomness of the output.
    pub temperature: f32,
    /// The maximum number of tokens allowed in the LLM response.
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UnlockerConfig {
    pub endpoint: String,
    pub zone: String,
    /// Two-letter country the unlocker should exit from.
    pub country: Option<String>,
}

/// Parameters of the confidence heuristic
/// `clamp(0, ceiling, base + weight * found / supported_retailers)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceConfig {
    pub base: f64,
    pub weight: f64,
    pub ceiling: f64,
    /// Denominator of the coverage fraction. `None` uses the number of
    /// supported retailers.
    pub supported_retailers: Option<usize>,
}

impl PipelineConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrent_requests: crate::DEFAULT_CONCURRENT_REQUESTS,
            call_timeout_secs: crate::DEFAULT_TIMEOUT.as_secs(),
            max_retries: crate::DEFAULT_MAX_RETRIES,
            retry_backoff_ms: 1000,
            user_agent: String::from("Mozilla/5.0 (compatible; pricecheck/0.1)"),
            rate_limit: RateLimit::default(),
            discovery: true,
            max_candidates: 8,
            max_page_chars: 20_000,
            llm_config: LLMConfig::default(),
            unlocker: UnlockerConfig::default(),
            confidence: ConfidenceConfig::default(),
        }
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            requests_per_second: 2.0,
            burst_size: 5,
        }
    }
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            endpoint: String::from(
                "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions",
            ),
            model: String::from("gemini-2.0-flash"),
            temperature: 0.0,
            max_tokens: 2048,
        }
    }
}

impl Default for UnlockerConfig {
    fn default() -> Self {
        Self {
            endpoint: String::from("https://api.brightdata.com/request"),
            zone: String::from("unblocker"),
            country: None,
        }
    }
}

impl ConfidenceConfig {
    /// Highest confidence score any configuration may produce.
    pub const MAX_SCORE: f64 = 10.0;

    /// Rejects parameters under which the score could leave `[0, 10]` or
    /// drop when more retailers report a price.
    pub fn validate(&self) -> Result<()> {
        if !(self.base.is_finite() && self.weight.is_finite() && self.ceiling.is_finite()) {
            return Err(PriceError::ConfigError(
                "confidence parameters must be finite numbers".to_string(),
            ));
        }
        if self.weight < 0.0 {
            return Err(PriceError::ConfigError(format!(
                "confidence.weight must not be negative (got {})",
                self.weight
            )));
        }
        if !(0.0..=Self::MAX_SCORE).contains(&self.ceiling) {
            return Err(PriceError::ConfigError(format!(
                "confidence.ceiling must be between 0 and {} (got {})",
                Self::MAX_SCORE,
                self.ceiling
            )));
        }
        Ok(())
    }
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            base: 2.0,
            weight: 8.0,
            ceiling: 10.0,
            supported_retailers: None,
        }
    }
}

/// API credentials for the two collaborators.
#[derive(Clone)]
pub struct Credentials {
    pub unlocker_token: String,
    pub llm_api_key: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("unlocker_token", &"<redacted>")
            .field("llm_api_key", &"<redacted>")
            .finish()
    }
}

/// Everything the binary needs at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub pipeline: PipelineConfig,
    pub credentials: Credentials,
}

impl Settings {
    /// Loads `.env`, an optional `pricecheck.toml`, and the process environment.
    ///
    /// Nested pipeline settings can be overridden with `PIPELINE__` variables,
    /// e.g. `PIPELINE__LLM_CONFIG__MODEL`.
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let source = ::config::Config::builder()
            .add_source(::config::File::with_name("pricecheck").required(false))
            .add_source(
                ::config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Self::from_config(&source)
    }

    /// Builds settings from an already assembled configuration source.
    pub fn from_config(source: &::config::Config) -> Result<Self> {
        let mut pipeline = match source.get::<PipelineConfig>("pipeline") {
            Ok(pipeline) => pipeline,
            Err(::config::ConfigError::NotFound(_)) => PipelineConfig::default(),
            Err(e) => return Err(e.into()),
        };

        pipeline.confidence.validate()?;

        if let Some(zone) = optional(source, UNLOCKER_ZONE_VAR) {
            pipeline.unlocker.zone = zone;
        }

        let unlocker_token = required(source, &[UNLOCKER_TOKEN_VAR])?;
        let llm_api_key = required(source, &[LLM_KEY_VAR, LLM_KEY_ALIAS_VAR])?;

        debug!(
            zone = %pipeline.unlocker.zone,
            model = %pipeline.llm_config.model,
            "Configuration loaded"
        );

        Ok(Self {
            pipeline,
            credentials: Credentials {
                unlocker_token,
                llm_api_key,
            },
        })
    }
}

fn optional(source: &::config::Config, var: &str) -> Option<String> {
    source
        .get_string(&var.to_ascii_lowercase())
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(source: &::config::Config, vars: &[&str]) -> Result<String> {
    vars.iter()
        .find_map(|var| optional(source, var))
        .ok_or_else(|| PriceError::ConfigError(format!("{} must be set", vars[0])))
}
