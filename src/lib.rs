use std::future::Future;
use std::time::Duration;
use thiserror::Error;

pub mod capabilities;
pub mod config;
pub mod console;
pub mod extract;
pub mod llm;
pub mod pipeline;
pub mod prompt;
pub mod report;
pub mod scraper;
pub mod search;
pub mod types;
pub mod unlocker;

// Re-export commonly used types
pub use config::{Credentials, PipelineConfig, Settings};
pub use pipeline::{Phase, Pipeline, PipelineState};
pub use report::Report;
pub use types::{PriceObservation, Retailer, ScrapedContent, UrlSet};

/// The `PriceError` enum represents the errors that can occur while running the pipeline.
#[derive(Error, Debug)]
pub enum PriceError {
    /// Represents an error that occurs during an HTTP request.
    #[error("HTTP request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    /// A collaborator answered with HTTP 429.
    #[error("Rate limit exceeded")]
    RateLimitError,
    /// Represents an error that occurs while reducing a page to text.
    #[error("Content extraction failed: {0}")]
    ExtractionError(String),
    /// Represents an error that occurs during LLM processing.
    #[error("LLM processing failed: {0}")]
    LLMError(String),
    /// A collaborator rejected the configured credential (HTTP 401/403).
    #[error("Invalid credentials: {0}")]
    Unauthorized(String),
    /// The unlocker failed a fetch.
    #[error("Unlocker request failed: {0}")]
    UnlockerError(String),
    /// Represents an error that occurs during the search stage.
    #[error("Product search failed: {0}")]
    SearchError(String),
    /// An outbound call did not finish in time.
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),
    #[error("No product URLs found for '{0}'")]
    NoUrlsFound(String),
    #[error("No prices found for '{0}'")]
    NoPricesFound(String),
    /// Startup configuration is missing or malformed.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl PriceError {
    /// Whether retrying the same request could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            PriceError::RequestError(e) => !e.is_builder(),
            PriceError::RateLimitError | PriceError::Timeout(_) => true,
            PriceError::UnlockerError(_) => true,
            _ => false,
        }
    }

    /// Whether the error stops the whole run even where single-retailer
    /// failures are tolerated.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PriceError::Unauthorized(_))
    }
}

impl From<::config::ConfigError> for PriceError {
    fn from(err: ::config::ConfigError) -> Self {
        PriceError::ConfigError(err.to_string())
    }
}

/// A type alias for `Result` with the `PriceError` error type.
pub type Result<T> = std::result::Result<T, PriceError>;

/// Runs `fut` and converts an elapsed `limit` into [`PriceError::Timeout`].
pub async fn with_timeout<T>(limit: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| PriceError::Timeout(limit))?
}

// Constants

/// The default timeout for one outbound call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(90);
/// The default number of extraction requests in flight.
pub const DEFAULT_CONCURRENT_REQUESTS: usize = 1;
/// The default maximum number of attempts for a page fetch.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
