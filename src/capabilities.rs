//! Seams between the pipeline stages and the two external services.
//!
//! The HTTP clients in [`crate::llm`] and [`crate::unlocker`] implement these;
//! tests substitute deterministic stand-ins.

use crate::report::PriceSummary;
use crate::types::{PriceObservation, Retailer, ScrapedContent, SearchPage, UrlSet};
use crate::Result;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Identifies one product-page URL per retailer.
#[async_trait]
pub trait UrlIdentifier: Send + Sync {
    /// `pages` holds whatever search-page candidates discovery produced; it is
    /// empty when discovery is off or every search page failed.
    async fn identify_urls(&self, query: &str, pages: &[SearchPage]) -> Result<UrlSet>;
}

/// Fetches rendered page content.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_html(&self, url: &str) -> Result<String>;
}

/// Pulls the fixed product fields out of a reduced page.
#[async_trait]
pub trait FieldExtractor: Send + Sync {
    async fn extract_fields(&self, retailer: Retailer, page: &ScrapedContent)
        -> Result<ExtractedFields>;
}

/// Renders the report narrative from locally computed figures.
#[async_trait]
pub trait NarrativeRenderer: Send + Sync {
    async fn render_narrative(&self, request: &NarrativeRequest) -> Result<String>;
}

/// The structured fields requested from a product page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedFields {
    /// Current selling price as a plain number, without currency symbols.
    pub price: Option<f64>,
    /// ISO 4217 currency code of the price, e.g. "USD".
    pub currency: Option<String>,
    /// Product name as shown on the page.
    #[serde(default)]
    pub title: String,
    /// Availability status, e.g. "In stock" or "Out of stock".
    pub availability: Option<String>,
}

/// Everything the narrative step is allowed to see.
#[derive(Debug, Clone)]
pub struct NarrativeRequest {
    pub query: String,
    pub summary: PriceSummary,
    pub confidence: f64,
    pub observations: Vec<PriceObservation>,
    /// Retailers that produced no price.
    pub missing: Vec<Retailer>,
}
