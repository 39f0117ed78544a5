use crate::capabilities::{ExtractedFields, FieldExtractor, PageFetcher};
use crate::config::PipelineConfig;
use crate::scraper::ContentScraper;
use crate::types::{availability_flag, PriceObservation, Retailer, UrlSet};
use crate::{with_timeout, PriceError, Result};
use futures::{stream, StreamExt};
use reqwest::Url;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// The `ExtractionStage` fetches each product page and pulls a price from it.
pub struct ExtractionStage<'a> {
    fetcher: &'a dyn PageFetcher,
    extractor: &'a dyn FieldExtractor,
    scraper: ContentScraper,
    concurrent_requests: usize,
    timeout: Duration,
}

impl<'a> ExtractionStage<'a> {
    pub fn new(
        fetcher: &'a dyn PageFetcher,
        extractor: &'a dyn FieldExtractor,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            fetcher,
            extractor,
            scraper: ContentScraper::default().with_max_chars(config.max_page_chars),
            concurrent_requests: config.concurrent_requests.max(1),
            timeout: config.call_timeout(),
        }
    }

    /// Collects one observation per retailer whose page yields a price.
    ///
    /// # Returns
    ///
    /// Observations in retailer order. Fails with `NoUrlsFound` on an empty
    /// URL Set (before any fetch) and `NoPricesFound` when no retailer yields
    /// a price. A rejected credential fails the stage instead of leaving a gap.
    #[instrument(skip(self, urls), fields(urls = urls.len()))]
    pub async fn run(&self, query: &str, urls: &UrlSet) -> Result<Vec<PriceObservation>> {
        if urls.is_empty() {
            return Err(PriceError::NoUrlsFound(query.to_string()));
        }

        let results = stream::iter(urls.iter())
            .map(|(retailer, url)| async move { (retailer, self.observe(retailer, url).await) })
            .buffered(self.concurrent_requests)
            .collect::<Vec<_>>()
            .await;

        let mut observations = Vec::new();
        for (retailer, result) in results {
            match result {
                Ok(Some(observation)) => observations.push(observation),
                Ok(None) => debug!(retailer = retailer.key(), "No usable price on page"),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(retailer = retailer.key(), error = %e, "Price extraction failed"),
            }
        }

        info!(
            found = observations.len(),
            attempted = urls.len(),
            "Price extraction finished"
        );

        if observations.is_empty() {
            return Err(PriceError::NoPricesFound(query.to_string()));
        }
        Ok(observations)
    }

    async fn observe(&self, retailer: Retailer, url: &Url) -> Result<Option<PriceObservation>> {
        let html = with_timeout(self.timeout, self.fetcher.fetch_html(url.as_str())).await?;
        let page = self.scraper.extract(&html, url.as_str())?;
        let fields =
            with_timeout(self.timeout, self.extractor.extract_fields(retailer, &page)).await?;

        Ok(into_observation(retailer, url, fields))
    }
}

/// Builds an observation when `fields` carries a usable price.
///
/// A missing, non-finite or non-positive price means no observation.
pub fn into_observation(
    retailer: Retailer,
    url: &Url,
    fields: ExtractedFields,
) -> Option<PriceObservation> {
    let price = fields.price.filter(|p| p.is_finite() && *p > 0.0)?;

    let availability = fields
        .availability
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty());

    Some(PriceObservation {
        retailer,
        price,
        currency: fields
            .currency
            .map(|c| c.trim().to_ascii_uppercase())
            .filter(|c| !c.is_empty()),
        title: fields.title.trim().to_string(),
        url: url.to_string(),
        in_stock: availability.as_deref().and_then(availability_flag),
        availability,
    })
}
