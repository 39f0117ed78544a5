use crate::capabilities::{PageFetcher, UrlIdentifier};
use crate::config::PipelineConfig;
use crate::scraper::product_links;
use crate::types::{Retailer, SearchPage, UrlSet};
use crate::{with_timeout, PriceError, Result};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// The `SearchStage` turns a product name into one candidate URL per retailer.
///
/// With a fetcher attached it first renders each retailer's own search page
/// and hands the product links it finds to the identifier.
pub struct SearchStage<'a> {
    identifier: &'a dyn UrlIdentifier,
    /// Search-page fetcher; `None` skips discovery.
    fetcher: Option<&'a dyn PageFetcher>,
    max_candidates: usize,
    timeout: Duration,
}

impl<'a> SearchStage<'a> {
    pub fn new(identifier: &'a dyn UrlIdentifier, config: &PipelineConfig) -> Self {
        Self {
            identifier,
            fetcher: None,
            max_candidates: config.max_candidates,
            timeout: config.call_timeout(),
        }
    }

    /// Enables discovery through `fetcher`.
    pub fn with_discovery(mut self, fetcher: &'a dyn PageFetcher) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Performs the search for `query`.
    ///
    /// # Returns
    ///
    /// The URL Set, possibly with every retailer absent. Errors only when the
    /// query is blank or the identifier call itself fails.
    #[instrument(skip(self))]
    pub async fn run(&self, query: &str) -> Result<UrlSet> {
        let query = query.trim();
        if query.is_empty() {
            return Err(PriceError::SearchError("product name is empty".to_string()));
        }

        let pages = match self.fetcher {
            Some(fetcher) => self.discover(fetcher, query).await?,
            None => Vec::new(),
        };

        let urls =
            with_timeout(self.timeout, self.identifier.identify_urls(query, &pages)).await?;

        for retailer in urls.missing() {
            debug!(retailer = retailer.key(), "No product URL");
        }
        info!(found = urls.len(), "Product URLs identified");

        Ok(urls)
    }

    /// Fetches each retailer's search page. A page that fails to load is
    /// left out; a rejected credential aborts discovery.
    async fn discover(
        &self,
        fetcher: &dyn PageFetcher,
        query: &str,
    ) -> Result<Vec<SearchPage>> {
        let mut pages = Vec::new();

        for retailer in Retailer::ALL {
            let search_url = retailer.search_url(query);
            match with_timeout(self.timeout, fetcher.fetch_html(&search_url)).await {
                Ok(html) => {
                    let candidates = product_links(&html, retailer, self.max_candidates);
                    debug!(
                        retailer = retailer.key(),
                        candidates = candidates.len(),
                        "Search page parsed"
                    );
                    pages.push(SearchPage {
                        retailer,
                        search_url,
                        candidates,
                    });
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(retailer = retailer.key(), error = %e, "Search page unavailable");
                }
            }
        }

        Ok(pages)
    }
}
