use crate::{PriceError, Result, Retailer, ScrapedContent};
use reqwest::Url;
use scraper::{Html, Selector};
use std::collections::HashMap;
use tracing::{debug, instrument};

/// The `ContentScraper` struct reduces a rendered product page to prompt-sized text
/// plus the product hints the markup exposes.
/// It uses CSS selectors to identify the relevant parts of the document.
pub struct ContentScraper {
    /// Selectors tried in order for the page's main text; first non-empty match wins.
    selectors: Vec<Selector>,
    /// Metadata keys mapped to alternative selectors, highest priority first.
    metadata_selectors: HashMap<String, Vec<Selector>>,
    /// Page text is cut to this many characters.
    max_chars: usize,
}

impl Default for ContentScraper {
    /// Provides selectors for the supported retailers' product pages.
    fn default() -> Self {
        let default_selectors = [
            "#centerCol, #ppd",
            "[data-testid='product-details'], section[data-testid]",
            ".shop-product-title, .priceView-hero-price, .shop-product-description",
            "main",
            "body",
        ];

        let metadata_selectors = [
            (
                "title",
                "meta[property='og:title'], #productTitle, h1, title",
            ),
            (
                "price",
                "meta[property='product:price:amount'], meta[itemprop='price'], [itemprop='price'], span.a-price span.a-offscreen, .priceView-customer-price span",
            ),
            (
                "currency",
                "meta[property='product:price:currency'], meta[itemprop='priceCurrency']",
            ),
            (
                "availability",
                "link[itemprop='availability'], #availability, [data-testid='fulfillment-badge'], .fulfillment-add-to-cart-button",
            ),
        ];

        Self::new(default_selectors, metadata_selectors)
    }
}

impl ContentScraper {
    /// Creates a new `ContentScraper` with the given content and metadata selectors.
    ///
    /// # Arguments
    ///
    /// * `content_selectors` - CSS selectors for the main content, tried in order.
    /// * `metadata_selectors` - Pairs of metadata key and CSS selector. Comma-separated
    ///   alternatives are tried left to right rather than in document order.
    ///
    /// # Returns
    ///
    /// A new instance of `ContentScraper`. Selectors that fail to parse are skipped.
    pub fn new(
        content_selectors: impl IntoIterator<Item = impl AsRef<str>>,
        metadata_selectors: impl IntoIterator<Item = (impl Into<String>, impl AsRef<str>)>,
    ) -> Self {
        let selectors = content_selectors
            .into_iter()
            .filter_map(|s| Selector::parse(s.as_ref()).ok())
            .collect();

        let metadata_selectors = metadata_selectors
            .into_iter()
            .map(|(key, sel)| {
                let key: String = key.into();
                let alternatives = sel
                    .as_ref()
                    .split(',')
                    .filter_map(|alt| Selector::parse(alt.trim()).ok())
                    .collect::<Vec<_>>();
                (key, alternatives)
            })
            .filter(|(_, alternatives)| !alternatives.is_empty())
            .collect();

        Self {
            selectors,
            metadata_selectors,
            max_chars: 20_000,
        }
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars.max(1);
        self
    }

    /// Extracts the main content and product hints from the given HTML string.
    ///
    /// # Arguments
    ///
    /// * `html` - The rendered page.
    /// * `url` - The URL the page was fetched from.
    ///
    /// # Returns
    ///
    /// The reduced page, or `ExtractionError` if no selector yields any text.
    #[instrument(skip(self, html), fields(html_length = html.len()))]
    pub fn extract(&self, html: &str, url: &str) -> Result<ScrapedContent> {
        let document = Html::parse_document(html);

        let content = self.extract_content(&document)?;
        let metadata = self.extract_metadata(&document);
        debug!(chars = content.len(), hints = metadata.len(), "Page reduced");

        Ok(ScrapedContent {
            url: url.to_string(),
            content,
            metadata,
            timestamp: chrono::Utc::now(),
        })
    }

    fn extract_content(&self, document: &Html) -> Result<String> {
        for selector in &self.selectors {
            let content = self.extract_text_by_selector(document, selector);
            if !content.is_empty() {
                return Ok(truncate(&clean_text(&content), self.max_chars));
            }
        }

        Err(PriceError::ExtractionError(
            "No content found with available selectors".to_string(),
        ))
    }

    fn extract_metadata(&self, document: &Html) -> HashMap<String, String> {
        let mut metadata = HashMap::new();

        for (key, alternatives) in &self.metadata_selectors {
            let value = alternatives
                .iter()
                .find_map(|selector| self.extract_metadata_value(document, selector));
            if let Some(value) = value {
                metadata.insert(key.clone(), value);
            }
        }

        metadata
    }

    /// Reads a hint from the first matching element: `content` attribute
    /// (meta tags), then `href` (schema.org links), then text.
    fn extract_metadata_value(&self, document: &Html, selector: &Selector) -> Option<String> {
        document.select(selector).find_map(|element| {
            let value = element.value();
            if let Some(content) = value.attr("content") {
                return Some(content.trim().to_string()).filter(|s| !s.is_empty());
            }
            if value.name() == "link" {
                return value
                    .attr("href")
                    .and_then(|href| href.rsplit('/').next())
                    .map(str::to_string);
            }

            let text = clean_text(&element.text().collect::<Vec<_>>().join(" "));
            if text.is_empty() {
                None
            } else {
                Some(text)
            }
        })
    }

    fn extract_text_by_selector(&self, document: &Html, selector: &Selector) -> String {
        document
            .select(selector)
            .map(|element| element.text().collect::<Vec<_>>().join(" "))
            .filter(|s| !s.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }
}

/// Pulls product-page links for `retailer` out of its search results page.
///
/// Relative links are resolved against the retailer's home page. Query strings
/// and fragments are dropped so the same product only appears once.
///
/// # Arguments
///
/// * `html` - The rendered search results page.
/// * `retailer` - The retailer whose product links to keep.
/// * `limit` - Maximum number of links to return.
///
/// # Returns
///
/// Distinct product URLs in page order.
pub fn product_links(html: &str, retailer: Retailer, limit: usize) -> Vec<String> {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    let Ok(base) = Url::parse(&retailer.base_url()) else {
        return Vec::new();
    };

    let mut links: Vec<String> = Vec::new();
    for anchor in document.select(&selector) {
        if links.len() >= limit {
            break;
        }
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let Some(url) = clean_product_url(&base, href, retailer) else {
            continue;
        };
        if !links.contains(&url) {
            debug!(retailer = retailer.key(), url = %url, "Candidate product link");
            links.push(url);
        }
    }

    links
}

fn clean_product_url(base: &Url, href: &str, retailer: Retailer) -> Option<String> {
    if href.starts_with("javascript:") || href.starts_with('#') {
        return None;
    }
    let mut url = base.join(href).ok()?;
    if !retailer.owns(&url) || !retailer.is_product_path(url.path()) {
        return None;
    }
    // Best Buy identifies the SKU in the path; the query only carries tracking.
    url.set_query(None);
    url.set_fragment(None);
    Some(url.to_string())
}

/// Collapses whitespace and drops control characters.
pub(crate) fn clean_text(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Cuts `text` to at most `max_chars` characters on a char boundary.
pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
