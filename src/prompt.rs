use crate::capabilities::NarrativeRequest;
use crate::scraper::{clean_text, truncate};
use crate::types::{Retailer, ScrapedContent, SearchPage};
use std::fmt::Write;

/// System prompt for URL discovery.
pub const URL_DISCOVERY_SYSTEM: &str = "You are a product search specialist. \
Find direct product pages for the given product on Amazon, Walmart and Best Buy. \
Return product page URLs, never search result pages. Focus on exact matches for \
the product; leave a retailer empty rather than guessing a different product.";

/// System prompt for field extraction.
pub const EXTRACTION_SYSTEM: &str = "You are a price extraction specialist. \
Extract accurate product information from a retailer page. Use the main selling \
price, not the list price, MSRP or a crossed-out price. Return the price as a \
plain number without currency symbols; leave it empty if the page shows none.";

/// System prompt for the report narrative.
pub const REPORT_SYSTEM: &str = "Create a clean, professional price analysis report. \
Use clear sections: the product name as a header, a price summary with median, \
average and range, a per-retailer breakdown, and the confidence score with a short \
summary. Use the figures exactly as given; do not recompute them.";

/// The `PromptBuilder` struct assembles a prompt from an instruction and page contents.
pub struct PromptBuilder {
    /// The instruction placed before the sources.
    query: String,
    /// The list of scraped content to be included in the prompt.
    contents: Vec<ScrapedContent>,
    /// Per-source cap on content characters.
    max_chars: usize,
}

impl PromptBuilder {
    /// Creates a new `PromptBuilder` with the given instruction.
    ///
    /// # Arguments
    ///
    /// * `query` - The instruction to be included in the prompt.
    ///
    /// # Returns
    ///
    /// A new instance of `PromptBuilder`.
    pub fn new(query: String) -> Self {
        Self {
            query,
            contents: Vec::new(),
            max_chars: usize::MAX,
        }
    }

    /// Adds the given contents to the `PromptBuilder`.
    pub fn with_contents(mut self, contents: Vec<ScrapedContent>) -> Self {
        self.contents = contents;
        self
    }

    /// Caps each source's content at `max_chars` characters.
    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }

    /// Builds the prompt string by formatting the instruction and sources.
    ///
    /// # Returns
    ///
    /// The instruction followed by one block per source, each carrying the
    /// source URL, any markup hints, and the cleaned content.
    pub fn build(&self) -> String {
        let formatted_contents = self
            .contents
            .iter()
            .map(|c| {
                let mut hints: Vec<_> = c.metadata.iter().collect();
                hints.sort();
                let hints = hints
                    .into_iter()
                    .map(|(k, v)| format!("{}: {}", k, clean_text(v)))
                    .collect::<Vec<_>>()
                    .join("\n");
                format!(
                    "Source: {}\nFetched: {}\nPage hints:\n{}\nContent:\n{}\n---\n",
                    c.url,
                    c.timestamp.to_rfc3339(),
                    if hints.is_empty() { "(none)" } else { hints.as_str() },
                    truncate(&clean_text(&c.content), self.max_chars)
                )
            })
            .collect::<String>();

        format!("{}\n\n{}", self.query.trim(), formatted_contents)
            .trim_end()
            .to_string()
    }
}

/// Prompt asking for one product URL per retailer.
pub fn url_discovery_prompt(query: &str, pages: &[SearchPage]) -> String {
    let mut prompt = format!(
        "Find product pages for: {}\n\n\
         For each of Amazon, Walmart and Best Buy, give the direct URL of the product page.\n",
        query.trim()
    );

    for page in pages {
        let _ = write!(
            prompt,
            "\n{} search results ({}):\n",
            page.retailer.display_name(),
            page.search_url
        );
        if page.candidates.is_empty() {
            prompt.push_str("- (no product links found)\n");
        }
        for candidate in &page.candidates {
            let _ = writeln!(prompt, "- {}", candidate);
        }
    }

    if !pages.is_empty() {
        prompt.push_str(
            "\nPrefer a URL from the search results above when one matches the product exactly.\n",
        );
    }

    prompt
}

/// Prompt asking for the fixed product fields of one page.
pub fn extraction_prompt(retailer: Retailer, page: &ScrapedContent, max_chars: usize) -> String {
    PromptBuilder::new(format!(
        "Extract the current price, currency, product title and availability \
         from this {} product page.",
        retailer.display_name()
    ))
    .with_contents(vec![page.clone()])
    .with_max_chars(max_chars)
    .build()
}

/// Prompt carrying the computed figures for the narrative.
pub fn report_prompt(request: &NarrativeRequest) -> String {
    let summary = &request.summary;
    let mut breakdown = String::new();
    for observation in &request.observations {
        let _ = writeln!(
            breakdown,
            "- {}: ${:.2} - {}",
            observation.retailer.display_name(),
            observation.price,
            if observation.title.is_empty() {
                "N/A"
            } else {
                observation.title.as_str()
            }
        );
    }
    for retailer in &request.missing {
        let _ = writeln!(breakdown, "- {}: No price found", retailer.display_name());
    }

    format!(
        "Create a price analysis report:\n\n\
         Product: {}\n\
         Median Price: ${:.2}\n\
         Average Price: ${:.2}\n\
         Price Range: ${:.2} ({}) - ${:.2} ({})\n\
         Confidence Score: {:.1}/10\n\n\
         Retailer Data:\n{}",
        request.query,
        summary.median,
        summary.mean,
        summary.min.price,
        summary.min.retailer.display_name(),
        summary.max.price,
        summary.max.retailer.display_name(),
        request.confidence,
        breakdown
    )
}
