use chrono::{DateTime, Utc};
use reqwest::Url;
use std::collections::HashMap;
use std::fmt;

/// The retailers the pipeline queries.
///
/// Every place that dispatches on a retailer matches exhaustively, so adding a
/// variant is a compile-checked change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Retailer {
    Amazon,
    Walmart,
    BestBuy,
}

impl Retailer {
    /// All supported retailers, in report order.
    pub const ALL: [Retailer; 3] = [Retailer::Amazon, Retailer::Walmart, Retailer::BestBuy];

    /// Stable lowercase key, used in LLM schemas and logs.
    pub fn key(self) -> &'static str {
        match self {
            Retailer::Amazon => "amazon",
            Retailer::Walmart => "walmart",
            Retailer::BestBuy => "bestbuy",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Retailer::Amazon => "Amazon",
            Retailer::Walmart => "Walmart",
            Retailer::BestBuy => "Best Buy",
        }
    }

    /// The registrable domain product pages live on.
    pub fn domain(self) -> &'static str {
        match self {
            Retailer::Amazon => "amazon.com",
            Retailer::Walmart => "walmart.com",
            Retailer::BestBuy => "bestbuy.com",
        }
    }

    pub fn base_url(self) -> String {
        format!("https://www.{}", self.domain())
    }

    /// The retailer's own search results page for `query`.
    pub fn search_url(self, query: &str) -> String {
        let encoded = urlencoding::encode(query.trim());
        match self {
            Retailer::Amazon => format!("https://www.amazon.com/s?k={}", encoded),
            Retailer::Walmart => format!("https://www.walmart.com/search?q={}", encoded),
            Retailer::BestBuy => {
                format!("https://www.bestbuy.com/site/searchpage.jsp?st={}", encoded)
            }
        }
    }

    /// Heuristic for "this path is a single product page, not a listing".
    pub fn is_product_path(self, path: &str) -> bool {
        match self {
            Retailer::Amazon => path.contains("/dp/") || path.contains("/gp/product/"),
            Retailer::Walmart => path.starts_with("/ip/"),
            Retailer::BestBuy => path.starts_with("/site/") && path.ends_with(".p"),
        }
    }

    /// True when `url` is served from this retailer's domain.
    pub fn owns(self, url: &Url) -> bool {
        let domain = self.domain();
        url.host_str()
            .map(|host| host == domain || host.ends_with(&format!(".{}", domain)))
            .unwrap_or(false)
    }

    pub fn from_key(key: &str) -> Option<Retailer> {
        Retailer::ALL
            .into_iter()
            .find(|r| r.key().eq_ignore_ascii_case(key.trim()))
    }
}

impl fmt::Display for Retailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// One optional product-page URL per retailer.
///
/// Entries are either a valid http(s) URL on the retailer's own domain or
/// absent. Blank, malformed and foreign URLs are all stored as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlSet {
    amazon: Option<Url>,
    walmart: Option<Url>,
    best_buy: Option<Url>,
}

impl UrlSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, retailer: Retailer) -> Option<&Url> {
        match retailer {
            Retailer::Amazon => self.amazon.as_ref(),
            Retailer::Walmart => self.walmart.as_ref(),
            Retailer::BestBuy => self.best_buy.as_ref(),
        }
    }

    fn slot_mut(&mut self, retailer: Retailer) -> &mut Option<Url> {
        match retailer {
            Retailer::Amazon => &mut self.amazon,
            Retailer::Walmart => &mut self.walmart,
            Retailer::BestBuy => &mut self.best_buy,
        }
    }

    /// Stores `raw` for `retailer` if it validates, otherwise marks the
    /// retailer absent. Returns whether a URL was stored.
    pub fn insert(&mut self, retailer: Retailer, raw: &str) -> bool {
        let parsed = parse_product_url(retailer, raw);
        let stored = parsed.is_some();
        *self.slot_mut(retailer) = parsed;
        stored
    }

    pub fn remove(&mut self, retailer: Retailer) -> Option<Url> {
        self.slot_mut(retailer).take()
    }

    /// Present entries, in [`Retailer::ALL`] order.
    pub fn iter(&self) -> impl Iterator<Item = (Retailer, &Url)> + '_ {
        Retailer::ALL
            .into_iter()
            .filter_map(move |r| self.get(r).map(|url| (r, url)))
    }

    /// Retailers with no URL.
    pub fn missing(&self) -> impl Iterator<Item = Retailer> + '_ {
        Retailer::ALL.into_iter().filter(move |r| self.get(*r).is_none())
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn parse_product_url(retailer: Retailer, raw: &str) -> Option<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let url = Url::parse(trimmed).ok()?;
    if !matches!(url.scheme(), "http" | "https") || !retailer.owns(&url) {
        return None;
    }
    Some(url)
}

/// One retailer's extracted price for the queried product.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceObservation {
    pub retailer: Retailer,
    pub price: f64,
    /// ISO currency code when the page stated one.
    pub currency: Option<String>,
    pub title: String,
    pub url: String,
    /// `Some(true)` in stock, `Some(false)` out of stock, `None` unknown.
    pub in_stock: Option<bool>,
    /// The availability label as the page phrased it.
    pub availability: Option<String>,
}

/// Maps a free-text availability label to an in-stock flag.
///
/// Labels are compared with spaces and punctuation removed, so schema.org
/// tokens such as `OutOfStock` match the same phrases as page text. Negated
/// phrases are checked first: "not in stock" must not read as "in stock".
pub fn availability_flag(label: &str) -> Option<bool> {
    let compact: String = label
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect();

    let negative = [
        "outofstock",
        "notinstock",
        "unavailable",
        "notavailable",
        "nolongeravailable",
        "soldout",
        "notsold",
        "discontinued",
    ];
    if negative.iter().any(|p| compact.contains(p)) {
        return Some(false);
    }
    let positive = ["instock", "available", "ships", "addtocart", "pickup"];
    if positive.iter().any(|p| compact.contains(p)) {
        return Some(true);
    }
    None
}

/// The `ScrapedContent` struct represents a page reduced to prompt-sized text.
#[derive(Debug, Clone)]
pub struct ScrapedContent {
    /// The URL the page was fetched from.
    pub url: String,
    /// Visible text of the page's main content.
    pub content: String,
    /// Hints pulled from markup: `title`, `price`, `currency`, `availability`.
    pub metadata: HashMap<String, String>,
    /// When the page was reduced.
    pub timestamp: DateTime<Utc>,
}

/// Product-link candidates pulled from one retailer's search results page.
#[derive(Debug, Clone)]
pub struct SearchPage {
    pub retailer: Retailer,
    pub search_url: String,
    pub candidates: Vec<String>,
}
