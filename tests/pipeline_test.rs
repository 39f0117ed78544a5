use async_trait::async_trait;
use pricecheck::capabilities::{
    ExtractedFields, FieldExtractor, NarrativeRenderer, NarrativeRequest, PageFetcher,
    UrlIdentifier,
};
use pricecheck::console::render_outcome;
use pricecheck::pipeline::{Collaborators, NoProgress, ProgressEvent, ProgressSink};
use pricecheck::types::{ScrapedContent, SearchPage};
use pricecheck::{Phase, Pipeline, PipelineConfig, PriceError, Result, Retailer, UrlSet};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const AMAZON: &str = "https://www.amazon.com/Apple-iPhone-16-256GB/dp/B0DGHYDZR9";
const WALMART: &str = "https://www.walmart.com/ip/Apple-iPhone-16-256GB/5113183757";
const BESTBUY: &str = "https://www.bestbuy.com/site/apple-iphone-16-256gb/6587822.p";

const PRODUCT_HTML: &str = "<html><body><main><h1>Apple iPhone 16 256GB</h1><p>Buy now</p></main></body></html>";

struct FakeIdentifier {
    urls: Vec<(Retailer, &'static str)>,
    fail: bool,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl FakeIdentifier {
    fn returning(urls: Vec<(Retailer, &'static str)>) -> Self {
        Self {
            urls,
            fail: false,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl UrlIdentifier for FakeIdentifier {
    async fn identify_urls(&self, _query: &str, _pages: &[SearchPage]) -> Result<UrlSet> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(PriceError::LLMError("quota exhausted".to_string()));
        }
        let mut set = UrlSet::new();
        for (retailer, url) in &self.urls {
            set.insert(*retailer, url);
        }
        Ok(set)
    }
}

/// Serves `PRODUCT_HTML` for every URL except those listed as broken or slow.
#[derive(Default)]
struct FakeFetcher {
    broken: Vec<&'static str>,
    slow: Vec<&'static str>,
    reject_token: bool,
    calls: Mutex<Vec<String>>,
}

impl FakeFetcher {
    fn new() -> Self {
        Self::default()
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl PageFetcher for FakeFetcher {
    async fn fetch_html(&self, url: &str) -> Result<String> {
        self.calls.lock().unwrap().push(url.to_string());
        if self.reject_token {
            return Err(PriceError::Unauthorized(
                "unlocker rejected the API token (401 Unauthorized)".to_string(),
            ));
        }
        if self.slow.iter().any(|s| url.starts_with(s)) {
            tokio::time::sleep(Duration::from_secs(600)).await;
        }
        if self.broken.iter().any(|b| url.starts_with(b)) {
            return Err(PriceError::UnlockerError("502 Bad Gateway".to_string()));
        }
        Ok(PRODUCT_HTML.to_string())
    }
}

struct FakeExtractor {
    prices: HashMap<Retailer, Option<f64>>,
    calls: AtomicUsize,
}

impl FakeExtractor {
    fn with_prices(prices: &[(Retailer, Option<f64>)]) -> Self {
        Self {
            prices: prices.iter().cloned().collect(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl FieldExtractor for FakeExtractor {
    async fn extract_fields(
        &self,
        retailer: Retailer,
        page: &ScrapedContent,
    ) -> Result<ExtractedFields> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(page.content.contains("Apple iPhone 16 256GB"));
        Ok(ExtractedFields {
            price: self.prices.get(&retailer).copied().flatten(),
            currency: Some("USD".to_string()),
            title: format!("Apple iPhone 16 256GB ({})", retailer.key()),
            availability: Some("In Stock".to_string()),
        })
    }
}

#[derive(Default)]
struct FakeRenderer {
    fail: bool,
    delay: Option<Duration>,
    requests: Mutex<Vec<NarrativeRequest>>,
}

impl FakeRenderer {
    fn new() -> Self {
        Self::default()
    }

    fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl NarrativeRenderer for FakeRenderer {
    async fn render_narrative(&self, request: &NarrativeRequest) -> Result<String> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(PriceError::LLMError("500 Internal Server Error".to_string()));
        }
        Ok(format!("# {}\nMedian ${:.2}", request.query, request.summary.median))
    }
}

struct Harness {
    identifier: Arc<FakeIdentifier>,
    fetcher: Arc<FakeFetcher>,
    extractor: Arc<FakeExtractor>,
    renderer: Arc<FakeRenderer>,
}

impl Harness {
    fn new(identifier: FakeIdentifier, extractor: FakeExtractor) -> Self {
        Self {
            identifier: Arc::new(identifier),
            fetcher: Arc::new(FakeFetcher::new()),
            extractor: Arc::new(extractor),
            renderer: Arc::new(FakeRenderer::new()),
        }
    }

    fn pipeline(&self, config: PipelineConfig) -> Pipeline {
        Pipeline::new(
            Collaborators {
                identifier: self.identifier.clone(),
                fetcher: self.fetcher.clone(),
                extractor: self.extractor.clone(),
                renderer: self.renderer.clone(),
            },
            config,
        )
    }
}

fn offline_config() -> PipelineConfig {
    PipelineConfig {
        discovery: false,
        ..PipelineConfig::default()
    }
}

fn all_three() -> Vec<(Retailer, &'static str)> {
    vec![
        (Retailer::Amazon, AMAZON),
        (Retailer::Walmart, WALMART),
        (Retailer::BestBuy, BESTBUY),
    ]
}

#[derive(Default)]
struct RecordingProgress {
    events: Mutex<Vec<String>>,
}

impl ProgressSink for RecordingProgress {
    fn on_event(&self, event: ProgressEvent<'_>) {
        let label = match event {
            ProgressEvent::StageStarted { phase, percent, .. } => format!("{}:{}", phase, percent),
            ProgressEvent::UrlsFound(urls) => format!("urls:{}", urls.len()),
            ProgressEvent::PricesExtracted(prices) => format!("prices:{}", prices.len()),
            ProgressEvent::Finished(state) => format!("finished:{}", state.phase()),
        };
        self.events.lock().unwrap().push(label);
    }
}

#[tokio::test]
async fn test_iphone_end_to_end() {
    let harness = Harness::new(
        FakeIdentifier::returning(all_three()),
        FakeExtractor::with_prices(&[
            (Retailer::Amazon, Some(899.00)),
            (Retailer::Walmart, Some(849.00)),
            (Retailer::BestBuy, Some(949.00)),
        ]),
    );
    let progress = RecordingProgress::default();

    let state = harness
        .pipeline(offline_config())
        .run("iPhone 16 256GB", &progress)
        .await;

    assert_eq!(state.phase(), Phase::Done);
    assert!(state.failure().is_none());

    let report = state.report().expect("report");
    assert_eq!(report.summary.mean, 899.0);
    assert_eq!(report.summary.median, 899.0);
    assert_eq!(report.summary.min.price, 849.0);
    assert_eq!(report.summary.min.retailer, Retailer::Walmart);
    assert_eq!(report.summary.min.url, WALMART);
    assert_eq!(report.summary.max.price, 949.0);
    assert_eq!(report.summary.max.retailer, Retailer::BestBuy);
    assert_eq!(report.confidence, 10.0);
    assert_eq!(state.confidence(), Some(10.0));
    assert_eq!(state.final_report(), "# iPhone 16 256GB\nMedian $899.00");

    let observations = state.observations();
    assert_eq!(observations.len(), 3);
    assert_eq!(observations[0].retailer, Retailer::Amazon);
    assert_eq!(observations[0].in_stock, Some(true));

    assert_eq!(
        *progress.events.lock().unwrap(),
        vec![
            "searching:33",
            "urls:3",
            "extracting:66",
            "prices:3",
            "reporting:100",
            "finished:done",
        ]
    );
    assert!(render_outcome(&state).contains("High Confidence - Confidence Score: 10.0/10"));
}

#[tokio::test]
async fn test_no_urls_fails_before_any_scrape() {
    let harness = Harness::new(
        FakeIdentifier::returning(vec![(Retailer::Amazon, ""), (Retailer::Walmart, "n/a")]),
        FakeExtractor::with_prices(&[]),
    );

    let state = harness
        .pipeline(offline_config())
        .run("Nonexistent Gadget 3000", &NoProgress)
        .await;

    assert_eq!(state.phase(), Phase::Failed);
    let failure = state.failure().unwrap();
    assert_eq!(failure.phase, Phase::Extracting);
    assert!(matches!(failure.error, PriceError::NoUrlsFound(_)));
    assert_eq!(harness.fetcher.call_count(), 0);
    assert_eq!(harness.extractor.calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.renderer.call_count(), 0);
    assert!(state.report().is_none());
}

#[tokio::test]
async fn test_no_urls_with_discovery_never_scrapes_product_pages() {
    let harness = Harness::new(
        FakeIdentifier::returning(vec![]),
        FakeExtractor::with_prices(&[]),
    );

    let state = harness
        .pipeline(PipelineConfig::default())
        .run("Nonexistent Gadget 3000", &NoProgress)
        .await;

    assert!(state.is_failed());
    let calls = harness.fetcher.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 3);
    for (call, retailer) in calls.iter().zip(Retailer::ALL) {
        assert_eq!(call, &retailer.search_url("Nonexistent Gadget 3000"));
    }
}

#[tokio::test]
async fn test_no_prices_fails_before_narrative() {
    let harness = Harness::new(
        FakeIdentifier::returning(all_three()),
        FakeExtractor::with_prices(&[
            (Retailer::Amazon, None),
            (Retailer::Walmart, Some(-1.0)),
        ]),
    );

    let state = harness
        .pipeline(offline_config())
        .run("iPhone 16 256GB", &NoProgress)
        .await;

    let failure = state.failure().expect("failure");
    assert_eq!(failure.phase, Phase::Extracting);
    assert!(matches!(failure.error, PriceError::NoPricesFound(_)));
    assert_eq!(harness.fetcher.call_count(), 3);
    assert_eq!(harness.renderer.call_count(), 0);
    assert_eq!(state.final_report(), "");
    assert!(state.confidence().is_none());
}

#[tokio::test]
async fn test_search_failure_short_circuits() {
    let mut identifier = FakeIdentifier::returning(all_three());
    identifier.fail = true;
    let harness = Harness::new(identifier, FakeExtractor::with_prices(&[]));
    let progress = RecordingProgress::default();

    let state = harness
        .pipeline(offline_config())
        .run("iPhone 16 256GB", &progress)
        .await;

    let failure = state.failure().unwrap();
    assert_eq!(failure.phase, Phase::Searching);
    assert!(matches!(failure.error, PriceError::LLMError(_)));
    assert_eq!(harness.fetcher.call_count(), 0);
    assert_eq!(
        *progress.events.lock().unwrap(),
        vec!["searching:33", "finished:failed"]
    );
    assert!(render_outcome(&state).starts_with("❌ LLM processing failed: quota exhausted"));
}

#[tokio::test]
async fn test_partial_results_lower_confidence() {
    let mut harness = Harness::new(
        FakeIdentifier::returning(all_three()),
        FakeExtractor::with_prices(&[
            (Retailer::Amazon, Some(899.00)),
            (Retailer::Walmart, Some(849.00)),
            (Retailer::BestBuy, Some(949.00)),
        ]),
    );
    harness.fetcher = Arc::new(FakeFetcher {
        broken: vec![AMAZON, BESTBUY],
        ..FakeFetcher::default()
    });

    let state = harness
        .pipeline(offline_config())
        .run("iPhone 16 256GB", &NoProgress)
        .await;

    assert!(state.is_done());
    let report = state.report().unwrap();
    assert_eq!(report.observations.len(), 1);
    assert_eq!(report.summary.mean, 849.0);
    assert!((report.confidence - (2.0 + 8.0 / 3.0)).abs() < 1e-9);

    let requests = harness.renderer.requests.lock().unwrap();
    assert_eq!(requests[0].missing, vec![Retailer::Amazon, Retailer::BestBuy]);
    drop(requests);

    // A low-confidence report still renders as a report, not an error.
    let text = render_outcome(&state);
    assert!(text.contains("Low Confidence"));
    assert!(!text.starts_with("❌"));
}

#[tokio::test]
async fn test_narrative_failure_is_fatal() {
    let mut harness = Harness::new(
        FakeIdentifier::returning(all_three()),
        FakeExtractor::with_prices(&[(Retailer::Walmart, Some(849.00))]),
    );
    harness.renderer = Arc::new(FakeRenderer {
        fail: true,
        ..FakeRenderer::default()
    });

    let state = harness
        .pipeline(offline_config())
        .run("iPhone 16 256GB", &NoProgress)
        .await;

    let failure = state.failure().unwrap();
    assert_eq!(failure.phase, Phase::Reporting);
    assert_eq!(state.observations().len(), 1);
    assert!(state.report().is_none());
}

#[tokio::test]
async fn test_blank_query_fails_in_search() {
    let harness = Harness::new(
        FakeIdentifier::returning(all_three()),
        FakeExtractor::with_prices(&[]),
    );

    let state = harness.pipeline(offline_config()).run("   ", &NoProgress).await;

    assert!(matches!(
        state.failure().unwrap().error,
        PriceError::SearchError(_)
    ));
    assert_eq!(harness.identifier.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_slow_search_times_out() {
    let mut identifier = FakeIdentifier::returning(all_three());
    identifier.delay = Some(Duration::from_secs(600));
    let harness = Harness::new(identifier, FakeExtractor::with_prices(&[]));
    let config = PipelineConfig {
        call_timeout_secs: 5,
        ..offline_config()
    };

    let state = harness.pipeline(config).run("iPhone 16 256GB", &NoProgress).await;

    let failure = state.failure().unwrap();
    assert_eq!(failure.phase, Phase::Searching);
    assert!(matches!(failure.error, PriceError::Timeout(d) if d == Duration::from_secs(5)));
}

#[tokio::test(start_paused = true)]
async fn test_slow_product_page_is_a_gap() {
    let mut harness = Harness::new(
        FakeIdentifier::returning(all_three()),
        FakeExtractor::with_prices(&[
            (Retailer::Amazon, Some(899.00)),
            (Retailer::Walmart, Some(849.00)),
            (Retailer::BestBuy, Some(949.00)),
        ]),
    );
    harness.fetcher = Arc::new(FakeFetcher {
        slow: vec![WALMART],
        ..FakeFetcher::default()
    });
    let config = PipelineConfig {
        call_timeout_secs: 5,
        ..offline_config()
    };

    let state = harness.pipeline(config).run("iPhone 16 256GB", &NoProgress).await;

    assert_eq!(state.phase(), Phase::Done);
    let retailers: Vec<Retailer> = state.observations().iter().map(|o| o.retailer).collect();
    assert_eq!(retailers, vec![Retailer::Amazon, Retailer::BestBuy]);
    assert_eq!(harness.extractor.calls.load(Ordering::SeqCst), 2);

    let report = state.report().unwrap();
    assert_eq!(report.summary.median, 924.0);
    assert!((report.confidence - (2.0 + 16.0 / 3.0)).abs() < 1e-9);
    let requests = harness.renderer.requests.lock().unwrap();
    assert_eq!(requests[0].missing, vec![Retailer::Walmart]);
}

#[tokio::test(start_paused = true)]
async fn test_slow_narrative_times_out() {
    let mut harness = Harness::new(
        FakeIdentifier::returning(all_three()),
        FakeExtractor::with_prices(&[(Retailer::Amazon, Some(899.00))]),
    );
    harness.renderer = Arc::new(FakeRenderer {
        delay: Some(Duration::from_secs(600)),
        ..FakeRenderer::default()
    });
    let config = PipelineConfig {
        call_timeout_secs: 5,
        ..offline_config()
    };

    let state = harness.pipeline(config).run("iPhone 16 256GB", &NoProgress).await;

    let failure = state.failure().unwrap();
    assert_eq!(failure.phase, Phase::Reporting);
    assert!(matches!(failure.error, PriceError::Timeout(d) if d == Duration::from_secs(5)));
    assert_eq!(state.observations().len(), 1);
    assert!(state.report().is_none());
    assert_eq!(harness.renderer.call_count(), 1);
}

#[tokio::test]
async fn test_rejected_unlocker_token_is_reported_as_such() {
    let mut harness = Harness::new(
        FakeIdentifier::returning(vec![(Retailer::Amazon, AMAZON), (Retailer::Walmart, WALMART)]),
        FakeExtractor::with_prices(&[]),
    );
    harness.fetcher = Arc::new(FakeFetcher {
        reject_token: true,
        ..FakeFetcher::default()
    });

    let state = harness
        .pipeline(offline_config())
        .run("iPhone 16", &NoProgress)
        .await;

    let failure = state.failure().unwrap();
    assert_eq!(failure.phase, Phase::Extracting);
    assert!(matches!(failure.error, PriceError::Unauthorized(_)));
    assert_eq!(harness.extractor.calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.renderer.call_count(), 0);
    assert!(render_outcome(&state).starts_with("❌ Invalid credentials"));
}

#[tokio::test]
async fn test_rejected_unlocker_token_stops_discovery() {
    let mut harness = Harness::new(
        FakeIdentifier::returning(all_three()),
        FakeExtractor::with_prices(&[]),
    );
    harness.fetcher = Arc::new(FakeFetcher {
        reject_token: true,
        ..FakeFetcher::default()
    });

    let state = harness
        .pipeline(PipelineConfig::default())
        .run("iPhone 16", &NoProgress)
        .await;

    let failure = state.failure().unwrap();
    assert_eq!(failure.phase, Phase::Searching);
    assert!(matches!(failure.error, PriceError::Unauthorized(_)));
    assert_eq!(harness.fetcher.call_count(), 1);
    assert_eq!(harness.identifier.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_concurrent_extraction_keeps_retailer_order() {
    let harness = Harness::new(
        FakeIdentifier::returning(all_three()),
        FakeExtractor::with_prices(&[
            (Retailer::Amazon, Some(3.0)),
            (Retailer::Walmart, Some(1.0)),
            (Retailer::BestBuy, Some(2.0)),
        ]),
    );
    let config = PipelineConfig {
        concurrent_requests: 3,
        ..offline_config()
    };

    let state = harness.pipeline(config).run("widget", &NoProgress).await;

    let order: Vec<Retailer> = state.observations().iter().map(|o| o.retailer).collect();
    assert_eq!(order, Retailer::ALL.to_vec());
    assert_eq!(state.report().unwrap().summary.median, 2.0);
}
