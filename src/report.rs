use crate::capabilities::{NarrativeRenderer, NarrativeRequest};
use crate::config::ConfidenceConfig;
use crate::types::{PriceObservation, Retailer, UrlSet};
use crate::{with_timeout, PriceError, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use tracing::{info, instrument};

/// A price together with where it was observed.
#[derive(Debug, Clone, PartialEq)]
pub struct PricePoint {
    pub retailer: Retailer,
    pub price: f64,
    pub url: String,
}

/// Figures computed locally over the observations.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceSummary {
    pub mean: f64,
    pub median: f64,
    pub min: PricePoint,
    pub max: PricePoint,
    pub count: usize,
}

/// Computes mean, median, min and max. `None` for an empty slice.
///
/// Ties on min or max go to the first observation in input order.
pub fn summarize(observations: &[PriceObservation]) -> Option<PriceSummary> {
    let first = observations.first()?;

    let mut min = first;
    let mut max = first;
    for observation in &observations[1..] {
        if observation.price < min.price {
            min = observation;
        }
        if observation.price > max.price {
            max = observation;
        }
    }

    let count = observations.len();
    let mean = observations.iter().map(|o| o.price).sum::<f64>() / count as f64;

    let mut prices: Vec<f64> = observations.iter().map(|o| o.price).collect();
    prices.sort_by(|a, b| a.total_cmp(b));
    let mid = count / 2;
    let median = if count % 2 == 0 {
        (prices[mid - 1] + prices[mid]) / 2.0
    } else {
        prices[mid]
    };

    let point = |o: &PriceObservation| PricePoint {
        retailer: o.retailer,
        price: o.price,
        url: o.url.clone(),
    };

    Some(PriceSummary {
        mean,
        median,
        min: point(min),
        max: point(max),
        count,
    })
}

/// The coverage heuristic behind the confidence score.
///
/// `clamp(0, ceiling, base + weight * found / supported)`. Not a calibrated
/// probability: it only says how many retailers contributed.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfidencePolicy {
    pub base: f64,
    pub weight: f64,
    pub ceiling: f64,
    pub supported: usize,
}

impl ConfidencePolicy {
    pub fn score(&self, found: usize) -> f64 {
        let supported = self.supported.max(1) as f64;
        let raw = self.base + self.weight.max(0.0) * (found as f64 / supported);
        if raw.is_nan() {
            return 0.0;
        }
        raw.clamp(0.0, self.ceiling.max(0.0).min(ConfidenceConfig::MAX_SCORE))
    }
}

impl Default for ConfidencePolicy {
    fn default() -> Self {
        Self::from(&ConfidenceConfig::default())
    }
}

impl From<&ConfidenceConfig> for ConfidencePolicy {
    fn from(config: &ConfidenceConfig) -> Self {
        Self {
            base: config.base,
            weight: config.weight.max(0.0),
            ceiling: config.ceiling.clamp(0.0, ConfidenceConfig::MAX_SCORE),
            supported: config
                .supported_retailers
                .filter(|n| *n > 0)
                .unwrap_or(Retailer::ALL.len()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

impl ConfidenceLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= 8.0 {
            ConfidenceLevel::High
        } else if score >= 6.0 {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::Low
        }
    }
}

impl fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConfidenceLevel::High => "High Confidence",
            ConfidenceLevel::Medium => "Medium Confidence",
            ConfidenceLevel::Low => "Low Confidence",
        })
    }
}

/// The terminal artifact of a successful run.
#[derive(Debug, Clone)]
pub struct Report {
    pub query: String,
    pub summary: PriceSummary,
    pub confidence: f64,
    pub narrative: String,
    pub observations: Vec<PriceObservation>,
    pub generated_at: DateTime<Utc>,
}

impl Report {
    pub fn confidence_level(&self) -> ConfidenceLevel {
        ConfidenceLevel::from_score(self.confidence)
    }
}

/// Turns observations into a [`Report`].
pub struct ReportStage<'a> {
    renderer: &'a dyn NarrativeRenderer,
    policy: ConfidencePolicy,
    timeout: Duration,
}

impl<'a> ReportStage<'a> {
    pub fn new(
        renderer: &'a dyn NarrativeRenderer,
        policy: ConfidencePolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            renderer,
            policy,
            timeout,
        }
    }

    /// Computes the figures locally, then asks for the narrative.
    ///
    /// Empty `observations` fail with `NoPricesFound` without calling the
    /// renderer; a renderer failure is returned as-is.
    #[instrument(skip_all, fields(query = %query, observations = observations.len()))]
    pub async fn run(
        &self,
        query: &str,
        urls: &UrlSet,
        observations: Vec<PriceObservation>,
    ) -> Result<Report> {
        let summary = summarize(&observations)
            .ok_or_else(|| PriceError::NoPricesFound(query.to_string()))?;
        let confidence = self.policy.score(observations.len());

        let missing = Retailer::ALL
            .into_iter()
            .filter(|r| urls.get(*r).is_some())
            .filter(|r| observations.iter().all(|o| o.retailer != *r))
            .collect();

        let request = NarrativeRequest {
            query: query.to_string(),
            summary: summary.clone(),
            confidence,
            observations: observations.clone(),
            missing,
        };
        let narrative =
            with_timeout(self.timeout, self.renderer.render_narrative(&request)).await?;

        info!(
            mean = summary.mean,
            median = summary.median,
            confidence,
            "Report generated"
        );

        Ok(Report {
            query: query.to_string(),
            summary,
            confidence,
            narrative,
            observations,
            generated_at: Utc::now(),
        })
    }
}
