//! Terminal front-end: progress bar, step-by-step results, session history.

use crate::pipeline::{PipelineState, ProgressEvent, ProgressSink};
use crate::report::{ConfidenceLevel, Report};
use crate::types::{PriceObservation, Retailer, UrlSet};
use chrono::{DateTime, Local};
use indicatif::{ProgressBar, ProgressStyle};
use std::fmt::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

fn icon(retailer: Retailer) -> &'static str {
    match retailer {
        Retailer::Amazon => "🛒",
        Retailer::Walmart => "🏪",
        Retailer::BestBuy => "🔵",
    }
}

pub fn render_urls(urls: &UrlSet) -> String {
    let mut out = String::from("🔍 Step 1: Product URLs Found\n");
    if urls.is_empty() {
        out.push_str("❌ No product URLs found\n");
        return out;
    }
    let _ = writeln!(out, "✅ Found {} product URLs", urls.len());
    for (retailer, url) in urls.iter() {
        let _ = writeln!(out, "  {} {}: {}", icon(retailer), retailer, url);
    }
    out
}

pub fn render_prices(observations: &[PriceObservation], attempted: usize) -> String {
    let mut out = String::from("💰 Step 2: Price Data Extracted\n");
    if observations.is_empty() {
        out.push_str("❌ No price data extracted\n");
        return out;
    }
    let _ = writeln!(
        out,
        "✅ Extracted {} valid prices from {} retailers",
        observations.len(),
        attempted
    );
    for o in observations {
        let stock = match o.in_stock {
            Some(true) => "in stock",
            Some(false) => "out of stock",
            None => "availability unknown",
        };
        let _ = writeln!(
            out,
            "  {} {}: ${:.2}{} - {} ({})",
            icon(o.retailer),
            o.retailer,
            o.price,
            o.currency
                .as_deref()
                .filter(|c| *c != "USD")
                .map(|c| format!(" {}", c))
                .unwrap_or_default(),
            if o.title.is_empty() { "N/A" } else { o.title.as_str() },
            stock
        );
    }
    out
}

pub fn render_report(report: &Report) -> String {
    let marker = match report.confidence_level() {
        ConfidenceLevel::High => "🟢",
        ConfidenceLevel::Medium => "🟡",
        ConfidenceLevel::Low => "🔴",
    };
    let summary = &report.summary;
    format!(
        "📋 Step 3: Final Analysis Report\n\
         {} {} - Confidence Score: {:.1}/10\n\
         Median ${:.2} | Average ${:.2} | Lowest ${:.2} at {} | Highest ${:.2} at {}\n\n\
         {}\n",
        marker,
        report.confidence_level(),
        report.confidence,
        summary.median,
        summary.mean,
        summary.min.price,
        summary.min.retailer,
        summary.max.price,
        summary.max.retailer,
        report.narrative.trim()
    )
}

/// Final text for a finished run. A failed run shows only the error, never a
/// report, so a fatal error cannot be mistaken for a low-confidence result.
pub fn render_outcome(state: &PipelineState) -> String {
    match (state.failure(), state.report()) {
        (Some(failure), _) => format!("❌ {}\n", failure.error),
        (None, Some(report)) => render_report(report),
        (None, None) => format!("❌ Analysis stopped while {}\n", state.phase()),
    }
}

/// Drives an `indicatif` bar and prints each step's results as they arrive.
pub struct ConsoleProgress {
    bar: ProgressBar,
    /// URLs found by the search step, shown next to the price count.
    attempted: AtomicUsize,
}

impl ConsoleProgress {
    pub fn new() -> Self {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:30.cyan/blue}] {pos:>3}% {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar.enable_steady_tick(std::time::Duration::from_millis(120));
        Self {
            bar,
            attempted: AtomicUsize::new(0),
        }
    }
}

impl Default for ConsoleProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for ConsoleProgress {
    fn on_event(&self, event: ProgressEvent<'_>) {
        match event {
            ProgressEvent::StageStarted {
                message, percent, ..
            } => {
                self.bar.set_message(message);
                self.bar.set_position(u64::from(percent));
            }
            ProgressEvent::UrlsFound(urls) => {
                self.attempted.store(urls.len(), Ordering::Relaxed);
                self.bar.println(render_urls(urls));
                self.bar.set_message("URLs found! Moving to price extraction...");
            }
            ProgressEvent::PricesExtracted(observations) => {
                let attempted = self.attempted.load(Ordering::Relaxed);
                self.bar.println(render_prices(observations, attempted));
                self.bar.set_message("Prices extracted! Generating report...");
            }
            ProgressEvent::Finished(state) => {
                if state.is_done() {
                    self.bar.finish_with_message("Analysis complete!");
                } else {
                    self.bar.abandon_with_message("Analysis failed");
                }
            }
        }
    }
}

/// One finished run as remembered by an interactive session.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub query: String,
    pub at: DateTime<Local>,
    pub outcome: String,
}

/// Runs remembered by an interactive session.
#[derive(Debug, Default)]
pub struct SessionHistory {
    entries: Mutex<Vec<HistoryEntry>>,
}

impl SessionHistory {
    pub fn record(&self, state: &PipelineState) {
        let outcome = match (state.failure(), state.report()) {
            (Some(failure), _) => format!("error: {}", failure.error),
            (None, Some(report)) => format!(
                "median ${:.2}, confidence {:.1}/10",
                report.summary.median, report.confidence
            ),
            (None, None) => format!("stopped while {}", state.phase()),
        };
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(HistoryEntry {
                query: state.query().to_string(),
                at: Local::now(),
                outcome,
            });
        }
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    pub fn render(&self) -> String {
        let entries = self.entries();
        if entries.is_empty() {
            return "No analyses yet.\n".to_string();
        }
        entries
            .iter()
            .map(|e| {
                format!(
                    "[{}] {} -> {}\n",
                    e.at.format("%Y-%m-%d %H:%M:%S"),
                    e.query,
                    e.outcome
                )
            })
            .collect()
    }
}
