//! Linear Search → Extraction → Report orchestration.
//!
//! The orchestrator owns the [`PipelineState`]. Each stage returns its own
//! result and the next state is built from it; once a failure is recorded the
//! remaining stages are skipped.

use crate::capabilities::{FieldExtractor, NarrativeRenderer, PageFetcher, UrlIdentifier};
use crate::config::{PipelineConfig, Settings};
use crate::extract::ExtractionStage;
use crate::llm::LLMProcessor;
use crate::report::{ConfidencePolicy, Report, ReportStage};
use crate::search::SearchStage;
use crate::types::{PriceObservation, UrlSet};
use crate::unlocker::UnlockerClient;
use crate::{PriceError, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Searching,
    Extracting,
    Reporting,
    Done,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Searching => "searching",
            Phase::Extracting => "extracting",
            Phase::Reporting => "reporting",
            Phase::Done => "done",
            Phase::Failed => "failed",
        })
    }
}

/// A fatal error together with the phase it stopped.
#[derive(Debug)]
pub struct StageFailure {
    pub phase: Phase,
    pub error: PriceError,
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (while {})", self.error, self.phase)
    }
}

/// Everything known about one run.
#[derive(Debug)]
pub struct PipelineState {
    query: String,
    phase: Phase,
    urls: UrlSet,
    observations: Vec<PriceObservation>,
    report: Option<Report>,
    failure: Option<StageFailure>,
    started_at: DateTime<Utc>,
}

impl PipelineState {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            phase: Phase::Searching,
            urls: UrlSet::new(),
            observations: Vec::new(),
            report: None,
            failure: None,
            started_at: Utc::now(),
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn urls(&self) -> &UrlSet {
        &self.urls
    }

    pub fn observations(&self) -> &[PriceObservation] {
        &self.observations
    }

    pub fn report(&self) -> Option<&Report> {
        self.report.as_ref()
    }

    pub fn failure(&self) -> Option<&StageFailure> {
        self.failure.as_ref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Narrative text; empty until the run is done.
    pub fn final_report(&self) -> &str {
        self.report.as_ref().map(|r| r.narrative.as_str()).unwrap_or("")
    }

    /// Confidence score; `None` unless the run is done.
    pub fn confidence(&self) -> Option<f64> {
        self.report.as_ref().map(|r| r.confidence)
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    fn with_urls(self, urls: UrlSet) -> Self {
        Self {
            phase: Phase::Extracting,
            urls,
            ..self
        }
    }

    fn with_observations(self, observations: Vec<PriceObservation>) -> Self {
        Self {
            phase: Phase::Reporting,
            observations,
            ..self
        }
    }

    fn with_report(self, report: Report) -> Self {
        Self {
            phase: Phase::Done,
            report: Some(report),
            ..self
        }
    }

    /// Records `error` unless a failure is already recorded.
    fn fail(self, error: PriceError) -> Self {
        if self.failure.is_some() {
            return self;
        }
        error!(phase = %self.phase, error = %error, "Pipeline failed");
        Self {
            failure: Some(StageFailure {
                phase: self.phase,
                error,
            }),
            phase: Phase::Failed,
            ..self
        }
    }
}

/// Events for the front-end, in the order they happen.
#[derive(Debug)]
pub enum ProgressEvent<'a> {
    StageStarted {
        phase: Phase,
        message: &'static str,
        percent: u8,
    },
    UrlsFound(&'a UrlSet),
    PricesExtracted(&'a [PriceObservation]),
    Finished(&'a PipelineState),
}

/// Receives progress while a run is in flight.
pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent<'_>);
}

/// Discards all progress.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_event(&self, _event: ProgressEvent<'_>) {}
}

/// The external services a pipeline talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub identifier: Arc<dyn UrlIdentifier>,
    pub fetcher: Arc<dyn PageFetcher>,
    pub extractor: Arc<dyn FieldExtractor>,
    pub renderer: Arc<dyn NarrativeRenderer>,
}

pub struct Pipeline {
    collaborators: Collaborators,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(collaborators: Collaborators, config: PipelineConfig) -> Self {
        Self {
            collaborators,
            config,
        }
    }

    /// Wires the HTTP clients for both services from startup settings.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let config = settings.pipeline.clone();
        let llm = Arc::new(
            LLMProcessor::new(
                config.llm_config.clone(),
                settings.credentials.llm_api_key.clone(),
                config.call_timeout(),
            )?
            .with_max_page_chars(config.max_page_chars),
        );
        let unlocker = Arc::new(UnlockerClient::new(
            config.clone(),
            settings.credentials.unlocker_token.clone(),
        )?);

        Ok(Self::new(
            Collaborators {
                identifier: llm.clone(),
                fetcher: unlocker,
                extractor: llm.clone(),
                renderer: llm,
            },
            config,
        ))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs all stages for `query` and returns the final state.
    ///
    /// Never returns an error: a fatal failure is recorded in the state and
    /// the state is returned as-is.
    #[instrument(skip(self, progress))]
    pub async fn run(&self, query: &str, progress: &dyn ProgressSink) -> PipelineState {
        let state = PipelineState::new(query.trim());
        let state = self.search(state, progress).await;
        let state = self.extract(state, progress).await;
        let state = self.report(state, progress).await;

        info!(phase = %state.phase(), "Pipeline finished");
        progress.on_event(ProgressEvent::Finished(&state));
        state
    }

    async fn search(&self, state: PipelineState, progress: &dyn ProgressSink) -> PipelineState {
        if state.is_failed() {
            return state;
        }
        progress.on_event(ProgressEvent::StageStarted {
            phase: Phase::Searching,
            message: "Searching for product URLs...",
            percent: 33,
        });

        let mut stage = SearchStage::new(self.collaborators.identifier.as_ref(), &self.config);
        if self.config.discovery {
            stage = stage.with_discovery(self.collaborators.fetcher.as_ref());
        }

        let result = stage.run(state.query()).await;
        match result {
            Ok(urls) => {
                progress.on_event(ProgressEvent::UrlsFound(&urls));
                state.with_urls(urls)
            }
            Err(e) => state.fail(e),
        }
    }

    async fn extract(&self, state: PipelineState, progress: &dyn ProgressSink) -> PipelineState {
        if state.is_failed() {
            return state;
        }
        progress.on_event(ProgressEvent::StageStarted {
            phase: Phase::Extracting,
            message: "Extracting prices from found URLs...",
            percent: 66,
        });

        let stage = ExtractionStage::new(
            self.collaborators.fetcher.as_ref(),
            self.collaborators.extractor.as_ref(),
            &self.config,
        );

        let result = stage.run(state.query(), state.urls()).await;
        match result {
            Ok(observations) => {
                progress.on_event(ProgressEvent::PricesExtracted(&observations));
                state.with_observations(observations)
            }
            Err(e) => state.fail(e),
        }
    }

    async fn report(&self, state: PipelineState, progress: &dyn ProgressSink) -> PipelineState {
        if state.is_failed() {
            return state;
        }
        progress.on_event(ProgressEvent::StageStarted {
            phase: Phase::Reporting,
            message: "Generating final analysis report...",
            percent: 100,
        });

        let stage = ReportStage::new(
            self.collaborators.renderer.as_ref(),
            ConfidencePolicy::from(&self.config.confidence),
            self.config.call_timeout(),
        );

        let result = stage
            .run(state.query(), state.urls(), state.observations().to_vec())
            .await;
        match result {
            Ok(report) => state.with_report(report),
            Err(e) => state.fail(e),
        }
    }
}
