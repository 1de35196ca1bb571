//! Per-request execution trace.
//!
//! The orchestrator owns exactly one [`ExecutionTrace`] per request and is
//! the only writer. Stage results are appended strictly in stage order:
//!
//! ```text
//! Idle ─▶ Retrieving ─┬─▶ Reranking ─┬─▶ Generating ─▶ Done
//!                     └──────────────┘
//!          (any state) ─────────────────────────────▶ Failed
//! ```
//!
//! Totals are derived from the recorded stages when the request reaches
//! `Done`; nothing is re-measured.

use std::fmt;
use std::time::Instant;

use serde::Serialize;

use crate::models::{Candidate, Document};

/// A pipeline stage, as named in metrics and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Retrieval,
    Rerank,
    Generation,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Retrieval => "retrieval",
            Stage::Rerank => "rerank",
            Stage::Generation => "generation",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orchestrator state for a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Idle,
    Retrieving,
    Reranking,
    Generating,
    Done,
    Failed,
}

impl PipelineState {
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Idle, Retrieving)
                | (Retrieving, Reranking)
                | (Retrieving, Generating)
                | (Reranking, Generating)
                | (Generating, Done)
                | (Idle | Retrieving | Reranking | Generating, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }
}

/// Timing for one executed stage. Immutable once sealed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageMetrics {
    pub stage_name: String,
    pub duration_seconds: f64,
}

impl StageMetrics {
    /// Metrics for a stage that was entered but did no work.
    pub fn zero(stage: Stage) -> Self {
        Self {
            stage_name: stage.to_string(),
            duration_seconds: 0.0,
        }
    }
}

/// Started on stage entry, sealed into [`StageMetrics`] on exit.
#[derive(Debug)]
pub struct StageTimer {
    stage: Stage,
    started: Instant,
}

impl StageTimer {
    pub fn start(stage: Stage) -> Self {
        Self {
            stage,
            started: Instant::now(),
        }
    }

    pub fn finish(self) -> StageMetrics {
        StageMetrics {
            stage_name: self.stage.to_string(),
            duration_seconds: self.started.elapsed().as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResult {
    pub metrics: StageMetrics,
    pub candidates: Vec<Candidate>,
    /// The text that was actually sent to the index.
    pub search_query: String,
    /// Whether `search_query` is a hypothetical-answer rewrite.
    pub rewritten: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RerankResult {
    pub metrics: StageMetrics,
    pub candidates: Vec<Candidate>,
    /// Judge tokens summed over all successful calls. `None` when skipped.
    pub tokens_consumed: Option<u64>,
    /// True when the judge failed its liveness probe and nothing was scored.
    pub skipped: bool,
    pub scored: usize,
    pub failed: usize,
}

impl RerankResult {
    /// Pass-through result for a judge that is not reachable.
    pub fn skipped(candidates: Vec<Candidate>) -> Self {
        Self {
            metrics: StageMetrics::zero(Stage::Rerank),
            candidates,
            tokens_consumed: None,
            skipped: true,
            scored: 0,
            failed: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationResult {
    pub metrics: StageMetrics,
    pub answer: String,
    pub source_urls: Vec<String>,
    pub source_documents: Vec<Document>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub model_used: String,
    pub load_duration_seconds: Option<f64>,
    pub eval_duration_seconds: Option<f64>,
}

/// Which stage raised, for failed requests.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageFailure {
    pub stage: Stage,
    pub message: String,
}

/// Structured record of one `request(query)` call.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionTrace {
    pub query: String,
    pub state: PipelineState,
    pub retrieval: Option<RetrievalResult>,
    pub rerank: Option<RerankResult>,
    pub generation: Option<GenerationResult>,
    pub total_duration: Option<f64>,
    pub total_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<StageFailure>,
}

impl ExecutionTrace {
    pub fn new(query: &str) -> Self {
        Self {
            query: query.to_string(),
            state: PipelineState::Idle,
            retrieval: None,
            rerank: None,
            generation: None,
            total_duration: None,
            total_tokens: None,
            failure: None,
        }
    }

    /// Move to `next`. Illegal transitions are a bug in the orchestrator.
    pub fn advance(&mut self, next: PipelineState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal pipeline transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::debug!(from = ?self.state, to = ?next, "pipeline transition");
        self.state = next;
    }

    pub fn record_retrieval(&mut self, result: RetrievalResult) {
        debug_assert!(self.rerank.is_none() && self.generation.is_none());
        self.retrieval = Some(result);
    }

    pub fn record_rerank(&mut self, result: RerankResult) {
        debug_assert!(self.retrieval.is_some() && self.generation.is_none());
        self.rerank = Some(result);
    }

    pub fn record_generation(&mut self, result: GenerationResult) {
        debug_assert!(self.retrieval.is_some());
        self.generation = Some(result);
    }

    /// Enter `Failed`, remembering which stage raised.
    pub fn fail(&mut self, stage: Stage, message: impl Into<String>) {
        self.advance(PipelineState::Failed);
        self.failure = Some(StageFailure {
            stage,
            message: message.into(),
        });
    }

    /// Enter `Done` and derive totals from the recorded stages.
    pub fn complete(&mut self) {
        self.advance(PipelineState::Done);

        let durations = [
            self.retrieval.as_ref().map(|r| r.metrics.duration_seconds),
            self.rerank.as_ref().map(|r| r.metrics.duration_seconds),
            self.generation.as_ref().map(|g| g.metrics.duration_seconds),
        ];
        self.total_duration = Some(durations.iter().flatten().sum());

        let rerank_tokens = self
            .rerank
            .as_ref()
            .and_then(|r| r.tokens_consumed)
            .unwrap_or(0);
        let generation_tokens = self.generation.as_ref().map(|g| g.total_tokens).unwrap_or(0);
        self.total_tokens = Some(rerank_tokens + generation_tokens);
    }
}
