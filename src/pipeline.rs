//! Request orchestrator.
//!
//! Sequences retrieval, optional reranking, and generation for one query,
//! and writes the [`ExecutionTrace`] as it goes. The trace is owned by the
//! request: [`Pipeline::execute`] hands it back to the caller together with
//! the outcome, and [`Pipeline::request`] keeps the most recent one for
//! [`Pipeline::last_trace`].
//!
//! # Failure Policy
//!
//! | Stage | On error |
//! |-------|----------|
//! | Retrieval | request fails, trace records `retrieval` |
//! | Rerank | never fails; per-candidate errors and an unhealthy judge are absorbed |
//! | Generation | request fails, trace records `generation` |
//!
//! # Deadline
//!
//! An optional budget bounds retrieval and reranking. Retrieval that runs
//! past it fails the request; reranking keeps whatever judgments finished.
//! Generation is bounded only by its own per-call timeout, so a request that
//! reaches generation always gets a chance to answer.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{timeout_at, Instant};
use tracing::{info, warn};

use crate::chat::{create_chat_provider, ChatOptions};
use crate::config::{Config, RewriteMode};
use crate::embedding::create_embedder;
use crate::error::{PipelineError, ProviderError};
use crate::generator::Generator;
use crate::index::create_index;
use crate::judge::create_judge;
use crate::models::Candidate;
use crate::reranker::Reranker;
use crate::retriever::{QueryRewriter, Retriever};
use crate::trace::{ExecutionTrace, PipelineState, RetrievalResult, Stage};

/// Outcome of one request plus the trace it produced, successful or not.
#[derive(Debug)]
pub struct Execution {
    pub trace: ExecutionTrace,
    pub answer: Result<String, PipelineError>,
}

/// Liveness of each remote collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub index: bool,
    /// `None` when reranking is disabled.
    pub judge: Option<bool>,
    pub chat: bool,
}

impl HealthReport {
    /// Index and chat are required; the judge is optional by policy.
    pub fn is_serving(&self) -> bool {
        self.index && self.chat
    }
}

pub struct Pipeline {
    retriever: Retriever,
    reranker: Option<Reranker>,
    generator: Generator,
    top_k: usize,
    last_trace: Option<ExecutionTrace>,
}

impl Pipeline {
    pub fn new(
        retriever: Retriever,
        reranker: Option<Reranker>,
        generator: Generator,
        top_k: usize,
    ) -> Self {
        Self {
            retriever,
            reranker,
            generator,
            top_k: top_k.max(1),
            last_trace: None,
        }
    }

    /// Build every collaborator from configuration.
    ///
    /// Unknown provider kinds fail here, before any request is served.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        config.validate()?;

        let embedder = create_embedder(&config.embedding)?;
        let index = create_index(&config.index, embedder).await?;
        let chat = create_chat_provider(&config.generation.backend())?;

        let mut retriever = Retriever::new(index, config.retrieval.initial_candidates);
        if config.retrieval.rewrite != RewriteMode::Off {
            let options = ChatOptions::new(config.generation.model.clone())
                .temperature(config.retrieval.rewrite_temperature)
                .top_p(config.generation.top_p)
                .top_k(config.generation.top_k);
            retriever = retriever.with_rewriter(QueryRewriter::new(
                chat.clone(),
                options,
                config.retrieval.rewrite,
            ));
        }

        let reranker = if config.rerank.enabled {
            let judge = create_judge(&config.rerank)?;
            Some(Reranker::from_config(judge, &config.rerank))
        } else {
            None
        };

        let generator = Generator::from_config(chat, &config.generation);

        info!(
            index = retriever.index().name(),
            rerank = config.rerank.enabled,
            rewrite = ?config.retrieval.rewrite,
            "pipeline ready"
        );
        Ok(Self::new(retriever, reranker, generator, config.retrieval.top_k))
    }

    /// Answer `query` and keep its trace as the last trace.
    pub async fn request(&mut self, query: &str) -> Result<String, PipelineError> {
        let execution = self.execute(query, None).await;
        self.last_trace = Some(execution.trace);
        execution.answer
    }

    /// Trace of the most recent [`Pipeline::request`], failed or not.
    pub fn last_trace(&self) -> Result<&ExecutionTrace, PipelineError> {
        self.last_trace.as_ref().ok_or(PipelineError::NoTraceAvailable)
    }

    /// Run one request end to end, optionally within `budget`.
    pub async fn execute(&self, query: &str, budget: Option<Duration>) -> Execution {
        let deadline = budget.map(|b| Instant::now() + b);
        let mut trace = ExecutionTrace::new(query);

        if query.trim().is_empty() {
            return failed(trace, PipelineError::EmptyQuery);
        }

        // Retrieval
        trace.advance(PipelineState::Retrieving);
        let retrieval = match within(
            deadline,
            Stage::Retrieval,
            self.retriever.search(query, self.top_k),
        )
        .await
        {
            Ok(result) => result,
            Err(e) => return failed(trace, e),
        };
        let mut candidates: Vec<Candidate> = retrieval.candidates.clone();
        trace.record_retrieval(retrieval);

        // Rerank
        if let Some(reranker) = self.reranker.as_ref().filter(|_| candidates.len() > 1) {
            trace.advance(PipelineState::Reranking);
            let result = reranker.rerank_until(query, candidates, deadline).await;
            candidates = result.candidates.clone();
            trace.record_rerank(result);
        }

        // Generation
        trace.advance(PipelineState::Generating);
        let documents = candidates.into_iter().map(Candidate::into_document).collect();
        let generation = match self.generator.generate_answer(query, documents).await {
            Ok(result) => result,
            Err(source) => {
                return failed(
                    trace,
                    PipelineError::Stage {
                        stage: Stage::Generation,
                        source,
                    },
                )
            }
        };
        let answer = generation.answer.clone();
        trace.record_generation(generation);
        trace.complete();

        info!(
            total_secs = trace.total_duration.unwrap_or_default(),
            tokens = trace.total_tokens.unwrap_or_default(),
            "request complete"
        );
        Execution {
            trace,
            answer: Ok(answer),
        }
    }

    /// Run the retrieval stage alone.
    pub async fn retrieve(&self, query: &str, top_k: usize) -> Result<RetrievalResult, PipelineError> {
        if query.trim().is_empty() {
            return Err(PipelineError::EmptyQuery);
        }
        self.retriever
            .search(query, top_k)
            .await
            .map_err(|source| PipelineError::Stage {
                stage: Stage::Retrieval,
                source,
            })
    }

    /// Probe every remote collaborator concurrently.
    pub async fn health(&self) -> HealthReport {
        let judge = async {
            match &self.reranker {
                Some(r) => Some(r.judge().is_healthy().await),
                None => None,
            }
        };
        let (index, judge, chat) = tokio::join!(
            self.retriever.index().is_healthy(),
            judge,
            self.generator.chat().health_check()
        );
        HealthReport { index, judge, chat }
    }
}

/// Await a stage future, mapping provider errors and deadline expiry onto
/// [`PipelineError`].
async fn within<T, F>(deadline: Option<Instant>, stage: Stage, fut: F) -> Result<T, PipelineError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    let result = match deadline {
        Some(d) => timeout_at(d, fut)
            .await
            .map_err(|_| PipelineError::DeadlineExceeded(stage))?,
        None => fut.await,
    };
    result.map_err(|source| PipelineError::Stage { stage, source })
}

fn failed(mut trace: ExecutionTrace, error: PipelineError) -> Execution {
    let stage = error.stage().unwrap_or(Stage::Retrieval);
    warn!(stage = %stage, error = %error, "request failed");
    trace.fail(stage, error.to_string());
    Execution {
        trace,
        answer: Err(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_config_builds_pipeline() {
        let pipeline = Pipeline::from_config(&Config::default()).await.unwrap();
        assert_eq!(pipeline.retriever.index().name(), "chroma");
        assert!(pipeline.reranker.is_some());
        assert_eq!(pipeline.generator.chat().name(), "ollama");
        assert!(matches!(
            pipeline.last_trace(),
            Err(PipelineError::NoTraceAvailable)
        ));
    }
}
