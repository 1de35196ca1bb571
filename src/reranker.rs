//! Rerank stage: concurrent relevance judging with partial-failure tolerance.
//!
//! # Algorithm
//!
//! 1. Probe the judge. If it is unhealthy, return the candidates unchanged
//!    with zero elapsed time (reranking refines quality; it is never required).
//!    If the caller's deadline has already passed, no judge is called and
//!    every candidate counts as abandoned.
//! 2. Spawn one task per candidate into a [`JoinSet`]. A shared
//!    [`Semaphore`] caps in-flight judge calls at `max_concurrent`, and every
//!    call carries its own timeout.
//! 3. Each task owns a copy of its candidate's text and returns
//!    `(index, outcome)`, so results map back to candidates by position no
//!    matter the completion order.
//! 4. If the caller's deadline expires, remaining tasks are aborted and only
//!    the judgments that already finished are applied.
//! 5. A single reduce step applies scores and sums tokens, then a stable sort
//!    by `final_score` fixes the output order. An optional `min_score` drops
//!    the tail.
//!
//! Failed, timed-out, or abandoned judgments leave the candidate with its
//! vector-derived score. Nothing in this stage returns an error.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::config::RerankConfig;
use crate::error::ProviderError;
use crate::judge::{Judge, Judgment};
use crate::models::{sort_by_final_score, Candidate};
use crate::trace::{RerankResult, Stage, StageTimer};

pub struct Reranker {
    judge: Arc<dyn Judge>,
    max_concurrent: usize,
    call_timeout: Duration,
    min_score: Option<f64>,
}

impl Reranker {
    pub fn new(judge: Arc<dyn Judge>, max_concurrent: usize, call_timeout: Duration) -> Self {
        Self {
            judge,
            max_concurrent: max_concurrent.max(1),
            call_timeout,
            min_score: None,
        }
    }

    pub fn from_config(judge: Arc<dyn Judge>, config: &RerankConfig) -> Self {
        Self::new(
            judge,
            config.max_concurrent,
            Duration::from_secs(config.timeout_secs),
        )
        .with_min_score(config.min_score)
    }

    /// Drop candidates whose final score ends up below `min_score`.
    pub fn with_min_score(mut self, min_score: Option<f64>) -> Self {
        self.min_score = min_score;
        self
    }

    pub fn judge(&self) -> &Arc<dyn Judge> {
        &self.judge
    }

    /// Rerank with no deadline.
    pub async fn rerank(&self, query: &str, candidates: Vec<Candidate>) -> RerankResult {
        self.rerank_until(query, candidates, None).await
    }

    /// Rerank, abandoning judge calls still in flight at `deadline`.
    pub async fn rerank_until(
        &self,
        query: &str,
        mut candidates: Vec<Candidate>,
        deadline: Option<Instant>,
    ) -> RerankResult {
        let timer = StageTimer::start(Stage::Rerank);
        let outcomes = match self.probe_judge(deadline).await {
            Some(true) => self.judge_all(query, &candidates, deadline).await,
            Some(false) => {
                warn!(
                    stage = %Stage::Rerank,
                    judge = self.judge.name(),
                    "judge unavailable, skipping rerank"
                );
                return RerankResult::skipped(candidates);
            }
            None => {
                warn!(
                    stage = %Stage::Rerank,
                    pending = candidates.len(),
                    "rerank deadline reached before judging, keeping vector scores"
                );
                (0..candidates.len()).map(|_| None).collect()
            }
        };

        // Reduce: the only place candidates and the token total are written.
        let mut tokens = 0u64;
        let mut scored = 0usize;
        let mut failed = 0usize;
        for (candidate, outcome) in candidates.iter_mut().zip(outcomes) {
            let doc_id = candidate.id();
            match outcome {
                Some(Ok(judgment)) => {
                    tokens += judgment.tokens;
                    if (0.0..=1.0).contains(&judgment.score) {
                        debug!(doc_id, score = judgment.score, "judged");
                        candidate.set_rerank_score(judgment.score);
                        scored += 1;
                    } else {
                        warn!(doc_id, score = judgment.score, "judgment outside [0, 1], keeping vector score");
                        failed += 1;
                    }
                }
                Some(Err(e)) => {
                    warn!(doc_id, error = %e, "judgment failed, keeping vector score");
                    failed += 1;
                }
                None => {
                    debug!(doc_id, "judgment abandoned at deadline, keeping vector score");
                    failed += 1;
                }
            }
        }

        sort_by_final_score(&mut candidates);
        if let Some(min) = self.min_score {
            let before = candidates.len();
            candidates.retain(|c| c.final_score() >= min);
            debug!(min_score = min, dropped = before - candidates.len(), "applied score threshold");
        }

        let metrics = timer.finish();
        info!(
            stage = %Stage::Rerank,
            scored,
            failed,
            tokens,
            elapsed_secs = metrics.duration_seconds,
            "rerank complete"
        );

        RerankResult {
            metrics,
            candidates,
            tokens_consumed: Some(tokens),
            skipped: false,
            scored,
            failed,
        }
    }

    /// Judge liveness, or `None` if the deadline passes first.
    async fn probe_judge(&self, deadline: Option<Instant>) -> Option<bool> {
        match deadline {
            Some(d) if d <= Instant::now() => None,
            Some(d) => timeout_at(d, self.judge.is_healthy()).await.ok(),
            None => Some(self.judge.is_healthy().await),
        }
    }

    /// Fan out one judge call per candidate. Slot `i` of the result holds the
    /// outcome for `candidates[i]`, or `None` if it was abandoned.
    async fn judge_all(
        &self,
        query: &str,
        candidates: &[Candidate],
        deadline: Option<Instant>,
    ) -> Vec<Option<Result<Judgment, ProviderError>>> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let query: Arc<str> = Arc::from(query);
        let mut tasks = JoinSet::new();

        for (idx, candidate) in candidates.iter().enumerate() {
            let judge = Arc::clone(&self.judge);
            let semaphore = Arc::clone(&semaphore);
            let query = Arc::clone(&query);
            let content = candidate.document().judge_content();
            let call_timeout = self.call_timeout;

            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (idx, Err(ProviderError::Unavailable("rerank pool closed".into())))
                    }
                };
                let outcome = match timeout(call_timeout, judge.score(&query, &content)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Timeout(call_timeout)),
                };
                (idx, outcome)
            });
        }

        let mut outcomes: Vec<Option<Result<Judgment, ProviderError>>> =
            candidates.iter().map(|_| None).collect();

        loop {
            let next = match deadline {
                Some(d) => match timeout_at(d, tasks.join_next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!(pending = tasks.len(), "rerank deadline reached, abandoning in-flight judgments");
                        tasks.abort_all();
                        break;
                    }
                },
                None => tasks.join_next().await,
            };

            match next {
                Some(Ok((idx, outcome))) => outcomes[idx] = Some(outcome),
                Some(Err(e)) => warn!(error = %e, "rerank task did not complete"),
                None => break,
            }
        }

        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_document;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Copy)]
    enum Verdict {
        Score(f64),
        Fail,
        Hang,
    }

    /// Judges by document title (the first line of the judged text).
    struct ScriptedJudge {
        verdicts: HashMap<String, Verdict>,
        healthy: bool,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedJudge {
        fn new(verdicts: &[(&str, Verdict)]) -> Self {
            Self {
                verdicts: verdicts.iter().map(|(t, v)| (t.to_string(), *v)).collect(),
                healthy: true,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Judge for ScriptedJudge {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn score(&self, _query: &str, text: &str) -> Result<Judgment, ProviderError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;

            let title = text.lines().next().unwrap_or_default();
            let verdict = self.verdicts.get(title).copied().unwrap_or(Verdict::Fail);
            let result = match verdict {
                Verdict::Score(score) => Ok(Judgment {
                    score,
                    raw: score.to_string(),
                    tokens: 10,
                }),
                Verdict::Fail => Err(ProviderError::ScoreParse("no digit".into())),
                Verdict::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Err(ProviderError::Unavailable("unreachable".into()))
                }
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }

        async fn is_healthy(&self) -> bool {
            self.healthy
        }
    }

    fn candidates(specs: &[(u64, &str, f64)]) -> Vec<Candidate> {
        specs
            .iter()
            .map(|(id, title, d)| Candidate::new(test_document(*id, title), *d))
            .collect()
    }

    fn ids(result: &RerankResult) -> Vec<u64> {
        result.candidates.iter().map(|c| c.id()).collect()
    }

    #[tokio::test]
    async fn test_rerank_reorders_by_judgment() {
        let judge = ScriptedJudge::new(&[("a", Verdict::Score(0.25)), ("b", Verdict::Score(1.0))]);
        let reranker = Reranker::new(Arc::new(judge), 5, Duration::from_secs(5));
        let result = reranker
            .rerank("q", candidates(&[(0, "a", 0.1), (1, "b", 0.4)]))
            .await;

        assert_eq!(ids(&result), vec![1, 0]);
        assert_eq!(result.candidates[0].final_score(), 1.0);
        assert_eq!(result.candidates[1].final_score(), 0.25);
        assert_eq!(result.scored, 2);
        assert_eq!(result.tokens_consumed, Some(20));
        assert!(!result.skipped);
    }

    #[tokio::test]
    async fn test_failed_judgment_keeps_vector_score() {
        let judge = ScriptedJudge::new(&[("a", Verdict::Fail), ("b", Verdict::Score(0.75))]);
        let reranker = Reranker::new(Arc::new(judge), 5, Duration::from_secs(5));
        let result = reranker
            .rerank("q", candidates(&[(0, "a", 0.1), (1, "b", 0.4)]))
            .await;

        assert_eq!(result.candidates.len(), 2);
        let a = result.candidates.iter().find(|c| c.id() == 0).unwrap();
        assert_eq!(a.rerank_score(), None);
        assert!((a.final_score() - 0.9).abs() < 1e-9);
        assert_eq!(result.failed, 1);
        assert_eq!(ids(&result), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_call_timeout_is_per_candidate() {
        let judge = ScriptedJudge::new(&[("a", Verdict::Hang), ("b", Verdict::Score(0.75))]);
        let reranker = Reranker::new(Arc::new(judge), 5, Duration::from_millis(200));
        let result = reranker
            .rerank("q", candidates(&[(0, "a", 0.1), (1, "b", 0.4)]))
            .await;

        let b = result.candidates.iter().find(|c| c.id() == 1).unwrap();
        assert_eq!(b.final_score(), 0.75);
        assert_eq!(result.scored, 1);
        assert_eq!(result.failed, 1);
        assert!(result.metrics.duration_seconds < 5.0);
    }

    #[tokio::test]
    async fn test_unhealthy_judge_skips() {
        let mut judge = ScriptedJudge::new(&[("a", Verdict::Score(1.0))]);
        judge.healthy = false;
        let reranker = Reranker::new(Arc::new(judge), 5, Duration::from_secs(5));
        let input = candidates(&[(0, "a", 0.3), (1, "b", 0.1)]);
        let result = reranker.rerank("q", input.clone()).await;

        assert!(result.skipped);
        assert_eq!(result.candidates, input);
        assert_eq!(result.metrics.duration_seconds, 0.0);
        assert_eq!(result.tokens_consumed, None);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let titles: Vec<String> = (0..12).map(|i| format!("doc{}", i)).collect();
        let verdicts: Vec<(&str, Verdict)> = titles
            .iter()
            .map(|t| (t.as_str(), Verdict::Score(0.5)))
            .collect();
        let judge = Arc::new(ScriptedJudge::new(&verdicts));
        let specs: Vec<(u64, &str, f64)> = titles
            .iter()
            .enumerate()
            .map(|(i, t)| (i as u64, t.as_str(), 0.2))
            .collect();

        let reranker = Reranker::new(judge.clone(), 3, Duration::from_secs(5));
        let result = reranker.rerank("q", candidates(&specs)).await;

        assert_eq!(result.scored, 12);
        assert!(judge.peak.load(Ordering::SeqCst) <= 3);
        // Equal scores keep input order.
        assert_eq!(ids(&result), (0..12).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_deadline_keeps_completed_judgments() {
        let judge = ScriptedJudge::new(&[("a", Verdict::Hang), ("b", Verdict::Score(1.0))]);
        let reranker = Reranker::new(Arc::new(judge), 5, Duration::from_secs(60));
        let deadline = Instant::now() + Duration::from_millis(300);
        let result = reranker
            .rerank_until("q", candidates(&[(0, "a", 0.1), (1, "b", 0.4)]), Some(deadline))
            .await;

        assert_eq!(ids(&result), vec![1, 0]);
        assert_eq!(result.candidates[1].rerank_score(), None);
        assert_eq!(result.scored, 1);
        assert!(result.metrics.duration_seconds < 5.0);
    }

    #[tokio::test]
    async fn test_expired_deadline_abandons_without_skipping() {
        let judge = Arc::new(ScriptedJudge::new(&[
            ("a", Verdict::Score(1.0)),
            ("b", Verdict::Score(1.0)),
        ]));
        let reranker = Reranker::new(judge.clone(), 5, Duration::from_secs(5));
        let deadline = Instant::now();
        let input = candidates(&[(0, "a", 0.1), (1, "b", 0.4)]);
        let result = reranker.rerank_until("q", input, Some(deadline)).await;

        assert!(!result.skipped);
        assert_eq!(result.scored, 0);
        assert_eq!(result.failed, 2);
        assert_eq!(result.tokens_consumed, Some(0));
        assert_eq!(ids(&result), vec![0, 1]);
        assert_eq!(judge.peak.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_out_of_range_judgment_rejected() {
        let judge = ScriptedJudge::new(&[("a", Verdict::Score(4.0))]);
        let reranker = Reranker::new(Arc::new(judge), 5, Duration::from_secs(5));
        let result = reranker.rerank("q", candidates(&[(0, "a", 0.5)])).await;
        assert_eq!(result.candidates[0].rerank_score(), None);
        assert_eq!(result.failed, 1);
    }

    #[tokio::test]
    async fn test_min_score_filters_tail() {
        let judge = ScriptedJudge::new(&[("a", Verdict::Score(0.0)), ("b", Verdict::Score(0.75))]);
        let reranker =
            Reranker::new(Arc::new(judge), 5, Duration::from_secs(5)).with_min_score(Some(0.5));
        let result = reranker
            .rerank("q", candidates(&[(0, "a", 0.1), (1, "b", 0.4)]))
            .await;
        assert_eq!(ids(&result), vec![1]);
    }
}
