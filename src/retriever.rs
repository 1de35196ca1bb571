//! Retrieval stage: optional query rewrite, nearest-neighbour query, and
//! conversion of raw index hits into scored [`Candidate`]s.
//!
//! # Pipeline
//!
//! ```text
//! query ─▶ [HyDE rewrite] ─▶ index.query(n = initial_candidates)
//!                                   │
//!              hits ─▶ Candidate { vector_score = distance }
//!                                   │
//!              stable sort by final_score desc ─▶ truncate(top_k)
//! ```
//!
//! # Rewrite Modes
//!
//! | Mode | Rewrite fails |
//! |------|---------------|
//! | `off` | never attempted |
//! | `best_effort` | logged, raw query is searched |
//! | `mandatory` | request fails with the rewrite error |

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::chat::{ChatOptions, ChatProvider};
use crate::config::RewriteMode;
use crate::error::ProviderError;
use crate::index::{Metadata, VectorIndex};
use crate::models::{sort_by_final_score, Candidate, Document};
use crate::prompts;
use crate::trace::{RetrievalResult, Stage, StageTimer};

/// HyDE-style rewriter: asks a chat model for a hypothetical answer and
/// searches with that instead of the question.
pub struct QueryRewriter {
    chat: Arc<dyn ChatProvider>,
    options: ChatOptions,
    mode: RewriteMode,
}

impl QueryRewriter {
    pub fn new(chat: Arc<dyn ChatProvider>, options: ChatOptions, mode: RewriteMode) -> Self {
        Self {
            chat,
            options,
            mode,
        }
    }

    pub fn mode(&self) -> RewriteMode {
        self.mode
    }

    /// One chat call; an empty reply counts as a failure.
    pub async fn rewrite(&self, query: &str) -> Result<String, ProviderError> {
        let response = self
            .chat
            .complete(&prompts::hyde_messages(query), &self.options)
            .await?;
        if response.content.trim().is_empty() {
            return Err(ProviderError::Protocol("rewrite returned empty text".into()));
        }
        Ok(response.content)
    }
}

pub struct Retriever {
    index: Arc<dyn VectorIndex>,
    initial_candidates: usize,
    rewriter: Option<QueryRewriter>,
}

impl Retriever {
    pub fn new(index: Arc<dyn VectorIndex>, initial_candidates: usize) -> Self {
        Self {
            index,
            initial_candidates,
            rewriter: None,
        }
    }

    pub fn with_rewriter(mut self, rewriter: QueryRewriter) -> Self {
        self.rewriter = Some(rewriter);
        self
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    /// Run the retrieval stage.
    ///
    /// Queries the index for `max(initial_candidates, top_k)` neighbours and
    /// returns the best `top_k` by `final_score`. Hits that cannot be turned
    /// into a document are skipped with a warning.
    pub async fn search(&self, query: &str, top_k: usize) -> Result<RetrievalResult, ProviderError> {
        let timer = StageTimer::start(Stage::Retrieval);

        let (search_query, rewritten) = self.resolve_query(query).await?;

        let n_results = self.initial_candidates.max(top_k);
        let hits = self.index.query(&search_query, n_results).await?;
        debug!(hits = hits.len(), n_results, index = self.index.name(), "index query");

        let mut candidates: Vec<Candidate> = hits
            .iter()
            .filter_map(|(id, distance, metadata)| match document_from_hit(id, metadata) {
                Ok(doc) => Some(Candidate::new(doc, distance)),
                Err(reason) => {
                    warn!(id, reason = %reason, "skipping index hit");
                    None
                }
            })
            .collect();

        sort_by_final_score(&mut candidates);
        candidates.truncate(top_k);

        let metrics = timer.finish();
        info!(
            stage = %Stage::Retrieval,
            candidates = candidates.len(),
            rewritten,
            elapsed_secs = metrics.duration_seconds,
            "retrieval complete"
        );

        Ok(RetrievalResult {
            metrics,
            candidates,
            search_query,
            rewritten,
        })
    }

    async fn resolve_query(&self, query: &str) -> Result<(String, bool), ProviderError> {
        let rewriter = match &self.rewriter {
            Some(r) if r.mode() != RewriteMode::Off => r,
            _ => return Ok((query.to_string(), false)),
        };

        match rewriter.rewrite(query).await {
            Ok(text) => {
                debug!(chars = text.len(), "query rewritten");
                Ok((text, true))
            }
            Err(e) if rewriter.mode() == RewriteMode::BestEffort => {
                warn!(error = %e, "query rewrite failed, searching with the raw query");
                Ok((query.to_string(), false))
            }
            Err(e) => Err(e),
        }
    }
}

/// Rebuild a [`Document`] from an index hit.
///
/// The id must be a non-negative integer and the metadata must carry a
/// non-empty `title` and `text`. A missing or unparsable `created_at`
/// becomes now.
pub fn document_from_hit(id: &str, metadata: &Metadata) -> Result<Document, String> {
    let id: u64 = id
        .trim()
        .parse()
        .map_err(|_| format!("id {:?} is not a non-negative integer", id))?;

    let field = |key: &str| metadata.get(key).and_then(Value::as_str).map(str::to_string);

    let title = field("title")
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| "metadata has no title".to_string())?;
    let text = field("text")
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| "metadata has no text".to_string())?;

    let created_at = field("created_at")
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Ok(Document {
        id,
        title,
        url: field("url").unwrap_or_default(),
        text,
        source_filename: field("filename"),
        created_at,
    })
}
