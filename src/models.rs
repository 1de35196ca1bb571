//! Core data models that flow through the retrieval pipeline.
//!
//! [`Document`]s are owned by the index; the pipeline only ever holds
//! read-only copies rebuilt from query results. A [`Candidate`] pairs one of
//! those copies with its scores for a single query.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single indexed document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Position of the document in the index, unique within it.
    pub id: u64,
    pub title: String,
    pub url: String,
    pub text: String,
    /// Name of the file the document was parsed from, for debugging.
    #[serde(default, alias = "filename", skip_serializing_if = "Option::is_none")]
    pub source_filename: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Document {
    /// Text shown to a relevance judge: title and body on separate lines.
    pub fn judge_content(&self) -> String {
        format!("{}\n{}", self.title, self.text)
    }
}

/// The persisted document store, as written by the indexer.
///
/// On disk this is `{"documents": [...]}`. Loaded once when an in-memory
/// index is built; the pipeline never writes it back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentCollection {
    #[serde(default)]
    pub documents: Vec<Document>,
}

impl DocumentCollection {
    /// Read and validate a document store file.
    ///
    /// Rejects duplicate ids and documents with an empty title or text.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read document store: {}", path.display()))?;
        let collection: DocumentCollection = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse document store: {}", path.display()))?;
        collection.validate()?;
        Ok(collection)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for doc in &self.documents {
            if !seen.insert(doc.id) {
                bail!("duplicate document id {} in document store", doc.id);
            }
            if doc.title.trim().is_empty() {
                bail!("document {} has an empty title", doc.id);
            }
            if doc.text.trim().is_empty() {
                bail!("document {} has an empty text", doc.id);
            }
        }
        Ok(())
    }

    pub fn get_by_id(&self, id: u64) -> Option<&Document> {
        self.documents.iter().find(|d| d.id == id)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// A document paired with its scores for one query.
///
/// `final_score` is derived: from the rerank score when one is present,
/// otherwise from the vector distance as `max(0, 1 - distance)`. The only
/// way to change it is through [`Candidate::set_rerank_score`], so it can
/// never drift from its inputs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    document: Document,
    vector_score: f64,
    rerank_score: Option<f64>,
    final_score: f64,
}

impl Candidate {
    /// Wrap an index hit. `vector_score` is the raw index distance
    /// (lower is more similar).
    pub fn new(document: Document, vector_score: f64) -> Self {
        let mut candidate = Self {
            document,
            vector_score,
            rerank_score: None,
            final_score: 0.0,
        };
        candidate.update_final_score();
        candidate
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn into_document(self) -> Document {
        self.document
    }

    pub fn id(&self) -> u64 {
        self.document.id
    }

    pub fn vector_score(&self) -> f64 {
        self.vector_score
    }

    pub fn rerank_score(&self) -> Option<f64> {
        self.rerank_score
    }

    pub fn final_score(&self) -> f64 {
        self.final_score
    }

    /// Record a normalized (`0..=1`) judge score and refresh `final_score`.
    pub fn set_rerank_score(&mut self, score: f64) {
        self.rerank_score = Some(score);
        self.update_final_score();
    }

    fn update_final_score(&mut self) {
        self.final_score = match self.rerank_score {
            Some(score) => score,
            None => vector_relevance(self.vector_score),
        };
    }
}

/// Convert an index distance into a `[0, 1]`-ish relevance value.
pub fn vector_relevance(distance: f64) -> f64 {
    (1.0 - distance).max(0.0)
}

/// Sort candidates by `final_score`, best first.
///
/// `sort_by` is stable, so candidates with equal scores keep their input
/// order and sorting an already-sorted list is a no-op.
pub fn sort_by_final_score(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| b.final_score.total_cmp(&a.final_score));
}

#[cfg(test)]
pub(crate) fn test_document(id: u64, title: &str) -> Document {
    Document {
        id,
        title: title.to_string(),
        url: format!("https://docs.example.com/{}", id),
        text: format!("Body of {}", title),
        source_filename: None,
        created_at: Utc::now(),
    }
}
