//! In-memory [`VectorIndex`] over a persisted document store.
//!
//! Every document's `title\ntext` is embedded once at construction. Queries
//! are brute-force cosine distance over all stored vectors, which is fine for
//! the few thousand documents a single JSON store holds.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use super::{IndexHits, Metadata, VectorIndex};
use crate::embedding::{cosine_distance, encode_one, Embedder};
use crate::error::ProviderError;
use crate::models::{Document, DocumentCollection};

struct StoredVector {
    document: Document,
    vector: Vec<f32>,
}

pub struct MemoryIndex {
    embedder: Arc<dyn Embedder>,
    vectors: Vec<StoredVector>,
}

impl MemoryIndex {
    /// Embed every document in `collection`.
    pub async fn build(
        collection: DocumentCollection,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self, ProviderError> {
        let texts: Vec<String> = collection
            .documents
            .iter()
            .map(Document::judge_content)
            .collect();
        let embeddings = if texts.is_empty() {
            Vec::new()
        } else {
            embedder.encode(&texts).await?
        };
        if embeddings.len() != texts.len() {
            return Err(ProviderError::Protocol(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                embeddings.len()
            )));
        }

        let vectors: Vec<StoredVector> = collection
            .documents
            .into_iter()
            .zip(embeddings)
            .map(|(document, vector)| StoredVector { document, vector })
            .collect();
        info!(
            documents = vectors.len(),
            model = embedder.model_name(),
            "built memory index"
        );

        Ok(Self { embedder, vectors })
    }

    /// Load a document store from disk and embed it.
    pub async fn from_path(path: &Path, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let collection = DocumentCollection::load(path)?;
        Ok(Self::build(collection, embedder).await?)
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }
}

/// The metadata a document is stored with in the index.
pub fn document_metadata(doc: &Document) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("title".into(), Value::String(doc.title.clone()));
    metadata.insert("url".into(), Value::String(doc.url.clone()));
    metadata.insert("text".into(), Value::String(doc.text.clone()));
    if let Some(filename) = &doc.source_filename {
        metadata.insert("filename".into(), Value::String(filename.clone()));
    }
    metadata.insert("created_at".into(), Value::String(doc.created_at.to_rfc3339()));
    metadata
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    fn name(&self) -> &str {
        "memory"
    }

    async fn query(&self, text: &str, n_results: usize) -> Result<IndexHits, ProviderError> {
        let query_vec = encode_one(self.embedder.as_ref(), text).await?;

        let mut scored: Vec<(f64, &Document)> = self
            .vectors
            .iter()
            .map(|sv| (cosine_distance(&query_vec, &sv.vector), &sv.document))
            .collect();
        // Nearest first; NaN distances (degenerate vectors) go last.
        scored.sort_by(|a, b| a.0.is_nan().cmp(&b.0.is_nan()).then(a.0.total_cmp(&b.0)));

        let mut hits = IndexHits::default();
        for (distance, doc) in scored.into_iter().take(n_results) {
            hits.push(doc.id.to_string(), distance, document_metadata(doc));
        }
        Ok(hits)
    }

    async fn is_healthy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_document;

    /// Embeds by keyword presence so distances are predictable.
    struct KeywordEmbedder;

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        fn model_name(&self) -> &str {
            "keywords"
        }

        async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            Ok(texts
                .iter()
                .map(|t| {
                    let t = t.to_lowercase();
                    if t.contains("corrupt") {
                        return vec![f32::NAN, 0.0, 0.1];
                    }
                    vec![
                        if t.contains("rust") { 1.0 } else { 0.0 },
                        if t.contains("python") { 1.0 } else { 0.0 },
                        0.1,
                    ]
                })
                .collect())
        }
    }

    fn collection() -> DocumentCollection {
        DocumentCollection {
            documents: vec![
                test_document(0, "Python packaging"),
                test_document(1, "Rust ownership"),
            ],
        }
    }

    #[tokio::test]
    async fn test_query_ranks_nearest_first() {
        let index = MemoryIndex::build(collection(), Arc::new(KeywordEmbedder))
            .await
            .unwrap();
        assert_eq!(index.len(), 2);

        let hits = index.query("rust borrow checker", 2).await.unwrap();
        assert_eq!(hits.ids, vec!["1", "0"]);
        assert!(hits.distances[0] < hits.distances[1]);
        assert_eq!(hits.metadatas[0]["title"], "Rust ownership");
    }

    #[tokio::test]
    async fn test_nan_distance_ranks_last() {
        let mut docs = collection();
        docs.documents.insert(0, test_document(2, "Corrupt vector"));
        let index = MemoryIndex::build(docs, Arc::new(KeywordEmbedder))
            .await
            .unwrap();

        let hits = index.query("rust", 3).await.unwrap();
        assert_eq!(hits.ids, vec!["1", "0", "2"]);
        assert!(hits.distances[2].is_nan());
    }

    #[tokio::test]
    async fn test_query_truncates_to_n_results() {
        let index = MemoryIndex::build(collection(), Arc::new(KeywordEmbedder))
            .await
            .unwrap();
        let hits = index.query("python", 1).await.unwrap();
        assert_eq!(hits.ids, vec!["0"]);
    }

    #[tokio::test]
    async fn test_empty_collection() {
        let index = MemoryIndex::build(DocumentCollection::default(), Arc::new(KeywordEmbedder))
            .await
            .unwrap();
        assert!(index.is_empty());
        assert!(index.query("anything", 5).await.unwrap().is_empty());
    }

    #[test]
    fn test_document_metadata_keys() {
        let mut doc = test_document(4, "T");
        doc.source_filename = Some("t.md".into());
        let m = document_metadata(&doc);
        for key in ["title", "url", "text", "filename", "created_at"] {
            assert!(m.contains_key(key), "missing {}", key);
        }
    }
}
