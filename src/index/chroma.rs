//! Chroma HTTP backend.
//!
//! The collection id is looked up by name on first use and cached. Queries
//! are embedded on our side with the configured [`Embedder`] so the index
//! and the query always share a model.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::debug;

use super::{IndexHits, Metadata, VectorIndex};
use crate::config::IndexConfig;
use crate::embedding::{encode_one, Embedder};
use crate::error::{ConfigError, ProviderError};
use crate::http::{join_url, HttpClient};

pub struct ChromaIndex {
    client: HttpClient,
    url: String,
    collection: String,
    collection_id: OnceCell<String>,
    embedder: Arc<dyn Embedder>,
}

impl ChromaIndex {
    pub fn new(config: &IndexConfig, embedder: Arc<dyn Embedder>) -> Result<Self, ConfigError> {
        if config.collection.trim().is_empty() {
            return Err(ConfigError::Missing("index.collection"));
        }
        Ok(Self {
            client: HttpClient::new(config.timeout_secs, 0)?,
            url: config.url.clone(),
            collection: config.collection.clone(),
            collection_id: OnceCell::new(),
            embedder,
        })
    }

    async fn collection_id(&self) -> Result<&str, ProviderError> {
        let id = self
            .collection_id
            .get_or_try_init(|| async {
                let url = join_url(
                    &self.url,
                    &format!("/api/v1/collections/{}", self.collection),
                );
                let json = self.client.get_json(&url).await?;
                let id = json
                    .get("id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ProviderError::Protocol("Chroma collection has no id".into()))?;
                debug!(collection = %self.collection, id, "resolved chroma collection");
                Ok::<_, ProviderError>(id.to_string())
            })
            .await?;
        Ok(id.as_str())
    }
}

/// Unwrap Chroma's per-query nesting (`"ids": [[...]]`) for a single query.
fn first_row<'a>(json: &'a Value, key: &str) -> Result<&'a [Value], ProviderError> {
    json.get(key)
        .and_then(|v| v.as_array())
        .and_then(|rows| rows.first())
        .and_then(|row| row.as_array())
        .map(|row| row.as_slice())
        .ok_or_else(|| ProviderError::Protocol(format!("Chroma response missing {}", key)))
}

pub(crate) fn parse_query_response(json: &Value) -> Result<IndexHits, ProviderError> {
    let ids = first_row(json, "ids")?;
    let distances = first_row(json, "distances")?;
    let metadatas = first_row(json, "metadatas")?;

    if ids.len() != distances.len() || ids.len() != metadatas.len() {
        return Err(ProviderError::Protocol(format!(
            "Chroma returned {} ids, {} distances, {} metadatas",
            ids.len(),
            distances.len(),
            metadatas.len()
        )));
    }

    let mut hits = IndexHits::default();
    for ((id, distance), metadata) in ids.iter().zip(distances).zip(metadatas) {
        let id = id
            .as_str()
            .ok_or_else(|| ProviderError::Protocol("Chroma id is not a string".into()))?;
        let distance = distance
            .as_f64()
            .ok_or_else(|| ProviderError::Protocol("Chroma distance is not a number".into()))?;
        let metadata = metadata.as_object().cloned().unwrap_or_else(Metadata::new);
        hits.push(id, distance, metadata);
    }
    Ok(hits)
}

#[async_trait]
impl VectorIndex for ChromaIndex {
    fn name(&self) -> &str {
        "chroma"
    }

    async fn query(&self, text: &str, n_results: usize) -> Result<IndexHits, ProviderError> {
        let embedding = encode_one(self.embedder.as_ref(), text).await?;
        let collection_id = self.collection_id().await?;
        let body = serde_json::json!({
            "query_embeddings": [embedding],
            "n_results": n_results,
            "include": ["metadatas", "distances"],
        });
        let url = join_url(
            &self.url,
            &format!("/api/v1/collections/{}/query", collection_id),
        );
        let json = self.client.post_json(&url, &body).await?;
        parse_query_response(&json)
    }

    async fn is_healthy(&self) -> bool {
        self.client
            .probe(&join_url(&self.url, "/api/v1/heartbeat"))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_response() {
        let json = serde_json::json!({
            "ids": [["0", "1"]],
            "distances": [[0.1, 0.4]],
            "metadatas": [[
                { "title": "A", "url": "u0", "text": "ta" },
                { "title": "B", "url": "u1", "text": "tb" }
            ]],
            "documents": null
        });
        let hits = parse_query_response(&json).unwrap();
        assert_eq!(hits.ids, vec!["0", "1"]);
        assert_eq!(hits.distances, vec![0.1, 0.4]);
        assert_eq!(hits.metadatas[1]["title"], "B");
    }

    #[test]
    fn test_parse_null_metadata_becomes_empty() {
        let json = serde_json::json!({
            "ids": [["0"]],
            "distances": [[0.2]],
            "metadatas": [[null]]
        });
        let hits = parse_query_response(&json).unwrap();
        assert!(hits.metadatas[0].is_empty());
    }

    #[test]
    fn test_parse_mismatched_lengths() {
        let json = serde_json::json!({
            "ids": [["0", "1"]],
            "distances": [[0.2]],
            "metadatas": [[{}, {}]]
        });
        assert!(matches!(
            parse_query_response(&json),
            Err(ProviderError::Protocol(_))
        ));
    }

    #[test]
    fn test_parse_missing_field() {
        let json = serde_json::json!({ "ids": [["0"]] });
        assert!(parse_query_response(&json).is_err());
    }
}
