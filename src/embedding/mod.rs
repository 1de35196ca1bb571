//! Embedder capability and its backends.
//!
//! Defines the [`Embedder`] trait and concrete implementations:
//! - **[`OllamaEmbedder`]**: calls a local Ollama instance's `/api/embed` endpoint.
//! - **[`OpenAIEmbedder`]**: calls the OpenAI embeddings API with batching, retry, and backoff.
//! - **`LocalEmbedder`**: runs models in-process via fastembed; no network calls after model download.
//!
//! Also provides the vector helpers used by the in-memory index:
//! - [`cosine_similarity`]: similarity between two embedding vectors
//! - [`cosine_distance`]: `1 - cosine_similarity`, the distance an index reports
//!
//! # Provider Selection
//!
//! Use [`create_embedder`] to resolve `embedding.provider` to a backend once,
//! at construction time. Unknown providers fail there, never at call time.

#[cfg(feature = "local-models")]
mod local;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::{EmbeddingConfig, DEFAULT_OLLAMA_URL, DEFAULT_OPENAI_URL};
use crate::error::{ConfigError, ProviderError};
use crate::http::{api_key_from_env, join_url, HttpClient};

#[cfg(feature = "local-models")]
pub use local::LocalEmbedder;

/// Turns text into vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Embed a batch of texts, returning one vector per input in input order.
    ///
    /// Fails with [`ProviderError::Unavailable`] on transport errors and
    /// [`ProviderError::Protocol`] when the reply is malformed or has the
    /// wrong number of vectors.
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

/// Embed a single text.
pub async fn encode_one(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>, ProviderError> {
    embedder
        .encode(&[text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Protocol("empty embedding response".to_string()))
}

fn check_count(expected: usize, got: usize) -> Result<(), ProviderError> {
    if expected != got {
        return Err(ProviderError::Protocol(format!(
            "expected {} embeddings, got {}",
            expected, got
        )));
    }
    Ok(())
}

/// Reject vectors whose length differs from `embedding.dims`, when set.
pub(crate) fn check_dims(dims: Option<usize>, vectors: &[Vec<f32>]) -> Result<(), ProviderError> {
    let Some(expected) = dims else {
        return Ok(());
    };
    match vectors.iter().find(|v| v.len() != expected) {
        Some(v) => Err(ProviderError::Protocol(format!(
            "expected {}-dimensional embeddings, got {}",
            expected,
            v.len()
        ))),
        None => Ok(()),
    }
}

// ============ Ollama ============

/// Embedder backed by a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default: `http://localhost:11434`).
/// Requires Ollama to be running with an embedding model pulled
/// (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaEmbedder {
    client: HttpClient,
    url: String,
    model: String,
    dims: Option<usize>,
    batch_size: usize,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, ConfigError> {
        let model = config
            .model
            .clone()
            .ok_or(ConfigError::Missing("embedding.model"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());
        Ok(Self {
            client: HttpClient::new(config.timeout_secs, config.max_retries)?,
            url,
            model,
            dims: config.dims,
            batch_size: config.batch_size.max(1),
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let body = serde_json::json!({
                "model": self.model,
                "input": batch,
            });
            let json = self
                .client
                .post_json(&join_url(&self.url, "/api/embed"), &body)
                .await?;
            let vectors = parse_ollama_response(&json)?;
            check_count(batch.len(), vectors.len())?;
            check_dims(self.dims, &vectors)?;
            out.extend(vectors);
        }
        Ok(out)
    }
}

fn parse_ollama_response(json: &Value) -> Result<Vec<Vec<f32>>, ProviderError> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| ProviderError::Protocol("Ollama response missing embeddings array".into()))?;

    embeddings.iter().map(parse_vector).collect()
}

fn parse_vector(value: &Value) -> Result<Vec<f32>, ProviderError> {
    value
        .as_array()
        .ok_or_else(|| ProviderError::Protocol("embedding is not an array".into()))?
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| ProviderError::Protocol("embedding component is not a number".into()))
        })
        .collect()
}

// ============ OpenAI ============

/// Embedder using the OpenAI embeddings API (or any compatible server).
///
/// Calls `POST {url}/embeddings`. The API key is read from the environment
/// (`OPENAI_API_KEY` unless `embedding.api_key_env` says otherwise) when the
/// embedder is built.
pub struct OpenAIEmbedder {
    client: HttpClient,
    url: String,
    model: String,
    dims: Option<usize>,
    batch_size: usize,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, ConfigError> {
        let model = config
            .model
            .clone()
            .ok_or(ConfigError::Missing("embedding.model"))?;
        let key = api_key_from_env(config.api_key_env.as_deref())?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string());
        Ok(Self {
            client: HttpClient::new(config.timeout_secs, config.max_retries)?.with_bearer(key),
            url,
            model,
            dims: config.dims,
            batch_size: config.batch_size.max(1),
        })
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let body = serde_json::json!({
                "model": self.model,
                "input": batch,
            });
            let json = self
                .client
                .post_json(&join_url(&self.url, "/embeddings"), &body)
                .await?;
            let vectors = parse_openai_response(&json)?;
            check_count(batch.len(), vectors.len())?;
            check_dims(self.dims, &vectors)?;
            out.extend(vectors);
        }
        Ok(out)
    }
}

/// Extract `data[].embedding`, ordered by `data[].index`.
fn parse_openai_response(json: &Value) -> Result<Vec<Vec<f32>>, ProviderError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| ProviderError::Protocol("OpenAI response missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .unwrap_or(pos as u64);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| ProviderError::Protocol("OpenAI response missing embedding".into()))?;
        indexed.push((index, parse_vector(embedding)?));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Create the [`Embedder`] named by `embedding.provider`.
///
/// | Config Value | Backend |
/// |-------------|----------|
/// | `"ollama"` | [`OllamaEmbedder`] |
/// | `"openai"` | [`OpenAIEmbedder`] |
/// | `"local"` | `LocalEmbedder` (requires the `local-models` feature) |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>, ConfigError> {
    match config.provider.as_str() {
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        #[cfg(feature = "local-models")]
        "local" => Ok(Arc::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-models"))]
        "local" => Err(ConfigError::Invalid(
            "local embedding provider requires --features local-models".to_string(),
        )),
        other => Err(ConfigError::UnsupportedProvider {
            capability: "embedding",
            kind: other.to_string(),
        }),
    }
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors or vectors
/// of different lengths.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Cosine distance in `[0.0, 2.0]`; lower means more similar.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    1.0 - cosine_similarity(a, b) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
        assert!(cosine_distance(&v, &v).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
        assert!((cosine_distance(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_different_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_parse_ollama_response() {
        let json = serde_json::json!({ "embeddings": [[0.1, 0.2], [0.3, 0.4]] });
        let vectors = parse_ollama_response(&json).unwrap();
        assert_eq!(vectors.len(), 2);
        assert!((vectors[1][0] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_parse_ollama_missing_field() {
        let json = serde_json::json!({ "embedding": [0.1] });
        assert!(matches!(
            parse_ollama_response(&json),
            Err(ProviderError::Protocol(_))
        ));
    }

    #[test]
    fn test_parse_openai_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                { "index": 1, "embedding": [2.0] },
                { "index": 0, "embedding": [1.0] }
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0], vec![2.0]]);
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let config = EmbeddingConfig {
            provider: "word2vec".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            create_embedder(&config),
            Err(ConfigError::UnsupportedProvider { capability: "embedding", .. })
        ));
    }

    #[test]
    fn test_check_dims() {
        let vectors = vec![vec![0.1, 0.2, 0.3], vec![0.4, 0.5]];
        assert!(check_dims(None, &vectors).is_ok());
        assert!(check_dims(Some(3), &vectors[..1]).is_ok());
        assert!(matches!(
            check_dims(Some(3), &vectors),
            Err(ProviderError::Protocol(msg)) if msg.contains("3-dimensional")
        ));
    }

    #[test]
    fn test_default_config_builds_ollama_embedder() {
        let embedder = create_embedder(&EmbeddingConfig::default()).unwrap();
        assert_eq!(embedder.model_name(), crate::config::DEFAULT_EMBEDDING_MODEL);
    }

    #[test]
    fn test_ollama_requires_model() {
        let config = EmbeddingConfig {
            model: None,
            ..Default::default()
        };
        assert!(matches!(
            create_embedder(&config),
            Err(ConfigError::Missing("embedding.model"))
        ));
    }
}
