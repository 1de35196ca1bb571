//! Vector index collaborator.
//!
//! The retriever consumes the index as an opaque text-in, ranked-ids-out
//! service. [`VectorIndex::query`] returns parallel `ids` / `distances` /
//! `metadatas` arrays, nearest first, exactly as a Chroma query does.
//!
//! | Config Value | Backend |
//! |-------------|---------|
//! | `"chroma"` | [`ChromaIndex`]: Chroma HTTP API, query embedded locally |
//! | `"memory"` | [`MemoryIndex`]: brute-force cosine over a JSON document store |

pub mod chroma;
pub mod memory;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::config::IndexConfig;
use crate::embedding::Embedder;
use crate::error::{ConfigError, ProviderError};

pub use chroma::ChromaIndex;
pub use memory::MemoryIndex;

/// Per-hit metadata (`title`, `url`, `text`, `filename`, `created_at`).
pub type Metadata = Map<String, Value>;

/// Result of one nearest-neighbour query. The three vectors are parallel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexHits {
    pub ids: Vec<String>,
    pub distances: Vec<f64>,
    pub metadatas: Vec<Metadata>,
}

impl IndexHits {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn push(&mut self, id: impl Into<String>, distance: f64, metadata: Metadata) {
        self.ids.push(id.into());
        self.distances.push(distance);
        self.metadatas.push(metadata);
    }

    /// Iterate `(id, distance, metadata)` triples, stopping at the shortest array.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64, &Metadata)> {
        self.ids
            .iter()
            .zip(self.distances.iter())
            .zip(self.metadatas.iter())
            .map(|((id, d), m)| (id.as_str(), *d, m))
    }
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn name(&self) -> &str;

    /// Return up to `n_results` nearest neighbours of `text`, nearest first.
    async fn query(&self, text: &str, n_results: usize) -> Result<IndexHits, ProviderError>;

    async fn is_healthy(&self) -> bool;
}

/// Build the index named by `index.backend`.
///
/// Async because the memory backend embeds its whole document store up front.
pub async fn create_index(
    config: &IndexConfig,
    embedder: Arc<dyn Embedder>,
) -> Result<Arc<dyn VectorIndex>> {
    match config.backend.as_str() {
        "chroma" => Ok(Arc::new(ChromaIndex::new(config, embedder)?)),
        "memory" => {
            let path = config
                .documents_path
                .as_deref()
                .ok_or(ConfigError::Missing("index.documents_path"))?;
            let index = MemoryIndex::from_path(path, embedder)
                .await
                .with_context(|| format!("Failed to build memory index from {}", path.display()))?;
            Ok(Arc::new(index))
        }
        other => Err(ConfigError::UnsupportedProvider {
            capability: "index",
            kind: other.to_string(),
        }
        .into()),
    }
}
