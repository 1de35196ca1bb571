//! In-process embeddings via fastembed.
//!
//! Models are downloaded on first use from Hugging Face and cached; after
//! that no network calls are made. The model is loaded once when the
//! embedder is built and shared behind a mutex because inference needs
//! exclusive access.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{check_dims, Embedder};
use crate::config::EmbeddingConfig;
use crate::error::{ConfigError, ProviderError};

pub struct LocalEmbedder {
    model_name: String,
    dims: Option<usize>,
    batch_size: usize,
    model: Arc<Mutex<fastembed::TextEmbedding>>,
}

impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, ConfigError> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        let fastembed_model = config_to_fastembed_model(&model_name)?;

        let model = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(fastembed_model).with_show_download_progress(false),
        )
        .map_err(|e| {
            ConfigError::Invalid(format!("failed to initialize local embedding model: {}", e))
        })?;

        Ok(Self {
            model_name,
            dims: config.dims,
            batch_size: config.batch_size.max(1),
            model: Arc::new(Mutex::new(model)),
        })
    }
}

fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel, ConfigError> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        other => Err(ConfigError::Invalid(format!(
            "unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1.5, multilingual-e5-small, multilingual-e5-base, \
             multilingual-e5-large",
            other
        ))),
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let model = Arc::clone(&self.model);
        let batch_size = self.batch_size;
        let texts = texts.to_vec();

        let vectors = tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| ProviderError::Unavailable("local embedding model poisoned".into()))?;
            model
                .embed(texts, Some(batch_size))
                .map_err(|e| ProviderError::Protocol(format!("local embedding failed: {}", e)))
        })
        .await
        .map_err(|e| ProviderError::Unavailable(format!("embedding task failed: {}", e)))??;

        check_dims(self.dims, &vectors)?;
        Ok(vectors)
    }
}
