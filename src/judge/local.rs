//! In-process cross-encoder judge via fastembed.
//!
//! The model scores the (query, document) pair directly and emits an
//! unbounded logit, which is squashed through the logistic function so the
//! judgment lands in `[0, 1]` like every other judge.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{Judge, Judgment};
use crate::config::RerankConfig;
use crate::error::{ConfigError, ProviderError};

pub struct CrossEncoderJudge {
    model_name: String,
    model: Arc<Mutex<fastembed::TextRerank>>,
}

impl CrossEncoderJudge {
    pub fn new(config: &RerankConfig) -> Result<Self, ConfigError> {
        let fastembed_model = config_to_reranker_model(&config.model)?;
        let model = fastembed::TextRerank::try_new(
            fastembed::RerankInitOptions::new(fastembed_model).with_show_download_progress(false),
        )
        .map_err(|e| ConfigError::Invalid(format!("failed to initialize reranker model: {}", e)))?;

        Ok(Self {
            model_name: config.model.clone(),
            model: Arc::new(Mutex::new(model)),
        })
    }
}

fn config_to_reranker_model(name: &str) -> Result<fastembed::RerankerModel, ConfigError> {
    match name {
        "bge-reranker-base" => Ok(fastembed::RerankerModel::BGERerankerBase),
        "bge-reranker-v2-m3" => Ok(fastembed::RerankerModel::BGERerankerV2M3),
        "jina-reranker-v1-turbo-en" => Ok(fastembed::RerankerModel::JINARerankerV1TurboEn),
        other => Err(ConfigError::Invalid(format!(
            "unknown local reranker model: '{}'. Supported models: \
             bge-reranker-base, bge-reranker-v2-m3, jina-reranker-v1-turbo-en",
            other
        ))),
    }
}

fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

#[async_trait]
impl Judge for CrossEncoderJudge {
    fn name(&self) -> &str {
        &self.model_name
    }

    async fn score(&self, query: &str, document_text: &str) -> Result<Judgment, ProviderError> {
        let model = Arc::clone(&self.model);
        let query = query.to_string();
        let document = document_text.to_string();

        let logit = tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| ProviderError::Unavailable("reranker model poisoned".into()))?;
            let results = model
                .rerank(query.as_str(), vec![document.as_str()], false, None)
                .map_err(|e| ProviderError::Protocol(format!("cross-encoder failed: {}", e)))?;
            results
                .first()
                .map(|r| r.score)
                .ok_or_else(|| ProviderError::ScoreParse("cross-encoder returned no score".into()))
        })
        .await
        .map_err(|e| ProviderError::Unavailable(format!("rerank task failed: {}", e)))??;

        Ok(Judgment {
            score: logistic(f64::from(logit)),
            raw: logit.to_string(),
            tokens: 0,
        })
    }

    /// The model is loaded at construction; there is nothing to probe.
    async fn is_healthy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logistic_bounds() {
        assert!((logistic(0.0) - 0.5).abs() < 1e-12);
        assert!(logistic(10.0) > 0.99);
        assert!(logistic(-10.0) < 0.01);
    }

    #[test]
    fn test_unknown_reranker_model() {
        assert!(config_to_reranker_model("gemma3:4b-it-qat").is_err());
    }
}
