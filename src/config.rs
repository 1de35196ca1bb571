//! TOML configuration.
//!
//! Every section is optional and every field has a default, so an empty file
//! yields a pipeline that talks to a local Ollama and a local Chroma.
//! Provider kinds stay plain strings here; they are resolved to backends
//! (and rejected if unknown) by the factories in [`crate::embedding`],
//! [`crate::chat`], [`crate::judge`], and [`crate::index`].
//!
//! ```toml
//! [index]
//! backend = "chroma"
//! collection = "documents"
//!
//! [embedding]
//! provider = "ollama"
//! model = "qwen3-embedding:0.6b"
//!
//! [retrieval]
//! initial_candidates = 10
//! rewrite = "best_effort"
//!
//! [rerank]
//! provider = "ollama"
//! model = "gemma3:4b-it-qat"
//! max_concurrent = 5
//!
//! [generation]
//! provider = "openai"
//! model = "gpt-4o-mini"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_CHROMA_URL: &str = "http://localhost:8000";
pub const DEFAULT_CHAT_MODEL: &str = "gemma3:4b-it-qat";
pub const DEFAULT_EMBEDDING_MODEL: &str = "qwen3-embedding:0.6b";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// `"chroma"` or `"memory"`.
    #[serde(default = "default_index_backend")]
    pub backend: String,
    #[serde(default = "default_chroma_url")]
    pub url: String,
    #[serde(default = "default_collection")]
    pub collection: String,
    /// Document store used by the `memory` backend.
    #[serde(default)]
    pub documents_path: Option<PathBuf>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: default_index_backend(),
            url: default_chroma_url(),
            collection: default_collection(),
            documents_path: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_index_backend() -> String {
    "chroma".to_string()
}
fn default_chroma_url() -> String {
    DEFAULT_CHROMA_URL.to_string()
}
fn default_collection() -> String {
    "documents".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"ollama"`, `"openai"`, or `"local"`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    /// Required for `ollama` and `openai`; `local` falls back to
    /// `all-minilm-l6-v2`. Defaults to [`DEFAULT_EMBEDDING_MODEL`] only when
    /// the whole `[embedding]` section is absent.
    #[serde(default)]
    pub model: Option<String>,
    /// Expected vector length; replies of any other length are rejected.
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embedding_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: Some(DEFAULT_EMBEDDING_MODEL.to_string()),
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_embedding_retries(),
            timeout_secs: default_timeout_secs(),
            api_key_env: None,
        }
    }
}

fn default_embedding_provider() -> String {
    "ollama".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_embedding_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

/// How the retriever treats the hypothetical-answer query rewrite.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RewriteMode {
    /// Search with the raw query.
    #[default]
    Off,
    /// Rewrite, falling back to the raw query if the rewrite fails.
    BestEffort,
    /// Rewrite; a failed rewrite fails the request.
    Mandatory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Number of nearest neighbours requested from the index.
    #[serde(default = "default_initial_candidates")]
    pub initial_candidates: usize,
    /// Number of candidates kept after the vector sort.
    #[serde(default = "default_initial_candidates")]
    pub top_k: usize,
    #[serde(default)]
    pub rewrite: RewriteMode,
    #[serde(default = "default_rewrite_temperature")]
    pub rewrite_temperature: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            initial_candidates: default_initial_candidates(),
            top_k: default_initial_candidates(),
            rewrite: RewriteMode::Off,
            rewrite_temperature: default_rewrite_temperature(),
        }
    }
}

fn default_initial_candidates() -> usize {
    10
}
fn default_rewrite_temperature() -> f64 {
    0.7
}

/// Connection settings for one chat-completion backend.
#[derive(Debug, Clone)]
pub struct ChatBackendSettings {
    pub provider: String,
    pub url: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub api_key_env: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// `"ollama"` or `"openai"` for an LLM judge, `"local"` for a cross-encoder.
    #[serde(default = "default_chat_provider")]
    pub provider: String,
    #[serde(default = "default_chat_model")]
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    /// Size of the worker pool used to fan out judge calls.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Per-call timeout for a single judgment.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub max_retries: u32,
    /// Drop reranked candidates whose final score is below this value.
    #[serde(default)]
    pub min_score: Option<f64>,
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: default_chat_provider(),
            model: default_chat_model(),
            url: None,
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            max_concurrent: default_max_concurrent(),
            timeout_secs: default_timeout_secs(),
            max_retries: 0,
            min_score: None,
            api_key_env: None,
        }
    }
}

impl RerankConfig {
    pub fn backend(&self) -> ChatBackendSettings {
        ChatBackendSettings {
            provider: self.provider.clone(),
            url: self.url.clone(),
            timeout_secs: self.timeout_secs,
            max_retries: self.max_retries,
            api_key_env: self.api_key_env.clone(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// `"ollama"` or `"openai"`.
    #[serde(default = "default_chat_provider")]
    pub provider: String,
    #[serde(default = "default_chat_model")]
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    /// Hard cap on documents placed in the answer prompt.
    #[serde(default = "default_max_context_documents")]
    pub max_context_documents: usize,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_chat_provider(),
            model: default_chat_model(),
            url: None,
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            max_context_documents: default_max_context_documents(),
            timeout_secs: default_generation_timeout_secs(),
            max_retries: 0,
            api_key_env: None,
        }
    }
}

impl GenerationConfig {
    pub fn backend(&self) -> ChatBackendSettings {
        ChatBackendSettings {
            provider: self.provider.clone(),
            url: self.url.clone(),
            timeout_secs: self.timeout_secs,
            max_retries: self.max_retries,
            api_key_env: self.api_key_env.clone(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_chat_provider() -> String {
    "ollama".to_string()
}
fn default_chat_model() -> String {
    DEFAULT_CHAT_MODEL.to_string()
}
fn default_temperature() -> f64 {
    0.1
}
fn default_top_p() -> f64 {
    0.95
}
fn default_top_k() -> u32 {
    40
}
fn default_max_concurrent() -> usize {
    5
}
fn default_max_context_documents() -> usize {
    5
}
fn default_generation_timeout_secs() -> u64 {
    300
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

impl Config {
    /// Check ranges and provider kinds. Called by [`load_config`]; call it
    /// directly when building a `Config` in code.
    pub fn validate(&self) -> Result<()> {
        match self.index.backend.as_str() {
            "chroma" | "memory" => {}
            other => bail!("Unknown index backend: '{}'. Must be chroma or memory.", other),
        }
        if self.index.backend == "memory" && self.index.documents_path.is_none() {
            bail!("index.documents_path must be set when backend is 'memory'");
        }

        match self.embedding.provider.as_str() {
            "ollama" | "openai" | "local" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be ollama, openai, or local.",
                other
            ),
        }
        if matches!(self.embedding.provider.as_str(), "ollama" | "openai")
            && self.embedding.model.as_deref().map_or(true, |m| m.trim().is_empty())
        {
            bail!(
                "embedding.model must be set for the '{}' provider",
                self.embedding.provider
            );
        }
        if self.embedding.dims == Some(0) {
            bail!("embedding.dims must be > 0");
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }

        // Validate retrieval
        let r = &self.retrieval;
        if r.top_k < 1 {
            bail!("retrieval.top_k must be >= 1");
        }
        if r.initial_candidates < r.top_k {
            bail!(
                "retrieval.initial_candidates ({}) must be >= retrieval.top_k ({})",
                r.initial_candidates,
                r.top_k
            );
        }
        check_unit("retrieval.rewrite_temperature", r.rewrite_temperature)?;

        // Validate rerank
        match self.rerank.provider.as_str() {
            "ollama" | "openai" | "local" => {}
            other => bail!(
                "Unknown rerank provider: '{}'. Must be ollama, openai, or local.",
                other
            ),
        }
        if self.rerank.max_concurrent < 1 {
            bail!("rerank.max_concurrent must be >= 1");
        }
        check_unit("rerank.temperature", self.rerank.temperature)?;
        check_unit("rerank.top_p", self.rerank.top_p)?;
        if let Some(min) = self.rerank.min_score {
            check_unit("rerank.min_score", min)?;
        }

        // Validate generation
        match self.generation.provider.as_str() {
            "ollama" | "openai" => {}
            other => bail!(
                "Unknown generation provider: '{}'. Must be ollama or openai.",
                other
            ),
        }
        if self.generation.max_context_documents < 1 {
            bail!("generation.max_context_documents must be >= 1");
        }
        check_unit("generation.temperature", self.generation.temperature)?;
        check_unit("generation.top_p", self.generation.top_p)?;

        Ok(())
    }
}

fn check_unit(name: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        bail!("{} must be in [0.0, 1.0], got {}", name, value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.index.backend, "chroma");
        assert_eq!(config.retrieval.initial_candidates, 10);
        assert_eq!(config.retrieval.rewrite, RewriteMode::Off);
        assert!(config.rerank.enabled);
        assert_eq!(config.rerank.max_concurrent, 5);
        assert_eq!(config.generation.max_context_documents, 5);
        assert_eq!(config.generation.timeout_secs, 300);
        assert_eq!(config.rerank.timeout_secs, 30);
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(
            config.embedding.model.as_deref(),
            Some(DEFAULT_EMBEDDING_MODEL)
        );
        assert_eq!(parse("").unwrap().embedding.model.as_deref(), Some(DEFAULT_EMBEDDING_MODEL));
    }

    #[test]
    fn test_remote_embedder_requires_model() {
        let err = parse("[embedding]\nprovider = \"ollama\"\n").unwrap_err();
        assert!(err.to_string().contains("embedding.model"));
        assert!(parse("[embedding]\nprovider = \"openai\"\nmodel = \"\"\n").is_err());
        assert!(parse("[embedding]\nprovider = \"local\"\n").is_ok());
        assert!(parse("[embedding]\nmodel = \"m\"\ndims = 0\n").is_err());
    }

    #[test]
    fn test_rewrite_mode_parsing() {
        let config = parse("[retrieval]\nrewrite = \"mandatory\"\n").unwrap();
        assert_eq!(config.retrieval.rewrite, RewriteMode::Mandatory);
        let config = parse("[retrieval]\nrewrite = \"best_effort\"\n").unwrap();
        assert_eq!(config.retrieval.rewrite, RewriteMode::BestEffort);
        assert!(parse("[retrieval]\nrewrite = \"always\"\n").is_err());
    }

    #[test]
    fn test_unknown_providers_rejected() {
        assert!(parse("[rerank]\nprovider = \"cohere\"\n").is_err());
        assert!(parse("[generation]\nprovider = \"local\"\n").is_err());
        assert!(parse("[embedding]\nprovider = \"word2vec\"\n").is_err());
        assert!(parse("[index]\nbackend = \"faiss\"\n").is_err());
    }

    #[test]
    fn test_top_k_must_not_exceed_initial_candidates() {
        let err = parse("[retrieval]\ninitial_candidates = 3\ntop_k = 5\n").unwrap_err();
        assert!(err.to_string().contains("initial_candidates"));
    }

    #[test]
    fn test_memory_index_requires_documents_path() {
        assert!(parse("[index]\nbackend = \"memory\"\n").is_err());
        assert!(parse("[index]\nbackend = \"memory\"\ndocuments_path = \"docs.json\"\n").is_ok());
    }

    #[test]
    fn test_min_score_range() {
        assert!(parse("[rerank]\nmin_score = 0.5\n").is_ok());
        assert!(parse("[rerank]\nmin_score = 2.0\n").is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("rag.toml");
        std::fs::write(
            &path,
            "[generation]\nprovider = \"openai\"\nmodel = \"gpt-4o-mini\"\n",
        )
        .unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.generation.provider, "openai");
        assert_eq!(config.generation.backend().provider, "openai");
    }
}
