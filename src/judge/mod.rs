//! Relevance judge capability.
//!
//! A [`Judge`] rates one document against one query. Every backend returns
//! its score already normalized to `[0, 1]`, so the reranker never needs to
//! know which backend produced it:
//!
//! | Config Value | Backend | Native scale | Normalization |
//! |-------------|---------|--------------|---------------|
//! | `"ollama"`, `"openai"` | [`LlmJudge`] | discrete 1–5 | `(s - 1) / 4` |
//! | `"local"` | `CrossEncoderJudge` | raw logit | logistic `1 / (1 + e^-x)` |

#[cfg(feature = "local-models")]
mod local;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::chat::{create_chat_provider, ChatOptions, ChatProvider};
use crate::config::RerankConfig;
use crate::error::{ConfigError, ProviderError};
use crate::prompts;

#[cfg(feature = "local-models")]
pub use local::CrossEncoderJudge;

/// One relevance judgment.
#[derive(Debug, Clone, PartialEq)]
pub struct Judgment {
    /// Normalized relevance in `[0, 1]`.
    pub score: f64,
    /// Backend output the score was derived from.
    pub raw: String,
    /// Tokens billed for this judgment (0 for local models).
    pub tokens: u64,
}

#[async_trait]
pub trait Judge: Send + Sync {
    fn name(&self) -> &str;

    /// Rate `document_text` against `query`.
    ///
    /// Fails with [`ProviderError::ScoreParse`] when the backend answers but
    /// the answer cannot be reduced to a score.
    async fn score(&self, query: &str, document_text: &str) -> Result<Judgment, ProviderError>;

    /// Lightweight liveness probe, checked once per rerank stage.
    async fn is_healthy(&self) -> bool;
}

// ============ LLM judge ============

/// Judge that prompts a chat model for a 1–5 rating.
pub struct LlmJudge {
    chat: Arc<dyn ChatProvider>,
    options: ChatOptions,
}

impl LlmJudge {
    pub fn new(chat: Arc<dyn ChatProvider>, options: ChatOptions) -> Self {
        Self { chat, options }
    }
}

#[async_trait]
impl Judge for LlmJudge {
    fn name(&self) -> &str {
        self.chat.name()
    }

    async fn score(&self, query: &str, document_text: &str) -> Result<Judgment, ProviderError> {
        let messages = prompts::rerank_messages(query, document_text);
        let response = self.chat.complete(&messages, &self.options).await?;
        let rating = parse_score(&response.content)?;
        debug!(rating, raw = %response.content, "judge rating");
        Ok(Judgment {
            score: normalize_rating(rating),
            tokens: response.total_tokens(),
            raw: response.content,
        })
    }

    async fn is_healthy(&self) -> bool {
        self.chat.health_check().await
    }
}

/// Extract the first standalone digit `1`–`5` from a judge reply.
///
/// "Standalone" means not adjacent to another letter, digit, or underscore,
/// so `"4"`, `"Score: 4."` and `"**4**"` parse while `"45"` and `"v4"` do not.
pub fn parse_score(raw: &str) -> Result<u8, ProviderError> {
    let chars: Vec<char> = raw.chars().collect();
    let is_word = |c: &char| c.is_alphanumeric() || *c == '_';

    for (i, c) in chars.iter().enumerate() {
        if !('1'..='5').contains(c) {
            continue;
        }
        let before = i.checked_sub(1).and_then(|j| chars.get(j));
        let after = chars.get(i + 1);
        if before.map_or(true, |b| !is_word(b)) && after.map_or(true, |a| !is_word(a)) {
            return Ok(*c as u8 - b'0');
        }
    }

    Err(ProviderError::ScoreParse(format!(
        "no rating between 1 and 5 in {:?}",
        raw
    )))
}

/// Map a 1–5 rating onto `[0, 1]`.
pub fn normalize_rating(rating: u8) -> f64 {
    (f64::from(rating) - 1.0) / 4.0
}

/// Create the [`Judge`] named by `rerank.provider`.
pub fn create_judge(config: &RerankConfig) -> Result<Arc<dyn Judge>, ConfigError> {
    match config.provider.as_str() {
        "ollama" | "openai" => {
            let chat = create_chat_provider(&config.backend())?;
            let options = ChatOptions::new(config.model.clone())
                .temperature(config.temperature)
                .top_p(config.top_p)
                .top_k(config.top_k);
            Ok(Arc::new(LlmJudge::new(chat, options)))
        }
        #[cfg(feature = "local-models")]
        "local" => Ok(Arc::new(CrossEncoderJudge::new(config)?)),
        #[cfg(not(feature = "local-models"))]
        "local" => Err(ConfigError::Invalid(
            "local judge requires --features local-models".to_string(),
        )),
        other => Err(ConfigError::UnsupportedProvider {
            capability: "judge",
            kind: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_digit() {
        assert_eq!(parse_score("4").unwrap(), 4);
        assert_eq!(parse_score("  1\n").unwrap(), 1);
    }

    #[test]
    fn test_parse_digit_in_sentence() {
        assert_eq!(parse_score("Relevance score: 5.").unwrap(), 5);
        assert_eq!(parse_score("**3**").unwrap(), 3);
        assert_eq!(parse_score("I'd say 2 out of 5").unwrap(), 2);
    }

    #[test]
    fn test_parse_skips_embedded_digits() {
        assert_eq!(parse_score("v4 model says 3").unwrap(), 3);
        assert!(parse_score("45").is_err());
    }

    #[test]
    fn test_parse_out_of_range() {
        assert!(matches!(parse_score("0"), Err(ProviderError::ScoreParse(_))));
        assert!(matches!(parse_score("7"), Err(ProviderError::ScoreParse(_))));
        assert!(matches!(
            parse_score("highly relevant"),
            Err(ProviderError::ScoreParse(_))
        ));
    }

    #[test]
    fn test_normalize_rating() {
        assert_eq!(normalize_rating(1), 0.0);
        assert_eq!(normalize_rating(2), 0.25);
        assert_eq!(normalize_rating(4), 0.75);
        assert_eq!(normalize_rating(5), 1.0);
    }

    #[test]
    fn test_unknown_judge_provider() {
        let config = RerankConfig {
            provider: "cohere".into(),
            ..Default::default()
        };
        assert!(matches!(
            create_judge(&config),
            Err(ConfigError::UnsupportedProvider { capability: "judge", .. })
        ));
    }
}
