//! Generation stage: build the answer prompt from the top-ranked documents,
//! call the chat backend once, and package the reply with its metadata.
//!
//! The model's text is the answer verbatim. Citations come from the
//! documents placed in the prompt, never from parsing the answer.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::info;

use crate::chat::{ChatOptions, ChatProvider};
use crate::config::GenerationConfig;
use crate::error::ProviderError;
use crate::models::Document;
use crate::prompts;
use crate::trace::{GenerationResult, Stage, StageTimer};

pub struct Generator {
    chat: Arc<dyn ChatProvider>,
    options: ChatOptions,
    max_context_documents: usize,
}

impl Generator {
    pub fn new(chat: Arc<dyn ChatProvider>, options: ChatOptions, max_context_documents: usize) -> Self {
        Self {
            chat,
            options,
            max_context_documents: max_context_documents.max(1),
        }
    }

    pub fn from_config(chat: Arc<dyn ChatProvider>, config: &GenerationConfig) -> Self {
        let options = ChatOptions::new(config.model.clone())
            .temperature(config.temperature)
            .top_p(config.top_p)
            .top_k(config.top_k);
        Self::new(chat, options, config.max_context_documents)
    }

    pub fn chat(&self) -> &Arc<dyn ChatProvider> {
        &self.chat
    }

    /// Answer `query` from `documents`, which must already be in ranked order.
    ///
    /// Only the first `max_context_documents` are used. Any provider failure
    /// is returned as-is; there is no fallback answer.
    pub async fn generate_answer(
        &self,
        query: &str,
        mut documents: Vec<Document>,
    ) -> Result<GenerationResult, ProviderError> {
        let timer = StageTimer::start(Stage::Generation);

        documents.truncate(self.max_context_documents);
        let messages = prompts::answer_messages(query, &documents);
        let response = self.chat.complete(&messages, &self.options).await?;

        let metrics = timer.finish();
        let total_tokens = response.total_tokens();
        info!(
            stage = %Stage::Generation,
            model = %response.model,
            documents = documents.len(),
            tokens = total_tokens,
            elapsed_secs = metrics.duration_seconds,
            "generation complete"
        );

        Ok(GenerationResult {
            metrics,
            source_urls: source_urls(&documents),
            source_documents: documents,
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
            total_tokens,
            model_used: response.model,
            load_duration_seconds: response.load_duration.map(|d| d.as_secs_f64()),
            eval_duration_seconds: response.eval_duration.map(|d| d.as_secs_f64()),
            answer: response.content,
        })
    }
}

/// Non-empty document URLs in ranked order, first occurrence wins.
pub fn source_urls(documents: &[Document]) -> Vec<String> {
    let mut seen = HashSet::new();
    documents
        .iter()
        .map(|d| d.url.trim())
        .filter(|url| !url.is_empty() && seen.insert(*url))
        .map(str::to_string)
        .collect()
}
