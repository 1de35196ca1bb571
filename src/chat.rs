//! Chat-completion capability.
//!
//! A [`ChatProvider`] takes an ordered message list and sampling options and
//! returns one complete reply with token and timing metadata. Two backends:
//!
//! | Config Value | Backend | Endpoint |
//! |-------------|---------|----------|
//! | `"ollama"` | [`OllamaChat`] | `POST {url}/api/chat` (`stream = false`) |
//! | `"openai"` | [`OpenAIChat`] | `POST {url}/chat/completions` |
//!
//! The same backend instance may serve both the relevance judge and the
//! answer generator; the model is chosen per call through [`ChatOptions`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::{ChatBackendSettings, DEFAULT_OLLAMA_URL, DEFAULT_OPENAI_URL};
use crate::error::{ConfigError, ProviderError};
use crate::http::{api_key_from_env, join_url, HttpClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Model and sampling parameters for one call. Unset values are left to
/// the backend's defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatOptions {
    pub model: String,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
}

impl ChatOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn top_p(mut self, top_p: f64) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn top_k(mut self, top_k: u32) -> Self {
        self.top_k = Some(top_k);
        self
    }
}

/// A finished completion.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatResponse {
    pub content: String,
    /// Model that actually answered (may differ from the requested alias).
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub load_duration: Option<Duration>,
    pub eval_duration: Option<Duration>,
    pub total_duration: Option<Duration>,
}

impl ChatResponse {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Backend identifier, e.g. `"ollama"`.
    fn name(&self) -> &str;

    /// Run one non-streaming completion.
    ///
    /// Fails with [`ProviderError::IncompleteResponse`] if the backend reports
    /// a non-final result.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, ProviderError>;

    /// Lightweight liveness probe.
    async fn health_check(&self) -> bool;
}

// ============ Ollama ============

/// Chat backend for an Ollama server.
pub struct OllamaChat {
    client: HttpClient,
    url: String,
}

impl OllamaChat {
    pub fn new(settings: &ChatBackendSettings) -> Result<Self, ConfigError> {
        Ok(Self {
            client: HttpClient::new(settings.timeout_secs, settings.max_retries)?,
            url: settings
                .url
                .clone()
                .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string()),
        })
    }
}

fn ollama_request(messages: &[ChatMessage], options: &ChatOptions) -> Value {
    let mut opts = Map::new();
    if let Some(t) = options.temperature {
        opts.insert("temperature".into(), t.into());
    }
    if let Some(p) = options.top_p {
        opts.insert("top_p".into(), p.into());
    }
    if let Some(k) = options.top_k {
        opts.insert("top_k".into(), k.into());
    }
    serde_json::json!({
        "model": options.model,
        "messages": messages,
        "stream": false,
        "options": opts,
    })
}

fn nanos(json: &Value, key: &str) -> Option<Duration> {
    json.get(key).and_then(|v| v.as_u64()).map(Duration::from_nanos)
}

fn parse_ollama_chat(json: &Value, requested_model: &str) -> Result<ChatResponse, ProviderError> {
    if !json.get("done").and_then(|d| d.as_bool()).unwrap_or(false) {
        return Err(ProviderError::IncompleteResponse(
            "Ollama response is not done".to_string(),
        ));
    }

    let content = json
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| ProviderError::Protocol("Ollama response missing message.content".into()))?;

    Ok(ChatResponse {
        content: content.trim().to_string(),
        model: json
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or(requested_model)
            .to_string(),
        // Ollama omits prompt_eval_count when the prompt was served from cache.
        input_tokens: json
            .get("prompt_eval_count")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        output_tokens: json.get("eval_count").and_then(|v| v.as_u64()).unwrap_or(0),
        load_duration: nanos(json, "load_duration"),
        eval_duration: nanos(json, "eval_duration"),
        total_duration: nanos(json, "total_duration"),
    })
}

#[async_trait]
impl ChatProvider for OllamaChat {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, ProviderError> {
        let body = ollama_request(messages, options);
        debug!(model = %options.model, messages = messages.len(), "ollama chat request");
        let json = self
            .client
            .post_json(&join_url(&self.url, "/api/chat"), &body)
            .await?;
        parse_ollama_chat(&json, &options.model)
    }

    async fn health_check(&self) -> bool {
        self.client.probe(&self.url).await
    }
}

// ============ OpenAI-compatible ============

/// Chat backend for a hosted OpenAI-compatible API.
///
/// `top_k` has no equivalent in this API and is not sent.
pub struct OpenAIChat {
    client: HttpClient,
    url: String,
}

impl OpenAIChat {
    pub fn new(settings: &ChatBackendSettings) -> Result<Self, ConfigError> {
        let key = api_key_from_env(settings.api_key_env.as_deref())?;
        Ok(Self {
            client: HttpClient::new(settings.timeout_secs, settings.max_retries)?
                .with_bearer(key),
            url: settings
                .url
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string()),
        })
    }
}

fn openai_request(messages: &[ChatMessage], options: &ChatOptions) -> Value {
    let mut body = Map::new();
    body.insert("model".into(), options.model.clone().into());
    body.insert("messages".into(), serde_json::json!(messages));
    if let Some(t) = options.temperature {
        body.insert("temperature".into(), t.into());
    }
    if let Some(p) = options.top_p {
        body.insert("top_p".into(), p.into());
    }
    Value::Object(body)
}

fn parse_openai_chat(json: &Value, requested_model: &str) -> Result<ChatResponse, ProviderError> {
    let choice = json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .ok_or_else(|| ProviderError::Protocol("OpenAI response has no choices".into()))?;

    if choice.get("finish_reason").and_then(|f| f.as_str()) == Some("length") {
        return Err(ProviderError::IncompleteResponse(
            "completion stopped at the token limit".to_string(),
        ));
    }

    let content = choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| ProviderError::Protocol("OpenAI response missing message.content".into()))?;

    let usage = json.get("usage");
    let count = |key: &str| {
        usage
            .and_then(|u| u.get(key))
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    };

    Ok(ChatResponse {
        content: content.trim().to_string(),
        model: json
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or(requested_model)
            .to_string(),
        input_tokens: count("prompt_tokens"),
        output_tokens: count("completion_tokens"),
        load_duration: None,
        eval_duration: None,
        total_duration: None,
    })
}

#[async_trait]
impl ChatProvider for OpenAIChat {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, ProviderError> {
        let body = openai_request(messages, options);
        debug!(model = %options.model, messages = messages.len(), "openai chat request");
        let json = self
            .client
            .post_json(&join_url(&self.url, "/chat/completions"), &body)
            .await?;
        parse_openai_chat(&json, &options.model)
    }

    async fn health_check(&self) -> bool {
        self.client.probe(&join_url(&self.url, "/models")).await
    }
}

/// Create the [`ChatProvider`] named by `settings.provider`.
pub fn create_chat_provider(
    settings: &ChatBackendSettings,
) -> Result<Arc<dyn ChatProvider>, ConfigError> {
    match settings.provider.as_str() {
        "ollama" => Ok(Arc::new(OllamaChat::new(settings)?)),
        "openai" => Ok(Arc::new(OpenAIChat::new(settings)?)),
        other => Err(ConfigError::UnsupportedProvider {
            capability: "chat",
            kind: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ollama_request_shape() {
        let messages = vec![ChatMessage::system("sys"), ChatMessage::user("hi")];
        let options = ChatOptions::new("gemma3").temperature(0.1).top_k(40);
        let body = ollama_request(&messages, &options);
        assert_eq!(body["model"], "gemma3");
        assert_eq!(body["stream"], false);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert_eq!(body["options"]["top_k"], 40);
        assert!(body["options"].get("top_p").is_none());
    }

    #[test]
    fn test_parse_ollama_chat() {
        let json = serde_json::json!({
            "model": "gemma3:4b",
            "message": { "role": "assistant", "content": "  Answer.  " },
            "done": true,
            "prompt_eval_count": 120,
            "eval_count": 30,
            "load_duration": 1_500_000_000u64,
            "eval_duration": 250_000_000u64,
            "total_duration": 2_000_000_000u64
        });
        let resp = parse_ollama_chat(&json, "gemma3").unwrap();
        assert_eq!(resp.content, "Answer.");
        assert_eq!(resp.model, "gemma3:4b");
        assert_eq!(resp.total_tokens(), 150);
        assert_eq!(resp.load_duration, Some(Duration::from_millis(1500)));
        assert_eq!(resp.eval_duration, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_parse_ollama_not_done() {
        let json = serde_json::json!({
            "model": "gemma3",
            "message": { "content": "partial" },
            "done": false
        });
        assert!(matches!(
            parse_ollama_chat(&json, "gemma3"),
            Err(ProviderError::IncompleteResponse(_))
        ));
    }

    #[test]
    fn test_parse_ollama_missing_content() {
        let json = serde_json::json!({ "done": true });
        assert!(matches!(
            parse_ollama_chat(&json, "gemma3"),
            Err(ProviderError::Protocol(_))
        ));
    }

    #[test]
    fn test_openai_request_omits_top_k() {
        let options = ChatOptions::new("gpt-4o-mini").top_k(40).top_p(0.9);
        let body = openai_request(&[ChatMessage::user("q")], &options);
        assert!(body.get("top_k").is_none());
        assert_eq!(body["top_p"], 0.9);
    }

    #[test]
    fn test_parse_openai_chat() {
        let json = serde_json::json!({
            "model": "gpt-4o-mini-2024-07-18",
            "choices": [{ "message": { "role": "assistant", "content": "4" }, "finish_reason": "stop" }],
            "usage": { "prompt_tokens": 80, "completion_tokens": 1 }
        });
        let resp = parse_openai_chat(&json, "gpt-4o-mini").unwrap();
        assert_eq!(resp.content, "4");
        assert_eq!(resp.input_tokens, 80);
        assert_eq!(resp.output_tokens, 1);
        assert_eq!(resp.load_duration, None);
    }

    #[test]
    fn test_parse_openai_truncated() {
        let json = serde_json::json!({
            "choices": [{ "message": { "content": "cut" }, "finish_reason": "length" }]
        });
        assert!(matches!(
            parse_openai_chat(&json, "m"),
            Err(ProviderError::IncompleteResponse(_))
        ));
    }

    #[test]
    fn test_unknown_chat_provider() {
        let settings = ChatBackendSettings {
            provider: "gigachat".into(),
            url: None,
            timeout_secs: 5,
            max_retries: 0,
            api_key_env: None,
        };
        assert!(matches!(
            create_chat_provider(&settings),
            Err(ConfigError::UnsupportedProvider { capability: "chat", .. })
        ));
    }
}
