//! Shared HTTP plumbing for the remote backends.
//!
//! Every remote provider goes through [`HttpClient`], which owns the per-call
//! timeout and the retry policy:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::time::Duration;

use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ConfigError, ProviderError};

pub const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";

/// A reqwest client with a fixed timeout and retry budget.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
    timeout: Duration,
    max_retries: u32,
    bearer: Option<String>,
}

impl HttpClient {
    pub fn new(timeout_secs: u64, max_retries: u32) -> Result<Self, ConfigError> {
        let timeout = Duration::from_secs(timeout_secs);
        let inner = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            inner,
            timeout,
            max_retries,
            bearer: None,
        })
    }

    /// Send `Authorization: Bearer <token>` on every request.
    pub fn with_bearer(mut self, token: String) -> Self {
        self.bearer = Some(token);
        self
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.bearer {
            Some(token) => builder.header("Authorization", format!("Bearer {}", token)),
            None => builder,
        }
    }

    fn map_send_error(&self, err: reqwest::Error, url: &str) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout(self.timeout)
        } else {
            ProviderError::Unavailable(format!("{}: {}", url, err))
        }
    }

    /// POST a JSON body and decode a JSON reply, retrying transient failures.
    pub async fn post_json(&self, url: &str, body: &Value) -> Result<Value, ProviderError> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                debug!(url, attempt, delay_secs = delay.as_secs(), "retrying provider call");
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .authorize(self.inner.post(url))
                .header("Content-Type", "application/json")
                .json(body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return response
                            .json::<Value>()
                            .await
                            .map_err(|e| ProviderError::Protocol(format!("{}: {}", url, e)));
                    }

                    let body_text = response.text().await.unwrap_or_default();

                    // Rate limited or server error, retry
                    if is_retryable(status) {
                        warn!(url, %status, attempt, "provider returned retryable status");
                        last_err = Some(ProviderError::Unavailable(format!(
                            "{} returned {}: {}",
                            url, status, body_text
                        )));
                        continue;
                    }

                    // Client error (not 429), no retry
                    return Err(ProviderError::Protocol(format!(
                        "{} returned {}: {}",
                        url, status, body_text
                    )));
                }
                Err(e) => {
                    warn!(url, attempt, error = %e, "provider request failed");
                    last_err = Some(self.map_send_error(e, url));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            ProviderError::Unavailable(format!("{}: failed after retries", url))
        }))
    }

    /// GET a JSON document. No retries; used for one-off lookups.
    pub async fn get_json(&self, url: &str) -> Result<Value, ProviderError> {
        let response = self
            .authorize(self.inner.get(url))
            .send()
            .await
            .map_err(|e| self.map_send_error(e, url))?;
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(if is_retryable(status) {
                ProviderError::Unavailable(format!("{} returned {}: {}", url, status, body_text))
            } else {
                ProviderError::Protocol(format!("{} returned {}: {}", url, status, body_text))
            });
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| ProviderError::Protocol(format!("{}: {}", url, e)))
    }

    /// Liveness probe: true when `url` answers with a 2xx status.
    pub async fn probe(&self, url: &str) -> bool {
        match self.authorize(self.inner.get(url)).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(url, "liveness probe ok");
                true
            }
            Ok(response) => {
                warn!(url, status = %response.status(), "liveness probe failed");
                false
            }
            Err(e) => {
                warn!(url, error = %e, "liveness probe failed");
                false
            }
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Read an API key from the environment variable `env` (or
/// `OPENAI_API_KEY` when unset). Called at construction time only.
pub fn api_key_from_env(env: Option<&str>) -> Result<String, ConfigError> {
    let var = env.unwrap_or(DEFAULT_API_KEY_ENV);
    std::env::var(var).map_err(|_| ConfigError::Invalid(format!("{} environment variable not set", var)))
}

/// Join a base URL and a path without doubling slashes.
pub fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
