//! Error taxonomy for providers, configuration, and the pipeline.
//!
//! Library code returns these typed errors; the CLI and config loader wrap
//! them in `anyhow` the same way every other fallible path in the binary is
//! handled, so callers can still `downcast_ref` to the concrete kind.

use std::time::Duration;

use thiserror::Error;

use crate::trace::Stage;

/// Failure talking to an embedding, judge, or chat backend.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network failure, connection refused, or a retryable status that
    /// exhausted its retries.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// The call did not finish within its per-call timeout.
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    /// The backend answered, but not with something we can read.
    #[error("malformed provider response: {0}")]
    Protocol(String),

    /// A judge reply that cannot be reduced to a score in the expected range.
    #[error("could not parse relevance score: {0}")]
    ScoreParse(String),

    /// The backend reported a non-final (streaming or truncated) result.
    #[error("incomplete response: {0}")]
    IncompleteResponse(String),
}

impl ProviderError {
    /// Transport-level failures: the call never produced a usable reply.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

/// Construction-time configuration failures. Never raised once a pipeline
/// has been built.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported {capability} provider: '{kind}'")]
    UnsupportedProvider {
        capability: &'static str,
        kind: String,
    },

    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Request-level failures surfaced by the orchestrator.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("query is empty")]
    EmptyQuery,

    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: ProviderError,
    },

    #[error("deadline exceeded during {0} stage")]
    DeadlineExceeded(Stage),

    #[error("no execution trace available; run a request first")]
    NoTraceAvailable,
}

impl PipelineError {
    /// The stage a request failed in, if the error belongs to one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::EmptyQuery => Some(Stage::Retrieval),
            Self::Stage { stage, .. } | Self::DeadlineExceeded(stage) => Some(*stage),
            Self::NoTraceAvailable => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(ProviderError::Unavailable("refused".into()).is_transport());
        assert!(ProviderError::Timeout(Duration::from_secs(1)).is_transport());
        assert!(!ProviderError::Protocol("bad json".into()).is_transport());
        assert!(!ProviderError::ScoreParse("abc".into()).is_transport());
    }

    #[test]
    fn test_pipeline_error_stage() {
        let err = PipelineError::Stage {
            stage: Stage::Generation,
            source: ProviderError::IncompleteResponse("done=false".into()),
        };
        assert_eq!(err.stage(), Some(Stage::Generation));
        assert_eq!(PipelineError::EmptyQuery.stage(), Some(Stage::Retrieval));
        assert_eq!(PipelineError::NoTraceAvailable.stage(), None);
        assert!(err.to_string().contains("generation"));
    }

    #[test]
    fn test_unsupported_provider_message() {
        let err = ConfigError::UnsupportedProvider {
            capability: "judge",
            kind: "cohere".into(),
        };
        assert_eq!(err.to_string(), "unsupported judge provider: 'cohere'");
    }
}
