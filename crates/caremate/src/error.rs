//! Error taxonomy shared by every component.
//!
//! Internal plumbing uses `anyhow`; component boundaries convert into
//! [`CareError`] so callers always see a stable category instead of raw
//! engine output.

use thiserror::Error;

pub type CareResult<T> = Result<T, CareError>;

#[derive(Debug, Error)]
pub enum CareError {
    /// Engine missing or failed to load. Not retried silently.
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// Out of memory while loading or generating.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The generation slot or the call itself exceeded its bound.
    #[error("generation timed out after {waited_ms} ms ({stage})")]
    GenerationTimeout { stage: &'static str, waited_ms: u64 },

    /// Recovered locally by the session manager; surfaces only in logs.
    #[error("summarization failed: {0}")]
    SummarizationFailed(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} {id} does not belong to owner {owner_id}")]
    Forbidden {
        kind: &'static str,
        id: String,
        owner_id: String,
    },

    #[error("session {0} is archived and read-only")]
    SessionArchived(String),

    #[error("invalid trigger '{spec}': {reason}")]
    InvalidTrigger { spec: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl CareError {
    /// Stable machine-readable category.
    pub fn category(&self) -> &'static str {
        match self {
            CareError::ModelUnavailable(_) => "model_unavailable",
            CareError::ResourceExhausted(_) => "resource_exhausted",
            CareError::GenerationTimeout { .. } => "generation_timeout",
            CareError::SummarizationFailed(_) => "summarization_failed",
            CareError::Persistence(_) => "persistence_error",
            CareError::NotFound { .. } => "not_found",
            CareError::Forbidden { .. } => "forbidden",
            CareError::SessionArchived(_) => "session_archived",
            CareError::InvalidTrigger { .. } => "invalid_trigger",
            CareError::InvalidConfig(_) => "invalid_config",
            CareError::InvalidInput(_) => "invalid_input",
        }
    }

    /// Whether the caller may simply try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CareError::GenerationTimeout { .. } | CareError::ModelUnavailable(_)
        )
    }

    pub fn invalid_trigger(spec: &str, reason: impl Into<String>) -> Self {
        CareError::InvalidTrigger {
            spec: spec.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<rusqlite::Error> for CareError {
    fn from(e: rusqlite::Error) -> Self {
        CareError::Persistence(e.to_string())
    }
}

impl From<r2d2::Error> for CareError {
    fn from(e: r2d2::Error) -> Self {
        CareError::Persistence(format!("connection pool: {}", e))
    }
}

impl From<serde_json::Error> for CareError {
    fn from(e: serde_json::Error) -> Self {
        CareError::Persistence(format!("serialization: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories_are_stable() {
        assert_eq!(CareError::ModelUnavailable("x".into()).category(), "model_unavailable");
        assert_eq!(CareError::ResourceExhausted("x".into()).category(), "resource_exhausted");
        assert_eq!(
            CareError::GenerationTimeout { stage: "slot", waited_ms: 10 }.category(),
            "generation_timeout"
        );
        assert_eq!(CareError::Persistence("x".into()).category(), "persistence_error");
        assert_eq!(CareError::SessionArchived("s".into()).category(), "session_archived");
    }

    #[test]
    fn test_retryable() {
        assert!(CareError::GenerationTimeout { stage: "call", waited_ms: 1 }.is_retryable());
        assert!(!CareError::ResourceExhausted("oom".into()).is_retryable());
        assert!(!CareError::Persistence("disk".into()).is_retryable());
    }

    #[test]
    fn test_display_hides_nothing_sensitive() {
        let err = CareError::GenerationTimeout { stage: "slot", waited_ms: 1500 };
        assert_eq!(err.to_string(), "generation timed out after 1500 ms (slot)");
    }
}
