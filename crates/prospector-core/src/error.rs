//! Error types for the Prospector workspace.

use thiserror::Error;

/// Workspace-wide result alias.
pub type Result<T> = std::result::Result<T, ProspectorError>;

/// All errors produced by the orchestration core.
///
/// The variants mirror the retry taxonomy: validation and credential errors
/// are fatal to a task and never retried; capability errors are transient and
/// retried up to the task's attempt budget.
#[derive(Error, Debug)]
pub enum ProspectorError {
    /// Malformed input — fails immediately, never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Token missing, expired, or revoked — fatal to that task.
    #[error("Credential error: {0}")]
    Credential(String),

    /// Capability-side failure (timeout, rate limit, transient) — retryable.
    #[error("Capability error: {0}")]
    Capability(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Workflow error: {0}")]
    Workflow(String),

    #[error("Schedule error: {0}")]
    Schedule(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProspectorError {
    /// Whether a task failing with this error may be retried.
    /// Only capability-side failures are transient; everything else is
    /// either a caller bug or a dead credential.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProspectorError::Capability(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_taxonomy() {
        assert!(ProspectorError::Capability("rate limited".into()).is_retryable());
        assert!(!ProspectorError::Validation("bad input".into()).is_retryable());
        assert!(!ProspectorError::Credential("expired".into()).is_retryable());
        assert!(!ProspectorError::Queue("full".into()).is_retryable());
    }
}
