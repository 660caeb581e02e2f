//! Typed errors that callers need to branch on.
//!
//! Most internal plumbing uses `anyhow`; these variants exist for the cases
//! where an entry point (CLI, MCP tool, background loop) reacts differently.

use thiserror::Error;

/// Errors surfaced to the operations layer.
#[derive(Debug, Error)]
pub enum LoreError {
    /// A consolidation run is already in flight. This is a conflict, not a failure.
    #[error("a consolidation run is already in progress")]
    RunInProgress,

    /// Configuration validation failed. Carries every problem found.
    #[error("invalid configuration:\n  - {}", .0.join("\n  - "))]
    InvalidConfig(Vec<String>),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Failures talking to an external collaborator (text generation or embeddings).
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// The retry budget was exhausted on transient failures. Aborts the current run.
    #[error("{service} unavailable after {attempts} attempt(s): {message}")]
    Unavailable {
        service: &'static str,
        attempts: u32,
        message: String,
    },

    /// The service answered with a non-retryable error (bad request, auth, ...).
    #[error("{service} rejected the request (HTTP {status}): {message}")]
    Rejected {
        service: &'static str,
        status: u16,
        message: String,
    },
}

impl CollaboratorError {
    /// Returns true if `err` (or anything in its chain) is a collaborator failure.
    pub fn is_in(err: &anyhow::Error) -> bool {
        err.chain().any(|cause| cause.downcast_ref::<CollaboratorError>().is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_config_lists_every_problem() {
        let err = LoreError::InvalidConfig(vec!["a is wrong".into(), "b is wrong".into()]);
        let text = err.to_string();
        assert!(text.contains("a is wrong"));
        assert!(text.contains("b is wrong"));
    }

    #[test]
    fn collaborator_error_found_through_context() {
        let err: anyhow::Error = CollaboratorError::Unavailable {
            service: "embedding",
            attempts: 4,
            message: "timeout".into(),
        }
        .into();
        let wrapped = err.context("embedding candidate failed");
        assert!(CollaboratorError::is_in(&wrapped));

        let plain = anyhow::anyhow!("constraint failed");
        assert!(!CollaboratorError::is_in(&plain));
    }
}
