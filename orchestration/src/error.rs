//! Error taxonomy shared by the engine's leaf services.
//!
//! Four families with distinct handling policies:
//! - `Validation`: reported to the caller, never retried.
//! - `Transient`: retried with back-off by the runtime.
//! - `Corruption`: logged; the artifact is re-created on the next full pass.
//! - `Fatal`: the scheduler refuses to start, or the affected agent goes dormant.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A path resolved outside the workspace root.
    #[error("path escapes workspace: {path}")]
    PathEscape { path: PathBuf },

    /// Bad caller input (agent name, unreadable prompt, malformed config).
    #[error("validation: {0}")]
    Validation(String),

    /// Retryable condition: rate limit, empty tool output, network timeout.
    #[error("transient: {0}")]
    Transient(String),

    /// A persisted artifact could not be read back.
    #[error("corrupt artifact {path}: {reason}")]
    Corruption { path: PathBuf, reason: String },

    /// Workspace missing or unwritable. Not recoverable in-process.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether the runtime may retry the operation that produced this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Whether the scheduler must stop dispatching work for this workspace.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(EngineError::Transient("429".into()).is_transient());
        assert!(!EngineError::Validation("bad name".into()).is_transient());
        assert!(!EngineError::Fatal("gone".into()).is_transient());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(EngineError::Fatal("workspace missing".into()).is_fatal());
        assert!(!EngineError::Transient("timeout".into()).is_fatal());
    }

    #[test]
    fn test_display_includes_path() {
        let err = EngineError::PathEscape {
            path: PathBuf::from("../outside.md"),
        };
        assert!(err.to_string().contains("outside.md"));
    }
}
