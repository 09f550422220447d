//! Typed failure kinds raised by engine operations.
//!
//! Operations return `anyhow::Result`; callers that need to branch on the kind
//! recover it with `err.downcast_ref::<EngineError>()`.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Bad start parameters or an unknown completion promise.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation not allowed in the session's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error(
        "Maximum iterations ({max_iterations}) reached; increase maxIterations or close the session with iteration_complete (or mark it blocked)"
    )]
    IterationLimitExceeded { max_iterations: u32 },

    /// Gate catalog problems: unknown gate, malformed catalog.
    #[error("quality gate configuration error: {0}")]
    ConfigError(String),

    /// The session head moved between read and write.
    #[error(
        "stale checkpoint sequence for session {iteration_id}: expected head {expected:?}, found {found:?}; reload the session and retry"
    )]
    StaleSequence {
        iteration_id: String,
        expected: Option<u64>,
        found: Option<u64>,
    },
}

impl EngineError {
    /// Stale writes are reported to drivers as an invalid-state failure.
    pub fn is_invalid_state(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidState(_) | EngineError::StaleSequence { .. }
        )
    }
}

/// Return the engine error kind carried by `err`, if any.
pub fn engine_error(err: &anyhow::Error) -> Option<&EngineError> {
    err.downcast_ref::<EngineError>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn kind_survives_context_wrapping() {
        let err = Err::<(), _>(EngineError::IterationLimitExceeded { max_iterations: 3 })
            .context("iteration_next")
            .unwrap_err();
        assert_eq!(
            engine_error(&err),
            Some(&EngineError::IterationLimitExceeded { max_iterations: 3 })
        );
        assert!(format!("{err:#}").contains("increase maxIterations"));
    }

    #[test]
    fn stale_sequence_counts_as_invalid_state() {
        let err = EngineError::StaleSequence {
            iteration_id: "iter-1".to_string(),
            expected: Some(1),
            found: Some(2),
        };
        assert!(err.is_invalid_state());
        assert!(!EngineError::ConfigError("x".to_string()).is_invalid_state());
    }
}
