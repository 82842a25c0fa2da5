//! Crate-wide error taxonomy.
//!
//! Mirrors the propagation policy: transient external failures become
//! data on the worker, permanent ones fail the current phase, invariant
//! violations are programmer bugs, and budget exhaustion routes to the
//! report phase rather than failing the session outright.

use thiserror::Error;

/// Result type alias for orchestrator operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Sandbox/model call timeout or 5xx. Caller may retry; never fatal
    /// to the session on its own.
    #[error("transient error from {detail}")]
    Transient { detail: String },

    /// Auth failure, bad model id, or similar. Fails the current phase.
    #[error("permanent error from {detail}")]
    Permanent { detail: String },

    /// Phase-edge violation, negative tokens, duplicate id. A programmer
    /// bug: panics in development, logs-and-fails in production.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Cost Controller returned `deny`. Not a session failure: the phase
    /// engine skips straight to `generate_report`.
    #[error("budget exhausted")]
    BudgetExhausted,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("knowledge cache error: {0}")]
    Cache(String),

    #[error("sandbox provider error: {0}")]
    Sandbox(String),

    #[error("model inference error: {0}")]
    Model(String),

    #[error("learning store error: {0}")]
    Learning(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    /// Transient external failures and cache misses are recoverable by
    /// the caller (retry, or fall through to the next routing option).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, OrchestratorError::Transient { .. } | OrchestratorError::Cache(_))
    }

    /// Permanent external failures and invariant violations are fatal
    /// to the current phase (and, for invariant violations, to the
    /// session).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Permanent { .. } | OrchestratorError::InvariantViolation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_recoverable_not_fatal() {
        let e = OrchestratorError::Transient { detail: "sandbox".into() };
        assert!(e.is_recoverable());
        assert!(!e.is_fatal());
    }

    #[test]
    fn invariant_violation_is_fatal() {
        let e = OrchestratorError::InvariantViolation("duplicate id".into());
        assert!(e.is_fatal());
        assert!(!e.is_recoverable());
    }

    #[test]
    fn budget_exhausted_is_neither() {
        let e = OrchestratorError::BudgetExhausted;
        assert!(!e.is_recoverable());
        assert!(!e.is_fatal());
    }
}
