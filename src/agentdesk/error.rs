//! Error taxonomy shared across the runtime.
//!
//! Every fallible surface in the crate returns [`OrchestratorError`] (boxed
//! nowhere; the enum is small and cheap to move). The taxonomy is deliberately
//! coarse: callers branch on the *kind* of failure, not on provider-specific
//! detail, which stays inside the message string.

use std::error::Error;
use std::fmt;

/// Convenience alias used throughout the crate.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Failure kinds surfaced by the orchestration runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    /// The underlying chat service failed (network, auth, unknown model).
    Transport(String),

    /// A bounded operation ran past its deadline. Carries a human-readable
    /// description such as `"Task timed out after 60s"`.
    Timeout(String),

    /// The operation observed a cooperative cancel signal and stopped early.
    Cancelled,

    /// A structured LLM payload could not be decoded. Callers are expected
    /// to fall back to a deterministic default instead of propagating this
    /// to the user.
    Parse(String),

    /// A message or tool request violated a configured policy.
    PolicyViolation(String),

    /// A command was issued in a phase that does not accept it. User-driven
    /// commands treat this as a no-op; programmatic misuse should surface it.
    FsmTransition { phase: String, trigger: String },

    /// A tool approval request was denied.
    ApprovalDenied(String),

    /// A budget (tokens, tool calls, queue capacity) was exhausted.
    ResourceExhausted(String),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::Transport(msg) => write!(f, "Transport error: {}", msg),
            OrchestratorError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            OrchestratorError::Cancelled => write!(f, "Operation cancelled"),
            OrchestratorError::Parse(msg) => write!(f, "Parse error: {}", msg),
            OrchestratorError::PolicyViolation(msg) => write!(f, "Policy violation: {}", msg),
            OrchestratorError::FsmTransition { phase, trigger } => {
                write!(f, "Trigger '{}' is not valid in phase '{}'", trigger, phase)
            }
            OrchestratorError::ApprovalDenied(msg) => write!(f, "Approval denied: {}", msg),
            OrchestratorError::ResourceExhausted(msg) => write!(f, "Resource exhausted: {}", msg),
        }
    }
}

impl Error for OrchestratorError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_detail() {
        let err = OrchestratorError::Timeout("Task timed out after 60s".to_string());
        assert_eq!(err.to_string(), "Timeout: Task timed out after 60s");

        let err = OrchestratorError::FsmTransition {
            phase: "Idle".to_string(),
            trigger: "ApprovePlan".to_string(),
        };
        assert!(err.to_string().contains("ApprovePlan"));
        assert!(err.to_string().contains("Idle"));
    }
}
