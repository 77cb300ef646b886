//! Error types for the RLM session engine.

use crate::routing::Decision;
use thiserror::Error;

/// Errors that can occur while configuring or running a session.
///
/// Sandbox outcomes (timeouts, blocked imports, runtime errors) are not
/// errors: they are reported as [`crate::sandbox::ExecutionStatus`] values and
/// fed back to the model.
#[derive(Debug, Error)]
pub enum RlmError {
    /// Configuration failed validation. Never recovered silently.
    #[error("configuration error: {field}: {message}")]
    ConfigValidation {
        /// Dotted path of the offending field (`budget.max_session_budget_usd`).
        field: String,
        /// What was wrong with it.
        message: String,
    },

    /// A proposed or committed charge would breach a hard cap.
    #[error("budget exceeded: {kind} (remaining={remaining}, requested={requested})")]
    BudgetExceeded {
        /// Which budget limit was exceeded.
        kind: BudgetExceededKind,
        /// Remaining headroom when the charge was refused.
        remaining: u64,
        /// Amount that was requested.
        requested: u64,
        /// Unit of work that tripped the cap.
        correlation_id: String,
    },

    /// Recursion depth limit exceeded.
    #[error("recursion depth exceeded: depth={depth}, max={max_depth}")]
    RecursionDepthExceeded {
        /// Depth the refused sub-call would have had.
        depth: u32,
        /// Maximum allowed depth.
        max_depth: u32,
        /// Parent frame that asked for the sub-call.
        correlation_id: String,
    },

    /// Model provider call failed at the transport level.
    #[error("provider transport error: {message}")]
    ProviderTransport {
        /// Error message.
        message: String,
        /// Model that was being called.
        model: Option<String>,
    },

    /// The highest tier failed too.
    #[error("tier exhausted for {correlation_id} after {} decisions", history.len())]
    TierExhausted {
        /// Unit of work that could not be completed.
        correlation_id: String,
        /// Full start/retry/promotion trace for the unit of work.
        history: Vec<Decision>,
    },

    /// Work was cancelled (session timeout or explicit cancel).
    #[error("cancelled: {correlation_id}")]
    Cancelled { correlation_id: String },

    /// Ledger sink failed or was already closed.
    #[error("ledger error: {message}")]
    Ledger { message: String },

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Types of budget limits that can be exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetExceededKind {
    /// Cost cap, measured in micro-dollars.
    Cost,
    /// Token cap.
    Tokens,
}

impl std::fmt::Display for BudgetExceededKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cost => write!(f, "cost"),
            Self::Tokens => write!(f, "tokens"),
        }
    }
}

/// Non-fatal configuration finding. The default was applied instead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub applied_default: String,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} (using {})",
            self.field, self.message, self.applied_default
        )
    }
}

/// Result type alias for RLM operations.
pub type Result<T> = std::result::Result<T, RlmError>;

impl RlmError {
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Correlation id carried by session-level failures.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Self::BudgetExceeded { correlation_id, .. }
            | Self::RecursionDepthExceeded { correlation_id, .. }
            | Self::TierExhausted { correlation_id, .. }
            | Self::Cancelled { correlation_id } => Some(correlation_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn budget_refusal_carries_its_unit_of_work() {
        let err = RlmError::BudgetExceeded {
            kind: BudgetExceededKind::Cost,
            remaining: 0,
            requested: 100,
            correlation_id: "root".to_string(),
        };
        assert_eq!(err.correlation_id(), Some("root"));
        assert_eq!(
            err.to_string(),
            "budget exceeded: cost (remaining=0, requested=100)"
        );
    }

    #[test]
    fn transport_failure_has_no_correlation_id() {
        let err = RlmError::ProviderTransport {
            message: "connection reset".to_string(),
            model: Some("local-small".to_string()),
        };
        assert_eq!(err.correlation_id(), None);
    }

    #[test]
    fn depth_refusal_reports_both_depths() {
        let err = RlmError::RecursionDepthExceeded {
            depth: 6,
            max_depth: 5,
            correlation_id: "parent".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "recursion depth exceeded: depth=6, max=5"
        );
    }

    #[test]
    fn config_error_names_field() {
        let err = RlmError::config("budget.max_session_budget_usd", "must not be negative");
        assert_eq!(
            err.to_string(),
            "configuration error: budget.max_session_budget_usd: must not be negative"
        );
    }

    #[test]
    fn warning_mentions_applied_default() {
        let warning = ConfigWarning {
            field: "session.max_turns".to_string(),
            message: "must be positive".to_string(),
            applied_default: "20".to_string(),
        };
        assert_eq!(
            warning.to_string(),
            "session.max_turns: must be positive (using 20)"
        );
    }
}
