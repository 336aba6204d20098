use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Click,
    Type,
    Navigate,
    Wait,
    Screenshot,
    Shell,
    Custom,
}

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Click => "click",
            Self::Type => "type",
            Self::Navigate => "navigate",
            Self::Wait => "wait",
            Self::Screenshot => "screenshot",
            Self::Shell => "shell",
            Self::Custom => "custom",
        }
    }

    /// Kinds that are safe to re-attempt without an explicit substitute.
    /// Typing injects keystrokes on top of whatever the first attempt left
    /// behind, and custom steps make no promises either way.
    pub fn retry_safe_default(self) -> bool {
        matches!(
            self,
            Self::Click | Self::Navigate | Self::Wait | Self::Screenshot | Self::Shell
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Initializing,
    Running,
    Recovering,
    Suspended,
    Completed,
    Failed,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Recovering => "recovering",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Reason strings for a failed run. Every terminal failure maps to one of
/// these; the engine never reports a bare generic failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    Validation(String),
    Binding(String),
    Execution(String),
    OracleTimeout,
    NoOracleConfigured,
    Cancelled,
    RetryCeilingExceeded { index: u32, retries: u32 },
    NonIdempotentRetry { index: u32 },
    SubstituteRejected(String),
    Aborted(String),
}

impl FailureReason {
    pub fn as_str(&self) -> String {
        match self {
            Self::Validation(detail) => format!("validation error: {detail}"),
            Self::Binding(detail) => format!("binding error: {detail}"),
            Self::Execution(detail) => format!("execution error: {detail}"),
            Self::OracleTimeout => "oracle timeout".to_string(),
            Self::NoOracleConfigured => "no oracle configured".to_string(),
            Self::Cancelled => "cancelled".to_string(),
            Self::RetryCeilingExceeded { index, retries } => {
                format!("retry ceiling exceeded at step {index} after {retries} retries")
            }
            Self::NonIdempotentRetry { index } => {
                format!("step {index} is not idempotent and cannot be retried without a substitute")
            }
            Self::SubstituteRejected(detail) => format!("substitute rejected: {detail}"),
            Self::Aborted(reason) => reason.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_safety_defaults_match_contract() {
        for kind in [
            StepKind::Click,
            StepKind::Navigate,
            StepKind::Wait,
            StepKind::Screenshot,
            StepKind::Shell,
        ] {
            assert!(kind.retry_safe_default(), "{} should retry", kind.as_str());
        }
        assert!(!StepKind::Type.retry_safe_default());
        assert!(!StepKind::Custom.retry_safe_default());
    }

    #[test]
    fn terminal_states() {
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(!RunState::Suspended.is_terminal());
        assert!(!RunState::Recovering.is_terminal());
    }

    #[test]
    fn failure_reasons_are_specific() {
        let reason = FailureReason::RetryCeilingExceeded {
            index: 3,
            retries: 2,
        };
        assert_eq!(
            reason.as_str(),
            "retry ceiling exceeded at step 3 after 2 retries"
        );
        assert_eq!(
            FailureReason::NoOracleConfigured.as_str(),
            "no oracle configured"
        );
    }
}
