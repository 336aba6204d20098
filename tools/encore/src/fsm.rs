use crate::errors::EncoreError;
use crate::types::{FailureReason, RunState};

/// Mutable run-progress snapshot driven by the engine loop.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSnapshot {
    pub state: RunState,
    pub current_index: u32,
    /// Retries granted for the step at `current_index`.
    pub retries_used: u32,
    pub failure: Option<FailureReason>,
}

impl Default for RunSnapshot {
    fn default() -> Self {
        Self {
            state: RunState::Initializing,
            current_index: 0,
            retries_used: 0,
            failure: None,
        }
    }
}

impl RunSnapshot {
    pub fn transition(&mut self, next: RunState) -> Result<(), EncoreError> {
        validate_transition(self.state, next)?;
        self.state = next;
        Ok(())
    }

    /// Advance to the next step; monotonic by exactly one, resets the
    /// per-step retry counter.
    pub fn advance(&mut self) {
        self.current_index += 1;
        self.retries_used = 0;
    }

    pub fn fail(&mut self, reason: FailureReason) -> Result<(), EncoreError> {
        self.failure = Some(reason);
        self.transition(RunState::Failed)
    }
}

pub fn validate_transition(from: RunState, to: RunState) -> Result<(), EncoreError> {
    use RunState as S;

    let allowed = match from {
        S::Initializing => matches!(to, S::Running | S::Failed),
        S::Running => matches!(to, S::Recovering | S::Suspended | S::Completed | S::Failed),
        S::Recovering => matches!(to, S::Running | S::Failed),
        S::Suspended => matches!(to, S::Running | S::Failed),
        S::Completed | S::Failed => false,
    };

    if !allowed {
        return Err(EncoreError::Validation(format!(
            "illegal run transition: {:?} -> {:?}",
            from, to
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_edges_are_legal() {
        let mut run = RunSnapshot::default();
        run.transition(RunState::Running).expect("start");
        run.transition(RunState::Recovering).expect("recover");
        run.transition(RunState::Running).expect("resume");
        run.transition(RunState::Completed).expect("finish");
    }

    #[test]
    fn terminal_states_reject_everything() {
        for terminal in [RunState::Completed, RunState::Failed] {
            for next in [
                RunState::Initializing,
                RunState::Running,
                RunState::Recovering,
                RunState::Suspended,
                RunState::Completed,
                RunState::Failed,
            ] {
                let err = validate_transition(terminal, next).expect_err("must reject");
                assert!(err.to_string().contains("illegal run transition"));
            }
        }
    }

    #[test]
    fn initializing_cannot_skip_to_recovering() {
        assert!(validate_transition(RunState::Initializing, RunState::Recovering).is_err());
        assert!(validate_transition(RunState::Initializing, RunState::Suspended).is_err());
    }

    #[test]
    fn advance_is_monotonic_and_resets_retries() {
        let mut run = RunSnapshot {
            state: RunState::Running,
            current_index: 4,
            retries_used: 2,
            failure: None,
        };
        run.advance();
        assert_eq!(run.current_index, 5);
        assert_eq!(run.retries_used, 0);
    }

    #[test]
    fn fail_records_the_reason() {
        let mut run = RunSnapshot {
            state: RunState::Running,
            ..RunSnapshot::default()
        };
        run.fail(FailureReason::Cancelled).expect("fail");
        assert_eq!(run.state, RunState::Failed);
        assert_eq!(run.failure, Some(FailureReason::Cancelled));
    }
}
