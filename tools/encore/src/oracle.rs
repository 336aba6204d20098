//! The decision oracle capability: consulted when a step diverges or
//! fails, it returns one of a closed set of recovery actions. Any
//! implementation (rule table, model-backed) satisfies the same contract,
//! which keeps the run state machine deterministic and testable.

use crate::binder::{ConcreteStep, ParameterMap};
use crate::executor::ExecutionError;
use crate::validator::Divergence;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryTrigger {
    Divergence(Divergence),
    Execution(ExecutionError),
}

impl RecoveryTrigger {
    pub fn describe(&self) -> String {
        match self {
            Self::Divergence(d) => {
                format!("divergence: expected {}, observed {}", d.expected, d.observed)
            }
            Self::Execution(e) => format!("execution error: {}", e.detail),
        }
    }
}

/// Context handed to the oracle alongside the trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleContext {
    pub workflow_name: String,
    pub version: String,
    pub step_index: u32,
    pub parameters: ParameterMap,
    /// Most recent visual snapshot, when one exists.
    pub snapshot: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    Retry,
    Skip { justification: String },
    Substitute(ConcreteStep),
    Abort { reason: String },
}

pub trait DecisionOracle: Send + Sync {
    fn decide(&self, trigger: &RecoveryTrigger, context: &OracleContext) -> RecoveryAction;
}

/// Outcome of an oracle consultation under its timeout.
#[derive(Debug, Clone, PartialEq)]
pub enum OracleVerdict {
    Action(RecoveryAction),
    TimedOut,
}

/// Consult the oracle on a detached thread, bounded by `timeout`.
///
/// A late answer is discarded; the abandoned thread finishes on its own.
pub fn decide_with_timeout(
    oracle: Arc<dyn DecisionOracle>,
    trigger: RecoveryTrigger,
    context: OracleContext,
    timeout: Duration,
) -> OracleVerdict {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let action = oracle.decide(&trigger, &context);
        let _ = tx.send(action);
    });
    match rx.recv_timeout(timeout) {
        Ok(action) => OracleVerdict::Action(action),
        Err(_) => OracleVerdict::TimedOut,
    }
}

/// Test double: hands out queued actions in FIFO order and records every
/// trigger it saw. An empty queue aborts, so a miscounted script fails
/// loudly instead of retrying forever.
#[derive(Default)]
pub struct ScriptedOracle {
    actions: Mutex<Vec<RecoveryAction>>,
    consulted: Mutex<Vec<(RecoveryTrigger, u32)>>,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedOracle {
    pub fn push_action(&self, action: RecoveryAction) {
        self.actions.lock().expect("actions lock").push(action);
    }

    /// Make every decision take this long, for timeout tests.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().expect("delay lock") = Some(delay);
    }

    pub fn consultations(&self) -> Vec<(RecoveryTrigger, u32)> {
        self.consulted.lock().expect("consulted lock").clone()
    }
}

impl DecisionOracle for ScriptedOracle {
    fn decide(&self, trigger: &RecoveryTrigger, context: &OracleContext) -> RecoveryAction {
        if let Some(delay) = *self.delay.lock().expect("delay lock") {
            std::thread::sleep(delay);
        }
        self.consulted
            .lock()
            .expect("consulted lock")
            .push((trigger.clone(), context.step_index));
        let mut actions = self.actions.lock().expect("actions lock");
        if actions.is_empty() {
            return RecoveryAction::Abort {
                reason: "scripted oracle exhausted".to_string(),
            };
        }
        actions.remove(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> OracleContext {
        OracleContext {
            workflow_name: "w".to_string(),
            version: "1".to_string(),
            step_index: 2,
            parameters: ParameterMap::new(),
            snapshot: None,
        }
    }

    fn trigger() -> RecoveryTrigger {
        RecoveryTrigger::Execution(ExecutionError::new("boom"))
    }

    #[test]
    fn scripted_oracle_replays_actions_in_order() {
        let oracle = ScriptedOracle::default();
        oracle.push_action(RecoveryAction::Retry);
        oracle.push_action(RecoveryAction::Abort {
            reason: "no display".to_string(),
        });

        assert_eq!(oracle.decide(&trigger(), &context()), RecoveryAction::Retry);
        assert_eq!(
            oracle.decide(&trigger(), &context()),
            RecoveryAction::Abort {
                reason: "no display".to_string()
            }
        );
        assert_eq!(oracle.consultations().len(), 2);
    }

    #[test]
    fn timeout_discards_a_slow_oracle() {
        let oracle = Arc::new(ScriptedOracle::default());
        oracle.push_action(RecoveryAction::Retry);
        oracle.set_delay(Duration::from_millis(200));

        let verdict = decide_with_timeout(
            oracle,
            trigger(),
            context(),
            Duration::from_millis(10),
        );
        assert_eq!(verdict, OracleVerdict::TimedOut);
    }

    #[test]
    fn fast_oracle_answers_within_timeout() {
        let oracle = Arc::new(ScriptedOracle::default());
        oracle.push_action(RecoveryAction::Skip {
            justification: "optional step".to_string(),
        });

        let verdict = decide_with_timeout(
            oracle,
            trigger(),
            context(),
            Duration::from_secs(5),
        );
        assert_eq!(
            verdict,
            OracleVerdict::Action(RecoveryAction::Skip {
                justification: "optional step".to_string()
            })
        );
    }
}
