//! The step executor capability: the engine hands it a concrete step and
//! gets back an observed outcome. The automation mechanism behind it is
//! deliberately unknown to the engine.

use crate::binder::ConcreteStep;
use crate::runtime::{FileSystem, ProcessRequest, ProcessRunner};
use crate::types::StepKind;
use crate::validator::{Expectation, ObservedState};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{detail}")]
pub struct ExecutionError {
    pub detail: String,
}

impl ExecutionError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

/// What actually happened when a step ran.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    /// Post-state observed by the executor itself, when it can see one.
    /// When absent the engine probes the declared postcondition instead.
    pub observed_postcondition: Option<ObservedState>,
    /// Files or resources this step produced, in production order.
    pub artifacts: Vec<PathBuf>,
}

pub trait StepExecutor: Send + Sync {
    fn execute(&self, step: &ConcreteStep) -> Result<StepOutcome, ExecutionError>;

    /// Observe environment state for an expectation without mutating it.
    fn probe(&self, expectation: &Expectation) -> Result<ObservedState, ExecutionError>;

    /// Whether a step of this kind may be re-attempted automatically.
    /// Non-idempotent kinds must answer false so the engine refuses a
    /// bare `Retry` for them.
    fn is_idempotent(&self, kind: StepKind) -> bool {
        kind.retry_safe_default()
    }
}

/// Production executor for `shell` and `wait` steps, driven through the
/// runtime's `ProcessRunner`. UI kinds (click, type, navigate,
/// screenshot) need a UI-automation backend this crate does not ship.
pub struct ShellStepExecutor {
    runner: Arc<dyn ProcessRunner>,
    fs: Arc<dyn FileSystem>,
}

impl ShellStepExecutor {
    pub fn new(runner: Arc<dyn ProcessRunner>, fs: Arc<dyn FileSystem>) -> Self {
        Self { runner, fs }
    }

    fn execute_shell(&self, payload: &Value) -> Result<StepOutcome, ExecutionError> {
        let program = payload
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| ExecutionError::new("shell step payload has no 'command'"))?;
        let args = payload
            .get("args")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|item| item.as_str().unwrap_or_default().to_string())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let cwd = payload
            .get("cwd")
            .and_then(Value::as_str)
            .map(PathBuf::from);

        let output = self
            .runner
            .run(ProcessRequest {
                program: program.to_string(),
                args,
                cwd,
            })
            .map_err(|e| ExecutionError::new(e.to_string()))?;

        if output.exit_code != 0 {
            return Err(ExecutionError::new(format!(
                "'{program}' exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }

        let artifacts = payload
            .get("artifact")
            .and_then(Value::as_str)
            .map(|p| vec![PathBuf::from(p)])
            .unwrap_or_default();

        Ok(StepOutcome {
            observed_postcondition: None,
            artifacts,
        })
    }

    fn execute_wait(&self, payload: &Value) -> Result<StepOutcome, ExecutionError> {
        let seconds = payload
            .get("seconds")
            .and_then(Value::as_f64)
            .or_else(|| {
                payload
                    .get("seconds")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<f64>().ok())
            })
            .ok_or_else(|| ExecutionError::new("wait step payload has no 'seconds'"))?;
        if !(0.0..=3600.0).contains(&seconds) {
            return Err(ExecutionError::new(format!(
                "wait of {seconds}s is out of range"
            )));
        }
        std::thread::sleep(Duration::from_secs_f64(seconds));
        Ok(StepOutcome::default())
    }
}

impl StepExecutor for ShellStepExecutor {
    fn execute(&self, step: &ConcreteStep) -> Result<StepOutcome, ExecutionError> {
        match step.kind {
            StepKind::Shell => self.execute_shell(&step.payload),
            StepKind::Wait => self.execute_wait(&step.payload),
            other => Err(ExecutionError::new(format!(
                "step kind '{}' requires a UI automation backend",
                other.as_str()
            ))),
        }
    }

    fn probe(&self, expectation: &Expectation) -> Result<ObservedState, ExecutionError> {
        match expectation {
            Expectation::FileExists { path } => {
                let exists = self.fs.exists(std::path::Path::new(path));
                Ok(ObservedState::with_fact(
                    expectation.fact_key(),
                    if exists { "true" } else { "false" },
                ))
            }
            other => Err(ExecutionError::new(format!(
                "cannot probe '{}' without a UI automation backend",
                other.describe()
            ))),
        }
    }
}

/// Test double: returns queued outcomes and probe results in FIFO order
/// and records everything it was asked to do.
#[derive(Default)]
pub struct ScriptedExecutor {
    outcomes: Mutex<Vec<Result<StepOutcome, ExecutionError>>>,
    probes: Mutex<Vec<Result<ObservedState, ExecutionError>>>,
    executed: Mutex<Vec<ConcreteStep>>,
    probed: Mutex<Vec<Expectation>>,
    non_idempotent: Mutex<Vec<StepKind>>,
}

impl ScriptedExecutor {
    pub fn push_outcome(&self, outcome: Result<StepOutcome, ExecutionError>) {
        self.outcomes.lock().expect("outcomes lock").push(outcome);
    }

    pub fn push_probe(&self, observed: Result<ObservedState, ExecutionError>) {
        self.probes.lock().expect("probes lock").push(observed);
    }

    /// Mark a kind non-idempotent regardless of the default table.
    pub fn declare_non_idempotent(&self, kind: StepKind) {
        self.non_idempotent
            .lock()
            .expect("idempotency lock")
            .push(kind);
    }

    pub fn executed_steps(&self) -> Vec<ConcreteStep> {
        self.executed.lock().expect("executed lock").clone()
    }

    pub fn probed_expectations(&self) -> Vec<Expectation> {
        self.probed.lock().expect("probed lock").clone()
    }
}

impl StepExecutor for ScriptedExecutor {
    fn execute(&self, step: &ConcreteStep) -> Result<StepOutcome, ExecutionError> {
        self.executed
            .lock()
            .expect("executed lock")
            .push(step.clone());
        let mut outcomes = self.outcomes.lock().expect("outcomes lock");
        if outcomes.is_empty() {
            return Ok(StepOutcome::default());
        }
        outcomes.remove(0)
    }

    fn probe(&self, expectation: &Expectation) -> Result<ObservedState, ExecutionError> {
        self.probed
            .lock()
            .expect("probed lock")
            .push(expectation.clone());
        let mut probes = self.probes.lock().expect("probes lock");
        if probes.is_empty() {
            // Default to an observation that satisfies the expectation, so
            // tests only script the divergences they care about.
            return Ok(satisfying_observation(expectation));
        }
        probes.remove(0)
    }

    fn is_idempotent(&self, kind: StepKind) -> bool {
        if self
            .non_idempotent
            .lock()
            .expect("idempotency lock")
            .contains(&kind)
        {
            return false;
        }
        kind.retry_safe_default()
    }
}

fn satisfying_observation(expectation: &Expectation) -> ObservedState {
    match expectation {
        Expectation::FileExists { .. } | Expectation::Probe { .. } => {
            ObservedState::with_fact(expectation.fact_key(), "true")
        }
        Expectation::WindowFocused { title } => {
            ObservedState::with_fact(expectation.fact_key(), title.clone())
        }
        Expectation::UrlIs { url } => ObservedState::with_fact(expectation.fact_key(), url.clone()),
    }
}
