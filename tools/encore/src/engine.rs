//! The replay engine: drives one workflow run through the
//! initializing/running/recovering state machine, consulting the decision
//! oracle on divergence or error and appending a checkpoint after every
//! completed step.

use crate::action_log::ActionLog;
use crate::binder::{bind, ConcreteStep, ParameterMap};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::EngineConfig;
use crate::errors::EncoreError;
use crate::executor::{ExecutionError, StepExecutor, StepOutcome};
use crate::fsm::RunSnapshot;
use crate::logging::{JsonlLogger, LogEvent};
use crate::oracle::{
    decide_with_timeout, DecisionOracle, OracleContext, OracleVerdict, RecoveryAction,
    RecoveryTrigger,
};
use crate::runtime::Clock;
use crate::types::{FailureReason, RunState, StepKind};
use crate::validator::{validate, Expectation, ObservedState, Validation};
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Final report for a terminal run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowResult {
    pub success: bool,
    pub workflow_name: String,
    pub artifacts: Vec<PathBuf>,
    pub logs: Vec<String>,
    pub error: Option<String>,
    pub stopped_at_index: Option<u32>,
    pub execution_time_seconds: f64,
}

/// How a run ended. A suspended run has no result yet; it hands back the
/// checkpoint a later `--resume` continues from, or `None` when the run
/// was suspended before any step completed (a resume then starts from
/// the beginning).
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Terminal(WorkflowResult),
    Suspended(Option<Checkpoint>),
}

/// Cross-thread cancel/suspend requests, honored between steps.
#[derive(Clone, Default)]
pub struct ControlHandle {
    cancel: Arc<AtomicBool>,
    suspend: Arc<AtomicBool>,
}

impl ControlHandle {
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn request_suspend(&self) {
        self.suspend.store(true, Ordering::SeqCst);
    }

    fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn suspend_requested(&self) -> bool {
        self.suspend.swap(false, Ordering::SeqCst)
    }
}

pub fn generate_run_id(workflow_name: &str, version: &str, now: SystemTime) -> String {
    let millis = now
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let mut hasher = Sha256::new();
    hasher.update(workflow_name.as_bytes());
    hasher.update(b"|");
    hasher.update(version.as_bytes());
    hasher.update(b"|");
    hasher.update(millis.to_string().as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
    format!("run-{hex}")
}

enum Recovery {
    Reattempt,
    Skipped(String),
    Replaced(ConcreteStep),
    Fail(FailureReason),
}

enum Resolution {
    Completed(StepOutcome),
    Skipped(String),
    Failed(FailureReason),
}

pub struct WorkflowRun {
    log: ActionLog,
    params: ParameterMap,
    config: EngineConfig,
    executor: Arc<dyn StepExecutor>,
    oracle: Option<Arc<dyn DecisionOracle>>,
    store: Arc<dyn CheckpointStore>,
    clock: Arc<dyn Clock>,
    run_id: String,
    resume: bool,
    trace: Option<JsonlLogger>,
    control: ControlHandle,
}

impl WorkflowRun {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        log: ActionLog,
        params: ParameterMap,
        config: EngineConfig,
        executor: Arc<dyn StepExecutor>,
        oracle: Option<Arc<dyn DecisionOracle>>,
        store: Arc<dyn CheckpointStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let run_id = generate_run_id(&log.workflow_name, &log.version, clock.now());
        Self {
            log,
            params,
            config,
            executor,
            oracle,
            store,
            clock,
            run_id,
            resume: false,
            trace: None,
            control: ControlHandle::default(),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    /// Continue from the newest persisted checkpoint for this run id.
    pub fn resuming(mut self) -> Self {
        self.resume = true;
        self
    }

    pub fn with_trace(mut self, trace: JsonlLogger) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn control(&self) -> ControlHandle {
        self.control.clone()
    }

    pub fn execute(&self) -> Result<RunOutcome, EncoreError> {
        let started = self.clock.now();
        let mut snapshot = RunSnapshot::default();
        let mut logs: Vec<String> = Vec::new();
        let mut artifacts: Vec<PathBuf> = Vec::new();

        self.trace_event(
            "run.started",
            json!({
                "run_id": self.run_id,
                "workflow": self.log.workflow_name,
                "version": self.log.version,
            }),
        );

        if let Err(error) = self.log.validate_integrity() {
            logs.push(error.to_string());
            snapshot.fail(FailureReason::Validation(error.to_string()))?;
            return Ok(RunOutcome::Terminal(
                self.finish(&snapshot, logs, artifacts, None, started),
            ));
        }

        // Bind every step before touching the environment, so a missing
        // parameter fails with zero side effects.
        let mut bound = Vec::with_capacity(self.log.steps.len());
        for step in &self.log.steps {
            match bind(step, &self.params) {
                Ok(concrete) => bound.push(concrete),
                Err(error) => {
                    logs.push(format!("step {} failed to bind: {error}", step.index));
                    snapshot.fail(FailureReason::Binding(error.to_string()))?;
                    return Ok(RunOutcome::Terminal(self.finish(
                        &snapshot,
                        logs,
                        artifacts,
                        Some(step.index),
                        started,
                    )));
                }
            }
        }

        let mut last_checkpoint: Option<Checkpoint> = None;
        if self.resume {
            if let Some(checkpoint) = self.store.load(&self.run_id)? {
                snapshot.current_index = checkpoint.last_completed_index + 1;
                artifacts = checkpoint.artifacts.clone();
                logs.push(format!(
                    "resumed after step {}",
                    checkpoint.last_completed_index
                ));
                last_checkpoint = Some(checkpoint);
            }
        }

        snapshot.transition(RunState::Running)?;

        while (snapshot.current_index as usize) < bound.len() {
            if self.control.cancel_requested() {
                let index = snapshot.current_index;
                logs.push(format!("cancelled before step {index}"));
                snapshot.fail(FailureReason::Cancelled)?;
                return Ok(RunOutcome::Terminal(self.finish(
                    &snapshot,
                    logs,
                    artifacts,
                    Some(index),
                    started,
                )));
            }
            if self.control.suspend_requested() {
                snapshot.transition(RunState::Suspended)?;
                // Persist the suspension point. With no completed step
                // there is nothing to record; a resume starts from the
                // beginning.
                let checkpoint = match &last_checkpoint {
                    Some(prior) => {
                        let row = self.checkpoint_row(prior.last_completed_index, &artifacts);
                        self.store.save(&row)?;
                        Some(row)
                    }
                    None => None,
                };
                self.trace_event(
                    "run.suspended",
                    json!({
                        "run_id": self.run_id,
                        "last_completed_index":
                            checkpoint.as_ref().map(|c| c.last_completed_index),
                    }),
                );
                return Ok(RunOutcome::Suspended(checkpoint));
            }

            let index = snapshot.current_index;
            let recorded = &self.log.steps[index as usize];
            let mut pending = bound[index as usize].clone();
            let mut check_precondition = true;

            let resolution = 'step: loop {
                if check_precondition {
                    if let Some(expectation) = &recorded.expected_precondition {
                        match self.probe_and_validate(expectation) {
                            Ok(Validation::Match) => {}
                            Ok(Validation::Divergence(divergence)) => {
                                logs.push(format!(
                                    "step {index} precondition diverged: {}",
                                    divergence.detail
                                ));
                                let recovery = self.recover(
                                    RecoveryTrigger::Divergence(divergence),
                                    &mut snapshot,
                                    recorded.kind,
                                    index,
                                    &artifacts,
                                    &mut logs,
                                )?;
                                match recovery {
                                    Recovery::Reattempt => continue 'step,
                                    Recovery::Skipped(why) => break 'step Resolution::Skipped(why),
                                    Recovery::Replaced(step) => {
                                        pending = step;
                                        check_precondition = false;
                                        continue 'step;
                                    }
                                    Recovery::Fail(reason) => {
                                        break 'step Resolution::Failed(reason)
                                    }
                                }
                            }
                            Err(error) => {
                                logs.push(format!(
                                    "step {index} precondition probe failed: {error}"
                                ));
                                let recovery = self.recover(
                                    RecoveryTrigger::Execution(error),
                                    &mut snapshot,
                                    recorded.kind,
                                    index,
                                    &artifacts,
                                    &mut logs,
                                )?;
                                match recovery {
                                    Recovery::Reattempt => continue 'step,
                                    Recovery::Skipped(why) => break 'step Resolution::Skipped(why),
                                    Recovery::Replaced(step) => {
                                        pending = step;
                                        check_precondition = false;
                                        continue 'step;
                                    }
                                    Recovery::Fail(reason) => {
                                        break 'step Resolution::Failed(reason)
                                    }
                                }
                            }
                        }
                    }
                }

                match execute_with_timeout(
                    self.executor.clone(),
                    pending.clone(),
                    self.config.step_timeout,
                ) {
                    Ok(outcome) => {
                        if let Some(expectation) = &recorded.expected_postcondition {
                            let observed = match &outcome.observed_postcondition {
                                Some(observed) => Ok(observed.clone()),
                                None => self.executor.probe(expectation),
                            };
                            let trigger = match observed {
                                Ok(observed) => {
                                    match validate(Some(expectation), &observed) {
                                        Validation::Match => break 'step Resolution::Completed(outcome),
                                        Validation::Divergence(divergence) => {
                                            logs.push(format!(
                                                "step {index} postcondition diverged: {}",
                                                divergence.detail
                                            ));
                                            RecoveryTrigger::Divergence(divergence)
                                        }
                                    }
                                }
                                Err(error) => {
                                    logs.push(format!(
                                        "step {index} postcondition probe failed: {error}"
                                    ));
                                    RecoveryTrigger::Execution(error)
                                }
                            };
                            let recovery = self.recover(
                                trigger,
                                &mut snapshot,
                                recorded.kind,
                                index,
                                &artifacts,
                                &mut logs,
                            )?;
                            match recovery {
                                Recovery::Reattempt => {
                                    check_precondition = true;
                                    continue 'step;
                                }
                                Recovery::Skipped(why) => break 'step Resolution::Skipped(why),
                                Recovery::Replaced(step) => {
                                    pending = step;
                                    check_precondition = false;
                                    continue 'step;
                                }
                                Recovery::Fail(reason) => break 'step Resolution::Failed(reason),
                            }
                        }
                        break 'step Resolution::Completed(outcome);
                    }
                    Err(error) => {
                        logs.push(format!("step {index} failed: {error}"));
                        let recovery = self.recover(
                            RecoveryTrigger::Execution(error),
                            &mut snapshot,
                            recorded.kind,
                            index,
                            &artifacts,
                            &mut logs,
                        )?;
                        match recovery {
                            Recovery::Reattempt => {
                                check_precondition = true;
                                continue 'step;
                            }
                            Recovery::Skipped(why) => break 'step Resolution::Skipped(why),
                            Recovery::Replaced(step) => {
                                pending = step;
                                check_precondition = false;
                                continue 'step;
                            }
                            Recovery::Fail(reason) => break 'step Resolution::Failed(reason),
                        }
                    }
                }
            };

            match resolution {
                Resolution::Completed(outcome) => {
                    artifacts.extend(outcome.artifacts);
                    let checkpoint = self.checkpoint_row(index, &artifacts);
                    self.store.save(&checkpoint)?;
                    last_checkpoint = Some(checkpoint);
                    logs.push(format!(
                        "step {index} ({}) completed",
                        recorded.kind.as_str()
                    ));
                    self.trace_event(
                        "step.completed",
                        json!({"run_id": self.run_id, "index": index}),
                    );
                    snapshot.advance();
                }
                Resolution::Skipped(justification) => {
                    logs.push(format!("step {index} skipped: {justification}"));
                    // A skipped step still advances the checkpoint so a
                    // resume does not re-attempt it.
                    let checkpoint = self.checkpoint_row(index, &artifacts);
                    self.store.save(&checkpoint)?;
                    last_checkpoint = Some(checkpoint);
                    self.trace_event(
                        "step.skipped",
                        json!({"run_id": self.run_id, "index": index, "justification": justification}),
                    );
                    snapshot.advance();
                }
                Resolution::Failed(reason) => {
                    snapshot.fail(reason)?;
                    return Ok(RunOutcome::Terminal(self.finish(
                        &snapshot,
                        logs,
                        artifacts,
                        Some(index),
                        started,
                    )));
                }
            }
        }

        snapshot.transition(RunState::Completed)?;
        Ok(RunOutcome::Terminal(
            self.finish(&snapshot, logs, artifacts, None, started),
        ))
    }

    fn probe_and_validate(
        &self,
        expectation: &Expectation,
    ) -> Result<Validation, ExecutionError> {
        let observed: ObservedState = self.executor.probe(expectation)?;
        Ok(validate(Some(expectation), &observed))
    }

    /// Consult the oracle about a trigger. Leaves the snapshot in
    /// `Running` when replay can continue, or in `Recovering` when the
    /// caller is about to fail the run.
    fn recover(
        &self,
        trigger: RecoveryTrigger,
        snapshot: &mut RunSnapshot,
        recorded_kind: StepKind,
        index: u32,
        artifacts: &[PathBuf],
        logs: &mut Vec<String>,
    ) -> Result<Recovery, EncoreError> {
        snapshot.transition(RunState::Recovering)?;

        let oracle = match (&self.oracle, self.config.oracle_enabled) {
            (Some(oracle), true) => oracle.clone(),
            _ => {
                logs.push(format!(
                    "step {index}: no oracle to consult about {}",
                    trigger.describe()
                ));
                return Ok(Recovery::Fail(FailureReason::NoOracleConfigured));
            }
        };

        let context = OracleContext {
            workflow_name: self.log.workflow_name.clone(),
            version: self.log.version.clone(),
            step_index: index,
            parameters: self.params.clone(),
            snapshot: latest_snapshot(artifacts),
        };

        let verdict =
            decide_with_timeout(oracle, trigger.clone(), context, self.config.oracle_timeout);
        self.trace_event(
            "oracle.decision",
            json!({
                "run_id": self.run_id,
                "index": index,
                "trigger": trigger.describe(),
                "verdict": verdict_label(&verdict),
            }),
        );

        let action = match verdict {
            OracleVerdict::TimedOut => {
                logs.push(format!("step {index}: oracle timed out"));
                return Ok(Recovery::Fail(FailureReason::OracleTimeout));
            }
            OracleVerdict::Action(action) => action,
        };

        match action {
            RecoveryAction::Retry => {
                if snapshot.retries_used >= self.config.retry_ceiling {
                    return Ok(Recovery::Fail(FailureReason::RetryCeilingExceeded {
                        index,
                        retries: snapshot.retries_used,
                    }));
                }
                if !self.executor.is_idempotent(recorded_kind) {
                    return Ok(Recovery::Fail(FailureReason::NonIdempotentRetry { index }));
                }
                snapshot.retries_used += 1;
                logs.push(format!(
                    "step {index}: retry {}/{} granted",
                    snapshot.retries_used, self.config.retry_ceiling
                ));
                snapshot.transition(RunState::Running)?;
                Ok(Recovery::Reattempt)
            }
            RecoveryAction::Skip { justification } => {
                snapshot.transition(RunState::Running)?;
                Ok(Recovery::Skipped(justification))
            }
            RecoveryAction::Substitute(step) => {
                if step.index != index {
                    return Ok(Recovery::Fail(FailureReason::SubstituteRejected(format!(
                        "substitute targets step {}, current step is {index}",
                        step.index
                    ))));
                }
                if !self.executor.is_idempotent(step.kind)
                    && self.executor.is_idempotent(recorded_kind)
                {
                    return Ok(Recovery::Fail(FailureReason::SubstituteRejected(format!(
                        "substitute kind '{}' is not idempotent while recorded kind '{}' is",
                        step.kind.as_str(),
                        recorded_kind.as_str()
                    ))));
                }
                logs.push(format!(
                    "step {index}: substituting a '{}' step",
                    step.kind.as_str()
                ));
                snapshot.transition(RunState::Running)?;
                Ok(Recovery::Replaced(step))
            }
            RecoveryAction::Abort { reason } => {
                logs.push(format!("step {index}: aborted by oracle: {reason}"));
                Ok(Recovery::Fail(FailureReason::Aborted(reason)))
            }
        }
    }

    fn checkpoint_row(&self, last_completed_index: u32, artifacts: &[PathBuf]) -> Checkpoint {
        Checkpoint {
            run_id: self.run_id.clone(),
            workflow_name: self.log.workflow_name.clone(),
            version: self.log.version.clone(),
            last_completed_index,
            artifacts: artifacts.to_vec(),
            updated_at: self
                .clock
                .now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0),
        }
    }

    fn finish(
        &self,
        snapshot: &RunSnapshot,
        logs: Vec<String>,
        artifacts: Vec<PathBuf>,
        stopped_at_index: Option<u32>,
        started: SystemTime,
    ) -> WorkflowResult {
        let elapsed = self
            .clock
            .now()
            .duration_since(started)
            .unwrap_or_default()
            .as_secs_f64();
        let result = WorkflowResult {
            success: snapshot.state == RunState::Completed,
            workflow_name: self.log.workflow_name.clone(),
            artifacts,
            logs,
            error: snapshot.failure.as_ref().map(FailureReason::as_str),
            stopped_at_index,
            execution_time_seconds: elapsed,
        };
        self.trace_event(
            "run.finished",
            json!({
                "run_id": self.run_id,
                "success": result.success,
                "error": result.error,
                "stopped_at_index": result.stopped_at_index,
            }),
        );
        result
    }

    // Trace append failures never fail the run.
    fn trace_event(&self, event_type: &str, payload: serde_json::Value) {
        if let Some(logger) = &self.trace {
            let _ = logger.append(&LogEvent {
                level: "info",
                event_type,
                payload,
            });
        }
    }
}

/// Run a step on a detached thread, bounded by the step timeout. A late
/// completion is discarded; the abandoned thread finishes on its own.
fn execute_with_timeout(
    executor: Arc<dyn StepExecutor>,
    step: ConcreteStep,
    timeout: Duration,
) -> Result<StepOutcome, ExecutionError> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(executor.execute(&step));
    });
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(_) => Err(ExecutionError::new(format!(
            "step timed out after {}s",
            timeout.as_secs()
        ))),
    }
}

fn latest_snapshot(artifacts: &[PathBuf]) -> Option<PathBuf> {
    artifacts
        .iter()
        .rev()
        .find(|path| path.extension().map_or(false, |ext| ext == "png"))
        .cloned()
}

fn verdict_label(verdict: &OracleVerdict) -> &'static str {
    match verdict {
        OracleVerdict::TimedOut => "timed_out",
        OracleVerdict::Action(RecoveryAction::Retry) => "retry",
        OracleVerdict::Action(RecoveryAction::Skip { .. }) => "skip",
        OracleVerdict::Action(RecoveryAction::Substitute(_)) => "substitute",
        OracleVerdict::Action(RecoveryAction::Abort { .. }) => "abort",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action_log::Step;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::executor::ScriptedExecutor;
    use crate::runtime::FakeClock;
    use serde_json::json;

    fn shell_log(step_count: u32) -> ActionLog {
        ActionLog {
            workflow_name: "demo".to_string(),
            version: "1.0.0".to_string(),
            steps: (0..step_count)
                .map(|index| Step {
                    index,
                    kind: StepKind::Shell,
                    literal_payload: json!({"command": "true"}),
                    placeholders: vec![],
                    expected_precondition: None,
                    expected_postcondition: None,
                })
                .collect(),
        }
    }

    fn engine_config() -> EngineConfig {
        EngineConfig {
            retry_ceiling: 2,
            step_timeout: Duration::from_secs(5),
            oracle_timeout: Duration::from_secs(5),
            oracle_enabled: true,
        }
    }

    fn run_for(log: ActionLog) -> (WorkflowRun, Arc<InMemoryCheckpointStore>) {
        let store = Arc::new(InMemoryCheckpointStore::default());
        let run = WorkflowRun::new(
            log,
            ParameterMap::new(),
            engine_config(),
            Arc::new(ScriptedExecutor::default()),
            None,
            store.clone(),
            Arc::new(FakeClock::default()),
        );
        (run, store)
    }

    #[test]
    fn empty_log_completes_immediately() {
        let (run, _store) = run_for(shell_log(0));
        let outcome = run.execute().expect("execute");
        match outcome {
            RunOutcome::Terminal(result) => {
                assert!(result.success);
                assert_eq!(result.stopped_at_index, None);
            }
            RunOutcome::Suspended(_) => panic!("should not suspend"),
        }
    }

    #[test]
    fn each_completed_step_writes_one_checkpoint() {
        let (run, store) = run_for(shell_log(3));
        let run_id = run.run_id().to_string();
        let outcome = run.execute().expect("execute");
        assert!(matches!(outcome, RunOutcome::Terminal(ref r) if r.success));
        let history = store.history(&run_id);
        assert_eq!(
            history
                .iter()
                .map(|c| c.last_completed_index)
                .collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn run_ids_are_distinct_across_time() {
        let a = generate_run_id("w", "1", UNIX_EPOCH);
        let b = generate_run_id("w", "1", UNIX_EPOCH + Duration::from_millis(1));
        assert_ne!(a, b);
        assert!(a.starts_with("run-"));
        assert_eq!(a.len(), "run-".len() + 12);
    }
}
