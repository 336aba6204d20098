pub mod action_log;
pub mod binder;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod fsm;
pub mod logging;
pub mod manifest;
pub mod oracle;
pub mod runtime;
pub mod types;
pub mod validator;

use action_log::{ActionLogSource, JsonlActionLogSource};
use binder::{ParamValue, ParameterMap};
use checkpoint::SqliteCheckpointStore;
use clap::{error::ErrorKind, CommandFactory, Parser};
use config::{load_settings, CliOverrides};
use engine::{RunOutcome, WorkflowRun};
use errors::EncoreError;
use executor::ShellStepExecutor;
use logging::JsonlLogger;
use runtime::ProductionRuntime;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Parser)]
#[command(name = "encore")]
#[command(about = "Replay recorded workflows with parameter substitution")]
pub struct Cli {
    /// Name of the recorded workflow to replay.
    #[arg(long)]
    pub workflow: String,
    /// Recording version; defaults to the version in the manifest.
    #[arg(long = "workflow-version")]
    pub workflow_version: Option<String>,
    /// Runtime parameter, `name=value`. Repeatable.
    #[arg(long = "param")]
    pub params: Vec<String>,
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long = "recordings-dir")]
    pub recordings_dir: Option<PathBuf>,
    /// Stable run id; pair with --resume to continue an earlier run.
    #[arg(long = "run-id")]
    pub run_id: Option<String>,
    #[arg(long, default_value_t = false)]
    pub resume: bool,
    #[arg(long = "no-oracle", default_value_t = false)]
    pub no_oracle: bool,
    #[arg(long = "retry-ceiling")]
    pub retry_ceiling: Option<u32>,
    /// Per-step timeout in seconds.
    #[arg(long = "step-timeout")]
    pub step_timeout: Option<u64>,
    /// Oracle consultation timeout in seconds.
    #[arg(long = "oracle-timeout")]
    pub oracle_timeout: Option<u64>,
    /// JSONL trace of engine decisions.
    #[arg(long = "run-log")]
    pub run_log: Option<PathBuf>,
}

pub fn run() -> Result<i32, EncoreError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir().map_err(|e| EncoreError::Io(e.to_string()))?;
    let runtime = ProductionRuntime::new();
    run_with_runtime(&args, &cwd, &runtime)
}

pub fn run_with_runtime(
    args: &[std::ffi::OsString],
    cwd: &std::path::Path,
    runtime: &ProductionRuntime,
) -> Result<i32, EncoreError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(EncoreError::Cli(error.to_string())),
        },
    };

    let overrides = CliOverrides {
        config_path: cli.config.clone(),
        recordings_dir: cli.recordings_dir.clone(),
        retry_ceiling: cli.retry_ceiling,
        step_timeout_seconds: cli.step_timeout,
        oracle_timeout_seconds: cli.oracle_timeout,
        no_oracle: cli.no_oracle,
        run_log: cli.run_log.clone(),
    };
    let settings = load_settings(&overrides, cwd, runtime.file_system.as_ref())?;

    let params = parse_params(&cli.params)?;

    let source = JsonlActionLogSource::new(&settings.recordings_dir);
    let manifest = source.manifest(&cli.workflow)?.ok_or_else(|| {
        EncoreError::Validation(format!(
            "no recording named '{}' under {}",
            cli.workflow,
            settings.recordings_dir.display()
        ))
    })?;

    // Fail on missing required inputs before any step has a chance to
    // touch the environment.
    let missing = manifest.missing_inputs(&params);
    if !missing.is_empty() {
        return Err(EncoreError::Validation(format!(
            "workflow '{}' requires inputs not supplied: {}",
            cli.workflow,
            missing.join(", ")
        )));
    }

    let version = cli
        .workflow_version
        .clone()
        .unwrap_or_else(|| manifest.version.clone());
    let log = source.load(&cli.workflow, &version)?.ok_or_else(|| {
        EncoreError::Validation(format!(
            "workflow '{}' has no version '{version}'",
            cli.workflow
        ))
    })?;

    let store = Arc::new(SqliteCheckpointStore::open(&settings.checkpoint_db)?);
    let executor = Arc::new(ShellStepExecutor::new(
        runtime.process_runner.clone(),
        runtime.file_system.clone(),
    ));

    // The CLI ships no oracle backend; with recovery enabled but nothing
    // to consult, the first divergence fails the run with a specific
    // reason instead of a silent retry loop.
    let mut run = WorkflowRun::new(
        log,
        params,
        settings.engine.clone(),
        executor,
        None,
        store,
        runtime.clock.clone(),
    );
    if let Some(run_id) = &cli.run_id {
        run = run.with_run_id(run_id.clone());
    }
    if cli.resume {
        run = run.resuming();
    }
    if let Some(path) = &settings.run_log {
        run = run.with_trace(JsonlLogger::new(path));
    }

    let run_id = run.run_id().to_string();
    runtime.terminal.write_line(&format!(
        "{run_id}: replaying '{}' v{version}",
        cli.workflow
    ))?;

    match run.execute()? {
        RunOutcome::Terminal(result) => {
            for line in &result.logs {
                runtime.terminal.write_line(&format!("  {line}"))?;
            }
            for artifact in &result.artifacts {
                runtime
                    .terminal
                    .write_line(&format!("  artifact: {}", artifact.display()))?;
            }
            if result.success {
                runtime.terminal.write_line(&format!(
                    "{run_id}: completed in {:.1}s",
                    result.execution_time_seconds
                ))?;
                Ok(0)
            } else {
                let error = result.error.as_deref().unwrap_or("unknown failure");
                runtime
                    .terminal
                    .write_line(&format!("{run_id}: failed: {error}"))?;
                Ok(1)
            }
        }
        RunOutcome::Suspended(checkpoint) => {
            let position = match &checkpoint {
                Some(checkpoint) => {
                    format!("after step {}", checkpoint.last_completed_index)
                }
                None => "before any step completed".to_string(),
            };
            runtime.terminal.write_line(&format!(
                "{run_id}: suspended {position}; continue with --resume --run-id {run_id}"
            ))?;
            Ok(0)
        }
    }
}

fn parse_params(raw: &[String]) -> Result<ParameterMap, EncoreError> {
    let mut params = ParameterMap::new();
    for entry in raw {
        let Some((key, value)) = entry.split_once('=') else {
            return Err(EncoreError::Cli(format!(
                "--param '{entry}' is not name=value"
            )));
        };
        if key.is_empty() {
            return Err(EncoreError::Cli(format!(
                "--param '{entry}' has an empty name"
            )));
        }
        params.insert(key.to_string(), ParamValue::Text(value.to_string()));
    }
    Ok(params)
}

pub fn render_help() -> String {
    Cli::command().render_help().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_parse_as_name_value_pairs() {
        let params = parse_params(&[
            "html_path=viewer.html".to_string(),
            "note=a=b".to_string(),
        ])
        .expect("parse");
        assert_eq!(
            params.get("html_path"),
            Some(&ParamValue::Text("viewer.html".to_string()))
        );
        assert_eq!(
            params.get("note"),
            Some(&ParamValue::Text("a=b".to_string()))
        );
    }

    #[test]
    fn malformed_params_are_rejected() {
        assert!(parse_params(&["no_equals".to_string()]).is_err());
        assert!(parse_params(&["=value".to_string()]).is_err());
    }

    #[test]
    fn run_with_runtime_reports_through_the_terminal() {
        use crate::runtime::{
            FakeTerminal, ProductionClock, ProductionFileSystem, ProductionProcessRunner,
        };
        use std::ffi::OsString;

        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("recordings/open_viewer");
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(
            dir.join("manifest.json"),
            r#"{"workflow_name": "open_viewer", "description": "smoke", "version": "1.0.0"}"#,
        )
        .expect("manifest");
        std::fs::write(
            dir.join("recording.jsonl"),
            "{\"index\":0,\"kind\":\"shell\",\"literal_payload\":{\"command\":\"true\"}}\n",
        )
        .expect("recording");

        let terminal = FakeTerminal::default();
        let runtime = ProductionRuntime {
            clock: Arc::new(ProductionClock),
            file_system: Arc::new(ProductionFileSystem),
            process_runner: Arc::new(ProductionProcessRunner),
            terminal: Arc::new(terminal.clone()),
        };
        let args: Vec<OsString> = [
            "encore",
            "--workflow",
            "open_viewer",
            "--retry-ceiling",
            "1",
        ]
        .iter()
        .map(OsString::from)
        .collect();

        let code = run_with_runtime(&args, temp.path(), &runtime).expect("run");
        assert_eq!(code, 0);
        let lines = terminal.written_lines();
        assert!(lines.iter().any(|line| line.contains("replaying 'open_viewer'")));
        assert!(lines.iter().any(|line| line.contains("completed")));
    }

    #[test]
    fn help_names_the_replay_flags() {
        let help = render_help();
        for flag in [
            "--workflow",
            "--param",
            "--resume",
            "--retry-ceiling",
            "--no-oracle",
        ] {
            assert!(help.contains(flag), "help should mention {flag}");
        }
    }
}
