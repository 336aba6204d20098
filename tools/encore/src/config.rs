use crate::errors::EncoreError;
use crate::runtime::FileSystem;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_STEP_TIMEOUT_SECONDS: u64 = 120;
pub const DEFAULT_ORACLE_TIMEOUT_SECONDS: u64 = 60;

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub recordings_dir: Option<PathBuf>,
    pub retry_ceiling: Option<u32>,
    pub step_timeout_seconds: Option<u64>,
    pub oracle_timeout_seconds: Option<u64>,
    pub no_oracle: bool,
    pub run_log: Option<PathBuf>,
}

/// Engine options recognized by a run. `retry_ceiling` carries no
/// implicit default: the caller must state one in the config file or on
/// the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub retry_ceiling: u32,
    pub step_timeout: Duration,
    pub oracle_timeout: Duration,
    pub oracle_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaySettings {
    pub engine: EngineConfig,
    pub recordings_dir: PathBuf,
    pub checkpoint_db: PathBuf,
    pub run_log: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    replay: ReplaySection,
    #[serde(default)]
    recordings: RecordingsSection,
    #[serde(default)]
    log: LogSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ReplaySection {
    retry_ceiling: Option<u32>,
    step_timeout_seconds: Option<u64>,
    oracle_timeout_seconds: Option<u64>,
    oracle_enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RecordingsSection {
    dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LogSection {
    path: Option<PathBuf>,
}

pub fn load_settings(
    overrides: &CliOverrides,
    cwd: &Path,
    fs: &dyn FileSystem,
) -> Result<ReplaySettings, EncoreError> {
    let file = match &overrides.config_path {
        Some(path) => {
            let text = fs.read_to_string(path)?;
            toml::from_str::<ConfigFile>(&text)
                .map_err(|e| EncoreError::ConfigParse(e.to_string()))?
        }
        None => {
            let default_path = cwd.join("encore.toml");
            if fs.exists(&default_path) {
                let text = fs.read_to_string(&default_path)?;
                toml::from_str::<ConfigFile>(&text)
                    .map_err(|e| EncoreError::ConfigParse(e.to_string()))?
            } else {
                ConfigFile::default()
            }
        }
    };

    let retry_ceiling = overrides
        .retry_ceiling
        .or(file.replay.retry_ceiling)
        .ok_or_else(|| {
            EncoreError::InvalidConfig(
                "retry_ceiling is required: set [replay].retry_ceiling or pass --retry-ceiling"
                    .to_string(),
            )
        })?;

    let step_timeout_seconds = overrides
        .step_timeout_seconds
        .or(file.replay.step_timeout_seconds)
        .unwrap_or(DEFAULT_STEP_TIMEOUT_SECONDS);
    if step_timeout_seconds == 0 {
        return Err(EncoreError::InvalidConfig(
            "step_timeout_seconds must be positive".to_string(),
        ));
    }

    let oracle_timeout_seconds = overrides
        .oracle_timeout_seconds
        .or(file.replay.oracle_timeout_seconds)
        .unwrap_or(DEFAULT_ORACLE_TIMEOUT_SECONDS);
    if oracle_timeout_seconds == 0 {
        return Err(EncoreError::InvalidConfig(
            "oracle_timeout_seconds must be positive".to_string(),
        ));
    }

    let oracle_enabled = if overrides.no_oracle {
        false
    } else {
        file.replay.oracle_enabled.unwrap_or(true)
    };

    let recordings_dir = overrides
        .recordings_dir
        .clone()
        .or(file.recordings.dir)
        .map(|dir| if dir.is_absolute() { dir } else { cwd.join(dir) })
        .unwrap_or_else(|| cwd.join("recordings"));

    let run_log = overrides
        .run_log
        .clone()
        .or(file.log.path)
        .map(|path| if path.is_absolute() { path } else { cwd.join(path) });

    Ok(ReplaySettings {
        engine: EngineConfig {
            retry_ceiling,
            step_timeout: Duration::from_secs(step_timeout_seconds),
            oracle_timeout: Duration::from_secs(oracle_timeout_seconds),
            oracle_enabled,
        },
        recordings_dir,
        checkpoint_db: cwd.join(".cache/encore/checkpoints.sqlite"),
        run_log,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FakeFileSystem;

    fn overrides_with_config(path: &str) -> CliOverrides {
        CliOverrides {
            config_path: Some(PathBuf::from(path)),
            ..CliOverrides::default()
        }
    }

    #[test]
    fn full_config_file_parses() {
        let fs = FakeFileSystem::with_file(
            "/config.toml",
            r#"
[replay]
retry_ceiling = 2
step_timeout_seconds = 30
oracle_timeout_seconds = 10
oracle_enabled = false

[recordings]
dir = "captures"

[log]
path = ".cache/encore/run.jsonl"
"#,
        );
        let settings =
            load_settings(&overrides_with_config("/config.toml"), Path::new("/work"), &fs)
                .expect("load");
        assert_eq!(settings.engine.retry_ceiling, 2);
        assert_eq!(settings.engine.step_timeout, Duration::from_secs(30));
        assert_eq!(settings.engine.oracle_timeout, Duration::from_secs(10));
        assert!(!settings.engine.oracle_enabled);
        assert_eq!(settings.recordings_dir, PathBuf::from("/work/captures"));
        assert_eq!(
            settings.run_log,
            Some(PathBuf::from("/work/.cache/encore/run.jsonl"))
        );
    }

    #[test]
    fn retry_ceiling_has_no_implicit_default() {
        let fs = FakeFileSystem::with_file("/config.toml", "[replay]\noracle_enabled = true\n");
        let err = load_settings(&overrides_with_config("/config.toml"), Path::new("/w"), &fs)
            .expect_err("must fail");
        assert!(err.to_string().contains("retry_ceiling is required"));
    }

    #[test]
    fn cli_overrides_win_over_the_file() {
        let fs = FakeFileSystem::with_file("/config.toml", "[replay]\nretry_ceiling = 5\n");
        let overrides = CliOverrides {
            config_path: Some(PathBuf::from("/config.toml")),
            retry_ceiling: Some(1),
            step_timeout_seconds: Some(7),
            no_oracle: true,
            ..CliOverrides::default()
        };
        let settings = load_settings(&overrides, Path::new("/w"), &fs).expect("load");
        assert_eq!(settings.engine.retry_ceiling, 1);
        assert_eq!(settings.engine.step_timeout, Duration::from_secs(7));
        assert!(!settings.engine.oracle_enabled);
    }

    #[test]
    fn missing_default_file_falls_back_to_cli_only() {
        let fs = FakeFileSystem::default();
        let overrides = CliOverrides {
            retry_ceiling: Some(3),
            ..CliOverrides::default()
        };
        let settings = load_settings(&overrides, Path::new("/w"), &fs).expect("load");
        assert_eq!(settings.engine.retry_ceiling, 3);
        assert_eq!(
            settings.engine.step_timeout,
            Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECONDS)
        );
        assert!(settings.engine.oracle_enabled);
        assert_eq!(settings.recordings_dir, PathBuf::from("/w/recordings"));
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let fs = FakeFileSystem::default();
        let overrides = CliOverrides {
            retry_ceiling: Some(1),
            step_timeout_seconds: Some(0),
            ..CliOverrides::default()
        };
        let err = load_settings(&overrides, Path::new("/w"), &fs).expect_err("must fail");
        assert!(err.to_string().contains("step_timeout_seconds"));
    }
}
