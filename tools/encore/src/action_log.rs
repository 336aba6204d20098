//! The recorded action log: an immutable, ordered sequence of steps
//! produced by the capture front-end and consumed read-only here.
//!
//! On disk a recording is a JSONL file, one `Step` per line, living next
//! to its `manifest.json`.

use crate::errors::EncoreError;
use crate::manifest::WorkflowManifest;
use crate::types::StepKind;
use crate::validator::Expectation;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamShape {
    Text,
    Path,
    Number,
}

impl ParamShape {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Path => "path",
            Self::Number => "number",
        }
    }
}

/// A named substitution slot declared on a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceholderSpec {
    pub name: String,
    pub shape: ParamShape,
    #[serde(default)]
    pub default: Option<String>,
}

/// One recorded unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub index: u32,
    pub kind: StepKind,
    pub literal_payload: Value,
    #[serde(default)]
    pub placeholders: Vec<PlaceholderSpec>,
    #[serde(default)]
    pub expected_precondition: Option<Expectation>,
    #[serde(default)]
    pub expected_postcondition: Option<Expectation>,
}

/// An immutable recording, identified by workflow name and version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionLog {
    pub workflow_name: String,
    pub version: String,
    pub steps: Vec<Step>,
}

impl ActionLog {
    /// Verify the structural invariants: indices are 0-based, contiguous,
    /// and duplicate-free.
    pub fn validate_integrity(&self) -> Result<(), EncoreError> {
        let mut seen = BTreeSet::new();
        for step in &self.steps {
            if !seen.insert(step.index) {
                return Err(EncoreError::Validation(format!(
                    "duplicate step index {} in workflow '{}'",
                    step.index, self.workflow_name
                )));
            }
        }
        for (position, step) in self.steps.iter().enumerate() {
            if step.index as usize != position {
                return Err(EncoreError::Validation(format!(
                    "non-contiguous step index {} at position {} in workflow '{}'",
                    step.index, position, self.workflow_name
                )));
            }
        }
        Ok(())
    }

    /// Parse a JSONL recording body. Line numbers are 1-based in errors.
    pub fn from_jsonl(workflow_name: &str, version: &str, raw: &str) -> Result<Self, EncoreError> {
        let mut steps = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let step: Step = serde_json::from_str(line).map_err(|e| {
                EncoreError::Validation(format!("recording line {}: {e}", idx + 1))
            })?;
            steps.push(step);
        }
        let log = Self {
            workflow_name: workflow_name.to_string(),
            version: version.to_string(),
            steps,
        };
        log.validate_integrity()?;
        Ok(log)
    }
}

/// Hex sha256 digest of a recording body, compared against the manifest's
/// `recording_sha256` on load.
pub fn recording_digest(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Injected provider of action logs. Lookup by `(name, version)` is
/// deterministic; `Ok(None)` means no such workflow version exists.
pub trait ActionLogSource: Send + Sync {
    fn load(&self, workflow_name: &str, version: &str) -> Result<Option<ActionLog>, EncoreError>;
}

/// File-backed source: `<recordings_dir>/<workflow_name>/` holds
/// `manifest.json` and `recording.jsonl`.
pub struct JsonlActionLogSource {
    recordings_dir: PathBuf,
}

impl JsonlActionLogSource {
    pub fn new(recordings_dir: impl Into<PathBuf>) -> Self {
        Self {
            recordings_dir: recordings_dir.into(),
        }
    }

    pub fn manifest(&self, workflow_name: &str) -> Result<Option<WorkflowManifest>, EncoreError> {
        let path = self.recordings_dir.join(workflow_name).join("manifest.json");
        if !path.exists() {
            return Ok(None);
        }
        let text =
            std::fs::read_to_string(&path).map_err(|e| EncoreError::Io(e.to_string()))?;
        Ok(Some(WorkflowManifest::from_json_str(&text)?))
    }
}

impl ActionLogSource for JsonlActionLogSource {
    fn load(&self, workflow_name: &str, version: &str) -> Result<Option<ActionLog>, EncoreError> {
        let Some(manifest) = self.manifest(workflow_name)? else {
            return Ok(None);
        };
        if manifest.version != version {
            return Ok(None);
        }

        let recording_path = self
            .recordings_dir
            .join(workflow_name)
            .join("recording.jsonl");
        let raw = std::fs::read_to_string(&recording_path)
            .map_err(|e| EncoreError::Io(e.to_string()))?;

        if let Some(expected) = &manifest.recording_sha256 {
            let actual = recording_digest(&raw);
            if &actual != expected {
                return Err(EncoreError::Validation(format!(
                    "recording digest mismatch for '{workflow_name}': manifest says {expected}, file is {actual}"
                )));
            }
        }

        Ok(Some(ActionLog::from_jsonl(workflow_name, version, &raw)?))
    }
}

/// In-memory source for tests and embedding callers.
#[derive(Default)]
pub struct InMemoryActionLogSource {
    logs: Mutex<HashMap<(String, String), ActionLog>>,
}

impl InMemoryActionLogSource {
    pub fn insert(&self, log: ActionLog) {
        self.logs
            .lock()
            .expect("logs lock")
            .insert((log.workflow_name.clone(), log.version.clone()), log);
    }
}

impl ActionLogSource for InMemoryActionLogSource {
    fn load(&self, workflow_name: &str, version: &str) -> Result<Option<ActionLog>, EncoreError> {
        Ok(self
            .logs
            .lock()
            .expect("logs lock")
            .get(&(workflow_name.to_string(), version.to_string()))
            .cloned())
    }
}
