//! Workflow manifest: metadata written next to a recording by the capture
//! front-end. The engine reads it to resolve versions, pre-check required
//! inputs, and verify recording integrity.

use crate::binder::ParameterMap;
use crate::errors::EncoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowManifest {
    pub workflow_name: String,
    pub description: String,
    pub version: String,
    #[serde(default)]
    pub recorded_at: String,
    #[serde(default)]
    pub recorded_by: String,
    /// Required input parameters: name -> human description.
    #[serde(default)]
    pub input_parameters: BTreeMap<String, String>,
    /// Artifact patterns the workflow is expected to produce.
    #[serde(default)]
    pub output_artifacts: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub recording_path: String,
    /// Hex sha256 of the recording file, if the recorder captured one.
    #[serde(default)]
    pub recording_sha256: Option<String>,
}

impl WorkflowManifest {
    pub fn from_json_str(text: &str) -> Result<Self, EncoreError> {
        serde_json::from_str(text).map_err(|e| EncoreError::Validation(format!("manifest: {e}")))
    }

    pub fn to_json_string(&self) -> Result<String, EncoreError> {
        serde_json::to_string_pretty(self).map_err(|e| EncoreError::Io(e.to_string()))
    }

    /// Required inputs declared by the manifest but absent from the
    /// supplied parameter map, sorted by name.
    pub fn missing_inputs(&self, params: &ParameterMap) -> Vec<String> {
        self.input_parameters
            .keys()
            .filter(|name| !params.contains_key(*name))
            .cloned()
            .collect()
    }
}
