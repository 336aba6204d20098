//! Precondition/postcondition checking: structured expectations compared
//! against probed environment state. Pure; never touches the environment.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A recorded expectation about environment state around a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum Expectation {
    FileExists { path: String },
    WindowFocused { title: String },
    UrlIs { url: String },
    Probe { description: String },
}

impl Expectation {
    pub fn describe(&self) -> String {
        match self {
            Self::FileExists { path } => format!("file exists: {path}"),
            Self::WindowFocused { title } => format!("window focused: {title}"),
            Self::UrlIs { url } => format!("url is: {url}"),
            Self::Probe { description } => format!("probe: {description}"),
        }
    }

    /// The fact key a probe must fill in for this expectation.
    pub fn fact_key(&self) -> String {
        match self {
            Self::FileExists { path } => format!("file_exists:{path}"),
            Self::WindowFocused { .. } => "focused_window".to_string(),
            Self::UrlIs { .. } => "url".to_string(),
            Self::Probe { description } => format!("probe:{description}"),
        }
    }
}

/// A snapshot of observed environment facts, produced by the step
/// executor's probe capability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedState {
    pub facts: BTreeMap<String, String>,
}

impl ObservedState {
    pub fn with_fact(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut facts = BTreeMap::new();
        facts.insert(key.into(), value.into());
        Self { facts }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.facts.insert(key.into(), value.into());
    }
}

/// Expected-vs-observed mismatch, carried verbatim to the decision oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Divergence {
    pub expected: String,
    pub observed: String,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Match,
    Divergence(Divergence),
}

impl Validation {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match)
    }
}

/// Compare an optional expectation against observed state.
///
/// No expectation means the recorded step carried no state assertion and
/// is always attempted.
pub fn validate(expected: Option<&Expectation>, observed: &ObservedState) -> Validation {
    let Some(expected) = expected else {
        return Validation::Match;
    };

    let key = expected.fact_key();
    let Some(actual) = observed.facts.get(&key) else {
        return Validation::Divergence(Divergence {
            expected: expected.describe(),
            observed: render_facts(observed),
            detail: format!("no observation for '{key}'"),
        });
    };

    let satisfied = match expected {
        Expectation::FileExists { .. } | Expectation::Probe { .. } => actual == "true",
        Expectation::WindowFocused { title } => actual == title,
        Expectation::UrlIs { url } => actual == url,
    };

    if satisfied {
        Validation::Match
    } else {
        Validation::Divergence(Divergence {
            expected: expected.describe(),
            observed: render_facts(observed),
            detail: format!("'{key}' was '{actual}'"),
        })
    }
}

fn render_facts(observed: &ObservedState) -> String {
    if observed.facts.is_empty() {
        return "(no facts observed)".to_string();
    }
    observed
        .facts
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(", ")
}
