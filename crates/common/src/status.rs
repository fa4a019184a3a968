//! Status normalization.
//!
//! The compute API reports VM status inconsistently: the field has been
//! observed at `state`, `status`, `data.state` and `data.status`, and the
//! value vocabulary varies across deployments. Normalization therefore
//! runs an ordered list of extraction rules over the payload and buckets
//! the first value found into the canonical state space.

use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::VmState;

/// Default extraction priority.
///
/// `state` first matches current API responses; older deployments answered
/// `status` first, which is why the list is configuration and not a
/// hard-coded assumption.
pub const DEFAULT_STATUS_FIELDS: &[&str] = &["state", "status", "data.state", "data.status"];

/// A dotted-path extraction rule, e.g. `data.state`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRule {
    path: Vec<String>,
}

impl FieldRule {
    pub fn parse(raw: &str) -> Result<Self> {
        let path: Vec<String> = raw.split('.').map(|s| s.trim().to_string()).collect();
        if path.iter().any(|seg| seg.is_empty()) {
            return Err(Error::InvalidConfig(format!(
                "bad status field path: {:?}",
                raw
            )));
        }
        Ok(Self { path })
    }

    /// Look the rule up in a payload. Only string values count as present.
    pub fn lookup<'a>(&self, payload: &'a Value) -> Option<&'a str> {
        let mut cur = payload;
        for seg in &self.path {
            cur = cur.get(seg)?;
        }
        cur.as_str()
    }
}

impl std::fmt::Display for FieldRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path.join("."))
    }
}

/// The built-in rule list.
pub fn default_rules() -> Vec<FieldRule> {
    DEFAULT_STATUS_FIELDS
        .iter()
        .map(|raw| FieldRule {
            path: raw.split('.').map(str::to_string).collect(),
        })
        .collect()
}

/// Parse a comma-separated rule list, e.g. `status,state,data.status`.
pub fn parse_rules(raw: &str) -> Result<Vec<FieldRule>> {
    let rules: Vec<FieldRule> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(FieldRule::parse)
        .collect::<Result<_>>()?;
    if rules.is_empty() {
        return Err(Error::InvalidConfig(
            "status field list is empty".to_string(),
        ));
    }
    Ok(rules)
}

/// First-present-wins extraction over the rule list.
pub fn extract_status(payload: &Value, rules: &[FieldRule]) -> Option<String> {
    rules
        .iter()
        .find_map(|rule| rule.lookup(payload).map(str::to_string))
}

/// Bucket a raw remote status string into the canonical state space.
///
/// Matching is case-insensitive. Anything outside the known vocabulary is
/// `Unknown` rather than an error: the panel still renders, just without a
/// tone.
pub fn classify(raw: &str) -> VmState {
    match raw.trim().to_ascii_lowercase().as_str() {
        "running" | "active" => VmState::Running,
        "stopped" | "off" => VmState::Stopped,
        other => {
            debug!("unrecognized compute status {:?}", other);
            VmState::Unknown
        }
    }
}

/// Normalize a 2xx status payload: extract, then classify. A payload with
/// no recognized field is `Unknown`, not a failure.
pub fn normalize_payload(payload: &Value, rules: &[FieldRule]) -> (VmState, Option<String>) {
    match extract_status(payload, rules) {
        Some(raw) => (classify(&raw), Some(raw)),
        None => (VmState::Unknown, None),
    }
}
