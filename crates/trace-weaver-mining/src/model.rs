use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use trace_weaver_core::TraceError;

/// Expected workflow as a transition table.
///
/// States are named after the activity that entered them, plus the initial
/// state. An empty `final_states` set accepts every state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ReferenceModel {
    pub name: String,
    pub initial: String,
    #[serde(default, rename = "final", skip_serializing_if = "BTreeSet::is_empty")]
    pub final_states: BTreeSet<String>,
    pub transitions: BTreeMap<String, BTreeSet<String>>,
}

impl ReferenceModel {
    /// # Errors
    /// Returns [`TraceError::Validation`] when the YAML is malformed or the model is invalid.
    pub fn from_yaml_str(raw: &str) -> Result<Self, TraceError> {
        let model: Self = serde_yaml::from_str(raw)
            .map_err(|err| TraceError::Validation(format!("invalid reference model YAML: {err}")))?;
        model.validate()?;
        Ok(model)
    }

    /// # Errors
    /// Returns [`TraceError::Validation`] when the JSON is malformed or the model is invalid.
    pub fn from_json_str(raw: &str) -> Result<Self, TraceError> {
        let model: Self = serde_json::from_str(raw)
            .map_err(|err| TraceError::Validation(format!("invalid reference model JSON: {err}")))?;
        model.validate()?;
        Ok(model)
    }

    /// Loads a model file; `.json` files are read as JSON, anything else as YAML.
    ///
    /// # Errors
    /// Returns [`TraceError::Configuration`] when the file cannot be read and
    /// [`TraceError::Validation`] when its content is invalid.
    pub fn load(path: &Path) -> Result<Self, TraceError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            TraceError::Configuration(format!(
                "failed to read reference model {}: {err}",
                path.display()
            ))
        })?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&raw)
        } else {
            Self::from_yaml_str(&raw)
        }
    }

    /// # Errors
    /// Returns [`TraceError::Validation`] describing the first structural problem.
    pub fn validate(&self) -> Result<(), TraceError> {
        if self.name.trim().is_empty() {
            return Err(TraceError::Validation(
                "reference model name MUST be non-empty".to_string(),
            ));
        }
        if self.initial.trim().is_empty() {
            return Err(TraceError::Validation(
                "reference model initial state MUST be non-empty".to_string(),
            ));
        }
        if self.transitions.is_empty() {
            return Err(TraceError::Validation(
                "reference model MUST declare at least one transition".to_string(),
            ));
        }

        let states = self.states();
        for (state, targets) in &self.transitions {
            if !states.contains(state.as_str()) {
                return Err(TraceError::Validation(format!(
                    "transition source {state} is unreachable: it is neither the initial state nor a target"
                )));
            }
            if targets.iter().any(|target| target.trim().is_empty()) {
                return Err(TraceError::Validation(format!(
                    "transition targets of {state} MUST be non-empty"
                )));
            }
        }
        for state in &self.final_states {
            if !states.contains(state.as_str()) {
                return Err(TraceError::Validation(format!(
                    "final state {state} is not a state of the model"
                )));
            }
        }

        Ok(())
    }

    /// Every state: the initial state and every transition target.
    #[must_use]
    pub fn states(&self) -> BTreeSet<&str> {
        std::iter::once(self.initial.as_str())
            .chain(
                self.transitions
                    .values()
                    .flat_map(|targets| targets.iter().map(String::as_str)),
            )
            .collect()
    }

    #[must_use]
    pub fn allowed(&self, state: &str) -> Option<&BTreeSet<String>> {
        self.transitions.get(state)
    }

    #[must_use]
    pub fn is_final(&self, state: &str) -> bool {
        self.final_states.is_empty() || self.final_states.contains(state)
    }

    /// SHA-256 over the canonical JSON form, hex encoded.
    ///
    /// # Errors
    /// Returns [`TraceError::Validation`] when the model cannot be serialized.
    pub fn fingerprint(&self) -> Result<String, TraceError> {
        let bytes = serde_json::to_vec(self)
            .map_err(|err| TraceError::Validation(format!("failed to encode model: {err}")))?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = "
name: ci-fix
initial: start
final: [commit.created]
transitions:
  start: [session.start]
  session.start: [objective.set]
  objective.set: [task.completed]
  task.completed: [task.completed, commit.created]
";

    fn must<T>(result: Result<T, TraceError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    #[test]
    fn yaml_and_json_forms_share_a_fingerprint() {
        let from_yaml = must(ReferenceModel::from_yaml_str(YAML));
        let json = match serde_json::to_string(&from_yaml) {
            Ok(value) => value,
            Err(err) => panic!("encode failed: {err}"),
        };
        let from_json = must(ReferenceModel::from_json_str(&json));

        assert_eq!(from_yaml, from_json);
        let fingerprint = must(from_yaml.fingerprint());
        assert_eq!(fingerprint.len(), 64);
        assert_eq!(fingerprint, must(from_json.fingerprint()));
        assert!(from_yaml.is_final("commit.created"));
        assert!(!from_yaml.is_final("task.completed"));
    }

    #[test]
    fn structural_problems_are_rejected() {
        let unreachable = "name: m\ninitial: start\ntransitions:\n  start: [a]\n  ghost: [a]\n";
        let bad_final = "name: m\ninitial: start\nfinal: [zzz]\ntransitions:\n  start: [a]\n";
        let empty = "name: m\ninitial: start\ntransitions: {}\n";
        let unknown_field = "name: m\ninitial: start\nextra: 1\ntransitions:\n  start: [a]\n";

        for raw in [unreachable, bad_final, empty, unknown_field] {
            assert!(matches!(
                ReferenceModel::from_yaml_str(raw),
                Err(TraceError::Validation(_))
            ));
        }
    }

    #[test]
    fn missing_file_is_a_configuration_error() {
        assert!(matches!(
            ReferenceModel::load(Path::new("/nonexistent/model.yaml")),
            Err(TraceError::Configuration(_))
        ));
    }
}
