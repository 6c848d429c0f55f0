//! Parameter resolution with `${NAME}` substitution.
//!
//! Only the `${...}` family is substituted. `$(alt_for_param)` tokens are UI hints for
//! alternative input representations and pass through untouched; the stage picks the
//! concrete value at runtime.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{PipelineError, Result};
use crate::pipeline::types::{PipelineDocument, StageSpec};

/// `${NAME}` or `${NAME:-default}`, non-greedy per token
static VAR_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_.]*)(?::-([^}]*))?\}").expect("valid variable token regex")
});

/// Variables visible to one pipeline run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: HashMap<String, String>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the process environment
    pub fn from_process() -> Self {
        std::env::vars().collect()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Layer `self` over `base`: entries of `self` win
    pub fn over(&self, base: &Environment) -> Environment {
        let mut merged = base.clone();
        merged.vars.extend(self.vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    /// Effective environment of a run.
    ///
    /// Precedence: explicit run environment, then document variables, then (optionally)
    /// the process environment.
    pub fn for_document(document: &PipelineDocument, explicit: &Environment, inherit_process: bool) -> Environment {
        let base = if inherit_process {
            Environment::from_process()
        } else {
            Environment::new()
        };
        let scoped: Environment = document
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        explicit.over(&scoped.over(&base))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// Resolves `${NAME}` tokens inside stage parameter documents
#[derive(Debug, Clone, Copy)]
pub struct ParameterResolver<'a> {
    env: &'a Environment,
}

impl<'a> ParameterResolver<'a> {
    pub fn new(env: &'a Environment) -> Self {
        Self { env }
    }

    /// Resolve a single string, failing on the first document-level miss
    pub fn resolve_str(&self, input: &str) -> Result<String> {
        let mut missing = Vec::new();
        let resolved = self.substitute(input, &mut missing);
        into_result(resolved, missing)
    }

    /// Resolve a scalar, list or nested mapping
    pub fn resolve_value(&self, value: &Value) -> Result<Value> {
        let mut missing = Vec::new();
        let resolved = self.resolve_into(value, &mut missing);
        into_result(resolved, missing)
    }

    /// Resolve the parameters of every stage; all missing names are reported together
    pub fn resolve_stages(&self, stages: &[StageSpec]) -> Result<Vec<StageSpec>> {
        let mut missing = Vec::new();
        let resolved = stages.iter().map(|stage| self.resolve_spec(stage, &mut missing)).collect();
        into_result(resolved, missing)
    }

    pub fn resolve_stage(&self, stage: &StageSpec) -> Result<StageSpec> {
        let mut missing = Vec::new();
        let resolved = self.resolve_spec(stage, &mut missing);
        into_result(resolved, missing)
    }

    fn resolve_spec(&self, stage: &StageSpec, missing: &mut Vec<String>) -> StageSpec {
        StageSpec {
            type_name: stage.type_name.clone(),
            stage_id: stage.stage_id.clone(),
            params: self.resolve_map(&stage.params, missing),
        }
    }

    fn resolve_into(&self, value: &Value, missing: &mut Vec<String>) -> Value {
        match value {
            Value::String(s) => Value::String(self.substitute(s, missing)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.resolve_into(v, missing)).collect()),
            Value::Object(map) => Value::Object(self.resolve_map(map, missing)),
            other => other.clone(),
        }
    }

    fn resolve_map(&self, map: &Map<String, Value>, missing: &mut Vec<String>) -> Map<String, Value> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.resolve_into(v, missing)))
            .collect()
    }

    fn substitute(&self, input: &str, missing: &mut Vec<String>) -> String {
        let mut output = String::with_capacity(input.len());
        let mut last = 0;

        for caps in VAR_TOKEN_RE.captures_iter(input) {
            let (Some(token), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            output.push_str(&input[last..token.start()]);

            match (self.env.get(name.as_str()), caps.get(2)) {
                (Some(value), _) => output.push_str(value),
                (None, Some(default)) => output.push_str(default.as_str()),
                (None, None) => {
                    if !missing.iter().any(|m| m == name.as_str()) {
                        missing.push(name.as_str().to_string());
                    }
                    output.push_str(token.as_str());
                }
            }
            last = token.end();
        }

        output.push_str(&input[last..]);
        output
    }
}

fn into_result<T>(value: T, missing: Vec<String>) -> Result<T> {
    if missing.is_empty() {
        Ok(value)
    } else {
        Err(PipelineError::UnresolvedVariable { names: missing })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn substitutes_output_path() {
        let env = Environment::new().with("TEST_OUTPUT_PATH", "/tmp");
        let resolver = ParameterResolver::new(&env);
        assert_eq!(resolver.resolve_str("${TEST_OUTPUT_PATH}/out.tif").unwrap(), "/tmp/out.tif");
    }

    #[test]
    fn missing_variable_is_unresolved() {
        let env = Environment::new();
        let err = ParameterResolver::new(&env)
            .resolve_str("${TEST_OUTPUT_PATH}/out.tif")
            .unwrap_err();
        match err {
            PipelineError::UnresolvedVariable { names } => assert_eq!(names, vec!["TEST_OUTPUT_PATH"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn inline_default_is_used_when_absent() {
        let env = Environment::new().with("HOST", "example.org");
        let resolver = ParameterResolver::new(&env);
        assert_eq!(resolver.resolve_str("${HOST:-localhost}:${PORT:-8080}").unwrap(), "example.org:8080");
    }

    #[test]
    fn resolves_nested_values_left_to_right() {
        let env = Environment::new().with("A", "1").with("B", "2");
        let value = json!({
            "list": ["${A}${B}", 3, {"inner": "${B}-${A}"}],
            "flag": true
        });
        let resolved = ParameterResolver::new(&env).resolve_value(&value).unwrap();
        assert_eq!(resolved, json!({"list": ["12", 3, {"inner": "2-1"}], "flag": true}));
    }

    #[test]
    fn alternative_tokens_pass_through() {
        let env = Environment::new();
        let resolver = ParameterResolver::new(&env);
        assert_eq!(resolver.resolve_str("$(geometry_for_clip)").unwrap(), "$(geometry_for_clip)");
    }

    #[test]
    fn substituted_values_are_not_rescanned() {
        let env = Environment::new().with("A", "${B}");
        assert_eq!(ParameterResolver::new(&env).resolve_str("${A}").unwrap(), "${B}");
    }

    #[test]
    fn all_missing_names_reported_once() {
        let env = Environment::new();
        let stages = vec![
            StageSpec::new("FeatureReader").with_param("connectionString", "${IN}/a.geojson"),
            StageSpec::new("FeatureWriter").with_param("connectionString", "${OUT}/${IN}.geojson"),
        ];
        let err = ParameterResolver::new(&env).resolve_stages(&stages).unwrap_err();
        match err {
            PipelineError::UnresolvedVariable { names } => assert_eq!(names, vec!["IN", "OUT"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn explicit_environment_wins_over_document_variables() {
        let mut document = PipelineDocument::default();
        document.variables.insert("LIMIT".into(), "10".into());
        document.variables.insert("NAME".into(), "doc".into());

        let explicit = Environment::new().with("NAME", "run");
        let env = Environment::for_document(&document, &explicit, false);
        assert_eq!(env.get("LIMIT"), Some("10"));
        assert_eq!(env.get("NAME"), Some("run"));
    }
}
