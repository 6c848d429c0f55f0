/// Pipeline document loading
///
/// Pipeline files are JSON with a few relaxations: line comments (`//`, `#`, `;`),
/// `/* ... */` comment blocks at the start of a line, and trailing commas.
use crate::pipeline::types::PipelineDocument;
use anyhow::{Context, Result};
use regex::Regex;
use serde_json::Value;
use std::path::Path;
use std::sync::LazyLock;

static TRAILING_COMMA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",(\s*[\]}])").expect("valid trailing comma regex"));

const COMMENT_PREFIXES: [&str; 3] = ["#", ";", "//"];

/// Strip comments and trailing commas, returning standard JSON text
pub fn strip_json_comments(text: &str) -> String {
    let mut standard = String::with_capacity(text.len());
    let mut in_block = false;

    for line in text.lines() {
        let trimmed = line.trim();

        if trimmed.is_empty() || COMMENT_PREFIXES.iter().any(|p| trimmed.starts_with(p)) {
            continue;
        }
        if trimmed.starts_with("/*") {
            in_block = true;
        }
        if in_block {
            if trimmed.ends_with("*/") {
                in_block = false;
            }
            continue;
        }

        standard.push_str(line);
        standard.push('\n');
    }

    TRAILING_COMMA_RE.replace_all(&standard, "$1").into_owned()
}

impl PipelineDocument {
    /// Parse a pipeline document from (relaxed) JSON text
    pub fn from_json_str(text: &str) -> Result<Self> {
        let standard = strip_json_comments(text);
        serde_json::from_str(&standard).context("Failed to parse pipeline document")
    }

    /// Load a pipeline file, exposing its location as pipeline variables
    ///
    /// Adds `PIPELINE_FOLDER`, `PIPELINE_FILE` and `PIPELINE_PATH` unless the
    /// document already defines them.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;
        let mut document = Self::from_json_str(&text)
            .with_context(|| format!("Invalid pipeline file: {}", path.display()))?;

        let absolute = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let folder = absolute.parent().map(|p| p.display().to_string()).unwrap_or_default();
        let file = absolute
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();

        for (name, value) in [
            ("PIPELINE_FOLDER", folder),
            ("PIPELINE_FILE", file),
            ("PIPELINE_PATH", absolute.display().to_string()),
        ] {
            document.variables.entry(name.to_string()).or_insert(value);
        }

        Ok(document)
    }

    /// Override one stage parameter, e.g. from `--set limit.countLimit=10`
    ///
    /// The value is parsed as JSON when possible so numbers and booleans keep their type.
    pub fn apply_override(&mut self, stage_id: &str, param: &str, raw_value: &str) -> Result<()> {
        let stage = self
            .pipeline
            .iter_mut()
            .find(|s| s.stage_id.as_deref() == Some(stage_id))
            .ok_or_else(|| anyhow::anyhow!("Stage '{}' not found for override '{}'", stage_id, param))?;

        let value = serde_json::from_str(raw_value).unwrap_or_else(|_| Value::String(raw_value.to_string()));
        tracing::debug!("🔧 Overriding {}.{} = {}", stage_id, param, value);
        stage.params.insert(param.to_string(), value);
        Ok(())
    }

    /// Apply an override written as `stageId.param=value`
    pub fn apply_override_expr(&mut self, expr: &str) -> Result<()> {
        let (key, value) = expr
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Override '{}' must look like stageId.param=value", expr))?;
        let (stage_id, param) = key
            .split_once('.')
            .ok_or_else(|| anyhow::anyhow!("Override '{}' must look like stageId.param=value", expr))?;
        self.apply_override(stage_id.trim(), param.trim(), value.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const COMMENTED: &str = r#"
// Reads and writes features
{
  # variables shared by stages
  "variables": { "ROOT": "/data", },
  "pipeline": [
    /* the source
       of features */
    { "type": "FeatureReader", "stageId": "src", "connectionString": "${ROOT}/a.geojson" },
    ; legacy comment style
    { "type": "FeatureWriter", "connectionString": "b.geojson", },
  ],
}
"#;

    #[test]
    fn parses_relaxed_json() {
        let document = PipelineDocument::from_json_str(COMMENTED).unwrap();
        assert_eq!(document.pipeline.len(), 2);
        assert_eq!(document.pipeline[0].stage_id.as_deref(), Some("src"));
        assert_eq!(document.variables.get("ROOT").map(String::as_str), Some("/data"));
    }

    #[test]
    fn applies_typed_overrides() {
        let mut document = PipelineDocument::from_json_str(COMMENTED).unwrap();
        document.apply_override_expr("src.limit=10").unwrap();
        document.apply_override_expr("src.name=roads").unwrap();
        assert_eq!(document.pipeline[0].params["limit"], json!(10));
        assert_eq!(document.pipeline[0].params["name"], json!("roads"));
        assert!(document.apply_override_expr("missing.limit=1").is_err());
        assert!(document.apply_override_expr("nodot=1").is_err());
    }

    #[test]
    fn file_location_becomes_variables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");
        std::fs::write(&path, r#"{ "pipeline": [ { "type": "FeatureReader" } ] }"#).unwrap();

        let document = PipelineDocument::from_file(&path).unwrap();
        assert_eq!(document.variables.get("PIPELINE_FILE").map(String::as_str), Some("job.json"));
        assert!(document.variables.contains_key("PIPELINE_FOLDER"));
        assert!(PipelineDocument::from_file(&dir.path().join("none.json")).is_err());
    }
}
