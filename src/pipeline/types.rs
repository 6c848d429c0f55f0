/// Core pipeline document type definitions
///
/// Defines the declarative pipeline document (an ordered list of stage specifications),
/// the module metadata reported by the registry, and the parameter bag handed to stage
/// factories. These types are serialized/deserialized from JSON.
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Name of the generic parameter any stage may use to pick its primary upstream
pub const INPUT_STAGE_PARAM: &str = "inputStageId";

/// Generic parameter forwarding a stage's output to the named stage(s)
pub const OUTPUT_STAGE_PARAM: &str = "outputStageId";

/// Key of a child stage list nested inside a stage entry
pub const NESTED_PIPELINE_PARAM: &str = "pipeline";

/// A complete pipeline document
///
/// `{ "pipeline": [ { "type": ..., "stageId": ..., ...params }, ... ] }`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineDocument {
    /// Ordered stage specifications
    pub pipeline: Vec<StageSpec>,
    /// Pipeline-scoped variables available to `${NAME}` tokens
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,
}

/// One entry of the pipeline document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Registered module type name (case-insensitive)
    #[serde(rename = "type")]
    pub type_name: String,
    /// Explicit stage id, defaults to a position-derived id
    #[serde(rename = "stageId", default, skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<String>,
    /// Stage-specific parameters (every other key of the entry)
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl StageSpec {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            stage_id: None,
            params: Map::new(),
        }
    }

    pub fn with_id(mut self, stage_id: impl Into<String>) -> Self {
        self.stage_id = Some(stage_id.into());
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }
}

/// Closed set of stage capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Produces a stream, has no upstream
    Reader,
    /// Consumes one or more streams and produces a stream
    Filter,
    /// Consumes a stream, produces nothing downstream
    Writer,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Reader => "reader",
            Capability::Filter => "filter",
            Capability::Writer => "writer",
        };
        f.write_str(name)
    }
}

/// Declared data type of a module parameter
///
/// `Stages` and `Input` are stage references and are wired by the graph builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    #[serde(rename = "str")]
    Str,
    #[serde(rename = "int")]
    Int,
    #[serde(rename = "float")]
    Float,
    #[serde(rename = "bool")]
    Bool,
    #[serde(rename = "crs")]
    Crs,
    #[serde(rename = "geojson")]
    GeoJson,
    #[serde(rename = "object")]
    Object,
    /// Primary data sources (fan-in)
    #[serde(rename = "array<stage>")]
    Stages,
    /// Auxiliary, fully materialized input
    #[serde(rename = "input")]
    Input,
}

/// Declaration of one module parameter, as reported by `listModules`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamDef {
    pub name: String,
    pub data_type: DataType,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<Value>>,
}

impl ParamDef {
    pub fn new(name: &str, data_type: DataType, description: &str) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            description: description.to_string(),
            default: None,
            options: None,
        }
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn with_options<I, V>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.options = Some(options.into_iter().map(Into::into).collect());
        self
    }
}

/// Registry metadata of a stage type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub name: String,
    pub capability: Capability,
    pub category: String,
    pub description: String,
    pub params: Vec<ParamDef>,
}

impl ModuleDescriptor {
    pub fn new(name: &str, capability: Capability, category: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            capability,
            category: category.to_string(),
            description: description.to_string(),
            params: Vec::new(),
        }
    }

    pub fn param(mut self, param: ParamDef) -> Self {
        self.params.push(param);
        self
    }

    /// Parameters that reference other stages, with their kind
    pub fn reference_params(&self) -> impl Iterator<Item = &ParamDef> {
        self.params
            .iter()
            .filter(|p| matches!(p.data_type, DataType::Stages | DataType::Input))
    }
}

/// Resolved parameters of one stage, handed to its factory
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageParams {
    stage_id: String,
    values: Map<String, Value>,
}

impl StageParams {
    pub fn new(stage_id: impl Into<String>, values: Map<String, Value>) -> Self {
        Self {
            stage_id: stage_id.into(),
            values,
        }
    }

    pub fn stage_id(&self) -> &str {
        &self.stage_id
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.values.get(name).and_then(Value::as_str)
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Deserialize the parameter bag into a typed stage configuration
    pub fn parse<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_value(Value::Object(self.values.clone()))
            .map_err(|e| anyhow::anyhow!("invalid parameters: {}", e))
    }
}

/// Split a stage reference value into stage ids.
///
/// Accepts `"a"`, `"a,b"` or `["a", "b"]`. Returns `None` for values that cannot
/// be stage references (numbers, objects, mixed arrays).
pub fn reference_ids(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::String(s) => Some(
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
        ),
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_str().map(|s| s.trim().to_string()))
            .collect(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stage_spec_flattens_params() {
        let spec: StageSpec = serde_json::from_value(json!({
            "type": "FeatureReader",
            "stageId": "s1",
            "connectionString": "a.geojson"
        }))
        .unwrap();

        assert_eq!(spec.type_name, "FeatureReader");
        assert_eq!(spec.stage_id.as_deref(), Some("s1"));
        assert_eq!(spec.params.get("connectionString"), Some(&json!("a.geojson")));
        assert!(!spec.params.contains_key("type"));
    }

    #[test]
    fn data_types_use_wire_names() {
        let def = ParamDef::new("stages", DataType::Stages, "inputs");
        let value = serde_json::to_value(&def).unwrap();
        assert_eq!(value["dataType"], json!("array<stage>"));
    }

    #[test]
    fn reference_ids_accepts_lists_and_csv() {
        assert_eq!(reference_ids(&json!("a, b")), Some(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(reference_ids(&json!(["s1", "s2"])), Some(vec!["s1".to_string(), "s2".to_string()]));
        assert_eq!(reference_ids(&json!({"type": "Point"})), None);
        assert_eq!(reference_ids(&json!([1, 2])), None);
    }
}
