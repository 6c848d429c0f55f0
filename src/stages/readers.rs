/// Built-in readers: GeoJSON feature stores and inline parameter features
use crate::pipeline::registry::ModuleRegistry;
use crate::pipeline::types::{Capability, DataType, ModuleDescriptor, ParamDef, StageParams};
use crate::runtime::payload::{Crs, PayloadItem, VectorRecord};
use crate::runtime::stage::{factory, Reader, StageContext, StageImpl};
use crate::runtime::stream::{from_items, stream, RecordStream};
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Register `FeatureReader` and `InputParam` under `backend`
pub(crate) fn register(registry: &ModuleRegistry, backend: &str) {
    registry.register(
        backend,
        ModuleDescriptor::new(
            "FeatureReader",
            Capability::Reader,
            "Input",
            "Reads Features from a GeoJSON FeatureCollection, a GeoJSONL file or inline GeoJSON.",
        )
        .param(ParamDef::new(
            "connectionString",
            DataType::Str,
            "Path of the Feature Store ('.geojson', '.json', '.geojsonl', '.ndjson') or inline GeoJSON.",
        ))
        .param(ParamDef::new("crs", DataType::Crs, "CRS of the features when the source does not declare one (Optional)."))
        .param(ParamDef::new("countLimit", DataType::Int, "Maximum number of Features to fetch (Optional).")),
        factory(|params| Ok(StageImpl::Reader(Box::new(FeatureReader::from_params(params)?)))),
    );

    registry.register(
        backend,
        ModuleDescriptor::new(
            "InputParam",
            Capability::Reader,
            "Graph",
            "Acts as Feature provider of a Module's parameter.",
        )
        .param(ParamDef::new("data", DataType::GeoJson, "Features to provide (FeatureCollection, Feature or Geometry)."))
        .param(ParamDef::new("crs", DataType::Crs, "CRS of the features (Optional).").with_default("EPSG:4326")),
        factory(|params| Ok(StageImpl::Reader(Box::new(InputParam::from_params(params)?)))),
    );
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeatureReaderConfig {
    connection_string: Value,
    #[serde(default)]
    crs: Option<String>,
    #[serde(default)]
    count_limit: Option<usize>,
}

/// Where a `FeatureReader` takes its features from
#[derive(Debug, Clone)]
enum FeatureSource {
    Collection(PathBuf),
    Lines(PathBuf),
    Inline(Value),
}

/// Reads vector features
///
/// `.geojsonl` / `.ndjson` files are parsed lazily, one line per pull. A `.geojson`
/// document is parsed whole when the stream opens, since a FeatureCollection is a
/// single JSON value; its features are then turned into records one per pull. Large
/// stores should use the line-delimited form.
#[derive(Debug)]
pub struct FeatureReader {
    source: FeatureSource,
    crs: Option<Crs>,
    count_limit: Option<usize>,
}

impl FeatureReader {
    fn from_params(params: &StageParams) -> Result<Self> {
        let config: FeatureReaderConfig = params.parse()?;

        let source = match config.connection_string {
            Value::String(text) if text.trim_start().starts_with('{') => {
                FeatureSource::Inline(serde_json::from_str(&text).context("connectionString is not valid GeoJSON")?)
            }
            Value::String(text) => {
                let path = PathBuf::from(text);
                match extension(&path).as_str() {
                    "geojson" | "json" => FeatureSource::Collection(path),
                    "geojsonl" | "ndjson" => FeatureSource::Lines(path),
                    other => anyhow::bail!("unsupported feature store extension '.{}'", other),
                }
            }
            value @ (Value::Object(_) | Value::Array(_)) => FeatureSource::Inline(value),
            other => anyhow::bail!("connectionString must be a path or GeoJSON, found {}", other),
        };

        Ok(Self {
            source,
            crs: config.crs.as_deref().map(Crs::parse),
            count_limit: config.count_limit,
        })
    }

    /// Apply `countLimit`; zero means no limit
    fn limit(&self, records: RecordStream) -> RecordStream {
        match self.count_limit {
            Some(limit) if limit > 0 => stream(records.take(limit)),
            _ => records,
        }
    }
}

impl Reader for FeatureReader {
    fn produce(&self, ctx: &StageContext) -> Result<RecordStream> {
        let records = match &self.source {
            FeatureSource::Inline(value) => {
                let crs = self.crs.clone().or_else(|| declared_crs(value)).unwrap_or_else(Crs::wgs84);
                from_items(features_of(value, &crs)?.into_iter().map(PayloadItem::Vector))
            }
            FeatureSource::Collection(path) => {
                let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
                let mut value: Value = serde_json::from_reader(BufReader::new(file))
                    .with_context(|| format!("Invalid GeoJSON in {}", path.display()))?;
                let crs = self.crs.clone().or_else(|| declared_crs(&value)).unwrap_or_else(Crs::wgs84);
                match take_features(&mut value) {
                    Some(features) => stream(
                        features
                            .into_iter()
                            .map(move |feature| -> Result<PayloadItem> {
                                Ok(PayloadItem::Vector(VectorRecord::from_feature(&feature, &crs)?))
                            }),
                    ),
                    None => from_items(features_of(&value, &crs)?.into_iter().map(PayloadItem::Vector)),
                }
            }
            FeatureSource::Lines(path) => {
                let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
                let crs = self.crs.clone().unwrap_or_else(Crs::wgs84);
                let name = path.display().to_string();
                stream(
                    BufReader::new(file)
                        .lines()
                        .enumerate()
                        .filter(|(_, line)| line.as_ref().map(|l| !l.trim().is_empty()).unwrap_or(true))
                        .map(move |(number, line)| -> Result<PayloadItem> {
                            let line = line.with_context(|| format!("Failed to read {}", name))?;
                            let feature: Value = serde_json::from_str(&line)
                                .with_context(|| format!("{}:{}: invalid GeoJSON feature", name, number + 1))?;
                            Ok(PayloadItem::Vector(VectorRecord::from_feature(&feature, &crs)?))
                        }),
                )
            }
        };

        tracing::debug!("📖 Reader '{}' opened {:?}", ctx.stage_id, self.source);
        Ok(self.limit(records))
    }
}

#[derive(Debug, Deserialize)]
struct InputParamConfig {
    data: Value,
    #[serde(default)]
    crs: Option<String>,
}

/// Named constant features, identical on every pass
///
/// Usually referenced by another stage's Input parameter, e.g. the `otherGeometries`
/// of a `SpatialRelation`. The `data` value is parsed when the stage is built, so
/// malformed GeoJSON fails the run before any item flows.
#[derive(Debug)]
pub struct InputParam {
    records: Vec<VectorRecord>,
}

impl InputParam {
    fn from_params(params: &StageParams) -> Result<Self> {
        let config: InputParamConfig = params.parse()?;
        let crs = config
            .crs
            .as_deref()
            .map(Crs::parse)
            .or_else(|| declared_crs(&config.data))
            .unwrap_or_else(Crs::wgs84);
        Ok(Self {
            records: features_of(&config.data, &crs)?,
        })
    }
}

impl Reader for InputParam {
    fn produce(&self, _ctx: &StageContext) -> Result<RecordStream> {
        Ok(from_items(self.records.clone().into_iter().map(PayloadItem::Vector)))
    }
}

fn extension(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

/// Moves the features array out of a FeatureCollection
fn take_features(value: &mut Value) -> Option<Vec<Value>> {
    if value.get("type").and_then(Value::as_str) != Some("FeatureCollection") {
        return None;
    }
    match value.get_mut("features").map(Value::take) {
        Some(Value::Array(features)) => Some(features),
        _ => None,
    }
}

/// CRS named by a legacy GeoJSON `crs` member
pub(crate) fn declared_crs(value: &Value) -> Option<Crs> {
    value
        .get("crs")
        .and_then(|crs| crs.get("properties"))
        .and_then(|props| props.get("name"))
        .and_then(Value::as_str)
        .map(Crs::parse)
}

/// Features of a GeoJSON value: FeatureCollection, Feature, bare Geometry or an array of those
pub(crate) fn features_of(value: &Value, crs: &Crs) -> Result<Vec<VectorRecord>> {
    match value {
        Value::Array(items) => {
            let mut records = Vec::new();
            for item in items {
                records.extend(features_of(item, crs)?);
            }
            Ok(records)
        }
        Value::Object(object) => match object.get("type").and_then(Value::as_str) {
            Some("FeatureCollection") => {
                let features = object
                    .get("features")
                    .and_then(Value::as_array)
                    .ok_or_else(|| anyhow::anyhow!("FeatureCollection without a features array"))?;
                features.iter().map(|f| VectorRecord::from_feature(f, crs)).collect()
            }
            Some("Feature") => Ok(vec![VectorRecord::from_feature(value, crs)?]),
            Some(_) if object.contains_key("coordinates") || object.contains_key("geometries") => {
                Ok(vec![VectorRecord::new(value.clone(), serde_json::Map::new(), crs.clone())])
            }
            _ => anyhow::bail!("value is not GeoJSON"),
        },
        _ => anyhow::bail!("value is not GeoJSON"),
    }
}
