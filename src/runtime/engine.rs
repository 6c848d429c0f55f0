/// Pipeline execution engine
///
/// Transport-agnostic entry points used by the CLI and the REST layer:
/// parameter resolution → graph build → scheduler pass → finalized Run Report.
/// Structural errors are detected before any stage produces data.

use crate::config::EngineConfig;
use crate::error::{PipelineError, Result};
use crate::pipeline::params::{Environment, ParameterResolver};
use crate::pipeline::registry::ModuleRegistry;
use crate::pipeline::types::{ModuleDescriptor, PipelineDocument};
use crate::runtime::graph::{flatten_stages, BuildOptions, GraphBuilder, PipelineGraph};
use crate::runtime::payload::{Crs, PayloadItem, PayloadKind};
use crate::runtime::report::{RunOutcome, RunReport};
use crate::runtime::scheduler::Scheduler;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What `data_of_stage` returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataStageType {
    /// Shape of the output, from one inspected item
    #[serde(alias = "schema", alias = "Schema")]
    Schema,
    /// Whole output, materialized
    #[serde(alias = "data", alias = "Data")]
    Data,
}

/// One attribute of a stage output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    pub data_type: String,
}

/// Shape of the data at a given stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutputSchema {
    pub stage_id: String,
    /// `None` when the stage produced nothing
    pub kind: Option<PayloadKind>,
    pub crs: Option<Crs>,
    pub fields: Vec<FieldSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry_type: Option<String>,
    /// The inspected item
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<Value>,
}

/// Result of `data_of_stage`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StageData {
    Schema(StageOutputSchema),
    Data(Value),
}

/// Pipeline engine shared by every run of a process
///
/// The registry is read-only during execution, so one engine serves concurrent runs;
/// each run builds its own graph and Run Report.
#[derive(Debug, Clone)]
pub struct PipelineEngine {
    registry: Arc<ModuleRegistry>,
    config: EngineConfig,
}

impl PipelineEngine {
    pub fn new(registry: Arc<ModuleRegistry>, config: EngineConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Registry contents, sorted by type name
    pub fn list_modules(&self) -> Vec<ModuleDescriptor> {
        self.registry.list_modules()
    }

    /// Effective environment of a run of `document`
    pub fn environment(&self, document: &PipelineDocument, explicit: &Environment) -> Environment {
        Environment::for_document(document, explicit, self.config.inherit_process_env)
    }

    /// Resolve parameters and build the validated graph, without running anything
    pub fn prepare(&self, document: &PipelineDocument, env: &Environment, options: BuildOptions) -> Result<PipelineGraph> {
        let env = self.environment(document, env);
        let stages = ParameterResolver::new(&env).resolve_stages(&document.pipeline)?;
        GraphBuilder::new(&self.registry).with_options(options).build(&stages)
    }

    /// Run a document to completion or failure, synchronously
    pub fn run_pipeline(&self, document: &PipelineDocument, env: &Environment) -> RunReport {
        let mut report = RunReport::new();
        self.run_with_report(document, env, &mut report, &CancellationToken::new());
        report
    }

    /// Run a document against an existing PENDING report
    ///
    /// Every error ends in an ERROR report; nothing is swallowed.
    pub fn run_with_report(
        &self,
        document: &PipelineDocument,
        env: &Environment,
        report: &mut RunReport,
        cancel: &CancellationToken,
    ) {
        let workflow_start_time = std::time::Instant::now();
        tracing::info!("🚀 Starting pipeline run: {} ({} stages)", report.id(), document.pipeline.len());

        let (result, outcome) = self.execute(document, env, report, cancel);
        let finalized = match result {
            Ok(()) => report.complete(outcome),
            Err(e) => {
                tracing::error!("❌ Pipeline run {} failed: {}", report.id(), e);
                report.fail(&e, outcome)
            }
        };
        if let Err(e) = finalized {
            tracing::warn!("⚠️ Run report {} not updated: {}", report.id(), e);
        }

        tracing::info!(
            "🎉 Pipeline run {} finished with status {} in {:?}",
            report.id(),
            report.status(),
            workflow_start_time.elapsed()
        );
    }

    /// Build and drive one run, returning whatever was counted even on failure
    pub fn execute(
        &self,
        document: &PipelineDocument,
        env: &Environment,
        report: &mut RunReport,
        cancel: &CancellationToken,
    ) -> (Result<()>, RunOutcome) {
        if let Err(e) = report.start() {
            return (Err(e), RunOutcome::default());
        }

        tracing::debug!("📊 Resolving parameters and building the pipeline graph");
        let graph = match self.prepare(document, env, BuildOptions::default()) {
            Ok(graph) => graph,
            Err(e) => return (Err(e), RunOutcome::default()),
        };

        let scheduler = Scheduler::new(&graph, cancel.clone());
        match scheduler.run() {
            Ok(outputs) => (Ok(()), scheduler.outcome(outputs)),
            Err((e, outputs)) => (Err(e), scheduler.outcome(outputs)),
        }
    }

    /// Build only the sub-graph ending at `stage_id`
    ///
    /// Stages outside it are neither resolved nor instantiated, so an unset output
    /// variable or bad parameters downstream of the target do not affect a preview.
    pub fn prepare_preview(&self, document: &PipelineDocument, env: &Environment, stage_id: &str) -> Result<PipelineGraph> {
        let env = self.environment(document, env);
        let resolver = ParameterResolver::new(&env);
        let stages = flatten_stages(&document.pipeline)?;

        // References are located on a best-effort resolution; unresolvable stages keep
        // their raw values and only fail if they end up in the sub-graph
        let located: Vec<_> = stages
            .iter()
            .map(|stage| resolver.resolve_stage(stage).unwrap_or_else(|_| stage.clone()))
            .collect();
        let truncation = GraphBuilder::new(&self.registry).truncate(&located, stage_id)?;

        let kept = resolver.resolve_stages(&truncation.select(&stages))?;
        GraphBuilder::new(&self.registry)
            .with_options(BuildOptions { allow_terminal_values: true })
            .build(&kept)
    }

    /// Shape of the data produced at `stage_id`, inspecting exactly one item
    pub fn stage_output_schema(
        &self,
        document: &PipelineDocument,
        env: &Environment,
        stage_id: &str,
    ) -> Result<StageOutputSchema> {
        let graph = self.prepare_preview(document, env, stage_id)?;
        let scheduler = Scheduler::new(&graph, CancellationToken::new());

        let first = scheduler
            .preview(stage_id)?
            .next()
            .transpose()
            .map_err(|e| PipelineError::from_stage(stage_id, e))?;
        Ok(schema_of(stage_id, first.as_ref()))
    }

    /// Schema or materialized data of the output of `stage_id`
    ///
    /// Only the truncated sub-graph ending at the stage runs; writers downstream of it
    /// are never invoked. A writer target previews its input.
    pub fn data_of_stage(
        &self,
        document: &PipelineDocument,
        env: &Environment,
        stage_id: &str,
        data_type: DataStageType,
    ) -> Result<StageData> {
        tracing::info!("🔍 Previewing stage '{}' ({:?})", stage_id, data_type);
        match data_type {
            DataStageType::Schema => self.stage_output_schema(document, env, stage_id).map(StageData::Schema),
            DataStageType::Data => {
                let graph = self.prepare_preview(document, env, stage_id)?;
                let scheduler = Scheduler::new(&graph, CancellationToken::new());
                let items = scheduler
                    .preview(stage_id)?
                    .collect::<anyhow::Result<Vec<_>>>()
                    .map_err(|e| PipelineError::from_stage(stage_id, e))?;
                Ok(StageData::Data(collection_of(&items)))
            }
        }
    }
}

fn schema_of(stage_id: &str, item: Option<&PayloadItem>) -> StageOutputSchema {
    let Some(item) = item else {
        return StageOutputSchema {
            stage_id: stage_id.to_string(),
            kind: None,
            crs: None,
            fields: Vec::new(),
            geometry_type: None,
            sample: None,
        };
    };

    let fields = match item {
        PayloadItem::Raster(chunk) => chunk
            .bands
            .iter()
            .map(|b| FieldSchema {
                name: b.name.clone(),
                data_type: b.data_type.clone(),
            })
            .collect(),
        _ => item
            .attributes()
            .map(|attributes| {
                attributes
                    .iter()
                    .map(|(name, value)| FieldSchema {
                        name: name.clone(),
                        data_type: value_type(value).to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default(),
    };

    let sample = match item {
        PayloadItem::Vector(record) => Some(record.to_feature()),
        PayloadItem::Table(row) => Some(Value::Object(row.fields.clone())),
        PayloadItem::Raster(_) => None,
    };

    StageOutputSchema {
        stage_id: stage_id.to_string(),
        kind: Some(item.kind()),
        crs: item.crs().cloned(),
        fields,
        geometry_type: item
            .as_vector()
            .and_then(|r| r.geometry.get("type"))
            .and_then(Value::as_str)
            .map(String::from),
        sample,
    }
}

fn value_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "int",
        Value::Number(_) => "float",
        Value::String(_) => "str",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// GeoJSON-like collection of materialized items
fn collection_of(items: &[PayloadItem]) -> Value {
    match items.first() {
        None | Some(PayloadItem::Vector(_)) => {
            let mut collection = Map::new();
            collection.insert("type".into(), json!("FeatureCollection"));
            if let Some(crs) = items.first().and_then(PayloadItem::crs) {
                collection.insert("crs".into(), json!({"type": "name", "properties": {"name": crs}}));
            }
            let features: Vec<Value> = items
                .iter()
                .filter_map(PayloadItem::as_vector)
                .map(|r| r.to_feature())
                .collect();
            collection.insert("features".into(), Value::Array(features));
            Value::Object(collection)
        }
        Some(PayloadItem::Table(_)) => json!({
            "type": "Table",
            "rows": items.iter().filter_map(PayloadItem::attributes).collect::<Vec<_>>(),
        }),
        Some(PayloadItem::Raster(_)) => json!({
            "type": "RasterCollection",
            "chunks": items,
        }),
    }
}
