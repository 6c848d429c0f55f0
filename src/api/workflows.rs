/// Pipeline run REST API endpoints
///
/// Runs are executed on a blocking thread inside their own task and persisted when
/// submitted, when started and when finalized. A running pipeline can be cancelled
/// from another request through its run id.

use crate::{
    error::PipelineError,
    pipeline::{
        params::Environment,
        storage::{RunKind, RunRecord, RunStorage},
        types::PipelineDocument,
    },
    runtime::{
        engine::{DataStageType, PipelineEngine, StageData},
        report::{RunOutcome, RunReport},
    },
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    /// Engine shared by every run
    pub engine: Arc<PipelineEngine>,
    /// Run history
    pub storage: RunStorage,
    /// Cancellation handles of runs in flight, by run id
    pub active_runs: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

/// Request body of a pipeline run or preview
#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub user_id: String,
    /// Pipeline document, as a JSON object or as (relaxed) JSON text
    pub input: Value,
    /// Run environment, `${NAME}` values
    #[serde(default)]
    pub input_args: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ObjectQuery {
    #[serde(rename = "stageId")]
    pub stage_id: String,
    #[serde(rename = "dataType", default = "default_data_type")]
    pub data_type: DataStageType,
}

fn default_data_type() -> DataStageType {
    DataStageType::Schema
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl std::fmt::Display) -> ApiError {
    (status, Json(json!({ "error": message.to_string() })))
}

/// Create pipeline run routes
pub fn create_workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows", post(run_workflow).get(list_workflows))
        .route("/api/workflows/{id}", get(get_workflow))
        .route("/api/workflows/{id}/cancel", post(cancel_workflow))
        .route("/api/objects", post(data_of_stage))
}

fn parse_document(input: &Value) -> anyhow::Result<PipelineDocument> {
    match input {
        Value::String(text) => PipelineDocument::from_json_str(text),
        other => Ok(serde_json::from_value(other.clone())?),
    }
}

/// Environment of one run: request args plus `WORKFLOW_ID` and `OUTPUT_FOLDER`
fn run_environment(engine: &PipelineEngine, run_id: &str, args: BTreeMap<String, String>) -> Environment {
    let mut env: Environment = args.into_iter().collect();
    let output_folder = std::path::Path::new(&engine.config().output_folder).join(run_id);
    env.set("WORKFLOW_ID", run_id);
    env.set("OUTPUT_FOLDER", output_folder.display().to_string());
    env
}

async fn save(storage: &RunStorage, user_id: &str, kind: RunKind, report: &RunReport) -> Result<(), ApiError> {
    storage.save_run(user_id, kind, report).await.map_err(|e| {
        tracing::error!("❌ Failed to save run {}: {}", report.id(), e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e)
    })
}

/// Run a pipeline document to completion
///
/// POST /api/workflows
/// Body: { "user_id": "...", "input": { "pipeline": [...] }, "input_args": { "NAME": "value" } }
/// Returns the finalized Run Report; a failed run is still a 200 with status ERROR.
async fn run_workflow(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> Result<Json<RunReport>, ApiError> {
    let document = parse_document(&request.input).map_err(|e| {
        tracing::warn!("❌ Rejected pipeline document from {}: {:#}", request.user_id, e);
        api_error(StatusCode::BAD_REQUEST, format!("{:#}", e))
    })?;

    let (run_id, task) = submit_run(&state, request.user_id, document, request.input_args).await?;
    match task.await {
        Ok(result) => result.map(Json),
        Err(e) => {
            tracing::error!("❌ Run {} task aborted: {}", run_id, e);
            state.active_runs.write().await.remove(&run_id);
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e))
        }
    }
}

/// Store a PENDING run, register its cancellation handle and start it.
///
/// The run lives in its own task: dropping the returned handle (a client that
/// disconnects) still takes the stored run to a terminal status and clears its
/// `active_runs` entry.
async fn submit_run(
    state: &AppState,
    user_id: String,
    document: PipelineDocument,
    args: BTreeMap<String, String>,
) -> Result<(String, JoinHandle<Result<RunReport, ApiError>>), ApiError> {
    let report = RunReport::new();
    let run_id = report.id().to_string();
    let env = run_environment(&state.engine, &run_id, args);
    save(&state.storage, &user_id, RunKind::Workflow, &report).await?;

    let cancel = CancellationToken::new();
    state.active_runs.write().await.insert(run_id.clone(), cancel.clone());
    tracing::info!("📥 Run {} submitted by {}", run_id, user_id);

    let task = tokio::spawn(drive_run(state.clone(), user_id, document, env, report, cancel));
    Ok((run_id, task))
}

async fn drive_run(
    state: AppState,
    user_id: String,
    document: PipelineDocument,
    env: Environment,
    mut report: RunReport,
    cancel: CancellationToken,
) -> Result<RunReport, ApiError> {
    let run_id = report.id().to_string();
    if let Err(e) = report.start() {
        state.active_runs.write().await.remove(&run_id);
        return Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e));
    }
    if let Err(e) = save(&state.storage, &user_id, RunKind::Workflow, &report).await {
        state.active_runs.write().await.remove(&run_id);
        return Err(e);
    }

    let engine = Arc::clone(&state.engine);
    let mut fallback = report.clone();
    let joined = tokio::task::spawn_blocking(move || {
        engine.run_with_report(&document, &env, &mut report, &cancel);
        report
    })
    .await;
    state.active_runs.write().await.remove(&run_id);

    let report = match joined {
        Ok(report) => report,
        Err(e) => {
            tracing::error!("❌ Run {} worker panicked: {}", run_id, e);
            let error = PipelineError::WorkerFailed(e.to_string());
            if let Err(e) = fallback.fail(&error, RunOutcome::default()) {
                tracing::warn!("⚠️ Run report {} not updated: {}", run_id, e);
            }
            fallback
        }
    };
    save(&state.storage, &user_id, RunKind::Workflow, &report).await?;
    tracing::debug!("💾 Run {} stored as {}", run_id, report.status());

    Ok(report)
}

/// List stored runs
///
/// GET /api/workflows?user_id=...
async fn list_workflows(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    match state.storage.list_runs(query.user_id.as_deref()).await {
        Ok(runs) => Ok(Json(json!({ "runs": runs }))),
        Err(e) => {
            tracing::error!("Failed to list runs: {}", e);
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e))
        }
    }
}

/// Get a stored run by id
///
/// GET /api/workflows/{id}
async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RunRecord>, ApiError> {
    match state.storage.get_run(&id).await {
        Ok(Some(record)) => Ok(Json(record)),
        Ok(None) => Err(api_error(StatusCode::NOT_FOUND, format!("run '{}' not found", id))),
        Err(e) => {
            tracing::error!("Failed to get run {}: {}", id, e);
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e))
        }
    }
}

/// Cancel a run in flight
///
/// POST /api/workflows/{id}/cancel
/// 404 for unknown runs, 409 for runs that already terminated.
async fn cancel_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if let Some(token) = state.active_runs.read().await.get(&id) {
        token.cancel();
        tracing::info!("🛑 Cancellation requested for run {}", id);
        return Ok(Json(json!({ "id": id, "message": "Cancellation requested" })));
    }

    match state.storage.get_run(&id).await {
        Ok(Some(_)) => Err(api_error(StatusCode::CONFLICT, format!("run '{}' is not running", id))),
        Ok(None) => Err(api_error(StatusCode::NOT_FOUND, format!("run '{}' not found", id))),
        Err(e) => Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e)),
    }
}

/// 404 for an unknown target, 400 for a document that cannot be built, 422 when data
/// flowed and a stage failed
fn preview_status(error: &PipelineError) -> StatusCode {
    match error {
        PipelineError::StageNotFound(_) => StatusCode::NOT_FOUND,
        e if e.is_structural() => StatusCode::BAD_REQUEST,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

/// Schema or data of the output of one stage
///
/// POST /api/objects?stageId=...&dataType=SCHEMA|DATA
/// Body: same as POST /api/workflows. Writers downstream of the stage are not run.
async fn data_of_stage(
    State(state): State<AppState>,
    Query(query): Query<ObjectQuery>,
    Json(request): Json<RunRequest>,
) -> Result<Json<StageData>, ApiError> {
    let document = parse_document(&request.input).map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("{:#}", e)))?;

    let mut report = RunReport::new();
    let env = run_environment(&state.engine, report.id(), request.input_args);
    let engine = Arc::clone(&state.engine);
    let stage_id = query.stage_id.clone();

    let result = tokio::task::spawn_blocking(move || engine.data_of_stage(&document, &env, &stage_id, query.data_type))
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;

    // Previews are recorded like runs, without writer outputs
    let finalized = report.start().and_then(|_| match &result {
        Ok(_) => report.complete(RunOutcome::default()),
        Err(e) => report.fail(e, RunOutcome::default()),
    });
    if let Err(e) = finalized {
        tracing::warn!("⚠️ Preview report {} not updated: {}", report.id(), e);
    }
    save(&state.storage, &request.user_id, RunKind::Schema, &report).await?;

    result.map(Json).map_err(|e| {
        tracing::warn!("❌ Preview of '{}' failed: {}", query.stage_id, e);
        api_error(preview_status(&e), e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::pipeline::registry::ModuleRegistry;
    use crate::runtime::report::RunStatus;
    use std::time::Duration;

    async fn state() -> AppState {
        let config = EngineConfig::default();
        AppState {
            engine: Arc::new(PipelineEngine::new(Arc::new(ModuleRegistry::with_builtin(config.clone())), config)),
            storage: RunStorage::connect("sqlite::memory:").await.unwrap(),
            active_runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn wait_for_terminal(storage: &RunStorage, id: &str) -> RunReport {
        for _ in 0..200 {
            let record = storage.get_run(id).await.unwrap().unwrap();
            if record.report.is_terminal() {
                return record.report;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {} never terminated", id);
    }

    #[tokio::test]
    async fn run_finishes_and_is_stored_after_the_caller_goes_away() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.geojsonl");
        let output = dir.path().join("out.geojson");
        std::fs::write(&input, "{\"type\":\"Feature\",\"properties\":{},\"geometry\":{\"type\":\"Point\",\"coordinates\":[1,2]}}\n").unwrap();
        let document: PipelineDocument = serde_json::from_value(json!({
            "pipeline": [
                {"type": "FeatureReader", "connectionString": input.display().to_string()},
                {"type": "FeatureWriter", "connectionString": output.display().to_string()}
            ]
        }))
        .unwrap();
        let state = state().await;

        let (run_id, task) = submit_run(&state, "alice".into(), document, BTreeMap::new()).await.unwrap();
        drop(task);

        let report = wait_for_terminal(&state.storage, &run_id).await;
        assert_eq!(report.status(), RunStatus::Ok, "{:?}", report.message());
        assert_eq!(report.stage_counts().get("stage-2"), Some(&1));
        assert!(output.exists());
        assert!(state.active_runs.read().await.is_empty());
    }

    #[tokio::test]
    async fn failed_runs_release_their_cancellation_handle() {
        let document: PipelineDocument = serde_json::from_value(json!({
            "pipeline": [{"type": "NoSuchStage"}]
        }))
        .unwrap();
        let state = state().await;

        let (run_id, task) = submit_run(&state, "bob".into(), document, BTreeMap::new()).await.unwrap();
        let report = task.await.unwrap().unwrap();

        assert_eq!(report.status(), RunStatus::Error);
        let stored = state.storage.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(stored.report.status(), RunStatus::Error);
        assert!(state.active_runs.read().await.is_empty());
    }

    #[test]
    fn preview_errors_map_to_statuses() {
        assert_eq!(preview_status(&PipelineError::StageNotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            preview_status(&PipelineError::UnresolvedVariable { names: vec!["IN".into()] }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(preview_status(&PipelineError::Cancelled), StatusCode::UNPROCESSABLE_ENTITY);
        let failed = PipelineError::StageExecution {
            stage_id: "x".into(),
            source: anyhow::anyhow!("boom"),
        };
        assert_eq!(preview_status(&failed), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
