/// Module catalogue endpoints
use crate::api::workflows::AppState;
use axum::{extract::State, response::Json, routing::get, Router};
use serde_json::{json, Value};

pub fn create_module_routes() -> Router<AppState> {
    Router::new()
        .route("/api/metadata", get(metadata))
        .route("/api/modules", get(list_modules))
}

/// Service description
///
/// GET /api/metadata
async fn metadata(State(state): State<AppState>) -> Json<Value> {
    let config = state.engine.config();
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "description": env!("CARGO_PKG_DESCRIPTION"),
        "modules": state.engine.registry().len(),
        "backend_precedence": config.backend_precedence,
        "inherit_process_env": config.inherit_process_env,
    }))
}

/// Registered stage types, sorted by name
///
/// GET /api/modules
async fn list_modules(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "modules": state.engine.list_modules() }))
}
