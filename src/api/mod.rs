/// HTTP API Layer
///
/// REST endpoints around the pipeline engine:
/// - pipeline runs, run history and cancellation
/// - stage previews (schema or data of one stage)
/// - the module catalogue

// Pipeline run endpoints (POST/GET) and stage previews
pub mod workflows;

// Module catalogue and service metadata
pub mod modules;

// Re-export router builders
pub use modules::create_module_routes;
pub use workflows::{create_workflow_routes, AppState};
