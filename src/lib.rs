/// geoflow: declarative pipeline engine for geospatial data
///
/// A pipeline document lists stages (readers, filters, writers). The engine resolves
/// `${NAME}` parameters, builds a petgraph DAG of the stages and pulls records through
/// it, reporting the outcome in a Run Report.

// Core configuration and setup
pub mod config;

// Error taxonomy shared by every layer
pub mod error;

// Pipeline documents, parameter resolution, module registry and run storage
pub mod pipeline;

// Runtime execution engine - graph building, streaming and scheduling
pub mod runtime;

// Built-in stage types (`core` backend)
pub mod stages;

// HTTP API layer - REST endpoints for runs, previews and the module catalogue
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use config::{Config, EngineConfig};
pub use error::PipelineError;
pub use pipeline::{Environment, ModuleRegistry, PipelineDocument, StageSpec};
pub use runtime::{DataStageType, PipelineEngine, RunReport, RunStatus};
pub use server::start_server;
