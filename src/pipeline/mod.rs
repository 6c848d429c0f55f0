/// Pipeline Document Layer
///
/// This module handles the declarative side of a pipeline run:
/// - Document types (PipelineDocument, StageSpec, module metadata)
/// - Relaxed JSON loading and parameter overrides
/// - `${NAME}` parameter resolution
/// - Lock-free stage type registry using ArcSwap
/// - SQLite persistence of Run Reports with sqlx

// Core document type definitions
pub mod types;

// Loading pipeline files
pub mod document;

// Parameter resolution
pub mod params;

// Stage type registry
pub mod registry;

// Run history persistence
pub mod storage;

// Re-export commonly used types
pub use params::{Environment, ParameterResolver};
pub use registry::ModuleRegistry;
pub use storage::{RunKind, RunStorage};
pub use types::{Capability, DataType, ModuleDescriptor, ParamDef, PipelineDocument, StageSpec};
