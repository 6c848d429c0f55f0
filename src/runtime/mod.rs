/// Runtime Execution Engine
///
/// This module turns a resolved pipeline document into a lazily evaluated data flow.
/// It handles:
/// - Payload items and single-pass record streams
/// - The closed set of stage capabilities (reader, filter, writer)
/// - Converting stage lists to petgraph DAGs
/// - Pull-based, single-threaded execution and the Run Report

// Payload items flowing between stages
pub mod payload;

// Record streams and the stage boundary wrapper
pub mod stream;

// Stage capability contract and factories
pub mod stage;

// Graph builder using petgraph
pub mod graph;

// Pull-based execution scheduler
pub mod scheduler;

// Run lifecycle record
pub mod report;

// Transport-agnostic engine entry points
pub mod engine;

// Re-export main types
pub use engine::{DataStageType, PipelineEngine, StageData, StageOutputSchema};
pub use graph::{flatten_stages, BuildOptions, GraphBuilder, PipelineGraph, Truncation};
pub use payload::{Crs, PayloadItem, PayloadKind, VectorRecord};
pub use report::{RunReport, RunStatus};
pub use stage::{Filter, Reader, StageContext, StageImpl, Writer};
pub use stream::RecordStream;
