/// Error taxonomy of the pipeline engine
///
/// Document and structural errors are raised before any data is touched. Failures
/// raised while a stage produces or consumes items are wrapped into `StageExecution`
/// at the stage boundary so the Run Report can name the failing stage.
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The document references a stage type that no backend registered
    #[error("UnknownStageType: stage '{stage_id}' uses unregistered type '{type_name}'")]
    UnknownStageType { stage_id: String, type_name: String },

    /// One or more `${NAME}` tokens have no value and no inline default
    #[error("UnresolvedVariable: no value for {}", names.join(", "))]
    UnresolvedVariable { names: Vec<String> },

    #[error("CyclicPipelineError: cycle detected {cycle}")]
    CyclicPipeline { cycle: String },

    /// A non-writer stage whose output nobody consumes
    #[error("DanglingOutputError: stage '{stage_id}' ({capability}) has no downstream consumer and is not a writer")]
    DanglingOutput { stage_id: String, capability: String },

    #[error("StageExecutionError: stage '{stage_id}' failed: {source}")]
    StageExecution {
        stage_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("InvalidDocument: {0}")]
    InvalidDocument(String),

    #[error("InvalidDocument: stage id '{0}' is declared more than once")]
    DuplicateStageId(String),

    #[error("InvalidDocument: stage '{stage_id}' references unknown stage '{reference}' in '{param}'")]
    UnknownStageReference {
        stage_id: String,
        param: String,
        reference: String,
    },

    /// The stage factory rejected the resolved parameters
    #[error("InvalidParams: stage '{stage_id}' ({type_name}): {source}")]
    InvalidParams {
        stage_id: String,
        type_name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("StageNotFound: stage '{0}' not found in current pipeline")]
    StageNotFound(String),

    #[error("Cancelled: run was cancelled before completion")]
    Cancelled,

    /// The worker thread driving a run stopped without finalizing it
    #[error("WorkerFailed: run worker stopped: {0}")]
    WorkerFailed(String),

    #[error("run report '{id}' is already finalized")]
    ReportFinalized { id: String },
}

impl PipelineError {
    /// Stage id the error is attributed to, when there is one
    pub fn stage_id(&self) -> Option<&str> {
        match self {
            Self::UnknownStageType { stage_id, .. }
            | Self::DanglingOutput { stage_id, .. }
            | Self::StageExecution { stage_id, .. }
            | Self::UnknownStageReference { stage_id, .. }
            | Self::InvalidParams { stage_id, .. } => Some(stage_id),
            Self::DuplicateStageId(stage_id) | Self::StageNotFound(stage_id) => Some(stage_id),
            _ => None,
        }
    }

    /// Whether the error was detected before any data flowed
    pub fn is_structural(&self) -> bool {
        !matches!(
            self,
            Self::StageExecution { .. } | Self::Cancelled | Self::WorkerFailed(_) | Self::ReportFinalized { .. }
        )
    }

    /// Recover a typed error from a stream item failure.
    ///
    /// Errors already carrying a pipeline error keep it (the first failing stage wins);
    /// anything else is attributed to `stage_id`.
    pub fn from_stage(stage_id: &str, error: anyhow::Error) -> Self {
        match error.downcast::<PipelineError>() {
            Ok(typed) => typed,
            Err(other) => Self::StageExecution {
                stage_id: stage_id.to_string(),
                source: other,
            },
        }
    }
}
