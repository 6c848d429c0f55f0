/// Stage capability contract
///
/// Every stage type is one of three closed variants, chosen when the graph is built:
/// - `Reader::produce() -> stream`
/// - `Filter::consume(streams) -> stream`
/// - `Writer::consume(stream) -> summary`
///
/// Stages are created by a factory from their resolved parameters. A stage instance
/// belongs to exactly one run; `produce`/`consume` may be called more than once per run
/// when several consumers need independent passes over the same producer.
use crate::pipeline::types::{Capability, StageParams};
use crate::runtime::payload::PayloadItem;
use crate::runtime::stream::RecordStream;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;

/// Fully materialized auxiliary values, keyed by parameter name
pub type AuxiliaryInputs = HashMap<String, Arc<[PayloadItem]>>;

/// Per-invocation context handed to a stage
#[derive(Debug, Clone, Default)]
pub struct StageContext {
    pub stage_id: String,
    pub auxiliary: AuxiliaryInputs,
}

impl StageContext {
    pub fn new(stage_id: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            auxiliary: HashMap::new(),
        }
    }

    /// Materialized items of an auxiliary parameter
    pub fn auxiliary(&self, param: &str) -> Option<Arc<[PayloadItem]>> {
        self.auxiliary.get(param).cloned()
    }
}

/// Outcome of a writer draining its input
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub items_written: u64,
    /// Location of the produced artifact, if any
    pub artifact: Option<String>,
}

pub trait Reader: Send {
    fn produce(&self, ctx: &StageContext) -> Result<RecordStream>;
}

pub trait Filter: Send {
    /// `inputs` holds one independent stream per upstream, in declaration order
    fn consume(&self, inputs: Vec<RecordStream>, ctx: &StageContext) -> Result<RecordStream>;
}

pub trait Writer: Send {
    fn consume(&self, input: RecordStream, ctx: &StageContext) -> Result<WriteSummary>;
}

/// A constructed stage, tagged by capability
pub enum StageImpl {
    Reader(Box<dyn Reader>),
    Filter(Box<dyn Filter>),
    Writer(Box<dyn Writer>),
}

impl StageImpl {
    pub fn capability(&self) -> Capability {
        match self {
            StageImpl::Reader(_) => Capability::Reader,
            StageImpl::Filter(_) => Capability::Filter,
            StageImpl::Writer(_) => Capability::Writer,
        }
    }
}

impl std::fmt::Debug for StageImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StageImpl::{:?}", self.capability())
    }
}

/// Constructor registered for a stage type
pub type StageFactory = Arc<dyn Fn(&StageParams) -> Result<StageImpl> + Send + Sync>;

/// Wrap a closure as a `StageFactory`
pub fn factory<F>(f: F) -> StageFactory
where
    F: Fn(&StageParams) -> Result<StageImpl> + Send + Sync + 'static,
{
    Arc::new(f)
}
