/// Pull-based execution scheduler
///
/// Walks the graph in topological order and lets every writer drain its upstream.
/// A writer pulls one item at a time from its upstream boundary, which pulls from its
/// own upstream and so on up to the readers. Only one stage runs at a time and no
/// stage runs ahead of what was pulled.
///
/// Opening a stage re-invokes it: each consumer of a stage gets an independent pass
/// over that stage's output. Auxiliary producers are drained to completion before
/// their consumer is opened.

use crate::error::{PipelineError, Result};
use crate::pipeline::types::Capability;
use crate::runtime::graph::{PipelineGraph, StageNode};
use crate::runtime::payload::PayloadItem;
use crate::runtime::report::{RunOutcome, WriterOutput};
use crate::runtime::stage::{StageContext, StageImpl};
use crate::runtime::stream::{concat, RecordStream, StageBoundary, StageCounters};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Drives one pass over a pipeline graph
///
/// A scheduler borrows a built graph and owns the cancellation token and item counters
/// of one run or preview. It is single-threaded: the engine puts it on a blocking
/// thread and reads the counters back once `run` returns, whatever the outcome.
pub struct Scheduler<'g> {
    graph: &'g PipelineGraph,
    cancel: CancellationToken,
    counters: StageCounters,
}

impl<'g> Scheduler<'g> {
    /// Scheduler with empty counters; `cancel` is checked before every pull
    pub fn new(graph: &'g PipelineGraph, cancel: CancellationToken) -> Self {
        Self {
            graph,
            cancel,
            counters: StageCounters::default(),
        }
    }

    /// Items emitted per non-writer stage, shared with every open boundary
    pub fn counters(&self) -> &StageCounters {
        &self.counters
    }

    /// Counts collected so far, writers included once they finished
    pub fn outcome(&self, outputs: Vec<WriterOutput>) -> RunOutcome {
        let mut stage_counts: BTreeMap<String, u64> = self.counters.snapshot().into_iter().collect();
        for output in &outputs {
            stage_counts.insert(output.stage_id.clone(), output.items_written);
        }
        RunOutcome { stage_counts, outputs }
    }

    /// Run every writer in topological order, halting on the first failure
    ///
    /// Outputs of writers that finished before the failure are returned with the error.
    pub fn run(&self) -> std::result::Result<Vec<WriterOutput>, (PipelineError, Vec<WriterOutput>)> {
        let mut outputs = Vec::new();

        for (step, node) in self.graph.writers().enumerate() {
            tracing::info!("📍 Step {}: draining writer '{}' ({})", step + 1, node.stage_id, node.type_name);
            let started = std::time::Instant::now();

            match self.drain_writer(node) {
                Ok(output) => {
                    tracing::info!(
                        "✅ Writer '{}' wrote {} item(s) in {:?}",
                        node.stage_id,
                        output.items_written,
                        started.elapsed()
                    );
                    outputs.push(output);
                }
                Err(e) => {
                    tracing::error!("❌ Writer '{}' halted the run: {}", node.stage_id, e);
                    return Err((e, outputs));
                }
            }
        }
        Ok(outputs)
    }

    /// Open the upstream of one writer and let it consume everything.
    ///
    /// Auxiliary inputs are materialized first, so a failure there means the writer
    /// never starts. Cancellation observed after the writer returned still fails it.
    fn drain_writer(&self, node: &StageNode) -> Result<WriterOutput> {
        self.check_cancelled()?;
        let StageImpl::Writer(writer) = &node.stage else {
            return Err(PipelineError::InvalidDocument(format!("stage '{}' is not a writer", node.stage_id)));
        };

        let ctx = self.context(node)?;
        let input = self.merged_inputs(node)?;
        let summary = writer
            .consume(input, &ctx)
            .map_err(|e| PipelineError::from_stage(&node.stage_id, e))?;
        // A writer may stop early on cancellation without surfacing it
        self.check_cancelled()?;

        Ok(WriterOutput {
            stage_id: node.stage_id.clone(),
            position: node.position,
            items_written: summary.items_written,
            artifact: summary.artifact,
        })
    }

    /// Output of a stage as a fresh, boundary-checked stream.
    ///
    /// For a writer this is its merged input: the writer itself is not invoked.
    pub fn preview(&self, stage_id: &str) -> Result<RecordStream> {
        let node = self
            .graph
            .node(stage_id)
            .ok_or_else(|| PipelineError::StageNotFound(stage_id.to_string()))?;
        match node.capability {
            Capability::Writer => self.merged_inputs(node),
            _ => self.open(node),
        }
    }

    /// Invoke a reader or filter and wrap its output in a stage boundary
    fn open(&self, node: &StageNode) -> Result<RecordStream> {
        self.check_cancelled()?;
        tracing::debug!("🔄 Opening stage '{}' ({})", node.stage_id, node.type_name);

        let ctx = self.context(node)?;
        let output = match &node.stage {
            StageImpl::Reader(reader) => reader.produce(&ctx),
            StageImpl::Filter(filter) => {
                let inputs = self.primary_inputs(node)?;
                filter.consume(inputs, &ctx)
            }
            StageImpl::Writer(_) => {
                return Err(PipelineError::InvalidDocument(format!(
                    "writer '{}' has no output stream",
                    node.stage_id
                )))
            }
        }
        .map_err(|e| PipelineError::from_stage(&node.stage_id, e))?;

        Ok(Box::new(StageBoundary::new(
            node.stage_id.clone(),
            output,
            self.cancel.clone(),
            self.counters.clone(),
        )))
    }

    /// One fresh stream per primary input, in declaration order
    fn primary_inputs(&self, node: &StageNode) -> Result<Vec<RecordStream>> {
        node.inputs.iter().map(|id| self.open(self.lookup(id)?)).collect()
    }

    /// Primary inputs chained in declaration order
    fn merged_inputs(&self, node: &StageNode) -> Result<RecordStream> {
        Ok(concat(self.primary_inputs(node)?))
    }

    /// Materialize the auxiliary inputs of a stage
    fn context(&self, node: &StageNode) -> Result<StageContext> {
        let mut ctx = StageContext::new(node.stage_id.clone());

        for (param, ids) in &node.auxiliary {
            let mut items: Vec<PayloadItem> = Vec::new();
            for id in ids {
                let producer = self.lookup(id)?;
                for item in self.open(producer)? {
                    items.push(item.map_err(|e| PipelineError::from_stage(id, e))?);
                }
            }
            tracing::debug!(
                "📦 Materialized {} auxiliary item(s) for '{}.{}'",
                items.len(),
                node.stage_id,
                param
            );
            ctx.auxiliary.insert(param.clone(), Arc::from(items));
        }
        Ok(ctx)
    }

    fn lookup(&self, stage_id: &str) -> Result<&'g StageNode> {
        self.graph
            .node(stage_id)
            .ok_or_else(|| PipelineError::StageNotFound(stage_id.to_string()))
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::pipeline::registry::ModuleRegistry;
    use crate::pipeline::types::{ModuleDescriptor, StageSpec};
    use crate::runtime::graph::GraphBuilder;
    use crate::runtime::stage::{factory, Filter, WriteSummary, Writer};
    use crate::runtime::stream::stream;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    /// Passes items through and cancels the run once `after` items went by
    struct CancelAfter {
        token: CancellationToken,
        after: usize,
    }

    impl Filter for CancelAfter {
        fn consume(&self, inputs: Vec<RecordStream>, _ctx: &StageContext) -> anyhow::Result<RecordStream> {
            let token = self.token.clone();
            let after = self.after;
            let mut seen = 0;
            Ok(stream(concat(inputs).inspect(move |item| {
                if item.is_ok() {
                    seen += 1;
                    if seen == after {
                        token.cancel();
                    }
                }
            })))
        }
    }

    /// Drains its input and logs when it was started
    struct Recorder {
        started: Arc<Mutex<Vec<String>>>,
    }

    impl Writer for Recorder {
        fn consume(&self, input: RecordStream, ctx: &StageContext) -> anyhow::Result<WriteSummary> {
            self.started.lock().push(ctx.stage_id.clone());
            let mut items_written = 0;
            for item in input {
                item?;
                items_written += 1;
            }
            Ok(WriteSummary {
                items_written,
                artifact: None,
            })
        }
    }

    fn registry(cancel: &CancellationToken, started: &Arc<Mutex<Vec<String>>>) -> ModuleRegistry {
        let registry = ModuleRegistry::with_builtin(EngineConfig::default());
        let token = cancel.clone();
        registry.register(
            "test",
            ModuleDescriptor::new("CancelAfter", Capability::Filter, "Test", "Cancels the run after some items."),
            factory(move |params| {
                let after = params.values().get("after").and_then(|v| v.as_u64()).unwrap_or(1) as usize;
                Ok(StageImpl::Filter(Box::new(CancelAfter {
                    token: token.clone(),
                    after,
                })))
            }),
        );
        let started = Arc::clone(started);
        registry.register(
            "test",
            ModuleDescriptor::new("Recorder", Capability::Writer, "Test", "Counts what it drains."),
            factory(move |_| {
                Ok(StageImpl::Writer(Box::new(Recorder {
                    started: Arc::clone(&started),
                })))
            }),
        );
        registry
    }

    fn points(count: usize) -> StageSpec {
        let geometries: Vec<_> = (0..count)
            .map(|i| json!({"type": "Point", "coordinates": [i as f64, 0.0]}))
            .collect();
        StageSpec::new("InputParam").with_id("src").with_param("data", json!(geometries))
    }

    #[test]
    fn readers_are_pulled_only_up_to_the_failing_item() {
        let cancel = CancellationToken::new();
        let started = Arc::new(Mutex::new(Vec::new()));
        let registry = registry(&cancel, &started);
        let stages = vec![
            points(10),
            StageSpec::new("FeatureLimit").with_id("limit").with_param("countLimit", 2),
            StageSpec::new("Recorder").with_id("sink"),
        ];
        let graph = GraphBuilder::new(&registry).build(&stages).unwrap();
        let scheduler = Scheduler::new(&graph, cancel);

        let (err, outputs) = scheduler.run().unwrap_err();

        assert_eq!(err.stage_id(), Some("limit"));
        assert!(outputs.is_empty());
        assert_eq!(scheduler.counters().get("src"), 3);
        assert_eq!(scheduler.counters().get("limit"), 2);
    }

    #[test]
    fn cancellation_in_the_middle_of_a_stream_stops_the_run() {
        let cancel = CancellationToken::new();
        let started = Arc::new(Mutex::new(Vec::new()));
        let registry = registry(&cancel, &started);
        let stages = vec![
            points(10),
            StageSpec::new("CancelAfter").with_id("valve").with_param("after", 3),
            StageSpec::new("Recorder").with_id("sink"),
        ];
        let graph = GraphBuilder::new(&registry).build(&stages).unwrap();
        let scheduler = Scheduler::new(&graph, cancel);

        let (err, _) = scheduler.run().unwrap_err();

        assert!(matches!(err, PipelineError::Cancelled), "{}", err);
        assert_eq!(scheduler.counters().get("src"), 3);
        assert_eq!(scheduler.counters().get("valve"), 3);
        assert_eq!(*started.lock(), vec!["sink".to_string()]);
    }

    #[test]
    fn writers_after_a_failed_writer_are_never_started() {
        let cancel = CancellationToken::new();
        let started = Arc::new(Mutex::new(Vec::new()));
        let registry = registry(&cancel, &started);
        let stages = vec![
            points(3),
            StageSpec::new("Recorder").with_id("first").with_param("inputStageId", "src"),
            StageSpec::new("FeatureLimit").with_id("limit").with_param("inputStageId", "src").with_param("countLimit", 1),
            StageSpec::new("Recorder").with_id("second"),
            StageSpec::new("Recorder").with_id("third").with_param("inputStageId", "src"),
        ];
        let graph = GraphBuilder::new(&registry).build(&stages).unwrap();
        let scheduler = Scheduler::new(&graph, cancel);

        let (err, outputs) = scheduler.run().unwrap_err();

        assert_eq!(err.stage_id(), Some("limit"));
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].stage_id, "first");
        assert_eq!(outputs[0].items_written, 3);
        assert_eq!(*started.lock(), vec!["first".to_string(), "second".to_string()]);

        let outcome = scheduler.outcome(outputs);
        assert_eq!(outcome.stage_counts.get("first"), Some(&3));
        assert_eq!(outcome.stage_counts.get("third"), None);
    }

    #[test]
    fn preview_of_a_writer_streams_its_input_without_invoking_it() {
        let cancel = CancellationToken::new();
        let started = Arc::new(Mutex::new(Vec::new()));
        let registry = registry(&cancel, &started);
        let graph = GraphBuilder::new(&registry)
            .build(&[points(2), StageSpec::new("Recorder").with_id("sink")])
            .unwrap();
        let scheduler = Scheduler::new(&graph, cancel);

        let items: Vec<_> = scheduler.preview("sink").unwrap().collect::<anyhow::Result<_>>().unwrap();

        assert_eq!(items.len(), 2);
        assert!(started.lock().is_empty());
        assert!(matches!(scheduler.preview("ghost"), Err(PipelineError::StageNotFound(_))));
    }
}
