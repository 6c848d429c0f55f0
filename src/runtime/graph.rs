/// Petgraph-based pipeline graph builder
///
/// Converts the ordered stage list of a resolved pipeline document into a directed
/// acyclic graph of stage nodes. Edges point from producer to consumer:
/// - stage *i* consumes from stage *i-1* unless it names its primary upstream(s)
///   explicitly (`array<stage>` parameters or the generic `inputStageId`), or another
///   stage forwards its output to it with `outputStageId`
/// - `input` parameters naming stages add auxiliary edges; those producers are
///   drained completely before the consumer starts
/// - readers never receive a default edge
/// - a nested `pipeline` array is spliced in right after its parent stage, so its first
///   child consumes from the parent and the parent's next sibling from the last child
///
/// All structural validation happens here, before any stage produces data.

use crate::error::{PipelineError, Result};
use crate::pipeline::registry::{ModuleRegistry, RegisteredModule};
use crate::pipeline::types::{
    reference_ids, Capability, DataType, ModuleDescriptor, StageParams, StageSpec, INPUT_STAGE_PARAM,
    NESTED_PIPELINE_PARAM, OUTPUT_STAGE_PARAM,
};
use crate::runtime::stage::StageImpl;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};

/// Kind of a producer → consumer edge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeKind {
    /// Streamed item by item
    Primary,
    /// Materialized in full and handed over under `param`
    Auxiliary { param: String },
}

/// A stage of one run
#[derive(Debug)]
pub struct StageNode {
    pub stage_id: String,
    /// Registered type name (canonical casing)
    pub type_name: String,
    /// Backend providing the implementation
    pub backend: String,
    /// Index in the pipeline document
    pub position: usize,
    pub capability: Capability,
    pub params: StageParams,
    /// Primary upstream ids, in declaration order
    pub inputs: Vec<String>,
    /// Auxiliary upstream ids per parameter
    pub auxiliary: Vec<(String, Vec<String>)>,
    pub(crate) stage: StageImpl,
}

/// Options relaxing graph validation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildOptions {
    /// Accept non-writer sinks (API-style single value results and previews)
    pub allow_terminal_values: bool,
}

/// Built, validated pipeline graph
#[derive(Debug)]
pub struct PipelineGraph {
    graph: DiGraph<StageNode, EdgeKind>,
    node_id_to_index: HashMap<String, NodeIndex>,
    order: Vec<NodeIndex>,
}

/// Stage entry after id assignment and type lookup
struct Planned<'a> {
    spec: &'a StageSpec,
    stage_id: String,
    module: RegisteredModule,
    inputs: Vec<String>,
    auxiliary: Vec<(String, Vec<String>)>,
}

/// Builds `PipelineGraph`s against a module registry
#[derive(Debug, Clone, Copy)]
pub struct GraphBuilder<'r> {
    registry: &'r ModuleRegistry,
    options: BuildOptions,
}

impl<'r> GraphBuilder<'r> {
    pub fn new(registry: &'r ModuleRegistry) -> Self {
        Self {
            registry,
            options: BuildOptions::default(),
        }
    }

    pub fn with_options(mut self, options: BuildOptions) -> Self {
        self.options = options;
        self
    }

    /// Build the graph of already resolved stages
    pub fn build(&self, stages: &[StageSpec]) -> Result<PipelineGraph> {
        let stages = flatten_stages(stages)?;
        if stages.is_empty() {
            return Err(PipelineError::InvalidDocument("pipeline has no stages".to_string()));
        }
        tracing::debug!("🏗️ Building pipeline graph with {} stages", stages.len());

        let stage_ids = assign_stage_ids(&stages)?;
        let mut planned = self.lookup_types(&stages, stage_ids.clone())?;

        if planned[0].module.descriptor.capability != Capability::Reader {
            return Err(PipelineError::InvalidDocument(format!(
                "first stage '{}' must be a reader, found {} '{}'",
                planned[0].stage_id, planned[0].module.descriptor.capability, planned[0].spec.type_name
            )));
        }

        let wiring = Wiring::collect(&stage_ids, &stages, true)?;
        wire_references(&mut planned, &wiring)?;
        check_writer_consumers(&planned)?;

        let edges = collect_edges(&planned);
        detect_cycles(&planned, &edges)?;
        if !self.options.allow_terminal_values {
            check_dangling(&planned, &edges)?;
        }

        let mut graph = DiGraph::new();
        let mut node_id_to_index = HashMap::new();

        for (position, plan) in planned.into_iter().enumerate() {
            let node = instantiate(plan, position)?;
            tracing::debug!("  ➕ Added stage: '{}' ({} {})", node.stage_id, node.capability, node.type_name);
            let stage_id = node.stage_id.clone();
            let index = graph.add_node(node);
            node_id_to_index.insert(stage_id, index);
        }

        for (from, to, kind) in edges {
            tracing::debug!("  🔗 Added edge: #{} → #{} ({:?})", from, to, kind);
            graph.add_edge(NodeIndex::new(from), NodeIndex::new(to), kind);
        }

        let order = topological_order(&graph);
        tracing::debug!("✅ Pipeline graph built, execution order: {:?}",
            order.iter().map(|&i| graph[i].stage_id.as_str()).collect::<Vec<_>>());

        Ok(PipelineGraph {
            graph,
            node_id_to_index,
            order,
        })
    }

    /// Resolve every type before anything else is validated, failing closed
    fn lookup_types<'s>(&self, stages: &'s [StageSpec], stage_ids: Vec<String>) -> Result<Vec<Planned<'s>>> {
        stages
            .iter()
            .zip(stage_ids)
            .map(|(spec, stage_id)| match self.registry.resolve(&spec.type_name) {
                Some(module) => Ok(Planned {
                    spec,
                    stage_id,
                    module,
                    inputs: Vec::new(),
                    auxiliary: Vec::new(),
                }),
                None => Err(PipelineError::UnknownStageType {
                    stage_id,
                    type_name: spec.type_name.clone(),
                }),
            })
            .collect()
    }

    /// Sub-pipeline ending at `target`: the target and every stage it transitively
    /// consumes from.
    ///
    /// Only kept stages have their type looked up, so stages outside the sub-pipeline may
    /// hold anything. `stages` must already be flattened (see `flatten_stages`).
    pub fn truncate(&self, stages: &[StageSpec], target: &str) -> Result<Truncation> {
        let stage_ids = assign_stage_ids(stages)?;
        let position: HashMap<&str, usize> = stage_ids.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
        let &start = position
            .get(target)
            .ok_or_else(|| PipelineError::StageNotFound(target.to_string()))?;
        let wiring = Wiring::collect(&stage_ids, stages, false)?;

        let mut kept: HashMap<usize, KeptStage> = HashMap::new();
        let mut pending = vec![start];
        while let Some(i) = pending.pop() {
            if kept.contains_key(&i) {
                continue;
            }
            let spec = &stages[i];
            let module = self.registry.resolve(&spec.type_name).ok_or_else(|| PipelineError::UnknownStageType {
                stage_id: stage_ids[i].clone(),
                type_name: spec.type_name.clone(),
            })?;
            let previous = i.checked_sub(1).map(|p| stage_ids[p].as_str());
            let references = wiring.references(spec, &stage_ids[i], &module.descriptor, previous)?;

            let upstream: Vec<String> = references
                .inputs
                .iter()
                .chain(references.auxiliary.iter().flat_map(|(_, ids)| ids.iter()))
                .cloned()
                .collect();
            pending.extend(upstream.iter().filter_map(|id| position.get(id.as_str()).copied()));

            let default_input = if references.defaulted {
                references.inputs.first().cloned()
            } else {
                None
            };
            kept.insert(
                i,
                KeptStage {
                    position: i,
                    stage_id: stage_ids[i].clone(),
                    default_input,
                    upstream,
                },
            );
        }

        let truncation = Truncation::ordered(kept.into_values().collect());
        tracing::debug!("✂️ Truncated pipeline at '{}': {:?}", target, truncation.stage_ids());
        Ok(truncation)
    }
}

/// Stages kept by `GraphBuilder::truncate`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Truncation {
    kept: Vec<KeptStage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct KeptStage {
    position: usize,
    stage_id: String,
    /// Previous stage in the full document, when that was the stage's upstream
    default_input: Option<String>,
    upstream: Vec<String>,
}

impl Truncation {
    /// Producers first, document order among independent stages
    fn ordered(mut kept: Vec<KeptStage>) -> Self {
        kept.sort_by_key(|k| k.position);
        let ids: HashSet<String> = kept.iter().map(|k| k.stage_id.clone()).collect();

        let mut placed: HashSet<String> = HashSet::new();
        let mut order: Vec<KeptStage> = Vec::with_capacity(kept.len());
        while order.len() < kept.len() {
            let next = kept.iter().find(|k| {
                !placed.contains(&k.stage_id)
                    && k.upstream.iter().all(|id| placed.contains(id) || !ids.contains(id))
            });
            match next {
                Some(stage) => {
                    placed.insert(stage.stage_id.clone());
                    order.push(stage.clone());
                }
                // Cyclic: keep document order and let the build report the cycle
                None => return Self { kept },
            }
        }
        Self { kept: order }
    }

    /// Kept stage ids, producers first
    pub fn stage_ids(&self) -> Vec<String> {
        self.kept.iter().map(|k| k.stage_id.clone()).collect()
    }

    /// The kept entries of `stages` (the list `truncate` was given, or a resolved copy of it)
    ///
    /// Ids and default upstream are pinned so the sub-pipeline wires as it did inside
    /// the full document; `outputStageId` values lose the stages that were dropped.
    pub fn select(&self, stages: &[StageSpec]) -> Vec<StageSpec> {
        let ids: HashSet<&str> = self.kept.iter().map(|k| k.stage_id.as_str()).collect();

        self.kept
            .iter()
            .filter_map(|k| {
                let mut spec = stages.get(k.position)?.clone();
                spec.stage_id = Some(k.stage_id.clone());
                if let Some(input) = &k.default_input {
                    spec.params.insert(INPUT_STAGE_PARAM.to_string(), Value::String(input.clone()));
                }
                if let Some(targets) = spec.params.get(OUTPUT_STAGE_PARAM).and_then(reference_ids) {
                    let targets: Vec<Value> = targets
                        .into_iter()
                        .filter(|t| ids.contains(t.as_str()))
                        .map(Value::String)
                        .collect();
                    if targets.is_empty() {
                        spec.params.remove(OUTPUT_STAGE_PARAM);
                    } else {
                        spec.params.insert(OUTPUT_STAGE_PARAM.to_string(), Value::Array(targets));
                    }
                }
                Some(spec)
            })
            .collect()
    }
}

/// Splice nested `pipeline` arrays in after their parent stage, depth first
pub fn flatten_stages(stages: &[StageSpec]) -> Result<Vec<StageSpec>> {
    let mut flat = Vec::with_capacity(stages.len());
    flatten_into(stages, &mut flat)?;
    Ok(flat)
}

fn flatten_into(stages: &[StageSpec], flat: &mut Vec<StageSpec>) -> Result<()> {
    for spec in stages {
        let mut spec = spec.clone();
        let children = spec.params.remove(NESTED_PIPELINE_PARAM);
        let parent = spec.stage_id.clone().unwrap_or_else(|| spec.type_name.clone());
        flat.push(spec);

        if let Some(children) = children {
            let children: Vec<StageSpec> = serde_json::from_value(children).map_err(|e| {
                PipelineError::InvalidDocument(format!("nested pipeline of '{}' is not a stage list: {}", parent, e))
            })?;
            flatten_into(&children, flat)?;
        }
    }
    Ok(())
}

/// Explicit ids are kept; the others get `stage-<n>` (1-based position), skipping taken ids
fn assign_stage_ids(stages: &[StageSpec]) -> Result<Vec<String>> {
    let mut taken = HashSet::new();
    for id in stages.iter().filter_map(|s| s.stage_id.as_deref()) {
        if !taken.insert(id.to_string()) {
            return Err(PipelineError::DuplicateStageId(id.to_string()));
        }
    }

    let mut ids = Vec::with_capacity(stages.len());
    for (i, spec) in stages.iter().enumerate() {
        match &spec.stage_id {
            Some(id) => ids.push(id.clone()),
            None => {
                let mut candidate = format!("stage-{}", i + 1);
                while taken.contains(&candidate) {
                    candidate.push('_');
                }
                taken.insert(candidate.clone());
                ids.push(candidate);
            }
        }
    }
    Ok(ids)
}

/// Reference lookup shared by full builds and truncation
struct Wiring {
    known: HashSet<String>,
    /// Upstream added to a stage by other stages' `outputStageId`, in document order
    forwarded: HashMap<String, Vec<String>>,
}

/// Upstream of one stage
struct StageReferences {
    inputs: Vec<String>,
    auxiliary: Vec<(String, Vec<String>)>,
    /// The only input is the default edge to the previous stage
    defaulted: bool,
}

impl Wiring {
    /// `strict` rejects malformed or unknown `outputStageId` values; otherwise they are skipped
    fn collect(stage_ids: &[String], stages: &[StageSpec], strict: bool) -> Result<Self> {
        let known: HashSet<String> = stage_ids.iter().cloned().collect();
        let mut forwarded: HashMap<String, Vec<String>> = HashMap::new();

        for (stage_id, spec) in stage_ids.iter().zip(stages) {
            let Some(value) = spec.params.get(OUTPUT_STAGE_PARAM) else {
                continue;
            };
            let Some(targets) = reference_ids(value) else {
                if strict {
                    return Err(PipelineError::InvalidDocument(format!(
                        "stage '{}' parameter '{}' must name stages, found {}",
                        stage_id, OUTPUT_STAGE_PARAM, value
                    )));
                }
                continue;
            };
            for target in targets {
                if !known.contains(&target) {
                    if strict {
                        return Err(PipelineError::UnknownStageReference {
                            stage_id: stage_id.clone(),
                            param: OUTPUT_STAGE_PARAM.to_string(),
                            reference: target,
                        });
                    }
                    continue;
                }
                let upstream = forwarded.entry(target).or_default();
                if !upstream.contains(stage_id) {
                    upstream.push(stage_id.clone());
                }
            }
        }
        Ok(Self { known, forwarded })
    }

    /// Primary and auxiliary upstream of one stage; `previous` is its default upstream
    fn references(
        &self,
        spec: &StageSpec,
        stage_id: &str,
        descriptor: &ModuleDescriptor,
        previous: Option<&str>,
    ) -> Result<StageReferences> {
        let mut inputs: Vec<String> = Vec::new();
        let mut auxiliary = Vec::new();

        for def in descriptor.reference_params() {
            let Some(value) = spec.params.get(&def.name) else {
                continue;
            };
            match def.data_type {
                DataType::Input => {
                    if let Some(ids) = self.auxiliary_ids(stage_id, &def.name, value)? {
                        auxiliary.push((def.name.clone(), ids));
                    }
                }
                _ => self.push_primary(stage_id, &def.name, value, &mut inputs)?,
            }
        }
        if let Some(value) = spec.params.get(INPUT_STAGE_PARAM) {
            self.push_primary(stage_id, INPUT_STAGE_PARAM, value, &mut inputs)?;
        }
        for id in self.forwarded.get(stage_id).into_iter().flatten() {
            if !inputs.contains(id) {
                inputs.push(id.clone());
            }
        }

        let mut defaulted = false;
        match descriptor.capability {
            Capability::Reader if !inputs.is_empty() => {
                return Err(PipelineError::InvalidDocument(format!(
                    "reader '{}' cannot consume from other stages",
                    stage_id
                )));
            }
            Capability::Reader => {}
            _ if inputs.is_empty() => {
                if let Some(previous) = previous {
                    inputs.push(previous.to_string());
                    defaulted = true;
                }
            }
            _ => {}
        }

        Ok(StageReferences {
            inputs,
            auxiliary,
            defaulted,
        })
    }

    fn push_primary(&self, stage_id: &str, param: &str, value: &Value, inputs: &mut Vec<String>) -> Result<()> {
        let ids = reference_ids(value).ok_or_else(|| {
            PipelineError::InvalidDocument(format!(
                "stage '{}' parameter '{}' must name stages, found {}",
                stage_id, param, value
            ))
        })?;
        for id in ids {
            if !self.known.contains(&id) {
                return Err(PipelineError::UnknownStageReference {
                    stage_id: stage_id.to_string(),
                    param: param.to_string(),
                    reference: id,
                });
            }
            if !inputs.contains(&id) {
                inputs.push(id);
            }
        }
        Ok(())
    }

    /// Stage ids of an auxiliary value, `None` when the value is a literal
    fn auxiliary_ids(&self, stage_id: &str, param: &str, value: &Value) -> Result<Option<Vec<String>>> {
        let Some(ids) = reference_ids(value) else {
            return Ok(None);
        };
        // Values naming no stage at all are literals for the stage to interpret
        if ids.is_empty() || !ids.iter().any(|id| self.known.contains(id)) {
            return Ok(None);
        }
        if let Some(missing) = ids.iter().find(|id| !self.known.contains(*id)) {
            return Err(PipelineError::UnknownStageReference {
                stage_id: stage_id.to_string(),
                param: param.to_string(),
                reference: missing.clone(),
            });
        }
        Ok(Some(ids))
    }
}

fn wire_references(planned: &mut [Planned<'_>], wiring: &Wiring) -> Result<()> {
    for i in 0..planned.len() {
        let previous = i.checked_sub(1).map(|p| planned[p].stage_id.clone());
        let references = wiring.references(
            planned[i].spec,
            &planned[i].stage_id,
            &planned[i].module.descriptor,
            previous.as_deref(),
        )?;
        planned[i].inputs = references.inputs;
        planned[i].auxiliary = references.auxiliary;
    }
    Ok(())
}

fn check_writer_consumers(planned: &[Planned<'_>]) -> Result<()> {
    let writers: HashSet<&str> = planned
        .iter()
        .filter(|p| p.module.descriptor.capability == Capability::Writer)
        .map(|p| p.stage_id.as_str())
        .collect();

    for plan in planned {
        let upstream = plan
            .inputs
            .iter()
            .chain(plan.auxiliary.iter().flat_map(|(_, ids)| ids.iter()));
        for id in upstream {
            if writers.contains(id.as_str()) {
                return Err(PipelineError::InvalidDocument(format!(
                    "stage '{}' consumes from writer '{}', writers produce no output",
                    plan.stage_id, id
                )));
            }
        }
    }
    Ok(())
}

/// `(producer position, consumer position, kind)` in document order
fn collect_edges(planned: &[Planned<'_>]) -> Vec<(usize, usize, EdgeKind)> {
    let position: HashMap<&str, usize> = planned
        .iter()
        .enumerate()
        .map(|(i, p)| (p.stage_id.as_str(), i))
        .collect();

    let mut edges = Vec::new();
    for (to, plan) in planned.iter().enumerate() {
        for id in &plan.inputs {
            edges.push((position[id.as_str()], to, EdgeKind::Primary));
        }
        for (param, ids) in &plan.auxiliary {
            for id in ids {
                edges.push((position[id.as_str()], to, EdgeKind::Auxiliary { param: param.clone() }));
            }
        }
    }
    edges
}

/// Depth-first traversal with a recursion-stack marker
fn detect_cycles(planned: &[Planned<'_>], edges: &[(usize, usize, EdgeKind)]) -> Result<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        OnStack,
        Done,
    }

    fn visit(
        node: usize,
        successors: &[Vec<usize>],
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        marks[node] = Mark::OnStack;
        stack.push(node);

        for &next in &successors[node] {
            match marks[next] {
                Mark::OnStack => {
                    let start = stack.iter().position(|&n| n == next).unwrap_or(0);
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = visit(next, successors, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }

        stack.pop();
        marks[node] = Mark::Done;
        None
    }

    let mut successors = vec![Vec::new(); planned.len()];
    for (from, to, _) in edges {
        successors[*from].push(*to);
    }

    let mut marks = vec![Mark::Unvisited; planned.len()];
    let mut stack = Vec::new();
    for start in 0..planned.len() {
        if marks[start] != Mark::Unvisited {
            continue;
        }
        if let Some(cycle) = visit(start, &successors, &mut marks, &mut stack) {
            let path: Vec<&str> = cycle.iter().map(|&i| planned[i].stage_id.as_str()).collect();
            tracing::error!("❌ Pipeline contains a cycle: {}", path.join(" -> "));
            return Err(PipelineError::CyclicPipeline { cycle: path.join(" -> ") });
        }
    }
    Ok(())
}

fn check_dangling(planned: &[Planned<'_>], edges: &[(usize, usize, EdgeKind)]) -> Result<()> {
    let consumed: HashSet<usize> = edges.iter().map(|(from, _, _)| *from).collect();
    for (i, plan) in planned.iter().enumerate() {
        let capability = plan.module.descriptor.capability;
        if capability != Capability::Writer && !consumed.contains(&i) {
            return Err(PipelineError::DanglingOutput {
                stage_id: plan.stage_id.clone(),
                capability: capability.to_string(),
            });
        }
    }
    Ok(())
}

fn instantiate(plan: Planned<'_>, position: usize) -> Result<StageNode> {
    let descriptor = &plan.module.descriptor;
    let params = StageParams::new(plan.stage_id.clone(), plan.spec.params.clone());

    let stage = (plan.module.factory)(&params).map_err(|source| PipelineError::InvalidParams {
        stage_id: plan.stage_id.clone(),
        type_name: descriptor.name.clone(),
        source,
    })?;
    if stage.capability() != descriptor.capability {
        return Err(PipelineError::InvalidParams {
            stage_id: plan.stage_id.clone(),
            type_name: descriptor.name.clone(),
            source: anyhow::anyhow!(
                "factory built a {} but the type is registered as a {}",
                stage.capability(),
                descriptor.capability
            ),
        });
    }

    Ok(StageNode {
        stage_id: plan.stage_id,
        type_name: descriptor.name.clone(),
        backend: plan.module.backend.clone(),
        position,
        capability: descriptor.capability,
        params,
        inputs: plan.inputs,
        auxiliary: plan.auxiliary,
        stage,
    })
}

/// Kahn's algorithm; ready stages are taken in document order
fn topological_order(graph: &DiGraph<StageNode, EdgeKind>) -> Vec<NodeIndex> {
    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|n| distinct_neighbors(graph, n, Direction::Incoming).len())
        .collect();

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|&(_, &d)| d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(Reverse(i)) = ready.pop() {
        let node = NodeIndex::new(i);
        order.push(node);
        for next in distinct_neighbors(graph, node, Direction::Outgoing) {
            let degree = &mut in_degree[next.index()];
            *degree -= 1;
            if *degree == 0 {
                ready.push(Reverse(next.index()));
            }
        }
    }
    order
}

fn distinct_neighbors(graph: &DiGraph<StageNode, EdgeKind>, node: NodeIndex, dir: Direction) -> BTreeSet<NodeIndex> {
    graph.neighbors_directed(node, dir).collect()
}

impl PipelineGraph {
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn node(&self, stage_id: &str) -> Option<&StageNode> {
        self.node_id_to_index.get(stage_id).map(|&i| &self.graph[i])
    }

    /// Stage ids in document order
    pub fn stage_ids(&self) -> Vec<String> {
        self.graph.node_indices().map(|i| self.graph[i].stage_id.clone()).collect()
    }

    /// Stage ids in execution order
    pub fn topological_order(&self) -> Vec<String> {
        self.order.iter().map(|&i| self.graph[i].stage_id.clone()).collect()
    }

    /// Nodes in execution order
    pub fn nodes_in_order(&self) -> impl Iterator<Item = &StageNode> {
        self.order.iter().map(|&i| &self.graph[i])
    }

    pub fn capability_of(&self, stage_id: &str) -> Option<Capability> {
        self.node(stage_id).map(|n| n.capability)
    }

    /// Primary upstream ids of a stage, in declaration order
    pub fn upstream_ids(&self, stage_id: &str) -> Option<Vec<String>> {
        self.node(stage_id).map(|n| n.inputs.clone())
    }

    /// Auxiliary upstream ids of a stage, across all of its `input` parameters
    pub fn auxiliary_ids(&self, stage_id: &str) -> Option<Vec<String>> {
        self.node(stage_id)
            .map(|n| n.auxiliary.iter().flat_map(|(_, ids)| ids.iter().cloned()).collect())
    }

    /// Consumers of a stage (primary or auxiliary), in document order
    pub fn downstream_ids(&self, stage_id: &str) -> Option<Vec<String>> {
        let &index = self.node_id_to_index.get(stage_id)?;
        let consumers = distinct_neighbors(&self.graph, index, Direction::Outgoing);
        Some(consumers.into_iter().map(|i| self.graph[i].stage_id.clone()).collect())
    }

    /// Every stage the given stage transitively depends on, in document order
    pub fn ancestors(&self, stage_id: &str) -> Option<Vec<String>> {
        let &index = self.node_id_to_index.get(stage_id)?;
        let mut seen = BTreeSet::new();
        let mut pending = vec![index];
        while let Some(current) = pending.pop() {
            for edge in self.graph.edges_directed(current, Direction::Incoming) {
                if seen.insert(edge.source()) {
                    pending.push(edge.source());
                }
            }
        }
        Some(seen.into_iter().map(|i| self.graph[i].stage_id.clone()).collect())
    }

    /// Writer nodes in execution order
    pub fn writers(&self) -> impl Iterator<Item = &StageNode> {
        self.nodes_in_order().filter(|n| n.capability == Capability::Writer)
    }
}
