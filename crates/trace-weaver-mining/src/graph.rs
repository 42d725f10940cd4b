use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use trace_weaver_core::{Trace, TraceError};
use tracing::debug;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GraphKind {
    DirectlyFollows,
    Causal,
}

impl GraphKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DirectlyFollows => "directly_follows",
            Self::Causal => "causal",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "directly_follows" | "directly-follows" | "dfg" => Some(Self::DirectlyFollows),
            "causal" => Some(Self::Causal),
            _ => None,
        }
    }
}

impl Display for GraphKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GraphNode {
    pub activity: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    pub weight: u64,
}

/// Frequency-weighted process graph derived from a trace snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessGraph {
    pub kind: GraphKind,
    pub trace_count: u64,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    pub start_activities: BTreeMap<String, u64>,
    pub end_activities: BTreeMap<String, u64>,
}

impl ProcessGraph {
    #[must_use]
    pub fn edge_weight(&self, source: &str, target: &str) -> u64 {
        self.edges
            .iter()
            .find(|edge| edge.source == source && edge.target == target)
            .map_or(0, |edge| edge.weight)
    }

    #[must_use]
    pub fn node_count(&self, activity: &str) -> u64 {
        self.nodes
            .iter()
            .find(|node| node.activity == activity)
            .map_or(0, |node| node.count)
    }
}

/// Commutative counter set behind every graph kind.
///
/// Partial accumulators built over disjoint trace slices merge into the
/// same result in any order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphAccumulator {
    traces: u64,
    nodes: BTreeMap<String, u64>,
    edges: BTreeMap<(String, String), u64>,
    starts: BTreeMap<String, u64>,
    ends: BTreeMap<String, u64>,
}

impl GraphAccumulator {
    pub fn observe_trace(&mut self) {
        self.traces += 1;
    }

    pub fn add_node(&mut self, activity: &str) {
        *self.nodes.entry(activity.to_string()).or_default() += 1;
    }

    pub fn add_edge(&mut self, source: &str, target: &str) {
        *self
            .edges
            .entry((source.to_string(), target.to_string()))
            .or_default() += 1;
    }

    pub fn add_start(&mut self, activity: &str) {
        *self.starts.entry(activity.to_string()).or_default() += 1;
    }

    pub fn add_end(&mut self, activity: &str) {
        *self.ends.entry(activity.to_string()).or_default() += 1;
    }

    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        self.traces += other.traces;
        merge_counts(&mut self.nodes, other.nodes);
        merge_counts(&mut self.edges, other.edges);
        merge_counts(&mut self.starts, other.starts);
        merge_counts(&mut self.ends, other.ends);
        self
    }

    #[must_use]
    pub fn into_graph(self, kind: GraphKind) -> ProcessGraph {
        ProcessGraph {
            kind,
            trace_count: self.traces,
            nodes: self
                .nodes
                .into_iter()
                .map(|(activity, count)| GraphNode { activity, count })
                .collect(),
            edges: self
                .edges
                .into_iter()
                .map(|((source, target), weight)| GraphEdge {
                    source,
                    target,
                    weight,
                })
                .collect(),
            start_activities: self.starts,
            end_activities: self.ends,
        }
    }
}

fn merge_counts<K: Ord>(into: &mut BTreeMap<K, u64>, from: BTreeMap<K, u64>) {
    for (key, count) in from {
        *into.entry(key).or_default() += count;
    }
}

/// Directly-follows graph: every adjacent activity pair of every trace.
#[must_use]
pub fn directly_follows(traces: &[Trace]) -> ProcessGraph {
    traces
        .par_iter()
        .map(|trace| {
            let mut acc = GraphAccumulator::default();
            acc.observe_trace();
            for activity in trace.activities() {
                acc.add_node(activity);
            }
            for pair in trace.events.windows(2) {
                acc.add_edge(&pair[0].activity, &pair[1].activity);
            }
            if let (Some(first), Some(last)) = (trace.events.first(), trace.events.last()) {
                acc.add_start(&first.activity);
                acc.add_end(&last.activity);
            }
            acc
        })
        .reduce(GraphAccumulator::default, GraphAccumulator::merge)
        .into_graph(GraphKind::DirectlyFollows)
}

/// Pluggable causal-structure backend.
pub trait CausalDiscovery: Send + Sync {
    fn name(&self) -> &str;

    fn discover(&self, traces: &[Trace]) -> ProcessGraph;
}

/// Causal edges taken verbatim from explicit parent references inside a trace.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParentChildDiscovery;

impl ParentChildDiscovery {
    pub const NAME: &'static str = "parent_child";
}

impl CausalDiscovery for ParentChildDiscovery {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn discover(&self, traces: &[Trace]) -> ProcessGraph {
        traces
            .par_iter()
            .map(|trace| {
                let mut acc = GraphAccumulator::default();
                acc.observe_trace();

                let activity_by_key: HashMap<String, &str> = trace
                    .events
                    .iter()
                    .map(|event| (event.key(), event.activity.as_str()))
                    .collect();
                let mut has_children: HashSet<&str> = HashSet::new();

                for event in &trace.events {
                    acc.add_node(&event.activity);
                    let parent = event
                        .parent
                        .as_deref()
                        .and_then(|key| activity_by_key.get_key_value(key));
                    match parent {
                        Some((parent_key, parent_activity)) => {
                            acc.add_edge(parent_activity, &event.activity);
                            has_children.insert(parent_key.as_str());
                        }
                        None => acc.add_start(&event.activity),
                    }
                }
                for event in &trace.events {
                    if !has_children.contains(event.key().as_str()) {
                        acc.add_end(&event.activity);
                    }
                }
                acc
            })
            .reduce(GraphAccumulator::default, GraphAccumulator::merge)
            .into_graph(GraphKind::Causal)
    }
}

/// Named causal backends with one default.
#[derive(Clone)]
pub struct CausalRegistry {
    backends: BTreeMap<String, Arc<dyn CausalDiscovery>>,
    default_backend: String,
}

impl Default for CausalRegistry {
    fn default() -> Self {
        let mut backends: BTreeMap<String, Arc<dyn CausalDiscovery>> = BTreeMap::new();
        backends.insert(
            ParentChildDiscovery::NAME.to_string(),
            Arc::new(ParentChildDiscovery),
        );
        Self {
            backends,
            default_backend: ParentChildDiscovery::NAME.to_string(),
        }
    }
}

impl std::fmt::Debug for CausalRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CausalRegistry")
            .field("backends", &self.names())
            .field("default_backend", &self.default_backend)
            .finish()
    }
}

impl CausalRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `backend` under its own name, returning any backend it replaced.
    pub fn register(
        &mut self,
        backend: Arc<dyn CausalDiscovery>,
    ) -> Option<Arc<dyn CausalDiscovery>> {
        self.backends.insert(backend.name().to_string(), backend)
    }

    /// # Errors
    /// Returns [`TraceError::NotFound`] when no backend has that name.
    pub fn set_default(&mut self, name: &str) -> Result<(), TraceError> {
        if !self.backends.contains_key(name) {
            return Err(TraceError::NotFound(format!("causal backend {name}")));
        }
        self.default_backend = name.to_string();
        Ok(())
    }

    #[must_use]
    pub fn default_name(&self) -> &str {
        &self.default_backend
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&dyn CausalDiscovery> {
        self.backends.get(name).map(AsRef::as_ref)
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.backends.keys().map(String::as_str).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct GraphMiner {
    registry: CausalRegistry,
}

impl GraphMiner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_registry(registry: CausalRegistry) -> Self {
        Self { registry }
    }

    #[must_use]
    pub fn registry(&self) -> &CausalRegistry {
        &self.registry
    }

    /// Mines one graph kind; causal graphs use the registry's default backend.
    ///
    /// # Errors
    /// Returns [`TraceError::NotFound`] when the causal backend is missing.
    pub fn mine(&self, kind: GraphKind, traces: &[Trace]) -> Result<ProcessGraph, TraceError> {
        match kind {
            GraphKind::DirectlyFollows => {
                let graph = directly_follows(traces);
                debug!(
                    event = "graph_mined",
                    kind = kind.as_str(),
                    traces = graph.trace_count,
                    edges = graph.edges.len()
                );
                Ok(graph)
            }
            GraphKind::Causal => self.mine_causal(self.registry.default_name(), traces),
        }
    }

    /// # Errors
    /// Returns [`TraceError::NotFound`] when `backend` is not registered.
    pub fn mine_causal(&self, backend: &str, traces: &[Trace]) -> Result<ProcessGraph, TraceError> {
        let discovery = self
            .registry
            .get(backend)
            .ok_or_else(|| TraceError::NotFound(format!("causal backend {backend}")))?;
        let mut graph = discovery.discover(traces);
        graph.kind = GraphKind::Causal;
        debug!(
            event = "graph_mined",
            kind = "causal",
            backend,
            traces = graph.trace_count,
            edges = graph.edges.len()
        );
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use trace_weaver_core::{parse_rfc3339_utc, Event, EventType};

    fn fixture_trace(case_id: &str, activities: &[&str]) -> Trace {
        let events = activities
            .iter()
            .enumerate()
            .map(|(minute, activity)| {
                let at = match parse_rfc3339_utc(&format!("2025-12-02T10:{minute:02}:00Z")) {
                    Ok(value) => value,
                    Err(err) => panic!("bad fixture time: {err}"),
                };
                Event::new(EventType::PipelineActivity, at, *activity, "tester")
                    .with_source_record_id(format!("{case_id}:{minute}"))
            })
            .collect();
        Trace::assemble(case_id, events)
    }

    fn must<T>(result: Result<T, TraceError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    #[test]
    fn directly_follows_counts_adjacent_pairs() {
        let traces = vec![
            fixture_trace("t1", &["A", "B", "C"]),
            fixture_trace("t2", &["A", "B"]),
            fixture_trace("t3", &["A", "C", "B"]),
        ];
        let graph = must(GraphMiner::new().mine(GraphKind::DirectlyFollows, &traces));

        assert_eq!(graph.edge_weight("A", "B"), 2);
        assert_eq!(graph.edge_weight("B", "C"), 1);
        assert_eq!(graph.edge_weight("A", "C"), 1);
        assert_eq!(graph.edge_weight("C", "B"), 1);
        assert_eq!(graph.edges.len(), 4);
        assert_eq!(graph.node_count("A"), 3);
        assert_eq!(graph.trace_count, 3);
        assert_eq!(graph.start_activities.get("A"), Some(&3));
        assert_eq!(graph.end_activities.get("B"), Some(&2));
    }

    #[test]
    fn causal_graph_follows_parent_links_not_adjacency() {
        let at = |value: &str| match parse_rfc3339_utc(value) {
            Ok(parsed) => parsed,
            Err(err) => panic!("bad fixture time: {err}"),
        };
        let commit = Event::new(EventType::CommitCreated, at("2025-12-02T10:00:00Z"), "commit", "dev")
            .with_source_record_id("commit:abc");
        let first = Event::new(EventType::FileModified, at("2025-12-02T10:00:00Z"), "modify", "dev")
            .with_source_record_id("commit:abc:a.py")
            .with_parent("commit:abc");
        let second = Event::new(EventType::FileAdded, at("2025-12-02T10:00:00Z"), "add", "dev")
            .with_source_record_id("commit:abc:b.py")
            .with_parent("commit:abc");
        let trace = Trace::assemble("c", vec![commit, first, second]);

        let graph = must(GraphMiner::new().mine(GraphKind::Causal, &[trace]));
        assert_eq!(graph.kind, GraphKind::Causal);
        assert_eq!(graph.edge_weight("commit", "modify"), 1);
        assert_eq!(graph.edge_weight("commit", "add"), 1);
        assert_eq!(graph.edge_weight("modify", "add"), 0);
        assert_eq!(graph.start_activities.get("commit"), Some(&1));
        assert_eq!(graph.end_activities.len(), 2);
    }

    struct EmptyDiscovery;

    impl CausalDiscovery for EmptyDiscovery {
        fn name(&self) -> &str {
            "empty"
        }

        fn discover(&self, traces: &[Trace]) -> ProcessGraph {
            let mut acc = GraphAccumulator::default();
            for _ in traces {
                acc.observe_trace();
            }
            acc.into_graph(GraphKind::DirectlyFollows)
        }
    }

    #[test]
    fn registry_dispatches_by_name() {
        let mut registry = CausalRegistry::new();
        assert!(registry.register(Arc::new(EmptyDiscovery)).is_none());
        assert_eq!(registry.names(), vec!["empty", "parent_child"]);
        assert!(matches!(
            registry.set_default("missing"),
            Err(TraceError::NotFound(_))
        ));
        must(registry.set_default("empty"));

        let miner = GraphMiner::with_registry(registry);
        let traces = vec![fixture_trace("t1", &["A", "B"])];
        let graph = must(miner.mine(GraphKind::Causal, &traces));
        assert_eq!(graph.kind, GraphKind::Causal);
        assert!(graph.edges.is_empty());
        assert_eq!(graph.trace_count, 1);

        assert!(matches!(
            miner.mine_causal("missing", &traces),
            Err(TraceError::NotFound(_))
        ));
    }

    #[test]
    fn graph_kind_names_parse() {
        assert_eq!(GraphKind::parse("directly-follows"), Some(GraphKind::DirectlyFollows));
        assert_eq!(GraphKind::parse(GraphKind::Causal.as_str()), Some(GraphKind::Causal));
        assert_eq!(GraphKind::parse("petri"), None);
    }

    proptest! {
        #[test]
        fn prop_dfg_is_independent_of_trace_order(
            corpus in prop::collection::vec(prop::collection::vec(0u8..4, 0..6), 0..12),
            rotation in 0usize..12,
        ) {
            let names = ["A", "B", "C", "D"];
            let traces: Vec<Trace> = corpus
                .iter()
                .enumerate()
                .map(|(index, codes)| {
                    let activities: Vec<&str> = codes.iter().map(|code| names[usize::from(*code)]).collect();
                    fixture_trace(&format!("t{index}"), &activities)
                })
                .collect();

            let mut shuffled = traces.clone();
            if !shuffled.is_empty() {
                let by = rotation % shuffled.len();
                shuffled.rotate_left(by);
                shuffled.reverse();
            }

            prop_assert_eq!(directly_follows(&traces), directly_follows(&shuffled));
        }
    }
}
