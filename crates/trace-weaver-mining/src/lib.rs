#![forbid(unsafe_code)]

//! Process mining over correlated traces: frequency graphs and token-replay
//! conformance.

mod conformance;
mod graph;
mod model;

pub use conformance::{
    CancelFlag, ConformanceChecker, ConformanceReport, Deviation, DeviationKind,
    DeviationPattern, PrecisionEstimator, ReplayCheckpoint, ReplayStatus, END_OF_TRACE,
};
pub use graph::{
    directly_follows, CausalDiscovery, CausalRegistry, GraphAccumulator, GraphEdge, GraphKind,
    GraphMiner, GraphNode, ParentChildDiscovery, ProcessGraph,
};
pub use model::ReferenceModel;
