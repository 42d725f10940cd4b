#![forbid(unsafe_code)]

//! Source adapters, the ingestion pipeline and the case correlator.

pub mod adapters;
mod correlator;
mod pipeline;

pub use adapters::{
    commit_reference, AdapterStats, EventStream, HistoryAdapter, RawRecord, SessionAdapter,
    SourceAdapter, SpanAdapter,
};
pub use correlator::{Arrival, Correlator, CorrelatorStats, FinishReport, IngestOutcome};
pub use pipeline::{IngestPipeline, IngestReport};
