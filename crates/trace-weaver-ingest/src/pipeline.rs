use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Serialize;
use trace_weaver_core::WeaverConfig;
use tracing::{info, warn};

use crate::adapters::{AdapterStats, EventStream, SourceAdapter};
use crate::correlator::{Arrival, Correlator, FinishReport, IngestOutcome};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub sources: Vec<AdapterStats>,
    pub placed: usize,
    pub deferred: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub finish: FinishReport,
}

impl IngestReport {
    #[must_use]
    pub fn events(&self) -> usize {
        self.sources.iter().map(|source| source.events).sum()
    }

    #[must_use]
    pub fn parse_errors(&self) -> usize {
        self.sources.iter().map(|source| source.parse_errors).sum()
    }
}

#[derive(Debug, Default)]
struct Tally {
    placed: usize,
    deferred: usize,
    duplicates: usize,
    rejected: usize,
}

/// Reads every source on its own thread and feeds one bounded queue drained
/// by a fixed pool of correlator workers.
#[derive(Debug, Clone)]
pub struct IngestPipeline {
    record_timeout: Duration,
    queue_capacity: usize,
    workers: usize,
}

impl IngestPipeline {
    #[must_use]
    pub fn new(config: &WeaverConfig) -> Self {
        Self {
            record_timeout: config.record_timeout(),
            queue_capacity: config.queue_capacity,
            workers: config.correlator_workers.max(1),
        }
    }

    /// Drains all `adapters` into `correlator`, then resolves deferred events.
    ///
    /// # Errors
    /// Returns an error when a worker thread panics or deferred resolution fails.
    pub fn run(
        &self,
        adapters: &[&dyn SourceAdapter],
        correlator: &Correlator,
    ) -> Result<IngestReport> {
        let (sender, receiver) = crossbeam_channel::bounded::<(Arrival, trace_weaver_core::Event)>(
            self.queue_capacity,
        );
        let record_timeout = self.record_timeout;

        let (sources, tallies) = std::thread::scope(|scope| {
            let producers: Vec<_> = adapters
                .iter()
                .enumerate()
                .map(|(index, adapter)| {
                    let sender = sender.clone();
                    let source = u32::try_from(index + 1).unwrap_or(u32::MAX);
                    let adapter: &dyn SourceAdapter = *adapter;
                    scope.spawn(move || {
                        let mut stream = EventStream::new(adapter, record_timeout);
                        for (ordinal, event) in (0_u64..).zip(stream.by_ref()) {
                            if sender.send((Arrival { source, ordinal }, event)).is_err() {
                                warn!(
                                    event = "ingest_queue_closed",
                                    source = adapter.source_name()
                                );
                                break;
                            }
                        }
                        stream.into_stats()
                    })
                })
                .collect();
            drop(sender);

            let consumers: Vec<_> = (0..self.workers)
                .map(|_| {
                    let receiver = receiver.clone();
                    scope.spawn(move || {
                        let mut tally = Tally::default();
                        for (arrival, event) in &receiver {
                            match correlator.ingest_at(arrival, event) {
                                Ok(IngestOutcome::Placed { .. }) => tally.placed += 1,
                                Ok(IngestOutcome::Deferred) => tally.deferred += 1,
                                Ok(IngestOutcome::Duplicate) => tally.duplicates += 1,
                                Err(err) => {
                                    tally.rejected += 1;
                                    warn!(event = "event_rejected", error = %err);
                                }
                            }
                        }
                        tally
                    })
                })
                .collect();

            let sources: Result<Vec<AdapterStats>, _> =
                producers.into_iter().map(|handle| handle.join()).collect();
            let tallies: Result<Vec<Tally>, _> =
                consumers.into_iter().map(|handle| handle.join()).collect();
            (sources, tallies)
        });

        let sources = sources.map_err(|_| anyhow!("source worker panicked"))?;
        let tallies = tallies.map_err(|_| anyhow!("correlator worker panicked"))?;
        let finish = correlator.finish()?;

        let mut report = IngestReport {
            sources,
            finish,
            ..IngestReport::default()
        };
        for tally in tallies {
            report.placed += tally.placed;
            report.deferred += tally.deferred;
            report.duplicates += tally.duplicates;
            report.rejected += tally.rejected;
        }

        info!(
            event = "ingest_completed",
            sources = report.sources.len(),
            events = report.events(),
            parse_errors = report.parse_errors(),
            duplicates = report.duplicates,
            deferred = report.deferred,
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{HistoryAdapter, SessionAdapter, SpanAdapter};
    use trace_weaver_core::{CorrelationRule, EventType, Trace};

    const SESSIONS: &str = "\
# Session 20251202.10
Started: 2025-12-02T09:30:00Z
Actor: alice

## Objective
Fix CI failures

## Completed
- Repaired lint config in `a.py`
- Updated fixtures in `b.py`

## Commits
- 540661c
";

    const HISTORY: &str = "\
commit 540661c3f2a9e8d7b6c5a4f3e2d1c0b9a8f7e6d5
Author: Alice <alice@example.com>
Date:   2025-12-02T11:15:00Z

    Fix CI failures

M\ta.py
M\tb.py
";

    const SESSION_MONDAY: &str = "\
# Session 20251201.1
Started: 2025-12-01T09:00:00Z

## Commits
- 540661c
";

    const SESSION_TUESDAY: &str = "\
# Session 20251202.1
Started: 2025-12-02T09:00:00Z

## Commits
- 540661c
";

    const MAIN_HISTORY: &str = "\
commit 1111111111111111111111111111111111111111
Author: Alice <alice@example.com>
Date:   2025-12-01T10:00:00Z
Branch: main

    Start the fix

    Session: 20251201.1

M\ta.py

commit 2222222222222222222222222222222222222222
Author: Alice <alice@example.com>
Date:   2025-12-09T10:00:00Z
Branch: main

    Unrelated cleanup

M\tb.py
";

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn fixture_config(workers: usize) -> WeaverConfig {
        WeaverConfig {
            correlator_workers: workers,
            queue_capacity: 2,
            ..WeaverConfig::default()
        }
    }

    fn only_trace(correlator: &Correlator, case_id: &str) -> Trace {
        match correlator.trace(case_id) {
            Some(trace) => trace,
            None => panic!("missing trace {case_id}"),
        }
    }

    #[test]
    fn session_and_commit_correlate_into_one_trace() {
        for workers in [1, 4] {
            let sessions = SessionAdapter::from_text("sessions", SESSIONS);
            let history = HistoryAdapter::from_text("history", HISTORY);
            let correlator = Correlator::new();

            // History first, so the commit arrives before its session binds the reference.
            let report = must(
                IngestPipeline::new(&fixture_config(workers))
                    .run(&[&history, &sessions], &correlator),
            );
            assert_eq!(report.parse_errors(), 0);
            assert_eq!(report.events(), 7);

            let traces = correlator.traces();
            assert_eq!(traces.len(), 1, "workers={workers}");
            let trace = only_trace(&correlator, "20251202.10");
            assert_eq!(trace.count_of(EventType::SessionStart), 1);
            assert_eq!(trace.count_of(EventType::ObjectiveSet), 1);
            assert_eq!(trace.count_of(EventType::TaskCompleted), 2);
            assert_eq!(trace.count_of(EventType::CommitCreated), 1);
            assert_eq!(trace.count_of(EventType::FileModified), 2);

            let Some(commit) = trace
                .events
                .iter()
                .find(|event| event.event_type == EventType::CommitCreated)
            else {
                panic!("commit event missing");
            };
            assert_eq!(commit.case_id.as_deref(), Some("20251202.10"));
            assert_eq!(
                commit.correlation.as_ref().map(|item| item.rule),
                Some(CorrelationRule::BackReference)
            );
            assert_eq!(trace.events[0].event_type, EventType::SessionStart);
        }
    }

    #[test]
    fn reingesting_the_same_sources_adds_nothing() {
        let sessions = SessionAdapter::from_text("sessions", SESSIONS);
        let correlator = Correlator::new();
        let pipeline = IngestPipeline::new(&fixture_config(2));

        let first = must(pipeline.run(&[&sessions], &correlator));
        let second = must(pipeline.run(&[&sessions], &correlator));

        assert_eq!(first.duplicates, 0);
        assert_eq!(second.duplicates, first.events());
        assert_eq!(only_trace(&correlator, "20251202.10").len(), 4);
    }

    #[test]
    fn bad_records_do_not_stop_other_sources() {
        let spans = SpanAdapter::from_text(
            "spans",
            concat!(
                r#"{"trace_id":"t1","span_id":"s1","name":"plan","start_time":"2025-12-02T10:00:00Z","case_id":"run-1"}"#,
                "\n{broken\n",
                r#"{"trace_id":"t1","span_id":"s2","parent_span_id":"s1","name":"act","start_time":"2025-12-02T10:00:02Z"}"#,
            ),
        );
        let sessions = SessionAdapter::from_text("sessions", "# Session nope\n");
        let correlator = Correlator::new();

        let report = must(IngestPipeline::new(&fixture_config(3)).run(&[&spans, &sessions], &correlator));
        assert_eq!(report.parse_errors(), 2);
        assert_eq!(report.sources[0].events, 2);
        assert_eq!(report.sources[1].parse_errors, 1);

        let trace = only_trace(&correlator, "run-1");
        assert_eq!(trace.activities().collect::<Vec<_>>(), vec!["plan", "act"]);
    }

    #[test]
    fn commit_cited_by_two_sessions_lands_in_one_case_every_run() {
        for run in 0..25 {
            let monday = SessionAdapter::from_text("monday", SESSION_MONDAY);
            let tuesday = SessionAdapter::from_text("tuesday", SESSION_TUESDAY);
            let history = HistoryAdapter::from_text("history", HISTORY);
            let correlator = Correlator::new();

            let report = must(
                IngestPipeline::new(&fixture_config(4))
                    .run(&[&history, &tuesday, &monday], &correlator),
            );
            assert_eq!(report.parse_errors(), 0);
            assert_eq!(
                correlator.case_for_reference("commit:540661c").as_deref(),
                Some("20251201.1"),
                "run={run}"
            );

            let trace = only_trace(&correlator, "20251201.1");
            let Some(commit) = trace
                .events
                .iter()
                .find(|event| event.event_type == EventType::CommitCreated)
            else {
                panic!("commit missing from 20251201.1 on run {run}");
            };
            let Some(correlation) = &commit.correlation else {
                panic!("commit carries no correlation");
            };
            assert_eq!(correlation.rule, CorrelationRule::BackReference);
            assert_eq!(
                correlation.candidates,
                vec!["20251201.1".to_string(), "20251202.1".to_string()]
            );
            assert_eq!(only_trace(&correlator, "20251202.1").len(), 1);
        }
    }

    #[test]
    fn shared_branch_does_not_pull_an_uncited_commit_into_a_session() {
        let history = HistoryAdapter::from_text("history", MAIN_HISTORY);
        let correlator = Correlator::new();
        must(IngestPipeline::new(&fixture_config(2)).run(&[&history], &correlator));

        assert_eq!(only_trace(&correlator, "20251201.1").len(), 2);
        let standalone = only_trace(
            &correlator,
            "standalone:commit:2222222222222222222222222222222222222222",
        );
        assert_eq!(standalone.count_of(EventType::CommitCreated), 1);
        assert_eq!(standalone.count_of(EventType::FileModified), 1);
        assert_eq!(
            standalone.events[0].correlation.as_ref().map(|item| item.rule),
            Some(CorrelationRule::Standalone)
        );
        assert_eq!(standalone.events[0].attributes.get_str("branch"), Some("main"));
    }
}
