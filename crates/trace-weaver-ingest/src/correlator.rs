use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use time::{Date, OffsetDateTime};
use trace_weaver_core::{Correlation, CorrelationRule, Event, Trace, TraceError};
use tracing::{debug, warn};

/// Position of an event in the stream it arrived on.
///
/// Events from one source keep their source order; across sources the
/// source index decides. Source 0 holds restored events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Arrival {
    pub source: u32,
    pub ordinal: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Placed {
        case_id: String,
        rule: CorrelationRule,
    },
    Deferred,
    Duplicate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FinishReport {
    pub resolved: usize,
    pub back_reference: usize,
    pub time_window: usize,
    pub ambiguous: usize,
    pub standalone: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CorrelatorStats {
    pub cases: usize,
    pub events: usize,
    pub deferred: usize,
    pub duplicates: usize,
    pub ambiguities: usize,
}

#[derive(Debug)]
struct CaseLog {
    opened_at: OffsetDateTime,
    events: Vec<(Arrival, Event)>,
}

impl CaseLog {
    fn new(opened_at: OffsetDateTime) -> Self {
        Self {
            opened_at,
            events: Vec::new(),
        }
    }
}

/// Cases grouped by the UTC day they were opened, kept current while
/// deferred events are placed.
#[derive(Debug, Default)]
struct OpenCases {
    by_day: BTreeMap<Date, BTreeSet<(OffsetDateTime, String)>>,
    opened: HashMap<String, OffsetDateTime>,
}

impl OpenCases {
    fn refresh(&mut self, case_id: &str, opened_at: OffsetDateTime) {
        if let Some(previous) = self.opened.insert(case_id.to_string(), opened_at) {
            if previous == opened_at {
                return;
            }
            if let Some(day) = self.by_day.get_mut(&previous.date()) {
                day.remove(&(previous, case_id.to_string()));
            }
        }
        self.by_day
            .entry(opened_at.date())
            .or_default()
            .insert((opened_at, case_id.to_string()));
    }

    /// Cases opened on `day`, oldest first.
    fn on(&self, day: Date) -> Vec<String> {
        self.by_day
            .get(&day)
            .map(|cases| cases.iter().map(|(_, case_id)| case_id.clone()).collect())
            .unwrap_or_default()
    }
}

/// Assigns case ids to events and assembles per-case traces.
///
/// Rules, first match wins: the adapter's case hint, then a reference
/// carried by an already placed event, then the calendar-day fallback.
/// Only hinted events are placed on arrival. Everything else waits for
/// [`Correlator::finish`], so the case an event lands in never depends on
/// which worker got to it first.
#[derive(Debug, Default)]
pub struct Correlator {
    cases: DashMap<String, Arc<Mutex<CaseLog>>>,
    references: DashMap<String, BTreeSet<String>>,
    seen: DashMap<String, ()>,
    deferred: Mutex<Vec<(Arrival, Event)>>,
    next_ordinal: AtomicU64,
    duplicates: AtomicUsize,
    ambiguities: AtomicUsize,
}

impl Correlator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingests an event that did not come through the pipeline.
    ///
    /// # Errors
    /// See [`Correlator::ingest_at`].
    pub fn ingest(&self, event: Event) -> Result<IngestOutcome, TraceError> {
        let arrival = Arrival {
            source: u32::MAX,
            ordinal: self.next_ordinal.fetch_add(1, Ordering::Relaxed),
        };
        self.ingest_at(arrival, event)
    }

    /// Places `event` if it carries a case id or a case hint, otherwise
    /// defers it.
    ///
    /// # Errors
    /// Propagates [`Event::assign_case`] failures.
    pub fn ingest_at(&self, arrival: Arrival, event: Event) -> Result<IngestOutcome, TraceError> {
        let key = event.key();
        if self.seen.insert(key.clone(), ()).is_some() {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(event = "duplicate_event_dropped", event_key = key.as_str());
            return Ok(IngestOutcome::Duplicate);
        }

        if let Some(case_id) = event.case_id.clone() {
            let correlation = event
                .correlation
                .clone()
                .unwrap_or_else(|| Correlation::new(CorrelationRule::ExplicitCase));
            return self.place(arrival, event, &case_id, correlation);
        }

        if let Some(hint) = event.case_hint.clone().filter(|hint| !hint.trim().is_empty()) {
            return self.place(
                arrival,
                event,
                &hint,
                Correlation::new(CorrelationRule::ExplicitCase),
            );
        }

        debug!(event = "event_deferred", event_key = key.as_str());
        self.deferred.lock().push((arrival, event));
        Ok(IngestOutcome::Deferred)
    }

    /// Seeds the correlator with stored events ahead of any source, returning
    /// how many were placed right away. Stored events without a case wait for
    /// [`Correlator::finish`] like any other.
    ///
    /// # Errors
    /// Propagates the first placement failure.
    pub fn restore(&self, events: impl IntoIterator<Item = Event>) -> Result<usize, TraceError> {
        let mut placed = 0;
        for event in events {
            let arrival = Arrival {
                source: 0,
                ordinal: self.next_ordinal.fetch_add(1, Ordering::Relaxed),
            };
            if matches!(self.ingest_at(arrival, event)?, IngestOutcome::Placed { .. }) {
                placed += 1;
            }
        }
        Ok(placed)
    }

    /// Resolves every deferred event.
    ///
    /// Deferred events are handled in (timestamp, key) order. Back-references
    /// are resolved first, repeating while placements bind new references;
    /// the rest go through the calendar-day fallback.
    ///
    /// # Errors
    /// Propagates placement failures; resolution itself never fails.
    pub fn finish(&self) -> Result<FinishReport, TraceError> {
        let mut pending = std::mem::take(&mut *self.deferred.lock());
        pending.sort_by(|(left_arrival, left), (right_arrival, right)| {
            (left.timestamp, left.key(), left_arrival).cmp(&(
                right.timestamp,
                right.key(),
                right_arrival,
            ))
        });

        let mut report = FinishReport::default();
        loop {
            let before = pending.len();
            let mut unresolved = Vec::with_capacity(before);
            for (arrival, event) in pending {
                match self.by_reference(&event) {
                    Some((case_id, correlation)) => {
                        report.resolved += 1;
                        report.back_reference += 1;
                        self.place(arrival, event, &case_id, correlation)?;
                    }
                    None => unresolved.push((arrival, event)),
                }
            }
            pending = unresolved;
            if pending.len() == before {
                break;
            }
        }

        let mut open = self.open_cases();
        for (arrival, event) in pending {
            report.resolved += 1;
            let (case_id, correlation) = match self.by_reference(&event) {
                Some(found) => {
                    report.back_reference += 1;
                    found
                }
                None => self.by_time_window(&event, &open, &mut report),
            };
            self.place(arrival, event, &case_id, correlation)?;
            if let Some(opened_at) = self.opened_at(&case_id) {
                open.refresh(&case_id, opened_at);
            }
        }

        debug!(
            event = "correlation_finished",
            resolved = report.resolved,
            ambiguous = report.ambiguous,
            standalone = report.standalone,
        );
        Ok(report)
    }

    /// Snapshot of every case as an ordered [`Trace`], sorted by case id.
    #[must_use]
    pub fn traces(&self) -> Vec<Trace> {
        let handles: Vec<(String, Arc<Mutex<CaseLog>>)> = self
            .cases
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut traces: Vec<Trace> = handles
            .into_iter()
            .map(|(case_id, log)| {
                let mut events = log.lock().events.clone();
                events.sort_by_key(|(arrival, _)| *arrival);
                Trace::assemble(case_id, events.into_iter().map(|(_, event)| event).collect())
            })
            .collect();
        traces.sort_by(|left, right| left.case_id.cmp(&right.case_id));
        traces
    }

    #[must_use]
    pub fn trace(&self, case_id: &str) -> Option<Trace> {
        let log = self.cases.get(case_id).map(|entry| Arc::clone(entry.value()))?;
        let mut events = log.lock().events.clone();
        events.sort_by_key(|(arrival, _)| *arrival);
        Some(Trace::assemble(
            case_id,
            events.into_iter().map(|(_, event)| event).collect(),
        ))
    }

    /// Case a reference resolves to: the earliest opened of the cases that
    /// carry it.
    #[must_use]
    pub fn case_for_reference(&self, reference: &str) -> Option<String> {
        self.earliest_opened(&self.cases_for_reference(reference))
    }

    /// Every case holding an event that carries `reference`.
    #[must_use]
    pub fn cases_for_reference(&self, reference: &str) -> BTreeSet<String> {
        self.references
            .get(reference)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn stats(&self) -> CorrelatorStats {
        let events = self
            .cases
            .iter()
            .map(|entry| entry.value().lock().events.len())
            .sum();
        CorrelatorStats {
            cases: self.cases.len(),
            events,
            deferred: self.deferred.lock().len(),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            ambiguities: self.ambiguities.load(Ordering::Relaxed),
        }
    }

    fn by_reference(&self, event: &Event) -> Option<(String, Correlation)> {
        let bound: BTreeSet<String> = event
            .references
            .iter()
            .flat_map(|reference| self.cases_for_reference(reference))
            .collect();
        let chosen = self.earliest_opened(&bound)?;

        let mut correlation = Correlation::new(CorrelationRule::BackReference);
        if bound.len() > 1 {
            let candidates: Vec<String> = bound.into_iter().collect();
            self.note_ambiguity(event, &chosen, &candidates);
            correlation = correlation.with_note(format!(
                "references carried by {} cases; joined earliest opened",
                candidates.len()
            ));
            correlation.candidates = candidates;
        }
        Some((chosen, correlation))
    }

    fn by_time_window(
        &self,
        event: &Event,
        open: &OpenCases,
        report: &mut FinishReport,
    ) -> (String, Correlation) {
        let day = event.date();
        let candidates = open.on(day);
        match candidates.as_slice() {
            [] => {
                report.standalone += 1;
                (
                    format!("standalone:{}", event.key()),
                    Correlation::new(CorrelationRule::Standalone)
                        .with_note(format!("no case open on {day}")),
                )
            }
            [only] => {
                report.time_window += 1;
                (
                    only.clone(),
                    Correlation::new(CorrelationRule::TimeWindowSingle)
                        .with_note(format!("only case open on {day}")),
                )
            }
            [.., latest] => {
                report.time_window += 1;
                report.ambiguous += 1;
                let chosen = latest.clone();
                let mut sorted = candidates.clone();
                sorted.sort();
                self.note_ambiguity(event, &chosen, &sorted);
                let mut correlation = Correlation::new(CorrelationRule::TimeWindowMostRecent)
                    .with_note(format!(
                        "{} cases open on {day}; joined most recent",
                        sorted.len()
                    ));
                correlation.candidates = sorted;
                (chosen, correlation)
            }
        }
    }

    fn opened_at(&self, case_id: &str) -> Option<OffsetDateTime> {
        self.cases
            .get(case_id)
            .map(|entry| Arc::clone(entry.value()))
            .map(|log| log.lock().opened_at)
    }

    fn earliest_opened(&self, case_ids: &BTreeSet<String>) -> Option<String> {
        case_ids
            .iter()
            .map(|case_id| (self.opened_at(case_id), case_id))
            .min()
            .map(|(_, case_id)| case_id.clone())
    }

    fn note_ambiguity(&self, event: &Event, chosen: &str, candidates: &[String]) {
        self.ambiguities.fetch_add(1, Ordering::Relaxed);
        let err = TraceError::CorrelationAmbiguity {
            event_key: event.key(),
            chosen: chosen.to_string(),
            candidates: candidates.to_vec(),
        };
        warn!(event = "correlation_ambiguity", code = err.code(), error = %err);
    }

    fn open_cases(&self) -> OpenCases {
        let handles: Vec<(String, Arc<Mutex<CaseLog>>)> = self
            .cases
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        let mut open = OpenCases::default();
        for (case_id, log) in handles {
            let opened_at = log.lock().opened_at;
            open.refresh(&case_id, opened_at);
        }
        open
    }

    fn place(
        &self,
        arrival: Arrival,
        mut event: Event,
        case_id: &str,
        correlation: Correlation,
    ) -> Result<IngestOutcome, TraceError> {
        let rule = correlation.rule;
        event.assign_case(case_id, correlation)?;

        for reference in &event.references {
            self.references
                .entry(reference.clone())
                .or_default()
                .insert(case_id.to_string());
        }

        // Take the handle out of the map before locking so the shard is free.
        let log = Arc::clone(
            self.cases
                .entry(case_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(CaseLog::new(event.timestamp))))
                .value(),
        );
        {
            let mut guard = log.lock();
            if event.timestamp < guard.opened_at {
                guard.opened_at = event.timestamp;
            }
            guard.events.push((arrival, event));
        }

        debug!(event = "event_placed", case_id, rule = rule.as_str());
        Ok(IngestOutcome::Placed {
            case_id: case_id.to_string(),
            rule,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use trace_weaver_core::{parse_rfc3339_utc, EventType};

    fn must<T>(result: Result<T, TraceError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture(key: &str, at: &str) -> Event {
        Event::new(
            EventType::PipelineActivity,
            must(parse_rfc3339_utc(at)),
            key,
            "tester",
        )
        .with_source_record_id(key)
    }

    #[test]
    fn case_hint_wins_and_binds_references() {
        let correlator = Correlator::new();
        let start = fixture("s", "2025-12-02T09:00:00Z")
            .with_case_hint("case-a")
            .with_reference("commit:540661c");
        let outcome = must(correlator.ingest(start));
        assert_eq!(
            outcome,
            IngestOutcome::Placed {
                case_id: "case-a".to_string(),
                rule: CorrelationRule::ExplicitCase
            }
        );
        assert_eq!(
            correlator.case_for_reference("commit:540661c").as_deref(),
            Some("case-a")
        );

        let commit = fixture("c", "2025-12-02T11:00:00Z").with_reference("commit:540661c");
        assert_eq!(must(correlator.ingest(commit)), IngestOutcome::Deferred);
        let report = must(correlator.finish());
        assert_eq!(report.back_reference, 1);
        let Some(trace) = correlator.trace("case-a") else {
            panic!("case-a missing");
        };
        assert_eq!(
            trace.events[1].correlation.as_ref().map(|item| item.rule),
            Some(CorrelationRule::BackReference)
        );
    }

    fn cited_commit_case(order: &[usize]) -> (String, Vec<String>) {
        let events = [
            fixture("s1", "2025-12-01T09:00:00Z")
                .with_case_hint("20251201.1")
                .with_reference("commit:540661c"),
            fixture("s2", "2025-12-02T09:00:00Z")
                .with_case_hint("20251202.1")
                .with_reference("commit:540661c"),
            fixture("c", "2025-12-02T11:00:00Z").with_reference("commit:540661c"),
        ];
        let correlator = Correlator::new();
        for index in order {
            must(correlator.ingest(events[*index].clone()));
        }
        must(correlator.finish());

        let commit = correlator
            .traces()
            .into_iter()
            .flat_map(|trace| trace.events)
            .find(|event| event.activity == "c");
        let Some(commit) = commit else {
            panic!("commit was not placed");
        };
        let Some(correlation) = commit.correlation else {
            panic!("commit carries no correlation");
        };
        assert_eq!(correlation.rule, CorrelationRule::BackReference);
        (commit.case_id.unwrap_or_default(), correlation.candidates)
    }

    #[test]
    fn competing_back_references_join_the_earliest_opened_case() {
        let expected = (
            "20251201.1".to_string(),
            vec!["20251201.1".to_string(), "20251202.1".to_string()],
        );
        for order in [[0, 1, 2], [1, 0, 2], [2, 1, 0], [1, 2, 0]] {
            assert_eq!(cited_commit_case(&order), expected, "order={order:?}");
        }
    }

    #[test]
    fn time_window_sees_cases_reopened_by_earlier_orphans() {
        let correlator = Correlator::new();
        must(correlator.ingest(fixture("s1", "2025-12-02T09:00:00Z").with_case_hint("early")));
        must(correlator.ingest(fixture("s2", "2025-12-02T13:00:00Z").with_case_hint("late")));
        must(correlator.ingest(fixture("dawn", "2025-12-02T08:00:00Z")));
        must(correlator.ingest(fixture("dusk", "2025-12-02T15:00:00Z")));
        let report = must(correlator.finish());
        assert_eq!(report.ambiguous, 2);

        // "dawn" joins "late" and moves its opening to 08:00, so "early" is
        // the most recently opened case by the time "dusk" is resolved.
        let Some(late) = correlator.trace("late") else {
            panic!("case late missing");
        };
        assert_eq!(late.activities().collect::<Vec<_>>(), vec!["dawn", "s2"]);
        let Some(early) = correlator.trace("early") else {
            panic!("case early missing");
        };
        assert_eq!(early.activities().collect::<Vec<_>>(), vec!["s1", "dusk"]);
    }

    #[test]
    fn back_reference_resolves_regardless_of_arrival_order() {
        let correlator = Correlator::new();
        let commit = fixture("c", "2025-12-02T11:00:00Z").with_reference("commit:540661c");
        assert_eq!(must(correlator.ingest(commit)), IngestOutcome::Deferred);

        let start = fixture("s", "2025-12-02T09:00:00Z")
            .with_case_hint("case-a")
            .with_reference("commit:540661c");
        must(correlator.ingest(start));

        let report = must(correlator.finish());
        assert_eq!(report.back_reference, 1);
        let Some(trace) = correlator.trace("case-a") else {
            panic!("case-a missing");
        };
        assert_eq!(trace.activities().collect::<Vec<_>>(), vec!["s", "c"]);
        assert_eq!(
            trace.events[1].correlation.as_ref().map(|item| item.rule),
            Some(CorrelationRule::BackReference)
        );
    }

    #[test]
    fn duplicates_are_dropped() {
        let correlator = Correlator::new();
        must(correlator.ingest(fixture("s", "2025-12-02T09:00:00Z").with_case_hint("a")));
        assert_eq!(
            must(correlator.ingest(fixture("s", "2025-12-02T09:00:00Z").with_case_hint("a"))),
            IngestOutcome::Duplicate
        );
        assert_eq!(correlator.stats().events, 1);
        assert_eq!(correlator.stats().duplicates, 1);
    }

    #[test]
    fn time_window_joins_single_open_case() {
        let correlator = Correlator::new();
        must(correlator.ingest(fixture("s", "2025-12-02T09:00:00Z").with_case_hint("a")));
        must(correlator.ingest(fixture("orphan", "2025-12-02T15:00:00Z")));
        must(correlator.finish());

        let Some(trace) = correlator.trace("a") else {
            panic!("case a missing");
        };
        assert_eq!(trace.len(), 2);
        assert_eq!(
            trace.events[1].correlation.as_ref().map(|item| item.rule),
            Some(CorrelationRule::TimeWindowSingle)
        );
    }

    #[test]
    fn time_window_prefers_most_recent_case_and_records_candidates() {
        let correlator = Correlator::new();
        must(correlator.ingest(fixture("s1", "2025-12-02T09:00:00Z").with_case_hint("early")));
        must(correlator.ingest(fixture("s2", "2025-12-02T13:00:00Z").with_case_hint("late")));
        must(correlator.ingest(fixture("orphan", "2025-12-02T15:00:00Z")));
        let report = must(correlator.finish());
        assert_eq!(report.ambiguous, 1);

        let Some(trace) = correlator.trace("late") else {
            panic!("case late missing");
        };
        let orphan = &trace.events[1];
        let Some(correlation) = &orphan.correlation else {
            panic!("orphan carries no correlation");
        };
        assert_eq!(correlation.rule, CorrelationRule::TimeWindowMostRecent);
        assert_eq!(correlation.candidates, vec!["early".to_string(), "late".to_string()]);
        assert_eq!(correlator.stats().ambiguities, 1);
    }

    #[test]
    fn orphans_on_an_empty_day_open_a_standalone_case() {
        let correlator = Correlator::new();
        must(correlator.ingest(fixture("first", "2025-12-05T08:00:00Z")));
        must(correlator.ingest(fixture("second", "2025-12-05T09:00:00Z")));
        let report = must(correlator.finish());

        assert_eq!(report.standalone, 1);
        assert_eq!(report.time_window, 1);
        let Some(trace) = correlator.trace("standalone:first") else {
            panic!("standalone case missing");
        };
        assert_eq!(trace.len(), 2);
    }

    #[test]
    fn restore_keeps_existing_case_ids() {
        let mut event = fixture("old", "2025-12-02T09:00:00Z").with_reference("trace:t1");
        must(event.assign_case("case-a", Correlation::new(CorrelationRule::BackReference)));

        let correlator = Correlator::new();
        assert_eq!(must(correlator.restore(vec![event])), 1);
        assert_eq!(correlator.case_for_reference("trace:t1").as_deref(), Some("case-a"));

        let Some(trace) = correlator.trace("case-a") else {
            panic!("restored case missing");
        };
        assert_eq!(
            trace.events[0].correlation.as_ref().map(|item| item.rule),
            Some(CorrelationRule::BackReference)
        );
    }

    #[test]
    fn unrelated_cases_fill_concurrently() {
        let correlator = Arc::new(Correlator::new());
        let mut handles = Vec::new();
        for worker in 0..4_u32 {
            let correlator = Arc::clone(&correlator);
            handles.push(std::thread::spawn(move || {
                for step in 0..25_u64 {
                    let event = fixture(&format!("w{worker}-{step}"), "2025-12-02T09:00:00Z")
                        .with_case_hint(format!("case-{}", step % 3));
                    let arrival = Arrival {
                        source: worker,
                        ordinal: step,
                    };
                    if let Err(err) = correlator.ingest_at(arrival, event) {
                        panic!("ingest failed: {err}");
                    }
                }
            }));
        }
        for handle in handles {
            if let Err(err) = handle.join() {
                panic!("worker panicked: {err:?}");
            }
        }

        let traces = correlator.traces();
        assert_eq!(traces.len(), 3);
        assert_eq!(traces.iter().map(Trace::len).sum::<usize>(), 100);
        for trace in &traces {
            let arrivals: Vec<&str> = trace.activities().collect();
            let mut sorted = arrivals.clone();
            sorted.sort_by_key(|activity| {
                let (worker, step) = activity[1..].split_once('-').unwrap_or_default();
                (
                    worker.parse::<u32>().unwrap_or_default(),
                    step.parse::<u64>().unwrap_or_default(),
                )
            });
            assert_eq!(arrivals, sorted);
        }
    }

    proptest! {
        #[test]
        fn prop_every_event_lands_in_exactly_one_case(
            arrivals in prop::collection::vec((0u8..3, 0u8..24, prop::option::of(0u8..3)), 1..40)
        ) {
            let correlator = Correlator::new();
            for (index, (day, hour, hint)) in arrivals.iter().enumerate() {
                let mut event = fixture(
                    &format!("e{index}"),
                    &format!("2025-12-0{}T{hour:02}:00:00Z", day + 1),
                );
                if let Some(hint) = hint {
                    event = event.with_case_hint(format!("case-{hint}"));
                }
                must(correlator.ingest(event));
            }
            must(correlator.finish());

            let stats = correlator.stats();
            prop_assert_eq!(stats.deferred, 0);
            prop_assert_eq!(stats.events, arrivals.len());
            let placed: usize = correlator.traces().iter().map(Trace::len).sum();
            prop_assert_eq!(placed, arrivals.len());
        }

        #[test]
        fn prop_case_assignment_ignores_arrival_order(
            arrivals in prop::collection::vec(
                (0u8..2, 0u8..24, prop::option::of(0u8..3), prop::option::of(0u8..3)),
                1..30,
            )
        ) {
            let events: Vec<Event> = arrivals
                .iter()
                .enumerate()
                .map(|(index, (day, hour, hint, reference))| {
                    let mut event = fixture(
                        &format!("e{index}"),
                        &format!("2025-12-0{}T{hour:02}:00:00Z", day + 1),
                    );
                    if let Some(hint) = hint {
                        event = event.with_case_hint(format!("case-{hint}"));
                    }
                    if let Some(reference) = reference {
                        event = event.with_reference(format!("ref:{reference}"));
                    }
                    event
                })
                .collect();

            let assignment = |ordered: Vec<Event>| {
                let correlator = Correlator::new();
                for event in ordered {
                    must(correlator.ingest(event));
                }
                must(correlator.finish());
                correlator
                    .traces()
                    .into_iter()
                    .map(|trace| {
                        let keys: BTreeSet<String> =
                            trace.events.iter().map(Event::key).collect();
                        (trace.case_id, keys)
                    })
                    .collect::<BTreeMap<_, _>>()
            };

            let forward = assignment(events.clone());
            let backward = assignment(events.into_iter().rev().collect());
            prop_assert_eq!(forward, backward);
        }
    }
}
