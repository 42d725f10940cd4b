use std::collections::{BTreeSet, HashMap};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use ulid::Ulid;

use crate::{Payload, TraceError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EventId(pub Ulid);

impl EventId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for EventId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum EventType {
    #[serde(rename = "session.start")]
    SessionStart,
    #[serde(rename = "objective.set")]
    ObjectiveSet,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "file.referenced")]
    FileReferenced,
    #[serde(rename = "commit.created")]
    CommitCreated,
    #[serde(rename = "file.added")]
    FileAdded,
    #[serde(rename = "file.modified")]
    FileModified,
    #[serde(rename = "file.deleted")]
    FileDeleted,
    #[serde(rename = "file.renamed")]
    FileRenamed,
    #[serde(rename = "branch.created")]
    BranchCreated,
    #[serde(rename = "branch.merged")]
    BranchMerged,
    #[serde(rename = "branch.deleted")]
    BranchDeleted,
    #[serde(rename = "span.completed")]
    SpanCompleted,
    #[serde(rename = "pipeline.activity")]
    PipelineActivity,
}

impl EventType {
    pub const ALL: [Self; 14] = [
        Self::SessionStart,
        Self::ObjectiveSet,
        Self::TaskCompleted,
        Self::FileReferenced,
        Self::CommitCreated,
        Self::FileAdded,
        Self::FileModified,
        Self::FileDeleted,
        Self::FileRenamed,
        Self::BranchCreated,
        Self::BranchMerged,
        Self::BranchDeleted,
        Self::SpanCompleted,
        Self::PipelineActivity,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionStart => "session.start",
            Self::ObjectiveSet => "objective.set",
            Self::TaskCompleted => "task.completed",
            Self::FileReferenced => "file.referenced",
            Self::CommitCreated => "commit.created",
            Self::FileAdded => "file.added",
            Self::FileModified => "file.modified",
            Self::FileDeleted => "file.deleted",
            Self::FileRenamed => "file.renamed",
            Self::BranchCreated => "branch.created",
            Self::BranchMerged => "branch.merged",
            Self::BranchDeleted => "branch.deleted",
            Self::SpanCompleted => "span.completed",
            Self::PipelineActivity => "pipeline.activity",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|item| item.as_str() == value)
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which correlation rule placed an event in its case.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationRule {
    ExplicitCase,
    BackReference,
    TimeWindowSingle,
    TimeWindowMostRecent,
    Standalone,
}

impl CorrelationRule {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExplicitCase => "explicit_case",
            Self::BackReference => "back_reference",
            Self::TimeWindowSingle => "time_window_single",
            Self::TimeWindowMostRecent => "time_window_most_recent",
            Self::Standalone => "standalone",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "explicit_case" => Some(Self::ExplicitCase),
            "back_reference" => Some(Self::BackReference),
            "time_window_single" => Some(Self::TimeWindowSingle),
            "time_window_most_recent" => Some(Self::TimeWindowMostRecent),
            "standalone" => Some(Self::Standalone),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_heuristic(self) -> bool {
        matches!(
            self,
            Self::TimeWindowSingle | Self::TimeWindowMostRecent | Self::Standalone
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Correlation {
    pub rule: CorrelationRule,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<String>,
}

impl Correlation {
    #[must_use]
    pub fn new(rule: CorrelationRule) -> Self {
        Self {
            rule,
            note: None,
            candidates: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub event_id: EventId,
    pub case_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_hint: Option<String>,
    pub event_type: EventType,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub activity: String,
    pub resource: String,
    #[serde(default)]
    pub attributes: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_record_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub references: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<Correlation>,
}

impl Event {
    #[must_use]
    pub fn new(
        event_type: EventType,
        timestamp: OffsetDateTime,
        activity: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            case_id: None,
            case_hint: None,
            event_type,
            timestamp: timestamp.to_offset(time::UtcOffset::UTC),
            activity: activity.into(),
            resource: resource.into(),
            attributes: Payload::new(),
            parent: None,
            source_record_id: None,
            references: BTreeSet::new(),
            correlation: None,
        }
    }

    #[must_use]
    pub fn with_case_hint(mut self, case_id: impl Into<String>) -> Self {
        self.case_hint = Some(case_id.into());
        self
    }

    #[must_use]
    pub fn with_parent(mut self, parent_key: impl Into<String>) -> Self {
        self.parent = Some(parent_key.into());
        self
    }

    #[must_use]
    pub fn with_source_record_id(mut self, source_record_id: impl Into<String>) -> Self {
        self.source_record_id = Some(source_record_id.into());
        self
    }

    #[must_use]
    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.references.insert(reference.into());
        self
    }

    #[must_use]
    pub fn with_attributes(mut self, attributes: Payload) -> Self {
        self.attributes = attributes;
        self
    }

    /// Identity other events use to point at this one as a parent.
    #[must_use]
    pub fn key(&self) -> String {
        match &self.source_record_id {
            Some(source_id) => source_id.clone(),
            None => self.event_id.to_string(),
        }
    }

    #[must_use]
    pub fn date(&self) -> Date {
        self.timestamp.date()
    }

    /// Publishes the case id. A published case id is never reassigned.
    ///
    /// # Errors
    /// Returns [`TraceError::Validation`] when a different case id is already set.
    pub fn assign_case(
        &mut self,
        case_id: &str,
        correlation: Correlation,
    ) -> Result<(), TraceError> {
        match &self.case_id {
            Some(existing) if existing == case_id => Ok(()),
            Some(existing) => Err(TraceError::Validation(format!(
                "event {} already belongs to case {existing}; refusing reassignment to {case_id}",
                self.key()
            ))),
            None => {
                self.case_id = Some(case_id.to_string());
                self.correlation = Some(correlation);
                Ok(())
            }
        }
    }
}

/// Ordered events of one case.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trace {
    pub case_id: String,
    pub events: Vec<Event>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
}

impl Trace {
    /// Assembles a trace ordered by effective timestamp, with every child
    /// placed after its parent.
    ///
    /// The effective timestamp of an event is the later of its own timestamp
    /// and its parent's effective timestamp, so a child stamped before its
    /// parent (clock skew across sources) still sorts after it. Ties keep
    /// parent depth order, then input order.
    #[must_use]
    pub fn assemble(case_id: impl Into<String>, events: Vec<Event>) -> Self {
        let by_key: HashMap<String, usize> = events
            .iter()
            .enumerate()
            .map(|(index, event)| (event.key(), index))
            .collect();

        let mut resolved: Vec<Option<(OffsetDateTime, usize)>> = vec![None; events.len()];
        for index in 0..events.len() {
            resolve_effective(index, &events, &by_key, &mut resolved);
        }

        let mut order: Vec<(OffsetDateTime, usize, usize)> = resolved
            .iter()
            .enumerate()
            .map(|(index, slot)| {
                let (effective, depth) = slot.unwrap_or((events[index].timestamp, 0));
                (effective, depth, index)
            })
            .collect();
        order.sort();

        let mut slots: Vec<Option<Event>> = events.into_iter().map(Some).collect();
        let ordered: Vec<Event> = order
            .into_iter()
            .filter_map(|(_, _, index)| slots[index].take())
            .collect();

        let outcome = ordered
            .iter()
            .rev()
            .find_map(|event| event.attributes.get_str("outcome").map(str::to_string));

        Self {
            case_id: case_id.into(),
            events: ordered,
            outcome,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn activities(&self) -> impl Iterator<Item = &str> + '_ {
        self.events.iter().map(|event| event.activity.as_str())
    }

    #[must_use]
    pub fn count_of(&self, event_type: EventType) -> usize {
        self.events
            .iter()
            .filter(|event| event.event_type == event_type)
            .count()
    }
}

fn resolve_effective(
    index: usize,
    events: &[Event],
    by_key: &HashMap<String, usize>,
    resolved: &mut [Option<(OffsetDateTime, usize)>],
) {
    // Iterative walk up the parent chain; a visited set breaks reference cycles.
    let mut chain = vec![index];
    let mut visiting = std::collections::HashSet::from([index]);
    let mut cursor = index;
    let mut base: Option<(OffsetDateTime, usize)> = None;

    loop {
        if let Some(done) = resolved[cursor] {
            chain.pop();
            base = Some(done);
            break;
        }
        let parent_index = events[cursor]
            .parent
            .as_ref()
            .and_then(|key| by_key.get(key))
            .copied()
            .filter(|candidate| *candidate != cursor);
        match parent_index {
            Some(parent) if visiting.insert(parent) => {
                chain.push(parent);
                cursor = parent;
            }
            _ => break,
        }
    }

    for &member in chain.iter().rev() {
        let own = events[member].timestamp;
        let value = match base {
            Some((parent_effective, parent_depth)) => {
                (own.max(parent_effective), parent_depth + 1)
            }
            None => (own, 0),
        };
        resolved[member] = Some(value);
        base = Some(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_rfc3339_utc;

    fn must_utc(value: &str) -> OffsetDateTime {
        match parse_rfc3339_utc(value) {
            Ok(parsed) => parsed,
            Err(err) => panic!("invalid fixture timestamp: {err}"),
        }
    }

    fn fixture(activity: &str, at: &str) -> Event {
        Event::new(EventType::PipelineActivity, must_utc(at), activity, "tester")
            .with_source_record_id(activity)
    }

    #[test]
    fn event_type_wire_names_round_trip() {
        for event_type in EventType::ALL {
            assert_eq!(EventType::parse(event_type.as_str()), Some(event_type));
        }
        assert_eq!(EventType::parse("nope"), None);
    }

    #[test]
    fn case_id_is_never_reassigned() {
        let mut event = fixture("a", "2025-12-02T10:00:00Z");
        let first = event.assign_case("case-1", Correlation::new(CorrelationRule::ExplicitCase));
        assert!(first.is_ok());
        let again = event.assign_case("case-1", Correlation::new(CorrelationRule::BackReference));
        assert!(again.is_ok());
        let other = event.assign_case("case-2", Correlation::new(CorrelationRule::ExplicitCase));
        assert!(matches!(other, Err(TraceError::Validation(_))));
        assert_eq!(event.case_id.as_deref(), Some("case-1"));
        assert_eq!(
            event.correlation.map(|item| item.rule),
            Some(CorrelationRule::ExplicitCase)
        );
    }

    #[test]
    fn assemble_orders_by_timestamp() {
        let trace = Trace::assemble(
            "c",
            vec![
                fixture("c", "2025-12-02T10:02:00Z"),
                fixture("a", "2025-12-02T10:00:00Z"),
                fixture("b", "2025-12-02T10:01:00Z"),
            ],
        );
        assert_eq!(trace.activities().collect::<Vec<_>>(), vec!["a", "b", "c"]);
    }

    #[test]
    fn child_with_skewed_clock_never_precedes_parent() {
        let parent = fixture("parent", "2025-12-02T10:05:00Z");
        let child = fixture("child", "2025-12-02T10:00:00Z").with_parent("parent");
        let sibling = fixture("sibling", "2025-12-02T10:03:00Z");

        let trace = Trace::assemble("c", vec![child, sibling, parent]);
        assert_eq!(
            trace.activities().collect::<Vec<_>>(),
            vec!["sibling", "parent", "child"]
        );
        for pair in trace.events.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp || pair[1].parent.is_some());
        }
    }

    #[test]
    fn equal_timestamps_put_parent_first() {
        let child = fixture("child", "2025-12-02T10:00:00Z").with_parent("parent");
        let parent = fixture("parent", "2025-12-02T10:00:00Z");

        let trace = Trace::assemble("c", vec![child, parent]);
        assert_eq!(
            trace.activities().collect::<Vec<_>>(),
            vec!["parent", "child"]
        );
    }

    #[test]
    fn parent_cycles_do_not_hang() {
        let a = fixture("a", "2025-12-02T10:00:00Z").with_parent("b");
        let b = fixture("b", "2025-12-02T10:01:00Z").with_parent("a");
        let trace = Trace::assemble("c", vec![a, b]);
        assert_eq!(trace.len(), 2);
    }

    #[test]
    fn outcome_comes_from_last_labelled_event() {
        let mut first = fixture("a", "2025-12-02T10:00:00Z");
        first.attributes.insert("outcome", "failed");
        let mut last = fixture("b", "2025-12-02T10:01:00Z");
        last.attributes.insert("outcome", "merged");

        let trace = Trace::assemble("c", vec![last, first]);
        assert_eq!(trace.outcome.as_deref(), Some("merged"));
    }
}
