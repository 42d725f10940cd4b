use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use trace_weaver_core::{
    now_utc, parse_rfc3339_utc, Correlation, Event, EventId, EventType, Payload, TraceError,
    Trace, WeaverConfig,
};
use trace_weaver_ingest::{Correlator, FinishReport, IngestPipeline, IngestReport, SourceAdapter};
use tracing::{debug, info};
use ulid::Ulid;

use crate::{
    collect_rows, invalid_column, migrate_connection, open_connection, timestamp_text,
    to_sql_error,
};

const EVENT_COLUMNS: &str = "event_seq, event_id, source_record_id, case_id, case_hint, \
     event_type, occurred_at, activity, resource, attributes_json, parent_key, \
     references_json, correlation_json, case_ordinal, recorded_at";

/// Event submitted directly, outside any source adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventInput {
    #[serde(default)]
    pub case_hint: Option<String>,
    pub event_type: EventType,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub activity: String,
    pub resource: String,
    #[serde(default)]
    pub attributes: Payload,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub source_record_id: Option<String>,
    #[serde(default)]
    pub references: BTreeSet<String>,
}

impl EventInput {
    /// # Errors
    /// Returns [`TraceError::Validation`] for blank identity fields or a
    /// non-finite attribute.
    pub fn validate(&self) -> Result<(), TraceError> {
        if self.activity.trim().is_empty() {
            return Err(TraceError::Validation(
                "activity MUST be non-empty".to_string(),
            ));
        }
        if self.resource.trim().is_empty() {
            return Err(TraceError::Validation(
                "resource MUST be non-empty".to_string(),
            ));
        }
        for (field, value) in [
            ("case_hint", &self.case_hint),
            ("parent", &self.parent),
            ("source_record_id", &self.source_record_id),
        ] {
            if value.as_deref().is_some_and(|raw| raw.trim().is_empty()) {
                return Err(TraceError::Validation(format!(
                    "{field} MUST be non-empty when present"
                )));
            }
        }
        self.attributes.validate()
    }

    #[must_use]
    pub fn into_event(self) -> Event {
        let mut event = Event::new(self.event_type, self.timestamp, self.activity, self.resource)
            .with_attributes(self.attributes);
        event.case_hint = self.case_hint;
        event.parent = self.parent;
        event.source_record_id = self.source_record_id;
        event.references = self.references;
        event
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Inserted { event_seq: i64, event_id: String },
    Duplicate { event_seq: i64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredEvent {
    pub event_seq: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_ordinal: Option<u64>,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    #[serde(flatten)]
    pub event: Event,
}

/// What one persistence pass did to the `events` table.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistReport {
    pub inserted: usize,
    pub backfilled: usize,
    pub reordered: usize,
    pub unchanged: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CorrelateReport {
    pub restored: usize,
    pub finish: FinishReport,
    pub persisted: PersistReport,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IngestSummary {
    pub restored: usize,
    pub report: IngestReport,
    pub persisted: PersistReport,
}

pub struct SqliteTraceStore {
    conn: Connection,
    config: WeaverConfig,
}

impl SqliteTraceStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: open_connection(path)?,
            config: WeaverConfig::default(),
        })
    }

    #[must_use]
    pub fn with_config(mut self, config: WeaverConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn config(&self) -> &WeaverConfig {
        &self.config
    }

    pub fn migrate(&self) -> Result<()> {
        migrate_connection(&self.conn)
    }

    /// Stores one event with no case. A key already present is reported as
    /// a duplicate and left untouched.
    pub fn submit_event(&mut self, input: &EventInput) -> Result<SubmitOutcome> {
        input
            .validate()
            .map_err(|err| anyhow!("event validation failed: {err}"))?;
        let event = input.clone().into_event();
        let recorded_at = timestamp_text(now_utc())?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start event transaction")?;

        let key = event.key();
        if let Some(event_seq) = find_event_seq(&tx, &key)? {
            debug!(event = "event_duplicate", event_key = key.as_str(), event_seq);
            return Ok(SubmitOutcome::Duplicate { event_seq });
        }

        let event_seq = insert_event(&tx, &event, None, &recorded_at)?;
        tx.commit().context("failed to commit event transaction")?;

        Ok(SubmitOutcome::Inserted {
            event_seq,
            event_id: event.event_id.to_string(),
        })
    }

    /// Events in insertion order, optionally limited to one case.
    pub fn list_events(&self, case_id: Option<&str>) -> Result<Vec<StoredEvent>> {
        match case_id {
            Some(case_id) => {
                let mut stmt = self
                    .conn
                    .prepare(&format!(
                        "SELECT {EVENT_COLUMNS} FROM events
                         WHERE case_id = ?1
                         ORDER BY case_ordinal ASC, event_seq ASC"
                    ))
                    .context("failed to prepare case event query")?;
                let rows = stmt
                    .query_map(params![case_id], parse_event_row)
                    .context("failed to query case events")?;
                collect_rows(rows)
            }
            None => {
                let mut stmt = self
                    .conn
                    .prepare(&format!(
                        "SELECT {EVENT_COLUMNS} FROM events ORDER BY event_seq ASC"
                    ))
                    .context("failed to prepare event query")?;
                let rows = stmt
                    .query_map([], parse_event_row)
                    .context("failed to query events")?;
                collect_rows(rows)
            }
        }
    }

    pub fn load_events(&self) -> Result<Vec<Event>> {
        Ok(self
            .list_events(None)?
            .into_iter()
            .map(|stored| stored.event)
            .collect())
    }

    /// Correlated events grouped into traces, ordered by case id.
    pub fn load_traces(&self) -> Result<Vec<Trace>> {
        load_traces_from(&self.conn)
    }

    /// Counter bumped by every event insert and every case assignment or reorder.
    pub fn event_watermark(&self) -> Result<i64> {
        read_watermark(&self.conn)
    }

    /// Resolves every stored event without a case and writes the assignments back.
    pub fn correlate(&mut self) -> Result<CorrelateReport> {
        let correlator = Correlator::new();
        let restored = correlator.restore(self.load_events()?)?;
        let finish = correlator.finish()?;
        let persisted = self.persist_traces(&correlator.traces())?;

        info!(
            event = "correlate_completed",
            resolved = finish.resolved,
            backfilled = persisted.backfilled,
        );
        Ok(CorrelateReport {
            restored,
            finish,
            persisted,
        })
    }

    /// Runs the ingest pipeline on top of the stored history and persists the result.
    pub fn ingest(&mut self, adapters: &[&dyn SourceAdapter]) -> Result<IngestSummary> {
        let correlator = Correlator::new();
        let restored = correlator.restore(self.load_events()?)?;
        let report = IngestPipeline::new(&self.config).run(adapters, &correlator)?;
        let persisted = self.persist_traces(&correlator.traces())?;

        info!(
            event = "ingest_persisted",
            restored,
            inserted = persisted.inserted,
            backfilled = persisted.backfilled,
        );
        Ok(IngestSummary {
            restored,
            report,
            persisted,
        })
    }

    /// Writes correlated traces: new events are inserted, stored events
    /// without a case are backfilled, and ordinals follow the trace order.
    pub fn persist_traces(&mut self, traces: &[Trace]) -> Result<PersistReport> {
        let recorded_at = timestamp_text(now_utc())?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start persist transaction")?;

        let mut report = PersistReport::default();
        for trace in traces {
            for (ordinal, event) in trace.events.iter().enumerate() {
                let ordinal = i64::try_from(ordinal).context("case ordinal overflow")?;
                let key = event.key();
                let existing: Option<(i64, Option<String>, Option<i64>)> = tx
                    .query_row(
                        "SELECT event_seq, case_id, case_ordinal FROM events WHERE event_key = ?1",
                        params![key],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )
                    .optional()
                    .context("failed to look up stored event")?;

                match existing {
                    None => {
                        if event.case_id.as_deref() != Some(trace.case_id.as_str()) {
                            return Err(anyhow!(
                                "event {key} is not placed in case {}",
                                trace.case_id
                            ));
                        }
                        insert_event(&tx, event, Some(ordinal), &recorded_at)?;
                        report.inserted += 1;
                    }
                    Some((event_seq, None, _)) => {
                        tx.execute(
                            "UPDATE events
                             SET case_id = ?1, case_ordinal = ?2, correlation_json = ?3
                             WHERE event_seq = ?4",
                            params![
                                trace.case_id,
                                ordinal,
                                correlation_json(event.correlation.as_ref())?,
                                event_seq
                            ],
                        )
                        .context("failed to backfill event case")?;
                        report.backfilled += 1;
                    }
                    Some((event_seq, Some(stored_case), current)) if stored_case == trace.case_id => {
                        if current == Some(ordinal) {
                            report.unchanged += 1;
                        } else {
                            tx.execute(
                                "UPDATE events SET case_ordinal = ?1 WHERE event_seq = ?2",
                                params![ordinal, event_seq],
                            )
                            .context("failed to reorder event")?;
                            report.reordered += 1;
                        }
                    }
                    Some((_, Some(stored_case), _)) => {
                        return Err(anyhow!(
                            "event {key} is stored under case {stored_case}; refusing reassignment to {}",
                            trace.case_id
                        ));
                    }
                }
            }
        }

        tx.commit().context("failed to commit persist transaction")?;
        Ok(report)
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }
}

pub(crate) fn read_watermark(conn: &Connection) -> Result<i64> {
    conn.query_row(
        "SELECT revision FROM event_watermark WHERE id = 1",
        [],
        |row| row.get(0),
    )
    .context("failed to read event watermark")
}

pub(crate) fn load_traces_from(conn: &Connection) -> Result<Vec<Trace>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE case_id IS NOT NULL
             ORDER BY case_id ASC, case_ordinal ASC, event_seq ASC"
        ))
        .context("failed to prepare trace query")?;
    let rows = stmt
        .query_map([], parse_event_row)
        .context("failed to query traces")?;

    let mut cases: BTreeMap<String, Vec<Event>> = BTreeMap::new();
    for stored in collect_rows(rows)? {
        if let Some(case_id) = stored.event.case_id.clone() {
            cases.entry(case_id).or_default().push(stored.event);
        }
    }

    Ok(cases
        .into_iter()
        .map(|(case_id, events)| Trace::assemble(case_id, events))
        .collect())
}

fn find_event_seq(conn: &Connection, key: &str) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT event_seq FROM events WHERE event_key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
    .context("failed to look up event key")
}

fn insert_event(
    conn: &Connection,
    event: &Event,
    case_ordinal: Option<i64>,
    recorded_at: &str,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO events(
            event_id, event_key, source_record_id, case_hint, event_type,
            occurred_at, activity, resource, attributes_json, parent_key,
            references_json, recorded_at, case_id, case_ordinal, correlation_json
         ) VALUES (
            ?1, ?2, ?3, ?4, ?5,
            ?6, ?7, ?8, ?9, ?10,
            ?11, ?12, ?13, ?14, ?15
         )",
        params![
            event.event_id.to_string(),
            event.key(),
            event.source_record_id,
            event.case_hint,
            event.event_type.as_str(),
            timestamp_text(event.timestamp)?,
            event.activity,
            event.resource,
            serde_json::to_string(&event.attributes).context("failed to serialize attributes")?,
            event.parent,
            serde_json::to_string(&event.references).context("failed to serialize references")?,
            recorded_at,
            event.case_id,
            case_ordinal,
            correlation_json(event.correlation.as_ref())?,
        ],
    )
    .context("failed to append event")?;

    Ok(conn.last_insert_rowid())
}

fn correlation_json(correlation: Option<&Correlation>) -> Result<Option<String>> {
    correlation
        .map(|value| serde_json::to_string(value).context("failed to serialize correlation"))
        .transpose()
}

fn parse_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredEvent> {
    let event_id_raw: String = row.get(1)?;
    let event_type_raw: String = row.get(5)?;
    let attributes_json: String = row.get(9)?;
    let references_json: String = row.get(11)?;
    let correlation_raw: Option<String> = row.get(12)?;
    let case_ordinal_raw: Option<i64> = row.get(13)?;

    let event_id = Ulid::from_string(&event_id_raw)
        .map(EventId)
        .map_err(|_| invalid_column(1, Type::Text, format!("invalid event_id ULID: {event_id_raw}")))?;
    let event_type = EventType::parse(&event_type_raw).ok_or_else(|| {
        invalid_column(5, Type::Text, format!("invalid event_type: {event_type_raw}"))
    })?;
    let timestamp =
        parse_rfc3339_utc(&row.get::<_, String>(6)?).map_err(|err| to_sql_error(6, &err))?;
    let attributes: Payload = serde_json::from_str(&attributes_json)
        .map_err(|err| invalid_column(9, Type::Text, format!("invalid attributes_json: {err}")))?;
    let references: BTreeSet<String> = serde_json::from_str(&references_json)
        .map_err(|err| invalid_column(11, Type::Text, format!("invalid references_json: {err}")))?;
    let correlation = correlation_raw
        .as_deref()
        .map(|raw| {
            serde_json::from_str::<Correlation>(raw).map_err(|err| {
                invalid_column(12, Type::Text, format!("invalid correlation_json: {err}"))
            })
        })
        .transpose()?;
    let case_ordinal = case_ordinal_raw
        .map(|raw| {
            u64::try_from(raw)
                .map_err(|_| invalid_column(13, Type::Integer, format!("invalid case_ordinal: {raw}")))
        })
        .transpose()?;
    let recorded_at =
        parse_rfc3339_utc(&row.get::<_, String>(14)?).map_err(|err| to_sql_error(14, &err))?;

    Ok(StoredEvent {
        event_seq: row.get(0)?,
        case_ordinal,
        recorded_at,
        event: Event {
            event_id,
            case_id: row.get(3)?,
            case_hint: row.get(4)?,
            event_type,
            timestamp,
            activity: row.get(7)?,
            resource: row.get(8)?,
            attributes,
            parent: row.get(10)?,
            source_record_id: row.get(2)?,
            references,
            correlation,
        },
    })
}
