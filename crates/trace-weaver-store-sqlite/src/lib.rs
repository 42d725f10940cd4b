#![forbid(unsafe_code)]
#![allow(clippy::missing_errors_doc)]

//! Durable SQLite storage for events and triplets, plus the query facade
//! that serves cached graphs and conformance reports.

mod derived;
mod events;
mod triplets;

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use trace_weaver_core::{format_rfc3339, now_utc, TraceError};

pub use derived::Derived;
pub use events::{
    CorrelateReport, EventInput, IngestSummary, PersistReport, SqliteTraceStore, StoredEvent,
    SubmitOutcome,
};
pub use triplets::SqliteTripletStore;

const SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  event_key TEXT NOT NULL UNIQUE,
  source_record_id TEXT UNIQUE,
  case_hint TEXT,
  event_type TEXT NOT NULL,
  occurred_at TEXT NOT NULL,
  activity TEXT NOT NULL CHECK (length(activity) > 0),
  resource TEXT NOT NULL CHECK (length(resource) > 0),
  attributes_json TEXT NOT NULL DEFAULT '{}',
  parent_key TEXT,
  references_json TEXT NOT NULL DEFAULT '[]',
  recorded_at TEXT NOT NULL,
  case_id TEXT,
  case_ordinal INTEGER CHECK (case_ordinal IS NULL OR case_ordinal >= 0),
  correlation_json TEXT
);

CREATE INDEX IF NOT EXISTS idx_events_case_ordinal ON events(case_id, case_ordinal);

CREATE TRIGGER IF NOT EXISTS trg_events_no_delete
BEFORE DELETE ON events
BEGIN
  SELECT RAISE(FAIL, 'events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_events_content_immutable
BEFORE UPDATE OF event_seq, event_id, event_key, source_record_id, case_hint, event_type,
  occurred_at, activity, resource, attributes_json, parent_key, references_json, recorded_at
ON events
BEGIN
  SELECT RAISE(FAIL, 'events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_events_case_assigned_once
BEFORE UPDATE OF case_id, correlation_json ON events
WHEN OLD.case_id IS NOT NULL
  AND (NEW.case_id IS NOT OLD.case_id OR NEW.correlation_json IS NOT OLD.correlation_json)
BEGIN
  SELECT RAISE(FAIL, 'events case_id is never reassigned');
END;

CREATE TABLE IF NOT EXISTS event_watermark (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  revision INTEGER NOT NULL
);

INSERT OR IGNORE INTO event_watermark(id, revision) VALUES (1, 0);

CREATE TRIGGER IF NOT EXISTS trg_events_watermark_insert
AFTER INSERT ON events
BEGIN
  UPDATE event_watermark SET revision = revision + 1 WHERE id = 1;
END;

CREATE TRIGGER IF NOT EXISTS trg_events_watermark_case
AFTER UPDATE OF case_id, case_ordinal ON events
BEGIN
  UPDATE event_watermark SET revision = revision + 1 WHERE id = 1;
END;

CREATE TABLE IF NOT EXISTS triplets (
  triplet_id TEXT PRIMARY KEY,
  sequence_id TEXT NOT NULL CHECK (length(sequence_id) > 0),
  sequence_index INTEGER NOT NULL CHECK (sequence_index >= 0),
  state_json TEXT NOT NULL,
  action_json TEXT NOT NULL,
  reward_kind TEXT NOT NULL CHECK (
    reward_kind IN ('unassigned', 'locally_assigned', 'backprop_assigned')
  ),
  reward REAL CHECK (reward IS NULL OR reward BETWEEN 0.0 AND 1.0),
  reward_source TEXT,
  reward_assigned_at TEXT,
  created_at TEXT NOT NULL,
  UNIQUE(sequence_id, sequence_index)
);

CREATE TRIGGER IF NOT EXISTS trg_triplets_identity_immutable
BEFORE UPDATE OF triplet_id, sequence_id, sequence_index, state_json, action_json, created_at
ON triplets
BEGIN
  SELECT RAISE(FAIL, 'triplet identity is immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_triplets_no_delete
BEFORE DELETE ON triplets
BEGIN
  SELECT RAISE(FAIL, 'triplets is append-only');
END;

CREATE TABLE IF NOT EXISTS reward_corrections (
  correction_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  triplet_id TEXT NOT NULL,
  previous_json TEXT NOT NULL,
  value REAL NOT NULL CHECK (value BETWEEN 0.0 AND 1.0),
  source TEXT NOT NULL,
  corrected_at TEXT NOT NULL,
  FOREIGN KEY (triplet_id) REFERENCES triplets(triplet_id)
);

CREATE INDEX IF NOT EXISTS idx_reward_corrections_triplet
  ON reward_corrections(triplet_id, correction_seq);

CREATE TRIGGER IF NOT EXISTS trg_reward_corrections_no_update
BEFORE UPDATE ON reward_corrections
BEGIN
  SELECT RAISE(FAIL, 'reward_corrections is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_reward_corrections_no_delete
BEFORE DELETE ON reward_corrections
BEGIN
  SELECT RAISE(FAIL, 'reward_corrections is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_triplets_reward_audited
BEFORE UPDATE OF reward_kind, reward, reward_source, reward_assigned_at ON triplets
WHEN OLD.reward_kind <> 'unassigned'
  AND NOT EXISTS (
    SELECT 1 FROM reward_corrections
    WHERE triplet_id = OLD.triplet_id
      AND value = NEW.reward
      AND source = NEW.reward_source
      AND corrected_at = NEW.reward_assigned_at
  )
BEGIN
  SELECT RAISE(FAIL, 'assigned rewards change only through a recorded correction');
END;

CREATE TABLE IF NOT EXISTS derived_cache (
  cache_key TEXT PRIMARY KEY,
  watermark INTEGER NOT NULL,
  computed_at TEXT NOT NULL,
  payload_json TEXT NOT NULL
);
";

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to configure sqlite pragmas")?;

    Ok(conn)
}

fn migrate_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )
    .context("failed to ensure schema_migrations exists")?;

    conn.execute_batch(SCHEMA_V1)
        .context("failed to apply trace-weaver schema")?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![SCHEMA_VERSION, timestamp_text(now_utc())?],
    )
    .context("failed to register schema migration")?;

    Ok(())
}

fn timestamp_text(value: time::OffsetDateTime) -> Result<String> {
    format_rfc3339(value).context("failed to format timestamp")
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

fn invalid_column(
    index: usize,
    kind: rusqlite::types::Type,
    message: impl Into<String>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        kind,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message.into(),
        )),
    )
}

fn to_sql_error(index: usize, err: &TraceError) -> rusqlite::Error {
    invalid_column(index, rusqlite::types::Type::Text, err.to_string())
}

/// Keeps contract errors intact across the trait boundary; anything else is storage.
fn storage_error(err: anyhow::Error) -> TraceError {
    match err.downcast::<TraceError>() {
        Ok(contract) => contract,
        Err(other) => TraceError::Storage(format!("{other:#}")),
    }
}

#[cfg(test)]
fn temp_db_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!(
        "trace-weaver-{name}-{}.sqlite3",
        ulid::Ulid::new()
    ))
}
