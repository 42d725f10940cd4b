use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use trace_weaver_core::{now_utc, parse_rfc3339_utc, Trace};
use trace_weaver_mining::{
    ConformanceChecker, ConformanceReport, GraphKind, GraphMiner, ProcessGraph, ReferenceModel,
};
use tracing::debug;

use crate::events::{load_traces_from, read_watermark};
use crate::{timestamp_text, SqliteTraceStore};

/// A graph or report derived from the event log, stamped with the event
/// watermark it was computed at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Derived<T> {
    pub cache_key: String,
    pub watermark: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub computed_at: OffsetDateTime,
    pub cached: bool,
    pub result: T,
}

impl SqliteTraceStore {
    /// Mines `kind` over the stored traces, serving the cached graph while
    /// no event has changed since it was computed.
    pub fn get_graph(&self, kind: GraphKind) -> Result<Derived<ProcessGraph>> {
        let cache_key = format!("graph:{kind}");
        let (watermark, traces) = self.snapshot()?;
        if let Some(hit) = cached(self.conn(), &cache_key, watermark)? {
            return Ok(hit);
        }

        let graph = GraphMiner::new().mine(kind, &traces)?;
        store(self.conn(), cache_key, watermark, graph, true)
    }

    /// Replays the stored traces against `model` within the configured
    /// deadline. Only complete reports are cached.
    pub fn get_conformance_report(
        &self,
        model: &ReferenceModel,
    ) -> Result<Derived<ConformanceReport>> {
        let checker = ConformanceChecker::new(model)?
            .with_deadline(self.config().replay_deadline());
        let cache_key = format!("conformance:{}", checker.fingerprint());
        let (watermark, traces) = self.snapshot()?;
        if let Some(hit) = cached(self.conn(), &cache_key, watermark)? {
            return Ok(hit);
        }

        let report = checker.check(&traces);
        let keep = !report.truncated;
        store(self.conn(), cache_key, watermark, report, keep)
    }

    /// Watermark and traces read inside one transaction so they agree.
    fn snapshot(&self) -> Result<(i64, Vec<Trace>)> {
        let tx = self
            .conn()
            .unchecked_transaction()
            .context("failed to start snapshot transaction")?;
        let watermark = read_watermark(&tx)?;
        let traces = load_traces_from(&tx)?;
        tx.commit().context("failed to close snapshot transaction")?;
        Ok((watermark, traces))
    }
}

fn cached<T: DeserializeOwned>(
    conn: &Connection,
    cache_key: &str,
    watermark: i64,
) -> Result<Option<Derived<T>>> {
    let row: Option<(i64, String, String)> = conn
        .query_row(
            "SELECT watermark, computed_at, payload_json FROM derived_cache WHERE cache_key = ?1",
            params![cache_key],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .context("failed to read derived cache")?;

    let Some((stored_watermark, computed_at, payload_json)) = row else {
        return Ok(None);
    };
    if stored_watermark != watermark {
        debug!(
            event = "derived_cache_stale",
            cache_key,
            stored_watermark,
            watermark
        );
        return Ok(None);
    }

    Ok(Some(Derived {
        cache_key: cache_key.to_string(),
        watermark,
        computed_at: parse_rfc3339_utc(&computed_at)?,
        cached: true,
        result: serde_json::from_str(&payload_json)
            .with_context(|| format!("failed to decode cached {cache_key}"))?,
    }))
}

fn store<T: Serialize>(
    conn: &Connection,
    cache_key: String,
    watermark: i64,
    result: T,
    keep: bool,
) -> Result<Derived<T>> {
    let computed_at = now_utc();
    if keep {
        conn.execute(
            "INSERT INTO derived_cache(cache_key, watermark, computed_at, payload_json)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(cache_key) DO UPDATE SET
               watermark = excluded.watermark,
               computed_at = excluded.computed_at,
               payload_json = excluded.payload_json",
            params![
                cache_key,
                watermark,
                timestamp_text(computed_at)?,
                serde_json::to_string(&result)
                    .with_context(|| format!("failed to encode {cache_key}"))?,
            ],
        )
        .context("failed to write derived cache")?;
    }

    Ok(Derived {
        cache_key,
        watermark,
        computed_at,
        cached: false,
        result,
    })
}
