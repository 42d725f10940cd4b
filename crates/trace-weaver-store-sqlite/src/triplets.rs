use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use trace_weaver_core::{
    backpropagate, now_utc, parse_rfc3339_utc, plan_local_reward, validate_reward, Payload,
    RewardAssignment, RewardCorrection, RewardState, TraceError, Triplet, TripletId,
    TripletStore,
};
use tracing::info;

use crate::{
    collect_rows, invalid_column, migrate_connection, open_connection, storage_error,
    timestamp_text, to_sql_error,
};

const TRIPLET_COLUMNS: &str = "triplet_id, sequence_id, sequence_index, state_json, action_json, \
     reward_kind, reward, reward_source, reward_assigned_at, created_at";

/// Durable [`TripletStore`]. Every write runs in a `BEGIN IMMEDIATE`
/// transaction, so concurrent writers on other connections serialize on the
/// database lock and wait out the busy timeout.
pub struct SqliteTripletStore {
    conn: Connection,
}

impl SqliteTripletStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: open_connection(path)?,
        })
    }

    pub fn migrate(&self) -> Result<()> {
        migrate_connection(&self.conn)
    }

    fn write_tx(&self) -> Result<Transaction<'_>> {
        Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("failed to start triplet transaction")
    }

    fn record_durable(&self, sequence_id: &str, state: &Payload, action: &Payload) -> Result<TripletId> {
        let tx = self.write_tx()?;
        let sequence_index: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(sequence_index) + 1, 0) FROM triplets WHERE sequence_id = ?1",
                params![sequence_id],
                |row| row.get(0),
            )
            .context("failed to read next sequence_index")?;

        let triplet_id = TripletId::new();
        tx.execute(
            "INSERT INTO triplets(
                triplet_id, sequence_id, sequence_index, state_json, action_json,
                reward_kind, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, 'unassigned', ?6)",
            params![
                triplet_id.to_string(),
                sequence_id,
                sequence_index,
                serde_json::to_string(state).context("failed to serialize state")?,
                serde_json::to_string(action).context("failed to serialize action")?,
                timestamp_text(now_utc())?,
            ],
        )
        .context("failed to insert triplet")?;
        tx.commit().context("failed to commit triplet transaction")?;

        Ok(triplet_id)
    }

    fn assign_durable(&self, triplet_id: TripletId, reward: f64, source: &str) -> Result<RewardAssignment> {
        let tx = self.write_tx()?;
        let current = find_triplet(&tx, triplet_id)?
            .ok_or_else(|| TraceError::NotFound(format!("triplet_id {triplet_id}")))?;

        let (next, correction, outcome) = plan_local_reward(&current.reward, reward, source, now_utc())?;
        if outcome == RewardAssignment::Unchanged {
            return Ok(outcome);
        }

        // The audit row must exist before the reward columns change.
        if let Some(correction) = &correction {
            insert_correction(&tx, triplet_id, correction)?;
        }
        write_reward(&tx, triplet_id, &next)?;
        tx.commit().context("failed to commit reward transaction")?;

        Ok(outcome)
    }

    fn backprop_durable(&self, sequence_id: &str, reward: f64, source: &str) -> Result<usize> {
        let tx = self.write_tx()?;
        let snapshot = load_sequence(&tx, sequence_id)?;
        if snapshot.is_empty() {
            return Err(TraceError::NotFound(format!("sequence_id {sequence_id}")).into());
        }

        let updates = backpropagate(&snapshot, reward, source, now_utc())?;
        for (triplet_id, state) in &updates {
            write_reward(&tx, *triplet_id, state)?;
        }
        tx.commit().context("failed to commit sequence reward transaction")?;

        info!(
            event = "sequence_reward_assigned",
            sequence_id,
            updated = updates.len(),
            skipped = snapshot.len() - updates.len()
        );
        Ok(updates.len())
    }

    fn sequence_with_history(&self, sequence_id: &str) -> Result<Vec<Triplet>> {
        let mut triplets = load_sequence(&self.conn, sequence_id)?;
        if triplets.is_empty() {
            return Err(TraceError::NotFound(format!("sequence_id {sequence_id}")).into());
        }

        let mut stmt = self
            .conn
            .prepare(
                "SELECT c.triplet_id, c.previous_json, c.value, c.source, c.corrected_at
                 FROM reward_corrections c
                 JOIN triplets t ON t.triplet_id = c.triplet_id
                 WHERE t.sequence_id = ?1
                 ORDER BY c.correction_seq ASC",
            )
            .context("failed to prepare correction query")?;
        let rows = stmt
            .query_map(params![sequence_id], parse_correction_row)
            .context("failed to query corrections")?;

        let mut by_triplet: BTreeMap<String, Vec<RewardCorrection>> = BTreeMap::new();
        for (triplet_id, correction) in collect_rows(rows)? {
            by_triplet.entry(triplet_id).or_default().push(correction);
        }
        for triplet in &mut triplets {
            if let Some(corrections) = by_triplet.remove(&triplet.triplet_id.to_string()) {
                triplet.corrections = corrections;
            }
        }
        Ok(triplets)
    }

    fn triplet_with_history(&self, triplet_id: TripletId) -> Result<Triplet> {
        let mut triplet = find_triplet(&self.conn, triplet_id)?
            .ok_or_else(|| TraceError::NotFound(format!("triplet_id {triplet_id}")))?;
        triplet.corrections = self.corrections_of(triplet_id)?;
        Ok(triplet)
    }

    fn corrections_of(&self, triplet_id: TripletId) -> Result<Vec<RewardCorrection>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT triplet_id, previous_json, value, source, corrected_at
                 FROM reward_corrections
                 WHERE triplet_id = ?1
                 ORDER BY correction_seq ASC",
            )
            .context("failed to prepare correction query")?;
        let rows = stmt
            .query_map(params![triplet_id.to_string()], parse_correction_row)
            .context("failed to query corrections")?;
        Ok(collect_rows(rows)?
            .into_iter()
            .map(|(_, correction)| correction)
            .collect())
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl TripletStore for SqliteTripletStore {
    fn record(
        &self,
        sequence_id: &str,
        state: Payload,
        action: Payload,
    ) -> Result<TripletId, TraceError> {
        if sequence_id.trim().is_empty() {
            return Err(TraceError::Validation(
                "sequence_id MUST be non-empty".to_string(),
            ));
        }
        state.validate()?;
        action.validate()?;

        self.record_durable(sequence_id, &state, &action)
            .map_err(storage_error)
    }

    fn assign_reward(
        &self,
        triplet_id: TripletId,
        reward: f64,
        source: &str,
    ) -> Result<RewardAssignment, TraceError> {
        validate_reward(reward)?;
        self.assign_durable(triplet_id, reward, source)
            .map_err(storage_error)
    }

    fn assign_sequence_reward(
        &self,
        sequence_id: &str,
        reward: f64,
        source: &str,
    ) -> Result<usize, TraceError> {
        validate_reward(reward)?;
        self.backprop_durable(sequence_id, reward, source)
            .map_err(storage_error)
    }

    fn get_sequence(&self, sequence_id: &str) -> Result<Vec<Triplet>, TraceError> {
        self.sequence_with_history(sequence_id)
            .map_err(storage_error)
    }

    fn get_triplet(&self, triplet_id: TripletId) -> Result<Triplet, TraceError> {
        self.triplet_with_history(triplet_id)
            .map_err(storage_error)
    }

    fn reward_history(&self, triplet_id: TripletId) -> Result<Vec<RewardCorrection>, TraceError> {
        self.triplet_with_history(triplet_id)
            .map(|triplet| triplet.corrections)
            .map_err(storage_error)
    }
}

fn find_triplet(conn: &Connection, triplet_id: TripletId) -> Result<Option<Triplet>> {
    conn.query_row(
        &format!("SELECT {TRIPLET_COLUMNS} FROM triplets WHERE triplet_id = ?1"),
        params![triplet_id.to_string()],
        parse_triplet_row,
    )
    .optional()
    .context("failed to load triplet")
}

fn load_sequence(conn: &Connection, sequence_id: &str) -> Result<Vec<Triplet>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {TRIPLET_COLUMNS} FROM triplets
             WHERE sequence_id = ?1
             ORDER BY sequence_index ASC"
        ))
        .context("failed to prepare sequence query")?;
    let rows = stmt
        .query_map(params![sequence_id], parse_triplet_row)
        .context("failed to query sequence")?;
    collect_rows(rows)
}

fn write_reward(conn: &Connection, triplet_id: TripletId, state: &RewardState) -> Result<()> {
    let assigned_at = state.assigned_at().map(timestamp_text).transpose()?;
    conn.execute(
        "UPDATE triplets
         SET reward_kind = ?1, reward = ?2, reward_source = ?3, reward_assigned_at = ?4
         WHERE triplet_id = ?5",
        params![
            state.kind(),
            state.value(),
            state.source(),
            assigned_at,
            triplet_id.to_string()
        ],
    )
    .context("failed to write reward")?;
    Ok(())
}

fn insert_correction(conn: &Connection, triplet_id: TripletId, correction: &RewardCorrection) -> Result<()> {
    conn.execute(
        "INSERT INTO reward_corrections(triplet_id, previous_json, value, source, corrected_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            triplet_id.to_string(),
            serde_json::to_string(&correction.previous)
                .context("failed to serialize previous reward")?,
            correction.value,
            correction.source,
            timestamp_text(correction.corrected_at)?,
        ],
    )
    .context("failed to append reward correction")?;
    Ok(())
}

fn parse_triplet_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Triplet> {
    let triplet_id_raw: String = row.get(0)?;
    let sequence_index_raw: i64 = row.get(2)?;
    let state_json: String = row.get(3)?;
    let action_json: String = row.get(4)?;
    let reward_kind: String = row.get(5)?;
    let reward: Option<f64> = row.get(6)?;
    let reward_source: Option<String> = row.get(7)?;
    let reward_assigned_at: Option<String> = row.get(8)?;

    let triplet_id = TripletId::parse(&triplet_id_raw).map_err(|err| to_sql_error(0, &err))?;
    let sequence_index = u64::try_from(sequence_index_raw).map_err(|_| {
        invalid_column(
            2,
            Type::Integer,
            format!("invalid sequence_index: {sequence_index_raw}"),
        )
    })?;
    let state = Payload::from_json_str(&state_json).map_err(|err| to_sql_error(3, &err))?;
    let action = Payload::from_json_str(&action_json).map_err(|err| to_sql_error(4, &err))?;
    let assigned_at = reward_assigned_at
        .as_deref()
        .map(parse_rfc3339_utc)
        .transpose()
        .map_err(|err| to_sql_error(8, &err))?;

    let reward = match (reward_kind.as_str(), reward, reward_source, assigned_at) {
        ("unassigned", None, None, None) => RewardState::Unassigned,
        ("locally_assigned", Some(value), Some(source), Some(assigned_at)) => {
            RewardState::LocallyAssigned {
                value,
                source,
                assigned_at,
            }
        }
        ("backprop_assigned", Some(value), Some(source), Some(assigned_at)) => {
            RewardState::BackpropAssigned {
                value,
                source,
                assigned_at,
            }
        }
        _ => {
            return Err(invalid_column(
                5,
                Type::Text,
                format!("inconsistent reward columns for {reward_kind}"),
            ))
        }
    };

    Ok(Triplet {
        triplet_id,
        sequence_id: row.get(1)?,
        sequence_index,
        state,
        action,
        reward,
        corrections: Vec::new(),
        created_at: parse_rfc3339_utc(&row.get::<_, String>(9)?)
            .map_err(|err| to_sql_error(9, &err))?,
    })
}

fn parse_correction_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, RewardCorrection)> {
    let previous_json: String = row.get(1)?;
    let previous: RewardState = serde_json::from_str(&previous_json)
        .map_err(|err| invalid_column(1, Type::Text, format!("invalid previous_json: {err}")))?;

    Ok((
        row.get(0)?,
        RewardCorrection {
            previous,
            value: row.get(2)?,
            source: row.get(3)?,
            corrected_at: parse_rfc3339_utc(&row.get::<_, String>(4)?)
                .map_err(|err| to_sql_error(4, &err))?,
        },
    ))
}
