use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{
    backpropagate, now_utc, plan_local_reward, Payload, RewardAssignment, RewardCorrection,
    RewardState, TraceError, Triplet, TripletId,
};

/// Storage contract for (state, action, reward) decision points.
///
/// `record` and both reward operations are atomic per `sequence_id`.
pub trait TripletStore {
    #[allow(clippy::missing_errors_doc)]
    fn record(
        &self,
        sequence_id: &str,
        state: Payload,
        action: Payload,
    ) -> Result<TripletId, TraceError>;

    #[allow(clippy::missing_errors_doc)]
    fn assign_reward(
        &self,
        triplet_id: TripletId,
        reward: f64,
        source: &str,
    ) -> Result<RewardAssignment, TraceError>;

    #[allow(clippy::missing_errors_doc)]
    fn assign_sequence_reward(
        &self,
        sequence_id: &str,
        reward: f64,
        source: &str,
    ) -> Result<usize, TraceError>;

    #[allow(clippy::missing_errors_doc)]
    fn get_sequence(&self, sequence_id: &str) -> Result<Vec<Triplet>, TraceError>;

    #[allow(clippy::missing_errors_doc)]
    fn get_triplet(&self, triplet_id: TripletId) -> Result<Triplet, TraceError>;

    #[allow(clippy::missing_errors_doc)]
    fn reward_history(&self, triplet_id: TripletId) -> Result<Vec<RewardCorrection>, TraceError> {
        Ok(self.get_triplet(triplet_id)?.corrections)
    }
}

#[derive(Debug, Default)]
struct SequenceLog {
    triplets: Vec<Triplet>,
}

/// In-process triplet store with one lock per sequence.
#[derive(Debug, Default)]
pub struct MemoryTripletStore {
    sequences: DashMap<String, Arc<Mutex<SequenceLog>>>,
    locations: DashMap<TripletId, String>,
}

impl MemoryTripletStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn sequence_count(&self) -> usize {
        self.sequences.len()
    }

    fn sequence(&self, sequence_id: &str) -> Result<Arc<Mutex<SequenceLog>>, TraceError> {
        self.sequences
            .get(sequence_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TraceError::NotFound(format!("sequence_id {sequence_id}")))
    }
}

impl TripletStore for MemoryTripletStore {
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

        // Clone the handle out so the map shard is released before locking.
        let log = Arc::clone(
            self.sequences
                .entry(sequence_id.to_string())
                .or_default()
                .value(),
        );

        let mut guard = log.lock();
        let triplet_id = TripletId::new();
        let sequence_index = guard.triplets.len() as u64;
        guard.triplets.push(Triplet {
            triplet_id,
            sequence_id: sequence_id.to_string(),
            sequence_index,
            state,
            action,
            reward: RewardState::Unassigned,
            corrections: Vec::new(),
            created_at: now_utc(),
        });
        self.locations.insert(triplet_id, sequence_id.to_string());
        drop(guard);

        debug!(event = "triplet_recorded", %triplet_id, sequence_id, sequence_index);
        Ok(triplet_id)
    }

    fn assign_reward(
        &self,
        triplet_id: TripletId,
        reward: f64,
        source: &str,
    ) -> Result<RewardAssignment, TraceError> {
        crate::validate_reward(reward)?;
        let sequence_id = self
            .locations
            .get(&triplet_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TraceError::NotFound(format!("triplet_id {triplet_id}")))?;

        let log = self.sequence(&sequence_id)?;
        let mut guard = log.lock();
        let Some(triplet) = guard
            .triplets
            .iter_mut()
            .find(|item| item.triplet_id == triplet_id)
        else {
            return Err(TraceError::NotFound(format!("triplet_id {triplet_id}")));
        };

        let (next, correction, outcome) =
            plan_local_reward(&triplet.reward, reward, source, now_utc())?;
        triplet.reward = next;
        if let Some(correction) = correction {
            info!(
                event = "reward_corrected",
                %triplet_id,
                previous = ?correction.previous.value(),
                value = reward,
                source
            );
            triplet.corrections.push(correction);
        }

        Ok(outcome)
    }

    fn assign_sequence_reward(
        &self,
        sequence_id: &str,
        reward: f64,
        source: &str,
    ) -> Result<usize, TraceError> {
        crate::validate_reward(reward)?;
        let log = self.sequence(sequence_id)?;
        let mut guard = log.lock();

        let updates = backpropagate(&guard.triplets, reward, source, now_utc())?;
        let updated = updates.len();
        for (triplet_id, state) in updates {
            if let Some(triplet) = guard
                .triplets
                .iter_mut()
                .find(|item| item.triplet_id == triplet_id)
            {
                triplet.reward = state;
            }
        }
        drop(guard);

        debug!(event = "sequence_reward_backpropagated", sequence_id, updated, source);
        Ok(updated)
    }

    fn get_sequence(&self, sequence_id: &str) -> Result<Vec<Triplet>, TraceError> {
        let log = self.sequence(sequence_id)?;
        let guard = log.lock();
        Ok(guard.triplets.clone())
    }

    fn get_triplet(&self, triplet_id: TripletId) -> Result<Triplet, TraceError> {
        let sequence_id = self
            .locations
            .get(&triplet_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TraceError::NotFound(format!("triplet_id {triplet_id}")))?;
        let log = self.sequence(&sequence_id)?;
        let guard = log.lock();
        guard
            .triplets
            .iter()
            .find(|item| item.triplet_id == triplet_id)
            .cloned()
            .ok_or_else(|| TraceError::NotFound(format!("triplet_id {triplet_id}")))
    }
}
