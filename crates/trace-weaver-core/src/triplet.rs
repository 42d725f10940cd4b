use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::{Payload, TraceError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TripletId(pub Ulid);

impl TripletId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parses a ULID string.
    ///
    /// # Errors
    /// Returns [`TraceError::Validation`] when `raw` is not a ULID.
    pub fn parse(raw: &str) -> Result<Self, TraceError> {
        Ulid::from_string(raw)
            .map(Self)
            .map_err(|err| TraceError::Validation(format!("invalid triplet_id {raw}: {err}")))
    }
}

impl Default for TripletId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for TripletId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RewardState {
    Unassigned,
    LocallyAssigned {
        value: f64,
        source: String,
        #[serde(with = "time::serde::rfc3339")]
        assigned_at: OffsetDateTime,
    },
    BackpropAssigned {
        value: f64,
        source: String,
        #[serde(with = "time::serde::rfc3339")]
        assigned_at: OffsetDateTime,
    },
}

impl RewardState {
    #[must_use]
    pub fn value(&self) -> Option<f64> {
        match self {
            Self::Unassigned => None,
            Self::LocallyAssigned { value, .. } | Self::BackpropAssigned { value, .. } => {
                Some(*value)
            }
        }
    }

    #[must_use]
    pub fn source(&self) -> Option<&str> {
        match self {
            Self::Unassigned => None,
            Self::LocallyAssigned { source, .. } | Self::BackpropAssigned { source, .. } => {
                Some(source.as_str())
            }
        }
    }

    #[must_use]
    pub fn assigned_at(&self) -> Option<OffsetDateTime> {
        match self {
            Self::Unassigned => None,
            Self::LocallyAssigned { assigned_at, .. }
            | Self::BackpropAssigned { assigned_at, .. } => Some(*assigned_at),
        }
    }

    #[must_use]
    pub fn is_assigned(&self) -> bool {
        !matches!(self, Self::Unassigned)
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unassigned => "unassigned",
            Self::LocallyAssigned { .. } => "locally_assigned",
            Self::BackpropAssigned { .. } => "backprop_assigned",
        }
    }
}

/// Audit entry kept whenever an assigned reward is replaced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RewardCorrection {
    pub previous: RewardState,
    pub value: f64,
    pub source: String,
    #[serde(with = "time::serde::rfc3339")]
    pub corrected_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Triplet {
    pub triplet_id: TripletId,
    pub sequence_id: String,
    pub sequence_index: u64,
    pub state: Payload,
    pub action: Payload,
    pub reward: RewardState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub corrections: Vec<RewardCorrection>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Triplet {
    #[must_use]
    pub fn reward(&self) -> Option<f64> {
        self.reward.value()
    }

    #[must_use]
    pub fn reward_assigned_at(&self) -> Option<OffsetDateTime> {
        self.reward.assigned_at()
    }

    #[must_use]
    pub fn reward_source(&self) -> Option<&str> {
        self.reward.source()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RewardAssignment {
    Assigned,
    Unchanged,
    Corrected { previous: RewardState },
}

/// Validates a reward value.
///
/// # Errors
/// Returns [`TraceError::InvalidReward`] for values outside `[0.0, 1.0]` and NaN.
pub fn validate_reward(reward: f64) -> Result<(), TraceError> {
    if (0.0..=1.0).contains(&reward) {
        Ok(())
    } else {
        Err(TraceError::InvalidReward(reward))
    }
}

/// Computes the effect of a direct reward assignment on one triplet.
///
/// Returns the new reward state, the audit entry to append (if any) and the
/// outcome to report. An identical `(reward, source)` pair is a no-op.
///
/// # Errors
/// Returns [`TraceError::InvalidReward`] for out-of-range rewards and
/// [`TraceError::Validation`] for an empty source.
pub fn plan_local_reward(
    current: &RewardState,
    reward: f64,
    source: &str,
    at: OffsetDateTime,
) -> Result<(RewardState, Option<RewardCorrection>, RewardAssignment), TraceError> {
    validate_reward(reward)?;
    if source.trim().is_empty() {
        return Err(TraceError::Validation(
            "reward source MUST be non-empty".to_string(),
        ));
    }

    let next = RewardState::LocallyAssigned {
        value: reward,
        source: source.to_string(),
        assigned_at: at,
    };

    match current {
        RewardState::Unassigned => Ok((next, None, RewardAssignment::Assigned)),
        RewardState::LocallyAssigned {
            value,
            source: current_source,
            ..
        } if reward_eq(*value, reward) && current_source == source => {
            Ok((current.clone(), None, RewardAssignment::Unchanged))
        }
        previous => {
            let correction = RewardCorrection {
                previous: previous.clone(),
                value: reward,
                source: source.to_string(),
                corrected_at: at,
            };
            Ok((
                next,
                Some(correction),
                RewardAssignment::Corrected {
                    previous: previous.clone(),
                },
            ))
        }
    }
}

/// Back-propagates a terminal reward over a sequence snapshot.
///
/// Only triplets whose reward is [`RewardState::Unassigned`] receive the
/// value; every other triplet is left out of the returned update list.
///
/// # Errors
/// Returns [`TraceError::InvalidReward`] for out-of-range rewards and
/// [`TraceError::Validation`] for an empty source.
pub fn backpropagate(
    snapshot: &[Triplet],
    reward: f64,
    source: &str,
    at: OffsetDateTime,
) -> Result<Vec<(TripletId, RewardState)>, TraceError> {
    validate_reward(reward)?;
    if source.trim().is_empty() {
        return Err(TraceError::Validation(
            "reward source MUST be non-empty".to_string(),
        ));
    }

    Ok(snapshot
        .iter()
        .filter(|triplet| !triplet.reward.is_assigned())
        .map(|triplet| {
            (
                triplet.triplet_id,
                RewardState::BackpropAssigned {
                    value: reward,
                    source: source.to_string(),
                    assigned_at: at,
                },
            )
        })
        .collect())
}

fn reward_eq(lhs: f64, rhs: f64) -> bool {
    (lhs - rhs).abs() <= f64::EPSILON
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;
    use crate::now_utc;

    fn fixture_triplet(index: u64, reward: RewardState) -> Triplet {
        Triplet {
            triplet_id: TripletId::new(),
            sequence_id: "seq-1".to_string(),
            sequence_index: index,
            state: Payload::new().with("step", i64::try_from(index).unwrap_or_default()),
            action: Payload::new().with("tool", "edit"),
            reward,
            corrections: Vec::new(),
            created_at: now_utc(),
        }
    }

    fn local(value: f64, source: &str) -> RewardState {
        RewardState::LocallyAssigned {
            value,
            source: source.to_string(),
            assigned_at: now_utc(),
        }
    }

    #[test]
    fn rewards_outside_unit_interval_are_rejected() {
        for bad in [-0.01, 1.01, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                validate_reward(bad),
                Err(TraceError::InvalidReward(_))
            ));
        }
        assert!(validate_reward(0.0).is_ok());
        assert!(validate_reward(1.0).is_ok());
    }

    #[test]
    fn identical_local_reward_is_a_noop() {
        let current = local(0.5, "tests");
        let (next, correction, outcome) =
            match plan_local_reward(&current, 0.5, "tests", now_utc()) {
                Ok(value) => value,
                Err(err) => panic!("unexpected error: {err}"),
            };
        assert_eq!(next, current);
        assert!(correction.is_none());
        assert_eq!(outcome, RewardAssignment::Unchanged);
    }

    #[test]
    fn different_local_reward_is_a_recorded_correction() {
        let current = local(0.5, "tests");
        let (next, correction, outcome) =
            match plan_local_reward(&current, 0.9, "human", now_utc()) {
                Ok(value) => value,
                Err(err) => panic!("unexpected error: {err}"),
            };
        assert_eq!(next.value(), Some(0.9));
        assert_eq!(next.source(), Some("human"));
        let Some(correction) = correction else {
            panic!("expected a correction entry");
        };
        assert_eq!(correction.previous, current);
        assert!(matches!(outcome, RewardAssignment::Corrected { .. }));
    }

    #[test]
    fn backprop_only_touches_unassigned() {
        let snapshot = vec![
            fixture_triplet(0, RewardState::Unassigned),
            fixture_triplet(1, local(0.2, "judge")),
            fixture_triplet(2, RewardState::Unassigned),
        ];

        let updates = match backpropagate(&snapshot, 1.0, "terminal", now_utc()) {
            Ok(value) => value,
            Err(err) => panic!("unexpected error: {err}"),
        };

        let touched: Vec<TripletId> = updates.iter().map(|(id, _)| *id).collect();
        assert_eq!(touched, vec![snapshot[0].triplet_id, snapshot[2].triplet_id]);
        for (_, state) in updates {
            assert!(matches!(state, RewardState::BackpropAssigned { value, .. } if value == 1.0));
        }
    }
}
