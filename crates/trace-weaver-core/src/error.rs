use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum TraceError {
    #[error("parse error in {source_name} record {record}: {message}")]
    Parse {
        source_name: String,
        record: usize,
        message: String,
    },
    #[error("ambiguous case for event {event_key}: joined {chosen} out of {candidates:?}")]
    CorrelationAmbiguity {
        event_key: String,
        chosen: String,
        candidates: Vec<String>,
    },
    #[error("invalid reward {0}: reward MUST be in [0.0, 1.0]")]
    InvalidReward(f64),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("replay interrupted after {processed} traces: {reason}")]
    ReplayInterrupted {
        processed: usize,
        reason: InterruptReason,
    },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl TraceError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "parse_error",
            Self::CorrelationAmbiguity { .. } => "correlation_ambiguity",
            Self::InvalidReward(_) => "invalid_reward",
            Self::NotFound(_) => "not_found",
            Self::ReplayInterrupted { .. } => "replay_interrupted",
            Self::Validation(_) => "validation_error",
            Self::Configuration(_) => "configuration_error",
            Self::Storage(_) => "storage_error",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InterruptReason {
    Cancelled,
    DeadlineExceeded,
}

impl Display for InterruptReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}
