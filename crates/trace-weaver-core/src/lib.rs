#![forbid(unsafe_code)]

mod config;
mod error;
mod event;
mod payload;
mod store;
mod triplet;

pub use config::WeaverConfig;
pub use error::{InterruptReason, TraceError};
pub use event::{Correlation, CorrelationRule, Event, EventId, EventType, Trace};
pub use payload::{Payload, PayloadValue};
pub use store::{MemoryTripletStore, TripletStore};
pub use triplet::{
    backpropagate, plan_local_reward, validate_reward, RewardAssignment, RewardCorrection,
    RewardState, Triplet, TripletId,
};

use time::{OffsetDateTime, UtcOffset};

/// Parses an RFC3339 timestamp and normalizes it to UTC.
///
/// # Errors
/// Returns [`TraceError::Validation`] when the value is not RFC3339.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, TraceError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| TraceError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    Ok(parsed.to_offset(UtcOffset::UTC))
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`TraceError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, TraceError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| TraceError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_are_normalized_to_utc() {
        let parsed = match parse_rfc3339_utc("2025-12-02T10:00:00+02:00") {
            Ok(value) => value,
            Err(err) => panic!("unexpected parse error: {err}"),
        };
        assert_eq!(parsed.offset(), UtcOffset::UTC);
        assert_eq!(parsed.hour(), 8);

        let formatted = match format_rfc3339(parsed) {
            Ok(value) => value,
            Err(err) => panic!("unexpected format error: {err}"),
        };
        assert_eq!(formatted, "2025-12-02T08:00:00Z");
    }

    #[test]
    fn garbage_timestamps_are_rejected() {
        assert!(matches!(
            parse_rfc3339_utc("yesterday"),
            Err(TraceError::Validation(_))
        ));
    }
}
