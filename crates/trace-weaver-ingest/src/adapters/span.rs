use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use trace_weaver_core::{parse_rfc3339_utc, Event, EventType, Payload, TraceError};

use super::{parse_error, RawRecord, SourceAdapter};

const DEFAULT_RESOURCE: &str = "pipeline";

#[derive(Debug, Deserialize)]
struct SpanRecord {
    trace_id: String,
    span_id: String,
    #[serde(default)]
    parent_span_id: Option<String>,
    name: String,
    start_time: String,
    #[serde(default)]
    end_time: Option<String>,
    #[serde(default)]
    resource: Option<String>,
    #[serde(default)]
    case_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    attributes: Option<Value>,
}

/// Runtime execution spans, one JSON object per line.
#[derive(Debug, Clone)]
pub struct SpanAdapter {
    name: String,
    text: String,
}

impl SpanAdapter {
    #[must_use]
    pub fn from_text(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }

    /// Reads a JSON Lines span export.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read.
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read span export {}", path.display()))?;
        Ok(Self::from_text(format!("spans:{}", path.display()), text))
    }
}

impl SourceAdapter for SpanAdapter {
    fn source_name(&self) -> &str {
        &self.name
    }

    fn records(&self) -> Box<dyn Iterator<Item = RawRecord> + Send + '_> {
        Box::new(
            self.text
                .lines()
                .enumerate()
                .filter(|(_, line)| !line.trim().is_empty())
                .enumerate()
                .map(|(index, (number, line))| RawRecord {
                    index,
                    line: number + 1,
                    text: line.to_string(),
                }),
        )
    }

    fn parse(&self, record: &RawRecord) -> Result<Vec<Event>, TraceError> {
        let span: SpanRecord = serde_json::from_str(&record.text)
            .map_err(|err| parse_error(&self.name, record, format!("invalid span JSON: {err}")))?;

        for (field, value) in [
            ("trace_id", &span.trace_id),
            ("span_id", &span.span_id),
            ("name", &span.name),
        ] {
            if value.trim().is_empty() {
                return Err(parse_error(
                    &self.name,
                    record,
                    format!("{field} MUST be non-empty"),
                ));
            }
        }

        let started = parse_rfc3339_utc(&span.start_time)
            .map_err(|err| parse_error(&self.name, record, format!("start_time: {err}")))?;

        let mut attributes = match &span.attributes {
            Some(value) => Payload::from_json(value)
                .map_err(|err| parse_error(&self.name, record, format!("attributes: {err}")))?,
            None => Payload::new(),
        };
        attributes.insert("trace_id", span.trace_id.clone());
        attributes.insert("span_id", span.span_id.clone());

        if let Some(end_time) = &span.end_time {
            let ended = parse_rfc3339_utc(end_time)
                .map_err(|err| parse_error(&self.name, record, format!("end_time: {err}")))?;
            if ended < started {
                return Err(parse_error(
                    &self.name,
                    record,
                    "end_time MUST NOT precede start_time",
                ));
            }
            let duration_ms = i64::try_from((ended - started).whole_milliseconds())
                .map_err(|_| parse_error(&self.name, record, "span duration out of range"))?;
            attributes.insert("duration_ms", duration_ms);
        }
        if let Some(status) = &span.status {
            attributes.insert("status", status.clone());
        }

        let resource = span
            .resource
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(DEFAULT_RESOURCE);

        let mut event = Event::new(EventType::SpanCompleted, started, span.name.clone(), resource)
            .with_source_record_id(format!("span:{}", span.span_id))
            .with_reference(format!("trace:{}", span.trace_id))
            .with_attributes(attributes);
        if let Some(parent) = span.parent_span_id.filter(|value| !value.trim().is_empty()) {
            event = event.with_parent(format!("span:{parent}"));
        }
        if let Some(case_id) = span.case_id.filter(|value| !value.trim().is_empty()) {
            event = event.with_case_hint(case_id);
        }

        Ok(vec![event])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trace_weaver_core::PayloadValue;

    fn fixture_adapter(text: &str) -> SpanAdapter {
        SpanAdapter::from_text("spans", text)
    }

    fn must_parse(adapter: &SpanAdapter, index: usize) -> Vec<Event> {
        let record = match adapter.records().nth(index) {
            Some(record) => record,
            None => panic!("missing record {index}"),
        };
        match adapter.parse(&record) {
            Ok(events) => events,
            Err(err) => panic!("unexpected parse error: {err}"),
        }
    }

    #[test]
    fn span_becomes_one_completed_event() {
        let adapter = fixture_adapter(
            r#"{"trace_id":"t1","span_id":"s2","parent_span_id":"s1","name":"plan","start_time":"2025-12-02T10:00:00Z","end_time":"2025-12-02T10:00:01.500Z","resource":"planner","attributes":{"model":"small"}}"#,
        );
        let events = must_parse(&adapter, 0);
        assert_eq!(events.len(), 1);

        let event = &events[0];
        assert_eq!(event.event_type, EventType::SpanCompleted);
        assert_eq!(event.activity, "plan");
        assert_eq!(event.resource, "planner");
        assert_eq!(event.key(), "span:s2");
        assert_eq!(event.parent.as_deref(), Some("span:s1"));
        assert!(event.references.contains("trace:t1"));
        assert_eq!(event.attributes.get("duration_ms"), Some(&PayloadValue::Int(1500)));
        assert_eq!(event.attributes.get_str("model"), Some("small"));
        assert!(event.case_hint.is_none());
    }

    #[test]
    fn case_id_becomes_hint_and_resource_defaults() {
        let adapter = fixture_adapter(
            r#"{"trace_id":"t1","span_id":"s1","name":"run","start_time":"2025-12-02T10:00:00Z","case_id":"20251202.10"}"#,
        );
        let event = &must_parse(&adapter, 0)[0];
        assert_eq!(event.case_hint.as_deref(), Some("20251202.10"));
        assert_eq!(event.resource, "pipeline");
        assert!(event.attributes.get("duration_ms").is_none());
    }

    #[test]
    fn malformed_spans_are_parse_errors() {
        let adapter = fixture_adapter(concat!(
            "not json\n",
            r#"{"trace_id":"t1","span_id":"","name":"x","start_time":"2025-12-02T10:00:00Z"}"#,
            "\n",
            r#"{"trace_id":"t1","span_id":"s1","name":"x","start_time":"2025-12-02T10:00:05Z","end_time":"2025-12-02T10:00:00Z"}"#,
        ));
        for record in adapter.records() {
            assert!(matches!(
                adapter.parse(&record),
                Err(TraceError::Parse { .. })
            ));
        }
        assert_eq!(adapter.records().count(), 3);
    }
}
