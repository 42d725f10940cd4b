use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;
use trace_weaver_core::{Event, TraceError};
use tracing::{debug, warn};

mod history;
mod session;
mod span;

pub use history::HistoryAdapter;
pub use session::SessionAdapter;
pub use span::SpanAdapter;

/// One raw record as read from a source, before parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// Zero-based position of the record in its source.
    pub index: usize,
    /// One-based line number where the record starts.
    pub line: usize,
    pub text: String,
}

/// Produces [`Event`]s from one kind of source.
pub trait SourceAdapter: Send + Sync {
    fn source_name(&self) -> &str;

    /// Raw records in source order. Every call restarts from the beginning.
    fn records(&self) -> Box<dyn Iterator<Item = RawRecord> + Send + '_>;

    #[allow(clippy::missing_errors_doc)]
    fn parse(&self, record: &RawRecord) -> Result<Vec<Event>, TraceError>;

    /// Lazy, fault-isolated event stream over [`SourceAdapter::records`].
    fn events(&self, record_timeout: Duration) -> EventStream<'_>
    where
        Self: Sized,
    {
        EventStream::new(self, record_timeout)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AdapterStats {
    pub source: String,
    pub records: usize,
    pub events: usize,
    pub parse_errors: usize,
    pub timeouts: usize,
}

/// Iterator adapter that parses one record at a time.
///
/// A record that fails to parse, or whose parse runs past the time budget,
/// contributes no events and is counted in [`AdapterStats`]. The budget is
/// checked once `parse` returns: a slow record is discarded even when it
/// parsed, but a parse that never returns still holds up this source.
pub struct EventStream<'a> {
    adapter: &'a dyn SourceAdapter,
    records: Box<dyn Iterator<Item = RawRecord> + Send + 'a>,
    pending: VecDeque<Event>,
    record_timeout: Duration,
    stats: AdapterStats,
}

impl<'a> EventStream<'a> {
    #[must_use]
    pub fn new(adapter: &'a dyn SourceAdapter, record_timeout: Duration) -> Self {
        Self {
            adapter,
            records: adapter.records(),
            pending: VecDeque::new(),
            record_timeout,
            stats: AdapterStats {
                source: adapter.source_name().to_string(),
                ..AdapterStats::default()
            },
        }
    }

    #[must_use]
    pub fn stats(&self) -> &AdapterStats {
        &self.stats
    }

    #[must_use]
    pub fn into_stats(self) -> AdapterStats {
        self.stats
    }

    fn pull(&mut self, record: &RawRecord) {
        self.stats.records += 1;
        let started = Instant::now();
        let parsed = self.adapter.parse(record);
        let elapsed = started.elapsed();

        if elapsed > self.record_timeout {
            self.stats.timeouts += 1;
            warn!(
                event = "record_timeout",
                source = self.adapter.source_name(),
                record = record.index,
                line = record.line,
                elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            );
            return;
        }

        match parsed {
            Ok(events) => {
                debug!(
                    event = "record_parsed",
                    source = self.adapter.source_name(),
                    record = record.index,
                    events = events.len(),
                );
                self.stats.events += events.len();
                self.pending.extend(events);
            }
            Err(err) => {
                self.stats.parse_errors += 1;
                warn!(
                    event = "record_rejected",
                    source = self.adapter.source_name(),
                    record = record.index,
                    line = record.line,
                    error = %err,
                );
            }
        }
    }
}

impl Iterator for EventStream<'_> {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            let record = self.records.next()?;
            self.pull(&record);
        }
    }
}

pub(crate) fn parse_error(
    source_name: &str,
    record: &RawRecord,
    message: impl Into<String>,
) -> TraceError {
    TraceError::Parse {
        source_name: source_name.to_string(),
        record: record.index,
        message: format!("line {}: {}", record.line, message.into()),
    }
}

/// Splits text into records that each begin at a line accepted by `is_start`.
///
/// Non-blank lines before the first start line form their own record so the
/// parser can reject them.
pub(crate) struct BlockRecords<'a> {
    lines: std::iter::Peekable<std::iter::Enumerate<std::str::Lines<'a>>>,
    is_start: fn(&str) -> bool,
    next_index: usize,
}

impl<'a> BlockRecords<'a> {
    pub(crate) fn new(text: &'a str, is_start: fn(&str) -> bool) -> Self {
        Self {
            lines: text.lines().enumerate().peekable(),
            is_start,
            next_index: 0,
        }
    }
}

impl Iterator for BlockRecords<'_> {
    type Item = RawRecord;

    fn next(&mut self) -> Option<RawRecord> {
        // Skip blank separators between records.
        while let Some((_, line)) = self.lines.peek() {
            if line.trim().is_empty() {
                self.lines.next();
            } else {
                break;
            }
        }

        let (first_number, first_line) = self.lines.next()?;
        let mut text = first_line.to_string();
        while let Some((_, line)) = self.lines.peek() {
            if (self.is_start)(line) {
                break;
            }
            text.push('\n');
            text.push_str(line);
            self.lines.next();
        }

        let record = RawRecord {
            index: self.next_index,
            line: first_number + 1,
            text: text.trim_end().to_string(),
        };
        self.next_index += 1;
        Some(record)
    }
}

/// Normalizes a commit hash into the shared `commit:<7-char prefix>` reference.
#[must_use]
pub fn commit_reference(hash: &str) -> Option<String> {
    let hash = hash.trim();
    if hash.len() < 7 || !hash.chars().all(|item| item.is_ascii_hexdigit()) {
        return None;
    }
    Some(format!("commit:{}", hash[..7].to_ascii_lowercase()))
}
