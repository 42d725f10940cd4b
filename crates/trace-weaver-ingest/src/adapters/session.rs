use std::path::Path;

use anyhow::{Context, Result};
use time::{Date, Month, OffsetDateTime, Time};
use trace_weaver_core::{parse_rfc3339_utc, Event, EventType, Payload, TraceError};
use tracing::debug;

use super::{commit_reference, parse_error, BlockRecords, RawRecord, SourceAdapter};

const HEADER_PREFIX: &str = "# Session ";
const DEFAULT_ACTOR: &str = "developer";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Preamble,
    Objective,
    Completed,
    Files,
    Commits,
    Other,
}

impl Section {
    fn from_heading(heading: &str) -> Self {
        match heading.trim().to_ascii_lowercase().as_str() {
            "objective" => Self::Objective,
            "completed" => Self::Completed,
            "files" => Self::Files,
            "commits" => Self::Commits,
            _ => Self::Other,
        }
    }
}

/// Development session notes, one `# Session <YYYYMMDD>.<n>` block per record.
#[derive(Debug, Clone)]
pub struct SessionAdapter {
    name: String,
    text: String,
}

impl SessionAdapter {
    #[must_use]
    pub fn from_text(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }

    /// Reads a session notes file.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read.
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read session notes {}", path.display()))?;
        Ok(Self::from_text(format!("sessions:{}", path.display()), text))
    }

    fn header_date(&self, record: &RawRecord, session_id: &str) -> Result<Date, TraceError> {
        let Some((day, ordinal)) = session_id.split_once('.') else {
            return Err(parse_error(
                &self.name,
                record,
                format!("session id {session_id} MUST look like YYYYMMDD.n"),
            ));
        };
        if day.len() != 8
            || !day.chars().all(|item| item.is_ascii_digit())
            || ordinal.is_empty()
            || !ordinal.chars().all(|item| item.is_ascii_digit())
        {
            return Err(parse_error(
                &self.name,
                record,
                format!("session id {session_id} MUST look like YYYYMMDD.n"),
            ));
        }

        let year: i32 = day[..4].parse().unwrap_or_default();
        let month: u8 = day[4..6].parse().unwrap_or_default();
        let dom: u8 = day[6..].parse().unwrap_or_default();
        let month = Month::try_from(month)
            .map_err(|err| parse_error(&self.name, record, format!("session date: {err}")))?;
        Date::from_calendar_date(year, month, dom)
            .map_err(|err| parse_error(&self.name, record, format!("session date: {err}")))
    }
}

impl SourceAdapter for SessionAdapter {
    fn source_name(&self) -> &str {
        &self.name
    }

    fn records(&self) -> Box<dyn Iterator<Item = RawRecord> + Send + '_> {
        Box::new(BlockRecords::new(&self.text, |line| {
            line.starts_with(HEADER_PREFIX)
        }))
    }

    #[allow(clippy::too_many_lines)]
    fn parse(&self, record: &RawRecord) -> Result<Vec<Event>, TraceError> {
        let mut lines = record.text.lines();
        let header = lines.next().unwrap_or_default();
        let Some(session_id) = header.strip_prefix(HEADER_PREFIX).map(str::trim) else {
            return Err(parse_error(
                &self.name,
                record,
                "record MUST start with '# Session <id>'",
            ));
        };
        let date = self.header_date(record, session_id)?;

        let mut started: OffsetDateTime = date.with_time(Time::MIDNIGHT).assume_utc();
        let mut actor = DEFAULT_ACTOR.to_string();
        let mut section = Section::Preamble;
        let mut objective: Vec<String> = Vec::new();
        let mut completed: Vec<String> = Vec::new();
        let mut files: Vec<String> = Vec::new();
        let mut commits: Vec<String> = Vec::new();

        for line in lines {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Some(heading) = trimmed.strip_prefix("## ") {
                section = Section::from_heading(heading);
                continue;
            }

            match section {
                Section::Preamble => {
                    if let Some(value) = trimmed.strip_prefix("Started:") {
                        started = parse_rfc3339_utc(value.trim()).map_err(|err| {
                            parse_error(&self.name, record, format!("Started: {err}"))
                        })?;
                    } else if let Some(value) = trimmed.strip_prefix("Actor:") {
                        if !value.trim().is_empty() {
                            actor = value.trim().to_string();
                        }
                    }
                }
                Section::Objective => objective.push(trimmed.to_string()),
                Section::Completed => {
                    if let Some(item) = bullet(trimmed) {
                        completed.push(item.to_string());
                    }
                }
                Section::Files => {
                    if let Some(item) = bullet(trimmed) {
                        files.push(item.trim_matches('`').to_string());
                    }
                }
                Section::Commits => {
                    if let Some(item) = bullet(trimmed) {
                        let hash = item.split_whitespace().next().unwrap_or_default();
                        match commit_reference(hash.trim_matches('`')) {
                            Some(reference) => commits.push(reference),
                            None => debug!(
                                event = "session_commit_ignored",
                                source = self.name.as_str(),
                                session_id,
                                bullet = item,
                            ),
                        }
                    }
                }
                Section::Other => {}
            }
        }

        let start_key = format!("session:{session_id}");
        let mut start = Event::new(EventType::SessionStart, started, "session.start", actor.clone())
            .with_case_hint(session_id)
            .with_source_record_id(start_key.clone())
            .with_reference(start_key.clone())
            .with_attributes(Payload::new().with("session_id", session_id));
        for reference in commits {
            start = start.with_reference(reference);
        }

        let child = |event_type: EventType, suffix: String, attributes: Payload| {
            Event::new(event_type, started, event_type.as_str(), actor.clone())
                .with_case_hint(session_id)
                .with_parent(start_key.clone())
                .with_source_record_id(format!("{start_key}:{suffix}"))
                .with_attributes(attributes)
        };

        let mut events = vec![start];
        if !objective.is_empty() {
            events.push(child(
                EventType::ObjectiveSet,
                "objective".to_string(),
                Payload::new().with("objective", objective.join(" ")),
            ));
        }
        for (position, task) in completed.iter().enumerate() {
            let mut attributes = Payload::new().with("task", task.as_str());
            let referenced = file_references(task);
            if !referenced.is_empty() {
                attributes.insert("files", referenced);
            }
            events.push(child(
                EventType::TaskCompleted,
                format!("task:{position}"),
                attributes,
            ));
        }
        for path in files {
            events.push(child(
                EventType::FileReferenced,
                format!("file:{path}"),
                Payload::new().with("path", path.as_str()),
            ));
        }

        Ok(events)
    }
}

fn bullet(line: &str) -> Option<&str> {
    line.strip_prefix("- ")
        .or_else(|| line.strip_prefix("* "))
        .map(str::trim)
        .filter(|item| !item.is_empty())
}

/// Back-ticked spans win; otherwise tokens shaped like `dir/name.ext`.
fn file_references(text: &str) -> Vec<String> {
    let quoted: Vec<String> = text
        .split('`')
        .skip(1)
        .step_by(2)
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect();
    if !quoted.is_empty() {
        return quoted;
    }

    text.split_whitespace()
        .map(|token| token.trim_matches(|ch: char| matches!(ch, ',' | ';' | ':' | '(' | ')' | '"' | '\'')))
        .map(|token| token.trim_end_matches('.'))
        .filter(|token| looks_like_path(token))
        .map(str::to_string)
        .collect()
}

fn looks_like_path(token: &str) -> bool {
    if !token
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.' | '/'))
    {
        return false;
    }
    let name = token.rsplit('/').next().unwrap_or(token);
    match name.rsplit_once('.') {
        Some((stem, extension)) => {
            !stem.is_empty()
                && (1..=5).contains(&extension.len())
                && extension.chars().all(|ch| ch.is_ascii_alphabetic())
        }
        None => false,
    }
}
