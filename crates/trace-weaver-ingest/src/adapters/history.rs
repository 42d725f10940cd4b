use std::path::Path;

use anyhow::{Context, Result};
use time::OffsetDateTime;
use trace_weaver_core::{parse_rfc3339_utc, Event, EventType, Payload, TraceError};

use super::{commit_reference, parse_error, BlockRecords, RawRecord, SourceAdapter};

/// Version-control history shaped like `git log --name-status --date=iso-strict`,
/// plus single-line branch lifecycle records.
#[derive(Debug, Clone)]
pub struct HistoryAdapter {
    name: String,
    text: String,
}

#[derive(Debug)]
enum FileChange {
    Added(String),
    Modified(String),
    Deleted(String),
    Renamed { from: String, to: String, score: Option<i64> },
}

impl FileChange {
    fn event_type(&self) -> EventType {
        match self {
            Self::Added(_) => EventType::FileAdded,
            Self::Modified(_) => EventType::FileModified,
            Self::Deleted(_) => EventType::FileDeleted,
            Self::Renamed { .. } => EventType::FileRenamed,
        }
    }

    fn path(&self) -> &str {
        match self {
            Self::Added(path) | Self::Modified(path) | Self::Deleted(path) => path,
            Self::Renamed { to, .. } => to,
        }
    }
}

#[derive(Debug, Default)]
struct CommitHeader {
    hash: String,
    author: Option<String>,
    date: Option<OffsetDateTime>,
    merge: Option<Vec<String>>,
    branch: Option<String>,
    message: Vec<String>,
    session: Option<String>,
    changes: Vec<FileChange>,
}

impl HistoryAdapter {
    #[must_use]
    pub fn from_text(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }

    /// Reads an exported history log.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read.
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read history log {}", path.display()))?;
        Ok(Self::from_text(format!("history:{}", path.display()), text))
    }

    fn parse_commit(&self, record: &RawRecord) -> Result<Vec<Event>, TraceError> {
        let header = self.read_commit(record)?;
        let Some(timestamp) = header.date else {
            return Err(parse_error(&self.name, record, "commit is missing a Date: line"));
        };
        let Some(reference) = commit_reference(&header.hash) else {
            return Err(parse_error(
                &self.name,
                record,
                format!("commit hash {} MUST be hexadecimal", header.hash),
            ));
        };

        let author = header.author.clone().unwrap_or_else(|| "unknown".to_string());
        let commit_key = format!("commit:{}", header.hash.to_ascii_lowercase());
        let subject = header.message.first().cloned().unwrap_or_default();

        let mut attributes = Payload::new()
            .with("hash", header.hash.to_ascii_lowercase())
            .with("subject", subject.as_str())
            .with("files_changed", i64::try_from(header.changes.len()).unwrap_or(i64::MAX));
        if let Some(branch) = &header.branch {
            attributes.insert("branch", branch.as_str());
        }
        if header.message.len() > 1 {
            attributes.insert("message", header.message.join("\n"));
        }

        // Only the commit hash correlates; the branch stays an attribute.
        let stamp = |event: Event| {
            let mut event = event.with_reference(reference.clone());
            if let Some(session) = &header.session {
                event = event.with_case_hint(session.as_str());
            }
            event
        };

        let mut events = vec![stamp(
            Event::new(
                EventType::CommitCreated,
                timestamp,
                EventType::CommitCreated.as_str(),
                author.as_str(),
            )
            .with_source_record_id(commit_key.clone())
            .with_attributes(attributes),
        )];

        if let Some(parents) = &header.merge {
            let branch = header
                .branch
                .clone()
                .or_else(|| merged_branch_from_subject(&subject))
                .unwrap_or_else(|| "unknown".to_string());
            events.push(stamp(
                Event::new(
                    EventType::BranchMerged,
                    timestamp,
                    EventType::BranchMerged.as_str(),
                    author.as_str(),
                )
                .with_parent(commit_key.clone())
                .with_source_record_id(format!("{commit_key}:merge"))
                .with_attributes(
                    Payload::new()
                        .with("branch", branch.as_str())
                        .with("parents", parents.clone()),
                ),
            ));
        }

        for change in &header.changes {
            let event_type = change.event_type();
            let mut attributes = Payload::new().with("path", change.path());
            if let Some(branch) = &header.branch {
                attributes.insert("branch", branch.as_str());
            }
            if let FileChange::Renamed { from, score, .. } = change {
                attributes.insert("from", from.as_str());
                if let Some(score) = score {
                    attributes.insert("similarity", *score);
                }
            }
            events.push(stamp(
                Event::new(event_type, timestamp, event_type.as_str(), author.as_str())
                    .with_parent(commit_key.clone())
                    .with_source_record_id(format!("{commit_key}:{}", change.path()))
                    .with_attributes(attributes),
            ));
        }

        Ok(events)
    }

    fn read_commit(&self, record: &RawRecord) -> Result<CommitHeader, TraceError> {
        let mut lines = record.text.lines();
        let first = lines.next().unwrap_or_default();
        let hash = first
            .strip_prefix("commit ")
            .and_then(|rest| rest.split_whitespace().next())
            .ok_or_else(|| parse_error(&self.name, record, "record MUST start with 'commit <hash>'"))?;

        let mut header = CommitHeader {
            hash: hash.to_string(),
            ..CommitHeader::default()
        };

        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            if let Some(message) = line.strip_prefix("    ") {
                let message = message.trim();
                if let Some(session) = message.strip_prefix("Session:") {
                    let session = session.trim();
                    if !session.is_empty() {
                        header.session = Some(session.to_string());
                    }
                } else if !message.is_empty() {
                    header.message.push(message.to_string());
                }
                continue;
            }
            if let Some(value) = line.strip_prefix("Author:") {
                header.author = Some(author_name(value));
            } else if let Some(value) = line.strip_prefix("Date:") {
                let parsed = parse_rfc3339_utc(value.trim())
                    .map_err(|err| parse_error(&self.name, record, format!("Date: {err}")))?;
                header.date = Some(parsed);
            } else if let Some(value) = line.strip_prefix("Merge:") {
                header.merge = Some(value.split_whitespace().map(str::to_string).collect());
            } else if let Some(value) = line.strip_prefix("Branch:") {
                let value = value.trim();
                if !value.is_empty() {
                    header.branch = Some(value.to_string());
                }
            } else if line.contains('\t') {
                header.changes.push(self.read_change(record, line)?);
            } else {
                return Err(parse_error(
                    &self.name,
                    record,
                    format!("unrecognized history line: {line}"),
                ));
            }
        }

        Ok(header)
    }

    fn read_change(&self, record: &RawRecord, line: &str) -> Result<FileChange, TraceError> {
        let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
        let status = fields.first().copied().unwrap_or_default();
        let invalid = || parse_error(&self.name, record, format!("invalid name-status line: {line}"));

        match (status.chars().next(), fields.as_slice()) {
            (Some('A'), [_, path]) if !path.is_empty() => Ok(FileChange::Added((*path).to_string())),
            (Some('M'), [_, path]) if !path.is_empty() => {
                Ok(FileChange::Modified((*path).to_string()))
            }
            (Some('D'), [_, path]) if !path.is_empty() => {
                Ok(FileChange::Deleted((*path).to_string()))
            }
            (Some('R'), [_, from, to]) if !from.is_empty() && !to.is_empty() => {
                Ok(FileChange::Renamed {
                    from: (*from).to_string(),
                    to: (*to).to_string(),
                    score: status[1..].parse().ok(),
                })
            }
            _ => Err(invalid()),
        }
    }

    fn parse_branch(&self, record: &RawRecord) -> Result<Vec<Event>, TraceError> {
        let fields: Vec<&str> = record.text.split_whitespace().collect();
        let [_, action, name, at, rest @ ..] = fields.as_slice() else {
            return Err(parse_error(
                &self.name,
                record,
                "branch record MUST be 'branch <created|merged|deleted> <name> <RFC3339> [<hash>]'",
            ));
        };
        let event_type = match *action {
            "created" => EventType::BranchCreated,
            "merged" => EventType::BranchMerged,
            "deleted" => EventType::BranchDeleted,
            other => {
                return Err(parse_error(
                    &self.name,
                    record,
                    format!("unknown branch action {other}"),
                ))
            }
        };
        let timestamp = parse_rfc3339_utc(at)
            .map_err(|err| parse_error(&self.name, record, format!("branch timestamp: {err}")))?;

        let mut event = Event::new(event_type, timestamp, event_type.as_str(), "vcs")
            .with_source_record_id(format!("branch:{action}:{name}:{at}"))
            .with_reference(format!("branch:{name}"))
            .with_attributes(Payload::new().with("branch", *name));

        match rest {
            [] => {}
            [hash] => {
                let Some(reference) = commit_reference(hash) else {
                    return Err(parse_error(
                        &self.name,
                        record,
                        format!("branch commit {hash} MUST be hexadecimal"),
                    ));
                };
                event.attributes.insert("hash", hash.to_ascii_lowercase());
                event = event.with_reference(reference);
            }
            _ => {
                return Err(parse_error(
                    &self.name,
                    record,
                    "branch record has trailing fields",
                ))
            }
        }

        Ok(vec![event])
    }
}

impl SourceAdapter for HistoryAdapter {
    fn source_name(&self) -> &str {
        &self.name
    }

    fn records(&self) -> Box<dyn Iterator<Item = RawRecord> + Send + '_> {
        Box::new(BlockRecords::new(&self.text, |line| {
            line.starts_with("commit ") || line.starts_with("branch ")
        }))
    }

    fn parse(&self, record: &RawRecord) -> Result<Vec<Event>, TraceError> {
        if record.text.starts_with("commit ") {
            self.parse_commit(record)
        } else if record.text.starts_with("branch ") {
            self.parse_branch(record)
        } else {
            Err(parse_error(
                &self.name,
                record,
                "record MUST start with 'commit' or 'branch'",
            ))
        }
    }
}

fn author_name(raw: &str) -> String {
    let raw = raw.trim();
    let name = raw.split_once('<').map_or(raw, |(name, _)| name).trim();
    if name.is_empty() {
        raw.to_string()
    } else {
        name.to_string()
    }
}

fn merged_branch_from_subject(subject: &str) -> Option<String> {
    let rest = subject.strip_prefix("Merge branch '")?;
    let (branch, _) = rest.split_once('\'')?;
    Some(branch.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use trace_weaver_core::PayloadValue;

    const LOG: &str = "\
commit 540661c3f2a9e8d7b6c5a4f3e2d1c0b9a8f7e6d5
Author: Dev One <dev@example.com>
Date:   2025-12-02T11:15:00Z
Branch: fix/ci

    Fix CI failures

    Session: 20251202.10

M\ta.py
A\ttests/b.py
R087\told.py\tnew.py

commit 9f1e2d3c4b5a69788796a5b4c3d2e1f0a9b8c7d6
Merge: 540661c 1234567
Author: Dev Two <two@example.com>
Date:   2025-12-02T12:00:00+01:00

    Merge branch 'fix/ci'

branch deleted fix/ci 2025-12-02T12:05:00Z 9f1e2d3
";

    fn must_events(adapter: &HistoryAdapter, index: usize) -> Vec<Event> {
        let Some(record) = adapter.records().nth(index) else {
            panic!("missing record {index}");
        };
        match adapter.parse(&record) {
            Ok(events) => events,
            Err(err) => panic!("unexpected parse error: {err}"),
        }
    }

    #[test]
    fn commit_emits_commit_and_file_events() {
        let adapter = HistoryAdapter::from_text("history", LOG);
        let events = must_events(&adapter, 0);

        let types: Vec<EventType> = events.iter().map(|event| event.event_type).collect();
        assert_eq!(
            types,
            vec![
                EventType::CommitCreated,
                EventType::FileModified,
                EventType::FileAdded,
                EventType::FileRenamed,
            ]
        );

        let commit = &events[0];
        assert_eq!(commit.resource, "Dev One");
        assert_eq!(commit.case_hint.as_deref(), Some("20251202.10"));
        assert!(commit.references.contains("commit:540661c"));
        assert_eq!(
            commit.references.iter().collect::<Vec<_>>(),
            vec!["commit:540661c"]
        );
        assert_eq!(commit.attributes.get_str("branch"), Some("fix/ci"));
        assert_eq!(commit.attributes.get_str("subject"), Some("Fix CI failures"));
        assert_eq!(commit.attributes.get("files_changed"), Some(&PayloadValue::Int(3)));

        for file in &events[1..] {
            assert_eq!(file.parent.as_deref(), Some(commit.key().as_str()));
            assert!(!file.references.iter().any(|item| item.starts_with("branch:")));
            assert_eq!(file.attributes.get_str("branch"), Some("fix/ci"));
        }
        assert_eq!(events[3].attributes.get_str("from"), Some("old.py"));
        assert_eq!(events[3].attributes.get("similarity"), Some(&PayloadValue::Int(87)));
    }

    #[test]
    fn merge_commit_also_emits_branch_merged() {
        let adapter = HistoryAdapter::from_text("history", LOG);
        let events = must_events(&adapter, 1);

        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_type, EventType::BranchMerged);
        assert_eq!(events[1].attributes.get_str("branch"), Some("fix/ci"));
        assert!(events
            .iter()
            .all(|event| !event.references.iter().any(|item| item.starts_with("branch:"))));
        assert_eq!(events[0].timestamp, time::macros::datetime!(2025-12-02 11:00 UTC));
        assert!(events[0].case_hint.is_none());
    }

    #[test]
    fn branch_records_are_single_events() {
        let adapter = HistoryAdapter::from_text("history", LOG);
        assert_eq!(adapter.records().count(), 3);

        let events = must_events(&adapter, 2);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::BranchDeleted);
        assert!(events[0].references.contains("commit:9f1e2d3"));
        assert!(events[0].references.contains("branch:fix/ci"));
    }

    #[test]
    fn malformed_history_records_are_rejected() {
        let adapter = HistoryAdapter::from_text(
            "history",
            "commit nothex!\nDate: 2025-12-02T11:15:00Z\n\
             commit abcdef1\nAuthor: x\n\
             commit abcdef2\nDate: 2025-12-02T11:15:00Z\nX\tfile\n\
             branch renamed main 2025-12-02T11:15:00Z\n",
        );
        let records: Vec<RawRecord> = adapter.records().collect();
        assert_eq!(records.len(), 4);
        for record in &records {
            assert!(matches!(
                adapter.parse(record),
                Err(TraceError::Parse { .. })
            ));
        }
    }
}
