//! Episode source: read-only access to raw session transcripts and their
//! segmentation into episodes.
//!
//! An [`Episode`] is identified by its first and last record IDs (plus kind),
//! never by position, so appending to a session cannot shift the identity of
//! anything already consolidated.

pub mod segment;
pub mod transcripts;

use anyhow::Result;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// Speaker of a transcript record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn label(&self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Assistant => "Assistant",
        }
    }
}

/// One record of a session, as read from the source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    /// Stable identifier assigned by the source.
    pub id: String,
    /// Unix milliseconds.
    pub timestamp_ms: i64,
    pub role: Role,
    pub text: String,
    /// A compaction summary: earlier content condensed into a continuation note.
    pub is_summary: bool,
}

/// A session with activity newer than the requested cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSession {
    pub id: String,
    /// Time of the session's newest record, in Unix milliseconds.
    pub latest_ms: i64,
}

/// Read-only view of the transcript log.
pub trait EpisodeSource: Send + Sync {
    /// Sessions whose newest record is strictly newer than `cursor_ms`, ordered
    /// by that time ascending (ties by ID), at most `limit` of them.
    fn sessions_since(&self, cursor_ms: i64, limit: usize) -> Result<Vec<SourceSession>>;

    /// Every record of a session, in source order.
    fn session_records(&self, session_id: &str) -> Result<Vec<SourceRecord>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeKind {
    /// A single compaction summary record.
    Summary,
    /// A token-budgeted window of consecutive messages.
    Messages,
}

impl EpisodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::Messages => "messages",
        }
    }
}

impl std::str::FromStr for EpisodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "summary" => Ok(Self::Summary),
            "messages" => Ok(Self::Messages),
            _ => Err(format!("unknown episode kind: {s}")),
        }
    }
}

/// Stable identity of an episode.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EpisodeKey {
    pub session_id: String,
    pub start_record_id: String,
    pub end_record_id: String,
    pub kind: EpisodeKind,
}

/// Already-consolidated episodes, grouped by session ID.
pub type ProcessedRanges = HashMap<String, HashSet<EpisodeKey>>;

/// A bounded segment of a session, the unit of extraction input.
#[derive(Debug, Clone)]
pub struct Episode {
    pub session_id: String,
    pub kind: EpisodeKind,
    pub records: Vec<SourceRecord>,
}

impl Episode {
    pub fn key(&self) -> EpisodeKey {
        EpisodeKey {
            session_id: self.session_id.clone(),
            start_record_id: self.records.first().map(|r| r.id.clone()).unwrap_or_default(),
            end_record_id: self.records.last().map(|r| r.id.clone()).unwrap_or_default(),
            kind: self.kind,
        }
    }

    /// Newest record time in the episode.
    pub fn max_timestamp_ms(&self) -> i64 {
        self.records.iter().map(|r| r.timestamp_ms).max().unwrap_or(0)
    }

    /// Plain-text rendering handed to the extraction collaborator.
    pub fn render(&self) -> String {
        let mut out = format!("### Session {} ({})\n", self.session_id, self.kind.as_str());
        for record in &self.records {
            if self.kind == EpisodeKind::Summary {
                out.push_str("Summary of earlier conversation:\n");
            } else {
                out.push_str(record.role.label());
                out.push_str(": ");
            }
            out.push_str(record.text.trim());
            out.push('\n');
        }
        out
    }
}
