//! JSONL transcript directory reader.
//!
//! Every `*.jsonl` file under the root (recursively) is one session; its file
//! stem is the session ID. Each line is a record:
//!
//! ```json
//! {"uuid":"…","timestamp":"2026-03-01T12:00:00.000Z","type":"user",
//!  "message":{"role":"user","content":"…"},"isCompactSummary":false}
//! ```
//!
//! `message.content` is either a string or a list of blocks, of which only
//! `text` blocks are kept. Lines of other types, and lines that do not parse,
//! are skipped. Files are only ever read.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use super::{EpisodeSource, Role, SourceRecord, SourceSession};
use crate::error::LoreError;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLine {
    uuid: Option<String>,
    timestamp: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    message: Option<RawMessage>,
    #[serde(default)]
    is_compact_summary: bool,
}

#[derive(Deserialize)]
struct RawMessage {
    content: Option<serde_json::Value>,
}

pub struct TranscriptDirSource {
    root: PathBuf,
}

impl TranscriptDirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn session_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        if self.root.is_dir() {
            collect_jsonl(&self.root, &mut files)?;
        } else {
            tracing::debug!(root = %self.root.display(), "transcript directory does not exist");
        }
        Ok(files)
    }
}

fn collect_jsonl(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            collect_jsonl(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "jsonl") {
            out.push(path);
        }
    }
    Ok(())
}

fn session_id_of(path: &Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().into_owned())
}

/// Text of a message: the string itself, or the concatenated `text` blocks.
fn content_text(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(blocks) => blocks
            .iter()
            .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn parse_line(line: &str) -> Option<SourceRecord> {
    let raw: RawLine = serde_json::from_str(line).ok()?;
    let role = match raw.kind.as_deref()? {
        "user" => Role::User,
        "assistant" => Role::Assistant,
        _ => return None,
    };
    let timestamp_ms = chrono::DateTime::parse_from_rfc3339(raw.timestamp.as_deref()?)
        .ok()?
        .timestamp_millis();
    let text = raw
        .message
        .and_then(|m| m.content)
        .map(|c| content_text(&c))
        .unwrap_or_default();
    Some(SourceRecord {
        id: raw.uuid?,
        timestamp_ms,
        role,
        text,
        is_summary: raw.is_compact_summary,
    })
}

/// Parse a transcript file, skipping unusable lines.
pub fn read_transcript(path: &Path) -> Result<Vec<SourceRecord>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read transcript {}", path.display()))?;
    let mut records = Vec::new();
    for (n, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(line) {
            Some(record) => records.push(record),
            None => tracing::debug!(file = %path.display(), line = n + 1, "skipping transcript line"),
        }
    }
    Ok(records)
}

impl EpisodeSource for TranscriptDirSource {
    fn sessions_since(&self, cursor_ms: i64, limit: usize) -> Result<Vec<SourceSession>> {
        let mut sessions = Vec::new();
        for path in self.session_files()? {
            let Some(id) = session_id_of(&path) else {
                continue;
            };
            let records = match read_transcript(&path) {
                Ok(records) => records,
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "unreadable transcript");
                    continue;
                }
            };
            let Some(latest_ms) = records.iter().map(|r| r.timestamp_ms).max() else {
                continue;
            };
            if latest_ms > cursor_ms {
                sessions.push(SourceSession { id, latest_ms });
            }
        }

        sessions.sort_by(|a, b| a.latest_ms.cmp(&b.latest_ms).then_with(|| a.id.cmp(&b.id)));
        sessions.truncate(limit);
        Ok(sessions)
    }

    fn session_records(&self, session_id: &str) -> Result<Vec<SourceRecord>> {
        let path = self
            .session_files()?
            .into_iter()
            .find(|p| session_id_of(p).as_deref() == Some(session_id))
            .ok_or_else(|| LoreError::NotFound(format!("session {session_id}")))?;
        read_transcript(&path)
    }
}
