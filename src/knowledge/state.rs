//! The consolidation cursor, cumulative counters, and the processed-episode log.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection};
use serde::Serialize;

use super::store::write_audit_log;
use super::timestamp;
use crate::episodes::{EpisodeKey, EpisodeKind, ProcessedRanges};

/// The singleton `consolidation_state` row.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConsolidationState {
    pub last_run_at: Option<String>,
    /// High-water mark over source record time, in Unix milliseconds.
    pub cursor_ms: i64,
    pub sessions_processed: u64,
    pub entries_created: u64,
    pub entries_updated: u64,
}

pub fn get_state(conn: &Connection) -> Result<ConsolidationState> {
    let state = conn.query_row(
        "SELECT last_run_at, cursor_ms, sessions_processed, entries_created, entries_updated \
         FROM consolidation_state WHERE id = 1",
        [],
        |row| {
            Ok(ConsolidationState {
                last_run_at: row.get(0)?,
                cursor_ms: row.get(1)?,
                sessions_processed: row.get::<_, i64>(2)? as u64,
                entries_created: row.get::<_, i64>(3)? as u64,
                entries_updated: row.get::<_, i64>(4)? as u64,
            })
        },
    )?;
    Ok(state)
}

/// Move the cursor forward to `cursor_ms`. A smaller value is ignored.
pub fn advance_cursor(conn: &Connection, cursor_ms: i64) -> Result<i64> {
    conn.execute(
        "UPDATE consolidation_state SET cursor_ms = MAX(cursor_ms, ?1) WHERE id = 1",
        params![cursor_ms],
    )?;
    Ok(get_state(conn)?.cursor_ms)
}

/// Add one run's totals to the cumulative counters and stamp the run time.
pub fn record_run(
    conn: &Connection,
    sessions: u64,
    created: u64,
    updated: u64,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE consolidation_state SET last_run_at = ?1, \
         sessions_processed = sessions_processed + ?2, \
         entries_created = entries_created + ?3, \
         entries_updated = entries_updated + ?4 \
         WHERE id = 1",
        params![timestamp(now), sessions as i64, created as i64, updated as i64],
    )?;
    Ok(())
}

/// Already-consolidated episode identities for the given sessions.
pub fn processed_ranges(conn: &Connection, session_ids: &[&str]) -> Result<ProcessedRanges> {
    let mut ranges = ProcessedRanges::new();
    if session_ids.is_empty() {
        return Ok(ranges);
    }
    let placeholders: Vec<String> = (1..=session_ids.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT session_id, start_record_id, end_record_id, kind FROM processed_episodes \
         WHERE session_id IN ({})",
        placeholders.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(session_ids.iter()), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    for (session_id, start, end, kind) in rows {
        let Ok(kind) = kind.parse::<EpisodeKind>() else {
            continue;
        };
        ranges
            .entry(session_id.clone())
            .or_default()
            .insert(EpisodeKey {
                session_id,
                start_record_id: start,
                end_record_id: end,
                kind,
            });
    }
    Ok(ranges)
}

/// Record that an episode was consolidated. Re-recording is a no-op.
pub fn record_processed(conn: &Connection, key: &EpisodeKey, now: DateTime<Utc>) -> Result<bool> {
    let rows = conn.execute(
        "INSERT OR IGNORE INTO processed_episodes \
         (session_id, start_record_id, end_record_id, kind, processed_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            key.session_id,
            key.start_record_id,
            key.end_record_id,
            key.kind.as_str(),
            timestamp(now)
        ],
    )?;
    Ok(rows > 0)
}

/// Totals removed by [`reset_all`].
#[derive(Debug, Default, Serialize)]
pub struct ResetSummary {
    pub entries_removed: u64,
    pub relations_removed: u64,
    pub episodes_removed: u64,
}

/// Clear every entry, relation, embedding, and processed episode, and rewind
/// the cursor to zero. Runs in one transaction.
pub fn reset_all(conn: &mut Connection) -> Result<ResetSummary> {
    let tx = conn.transaction()?;
    let relations_removed = tx.execute("DELETE FROM relations", [])? as u64;
    tx.execute("DELETE FROM entry_topics", [])?;
    tx.execute("DELETE FROM entries_vec", [])?;
    let entries_removed = tx.execute("DELETE FROM entries", [])? as u64;
    let episodes_removed = tx.execute("DELETE FROM processed_episodes", [])? as u64;
    tx.execute("DELETE FROM knowledge_log", [])?;
    tx.execute(
        "UPDATE consolidation_state SET last_run_at = NULL, cursor_ms = 0, \
         sessions_processed = 0, entries_created = 0, entries_updated = 0 WHERE id = 1",
        [],
    )?;
    let summary = ResetSummary {
        entries_removed,
        relations_removed,
        episodes_removed,
    };
    write_audit_log(&tx, "reset", "*", Some(&serde_json::to_value(&summary)?))?;
    tx.commit()?;
    Ok(summary)
}
