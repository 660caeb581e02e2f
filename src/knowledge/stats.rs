use anyhow::Result;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

use super::state::{get_state, ConsolidationState};
use super::types::{EntryStatus, KnowledgeType};

/// Response from `knowledge_stats`.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub total_entries: u64,
    pub live_entries: u64,
    pub by_status: BTreeMap<String, u64>,
    /// Live entries only.
    pub by_type: BTreeMap<String, u64>,
    pub by_relation: BTreeMap<String, u64>,
    pub entries_missing_embedding: u64,
    pub processed_episodes: u64,
    pub consolidation: ConsolidationState,
    pub db_size_bytes: u64,
}

/// Compute store statistics. `db_path` is used for the file size; pass
/// `None` for in-memory databases.
pub fn knowledge_stats(conn: &Connection, db_path: Option<&Path>) -> Result<StatsResponse> {
    let mut by_status: BTreeMap<String, u64> = EntryStatus::ALL
        .iter()
        .map(|s| (s.as_str().to_string(), 0))
        .collect();
    by_status.extend(grouped_counts(
        conn,
        "SELECT status, COUNT(*) FROM entries GROUP BY status",
    )?);

    let mut by_type: BTreeMap<String, u64> = KnowledgeType::ALL
        .iter()
        .map(|k| (k.as_str().to_string(), 0))
        .collect();
    by_type.extend(grouped_counts(
        conn,
        "SELECT type, COUNT(*) FROM entries \
         WHERE status IN ('active','conflicted') GROUP BY type",
    )?);

    let by_relation = grouped_counts(conn, "SELECT kind, COUNT(*) FROM relations GROUP BY kind")?;

    let entries_missing_embedding = count(
        conn,
        "SELECT COUNT(*) FROM entries WHERE status IN ('active','conflicted') \
         AND id NOT IN (SELECT id FROM entries_vec)",
    )?;
    let processed_episodes = count(conn, "SELECT COUNT(*) FROM processed_episodes")?;

    let db_size_bytes = db_path
        .and_then(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .unwrap_or(0);

    Ok(StatsResponse {
        total_entries: by_status.values().sum(),
        live_entries: by_status["active"] + by_status["conflicted"],
        by_status,
        by_type,
        by_relation,
        entries_missing_embedding,
        processed_episodes,
        consolidation: get_state(conn)?,
        db_size_bytes,
    })
}

fn count(conn: &Connection, sql: &str) -> Result<u64> {
    let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
    Ok(n as u64)
}

fn grouped_counts(conn: &Connection, sql: &str) -> Result<BTreeMap<String, u64>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    Ok(rows)
}
