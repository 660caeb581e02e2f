//! Graph edges between entries and the conflict lifecycle built on them.
//!
//! A `contradicts` edge marks both endpoints `conflicted`. When one side of a
//! contradiction is resolved (superseded, archived, or merged away) its
//! counterpart returns to `active` once no other contradiction still holds it.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::store::{self, write_audit_log};
use super::timestamp;
use super::types::{EntryStatus, KnowledgeRelation, RelationKind};

/// Result of [`add_relation`].
#[derive(Debug, Serialize)]
pub struct AddRelationResult {
    pub id: String,
    /// `true` if this exact (source, kind, target) triple already existed.
    pub deduplicated: bool,
}

/// Add a directed edge. Storing the same triple twice is idempotent.
pub fn add_relation(
    conn: &Connection,
    source_id: &str,
    kind: RelationKind,
    target_id: &str,
    now: DateTime<Utc>,
) -> Result<AddRelationResult> {
    let existing_id: Option<String> = conn
        .query_row(
            "SELECT id FROM relations WHERE source_id = ?1 AND kind = ?2 AND target_id = ?3",
            params![source_id, kind.as_str(), target_id],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(id) = existing_id {
        return Ok(AddRelationResult {
            id,
            deduplicated: true,
        });
    }

    let id = uuid::Uuid::now_v7().to_string();
    conn.execute(
        "INSERT INTO relations (id, source_id, kind, target_id, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id, source_id, kind.as_str(), target_id, timestamp(now)],
    )?;

    Ok(AddRelationResult {
        id,
        deduplicated: false,
    })
}

/// All edges touching an entry, in either direction.
pub fn relations_for(conn: &Connection, entry_id: &str) -> Result<Vec<KnowledgeRelation>> {
    let mut stmt = conn.prepare(
        "SELECT id, source_id, kind, target_id, created_at FROM relations \
         WHERE source_id = ?1 OR target_id = ?1 ORDER BY created_at, id",
    )?;
    let rows = stmt
        .query_map(params![entry_id], |row| {
            let kind: String = row.get(2)?;
            Ok(KnowledgeRelation {
                id: row.get(0)?,
                source_id: row.get(1)?,
                kind: kind.parse().map_err(|e: String| {
                    rusqlite::Error::FromSqlConversionFailure(
                        2,
                        rusqlite::types::Type::Text,
                        e.into(),
                    )
                })?,
                target_id: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// IDs on the other end of every `contradicts` edge touching `entry_id`.
pub fn contradiction_counterparts(conn: &Connection, entry_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT target_id FROM relations WHERE kind = 'contradicts' AND source_id = ?1 \
         UNION \
         SELECT source_id FROM relations WHERE kind = 'contradicts' AND target_id = ?1",
    )?;
    let rows = stmt
        .query_map(params![entry_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(rows)
}

/// Record an unresolved contradiction: one edge, both endpoints `conflicted`.
pub fn mark_conflicted(
    conn: &Connection,
    new_id: &str,
    existing_id: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    add_relation(conn, new_id, RelationKind::Contradicts, existing_id, now)?;
    for id in [new_id, existing_id] {
        store::set_status(conn, id, EntryStatus::Conflicted, None, now)?;
    }
    let details = serde_json::json!({"with": existing_id, "reason": reason});
    write_audit_log(conn, "conflict", new_id, Some(&details))?;
    Ok(())
}

/// Drop the contradiction between `resolved_id` and `counterpart_id`, and
/// return the counterpart to `active` if nothing else still contradicts it.
///
/// Returns `true` when the counterpart was restored.
pub fn restore_counterpart(
    conn: &Connection,
    counterpart_id: &str,
    resolved_id: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    conn.execute(
        "DELETE FROM relations WHERE kind = 'contradicts' AND \
         ((source_id = ?1 AND target_id = ?2) OR (source_id = ?2 AND target_id = ?1))",
        params![counterpart_id, resolved_id],
    )?;

    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM entries WHERE id = ?1",
            params![counterpart_id],
            |row| row.get(0),
        )
        .optional()?;
    if status.as_deref() != Some(EntryStatus::Conflicted.as_str()) {
        return Ok(false);
    }
    if !contradiction_counterparts(conn, counterpart_id)?.is_empty() {
        return Ok(false);
    }

    store::set_status(conn, counterpart_id, EntryStatus::Active, None, now)?;
    write_audit_log(
        conn,
        "resolve",
        counterpart_id,
        Some(&serde_json::json!({"resolved_with": resolved_id})),
    )?;
    Ok(true)
}

/// Release every contradiction held by an entry that is leaving the live set.
///
/// Returns the IDs of counterparts that went back to `active`.
pub fn release_conflicts(
    conn: &Connection,
    resolved_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    let mut restored = Vec::new();
    for counterpart in contradiction_counterparts(conn, resolved_id)? {
        if restore_counterpart(conn, &counterpart, resolved_id, now)? {
            restored.push(counterpart);
        }
    }
    Ok(restored)
}

/// Retire `loser` in favor of `winner`.
///
/// Any contradictions the loser held are released first, so a counterpart
/// left with no remaining conflict goes back to `active`.
pub fn supersede(
    conn: &Connection,
    loser_id: &str,
    winner_id: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    release_conflicts(conn, loser_id, now)?;
    store::set_status(conn, loser_id, EntryStatus::Superseded, Some(winner_id), now)?;
    add_relation(conn, winner_id, RelationKind::Supersedes, loser_id, now)?;
    write_audit_log(
        conn,
        "supersede",
        loser_id,
        Some(&serde_json::json!({"by": winner_id, "reason": reason})),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::knowledge::store::{get_entry, insert_entry};
    use crate::knowledge::types::{CandidateEntry, KnowledgeType, Scope};

    fn test_db() -> Connection {
        db::open_memory_database(4).unwrap()
    }

    fn entry(conn: &Connection, content: &str) -> String {
        let candidate = CandidateEntry {
            entry_type: KnowledgeType::Fact,
            content: content.to_string(),
            topics: vec!["t".into()],
            confidence: 0.8,
            scope: Scope::Personal,
            source: None,
        };
        insert_entry(conn, &candidate, &[], None, Utc::now()).unwrap().id
    }

    fn status(conn: &Connection, id: &str) -> EntryStatus {
        get_entry(conn, id).unwrap().unwrap().status
    }

    #[test]
    fn add_relation_deduplicates() {
        let conn = test_db();
        let a = entry(&conn, "a");
        let b = entry(&conn, "b");
        let first = add_relation(&conn, &a, RelationKind::Supports, &b, Utc::now()).unwrap();
        let second = add_relation(&conn, &a, RelationKind::Supports, &b, Utc::now()).unwrap();
        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.id, second.id);
        assert_eq!(relations_for(&conn, &b).unwrap().len(), 1);
    }

    #[test]
    fn conflict_then_supersede_restores_counterpart() {
        let conn = test_db();
        let old = entry(&conn, "Port is 8080");
        let new = entry(&conn, "Port is 9090");
        mark_conflicted(&conn, &new, &old, "disagree on port", Utc::now()).unwrap();
        assert_eq!(status(&conn, &old), EntryStatus::Conflicted);
        assert_eq!(status(&conn, &new), EntryStatus::Conflicted);

        supersede(&conn, &old, &new, "newer", Utc::now()).unwrap();

        assert_eq!(status(&conn, &new), EntryStatus::Active);
        let loser = get_entry(&conn, &old).unwrap().unwrap();
        assert_eq!(loser.status, EntryStatus::Superseded);
        assert_eq!(loser.superseded_by.as_deref(), Some(new.as_str()));
        assert!(contradiction_counterparts(&conn, &new).unwrap().is_empty());

        let edges = relations_for(&conn, &new).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].kind, RelationKind::Supersedes);
        assert_eq!(edges[0].source_id, new);
    }

    #[test]
    fn counterpart_stays_conflicted_while_other_contradictions_remain() {
        let conn = test_db();
        let hub = entry(&conn, "hub");
        let x = entry(&conn, "x");
        let y = entry(&conn, "y");
        mark_conflicted(&conn, &x, &hub, "r", Utc::now()).unwrap();
        mark_conflicted(&conn, &y, &hub, "r", Utc::now()).unwrap();

        let restored = release_conflicts(&conn, &x, Utc::now()).unwrap();
        assert!(restored.is_empty());
        assert_eq!(status(&conn, &hub), EntryStatus::Conflicted);

        let restored = release_conflicts(&conn, &y, Utc::now()).unwrap();
        assert_eq!(restored, vec![hub.clone()]);
        assert_eq!(status(&conn, &hub), EntryStatus::Active);
    }

    #[test]
    fn restore_ignores_entries_that_are_not_conflicted() {
        let conn = test_db();
        let a = entry(&conn, "a");
        let b = entry(&conn, "b");
        assert!(!restore_counterpart(&conn, &a, &b, Utc::now()).unwrap());
        assert_eq!(status(&conn, &a), EntryStatus::Active);
        assert!(!restore_counterpart(&conn, "missing", &b, Utc::now()).unwrap());
    }
}
