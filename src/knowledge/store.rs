//! Entry persistence: insert, revise, reinforce, status changes, embeddings,
//! and the audit log.
//!
//! Every function here is one short statement group against a borrowed
//! [`Connection`]. Callers that need several of them to land together pass a
//! [`rusqlite::Transaction`] (which derefs to `Connection`) and commit it.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::{HashMap, HashSet};

use super::types::{
    normalize_topics, CandidateEntry, EntryStatus, KnowledgeEntry, KnowledgeType,
};
use super::{bytes_to_embedding, embedding_to_bytes, timestamp};

/// Column list matching [`entry_from_row`]. Expects the entries table aliased as `e`.
const ENTRY_COLUMNS: &str = "e.id, e.type, e.scope, e.content, e.confidence, e.status, \
     e.superseded_by, e.strength, e.access_count, e.observation_count, e.source_ids, \
     e.created_at, e.updated_at, e.last_accessed_at, \
     (SELECT json_group_array(t.topic) FROM entry_topics t WHERE t.entry_id = e.id)";

const LIVE_FILTER: &str = "e.status IN ('active','conflicted')";

/// Field overrides applied to an existing entry. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryRevision {
    pub content: Option<String>,
    pub entry_type: Option<KnowledgeType>,
    pub topics: Option<Vec<String>>,
    pub confidence: Option<f64>,
}

fn parse_column<T>(idx: usize, value: String) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    value.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

fn json_list(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<KnowledgeEntry> {
    Ok(KnowledgeEntry {
        id: row.get(0)?,
        entry_type: parse_column(1, row.get(1)?)?,
        scope: parse_column(2, row.get(2)?)?,
        content: row.get(3)?,
        confidence: row.get(4)?,
        status: parse_column(5, row.get(5)?)?,
        superseded_by: row.get(6)?,
        strength: row.get(7)?,
        access_count: row.get(8)?,
        observation_count: row.get(9)?,
        source_ids: json_list(row.get(10)?),
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
        last_accessed_at: row.get(13)?,
        topics: json_list(row.get(14)?),
    })
}

/// Union two provenance lists, keeping first-seen order.
fn union_sources(existing: &[String], extra: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(existing.len() + extra.len());
    for id in existing.iter().chain(extra) {
        if !id.is_empty() && !out.contains(id) {
            out.push(id.clone());
        }
    }
    out
}

/// Insert a new active entry from a candidate. Observation count starts at 1
/// and strength starts at the candidate's confidence.
pub fn insert_entry(
    conn: &Connection,
    candidate: &CandidateEntry,
    source_ids: &[String],
    embedding: Option<&[f32]>,
    now: DateTime<Utc>,
) -> Result<KnowledgeEntry> {
    let id = uuid::Uuid::now_v7().to_string();
    let ts = timestamp(now);
    let confidence = candidate.confidence.clamp(0.0, 1.0);
    let topics = normalize_topics(&candidate.topics);
    let sources = union_sources(&[], source_ids);

    conn.execute(
        "INSERT INTO entries (id, type, scope, content, confidence, status, strength, \
         access_count, observation_count, source_ids, created_at, updated_at, last_accessed_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?5, 0, 1, ?6, ?7, ?7, ?7)",
        params![
            id,
            candidate.entry_type.as_str(),
            candidate.scope.as_str(),
            candidate.content,
            confidence,
            serde_json::to_string(&sources)?,
            ts,
        ],
    )?;
    replace_topics(conn, &id, &topics)?;
    if let Some(embedding) = embedding {
        set_embedding(conn, &id, embedding)?;
    }

    write_audit_log(
        conn,
        "create",
        &id,
        Some(&serde_json::json!({"type": candidate.entry_type, "sources": sources})),
    )?;

    Ok(KnowledgeEntry {
        id,
        entry_type: candidate.entry_type,
        scope: candidate.scope,
        content: candidate.content.clone(),
        topics,
        confidence,
        status: EntryStatus::Active,
        superseded_by: None,
        strength: confidence,
        access_count: 0,
        observation_count: 1,
        source_ids: sources,
        created_at: ts.clone(),
        updated_at: ts.clone(),
        last_accessed_at: ts,
    })
}

/// Fetch one entry by ID.
pub fn get_entry(conn: &Connection, id: &str) -> Result<Option<KnowledgeEntry>> {
    let sql = format!("SELECT {ENTRY_COLUMNS} FROM entries e WHERE e.id = ?1");
    Ok(conn.query_row(&sql, params![id], entry_from_row).optional()?)
}

/// Batch-fetch entries by ID, keyed by ID.
pub fn get_entries(conn: &Connection, ids: &[&str]) -> Result<HashMap<String, KnowledgeEntry>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM entries e WHERE e.id IN ({})",
        placeholders.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(ids.iter()), entry_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().map(|e| (e.id.clone(), e)).collect())
}

/// All live (active or conflicted) entries.
pub fn live_entries(conn: &Connection) -> Result<Vec<KnowledgeEntry>> {
    let sql = format!("SELECT {ENTRY_COLUMNS} FROM entries e WHERE {LIVE_FILTER} ORDER BY e.id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], entry_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// All live entries paired with their embedding, if one is stored.
pub fn live_entries_with_embeddings(
    conn: &Connection,
) -> Result<Vec<(KnowledgeEntry, Option<Vec<f32>>)>> {
    let entries = live_entries(conn)?;
    let mut embeddings = all_embeddings(conn)?;
    Ok(entries
        .into_iter()
        .map(|e| {
            let emb = embeddings.remove(&e.id);
            (e, emb)
        })
        .collect())
}

fn all_embeddings(conn: &Connection) -> Result<HashMap<String, Vec<f32>>> {
    let mut stmt = conn.prepare("SELECT id, embedding FROM entries_vec")?;
    let rows = stmt
        .query_map([], |row| {
            let bytes: Vec<u8> = row.get(1)?;
            Ok((row.get::<_, String>(0)?, bytes_to_embedding(&bytes)))
        })?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(rows)
}

/// Fetch the stored embedding for one entry.
pub fn get_embedding(conn: &Connection, id: &str) -> Result<Option<Vec<f32>>> {
    let bytes: Option<Vec<u8>> = conn
        .query_row(
            "SELECT embedding FROM entries_vec WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(bytes.map(|b| bytes_to_embedding(&b)))
}

/// Store (or replace) an entry's embedding.
pub fn set_embedding(conn: &Connection, id: &str, embedding: &[f32]) -> Result<()> {
    conn.execute("DELETE FROM entries_vec WHERE id = ?1", params![id])?;
    conn.execute(
        "INSERT INTO entries_vec (id, embedding) VALUES (?1, ?2)",
        params![id, embedding_to_bytes(embedding)],
    )?;
    Ok(())
}

/// Drop an entry's embedding; it will be recomputed by the backfill pass.
pub fn clear_embedding(conn: &Connection, id: &str) -> Result<()> {
    conn.execute("DELETE FROM entries_vec WHERE id = ?1", params![id])?;
    Ok(())
}

/// Live entries that currently have no embedding, oldest first.
pub fn entries_missing_embedding(conn: &Connection, limit: usize) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT e.id, e.content FROM entries e \
         WHERE e.status IN ('active','conflicted') \
           AND e.id NOT IN (SELECT id FROM entries_vec) \
         ORDER BY e.id LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Evidence reinforcement: the same knowledge was observed again.
pub fn reinforce_evidence(conn: &Connection, id: &str, now: DateTime<Utc>) -> Result<()> {
    let rows = conn.execute(
        "UPDATE entries SET observation_count = observation_count + 1, last_accessed_at = ?1 \
         WHERE id = ?2",
        params![timestamp(now), id],
    )?;
    if rows == 0 {
        bail!("entry not found: {id}");
    }
    write_audit_log(conn, "reinforce", id, None)?;
    Ok(())
}

/// Retrieval reinforcement for every ID returned by a query.
pub fn record_access(conn: &Connection, ids: &[&str], now: DateTime<Utc>) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let ts = timestamp(now);
    let mut stmt = conn.prepare(
        "UPDATE entries SET access_count = access_count + 1, last_accessed_at = ?1 WHERE id = ?2",
    )?;
    for id in ids {
        stmt.execute(params![ts, id])?;
    }
    Ok(())
}

/// Overwrite an entry's fields, union its provenance, and swap its embedding.
///
/// `embedding = None` leaves the entry without a vector until the backfill pass.
/// Strength is reset to the (possibly new) confidence.
pub fn revise_entry(
    conn: &Connection,
    id: &str,
    revision: &EntryRevision,
    extra_sources: &[String],
    embedding: Option<&[f32]>,
    now: DateTime<Utc>,
    reason: &str,
) -> Result<KnowledgeEntry> {
    let Some(mut entry) = get_entry(conn, id)? else {
        bail!("entry not found: {id}");
    };

    if let Some(content) = &revision.content {
        entry.content = content.clone();
    }
    if let Some(kind) = revision.entry_type {
        entry.entry_type = kind;
    }
    if let Some(confidence) = revision.confidence {
        entry.confidence = confidence.clamp(0.0, 1.0);
    }
    if let Some(topics) = &revision.topics {
        entry.topics = normalize_topics(topics);
    }
    entry.source_ids = union_sources(&entry.source_ids, extra_sources);
    entry.strength = entry.confidence;
    entry.updated_at = timestamp(now);

    conn.execute(
        "UPDATE entries SET type = ?1, content = ?2, confidence = ?3, strength = ?3, \
         source_ids = ?4, updated_at = ?5 WHERE id = ?6",
        params![
            entry.entry_type.as_str(),
            entry.content,
            entry.confidence,
            serde_json::to_string(&entry.source_ids)?,
            entry.updated_at,
            id,
        ],
    )?;
    if revision.topics.is_some() {
        replace_topics(conn, id, &entry.topics)?;
    }

    clear_embedding(conn, id)?;
    if let Some(embedding) = embedding {
        set_embedding(conn, id, embedding)?;
    }

    write_audit_log(
        conn,
        "update",
        id,
        Some(&serde_json::json!({"reason": reason, "sources": extra_sources})),
    )?;
    Ok(entry)
}

/// Change an entry's lifecycle status. `superseded_by` is only kept for superseded entries.
pub fn set_status(
    conn: &Connection,
    id: &str,
    status: EntryStatus,
    superseded_by: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    let pointer = if status == EntryStatus::Superseded {
        superseded_by
    } else {
        None
    };
    let rows = conn.execute(
        "UPDATE entries SET status = ?1, superseded_by = ?2, updated_at = ?3 WHERE id = ?4",
        params![status.as_str(), pointer, timestamp(now), id],
    )?;
    if rows == 0 {
        bail!("entry not found: {id}");
    }
    Ok(())
}

/// Store a recomputed strength without touching `updated_at`.
pub fn set_strength(conn: &Connection, id: &str, strength: f64) -> Result<()> {
    conn.execute(
        "UPDATE entries SET strength = ?1 WHERE id = ?2",
        params![strength.clamp(0.0, 1.0), id],
    )?;
    Ok(())
}

fn replace_topics(conn: &Connection, id: &str, topics: &[String]) -> Result<()> {
    conn.execute("DELETE FROM entry_topics WHERE entry_id = ?1", params![id])?;
    let mut stmt =
        conn.prepare("INSERT OR IGNORE INTO entry_topics (entry_id, topic) VALUES (?1, ?2)")?;
    for topic in topics {
        stmt.execute(params![id, topic])?;
    }
    Ok(())
}

/// Live entries sharing at least one topic label, minus `exclude`.
pub fn live_entries_sharing_topics(
    conn: &Connection,
    topics: &[String],
    exclude: &HashSet<String>,
) -> Result<Vec<KnowledgeEntry>> {
    if topics.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders: Vec<String> = (1..=topics.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM entries e \
         WHERE {LIVE_FILTER} \
           AND e.id IN (SELECT entry_id FROM entry_topics WHERE topic IN ({})) \
         ORDER BY e.id",
        placeholders.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(topics.iter()), entry_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .filter(|e| !exclude.contains(&e.id))
        .collect())
}

/// Nearest live entries to `embedding` via sqlite-vec KNN, with cosine similarity.
///
/// Over-fetches from the vector index because non-live rows are filtered afterwards.
pub fn nearest_live(
    conn: &Connection,
    embedding: &[f32],
    k: usize,
) -> Result<Vec<(KnowledgeEntry, f64)>> {
    if k == 0 {
        return Ok(Vec::new());
    }
    let neighbors: Vec<(String, f64)> = {
        let mut stmt = conn.prepare(
            "SELECT id, distance FROM entries_vec \
             WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
        )?;
        let collected = stmt
            .query_map(params![embedding_to_bytes(embedding), (k * 3) as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        collected
    };

    let ids: Vec<&str> = neighbors.iter().map(|(id, _)| id.as_str()).collect();
    let mut entries = get_entries(conn, &ids)?;

    let mut out = Vec::with_capacity(k);
    for (id, distance) in &neighbors {
        if let Some(entry) = entries.remove(id) {
            if entry.status.is_live() {
                out.push((entry, 1.0 - distance));
            }
        }
        if out.len() >= k {
            break;
        }
    }
    Ok(out)
}

/// Number of live entries.
pub fn count_live(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM entries e WHERE e.status IN ('active','conflicted')",
        [],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Write an entry to the knowledge_log audit table.
pub fn write_audit_log(
    conn: &Connection,
    operation: &str,
    entry_id: &str,
    details: Option<&serde_json::Value>,
) -> Result<()> {
    let now = timestamp(Utc::now());
    let details_json = details.map(|d| d.to_string());
    conn.execute(
        "INSERT INTO knowledge_log (operation, entry_id, details, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![operation, entry_id, details_json, now],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::knowledge::types::Scope;

    const DIM: usize = 4;

    fn test_db() -> Connection {
        db::open_memory_database(DIM).unwrap()
    }

    fn candidate(content: &str, topics: &[&str]) -> CandidateEntry {
        CandidateEntry {
            entry_type: KnowledgeType::Fact,
            content: content.to_string(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
            confidence: 0.8,
            scope: Scope::Personal,
            source: None,
        }
    }

    fn unit(i: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; DIM];
        v[i] = 1.0;
        v
    }

    #[test]
    fn insert_and_fetch_entry() {
        let conn = test_db();
        let now = Utc::now();
        let inserted = insert_entry(
            &conn,
            &candidate("The API listens on port 8080", &["Networking", "api"]),
            &["session-1".to_string()],
            Some(&unit(0)),
            now,
        )
        .unwrap();

        let fetched = get_entry(&conn, &inserted.id).unwrap().unwrap();
        assert_eq!(fetched.content, "The API listens on port 8080");
        assert_eq!(fetched.status, EntryStatus::Active);
        assert_eq!(fetched.observation_count, 1);
        assert_eq!(fetched.access_count, 0);
        assert!((fetched.strength - 0.8).abs() < 1e-9);
        assert_eq!(fetched.source_ids, vec!["session-1"]);
        let mut topics = fetched.topics.clone();
        topics.sort();
        assert_eq!(topics, vec!["api", "networking"]);
        assert_eq!(get_embedding(&conn, &inserted.id).unwrap(), Some(unit(0)));

        let op: String = conn
            .query_row(
                "SELECT operation FROM knowledge_log WHERE entry_id = ?1",
                params![inserted.id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(op, "create");
    }

    #[test]
    fn revise_overwrites_fields_and_unions_sources() {
        let conn = test_db();
        let now = Utc::now();
        let entry = insert_entry(
            &conn,
            &candidate("Port is 8080", &["ports"]),
            &["s1".to_string()],
            Some(&unit(0)),
            now,
        )
        .unwrap();

        let revision = EntryRevision {
            content: Some("Port is 9090".into()),
            entry_type: Some(KnowledgeType::Decision),
            topics: Some(vec!["ports".into(), "deploy".into()]),
            confidence: Some(0.95),
        };
        let revised = revise_entry(
            &conn,
            &entry.id,
            &revision,
            &["s1".to_string(), "s2".to_string()],
            Some(&unit(1)),
            now,
            "update",
        )
        .unwrap();

        assert_eq!(revised.content, "Port is 9090");
        assert_eq!(revised.entry_type, KnowledgeType::Decision);
        assert_eq!(revised.source_ids, vec!["s1", "s2"]);
        let stored = get_entry(&conn, &entry.id).unwrap().unwrap();
        assert_eq!(stored.content, "Port is 9090");
        assert!((stored.confidence - 0.95).abs() < 1e-9);
        assert_eq!(stored.topics.len(), 2);
        assert_eq!(get_embedding(&conn, &entry.id).unwrap(), Some(unit(1)));
    }

    #[test]
    fn partial_revision_keeps_missing_fields() {
        let conn = test_db();
        let now = Utc::now();
        let entry = insert_entry(&conn, &candidate("Old", &["x"]), &[], Some(&unit(0)), now)
            .unwrap();

        let revision = EntryRevision {
            content: Some("Merged".into()),
            ..Default::default()
        };
        revise_entry(&conn, &entry.id, &revision, &[], None, now, "merge").unwrap();

        let stored = get_entry(&conn, &entry.id).unwrap().unwrap();
        assert_eq!(stored.content, "Merged");
        assert_eq!(stored.entry_type, KnowledgeType::Fact);
        assert_eq!(stored.topics, vec!["x"]);
        assert!(get_embedding(&conn, &entry.id).unwrap().is_none());

        let missing = entries_missing_embedding(&conn, 10).unwrap();
        assert_eq!(missing, vec![(entry.id.clone(), "Merged".to_string())]);
    }

    #[test]
    fn reinforce_increments_observation_count() {
        let conn = test_db();
        let entry =
            insert_entry(&conn, &candidate("Fact", &[]), &[], None, Utc::now()).unwrap();
        reinforce_evidence(&conn, &entry.id, Utc::now()).unwrap();
        reinforce_evidence(&conn, &entry.id, Utc::now()).unwrap();
        let stored = get_entry(&conn, &entry.id).unwrap().unwrap();
        assert_eq!(stored.observation_count, 3);
        assert_eq!(stored.access_count, 0);
    }

    #[test]
    fn topic_lookup_excludes_non_live_and_excluded() {
        let conn = test_db();
        let now = Utc::now();
        let a = insert_entry(&conn, &candidate("A", &["ports"]), &[], None, now).unwrap();
        let b = insert_entry(&conn, &candidate("B", &["ports", "db"]), &[], None, now).unwrap();
        let c = insert_entry(&conn, &candidate("C", &["db"]), &[], None, now).unwrap();
        let d = insert_entry(&conn, &candidate("D", &["unrelated"]), &[], None, now).unwrap();
        set_status(&conn, &c.id, EntryStatus::Archived, None, now).unwrap();

        let exclude: HashSet<String> = [a.id.clone()].into_iter().collect();
        let found =
            live_entries_sharing_topics(&conn, &["ports".into(), "db".into()], &exclude).unwrap();
        let ids: Vec<&str> = found.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec![b.id.as_str()]);
        assert!(!ids.contains(&d.id.as_str()));
    }

    #[test]
    fn nearest_live_skips_superseded() {
        let conn = test_db();
        let now = Utc::now();
        let a = insert_entry(&conn, &candidate("A", &[]), &[], Some(&unit(0)), now).unwrap();
        let b = insert_entry(&conn, &candidate("B", &[]), &[], Some(&unit(1)), now).unwrap();
        set_status(&conn, &a.id, EntryStatus::Superseded, Some(&b.id), now).unwrap();

        let found = nearest_live(&conn, &unit(0), 5).unwrap();
        let ids: Vec<&str> = found.iter().map(|(e, _)| e.id.as_str()).collect();
        assert_eq!(ids, vec![b.id.as_str()]);
        assert!(found[0].1.abs() < 1e-6, "orthogonal vectors have similarity 0");
    }

    #[test]
    fn set_status_only_keeps_pointer_for_superseded() {
        let conn = test_db();
        let now = Utc::now();
        let a = insert_entry(&conn, &candidate("A", &[]), &[], None, now).unwrap();
        set_status(&conn, &a.id, EntryStatus::Archived, Some("ignored"), now).unwrap();
        let stored = get_entry(&conn, &a.id).unwrap().unwrap();
        assert_eq!(stored.status, EntryStatus::Archived);
        assert!(stored.superseded_by.is_none());

        assert!(set_status(&conn, "missing", EntryStatus::Active, None, now).is_err());
    }
}
