//! SQL DDL for all lore tables.
//!
//! Defines `entries`, `entry_topics`, `entries_vec` (vec0), `relations`,
//! `consolidation_state`, `processed_episodes`, `knowledge_log`, and
//! `schema_meta`. All DDL uses `IF NOT EXISTS` for idempotent initialization.

use rusqlite::Connection;

/// All schema DDL statements for the core tables.
const SCHEMA_SQL: &str = r#"
-- Knowledge entries
CREATE TABLE IF NOT EXISTS entries (
    id TEXT PRIMARY KEY,
    type TEXT NOT NULL CHECK(type IN ('fact','principle','pattern','decision','procedure')),
    scope TEXT NOT NULL DEFAULT 'personal' CHECK(scope IN ('personal','team')),
    content TEXT NOT NULL,
    confidence REAL NOT NULL CHECK(confidence >= 0.0 AND confidence <= 1.0),
    status TEXT NOT NULL DEFAULT 'active'
        CHECK(status IN ('active','archived','superseded','conflicted','tombstoned')),
    superseded_by TEXT,
    strength REAL NOT NULL CHECK(strength >= 0.0 AND strength <= 1.0),
    access_count INTEGER NOT NULL DEFAULT 0,
    observation_count INTEGER NOT NULL DEFAULT 1,
    source_ids TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_accessed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entries_status ON entries(status);
CREATE INDEX IF NOT EXISTS idx_entries_type ON entries(type);

-- Topic labels, one row per (entry, topic)
CREATE TABLE IF NOT EXISTS entry_topics (
    entry_id TEXT NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
    topic TEXT NOT NULL,
    PRIMARY KEY (entry_id, topic)
);

CREATE INDEX IF NOT EXISTS idx_entry_topics_topic ON entry_topics(topic);

-- Directed edges between entries
CREATE TABLE IF NOT EXISTS relations (
    id TEXT PRIMARY KEY,
    source_id TEXT NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
    kind TEXT NOT NULL CHECK(kind IN ('supports','contradicts','refines','depends_on','supersedes')),
    target_id TEXT NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_relations_source ON relations(source_id);
CREATE INDEX IF NOT EXISTS idx_relations_target ON relations(target_id);
CREATE INDEX IF NOT EXISTS idx_relations_kind ON relations(kind);

-- Singleton cursor and cumulative counters
CREATE TABLE IF NOT EXISTS consolidation_state (
    id INTEGER PRIMARY KEY CHECK(id = 1),
    last_run_at TEXT,
    cursor_ms INTEGER NOT NULL DEFAULT 0,
    sessions_processed INTEGER NOT NULL DEFAULT 0,
    entries_created INTEGER NOT NULL DEFAULT 0,
    entries_updated INTEGER NOT NULL DEFAULT 0
);

INSERT OR IGNORE INTO consolidation_state (id) VALUES (1);

-- Episodes already consolidated, keyed by stable record identity
CREATE TABLE IF NOT EXISTS processed_episodes (
    session_id TEXT NOT NULL,
    start_record_id TEXT NOT NULL,
    end_record_id TEXT NOT NULL,
    kind TEXT NOT NULL CHECK(kind IN ('summary','messages')),
    processed_at TEXT NOT NULL,
    PRIMARY KEY (session_id, start_record_id, end_record_id, kind)
);

-- Audit log
CREATE TABLE IF NOT EXISTS knowledge_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL CHECK(operation IN
        ('create','update','reinforce','supersede','conflict','resolve','archive','tombstone','reset')),
    entry_id TEXT NOT NULL,
    details TEXT,
    created_at TEXT NOT NULL
);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
///
/// `dimensions` fixes the width of the vec0 embedding column; it only takes
/// effect the first time the table is created.
pub fn init_schema(conn: &Connection, dimensions: usize) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    // vec0 virtual table must be created separately (sqlite-vec syntax).
    conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS entries_vec USING vec0(\n\
             id TEXT PRIMARY KEY,\n\
             embedding FLOAT[{dimensions}] distance_metric=cosine\n\
         );"
    ))?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('embedding_dimensions', ?1)",
        [dimensions.to_string()],
    )?;

    Ok(())
}
