//! Forgetting curve: strength recomputation, archival, and tombstoning.
//!
//! ```text
//! effective_half_life = base(type) × (1 + log2(1 + observations)) × (1 + log2(1 + accesses))
//! strength            = clamp(confidence × exp(-ln2 × days_since_access / effective_half_life), 0, 1)
//! ```

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;

use super::relations::release_conflicts;
use super::store::{self, write_audit_log};
use super::types::{EntryStatus, KnowledgeEntry};
use super::{days_between, parse_timestamp, timestamp};
use crate::config::DecayConfig;

/// Outcome of one decay pass.
#[derive(Debug, Default, Clone, Serialize)]
pub struct DecayReport {
    /// Live entries whose strength was recomputed.
    pub entries_scored: usize,
    pub entries_archived: usize,
    pub entries_tombstoned: usize,
    /// Conflicted counterparts returned to active because their opponent was archived.
    pub conflicts_released: usize,
}

/// Half-life in days after evidence and retrieval bonuses. Never below `base_days`.
pub fn effective_half_life(base_days: f64, observation_count: u32, access_count: u32) -> f64 {
    let observation_bonus = 1.0 + (1.0 + observation_count as f64).log2();
    let access_bonus = 1.0 + (1.0 + access_count as f64).log2();
    base_days * observation_bonus * access_bonus
}

/// Decayed strength; `confidence` is the ceiling.
pub fn decayed_strength(confidence: f64, days_since_access: f64, half_life_days: f64) -> f64 {
    if half_life_days <= 0.0 {
        return 0.0;
    }
    let factor = (-std::f64::consts::LN_2 * days_since_access.max(0.0) / half_life_days).exp();
    (confidence * factor).clamp(0.0, 1.0)
}

/// Strength of `entry` at `now`.
pub fn strength_of(entry: &KnowledgeEntry, config: &DecayConfig, now: DateTime<Utc>) -> f64 {
    let half_life = effective_half_life(
        config.half_life_days(entry.entry_type),
        entry.observation_count,
        entry.access_count,
    );
    let days = days_between(parse_timestamp(&entry.last_accessed_at), now);
    decayed_strength(entry.confidence, days, half_life)
}

/// Recompute every live entry's strength, archive the weak, and tombstone
/// entries archived for longer than the tombstone window.
///
/// Runs in one transaction so an interrupted pass leaves nothing half-applied.
pub fn run_decay(
    conn: &mut Connection,
    config: &DecayConfig,
    now: DateTime<Utc>,
) -> Result<DecayReport> {
    let tx = conn.transaction()?;
    let mut report = DecayReport::default();

    for entry in store::live_entries(&tx)? {
        let strength = strength_of(&entry, config, now);
        store::set_strength(&tx, &entry.id, strength)?;
        report.entries_scored += 1;

        if strength < config.archive_threshold {
            report.conflicts_released += release_conflicts(&tx, &entry.id, now)?.len();
            store::set_status(&tx, &entry.id, EntryStatus::Archived, None, now)?;
            write_audit_log(
                &tx,
                "archive",
                &entry.id,
                Some(&serde_json::json!({"strength": strength})),
            )?;
            report.entries_archived += 1;
        }
    }

    let cutoff = timestamp(now - Duration::days(config.tombstone_after_days));
    let expired: Vec<String> = {
        let mut stmt = tx.prepare(
            "SELECT id FROM entries WHERE status = 'archived' AND updated_at < ?1 ORDER BY id",
        )?;
        let ids = stmt
            .query_map(params![cutoff], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        ids
    };
    for id in &expired {
        store::set_status(&tx, id, EntryStatus::Tombstoned, None, now)?;
        write_audit_log(&tx, "tombstone", id, None)?;
    }
    report.entries_tombstoned = expired.len();

    tx.commit()?;

    if report.entries_archived > 0 || report.entries_tombstoned > 0 {
        tracing::info!(
            scored = report.entries_scored,
            archived = report.entries_archived,
            tombstoned = report.entries_tombstoned,
            "decay pass complete"
        );
    }
    Ok(report)
}
