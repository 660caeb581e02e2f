//! Query-time retrieval: decay-weighted semantic ranking with contradiction
//! annotation and retrieval reinforcement.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;

use super::relations::contradiction_counterparts;
use super::store;
use super::types::{EntryStatus, KnowledgeEntry};
use super::{cosine_similarity, days_between, parse_timestamp};

#[derive(Debug, Clone, Copy)]
pub struct ActivationOptions {
    pub limit: usize,
    /// Minimum raw cosine similarity. Strength never takes part in this filter.
    pub threshold: f64,
    /// Strength below which a result is flagged as possibly stale.
    pub stale_strength: f64,
}

impl From<&crate::config::ActivationConfig> for ActivationOptions {
    fn from(config: &crate::config::ActivationConfig) -> Self {
        Self {
            limit: config.default_limit,
            threshold: config.default_threshold,
            stale_strength: config.stale_strength,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Staleness {
    pub age_days: f64,
    pub strength: f64,
    pub last_accessed_days_ago: f64,
    pub may_be_stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContradictionNote {
    pub counterpart_id: String,
    pub counterpart_content: String,
    pub caution: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivatedEntry {
    pub entry: KnowledgeEntry,
    pub raw_similarity: f64,
    /// `raw_similarity × strength`; the ranking key.
    pub similarity: f64,
    pub staleness: Staleness,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contradiction: Option<ContradictionNote>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivationResult {
    pub entries: Vec<ActivatedEntry>,
    pub total_live_count: u64,
}

/// Rank live entries against a query embedding.
///
/// Returned entries are the pre-access snapshot; their access counters are
/// incremented in the store as a side effect.
pub fn activate(
    conn: &Connection,
    query_embedding: &[f32],
    options: ActivationOptions,
    now: DateTime<Utc>,
) -> Result<ActivationResult> {
    let mut scored: Vec<(KnowledgeEntry, f64, f64)> = store::live_entries_with_embeddings(conn)?
        .into_iter()
        .filter_map(|(entry, embedding)| {
            let raw = cosine_similarity(query_embedding, &embedding?);
            (raw >= options.threshold).then(|| {
                let score = raw * entry.strength;
                (entry, raw, score)
            })
        })
        .collect();

    scored.sort_by(|a, b| {
        b.2.partial_cmp(&a.2)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal))
    });
    scored.truncate(options.limit);

    let ids: Vec<&str> = scored.iter().map(|(e, _, _)| e.id.as_str()).collect();
    store::record_access(conn, &ids, now)?;

    let returned: HashMap<&str, &KnowledgeEntry> =
        scored.iter().map(|(e, _, _)| (e.id.as_str(), e)).collect();

    let mut entries = Vec::with_capacity(scored.len());
    for (entry, raw, score) in &scored {
        let contradiction = if entry.status == EntryStatus::Conflicted {
            contradiction_counterparts(conn, &entry.id)?
                .into_iter()
                .find_map(|id| returned.get(id.as_str()).copied())
                .map(|counterpart| ContradictionNote {
                    counterpart_id: counterpart.id.clone(),
                    counterpart_content: counterpart.content.clone(),
                    caution: "This entry conflicts with another result. Confirm which \
                              one still holds before relying on either."
                        .to_string(),
                })
        } else {
            None
        };

        entries.push(ActivatedEntry {
            staleness: Staleness {
                age_days: days_between(parse_timestamp(&entry.created_at), now),
                strength: entry.strength,
                last_accessed_days_ago: days_between(parse_timestamp(&entry.last_accessed_at), now),
                may_be_stale: entry.strength < options.stale_strength,
            },
            entry: entry.clone(),
            raw_similarity: *raw,
            similarity: *score,
            contradiction,
        });
    }

    Ok(ActivationResult {
        entries,
        total_live_count: store::count_live(conn)?,
    })
}
