//! Contradiction scan over entries created or changed in the current chunk.
//!
//! Candidates are live entries that share a topic with the changed entry and
//! sit in the band `[min_similarity, reconcile_threshold)`: related, but not
//! near-duplicates (those were already handled by reconciliation).

use std::collections::HashSet;
use std::sync::Mutex;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::Value;

use super::lock_db;
use super::response::{find_json, str_field, string_list, unit_field};
use crate::knowledge::relations::{mark_conflicted, supersede};
use crate::knowledge::store::{self, EntryRevision};
use crate::knowledge::types::{KnowledgeEntry, KnowledgeType};
use crate::knowledge::cosine_similarity;
use crate::llm::CompletionProvider;

pub const CONTRADICTION_SYSTEM: &str = "You check a knowledge base for logical conflicts. You \
are shown one new entry and several related existing entries. For each existing entry decide \
whether it conflicts with the new one and how to resolve it. Answer with JSON only.";

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    NoConflict,
    /// The existing candidate is outdated; the new entry replaces it.
    SupersedeOld,
    /// The new entry is wrong or outdated; the candidate stands.
    SupersedeNew,
    /// Fold both into the new entry. Missing fields keep the new entry's values.
    Merge(EntryRevision),
    /// A real conflict that needs a human.
    Irresolvable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionItem {
    pub candidate_id: String,
    pub resolution: Resolution,
}

/// Totals for one scan.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct ScanReport {
    /// Pairs left `conflicted`.
    pub conflicts_detected: u64,
    /// Pairs settled by superseding or merging.
    pub conflicts_resolved: u64,
}

pub fn build_prompt(entry: &KnowledgeEntry, candidates: &[(KnowledgeEntry, f64)]) -> String {
    let mut prompt = format!(
        "## New entry\n[{}] ({}) {}\n\n## Related existing entries\n",
        entry.id, entry.entry_type, entry.content
    );
    for (candidate, similarity) in candidates {
        prompt.push_str(&format!(
            "- [{}] ({}, similarity {:.2}) {}\n",
            candidate.id, candidate.entry_type, similarity, candidate.content
        ));
    }
    prompt.push_str(
        "\n## Task\n\
         Return a JSON array with one object per existing entry:\n\
         {\"candidateId\": \"…\", \"resolution\": \"no_conflict|supersede_old|supersede_new|merge|irresolvable\", \
         \"mergedContent\": \"…\", \"mergedType\": \"…\", \"mergedTopics\": [\"…\"], \"mergedConfidence\": 0.0-1.0}\n\
         Merged fields are only needed for merge. Use irresolvable only when the conflict \
         cannot be settled from the information given.\n",
    );
    prompt
}

/// Parse resolutions. Malformed items are discarded; a malformed response
/// yields nothing.
pub fn parse_resolutions(text: &str) -> Vec<ResolutionItem> {
    let items = match find_json(text) {
        Some(Value::Array(items)) => items,
        Some(value @ Value::Object(_)) => match value.get("results").and_then(Value::as_array) {
            Some(items) => items.clone(),
            None => vec![value],
        },
        _ => {
            tracing::warn!("contradiction response had no usable JSON, discarding");
            return Vec::new();
        }
    };
    items.iter().filter_map(parse_item).collect()
}

fn parse_item(item: &Value) -> Option<ResolutionItem> {
    let candidate_id = str_field(item, "candidateId")
        .or_else(|| str_field(item, "candidate_id"))?
        .to_string();
    let resolution = match str_field(item, "resolution")?.to_ascii_lowercase().as_str() {
        "no_conflict" => Resolution::NoConflict,
        "supersede_old" => Resolution::SupersedeOld,
        "supersede_new" => Resolution::SupersedeNew,
        "irresolvable" => Resolution::Irresolvable,
        "merge" => Resolution::Merge(EntryRevision {
            content: str_field(item, "mergedContent").map(str::to_string),
            entry_type: str_field(item, "mergedType").map(KnowledgeType::parse_lenient),
            topics: string_list(item, "mergedTopics"),
            confidence: unit_field(item, "mergedConfidence"),
        }),
        other => {
            tracing::warn!(resolution = other, "unknown contradiction resolution, discarding");
            return None;
        }
    };
    Some(ResolutionItem {
        candidate_id,
        resolution,
    })
}

pub struct ContradictionScanner<'a> {
    pub db: &'a Mutex<Connection>,
    pub llm: &'a dyn CompletionProvider,
    pub min_similarity: f64,
    pub max_similarity: f64,
}

impl ContradictionScanner<'_> {
    /// Scan every entry in `changed`, in order.
    ///
    /// Entries superseded earlier in the same pass are skipped both as subjects
    /// and as candidates.
    pub async fn scan(&self, changed: &[String], now: DateTime<Utc>) -> Result<ScanReport> {
        let changed_set: HashSet<String> = changed.iter().cloned().collect();
        let mut superseded: HashSet<String> = HashSet::new();
        let mut report = ScanReport::default();

        for id in changed {
            if superseded.contains(id) {
                continue;
            }
            let Some((entry, candidates)) = self.candidates_for(id, &changed_set, &superseded)?
            else {
                continue;
            };

            let response = self
                .llm
                .complete(CONTRADICTION_SYSTEM, &build_prompt(&entry, &candidates))
                .await?;
            let valid: HashSet<&str> = candidates.iter().map(|(c, _)| c.id.as_str()).collect();

            for item in parse_resolutions(&response) {
                if !valid.contains(item.candidate_id.as_str()) {
                    tracing::warn!(entry = %id, candidate = %item.candidate_id, "ignoring resolution for unknown candidate");
                    continue;
                }
                if superseded.contains(&item.candidate_id) {
                    continue;
                }
                let candidate_id = item.candidate_id.as_str();

                match item.resolution {
                    Resolution::NoConflict => {}
                    Resolution::SupersedeOld => {
                        self.atomically(|conn| supersede(conn, candidate_id, id, "supersede_old", now))?;
                        superseded.insert(item.candidate_id.clone());
                        report.conflicts_resolved += 1;
                    }
                    Resolution::SupersedeNew => {
                        self.atomically(|conn| supersede(conn, id, candidate_id, "supersede_new", now))?;
                        superseded.insert(id.clone());
                        report.conflicts_resolved += 1;
                        tracing::info!(entry = %id, by = %candidate_id, "new entry superseded");
                        break;
                    }
                    Resolution::Merge(revision) => {
                        self.atomically(|conn| {
                            let sources = store::get_entry(conn, candidate_id)?
                                .map(|c| c.source_ids)
                                .unwrap_or_default();
                            store::revise_entry(conn, id, &revision, &sources, None, now, "merge")?;
                            supersede(conn, candidate_id, id, "merge", now)
                        })?;
                        superseded.insert(item.candidate_id.clone());
                        report.conflicts_resolved += 1;
                    }
                    Resolution::Irresolvable => {
                        self.atomically(|conn| {
                            mark_conflicted(conn, id, candidate_id, "irresolvable", now)
                        })?;
                        report.conflicts_detected += 1;
                        tracing::info!(entry = %id, with = %candidate_id, "conflict needs review");
                    }
                }
            }
        }
        Ok(report)
    }

    /// The changed entry and its in-band candidates, or `None` if there is
    /// nothing to check.
    fn candidates_for(
        &self,
        id: &str,
        changed: &HashSet<String>,
        superseded: &HashSet<String>,
    ) -> Result<Option<(KnowledgeEntry, Vec<(KnowledgeEntry, f64)>)>> {
        let conn = lock_db(self.db)?;
        let Some(entry) = store::get_entry(&conn, id)? else {
            return Ok(None);
        };
        if !entry.status.is_live() || entry.topics.is_empty() {
            return Ok(None);
        }
        let Some(embedding) = store::get_embedding(&conn, id)? else {
            return Ok(None);
        };

        let exclude: HashSet<String> = changed.union(superseded).cloned().collect();
        let mut candidates = Vec::new();
        for candidate in store::live_entries_sharing_topics(&conn, &entry.topics, &exclude)? {
            let Some(other) = store::get_embedding(&conn, &candidate.id)? else {
                continue;
            };
            let similarity = cosine_similarity(&embedding, &other);
            if similarity >= self.min_similarity && similarity < self.max_similarity {
                candidates.push((candidate, similarity));
            }
        }
        if candidates.is_empty() {
            return Ok(None);
        }
        Ok(Some((entry, candidates)))
    }

    fn atomically<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut conn = lock_db(self.db)?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}
