//! Reconciliation: each extracted candidate is compared with its nearest live
//! entry and inserted, merged into it, or dropped as already known.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::Value;

use super::lock_db;
use super::response::{find_json, str_field, string_list, unit_field};
use crate::embedding::EmbeddingProvider;
use crate::knowledge::cosine_similarity;
use crate::knowledge::store::{self, EntryRevision};
use crate::knowledge::types::{CandidateEntry, KnowledgeEntry, KnowledgeType};
use crate::llm::CompletionProvider;

pub const RECONCILE_SYSTEM: &str = "You maintain a knowledge base without duplicates. You are \
shown one existing entry and one newly extracted candidate that look nearly identical. \
Decide what to do and answer with JSON only.";

/// What the reconciliation collaborator decided.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileDecision {
    /// The candidate adds nothing; reinforce the existing entry.
    Keep,
    /// Refine the existing entry with the given fields.
    Update(EntryRevision),
    /// The existing entry is outdated; overwrite it.
    Replace(EntryRevision),
    /// Distinct despite the similarity; insert the candidate.
    Insert,
}

/// Result of reconciling one candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Inserted(String),
    Updated(String),
    Kept(String),
}

impl ReconcileOutcome {
    /// ID of an entry created or changed by this outcome.
    pub fn changed_id(&self) -> Option<&str> {
        match self {
            Self::Inserted(id) | Self::Updated(id) => Some(id),
            Self::Kept(_) => None,
        }
    }
}

pub fn build_prompt(existing: &KnowledgeEntry, candidate: &CandidateEntry) -> String {
    format!(
        "## Existing entry\n\
         type: {}\ncontent: {}\ntopics: {}\nconfidence: {:.2}\n\n\
         ## Candidate\n\
         type: {}\ncontent: {}\ntopics: {}\nconfidence: {:.2}\n\n\
         ## Task\n\
         Answer with one JSON object:\n\
         - {{\"action\": \"keep\"}} if the candidate says nothing new;\n\
         - {{\"action\": \"update\", \"content\": ..., \"type\": ..., \"topics\": [...], \"confidence\": ...}} \
         to fold new detail into the existing entry;\n\
         - {{\"action\": \"replace\", \"content\": ..., \"type\": ..., \"topics\": [...], \"confidence\": ...}} \
         if the candidate supersedes what the existing entry says;\n\
         - {{\"action\": \"insert\"}} if they are actually about different things.\n",
        existing.entry_type,
        existing.content,
        existing.topics.join(", "),
        existing.confidence,
        candidate.entry_type,
        candidate.content,
        candidate.topics.join(", "),
        candidate.confidence,
    )
}

/// Parse the collaborator's decision. Anything malformed becomes `Insert`,
/// so ambiguity never drops a candidate.
pub fn parse_decision(text: &str) -> ReconcileDecision {
    let value = match find_json(text) {
        Some(Value::Array(items)) => items.into_iter().next().unwrap_or(Value::Null),
        Some(value) => value,
        None => Value::Null,
    };

    let action = str_field(&value, "action").map(str::to_ascii_lowercase);
    match action.as_deref() {
        Some("keep") => ReconcileDecision::Keep,
        Some("insert") => ReconcileDecision::Insert,
        Some(action @ ("update" | "replace")) => {
            let Some(content) = str_field(&value, "content") else {
                tracing::warn!(action, "reconcile decision without content, inserting instead");
                return ReconcileDecision::Insert;
            };
            let revision = EntryRevision {
                content: Some(content.to_string()),
                entry_type: str_field(&value, "type").map(KnowledgeType::parse_lenient),
                topics: string_list(&value, "topics"),
                confidence: unit_field(&value, "confidence"),
            };
            if action == "update" {
                ReconcileDecision::Update(revision)
            } else {
                ReconcileDecision::Replace(revision)
            }
        }
        other => {
            tracing::warn!(action = ?other, "unusable reconcile decision, inserting instead");
            ReconcileDecision::Insert
        }
    }
}

/// Live entries with embeddings, kept current while a chunk is processed so
/// later candidates deduplicate against entries written earlier in the chunk.
#[derive(Debug, Default)]
pub struct LiveCache {
    entries: HashMap<String, (KnowledgeEntry, Vec<f32>)>,
}

impl LiveCache {
    pub fn load(conn: &Connection) -> Result<Self> {
        let entries = store::live_entries_with_embeddings(conn)?
            .into_iter()
            .filter_map(|(entry, embedding)| Some((entry.id.clone(), (entry, embedding?))))
            .collect();
        Ok(Self { entries })
    }

    /// Most similar cached entry and its cosine similarity.
    pub fn nearest(&self, embedding: &[f32]) -> Option<(&KnowledgeEntry, f64)> {
        self.entries
            .values()
            .map(|(entry, vector)| (entry, cosine_similarity(embedding, vector)))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
    }

    pub fn upsert(&mut self, entry: KnowledgeEntry, embedding: Vec<f32>) {
        self.entries.insert(entry.id.clone(), (entry, embedding));
    }
}

pub struct Reconciler<'a> {
    pub db: &'a Mutex<Connection>,
    pub llm: &'a dyn CompletionProvider,
    pub embedder: &'a dyn EmbeddingProvider,
    /// Cosine similarity at or above which the collaborator is consulted.
    pub threshold: f64,
}

impl Reconciler<'_> {
    pub async fn reconcile(
        &self,
        candidate: &CandidateEntry,
        source_ids: &[String],
        cache: &mut LiveCache,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        let embedding = self.embedder.embed(&candidate.content).await?;

        let nearest = cache
            .nearest(&embedding)
            .filter(|(_, similarity)| *similarity >= self.threshold)
            .map(|(entry, similarity)| (entry.clone(), similarity));
        let Some((existing, similarity)) = nearest else {
            return self.insert(candidate, source_ids, embedding, cache, now);
        };

        let response = self
            .llm
            .complete(RECONCILE_SYSTEM, &build_prompt(&existing, candidate))
            .await?;
        let decision = parse_decision(&response);
        tracing::debug!(existing = %existing.id, similarity, ?decision, "reconcile decision");

        let (revision, reason) = match decision {
            ReconcileDecision::Keep => {
                let conn = lock_db(self.db)?;
                store::reinforce_evidence(&conn, &existing.id, now)?;
                return Ok(ReconcileOutcome::Kept(existing.id));
            }
            ReconcileDecision::Insert => {
                return self.insert(candidate, source_ids, embedding, cache, now);
            }
            ReconcileDecision::Update(revision) => (revision, "update"),
            ReconcileDecision::Replace(revision) => (revision, "replace"),
        };

        let new_content = revision.content.as_deref().unwrap_or(&candidate.content);
        let new_embedding = if new_content == candidate.content {
            embedding
        } else {
            self.embedder.embed(new_content).await?
        };

        let entry = {
            let mut conn = lock_db(self.db)?;
            let tx = conn.transaction()?;
            let entry = store::revise_entry(
                &tx,
                &existing.id,
                &revision,
                source_ids,
                Some(&new_embedding),
                now,
                reason,
            )?;
            tx.commit()?;
            entry
        };
        let id = entry.id.clone();
        cache.upsert(entry, new_embedding);
        Ok(ReconcileOutcome::Updated(id))
    }

    fn insert(
        &self,
        candidate: &CandidateEntry,
        source_ids: &[String],
        embedding: Vec<f32>,
        cache: &mut LiveCache,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        let entry = {
            let mut conn = lock_db(self.db)?;
            let tx = conn.transaction()?;
            let entry = store::insert_entry(&tx, candidate, source_ids, Some(&embedding), now)?;
            tx.commit()?;
            entry
        };
        let id = entry.id.clone();
        cache.upsert(entry, embedding);
        Ok(ReconcileOutcome::Inserted(id))
    }
}
