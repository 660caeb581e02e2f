//! The consolidation pipeline.
//!
//! One run: fetch sessions newer than the cursor, segment them into episodes
//! not yet recorded, and process the episodes in fixed-size chunks
//! (extract → reconcile → contradiction scan → record ranges). Then decay,
//! backfill missing embeddings, and advance the cursor. Decay and backfill
//! happen on every run, including runs that find no new sessions.
//!
//! Chunks are processed strictly in sequence. Each episode range is recorded
//! as soon as its chunk succeeds, so an aborted run keeps its finished work.

pub mod background;
pub mod contradiction;
pub mod extract;
pub mod gate;
pub mod reconcile;
pub mod response;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;

use crate::config::{ConsolidationConfig, DecayConfig, LoreConfig};
use crate::embedding::EmbeddingProvider;
use crate::episodes::segment::{segment_sessions, SegmentOptions};
use crate::episodes::{Episode, EpisodeSource, SourceRecord, SourceSession};
use crate::error::{CollaboratorError, LoreError};
use crate::knowledge::decay::run_decay;
use crate::knowledge::types::KnowledgeEntry;
use crate::knowledge::{state, store};
use crate::llm::CompletionProvider;
use contradiction::ContradictionScanner;
use gate::RunGate;
use reconcile::{LiveCache, ReconcileOutcome, Reconciler};

/// Characters of chunk text used to look up relevant existing knowledge.
const CONTEXT_QUERY_CHARS: usize = 8_000;

/// Entries re-embedded per backfill pass.
const BACKFILL_LIMIT: usize = 256;

pub(crate) fn lock_db(db: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    db.lock()
        .map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))
}

/// Summary of one consolidation run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ConsolidationReport {
    pub sessions_processed: u64,
    pub segments_processed: u64,
    pub entries_created: u64,
    pub entries_updated: u64,
    pub entries_archived: u64,
    pub entries_tombstoned: u64,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
    pub embeddings_backfilled: u64,
    /// Cursor after the run.
    pub cursor_ms: i64,
    pub duration_ms: u64,
}

/// Runs consolidation against shared collaborators. Cheap to share behind an `Arc`.
pub struct Consolidator {
    db: Arc<Mutex<Connection>>,
    source: Arc<dyn EpisodeSource>,
    llm: Arc<dyn CompletionProvider>,
    embedder: Arc<dyn EmbeddingProvider>,
    settings: ConsolidationConfig,
    decay: DecayConfig,
    gate: RunGate,
}

impl Consolidator {
    pub fn new(
        db: Arc<Mutex<Connection>>,
        source: Arc<dyn EpisodeSource>,
        llm: Arc<dyn CompletionProvider>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: &LoreConfig,
    ) -> Self {
        Self {
            db,
            source,
            llm,
            embedder,
            settings: config.consolidation.clone(),
            decay: config.decay.clone(),
            gate: RunGate::new(),
        }
    }

    /// The gate shared by every entry point that can start a run.
    pub fn gate(&self) -> &RunGate {
        &self.gate
    }

    /// Run once. Fails with [`LoreError::RunInProgress`] if a run is already in flight.
    pub async fn run(&self) -> Result<ConsolidationReport> {
        let Some(_guard) = self.gate.try_acquire() else {
            return Err(LoreError::RunInProgress.into());
        };
        let started = Instant::now();

        let mut report = self.run_locked().await?;
        report.duration_ms = started.elapsed().as_millis() as u64;

        tracing::info!(
            sessions = report.sessions_processed,
            segments = report.segments_processed,
            created = report.entries_created,
            updated = report.entries_updated,
            archived = report.entries_archived,
            conflicts_detected = report.conflicts_detected,
            conflicts_resolved = report.conflicts_resolved,
            duration_ms = report.duration_ms,
            "consolidation run complete"
        );
        Ok(report)
    }

    async fn run_locked(&self) -> Result<ConsolidationReport> {
        let mut report = ConsolidationReport::default();
        let cursor = state::get_state(&*lock_db(&self.db)?)?.cursor_ms;
        let batch = self.settings.session_batch_size;

        let source = Arc::clone(&self.source);
        let sessions: Vec<SourceSession> =
            tokio::task::spawn_blocking(move || source.sessions_since(cursor, batch))
                .await
                .context("episode source task failed")??;

        if sessions.is_empty() {
            tracing::debug!(cursor, "no new sessions");
            self.maintain(&mut report).await?;
            state::record_run(&*lock_db(&self.db)?, 0, 0, 0, Utc::now())?;
            report.cursor_ms = cursor;
            return Ok(report);
        }

        let source = Arc::clone(&self.source);
        let ids: Vec<String> = sessions.iter().map(|s| s.id.clone()).collect();
        let loaded: Vec<(String, Vec<SourceRecord>)> = tokio::task::spawn_blocking(move || {
            ids.into_iter()
                .map(|id| {
                    let records = source.session_records(&id)?;
                    Ok((id, records))
                })
                .collect::<Result<Vec<_>>>()
        })
        .await
        .context("episode source task failed")??;

        let processed = {
            let id_refs: Vec<&str> = sessions.iter().map(|s| s.id.as_str()).collect();
            state::processed_ranges(&*lock_db(&self.db)?, &id_refs)?
        };
        let episodes = segment_sessions(&loaded, &processed, SegmentOptions::from(&self.settings));
        tracing::info!(
            sessions = sessions.len(),
            episodes = episodes.len(),
            cursor,
            "consolidating"
        );

        let mut session_max: HashMap<String, i64> = HashMap::new();
        for chunk in episodes.chunks(self.settings.episodes_per_chunk.max(1)) {
            let outcome = self.process_chunk(chunk).await?;
            report.entries_created += outcome.created;
            report.entries_updated += outcome.updated;
            report.conflicts_detected += outcome.conflicts_detected;
            report.conflicts_resolved += outcome.conflicts_resolved;
            report.embeddings_backfilled += outcome.embeddings_backfilled;
            report.segments_processed += chunk.len() as u64;
            for episode in chunk {
                let max = session_max.entry(episode.session_id.clone()).or_insert(i64::MIN);
                *max = (*max).max(episode.max_timestamp_ms());
            }
        }
        report.sessions_processed = session_max.len() as u64;

        self.maintain(&mut report).await?;

        let next = next_cursor(cursor, &sessions, &session_max, batch);
        let conn = lock_db(&self.db)?;
        report.cursor_ms = state::advance_cursor(&conn, next)?;
        state::record_run(
            &conn,
            report.sessions_processed,
            report.entries_created,
            report.entries_updated,
            Utc::now(),
        )?;
        Ok(report)
    }

    async fn process_chunk(&self, chunk: &[Episode]) -> Result<ChunkOutcome> {
        let now = Utc::now();
        let mut outcome = ChunkOutcome::default();

        let mut chunk_sessions: Vec<String> = Vec::new();
        for episode in chunk {
            if !chunk_sessions.contains(&episode.session_id) {
                chunk_sessions.push(episode.session_id.clone());
            }
        }

        let chunk_text = chunk.iter().map(Episode::render).collect::<Vec<_>>().join("\n");
        let context = self.relevant_context(&chunk_text).await?;
        let response = self
            .llm
            .complete(
                extract::EXTRACTION_SYSTEM,
                &extract::build_prompt(chunk, &context),
            )
            .await?;
        let candidates = extract::parse_candidates(&response);
        tracing::debug!(
            episodes = chunk.len(),
            candidates = candidates.len(),
            "extraction complete"
        );

        let mut cache = LiveCache::load(&*lock_db(&self.db)?)?;
        let reconciler = Reconciler {
            db: &self.db,
            llm: self.llm.as_ref(),
            embedder: self.embedder.as_ref(),
            threshold: self.settings.reconcile_threshold,
        };

        let mut changed: Vec<String> = Vec::new();
        for candidate in &candidates {
            let sources = match &candidate.source {
                Some(session) if chunk_sessions.contains(session) => vec![session.clone()],
                _ => chunk_sessions.clone(),
            };
            match reconciler.reconcile(candidate, &sources, &mut cache, now).await {
                Ok(result) => {
                    match &result {
                        ReconcileOutcome::Inserted(_) => outcome.created += 1,
                        ReconcileOutcome::Updated(_) => outcome.updated += 1,
                        ReconcileOutcome::Kept(_) => {}
                    }
                    if let Some(id) = result.changed_id() {
                        if !changed.iter().any(|c| c == id) {
                            changed.push(id.to_string());
                        }
                    }
                }
                Err(e) if CollaboratorError::is_in(&e) => return Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, content = %candidate.content, "skipping candidate");
                }
            }
        }

        if !changed.is_empty() {
            let scanner = ContradictionScanner {
                db: &self.db,
                llm: self.llm.as_ref(),
                min_similarity: self.settings.contradiction_min_similarity,
                max_similarity: self.settings.reconcile_threshold,
            };
            match scanner.scan(&changed, now).await {
                Ok(scan) => {
                    outcome.conflicts_detected = scan.conflicts_detected;
                    outcome.conflicts_resolved = scan.conflicts_resolved;
                }
                Err(e) if CollaboratorError::is_in(&e) => return Err(e),
                Err(e) => tracing::warn!(error = %e, "contradiction scan failed"),
            }
            // Merged entries lost their vector; later chunks must still see them.
            outcome.embeddings_backfilled = self.backfill_embeddings().await?;
        }

        self.record_chunk(chunk, now)?;
        Ok(outcome)
    }

    fn record_chunk(&self, chunk: &[Episode], now: DateTime<Utc>) -> Result<()> {
        let mut conn = lock_db(&self.db)?;
        let tx = conn.transaction()?;
        for episode in chunk {
            state::record_processed(&tx, &episode.key(), now)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Existing entries most similar to the chunk, for extraction context.
    async fn relevant_context(&self, chunk_text: &str) -> Result<Vec<KnowledgeEntry>> {
        if store::count_live(&*lock_db(&self.db)?)? == 0 {
            return Ok(Vec::new());
        }
        let query: String = chunk_text.chars().take(CONTEXT_QUERY_CHARS).collect();
        let embedding = self.embedder.embed(&query).await?;
        let conn = lock_db(&self.db)?;
        Ok(store::nearest_live(&conn, &embedding, self.settings.max_context_entries)?
            .into_iter()
            .map(|(entry, _)| entry)
            .collect())
    }

    async fn maintain(&self, report: &mut ConsolidationReport) -> Result<()> {
        let decay = {
            let mut conn = lock_db(&self.db)?;
            run_decay(&mut conn, &self.decay, Utc::now())?
        };
        report.entries_archived += decay.entries_archived as u64;
        report.entries_tombstoned += decay.entries_tombstoned as u64;
        report.embeddings_backfilled += self.backfill_embeddings().await?;
        Ok(())
    }

    /// Embed live entries that lost their vector (e.g. after a merge).
    pub async fn backfill_embeddings(&self) -> Result<u64> {
        let pending = store::entries_missing_embedding(&*lock_db(&self.db)?, BACKFILL_LIMIT)?;
        if pending.is_empty() {
            return Ok(0);
        }
        let texts: Vec<String> = pending.iter().map(|(_, content)| content.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;

        let mut conn = lock_db(&self.db)?;
        let tx = conn.transaction()?;
        for ((id, _), vector) in pending.iter().zip(&vectors) {
            store::set_embedding(&tx, id, vector)?;
        }
        tx.commit()?;
        tracing::debug!(count = pending.len(), "backfilled embeddings");
        Ok(pending.len() as u64)
    }
}

#[derive(Debug, Default)]
struct ChunkOutcome {
    created: u64,
    updated: u64,
    conflicts_detected: u64,
    conflicts_resolved: u64,
    embeddings_backfilled: u64,
}

/// Where the cursor goes after a run.
///
/// Each candidate session contributes the newest record time of its
/// processed episodes, or its latest record time if it produced no new
/// episodes. When the batch was full, sessions sharing the last candidate's
/// timestamp may lie beyond it, so the cursor stops one millisecond short of
/// that timestamp. The cursor never moves backward.
pub fn next_cursor(
    cursor: i64,
    sessions: &[SourceSession],
    processed_max: &HashMap<String, i64>,
    batch_size: usize,
) -> i64 {
    let mut next = sessions
        .iter()
        .map(|s| processed_max.get(&s.id).copied().unwrap_or(s.latest_ms))
        .fold(cursor, i64::max);
    if sessions.len() >= batch_size {
        if let Some(last) = sessions.last() {
            next = next.min(last.latest_ms - 1);
        }
    }
    next.max(cursor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str, latest_ms: i64) -> SourceSession {
        SourceSession {
            id: id.into(),
            latest_ms,
        }
    }

    #[test]
    fn cursor_takes_newest_processed_time() {
        let sessions = vec![session("a", 100), session("b", 200)];
        let processed: HashMap<String, i64> =
            [("a".to_string(), 90), ("b".to_string(), 180)].into();
        assert_eq!(next_cursor(0, &sessions, &processed, 20), 180);
    }

    #[test]
    fn sessions_without_new_episodes_use_latest_record_time() {
        let sessions = vec![session("a", 100), session("b", 200)];
        let processed: HashMap<String, i64> = [("a".to_string(), 90)].into();
        assert_eq!(next_cursor(0, &sessions, &processed, 20), 200);
    }

    #[test]
    fn full_batch_stops_short_of_shared_boundary() {
        let sessions = vec![session("a", 100), session("b", 300), session("c", 300)];
        let processed: HashMap<String, i64> =
            [("a".to_string(), 100), ("b".to_string(), 300), ("c".to_string(), 300)].into();
        let next = next_cursor(0, &sessions, &processed, 3);
        assert!(next < 300);
        assert_eq!(next, 299);
    }

    #[test]
    fn cursor_never_moves_backward() {
        let sessions = vec![session("a", 501)];
        let processed: HashMap<String, i64> = HashMap::new();
        assert_eq!(next_cursor(500, &sessions, &processed, 1), 500);
        assert_eq!(next_cursor(500, &[], &processed, 1), 500);
    }
}
