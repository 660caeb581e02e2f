#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::Connection;

use lore::config::LoreConfig;
use lore::consolidation::contradiction::CONTRADICTION_SYSTEM;
use lore::consolidation::extract::EXTRACTION_SYSTEM;
use lore::consolidation::reconcile::RECONCILE_SYSTEM;
use lore::db;
use lore::embedding::EmbeddingProvider;
use lore::episodes::{EpisodeSource, Role, SourceRecord, SourceSession};
use lore::error::{CollaboratorError, LoreError};
use lore::knowledge::store;
use lore::knowledge::types::{CandidateEntry, KnowledgeEntry, KnowledgeType, Scope};
use lore::llm::CompletionProvider;
use lore::server::SharedState;

/// Embedding width used by every integration test.
pub const DIMS: usize = 16;

/// Open a fresh in-memory database with schema and migrations applied.
pub fn test_db() -> Connection {
    db::open_memory_database(DIMS).unwrap()
}

/// Unit vector along axis `i`.
pub fn axis(i: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    v[i % DIMS] = 1.0;
    v
}

/// Unit vector with cosine `similarity` to `axis(a)`, tilted toward `axis(b)`.
///
/// Two blends on the same `a` with different `b` have cosine `s1 * s2`.
pub fn blend(a: usize, b: usize, similarity: f32) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    v[a % DIMS] = similarity;
    v[b % DIMS] = (1.0 - similarity * similarity).sqrt();
    v
}

/// Vector returned for text the fake embedder has not been told about.
/// Orthogonal to every axis below `DIMS - 1`.
pub fn unknown_text_vector() -> Vec<f32> {
    axis(DIMS - 1)
}

pub fn test_config() -> LoreConfig {
    let mut config = LoreConfig::default();
    config.embedding.dimensions = DIMS;
    config.embedding.model = "fake-embedding".into();
    config.storage.db_path = ":memory:".into();
    config
}

pub fn candidate(content: &str, topics: &[&str]) -> CandidateEntry {
    CandidateEntry {
        entry_type: KnowledgeType::Fact,
        content: content.into(),
        topics: topics.iter().map(|t| t.to_string()).collect(),
        confidence: 0.8,
        scope: Scope::Personal,
        source: None,
    }
}

/// Insert an entry directly, bypassing consolidation.
pub fn seed_entry(
    conn: &Connection,
    content: &str,
    topics: &[&str],
    embedding: &[f32],
) -> KnowledgeEntry {
    store::insert_entry(
        conn,
        &candidate(content, topics),
        &["seed".to_string()],
        Some(embedding),
        Utc::now(),
    )
    .unwrap()
}

pub fn record(id: &str, timestamp_ms: i64, role: Role, text: &str) -> SourceRecord {
    SourceRecord {
        id: id.into(),
        timestamp_ms,
        role,
        text: text.into(),
        is_summary: false,
    }
}

/// Alternating user/assistant records `{session}-0..n`, 100 ms apart from `start_ms`.
pub fn conversation(session: &str, start_ms: i64, texts: &[&str]) -> Vec<SourceRecord> {
    texts
        .iter()
        .enumerate()
        .map(|(i, text)| {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            record(&format!("{session}-{i}"), start_ms + i as i64 * 100, role, text)
        })
        .collect()
}

/// Extraction response proposing one fact per `(content, topics)` pair.
pub fn extraction(items: &[(&str, &[&str])]) -> String {
    let entries: Vec<serde_json::Value> = items
        .iter()
        .map(|(content, topics)| {
            serde_json::json!({
                "type": "fact",
                "content": content,
                "topics": topics,
                "confidence": 0.8,
            })
        })
        .collect();
    serde_json::Value::Array(entries).to_string()
}

/// IDs of the existing entries listed in a contradiction prompt.
pub fn listed_candidates(prompt: &str) -> Vec<String> {
    prompt
        .lines()
        .filter_map(|line| line.strip_prefix("- ["))
        .filter_map(|rest| rest.split(']').next())
        .map(str::to_string)
        .collect()
}

pub fn unavailable(service: &'static str) -> anyhow::Error {
    CollaboratorError::Unavailable {
        service,
        attempts: 4,
        message: "connection refused".into(),
    }
    .into()
}

// ---------------------------------------------------------------------------
// Fake collaborators
// ---------------------------------------------------------------------------

pub type Responder = Box<dyn FnMut(&str) -> Result<String> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Extract,
    Reconcile,
    Contradiction,
}

/// Scripted completion collaborator. Each prompt kind has its own responder;
/// the defaults extract nothing, insert on reconcile, and find no conflicts.
pub struct FakeLlm {
    extract: Mutex<Responder>,
    reconcile: Mutex<Responder>,
    contradiction: Mutex<Responder>,
    calls: Mutex<Vec<(Call, String)>>,
    delay: Mutex<Duration>,
}

impl FakeLlm {
    pub fn new() -> Self {
        Self {
            extract: Mutex::new(Box::new(|_| Ok("[]".into()))),
            reconcile: Mutex::new(Box::new(|_| Ok(r#"{"action":"insert"}"#.into()))),
            contradiction: Mutex::new(Box::new(|_| Ok("[]".into()))),
            calls: Mutex::new(Vec::new()),
            delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn on_extract(&self, f: impl FnMut(&str) -> Result<String> + Send + 'static) {
        *self.extract.lock().unwrap() = Box::new(f);
    }

    pub fn on_reconcile(&self, f: impl FnMut(&str) -> Result<String> + Send + 'static) {
        *self.reconcile.lock().unwrap() = Box::new(f);
    }

    pub fn on_contradiction(&self, f: impl FnMut(&str) -> Result<String> + Send + 'static) {
        *self.contradiction.lock().unwrap() = Box::new(f);
    }

    /// Always answer extraction with `response`.
    pub fn extract_always(&self, response: String) {
        self.on_extract(move |_| Ok(response.clone()));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn count(&self, kind: Call) -> usize {
        self.calls.lock().unwrap().iter().filter(|(k, _)| *k == kind).count()
    }

    pub fn prompts(&self, kind: Call) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl CompletionProvider for FakeLlm {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let kind = if system == EXTRACTION_SYSTEM {
            Call::Extract
        } else if system == RECONCILE_SYSTEM {
            Call::Reconcile
        } else if system == CONTRADICTION_SYSTEM {
            Call::Contradiction
        } else {
            anyhow::bail!("unexpected system prompt: {system}");
        };
        self.calls.lock().unwrap().push((kind, prompt.to_string()));

        let responder = match kind {
            Call::Extract => &self.extract,
            Call::Reconcile => &self.reconcile,
            Call::Contradiction => &self.contradiction,
        };
        let mut responder = responder.lock().unwrap();
        let response = (*responder)(prompt);
        response
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Failure {
    /// Retry budget exhausted; aborts the run.
    Unavailable,
    /// Any other error; skips the candidate.
    Other,
}

/// Embedder with hand-assigned vectors per text.
pub struct FakeEmbedder {
    vectors: Mutex<HashMap<String, Vec<f32>>>,
    failures: Mutex<HashMap<String, Failure>>,
    calls: AtomicUsize,
}

impl FakeEmbedder {
    pub fn new() -> Self {
        Self {
            vectors: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, text: &str, vector: Vec<f32>) {
        self.vectors.lock().unwrap().insert(text.to_string(), vector);
    }

    pub fn fail_on(&self, text: &str, failure: Failure) {
        self.failures.lock().unwrap().insert(text.to_string(), failure);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for FakeEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failures = self.failures.lock().unwrap();
        let vectors = self.vectors.lock().unwrap();
        texts
            .iter()
            .map(|text| match failures.get(text) {
                Some(Failure::Unavailable) => Err(unavailable("embedding")),
                Some(Failure::Other) => Err(anyhow::anyhow!("cannot embed {text:?}")),
                None => Ok(vectors
                    .get(text)
                    .cloned()
                    .unwrap_or_else(unknown_text_vector)),
            })
            .collect()
    }

    fn dimensions(&self) -> usize {
        DIMS
    }

    fn model_name(&self) -> &str {
        "fake-embedding"
    }
}

/// In-memory transcript log.
pub struct FakeSource {
    sessions: Mutex<Vec<(String, Vec<SourceRecord>)>>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn add_session(&self, id: &str, records: Vec<SourceRecord>) {
        self.sessions.lock().unwrap().push((id.to_string(), records));
    }

    pub fn append(&self, id: &str, records: Vec<SourceRecord>) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some((_, existing)) = sessions.iter_mut().find(|(sid, _)| sid == id) {
            existing.extend(records);
        }
    }
}

impl EpisodeSource for FakeSource {
    fn sessions_since(&self, cursor_ms: i64, limit: usize) -> Result<Vec<SourceSession>> {
        let mut out: Vec<SourceSession> = self
            .sessions
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(id, records)| {
                let latest_ms = records.iter().map(|r| r.timestamp_ms).max()?;
                (latest_ms > cursor_ms).then(|| SourceSession {
                    id: id.clone(),
                    latest_ms,
                })
            })
            .collect();
        out.sort_by(|a, b| a.latest_ms.cmp(&b.latest_ms).then_with(|| a.id.cmp(&b.id)));
        out.truncate(limit);
        Ok(out)
    }

    fn session_records(&self, session_id: &str) -> Result<Vec<SourceRecord>> {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .find(|(id, _)| id == session_id)
            .map(|(_, records)| records.clone())
            .ok_or_else(|| LoreError::NotFound(session_id.to_string()).into())
    }
}

/// Shared state wired to fakes over an in-memory store.
pub struct Harness {
    pub state: SharedState,
    pub llm: Arc<FakeLlm>,
    pub embedder: Arc<FakeEmbedder>,
    pub source: Arc<FakeSource>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: LoreConfig) -> Self {
        let llm = Arc::new(FakeLlm::new());
        let embedder = Arc::new(FakeEmbedder::new());
        let source = Arc::new(FakeSource::new());
        let state = SharedState::new(
            Arc::new(Mutex::new(test_db())),
            source.clone(),
            llm.clone(),
            embedder.clone(),
            config,
        );
        Self {
            state,
            llm,
            embedder,
            source,
        }
    }

    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.state.db.lock().unwrap()
    }

    pub fn entry(&self, id: &str) -> KnowledgeEntry {
        store::get_entry(&self.conn(), id).unwrap().unwrap()
    }

    pub fn live(&self) -> Vec<KnowledgeEntry> {
        store::live_entries(&self.conn()).unwrap()
    }

    pub fn processed_episode_count(&self) -> i64 {
        self.conn()
            .query_row("SELECT COUNT(*) FROM processed_episodes", [], |row| row.get(0))
            .unwrap()
    }

    pub fn cursor(&self) -> i64 {
        lore::knowledge::state::get_state(&self.conn())
            .unwrap()
            .cursor_ms
    }
}
