//! Core knowledge type definitions.
//!
//! Defines [`KnowledgeType`] (the closed set of knowledge kinds), [`Scope`],
//! [`EntryStatus`] (lifecycle), [`KnowledgeEntry`] (a full record),
//! [`RelationKind`] / [`KnowledgeRelation`] (graph edges), and
//! [`CandidateEntry`] (an extraction result not yet reconciled).

use serde::{Deserialize, Serialize};

/// The kinds of retained knowledge. Each kind has its own base half-life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeType {
    /// A concrete statement about the world ("the API listens on 8080").
    Fact,
    /// A general rule or value that guides decisions.
    Principle,
    /// A recurring observation across sessions.
    Pattern,
    /// A choice that was made, with its rationale.
    Decision,
    /// How to do something.
    Procedure,
}

impl KnowledgeType {
    pub const ALL: [KnowledgeType; 5] = [
        Self::Fact,
        Self::Principle,
        Self::Pattern,
        Self::Decision,
        Self::Procedure,
    ];

    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fact => "fact",
            Self::Principle => "principle",
            Self::Pattern => "pattern",
            Self::Decision => "decision",
            Self::Procedure => "procedure",
        }
    }

    /// Parse a collaborator-supplied kind, clamping anything unknown to `Fact`
    /// so a bad value can never abort a store transaction.
    pub fn parse_lenient(s: &str) -> Self {
        s.trim().to_ascii_lowercase().parse().unwrap_or_else(|_| {
            tracing::debug!(value = s, "unknown knowledge type, falling back to fact");
            Self::Fact
        })
    }
}

impl std::fmt::Display for KnowledgeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for KnowledgeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fact" => Ok(Self::Fact),
            "principle" => Ok(Self::Principle),
            "pattern" => Ok(Self::Pattern),
            "decision" => Ok(Self::Decision),
            "procedure" => Ok(Self::Procedure),
            _ => Err(format!("unknown knowledge type: {s}")),
        }
    }
}

/// Who the knowledge applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Personal,
    Team,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Personal => "personal",
            Self::Team => "team",
        }
    }

    /// Unknown scopes clamp to `Personal`.
    pub fn parse_lenient(s: &str) -> Self {
        s.trim().to_ascii_lowercase().parse().unwrap_or(Self::Personal)
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "personal" => Ok(Self::Personal),
            "team" => Ok(Self::Team),
            _ => Err(format!("unknown scope: {s}")),
        }
    }
}

/// Lifecycle status of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Active,
    /// Decayed below the archive threshold. Not retrievable.
    Archived,
    /// Replaced by another entry; `superseded_by` points to it.
    Superseded,
    /// Part of an unresolved contradiction. Still retrievable.
    Conflicted,
    /// Archived long enough to be considered gone.
    Tombstoned,
}

impl EntryStatus {
    pub const ALL: [EntryStatus; 5] = [
        Self::Active,
        Self::Archived,
        Self::Superseded,
        Self::Conflicted,
        Self::Tombstoned,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
            Self::Superseded => "superseded",
            Self::Conflicted => "conflicted",
            Self::Tombstoned => "tombstoned",
        }
    }

    /// Live entries serve queries and take part in reconciliation.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Active | Self::Conflicted)
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "archived" => Ok(Self::Archived),
            "superseded" => Ok(Self::Superseded),
            "conflicted" => Ok(Self::Conflicted),
            "tombstoned" => Ok(Self::Tombstoned),
            _ => Err(format!("unknown entry status: {s}")),
        }
    }
}

/// A knowledge record, matching the `entries` table (plus its topic rows).
///
/// The embedding lives in `entries_vec` and is never carried on this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    /// UUID v7 (time-sortable) primary key.
    pub id: String,
    #[serde(rename = "type")]
    pub entry_type: KnowledgeType,
    pub scope: Scope,
    /// One to three sentences.
    pub content: String,
    /// Unordered topic labels, lower-cased.
    pub topics: Vec<String>,
    /// Set at creation; a ceiling for `strength`.
    pub confidence: f64,
    pub status: EntryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
    /// Cached decayed score in `[0, confidence]`.
    pub strength: f64,
    /// Retrieval reinforcement.
    pub access_count: u32,
    /// Evidence reinforcement. Starts at 1.
    pub observation_count: u32,
    /// Session identifiers this entry was derived from.
    pub source_ids: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
    pub last_accessed_at: String,
}

/// Kinds of directed edge between entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    Supports,
    Contradicts,
    Refines,
    DependsOn,
    Supersedes,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Supports => "supports",
            Self::Contradicts => "contradicts",
            Self::Refines => "refines",
            Self::DependsOn => "depends_on",
            Self::Supersedes => "supersedes",
        }
    }
}

impl std::str::FromStr for RelationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "supports" => Ok(Self::Supports),
            "contradicts" => Ok(Self::Contradicts),
            "refines" => Ok(Self::Refines),
            "depends_on" => Ok(Self::DependsOn),
            "supersedes" => Ok(Self::Supersedes),
            _ => Err(format!("unknown relation kind: {s}")),
        }
    }
}

/// A directed relationship between two entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeRelation {
    pub id: String,
    pub source_id: String,
    pub kind: RelationKind,
    pub target_id: String,
    pub created_at: String,
}

/// An entry proposed by extraction, before reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateEntry {
    #[serde(rename = "type")]
    pub entry_type: KnowledgeType,
    pub content: String,
    pub topics: Vec<String>,
    pub confidence: f64,
    pub scope: Scope,
    /// Session the extractor attributed this candidate to, if any.
    pub source: Option<String>,
}

/// Lower-case, trim, drop empties, and deduplicate topic labels (order kept).
pub fn normalize_topics<I, S>(topics: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for topic in topics {
        let t = topic.as_ref().trim().to_lowercase();
        if !t.is_empty() && !out.contains(&t) {
            out.push(t);
        }
    }
    out
}
