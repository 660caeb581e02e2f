//! Extraction: episodes plus relevant existing knowledge in, candidate entries out.

use serde_json::Value;

use super::response::{find_json, str_field, string_list, unit_field};
use crate::episodes::Episode;
use crate::knowledge::types::{normalize_topics, CandidateEntry, KnowledgeEntry, KnowledgeType, Scope};

/// Confidence assumed when the extractor omits one.
pub const DEFAULT_CONFIDENCE: f64 = 0.7;

pub const EXTRACTION_SYSTEM: &str = "You curate a long-term knowledge base from conversation \
transcripts. Keep only knowledge that will still matter weeks from now: stable facts about \
the user's projects and environment, decisions with their rationale, recurring patterns, \
working procedures, and guiding principles. Skip small talk, one-off task chatter, and \
anything already present in the existing knowledge unless the transcript changes it. \
Most transcripts contain nothing worth keeping; an empty list is the normal answer.";

/// Build the extraction prompt for one chunk of episodes.
pub fn build_prompt(episodes: &[Episode], context: &[KnowledgeEntry]) -> String {
    let mut prompt = String::new();

    prompt.push_str("## Existing knowledge\n");
    if context.is_empty() {
        prompt.push_str("(none)\n");
    }
    for entry in context {
        prompt.push_str(&format!(
            "- [{}] ({}) {} | topics: {}\n",
            entry.id,
            entry.entry_type,
            entry.content,
            entry.topics.join(", ")
        ));
    }

    prompt.push_str("\n## Transcript episodes\n");
    for episode in episodes {
        prompt.push_str(&episode.render());
        prompt.push('\n');
    }

    prompt.push_str(
        "\n## Task\n\
         Return a JSON array of new knowledge entries. Each entry is an object:\n\
         {\"type\": \"fact|principle|pattern|decision|procedure\", \
         \"content\": \"one to three sentences\", \
         \"topics\": [\"short\", \"labels\"], \
         \"confidence\": 0.0-1.0, \
         \"scope\": \"personal|team\", \
         \"source\": \"session id the entry came from\"}\n\
         Return [] if nothing qualifies. Output only JSON.\n",
    );
    prompt
}

/// Parse the extractor's answer. Anything unusable yields no candidates.
///
/// Accepts a bare array or an object with an `entries` array. Items without
/// content are dropped; other fields fall back to safe defaults.
pub fn parse_candidates(text: &str) -> Vec<CandidateEntry> {
    let Some(value) = find_json(text) else {
        tracing::warn!(response_len = text.len(), "extraction response had no JSON, using empty list");
        return Vec::new();
    };
    let items = match &value {
        Value::Array(items) => items.as_slice(),
        Value::Object(_) => match value.get("entries").and_then(Value::as_array) {
            Some(items) => items.as_slice(),
            None => {
                tracing::warn!("extraction response object had no entries array");
                return Vec::new();
            }
        },
        _ => return Vec::new(),
    };

    items.iter().filter_map(parse_candidate).collect()
}

fn parse_candidate(item: &Value) -> Option<CandidateEntry> {
    let content = str_field(item, "content")?;
    Some(CandidateEntry {
        entry_type: str_field(item, "type")
            .map(KnowledgeType::parse_lenient)
            .unwrap_or(KnowledgeType::Fact),
        content: content.to_string(),
        topics: normalize_topics(string_list(item, "topics").unwrap_or_default()),
        confidence: unit_field(item, "confidence").unwrap_or(DEFAULT_CONFIDENCE),
        scope: str_field(item, "scope")
            .map(Scope::parse_lenient)
            .unwrap_or(Scope::Personal),
        source: str_field(item, "source").map(str::to_string),
    })
}
