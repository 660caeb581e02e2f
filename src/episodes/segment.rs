//! Session → episode segmentation.
//!
//! Each compaction summary is its own one-record episode. Records before the
//! last summary are already condensed into it and are not windowed again. The
//! remaining tail is cut into windows of at most `window_token_budget`
//! estimated tokens; a single record larger than the budget gets a window of
//! its own.

use std::collections::HashSet;

use super::{Episode, EpisodeKey, EpisodeKind, ProcessedRanges, SourceRecord};

#[derive(Debug, Clone, Copy)]
pub struct SegmentOptions {
    pub window_token_budget: usize,
    pub min_session_records: usize,
}

impl From<&crate::config::ConsolidationConfig> for SegmentOptions {
    fn from(config: &crate::config::ConsolidationConfig) -> Self {
        Self {
            window_token_budget: config.window_token_budget,
            min_session_records: config.min_session_records,
        }
    }
}

/// Rough token estimate: four characters per token.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Segment one session, dropping episodes whose identity is already recorded.
///
/// Message windows start after the last record covered by a recorded message
/// episode, so an appended tail only yields the new content.
pub fn segment_session(
    session_id: &str,
    records: &[SourceRecord],
    processed: Option<&HashSet<EpisodeKey>>,
    options: SegmentOptions,
) -> Vec<Episode> {
    if records.len() < options.min_session_records {
        return Vec::new();
    }

    let mut episodes: Vec<Episode> = records
        .iter()
        .filter(|r| r.is_summary && !r.text.trim().is_empty())
        .map(|r| Episode {
            session_id: session_id.to_string(),
            kind: EpisodeKind::Summary,
            records: vec![r.clone()],
        })
        .collect();

    let tail_start = records
        .iter()
        .rposition(|r| r.is_summary)
        .map_or(0, |i| i + 1);
    let resume_from = processed
        .and_then(|keys| last_covered_position(records, keys))
        .map_or(0, |i| i + 1);
    let start = tail_start.max(resume_from).min(records.len());

    episodes.extend(windows(session_id, &records[start..], options.window_token_budget));

    match processed {
        Some(keys) => episodes
            .into_iter()
            .filter(|e| !keys.contains(&e.key()))
            .collect(),
        None => episodes,
    }
}

/// Segment every session, in the order given.
pub fn segment_sessions(
    sessions: &[(String, Vec<SourceRecord>)],
    processed: &ProcessedRanges,
    options: SegmentOptions,
) -> Vec<Episode> {
    sessions
        .iter()
        .flat_map(|(id, records)| segment_session(id, records, processed.get(id), options))
        .collect()
}

/// Position of the furthest record that ends an already-recorded message episode.
fn last_covered_position(records: &[SourceRecord], keys: &HashSet<EpisodeKey>) -> Option<usize> {
    let ends: HashSet<&str> = keys
        .iter()
        .filter(|k| k.kind == EpisodeKind::Messages)
        .map(|k| k.end_record_id.as_str())
        .collect();
    records.iter().rposition(|r| ends.contains(r.id.as_str()))
}

fn windows(session_id: &str, records: &[SourceRecord], budget: usize) -> Vec<Episode> {
    let mut out = Vec::new();
    let mut current: Vec<SourceRecord> = Vec::new();
    let mut used = 0usize;

    for record in records.iter().filter(|r| !r.is_summary && !r.text.trim().is_empty()) {
        let cost = estimate_tokens(&record.text);
        if !current.is_empty() && used + cost > budget {
            out.push(Episode {
                session_id: session_id.to_string(),
                kind: EpisodeKind::Messages,
                records: std::mem::take(&mut current),
            });
            used = 0;
        }
        used += cost;
        current.push(record.clone());
    }

    if !current.is_empty() {
        out.push(Episode {
            session_id: session_id.to_string(),
            kind: EpisodeKind::Messages,
            records: current,
        });
    }
    out
}
