//! CLI `consolidate` command: one foreground consolidation run.

use anyhow::Result;

use crate::config::LoreConfig;

pub async fn consolidate(config: LoreConfig) -> Result<()> {
    let state = crate::server::setup_shared_state(config)?;

    println!("Consolidating new transcripts...");
    let report = state.consolidate().await?;

    if report.segments_processed == 0 {
        println!("  No new episodes.");
    } else {
        println!(
            "  Processed {} episodes from {} sessions.",
            report.segments_processed, report.sessions_processed
        );
        println!(
            "  Entries created: {}, updated: {}.",
            report.entries_created, report.entries_updated
        );
    }
    if report.conflicts_detected > 0 || report.conflicts_resolved > 0 {
        println!(
            "  Conflicts resolved: {}, left for review: {}.",
            report.conflicts_resolved, report.conflicts_detected
        );
    }
    if report.entries_archived > 0 || report.entries_tombstoned > 0 {
        println!(
            "  Archived {} faded entries, tombstoned {}.",
            report.entries_archived, report.entries_tombstoned
        );
    }
    if report.embeddings_backfilled > 0 {
        println!("  Re-embedded {} entries.", report.embeddings_backfilled);
    }
    println!("Done in {} ms.", report.duration_ms);

    Ok(())
}
