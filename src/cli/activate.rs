use anyhow::Result;

use crate::config::LoreConfig;

/// Run a retrieval from the terminal.
///
/// This goes through the same path as the MCP tool, so returned entries are
/// reinforced.
pub async fn activate(
    config: LoreConfig,
    query: &str,
    limit: Option<usize>,
    threshold: Option<f64>,
) -> Result<()> {
    let state = crate::server::setup_shared_state(config)?;
    let result = state.activate(query, limit, threshold).await?;

    if result.entries.is_empty() {
        println!("No matching knowledge ({} live entries).", result.total_live_count);
        return Ok(());
    }

    println!(
        "{} of {} live entries matched\n",
        result.entries.len(),
        result.total_live_count
    );

    for (i, activated) in result.entries.iter().enumerate() {
        let entry = &activated.entry;
        let preview: String = if entry.content.chars().count() > 160 {
            format!("{}...", entry.content.chars().take(160).collect::<String>())
        } else {
            entry.content.clone()
        };

        println!(
            "  {}. [{}] {} (similarity: {:.3}, raw: {:.3}, strength: {:.2})",
            i + 1,
            entry.entry_type,
            entry.id,
            activated.similarity,
            activated.raw_similarity,
            activated.staleness.strength,
        );
        println!("     {}", preview);
        if activated.staleness.may_be_stale {
            println!(
                "     ! may be stale (last used {:.0} days ago)",
                activated.staleness.last_accessed_days_ago
            );
        }
        if let Some(note) = &activated.contradiction {
            println!("     ! conflicts with {}: {}", note.counterpart_id, note.caution);
        }
        println!();
    }

    Ok(())
}
