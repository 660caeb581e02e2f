use anyhow::Result;

use crate::config::LoreConfig;

/// Display knowledge store statistics in the terminal.
pub fn stats(config: &LoreConfig) -> Result<()> {
    let db_path = config.resolved_db_path();
    let conn = crate::db::open_database(&db_path, config.embedding.dimensions)?;

    let response = crate::knowledge::stats::knowledge_stats(&conn, Some(&db_path))?;

    println!("Knowledge Statistics");
    println!("{}", "=".repeat(40));
    println!("  Total entries:       {}", response.total_entries);
    println!("  Live:                {}", response.live_entries);
    println!("  Missing embedding:   {}", response.entries_missing_embedding);
    println!();

    println!("By Status:");
    for (status, count) in &response.by_status {
        println!("  {:<12} {}", status, count);
    }
    println!();

    println!("By Kind (live):");
    for (kind, count) in &response.by_type {
        println!("  {:<12} {}", kind, count);
    }
    println!();

    if !response.by_relation.is_empty() {
        println!("Relations:");
        for (kind, count) in &response.by_relation {
            println!("  {:<12} {}", kind, count);
        }
        println!();
    }

    let state = &response.consolidation;
    println!("Consolidation:");
    println!(
        "  Last run:            {}",
        state.last_run_at.as_deref().unwrap_or("never")
    );
    println!("  Cursor (ms):         {}", state.cursor_ms);
    println!("  Episodes recorded:   {}", response.processed_episodes);
    println!("  Sessions processed:  {}", state.sessions_processed);
    println!("  Entries created:     {}", state.entries_created);
    println!("  Entries updated:     {}", state.entries_updated);
    println!();

    println!("Database size:         {} bytes", response.db_size_bytes);

    Ok(())
}
