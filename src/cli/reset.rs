//! CLI `reset` command: delete all knowledge after user confirmation.

use anyhow::{bail, Result};
use std::io::Write;

use crate::config::LoreConfig;

/// Delete all entries, relations, and the episode log, and rewind the cursor.
/// Asks for `YES` on stdin unless `assume_yes` is set.
pub fn reset(config: &LoreConfig, assume_yes: bool) -> Result<()> {
    let db_path = config.resolved_db_path();

    if !assume_yes {
        println!("WARNING: This will permanently delete ALL knowledge entries, relations, and the episode log.");
        println!("The next consolidation run will start again from the oldest transcript.");
        println!("Database: {}", db_path.display());
        print!("\nType YES to confirm: ");
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;

        if input.trim() != "YES" {
            bail!("reset cancelled");
        }
    }

    let mut conn = crate::db::open_database(&db_path, config.embedding.dimensions)?;
    let summary = crate::knowledge::state::reset_all(&mut conn)?;

    println!(
        "Removed {} entries, {} relations, {} recorded episodes. Cursor reset to 0.",
        summary.entries_removed, summary.relations_removed, summary.episodes_removed
    );
    Ok(())
}
