mod helpers;

use helpers::*;
use lore::knowledge::relations::{contradiction_counterparts, mark_conflicted, relations_for};
use lore::knowledge::store;
use lore::knowledge::types::{EntryStatus, RelationKind};

const OLD: &str = "The API listens on port 8080.";
const NEW: &str = "The API moved to port 9090.";

/// Seed the old port fact and script extraction of the new one, which lands
/// in the contradiction band (cosine 0.6) and shares the `api` topic.
fn port_scenario() -> (Harness, String) {
    let h = Harness::new();
    let old = seed_entry(&h.conn(), OLD, &["api", "ports"], &axis(0)).id;
    h.source.add_session(
        "s1",
        conversation("s1", 1_000, &["We moved the API to 9090.", "Noted."]),
    );
    h.embedder.set(NEW, blend(0, 6, 0.6));
    h.llm.extract_always(extraction(&[(NEW, &["api"])]));
    (h, old)
}

fn resolve_all(resolution: &'static str) -> impl FnMut(&str) -> anyhow::Result<String> + Send {
    move |prompt| {
        let items: Vec<serde_json::Value> = listed_candidates(prompt)
            .into_iter()
            .map(|id| serde_json::json!({"candidateId": id, "resolution": resolution}))
            .collect();
        Ok(serde_json::Value::Array(items).to_string())
    }
}

fn new_entry_id(h: &Harness) -> String {
    let conn = h.conn();
    let id: String = conn
        .query_row("SELECT id FROM entries WHERE content = ?1", [NEW], |row| row.get(0))
        .unwrap();
    id
}

#[tokio::test]
async fn supersede_old_retires_outdated_entry() {
    let (h, old) = port_scenario();
    h.llm.on_contradiction(resolve_all("supersede_old"));

    let report = h.state.consolidate().await.unwrap();

    assert_eq!(h.llm.count(Call::Contradiction), 1);
    assert!(listed_candidates(&h.llm.prompts(Call::Contradiction)[0]).contains(&old));
    assert_eq!(report.entries_created, 1);
    assert_eq!(report.conflicts_resolved, 1);
    assert_eq!(report.conflicts_detected, 0);

    let new = new_entry_id(&h);
    let retired = h.entry(&old);
    assert_eq!(retired.status, EntryStatus::Superseded);
    assert_eq!(retired.superseded_by.as_deref(), Some(new.as_str()));

    let relations = relations_for(&h.conn(), &new).unwrap();
    assert!(relations
        .iter()
        .any(|r| r.kind == RelationKind::Supersedes && r.source_id == new && r.target_id == old));

    h.embedder.set("which port does the api use", axis(0));
    let result = h
        .state
        .activate("which port does the api use", None, None)
        .await
        .unwrap();
    let ids: Vec<&str> = result.entries.iter().map(|a| a.entry.id.as_str()).collect();
    assert_eq!(ids, vec![new.as_str()]);
    assert_eq!(result.total_live_count, 1);
}

#[tokio::test]
async fn supersede_new_keeps_existing_entry() {
    let (h, old) = port_scenario();
    h.llm.on_contradiction(resolve_all("supersede_new"));

    h.state.consolidate().await.unwrap();

    let new = h.entry(&new_entry_id(&h));
    assert_eq!(new.status, EntryStatus::Superseded);
    assert_eq!(new.superseded_by.as_deref(), Some(old.as_str()));
    assert_eq!(h.entry(&old).status, EntryStatus::Active);
}

#[tokio::test]
async fn merge_folds_candidate_and_backfills_embedding() {
    const MERGED: &str = "The API moved from port 8080 to 9090.";
    let (h, old) = port_scenario();
    h.llm.on_contradiction(move |prompt| {
        let id = listed_candidates(prompt).remove(0);
        Ok(serde_json::json!([{
            "candidateId": id,
            "resolution": "merge",
            "mergedContent": MERGED,
            "mergedTopics": ["api", "ports"],
        }])
        .to_string())
    });
    h.embedder.set(MERGED, blend(0, 6, 0.7));

    let report = h.state.consolidate().await.unwrap();

    assert_eq!(report.conflicts_resolved, 1);
    assert_eq!(report.embeddings_backfilled, 1);

    let conn = h.conn();
    let merged_id: String = conn
        .query_row("SELECT id FROM entries WHERE content = ?1", [MERGED], |row| row.get(0))
        .unwrap();
    let merged = store::get_entry(&conn, &merged_id).unwrap().unwrap();
    assert_eq!(merged.status, EntryStatus::Active);
    assert_eq!(merged.topics, vec!["api".to_string(), "ports".to_string()]);
    assert!(merged.source_ids.contains(&"seed".to_string()));
    assert!(merged.source_ids.contains(&"s1".to_string()));
    assert_eq!(
        store::get_embedding(&conn, &merged_id).unwrap().unwrap(),
        blend(0, 6, 0.7)
    );

    let retired = store::get_entry(&conn, &old).unwrap().unwrap();
    assert_eq!(retired.status, EntryStatus::Superseded);
    assert_eq!(retired.superseded_by.as_deref(), Some(merged_id.as_str()));
}

#[tokio::test]
async fn merge_without_fields_still_supersedes() {
    let (h, old) = port_scenario();
    h.llm.on_contradiction(resolve_all("merge"));

    h.state.consolidate().await.unwrap();

    let new = h.entry(&new_entry_id(&h));
    assert_eq!(new.content, NEW);
    assert_eq!(new.status, EntryStatus::Active);
    assert_eq!(h.entry(&old).status, EntryStatus::Superseded);
}

#[tokio::test]
async fn irresolvable_conflict_marks_both_sides() {
    let (h, old) = port_scenario();
    h.llm.on_contradiction(resolve_all("irresolvable"));

    let report = h.state.consolidate().await.unwrap();
    assert_eq!(report.conflicts_detected, 1);
    assert_eq!(report.conflicts_resolved, 0);

    let new = new_entry_id(&h);
    assert_eq!(h.entry(&old).status, EntryStatus::Conflicted);
    assert_eq!(h.entry(&new).status, EntryStatus::Conflicted);
    {
        let conn = h.conn();
        assert_eq!(contradiction_counterparts(&conn, &old).unwrap(), vec![new.clone()]);
        assert_eq!(contradiction_counterparts(&conn, &new).unwrap(), vec![old.clone()]);
    }

    // Both sides match: each is annotated with the other.
    h.embedder.set("api port", axis(0));
    let both = h.state.activate("api port", None, None).await.unwrap();
    assert_eq!(both.entries.len(), 2);
    for activated in &both.entries {
        let note = activated.contradiction.as_ref().expect("conflict annotated");
        let expected = if activated.entry.id == old { &new } else { &old };
        assert_eq!(&note.counterpart_id, expected);
    }

    // Only the new side matches: the conflict stays silent.
    h.embedder.set("port 9090 details", axis(6));
    let one = h.state.activate("port 9090 details", None, None).await.unwrap();
    assert_eq!(one.entries.len(), 1);
    assert_eq!(one.entries[0].entry.id, new);
    assert!(one.entries[0].contradiction.is_none());
}

#[tokio::test]
async fn unknown_candidate_ids_are_ignored() {
    let (h, old) = port_scenario();
    h.llm.on_contradiction(|_| {
        Ok(r#"[{"candidateId": "made-up-id", "resolution": "supersede_old"}]"#.into())
    });

    let report = h.state.consolidate().await.unwrap();

    assert_eq!(report.conflicts_resolved, 0);
    assert_eq!(h.entry(&old).status, EntryStatus::Active);
    assert_eq!(h.live().len(), 2);
}

#[tokio::test]
async fn superseding_a_conflicted_entry_restores_its_counterpart() {
    let (h, old) = port_scenario();
    let billing = {
        let conn = h.conn();
        let billing = seed_entry(&conn, "Invoices go out monthly.", &["billing"], &axis(3)).id;
        mark_conflicted(&conn, &old, &billing, "irresolvable", chrono::Utc::now()).unwrap();
        billing
    };
    h.llm.on_contradiction(resolve_all("supersede_old"));

    h.state.consolidate().await.unwrap();

    assert_eq!(h.entry(&old).status, EntryStatus::Superseded);
    assert_eq!(h.entry(&billing).status, EntryStatus::Active);
    assert!(contradiction_counterparts(&h.conn(), &billing).unwrap().is_empty());
}

#[tokio::test]
async fn entries_outside_the_band_are_not_checked() {
    let h = Harness::new();
    seed_entry(&h.conn(), OLD, &["api"], &axis(0));
    h.source
        .add_session("s1", conversation("s1", 1_000, &["api rate limits", "ok"]));
    h.embedder.set("The API is rate limited.", blend(0, 6, 0.3));
    h.llm
        .extract_always(extraction(&[("The API is rate limited.", &["api"])]));

    let report = h.state.consolidate().await.unwrap();

    assert_eq!(report.entries_created, 1);
    assert_eq!(h.llm.count(Call::Contradiction), 0);
}

#[tokio::test]
async fn merged_entry_is_reconciled_against_in_later_chunks() {
    const MERGED: &str = "The API moved from port 8080 to 9090.";
    const RESTATED: &str = "The API now serves on port 9090.";
    let mut config = test_config();
    config.consolidation.episodes_per_chunk = 1;
    let h = Harness::with_config(config);

    seed_entry(&h.conn(), OLD, &["api", "ports"], &axis(0));
    h.source.add_session(
        "s1",
        conversation("s1", 1_000, &["We moved the API to 9090.", "Noted."]),
    );
    h.source.add_session(
        "s2",
        conversation("s2", 3_000, &["Reminder: the API is on 9090 now.", "Yes."]),
    );
    h.embedder.set(NEW, blend(0, 6, 0.6));
    h.embedder.set(MERGED, blend(0, 6, 0.7));
    h.embedder.set(RESTATED, blend(0, 6, 0.7));
    h.llm.on_extract(|prompt| {
        if prompt.contains("We moved the API to 9090.") {
            Ok(extraction(&[(NEW, &["api"])]))
        } else {
            Ok(extraction(&[(RESTATED, &["api"])]))
        }
    });
    h.llm.on_contradiction(|prompt| {
        let id = listed_candidates(prompt).remove(0);
        Ok(serde_json::json!([{
            "candidateId": id,
            "resolution": "merge",
            "mergedContent": MERGED,
        }])
        .to_string())
    });
    h.llm.on_reconcile(|_| Ok(r#"{"action": "keep"}"#.into()));

    let report = h.state.consolidate().await.unwrap();

    assert_eq!(report.segments_processed, 2);
    assert_eq!(report.entries_created, 1);
    assert_eq!(report.embeddings_backfilled, 1);
    assert_eq!(h.llm.count(Call::Reconcile), 1, "restatement met the merged entry");
    assert!(h.llm.prompts(Call::Reconcile)[0].contains(MERGED));

    let live = h.live();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].content, MERGED);
    assert_eq!(live[0].observation_count, 2);
}
