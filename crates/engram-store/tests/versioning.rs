//! Cross-module store behavior: versioning invariants, index consistency,
//! and recovery — exercised through the public API only.

use chrono::{TimeZone, Utc};

use engram_core::config::EngramConfig;
use engram_store::{FactStore, NewFact, SearchQuery, UpsertOutcome};

fn fact(key: &str, value: &str, secs: i64) -> NewFact {
    NewFact {
        key: key.to_string(),
        value: value.to_string(),
        source: "test".to_string(),
        start_time: Utc.timestamp_opt(secs, 0).unwrap(),
    }
}

#[test]
fn the_simple_update_scenario() {
    // Two sessions on consecutive days update the same key.
    let store = FactStore::open_in_memory().unwrap();
    let t1 = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
    let t2 = Utc.with_ymd_and_hms(2026, 1, 2, 9, 0, 0).unwrap();

    store
        .upsert(&NewFact {
            key: "user.city".into(),
            value: "Taipei".into(),
            source: "session:a".into(),
            start_time: t1,
        })
        .unwrap();
    store
        .upsert(&NewFact {
            key: "user.city".into(),
            value: "Hsinchu".into(),
            source: "session:b".into(),
            start_time: t2,
        })
        .unwrap();

    let history = store.history("user.city").unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].value, "Taipei");
    assert_eq!(history[0].start_time, t1);
    assert_eq!(history[0].end_time, Some(t2));
    assert_eq!(history[1].value, "Hsinchu");
    assert_eq!(history[1].start_time, t2);
    assert!(history[1].end_time.is_none());

    assert_eq!(store.count_active().unwrap(), 1);
}

#[test]
fn fts_follows_the_active_set() {
    let store = FactStore::open_in_memory().unwrap();
    let config = EngramConfig::default();
    store.upsert(&fact("user.editor", "vscode", 100)).unwrap();

    let query = SearchQuery {
        text: Some("vscode".to_string()),
        limit: 10,
        ..Default::default()
    };
    assert_eq!(store.search(&query, &config).unwrap().len(), 1);

    // Supersede: the old value must leave the index, the new one enter it.
    store.upsert(&fact("user.editor", "helix", 200)).unwrap();
    assert!(store.search(&query, &config).unwrap().is_empty());

    let query_new = SearchQuery {
        text: Some("helix".to_string()),
        limit: 10,
        ..Default::default()
    };
    assert_eq!(store.search(&query_new, &config).unwrap().len(), 1);

    // Delete: gone from the index, kept in history.
    store.delete("user.editor").unwrap();
    assert!(store.search(&query_new, &config).unwrap().is_empty());
    assert_eq!(store.history("user.editor").unwrap().len(), 2);
}

#[test]
fn reindex_rebuilds_from_active_rows() {
    let store = FactStore::open_in_memory().unwrap();
    let config = EngramConfig::default();
    store.upsert(&fact("user.name", "Ada Lovelace", 100)).unwrap();
    store.upsert(&fact("user.city", "Taipei", 200)).unwrap();
    store.delete("user.city").unwrap();

    let reindexed = store.reindex_fts().unwrap();
    assert_eq!(reindexed, 1);

    let query = SearchQuery {
        text: Some("Lovelace".to_string()),
        limit: 10,
        ..Default::default()
    };
    assert_eq!(store.search(&query, &config).unwrap().len(), 1);
}

#[test]
fn merge_writes_under_the_target_key() {
    // The semantic-dedup merge path: candidate `user.ide` folds into the
    // existing `user.favorite_editor`.
    let store = FactStore::open_in_memory().unwrap();
    store
        .upsert(&fact("user.favorite_editor", "vscode", 100))
        .unwrap();

    let candidate = fact("user.ide", "VS Code", 200);
    let outcome = store
        .apply_merge("user.favorite_editor", &candidate)
        .unwrap();
    assert!(matches!(outcome, UpsertOutcome::Superseded { .. }));

    assert!(store.active("user.ide").unwrap().is_none());
    let active = store.active("user.favorite_editor").unwrap().unwrap();
    assert_eq!(active.value, "VS Code");
    assert_eq!(store.history("user.favorite_editor").unwrap().len(), 2);
}

#[test]
fn repeated_upserts_are_idempotent() {
    let store = FactStore::open_in_memory().unwrap();
    assert!(matches!(
        store.upsert(&fact("user.name", "Ada", 100)).unwrap(),
        UpsertOutcome::Inserted { .. }
    ));
    // identical value, later timestamp → skip (law from the versioning model)
    assert_eq!(
        store.upsert(&fact("user.name", "Ada", 999)).unwrap(),
        UpsertOutcome::Skip
    );
    assert_eq!(store.history("user.name").unwrap().len(), 1);
}

#[test]
fn per_key_start_times_stay_strictly_monotonic() {
    let store = FactStore::open_in_memory().unwrap();
    // all at the same instant — the store must still order them
    for value in ["a", "b", "c"] {
        store.upsert(&fact("config.flag", value, 100)).unwrap();
    }
    let history = store.history("config.flag").unwrap();
    assert_eq!(history.len(), 3);
    for pair in history.windows(2) {
        assert!(pair[0].start_time < pair[1].start_time);
        assert_eq!(pair[0].end_time, Some(pair[1].start_time));
    }
    assert_eq!(history.iter().filter(|f| f.is_active()).count(), 1);
}
