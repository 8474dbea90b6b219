//! Concurrent commit races against a shared store.

use stateline_state::{Delta, FieldMap, Snapshot, Value};
use stateline_store::{CommitError, MemoryStore, Resolver};
use std::sync::Arc;

fn fields(hp: i64) -> FieldMap {
    let mut f = FieldMap::new();
    f.insert("hp", Value::Int(hp));
    f
}

fn delta(base: u64, hp: i64) -> Delta {
    Delta {
        base_version: base,
        result_version: base + 1,
        timestamp: 50,
        changes: fields(hp),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn racing_commits_produce_one_winner_and_one_informed_loser() {
    let resolver = Resolver::new(Arc::new(MemoryStore::new()));
    resolver
        .create("p1", Snapshot::new(10, 0, fields(100)))
        .await
        .unwrap();

    // Two sessions commit against the same base version at once.
    let a = {
        let resolver = resolver.clone();
        tokio::spawn(async move { resolver.commit("p1", &delta(10, 95)).await })
    };
    let b = {
        let resolver = resolver.clone();
        tokio::spawn(async move { resolver.commit("p1", &delta(10, 80)).await })
    };
    let results = [a.await.unwrap(), b.await.unwrap()];

    let wins = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1, "exactly one commit must land");

    let winner_hp = results
        .iter()
        .find_map(|r| r.as_ref().ok())
        .map(|o| o.snapshot.fields.get("hp").cloned())
        .unwrap();

    // The loser receives the winning snapshot, not a bare error.
    match results.iter().find(|r| r.is_err()).unwrap() {
        Err(CommitError::VersionConflict { base, current }) => {
            assert_eq!(*base, 10);
            assert_eq!(current.version, 11);
            assert_eq!(current.fields.get("hp").cloned(), winner_hp);
        }
        other => panic!("expected version conflict, got {other:?}"),
    }

    let record = resolver.current("p1").await.unwrap().unwrap();
    assert_eq!(record.version, 11);
}

#[tokio::test(flavor = "multi_thread")]
async fn commits_for_different_players_never_interfere() {
    let resolver = Resolver::new(Arc::new(MemoryStore::new()));
    for player in ["p1", "p2", "p3", "p4"] {
        resolver
            .create(player, Snapshot::new(0, 0, fields(100)))
            .await
            .unwrap();
    }

    let mut tasks = Vec::new();
    for player in ["p1", "p2", "p3", "p4"] {
        let resolver = resolver.clone();
        tasks.push(tokio::spawn(async move {
            for version in 0..20 {
                resolver
                    .commit(player, &delta(version, version as i64))
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    for player in ["p1", "p2", "p3", "p4"] {
        let record = resolver.current(player).await.unwrap().unwrap();
        assert_eq!(record.version, 20);
        assert_eq!(record.snapshot.fields.get("hp"), Some(&Value::Int(19)));
    }
}
