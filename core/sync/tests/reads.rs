mod support;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use lodestar_common::{ActionName, ChangeKind, Error};
use lodestar_sync::{ActionConfig, ExecutionOrder, HookSet, ModuleConfig, OnError, SyncConfig};

use support::{as_backend, engine, entries, log, MockRemote};

fn config(read: &[&str], write: &[&str], debounce_ms: u64) -> SyncConfig {
    SyncConfig {
        execution_order: ExecutionOrder::new()
            .read(read.iter().copied())
            .write(write.iter().copied()),
        sync_debounce_ms: debounce_ms,
        ..SyncConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_identical_fetches_share_one_round_trip() {
    let remote = Arc::new(MockRemote::new("remote").delay_ms(50));
    remote.seed("users", "u1", json!({"name": "Luca"}));
    let (engine, _cache) = engine(config(&["remote"], &["cache"], 0), vec![as_backend(&remote)]);
    let users = engine.collection("users").unwrap();

    let (first, second) = tokio::join!(
        users.fetch(json!({"limit": 10}), ActionConfig::new()),
        users.fetch(json!({"limit": 10}), ActionConfig::new()),
    );

    assert_eq!(remote.fetch_count(), 1);
    assert_eq!(first.unwrap(), second.unwrap());
    assert_eq!(engine.in_flight_fetches(), 0);

    // Settled: the next identical fetch goes out again.
    users.fetch(json!({"limit": 10}), ActionConfig::new()).await.unwrap();
    assert_eq!(remote.fetch_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_running_fetch_is_joined_across_references() {
    let remote = Arc::new(MockRemote::new("remote").delay_ms(50));
    remote.seed("users", "u1", json!({"name": "Luca"}));
    let (engine, _cache) = engine(config(&["remote"], &["cache"], 0), vec![as_backend(&remote)]);
    let plain = engine.collection("users").unwrap();
    let shaped = engine
        .collection_with(
            "users",
            ModuleConfig::new().hooks(HookSet::new().modify_read_response_on(
                ChangeKind::Added,
                |mut doc, _| {
                    doc.insert("shaped".into(), json!(true));
                    Some(doc)
                },
            )),
        )
        .unwrap();

    let (first, second) = tokio::join!(
        plain.fetch(json!({}), ActionConfig::new()),
        shaped.fetch(json!({}), ActionConfig::new()),
    );

    assert_eq!(remote.fetch_count(), 1);
    // The reference that started the fetch decides its shape.
    assert!(first.unwrap()["u1"].get("shaped").is_none());
    assert!(second.unwrap()["u1"].get("shaped").is_none());

    let alone = shaped.fetch(json!({}), ActionConfig::new()).await.unwrap();
    assert_eq!(alone["u1"]["shaped"], true);
}

#[tokio::test(start_paused = true)]
async fn test_different_payloads_are_not_shared() {
    let remote = Arc::new(MockRemote::new("remote").delay_ms(50));
    let (engine, _cache) = engine(config(&["remote"], &["cache"], 0), vec![as_backend(&remote)]);
    let users = engine.collection("users").unwrap();

    let (a, b) = tokio::join!(
        users.fetch(json!({"limit": 10}), ActionConfig::new()),
        users.fetch(json!({"limit": 20}), ActionConfig::new()),
    );
    a.unwrap();
    b.unwrap();
    assert_eq!(remote.fetch_count(), 2);
}

#[tokio::test]
async fn test_fetched_docs_are_committed_locally() {
    let remote = Arc::new(MockRemote::new("remote"));
    remote.seed("users", "u1", json!({"name": "Luca"}));
    remote.seed("users", "u2", json!({"name": "Mia"}));
    let (engine, _cache) = engine(config(&["remote"], &["cache"], 0), vec![as_backend(&remote)]);
    let users = engine.collection("users").unwrap();

    let docs = users.fetch(json!({}), ActionConfig::new()).await.unwrap();

    assert_eq!(docs.len(), 2);
    assert_eq!(users.data().len(), 2);
    assert_eq!(users.doc("u2").unwrap().data().unwrap()["name"], "Mia");
}

#[tokio::test]
async fn test_known_doc_is_served_optimistically() {
    let remote = Arc::new(MockRemote::new("remote"));
    remote.seed("users", "u1", json!({"name": "Remote"}));
    let (engine, _cache) = engine(config(&["cache", "remote"], &["cache"], 0), vec![as_backend(&remote)]);
    let user = engine.doc("users/u1").unwrap();
    user.insert(json!({"name": "Local"}), ActionConfig::new())
        .await
        .unwrap();

    let data = user.fetch(json!({}), ActionConfig::new()).await.unwrap().unwrap();
    assert_eq!(data["name"], "Local");
    assert_eq!(remote.fetch_count(), 0);

    let data = user
        .fetch(json!({}), ActionConfig::new().force())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(data["name"], "Remote");
    assert_eq!(remote.fetch_count(), 1);
}

#[tokio::test]
async fn test_unknown_doc_is_fetched() {
    let remote = Arc::new(MockRemote::new("remote"));
    remote.seed("users", "u1", json!({"name": "Remote"}));
    let (engine, _cache) = engine(config(&["cache", "remote"], &["cache"], 0), vec![as_backend(&remote)]);

    let data = engine
        .doc("users/u1")
        .unwrap()
        .fetch(json!({}), ActionConfig::new())
        .await
        .unwrap();

    assert_eq!(data.unwrap()["name"], "Remote");
    assert_eq!(remote.fetch_count(), 1);
}

#[tokio::test]
async fn test_missing_doc_is_removed_locally() {
    let remote = Arc::new(MockRemote::new("remote").missing("u1"));
    let (engine, _cache) = engine(config(&["remote"], &["cache"], 0), vec![as_backend(&remote)]);
    let user = engine.doc("users/u1").unwrap();
    user.insert(json!({"name": "Stale"}), ActionConfig::new())
        .await
        .unwrap();

    let data = user
        .fetch(json!({}), ActionConfig::new().force())
        .await
        .unwrap();

    assert!(data.is_none());
    assert!(user.data().is_none());
}

#[tokio::test]
async fn test_deferred_backend_sees_later_docs() {
    let seen = log();
    let observer = Arc::new(MockRemote::new("observer").deferring(&seen));
    let remote = Arc::new(MockRemote::new("remote"));
    remote.seed("users", "u1", json!({"name": "Luca"}));
    remote.seed("users", "u2", json!({"name": "Mia"}));
    let (engine, _cache) = engine(
        config(&["observer", "remote"], &["cache"], 0),
        vec![as_backend(&observer), as_backend(&remote)],
    );

    engine
        .collection("users")
        .unwrap()
        .fetch(json!({}), ActionConfig::new())
        .await
        .unwrap();

    assert_eq!(entries(&seen), vec!["u1", "u2"]);
}

#[tokio::test(start_paused = true)]
async fn test_read_waits_for_pending_write() {
    let timeline = log();
    let remote = Arc::new(MockRemote::new("remote").delay_ms(100).timeline(&timeline));
    remote.seed("users", "u1", json!({"name": "old"}));
    let (engine, _cache) = engine(config(&["remote"], &["cache", "remote"], 50), vec![as_backend(&remote)]);
    let user = engine.doc("users/u1").unwrap();

    let writer = {
        let user = user.clone();
        tokio::spawn(async move { user.merge(json!({"name": "new"}), ActionConfig::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(engine.locks().is_locked(user.collection().path()));

    let data = user
        .fetch(json!({}), ActionConfig::new().force())
        .await
        .unwrap()
        .unwrap();

    writer.await.unwrap().unwrap();
    assert_eq!(data["name"], "new");
    assert_eq!(entries(&timeline), vec!["remote:merge", "remote:fetch"]);
}

#[tokio::test]
async fn test_fetch_error_policies() {
    let remote = Arc::new(MockRemote::new("remote").failing_reads());
    let (engine, _cache) = engine(config(&["remote", "cache"], &["cache"], 0), vec![as_backend(&remote)]);
    let users = engine.collection("users").unwrap();

    let err = users.fetch(json!({}), ActionConfig::new()).await.unwrap_err();
    assert!(matches!(err, Error::BackendActionFailed { action: ActionName::Fetch, .. }));

    let docs = users
        .fetch(json!({}), ActionConfig::new().on_error(OnError::Continue))
        .await
        .unwrap();
    assert!(docs.is_empty());
}

#[tokio::test]
async fn test_fetch_count_takes_largest() {
    let remote = Arc::new(MockRemote::new("remote").count(151));
    let (engine, _cache) = engine(config(&["cache", "remote"], &["cache"], 0), vec![as_backend(&remote)]);
    let users = engine.collection("users").unwrap();
    users.insert(json!({"name": "Luca"}), ActionConfig::new()).await.unwrap();

    assert_eq!(users.fetch_count(json!({}), ActionConfig::new()).await.unwrap(), 151);
    assert_eq!(
        users
            .fetch_count(json!({}), ActionConfig::new().execution_order(["cache"]))
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn test_fetch_aggregate_merges_in_order() {
    let remote = Arc::new(MockRemote::new("remote").aggregate(json!({"sum": {"hp": 100}})));
    let (engine, _cache) = engine(config(&["cache", "remote"], &["cache"], 0), vec![as_backend(&remote)]);
    let users = engine.collection("users").unwrap();
    for hp in [3, 4] {
        users.insert(json!({"hp": hp}), ActionConfig::new()).await.unwrap();
    }

    let agg = users
        .fetch_aggregate(json!({"sum": ["hp"], "average": ["hp"]}), ActionConfig::new())
        .await
        .unwrap();

    assert_eq!(agg["sum"]["hp"], 100);
    assert_eq!(agg["average"]["hp"], 3.5);
}

#[tokio::test]
async fn test_reads_without_order_fail() {
    let (engine, _cache) = engine(SyncConfig::default(), vec![]);
    let users = engine.collection("users").unwrap();

    let result = users.fetch(json!({}), ActionConfig::new()).await;
    assert!(matches!(
        result,
        Err(Error::NoBackendsConfigured { action: ActionName::Fetch })
    ));
    let result = users.fetch_count(json!({}), ActionConfig::new()).await;
    assert!(matches!(
        result,
        Err(Error::NoBackendsConfigured { action: ActionName::FetchCount })
    ));
}
