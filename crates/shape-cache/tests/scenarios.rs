//! End-to-end scenarios driven against the in-memory fakes of Storage,
//! Persistent KV, and the Postgres snapshot boundary.

use std::sync::Arc;
use std::time::Duration;

use shape_cache::cache::ShapeCache;
use shape_cache::config::ShapeCacheConfig;
use shape_cache::error::AwaitSnapshotResult;
use shape_cache::inspector::recording::RecordingInspector;
use shape_cache::inspector::NullInspector;
use shape_cache::kv::memory::MemoryKv;
use shape_cache::log_collector::{Change, Transaction};
use shape_cache::offset::LogOffset;
use shape_cache::relation::Relation;
use shape_cache::shape::{Column, Shape, TableRef};
use shape_cache::snapshotter::fakes::{CountingTablePreparer, ScriptedSnapshotProducer};
use shape_cache::storage::memory::MemoryStorageFactory;
use shape_cache::storage::ChangeKind;

fn items_shape() -> Shape {
    Shape::new(
        TableRef::new("public", "items"),
        None,
        vec![Column {
            name: "id".into(),
            type_oid: 23,
        }],
        vec!["id".into()],
    )
}

async fn build_cache(
    preparer: Arc<CountingTablePreparer>,
    producer: Arc<ScriptedSnapshotProducer>,
) -> (ShapeCache, Arc<MemoryKv>) {
    let kv = Arc::new(MemoryKv::new());
    let cache = ShapeCache::new(
        ShapeCacheConfig::default(),
        kv.clone(),
        Arc::new(MemoryStorageFactory),
        preparer,
        producer,
        Arc::new(NullInspector),
    )
    .await
    .unwrap();
    (cache, kv)
}

/// 10 concurrent callers requesting the same shape all receive the same
/// handle; the Snapshotter and its table-preparation step run once.
#[tokio::test]
async fn concurrent_creation_is_single_flight() {
    let preparer = Arc::new(CountingTablePreparer::new());
    let producer = Arc::new(ScriptedSnapshotProducer::succeeding(100, vec![]));
    let (cache, _kv) = build_cache(preparer.clone(), producer.clone()).await;
    let cache = Arc::new(cache);

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let cache = cache.clone();
        tasks.push(tokio::spawn(async move { cache.get_or_create_shape_handle(items_shape()).await.unwrap() }));
    }

    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap().0);
    }

    let first = handles[0].clone();
    assert!(handles.iter().all(|h| *h == first));

    // give the single Snapshotter a moment to run to completion
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(preparer.call_count(), 1);
    assert_eq!(producer.call_count(), 1);
}

/// Offset update scenario, plus the unknown-handle error path.
#[tokio::test]
async fn offset_update_advances_and_rejects_unknown_handle() {
    let preparer = Arc::new(CountingTablePreparer::new());
    let producer = Arc::new(ScriptedSnapshotProducer::succeeding(1, vec![]));
    let (cache, _kv) = build_cache(preparer, producer).await;

    let (handle, offset) = cache.get_or_create_shape_handle(items_shape()).await.unwrap();
    assert_eq!(offset, LogOffset::ZERO);

    let tx = Transaction {
        xid: 1,
        lsn: 1000,
        last_log_offset: LogOffset::new(1000, 0),
        changes: vec![Change {
            relation: TableRef::new("public", "items"),
            kind: ChangeKind::Insert,
            record: serde_json::json!({"id": 1}),
            key: serde_json::json!({"id": 1}),
            log_offset: LogOffset::new(1000, 0),
        }],
        affected_relations: [TableRef::new("public", "items")].into_iter().collect(),
    };
    cache.handle_transaction(tx);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (_, offset) = cache.get_or_create_shape_handle(items_shape()).await.unwrap();
    assert_eq!(offset, LogOffset::new(1000, 0));
    let _ = handle;

    let err = cache
        .update_shape_latest_offset(&shape_cache::shape::ShapeHandle::from_raw("foo"), LogOffset::new(1, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, shape_cache::error::ShapeCacheError::UnknownHandle(_)));
}

/// An orphan handle resolves `Unknown`, and never reports a snapshot.
#[tokio::test]
async fn unknown_handle_await_resolves_unknown() {
    let preparer = Arc::new(CountingTablePreparer::new());
    let producer = Arc::new(ScriptedSnapshotProducer::succeeding(1, vec![]));
    let (cache, _kv) = build_cache(preparer, producer).await;

    let orphan = shape_cache::shape::ShapeHandle::from_raw("orphan");
    let result = cache.await_snapshot_start(&orphan).await;
    assert!(matches!(result, AwaitSnapshotResult::Unknown));
}

/// A Snapshotter failure is visible to every concurrent waiter.
#[tokio::test]
async fn snapshot_failure_propagates_to_all_listeners() {
    let preparer = Arc::new(CountingTablePreparer::new());
    let producer = Arc::new(ScriptedSnapshotProducer::failing("expected error"));
    let (cache, _kv) = build_cache(preparer, producer).await;
    let cache = Arc::new(cache);

    let (handle, _) = cache.get_or_create_shape_handle(items_shape()).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let cache = cache.clone();
        let handle = handle.clone();
        tasks.push(tokio::spawn(async move { cache.await_snapshot_start(&handle).await }));
    }
    for task in tasks {
        let result = task.await.unwrap();
        assert!(matches!(result, AwaitSnapshotResult::Failed(ref e) if e == "expected error"));
    }
}

/// A rename cleans the shapes it affects and spares the rest.
#[tokio::test]
async fn relation_rename_cleans_affected_shapes_only() {
    let preparer = Arc::new(CountingTablePreparer::new());
    let producer = Arc::new(ScriptedSnapshotProducer::succeeding(1, vec![]));
    let kv = Arc::new(MemoryKv::new());
    let inspector = Arc::new(RecordingInspector::new());
    let cache = ShapeCache::new(
        ShapeCacheConfig::default(),
        kv,
        Arc::new(MemoryStorageFactory),
        preparer,
        producer,
        inspector.clone(),
    )
    .await
    .unwrap();

    let s1 = Shape::new(TableRef::new("public", "test_table"), None, vec![], vec!["id".into()]);
    let s2 = Shape::new(
        TableRef::new("public", "test_table"),
        Some("id>5".into()),
        vec![],
        vec!["id".into()],
    );
    let s3 = Shape::new(TableRef::new("public", "other_table"), None, vec![], vec!["id".into()]);

    let (h1, _) = cache.get_or_create_shape_handle(s1.clone()).await.unwrap();
    let (h2, _) = cache.get_or_create_shape_handle(s2.clone()).await.unwrap();
    let (h3, _) = cache.get_or_create_shape_handle(s3.clone()).await.unwrap();

    let before = Relation {
        id: 42,
        schema: "public".into(),
        table: "test_table".into(),
        columns: vec![Column {
            name: "id".into(),
            type_oid: 23,
        }],
    };
    cache.handle_relation_message(before).await.unwrap();

    let after = Relation {
        id: 42,
        schema: "public".into(),
        table: "renamed_test_table".into(),
        columns: vec![Column {
            name: "id".into(),
            type_oid: 23,
        }],
    };
    cache.handle_relation_message(after).await.unwrap();

    assert!(!cache.has_shape(&h1).await);
    assert!(!cache.has_shape(&h2).await);
    assert!(cache.has_shape(&h3).await);

    let calls = inspector.calls();
    assert_eq!(calls, vec![TableRef::new("public", "test_table")]);
}

/// A fresh `ShapeCache` over the same KV recovers the handle, its offset,
/// its xmin, and its `Started` snapshot state.
#[tokio::test]
async fn restart_round_trips_shape_state() {
    let kv = Arc::new(MemoryKv::new());
    let handle;
    {
        let preparer = Arc::new(CountingTablePreparer::new());
        let producer = Arc::new(ScriptedSnapshotProducer::succeeding(10, vec![]));
        let cache = ShapeCache::new(
            ShapeCacheConfig::default(),
            kv.clone(),
            Arc::new(MemoryStorageFactory),
            preparer,
            producer,
            Arc::new(NullInspector),
        )
        .await
        .unwrap();

        let (h, _) = cache.get_or_create_shape_handle(items_shape()).await.unwrap();
        handle = h.clone();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(cache.await_snapshot_start(&h).await, AwaitSnapshotResult::Started));

        let tx = Transaction {
            xid: 1,
            lsn: 13,
            last_log_offset: LogOffset::new(13, 2),
            changes: vec![],
            affected_relations: [TableRef::new("public", "items")].into_iter().collect(),
        };
        cache.handle_transaction(tx);
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.update_shape_latest_offset(&h, LogOffset::new(13, 2)).await.unwrap();
    }

    let preparer = Arc::new(CountingTablePreparer::new());
    let producer = Arc::new(ScriptedSnapshotProducer::succeeding(10, vec![]));
    let cache = ShapeCache::new(
        ShapeCacheConfig::default(),
        kv,
        Arc::new(MemoryStorageFactory),
        preparer,
        producer,
        Arc::new(NullInspector),
    )
    .await
    .unwrap();

    assert!(matches!(cache.await_snapshot_start(&handle).await, AwaitSnapshotResult::Started));
    assert!(cache.list_shapes().iter().any(|(h, _)| *h == handle));
    let (again, offset) = cache.get_or_create_shape_handle(items_shape()).await.unwrap();
    assert_eq!(again, handle);
    assert_eq!(offset, LogOffset::new(13, 2));
}
