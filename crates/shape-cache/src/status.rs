//! The in-memory index mirrored durably in the Persistent KV: fingerprint →
//! handle, handle → shape record, relation-id → relation. Pure data; no
//! scheduling lives here. All mutating operations write through to the KV
//! before returning; readers only ever hit the in-memory index.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::kv::{offset_key, relation_key, shape_key, xmin_key, KvResult, PersistentKv};
use crate::offset::LogOffset;
use crate::relation::Relation;
use crate::shape::{Fingerprint, Shape, ShapeHandle};

/// Forward-only snapshot lifecycle for a handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SnapshotState {
    Pending,
    Started,
    Failed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShapeRecord {
    pub handle: ShapeHandle,
    pub shape: Shape,
    pub xmin: Option<u64>,
    pub latest_offset: LogOffset,
    pub snapshot_state: SnapshotState,
}

impl ShapeRecord {
    fn new(handle: ShapeHandle, shape: Shape) -> Self {
        Self {
            handle,
            shape,
            xmin: None,
            latest_offset: LogOffset::ZERO,
            snapshot_state: SnapshotState::Pending,
        }
    }
}

/// What [`ShapeStatus::initialise`] hydrates from the KV on boot.
#[derive(Debug, Default)]
pub struct PersistentState {
    pub records: Vec<ShapeRecord>,
    pub relations: Vec<Relation>,
}

#[derive(Default)]
struct Index {
    by_fingerprint: HashMap<Fingerprint, ShapeHandle>,
    by_handle: HashMap<ShapeHandle, ShapeRecord>,
    relations: HashMap<u32, Relation>,
}

pub struct ShapeStatus {
    index: RwLock<Index>,
    kv: Arc<dyn PersistentKv>,
}

impl ShapeStatus {
    pub fn new(kv: Arc<dyn PersistentKv>) -> Self {
        Self {
            index: RwLock::new(Index::default()),
            kv,
        }
    }

    /// Hydrate the in-memory index from the KV. Called once at boot, before
    /// any Consumer is started.
    pub async fn initialise(&self) -> KvResult<PersistentState> {
        let mut records = Vec::new();
        for (_, bytes) in self.kv.scan("shape/").await? {
            let record: ShapeRecord = match serde_json::from_slice(&bytes) {
                Ok(record) => record,
                Err(e) => {
                    warn!("skipping corrupt shape record during recovery: {e}");
                    continue;
                }
            };
            records.push(record);
        }

        let mut relations = Vec::new();
        for (_, bytes) in self.kv.scan("relation/").await? {
            match serde_json::from_slice::<Relation>(&bytes) {
                Ok(relation) => relations.push(relation),
                Err(e) => warn!("skipping corrupt relation record during recovery: {e}"),
            }
        }

        let mut index = self.index.write();
        for record in &records {
            index
                .by_fingerprint
                .insert(record.shape.fingerprint(), record.handle.clone());
            index.by_handle.insert(record.handle.clone(), record.clone());
        }
        for relation in &relations {
            index.relations.insert(relation.id, relation.clone());
        }

        Ok(PersistentState { records, relations })
    }

    /// Fast, lock-free-ish (single `RwLock::read`) lookup used by the
    /// coordinator's fast path.
    pub fn get_by_fingerprint(&self, fingerprint: &Fingerprint) -> Option<ShapeRecord> {
        let index = self.index.read();
        let handle = index.by_fingerprint.get(fingerprint)?;
        index.by_handle.get(handle).cloned()
    }

    pub fn get_existing_shape(&self, handle: &ShapeHandle) -> Option<ShapeRecord> {
        self.index.read().by_handle.get(handle).cloned()
    }

    pub fn has_shape(&self, handle: &ShapeHandle) -> bool {
        self.index.read().by_handle.contains_key(handle)
    }

    /// Register a brand-new shape under `handle`, write it through to the KV,
    /// and insert it into the index with `snapshot_state = Pending`.
    pub async fn add_shape(&self, handle: ShapeHandle, shape: Shape) -> KvResult<ShapeRecord> {
        let record = ShapeRecord::new(handle.clone(), shape);
        self.kv
            .put(&shape_key(&handle), serde_json::to_vec(&record).expect("ShapeRecord serializes"))
            .await?;
        let mut index = self.index.write();
        index.by_fingerprint.insert(record.shape.fingerprint(), handle.clone());
        index.by_handle.insert(handle, record.clone());
        Ok(record)
    }

    async fn persist(&self, record: &ShapeRecord) -> KvResult<()> {
        self.kv
            .put(
                &shape_key(&record.handle),
                serde_json::to_vec(record).expect("ShapeRecord serializes"),
            )
            .await
    }

    /// Set the latest offset for `handle`. Returns `false` if the handle is
    /// unknown. Enforces monotonicity: a non-monotonic update is refused and
    /// also reported as `false` to the caller, who turns that into a typed
    /// error. The KV write happens before the index is touched, so a failed
    /// write leaves the in-memory record exactly as it was.
    pub async fn set_latest_offset(&self, handle: &ShapeHandle, offset: LogOffset) -> KvResult<SetOffsetOutcome> {
        let mut record = {
            let index = self.index.read();
            let Some(record) = index.by_handle.get(handle) else {
                return Ok(SetOffsetOutcome::UnknownHandle);
            };
            if offset < record.latest_offset {
                return Ok(SetOffsetOutcome::NonMonotonic {
                    latest: record.latest_offset,
                });
            }
            record.clone()
        };
        record.latest_offset = offset;
        self.kv
            .put(&offset_key(handle), serde_json::to_vec(&offset).expect("LogOffset serializes"))
            .await?;
        self.persist(&record).await?;
        self.index.write().by_handle.insert(handle.clone(), record);
        Ok(SetOffsetOutcome::Ok)
    }

    /// Writes the xmin to the KV before the index is updated, same ordering
    /// as [`Self::set_latest_offset`].
    pub async fn set_snapshot_xmin(&self, handle: &ShapeHandle, xmin: u64) -> KvResult<()> {
        let mut record = {
            let index = self.index.read();
            let Some(record) = index.by_handle.get(handle) else {
                return Ok(());
            };
            record.clone()
        };
        record.xmin = Some(xmin);
        self.kv.put(&xmin_key(handle), xmin.to_be_bytes().to_vec()).await?;
        self.persist(&record).await?;
        self.index.write().by_handle.insert(handle.clone(), record);
        Ok(())
    }

    pub fn snapshot_xmin(&self, handle: &ShapeHandle) -> Option<u64> {
        self.index.read().by_handle.get(handle)?.xmin
    }

    pub async fn mark_snapshot_started(&self, handle: &ShapeHandle) -> KvResult<()> {
        let mut record = {
            let index = self.index.read();
            let Some(record) = index.by_handle.get(handle) else {
                return Ok(());
            };
            record.clone()
        };
        record.snapshot_state = SnapshotState::Started;
        self.persist(&record).await?;
        self.index.write().by_handle.insert(handle.clone(), record);
        Ok(())
    }

    pub async fn mark_snapshot_failed(&self, handle: &ShapeHandle, cause: String) -> KvResult<()> {
        let mut record = {
            let index = self.index.read();
            let Some(record) = index.by_handle.get(handle) else {
                return Ok(());
            };
            record.clone()
        };
        record.snapshot_state = SnapshotState::Failed(cause);
        self.persist(&record).await?;
        self.index.write().by_handle.insert(handle.clone(), record);
        Ok(())
    }

    pub fn snapshot_started(&self, handle: &ShapeHandle) -> bool {
        matches!(
            self.index.read().by_handle.get(handle).map(|r| &r.snapshot_state),
            Some(SnapshotState::Started)
        )
    }

    pub fn snapshot_state(&self, handle: &ShapeHandle) -> Option<SnapshotState> {
        self.index.read().by_handle.get(handle).map(|r| r.snapshot_state.clone())
    }

    /// Remove `handle` from the index and the KV. Idempotent: removing an
    /// unknown handle is a no-op.
    pub async fn remove(&self, handle: &ShapeHandle) -> KvResult<()> {
        let removed = {
            let mut index = self.index.write();
            let Some(record) = index.by_handle.remove(handle) else {
                return Ok(());
            };
            index.by_fingerprint.remove(&record.shape.fingerprint());
            record
        };
        let _ = removed;
        self.kv.delete(&shape_key(handle)).await?;
        self.kv.delete(&xmin_key(handle)).await?;
        self.kv.delete(&offset_key(handle)).await
    }

    pub fn list_shapes(&self) -> Vec<(ShapeHandle, Shape)> {
        self.index
            .read()
            .by_handle
            .values()
            .map(|r| (r.handle.clone(), r.shape.clone()))
            .collect()
    }

    pub fn get_relation(&self, id: u32) -> Option<Relation> {
        self.index.read().relations.get(&id).cloned()
    }

    pub async fn store_relation(&self, relation: Relation) -> KvResult<()> {
        self.kv
            .put(
                &relation_key(relation.id),
                serde_json::to_vec(&relation).expect("Relation serializes"),
            )
            .await?;
        self.index.write().relations.insert(relation.id, relation);
        Ok(())
    }
}

pub enum SetOffsetOutcome {
    Ok,
    UnknownHandle,
    NonMonotonic { latest: LogOffset },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::MemoryKv;
    use crate::shape::{Column, TableRef};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Wraps a [`MemoryKv`], failing every `put` once armed. Lets tests
    /// exercise the "KV write fails, index must not move" path.
    #[derive(Default)]
    struct FlakyKv {
        inner: MemoryKv,
        fail_puts: AtomicBool,
    }

    impl FlakyKv {
        fn arm(&self) {
            self.fail_puts.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl PersistentKv for FlakyKv {
        async fn put(&self, key: &str, bytes: Vec<u8>) -> KvResult<()> {
            if self.fail_puts.load(Ordering::SeqCst) {
                return Err(crate::kv::KvError::WriteFailed("simulated failure".into()));
            }
            self.inner.put(key, bytes).await
        }

        async fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>> {
            self.inner.get(key).await
        }

        async fn delete(&self, key: &str) -> KvResult<()> {
            self.inner.delete(key).await
        }

        async fn scan(&self, prefix: &str) -> KvResult<Vec<(String, Vec<u8>)>> {
            self.inner.scan(prefix).await
        }
    }

    fn sample_shape() -> Shape {
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

    #[tokio::test]
    async fn add_then_lookup_by_fingerprint() {
        let status = ShapeStatus::new(Arc::new(MemoryKv::new()));
        let handle = ShapeHandle::from_raw("h1");
        status.add_shape(handle.clone(), sample_shape()).await.unwrap();

        let found = status.get_by_fingerprint(&sample_shape().fingerprint()).unwrap();
        assert_eq!(found.handle, handle);
        assert_eq!(found.snapshot_state, SnapshotState::Pending);
    }

    #[tokio::test]
    async fn offset_updates_are_monotonic() {
        let status = ShapeStatus::new(Arc::new(MemoryKv::new()));
        let handle = ShapeHandle::from_raw("h1");
        status.add_shape(handle.clone(), sample_shape()).await.unwrap();

        assert!(matches!(
            status.set_latest_offset(&handle, LogOffset::new(10, 0)).await.unwrap(),
            SetOffsetOutcome::Ok
        ));
        assert!(matches!(
            status.set_latest_offset(&handle, LogOffset::new(5, 0)).await.unwrap(),
            SetOffsetOutcome::NonMonotonic { .. }
        ));
    }

    #[tokio::test]
    async fn failed_kv_write_leaves_index_untouched() {
        let kv = Arc::new(FlakyKv::default());
        let status = ShapeStatus::new(kv.clone());
        let handle = ShapeHandle::from_raw("h1");
        status.add_shape(handle.clone(), sample_shape()).await.unwrap();
        status.set_latest_offset(&handle, LogOffset::new(10, 0)).await.unwrap();

        kv.arm();
        let err = status.set_latest_offset(&handle, LogOffset::new(20, 0)).await.unwrap_err();
        assert!(matches!(err, crate::kv::KvError::WriteFailed(_)));
        assert_eq!(
            status.get_existing_shape(&handle).unwrap().latest_offset,
            LogOffset::new(10, 0)
        );

        let err = status.set_snapshot_xmin(&handle, 99).await.unwrap_err();
        assert!(matches!(err, crate::kv::KvError::WriteFailed(_)));
        assert_eq!(status.snapshot_xmin(&handle), None);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let status = ShapeStatus::new(Arc::new(MemoryKv::new()));
        let handle = ShapeHandle::from_raw("unknown");
        status.remove(&handle).await.unwrap();
        status.remove(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn recovery_round_trips_through_kv() {
        let kv = Arc::new(MemoryKv::new());
        let handle = ShapeHandle::from_raw("h1");
        {
            let status = ShapeStatus::new(kv.clone());
            status.add_shape(handle.clone(), sample_shape()).await.unwrap();
            status.set_latest_offset(&handle, LogOffset::new(13, 2)).await.unwrap();
            status.set_snapshot_xmin(&handle, 10).await.unwrap();
            status.mark_snapshot_started(&handle).await.unwrap();
        }

        let status = ShapeStatus::new(kv);
        let state = status.initialise().await.unwrap();
        assert_eq!(state.records.len(), 1);
        assert_eq!(status.snapshot_xmin(&handle), Some(10));
        assert!(status.snapshot_started(&handle));
        assert_eq!(
            status.get_existing_shape(&handle).unwrap().latest_offset,
            LogOffset::new(13, 2)
        );
    }
}
