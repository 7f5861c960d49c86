//! The per-shape storage backend: a snapshot byte stream plus an
//! append-only, offset-keyed log. The concrete backend (object store, local
//! disk, ...) is out of scope for this crate; [`Storage`] is the seam.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;

use crate::offset::LogOffset;

/// The kind of change a log entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A single row-level change appended to a shape's log.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LogItem {
    pub offset: LogOffset,
    pub kind: ChangeKind,
    pub record: serde_json::Value,
    pub key: serde_json::Value,
}

/// A chunk of snapshot data, as produced by the Snapshotter while streaming
/// the initial query result into storage.
pub type SnapshotChunk = serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("snapshot missing for shape")]
    SnapshotMissing,
    #[error("storage I/O error: {0}")]
    Io(String),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Per-shape storage: one snapshot blob plus one append-only log, addressed
/// by [`LogOffset`].
#[async_trait]
pub trait Storage: Send + Sync {
    /// Whether `make_new_snapshot` has already completed for this shape.
    async fn snapshot_started(&self) -> bool;

    /// Write the initial snapshot, consuming `stream`. Stream errors
    /// propagate to whoever is reading the snapshot concurrently.
    async fn make_new_snapshot(&self, stream: BoxStream<'static, StorageResult<SnapshotChunk>>) -> StorageResult<()>;

    /// Read back the snapshot as of its completion offset
    /// ([`LogOffset::ZERO`]) plus a stream of its rows. Errors if no
    /// snapshot has been written yet.
    async fn get_snapshot(&self) -> StorageResult<(LogOffset, BoxStream<'static, StorageResult<SnapshotChunk>>)>;

    /// Append items to the log. Items are expected in increasing offset
    /// order; the storage backend does not itself enforce this, callers
    /// (the Consumer) do.
    async fn append_to_log(&self, items: Vec<LogItem>) -> StorageResult<()>;

    /// Stream log entries with `offset > from_offset`, in offset order.
    async fn get_log_stream(&self, from_offset: LogOffset) -> StorageResult<BoxStream<'static, StorageResult<LogItem>>>;

    /// Delete the snapshot and the log. Idempotent.
    async fn cleanup(&self) -> StorageResult<()>;
}

/// Constructs a fresh [`Storage`] instance for a newly created shape handle.
/// A separate capability so construction-time collaborators (the storage
/// backend's connection pool, bucket name, etc.) can be bundled once and
/// handed to the Consumer Supervisor rather than threaded through every
/// call site.
pub trait StorageFactory: Send + Sync {
    fn create(&self, handle: &crate::shape::ShapeHandle) -> std::sync::Arc<dyn Storage>;
}

impl fmt::Debug for dyn Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn Storage")
    }
}

/// In-memory [`Storage`] used by tests and as a reference implementation.
pub mod memory {
    use super::*;
    use futures::StreamExt;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Inner {
        snapshot: Option<Vec<SnapshotChunk>>,
        log: Vec<LogItem>,
    }

    #[derive(Default)]
    pub struct MemoryStorage {
        inner: Mutex<Inner>,
    }

    impl MemoryStorage {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl Storage for MemoryStorage {
        async fn snapshot_started(&self) -> bool {
            self.inner.lock().snapshot.is_some()
        }

        async fn make_new_snapshot(
            &self,
            mut stream: BoxStream<'static, StorageResult<SnapshotChunk>>,
        ) -> StorageResult<()> {
            let mut rows = Vec::new();
            while let Some(chunk) = stream.next().await {
                rows.push(chunk?);
            }
            self.inner.lock().snapshot = Some(rows);
            Ok(())
        }

        async fn get_snapshot(&self) -> StorageResult<(LogOffset, BoxStream<'static, StorageResult<SnapshotChunk>>)> {
            let rows = self
                .inner
                .lock()
                .snapshot
                .clone()
                .ok_or(StorageError::SnapshotMissing)?;
            let stream = futures::stream::iter(rows.into_iter().map(Ok)).boxed();
            Ok((LogOffset::ZERO, stream))
        }

        async fn append_to_log(&self, items: Vec<LogItem>) -> StorageResult<()> {
            self.inner.lock().log.extend(items);
            Ok(())
        }

        async fn get_log_stream(
            &self,
            from_offset: LogOffset,
        ) -> StorageResult<BoxStream<'static, StorageResult<LogItem>>> {
            let items: Vec<_> = self
                .inner
                .lock()
                .log
                .iter()
                .filter(|item| item.offset > from_offset)
                .cloned()
                .collect();
            Ok(futures::stream::iter(items.into_iter().map(Ok)).boxed())
        }

        async fn cleanup(&self) -> StorageResult<()> {
            let mut inner = self.inner.lock();
            inner.snapshot = None;
            inner.log.clear();
            Ok(())
        }
    }

    pub struct MemoryStorageFactory;

    impl StorageFactory for MemoryStorageFactory {
        fn create(&self, _handle: &crate::shape::ShapeHandle) -> std::sync::Arc<dyn Storage> {
            std::sync::Arc::new(MemoryStorage::new())
        }
    }
}
