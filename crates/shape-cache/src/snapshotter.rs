//! The one-shot Snapshotter worker, started alongside a Consumer: prepares
//! tables, opens a repeatable-read snapshot, records `xmin`, streams the
//! initial rows into storage, and signals the Consumer.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::info;

use crate::consumer::SnapshotSink;
use crate::shape::{Shape, TableRef};
use crate::storage::{SnapshotChunk, Storage, StorageResult};

/// Schema preparation, run before the snapshot transaction opens. A no-op in
/// deployments with nothing to prepare; production implementations might
/// e.g. ensure a replica identity or an index exists.
#[async_trait]
pub trait TablePreparer: Send + Sync {
    async fn prepare_tables(&self, tables: &[TableRef]) -> anyhow::Result<()>;
}

pub struct NullTablePreparer;

#[async_trait]
impl TablePreparer for NullTablePreparer {
    async fn prepare_tables(&self, _tables: &[TableRef]) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Produces the initial snapshot for a shape: opens the
/// `REPEATABLE READ READ ONLY` transaction, captures `xmin`, applies the
/// fixed session settings, and streams the filtered rows.
///
/// Bundled as one call (rather than separate "begin"/"xmin"/"stream" steps)
/// because all of it happens inside one Postgres transaction; the
/// `xmin`-then-`started` message ordering the Consumer observes is
/// reconstructed by the caller from the returned pair, not by this trait's
/// call shape.
#[async_trait]
pub trait SnapshotProducer: Send + Sync {
    async fn produce(&self, shape: &Shape) -> anyhow::Result<(u64, BoxStream<'static, StorageResult<SnapshotChunk>>)>;
}

pub struct Snapshotter {
    shape: Shape,
    storage: Arc<dyn Storage>,
    sink: SnapshotSink,
    preparer: Arc<dyn TablePreparer>,
    producer: Arc<dyn SnapshotProducer>,
}

impl Snapshotter {
    pub fn new(
        shape: Shape,
        storage: Arc<dyn Storage>,
        sink: SnapshotSink,
        preparer: Arc<dyn TablePreparer>,
        producer: Arc<dyn SnapshotProducer>,
    ) -> Self {
        Self {
            shape,
            storage,
            sink,
            preparer,
            producer,
        }
    }

    /// Runs the one-shot snapshot protocol. Spawn this
    /// with `tokio::spawn(snapshotter.run())`.
    pub async fn run(self) {
        if self.storage.snapshot_started().await {
            info!(table = %self.shape.root_table, "snapshot already exists, skipping");
            self.sink.snapshot_exists();
            return;
        }

        if let Err(e) = self.try_snapshot().await {
            self.sink.snapshot_failed(format!("{e:#}"));
        }
    }

    async fn try_snapshot(&self) -> anyhow::Result<()> {
        self.preparer.prepare_tables(std::slice::from_ref(&self.shape.root_table)).await?;

        let (xmin, stream) = self.producer.produce(&self.shape).await?;
        self.sink.snapshot_xmin_known(xmin);
        self.sink.snapshot_started();

        self.storage.make_new_snapshot(stream).await?;
        Ok(())
    }
}

/// Test/reference doubles for [`TablePreparer`] and [`SnapshotProducer`].
pub mod fakes {
    use super::*;
    use futures::StreamExt;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct CountingTablePreparer {
        calls: AtomicUsize,
    }

    impl CountingTablePreparer {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TablePreparer for CountingTablePreparer {
        async fn prepare_tables(&self, _tables: &[TableRef]) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// A [`SnapshotProducer`] that either yields a fixed set of rows with a
    /// fixed `xmin`, or fails with a fixed message, and counts how many
    /// times it was invoked (for asserting single-flight creation behavior).
    pub struct ScriptedSnapshotProducer {
        xmin: u64,
        rows: Vec<SnapshotChunk>,
        fail_with: Option<String>,
        calls: AtomicUsize,
        last_shape: Mutex<Option<Shape>>,
    }

    impl ScriptedSnapshotProducer {
        pub fn succeeding(xmin: u64, rows: Vec<SnapshotChunk>) -> Self {
            Self {
                xmin,
                rows,
                fail_with: None,
                calls: AtomicUsize::new(0),
                last_shape: Mutex::new(None),
            }
        }

        pub fn failing(message: impl Into<String>) -> Self {
            Self {
                xmin: 0,
                rows: Vec::new(),
                fail_with: Some(message.into()),
                calls: AtomicUsize::new(0),
                last_shape: Mutex::new(None),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SnapshotProducer for ScriptedSnapshotProducer {
        async fn produce(&self, shape: &Shape) -> anyhow::Result<(u64, BoxStream<'static, StorageResult<SnapshotChunk>>)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_shape.lock() = Some(shape.clone());
            if let Some(message) = &self.fail_with {
                anyhow::bail!("{message}");
            }
            let rows = self.rows.clone();
            Ok((self.xmin, futures::stream::iter(rows.into_iter().map(Ok)).boxed()))
        }
    }
}
