//! The Shape Consumer: a long-lived per-shape worker owning that shape's
//! storage, ingesting filtered transactions from the log collector,
//! appending log items, updating the latest offset, answering
//! `await_snapshot_start`, and cleaning up on shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{stream::FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::AwaitSnapshotResult;
use crate::log_collector::Transaction;
use crate::offset::LogOffset;
use crate::shape::{Shape, ShapeHandle};
use crate::status::{SetOffsetOutcome, ShapeStatus};
use crate::storage::{LogItem, Storage};

#[derive(Debug)]
enum ConsumerCommand {
    SnapshotXminKnown(u64),
    SnapshotStarted,
    SnapshotExists,
    SnapshotFailed { error: String },
    Transaction(Box<Transaction>),
    AwaitSnapshotStart(oneshot::Sender<AwaitSnapshotResult>),
    Shutdown,
}

/// A lightweight, send-only view onto a Consumer's mailbox, restricted to
/// the messages a Snapshotter is allowed to send. Handed to the Snapshotter
/// at construction so it never holds a reference to the Consumer itself,
/// breaking the Snapshotter↔Consumer cycle.
#[derive(Clone)]
pub struct SnapshotSink {
    tx: mpsc::UnboundedSender<ConsumerCommand>,
}

impl SnapshotSink {
    pub fn snapshot_xmin_known(&self, xmin: u64) {
        let _ = self.tx.send(ConsumerCommand::SnapshotXminKnown(xmin));
    }

    pub fn snapshot_started(&self) {
        let _ = self.tx.send(ConsumerCommand::SnapshotStarted);
    }

    pub fn snapshot_exists(&self) {
        let _ = self.tx.send(ConsumerCommand::SnapshotExists);
    }

    pub fn snapshot_failed(&self, error: String) {
        let _ = self.tx.send(ConsumerCommand::SnapshotFailed { error });
    }
}

/// Observability snapshot of a Consumer's lifetime activity. Ambient metrics
/// surface, not a new external interface: a monitoring binary polls this, the
/// Log Collector and Snapshotter never see it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsumerStats {
    pub changes_applied: u64,
    pub last_applied_offset: LogOffset,
}

/// Backing storage for `ConsumerStats`, shared between the actor and every
/// `ConsumerHandle` clone so reading stats never round-trips through the
/// actor's mailbox.
#[derive(Default)]
struct StatsCell {
    changes_applied: AtomicU64,
    last_applied_offset: RwLock<LogOffset>,
}

impl StatsCell {
    fn record(&self, applied: u64, offset: LogOffset) {
        if applied > 0 {
            self.changes_applied.fetch_add(applied, Ordering::Relaxed);
        }
        *self.last_applied_offset.write() = offset;
    }

    fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            changes_applied: self.changes_applied.load(Ordering::Relaxed),
            last_applied_offset: *self.last_applied_offset.read(),
        }
    }
}

/// Handle to a running Consumer task.
#[derive(Clone)]
pub struct ConsumerHandle {
    tx: mpsc::UnboundedSender<ConsumerCommand>,
    stats: Arc<StatsCell>,
}

impl ConsumerHandle {
    pub fn snapshot_sink(&self) -> SnapshotSink {
        SnapshotSink { tx: self.tx.clone() }
    }

    pub fn submit_transaction(&self, tx: Transaction) {
        let _ = self.tx.send(ConsumerCommand::Transaction(Box::new(tx)));
    }

    /// Read-only snapshot of this Consumer's applied-change counter and last
    /// applied offset, for observability.
    pub fn stats(&self) -> ConsumerStats {
        self.stats.snapshot()
    }

    /// Resolves once the snapshot has started, failed, or the Consumer shut
    /// down while this call was pending. `timeout` bounds how long the
    /// caller is willing to wait for a transition that never comes (e.g. the
    /// Consumer vanished without replying).
    pub async fn await_snapshot_start(&self, timeout: Duration) -> AwaitSnapshotResult {
        let (respond_to, rx) = oneshot::channel();
        if self.tx.send(ConsumerCommand::AwaitSnapshotStart(respond_to)).is_err() {
            return AwaitSnapshotResult::Unknown;
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // sender dropped (Consumer exited) or the timeout elapsed: either
            // way we can no longer observe this handle's snapshot state.
            Ok(Err(_)) | Err(_) => AwaitSnapshotResult::Unknown,
        }
    }

    /// Stop the Consumer: it wipes its storage, deregisters itself from the
    /// index, and exits normally.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ConsumerCommand::Shutdown);
    }
}

/// Spawn a Consumer task for `handle`/`shape`, returning a handle to it and
/// the send-only sink to pass to its Snapshotter.
pub fn spawn(handle: ShapeHandle, shape: Shape, storage: Arc<dyn Storage>, status: Arc<ShapeStatus>) -> ConsumerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let stats = Arc::new(StatsCell::default());
    let actor = ConsumerActor {
        handle,
        shape,
        storage,
        status,
        listeners: Vec::new(),
        stats: stats.clone(),
    };
    tokio::spawn(actor.run(rx));
    ConsumerHandle { tx, stats }
}

struct ConsumerActor {
    handle: ShapeHandle,
    shape: Shape,
    storage: Arc<dyn Storage>,
    status: Arc<ShapeStatus>,
    listeners: Vec<oneshot::Sender<AwaitSnapshotResult>>,
    stats: Arc<StatsCell>,
}

impl ConsumerActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ConsumerCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                ConsumerCommand::SnapshotXminKnown(xmin) => self.on_xmin_known(xmin).await,
                ConsumerCommand::SnapshotStarted => self.on_snapshot_started().await,
                ConsumerCommand::SnapshotExists => self.on_snapshot_started().await,
                ConsumerCommand::SnapshotFailed { error } => {
                    self.on_snapshot_failed(error).await;
                    // The Supervisor will not restart us; our Snapshotter has
                    // already exited by the time it sent this message.
                    break;
                }
                ConsumerCommand::Transaction(tx) => self.on_transaction(*tx).await,
                ConsumerCommand::AwaitSnapshotStart(respond_to) => self.on_await_snapshot_start(respond_to),
                ConsumerCommand::Shutdown => {
                    self.on_shutdown().await;
                    break;
                }
            }
        }
        debug!(handle = %self.handle, "consumer task exiting");
    }

    async fn on_xmin_known(&mut self, xmin: u64) {
        if let Err(e) = self.status.set_snapshot_xmin(&self.handle, xmin).await {
            error!(handle = %self.handle, error = %e, "failed to persist snapshot xmin");
        }
    }

    async fn on_snapshot_started(&mut self) {
        if let Err(e) = self.status.mark_snapshot_started(&self.handle).await {
            error!(handle = %self.handle, error = %e, "failed to persist snapshot_started");
            return;
        }
        info!(handle = %self.handle, "snapshot started");
        for listener in self.listeners.drain(..) {
            let _ = listener.send(AwaitSnapshotResult::Started);
        }
    }

    async fn on_snapshot_failed(&mut self, error: String) {
        if let Err(e) = self.status.mark_snapshot_failed(&self.handle, error.clone()).await {
            error!(handle = %self.handle, error = %e, "failed to persist snapshot_failed");
        }
        error!(handle = %self.handle, cause = %error, "Snapshot creation failed for {}", self.handle);
        for listener in self.listeners.drain(..) {
            let _ = listener.send(AwaitSnapshotResult::Failed(error.clone()));
        }
    }

    fn on_await_snapshot_start(&mut self, respond_to: oneshot::Sender<AwaitSnapshotResult>) {
        match self.status.snapshot_state(&self.handle) {
            Some(crate::status::SnapshotState::Started) => {
                let _ = respond_to.send(AwaitSnapshotResult::Started);
            }
            Some(crate::status::SnapshotState::Failed(e)) => {
                let _ = respond_to.send(AwaitSnapshotResult::Failed(e));
            }
            _ => self.listeners.push(respond_to),
        }
    }

    async fn on_transaction(&mut self, tx: Transaction) {
        let mut items = Vec::new();
        for change in &tx.changes {
            if change.relation != self.shape.root_table {
                continue;
            }
            items.push(LogItem {
                offset: change.log_offset,
                kind: change.kind,
                record: change.record.clone(),
                key: change.key.clone(),
            });
        }

        if !items.is_empty() {
            if let Err(e) = self.storage.append_to_log(items).await {
                warn!(handle = %self.handle, error = %e, "failed to append log items, will not advance offset");
                return;
            }
        }

        match self.status.set_latest_offset(&self.handle, tx.last_log_offset).await {
            Ok(SetOffsetOutcome::Ok) => {
                self.stats.record(items.len() as u64, tx.last_log_offset);
            }
            Ok(SetOffsetOutcome::UnknownHandle) => {
                warn!(
                    "Tried to update latest offset for shape {} which doesn't exist",
                    self.handle
                );
            }
            Ok(SetOffsetOutcome::NonMonotonic { latest }) => {
                error!(
                    handle = %self.handle,
                    latest = %latest,
                    update = %tx.last_log_offset,
                    "refusing non-monotonic offset update"
                );
            }
            Err(e) => error!(handle = %self.handle, error = %e, "failed to persist latest offset"),
        }
    }

    async fn on_shutdown(&mut self) {
        if let Err(e) = self.storage.cleanup().await {
            error!(handle = %self.handle, error = %e, "failed to clean up shape storage");
        }
        if let Err(e) = self.status.remove(&self.handle).await {
            error!(handle = %self.handle, error = %e, "failed to remove shape from persistent state");
        }
        let drained: FuturesUnordered<_> = self
            .listeners
            .drain(..)
            .map(|listener| async move {
                let _ = listener.send(AwaitSnapshotResult::Unknown);
            })
            .collect();
        drained.collect::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::MemoryKv;
    use crate::log_collector::Change;
    use crate::shape::{Column, TableRef};
    use crate::storage::{memory::MemoryStorage, ChangeKind};
    use std::collections::HashSet;

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

    async fn setup() -> (ConsumerHandle, Arc<ShapeStatus>, Arc<MemoryStorage>) {
        let status = Arc::new(ShapeStatus::new(Arc::new(MemoryKv::new())));
        let handle = ShapeHandle::from_raw("h1");
        status.add_shape(handle.clone(), sample_shape()).await.unwrap();
        let storage = Arc::new(MemoryStorage::new());
        let consumer = spawn(handle, sample_shape(), storage.clone(), status.clone());
        (consumer, status, storage)
    }

    #[tokio::test]
    async fn await_before_started_resolves_on_transition() {
        let (consumer, _status, _storage) = setup().await;
        let waiter = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.await_snapshot_start(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        consumer.snapshot_sink().snapshot_started();
        let result = waiter.await.unwrap();
        assert!(matches!(result, AwaitSnapshotResult::Started));
    }

    #[tokio::test]
    async fn await_after_started_resolves_immediately() {
        let (consumer, status, _storage) = setup().await;
        status.mark_snapshot_started(&ShapeHandle::from_raw("h1")).await.unwrap();
        let result = consumer.await_snapshot_start(Duration::from_secs(1)).await;
        assert!(matches!(result, AwaitSnapshotResult::Started));
    }

    #[tokio::test]
    async fn snapshot_failure_notifies_listeners() {
        let (consumer, _status, _storage) = setup().await;
        let waiter = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.await_snapshot_start(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        consumer.snapshot_sink().snapshot_failed("expected error".into());
        let result = waiter.await.unwrap();
        assert!(matches!(result, AwaitSnapshotResult::Failed(e) if e == "expected error"));
    }

    #[tokio::test]
    async fn transaction_appends_matching_changes_and_advances_offset() {
        let (consumer, status, storage) = setup().await;
        let handle = ShapeHandle::from_raw("h1");

        let tx = Transaction {
            xid: 1,
            lsn: 1000,
            last_log_offset: LogOffset::new(1000, 0),
            changes: vec![
                Change {
                    relation: TableRef::new("public", "items"),
                    kind: ChangeKind::Insert,
                    record: serde_json::json!({"id": 1}),
                    key: serde_json::json!({"id": 1}),
                    log_offset: LogOffset::new(1000, 0),
                },
                Change {
                    relation: TableRef::new("public", "unrelated"),
                    kind: ChangeKind::Insert,
                    record: serde_json::json!({"id": 2}),
                    key: serde_json::json!({"id": 2}),
                    log_offset: LogOffset::new(1000, 1),
                },
            ],
            affected_relations: HashSet::new(),
        };
        consumer.submit_transaction(tx);
        // give the actor a chance to process
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(
            status.get_existing_shape(&handle).unwrap().latest_offset,
            LogOffset::new(1000, 0)
        );

        let mut log = storage.get_log_stream(LogOffset::ZERO).await.unwrap();
        let first = log.next().await.unwrap().unwrap();
        assert_eq!(first.offset, LogOffset::new(1000, 0));
        assert!(log.next().await.is_none(), "the unrelated-table change must not be appended");
    }
}
