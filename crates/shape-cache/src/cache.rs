//! The Shape Cache: the coordinator singleton. Handle assignment,
//! single-flight snapshot creation, boot recovery, and the relation-change
//! reaction all live here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::config::ShapeCacheConfig;
use crate::consumer::ConsumerHandle;
use crate::error::{AwaitSnapshotResult, Result, ShapeCacheError};
use crate::inspector::Inspector;
use crate::kv::PersistentKv;
use crate::log_collector::Transaction;
use crate::offset::LogOffset;
use crate::relation::{affected_by_change, Relation, RelationChange};
use crate::shape::{HandleGenerator, Shape, ShapeHandle};
use crate::snapshotter::{SnapshotProducer, TablePreparer};
use crate::status::{SetOffsetOutcome, ShapeStatus, SnapshotState};
use crate::storage::StorageFactory;
use crate::supervisor::ConsumerSupervisor;

/// Shared, lock-free-ish registry of live Consumer handles, mirrored by the
/// coordinator task on every start/stop so transaction fan-out never has to
/// go through the serialized coordinator queue.
type ConsumerRegistry = Arc<RwLock<HashMap<ShapeHandle, ConsumerHandle>>>;

enum CoordinatorMessage {
    GetOrCreate {
        shape: Shape,
        respond_to: oneshot::Sender<Result<(ShapeHandle, LogOffset)>>,
    },
    Truncate {
        handle: ShapeHandle,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Clean {
        handle: ShapeHandle,
        respond_to: oneshot::Sender<Result<()>>,
    },
    RelationMessage {
        relation: Relation,
        respond_to: oneshot::Sender<()>,
    },
    HasShape {
        handle: ShapeHandle,
        respond_to: oneshot::Sender<bool>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Public handle to the running coordinator. Cheap to clone; every clone
/// shares the same coordinator task and the same fast-path index.
#[derive(Clone)]
pub struct ShapeCache {
    status: Arc<ShapeStatus>,
    consumers: ConsumerRegistry,
    tx: mpsc::Sender<CoordinatorMessage>,
    config: ShapeCacheConfig,
}

impl ShapeCache {
    /// Boots a Shape Cache: hydrates `Shape Status` from `kv`, starts a
    /// Consumer + Snapshotter pair for every recovered handle, then spawns
    /// the coordinator task. Returns once recovery has fully quiesced, per
    /// boot recovery.
    pub async fn new(
        config: ShapeCacheConfig,
        kv: Arc<dyn PersistentKv>,
        storage_factory: Arc<dyn StorageFactory>,
        preparer: Arc<dyn TablePreparer>,
        producer: Arc<dyn SnapshotProducer>,
        inspector: Arc<dyn Inspector>,
    ) -> Result<Self> {
        let status = Arc::new(ShapeStatus::new(kv));
        let persistent = status
            .initialise()
            .await
            .map_err(|e| ShapeCacheError::KvWriteFailed(e.to_string()))?;

        let consumers: ConsumerRegistry = Arc::new(RwLock::new(HashMap::new()));

        let mut coordinator = Coordinator {
            status: status.clone(),
            consumers: consumers.clone(),
            supervisor: ConsumerSupervisor::new(),
            handle_generator: HandleGenerator::new(),
            storage_factory,
            preparer,
            producer,
            inspector,
        };

        for record in persistent.records {
            let needs_snapshot = !matches!(record.snapshot_state, SnapshotState::Started);
            coordinator.start_consumer(record.handle, record.shape, needs_snapshot);
            info!("recovered shape on boot");
        }

        let (tx, rx) = mpsc::channel(config.coordinator_queue_depth);
        tokio::spawn(coordinator.run(rx));

        Ok(Self {
            status,
            consumers,
            tx,
            config,
        })
    }

    /// Fast path: a lock-free index read. Falls through to
    /// the serialized coordinator only on a miss, or when the cached record
    /// is in a terminal `failed` state (unreachable per invariant 6 — a new
    /// handle must be minted).
    pub async fn get_or_create_shape_handle(&self, shape: Shape) -> Result<(ShapeHandle, LogOffset)> {
        if let Some(record) = self.status.get_by_fingerprint(&shape.fingerprint()) {
            if !matches!(record.snapshot_state, SnapshotState::Failed(_)) {
                return Ok((record.handle, record.latest_offset));
            }
        }
        self.call(|respond_to| CoordinatorMessage::GetOrCreate { shape, respond_to }).await
    }

    /// Three-way decision, using `self.config`'s
    /// default timeout.
    pub async fn await_snapshot_start(&self, handle: &ShapeHandle) -> AwaitSnapshotResult {
        self.await_snapshot_start_with_timeout(handle, self.config.await_snapshot_timeout).await
    }

    pub async fn await_snapshot_start_with_timeout(&self, handle: &ShapeHandle, timeout: Duration) -> AwaitSnapshotResult {
        match self.status.snapshot_state(handle) {
            Some(SnapshotState::Started) => AwaitSnapshotResult::Started,
            Some(SnapshotState::Failed(cause)) => AwaitSnapshotResult::Failed(cause),
            Some(SnapshotState::Pending) => match self.consumers.read().get(handle).cloned() {
                Some(consumer) => consumer.await_snapshot_start(timeout).await,
                None => AwaitSnapshotResult::Unknown,
            },
            None => AwaitSnapshotResult::Unknown,
        }
    }

    /// Non-blocking beyond the index update; enforces
    /// monotonicity (invariant 4).
    pub async fn update_shape_latest_offset(&self, handle: &ShapeHandle, offset: LogOffset) -> Result<()> {
        match self
            .status
            .set_latest_offset(handle, offset)
            .await
            .map_err(|e| ShapeCacheError::KvWriteFailed(e.to_string()))?
        {
            SetOffsetOutcome::Ok => Ok(()),
            SetOffsetOutcome::UnknownHandle => {
                warn!("Tried to update latest offset for shape {handle} which doesn't exist");
                Err(ShapeCacheError::UnknownHandle(handle.clone()))
            }
            SetOffsetOutcome::NonMonotonic { latest } => Err(ShapeCacheError::NonMonotonicOffset {
                handle: handle.clone(),
                latest,
                update: offset,
            }),
        }
    }

    pub fn list_shapes(&self) -> Vec<(ShapeHandle, Shape)> {
        self.status.list_shapes()
    }

    /// Index check with fallback to the coordinator, covering the race
    /// where a handle was just created but not yet visible to the caller's
    /// view of the index.
    pub async fn has_shape(&self, handle: &ShapeHandle) -> bool {
        if self.status.has_shape(handle) {
            return true;
        }
        let (respond_to, rx) = oneshot::channel();
        if self.tx.send(CoordinatorMessage::HasShape { handle: handle.clone(), respond_to }).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub fn get_relation(&self, relation_id: u32) -> Option<Relation> {
        self.status.get_relation(relation_id)
    }

    /// Stops the Consumer (which wipes storage), removes
    /// the handle from index and KV, logs a rotation message. A later
    /// `get_or_create_shape_handle` for an equivalent shape mints a new one.
    pub async fn handle_truncate(&self, handle: ShapeHandle) -> Result<()> {
        self.call(|respond_to| CoordinatorMessage::Truncate { handle, respond_to }).await
    }

    /// Same teardown as `handle_truncate`, but framed as a deletion rather
    /// than a rotation; idempotent.
    pub async fn clean_shape(&self, handle: ShapeHandle) -> Result<()> {
        self.call(|respond_to| CoordinatorMessage::Clean { handle, respond_to }).await
    }

    pub async fn clean_all_shapes(&self) -> Result<()> {
        for (handle, _) in self.list_shapes() {
            self.clean_shape(handle).await?;
        }
        Ok(())
    }

    /// Routes an inbound relation message from the Log Collector to the
    /// coordinator's relation-change reaction.
    /// reaction").
    pub async fn handle_relation_message(&self, relation: Relation) -> Result<()> {
        let (respond_to, rx) = oneshot::channel();
        self.tx
            .send(CoordinatorMessage::RelationMessage { relation, respond_to })
            .await
            .map_err(|_| ShapeCacheError::CoordinatorGone)?;
        rx.await.map_err(|_| ShapeCacheError::CoordinatorGone)
    }

    /// Fans an inbound transaction out to every Consumer whose shape reads
    /// from one of `tx.affected_relations`. Bypasses the coordinator queue
    /// entirely: transactions are high-frequency and each Consumer only
    /// ever mutates its own row.
    pub fn handle_transaction(&self, tx: Transaction) {
        let consumers = self.consumers.read();
        for (handle, shape) in self.status.list_shapes() {
            if tx.affected_relations.contains(&shape.root_table) {
                if let Some(consumer) = consumers.get(&handle) {
                    consumer.submit_transaction(tx.clone());
                }
            }
        }
    }

    /// Stops every running Consumer and drains the coordinator queue. Not
    /// part of the distilled spec's operation list, but the natural
    /// counterpart to boot recovery: every start has a matching stop.
    pub async fn shutdown(&self) {
        let (respond_to, rx) = oneshot::channel();
        if self.tx.send(CoordinatorMessage::Shutdown { respond_to }).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn call<T>(&self, make_message: impl FnOnce(oneshot::Sender<Result<T>>) -> CoordinatorMessage) -> Result<T> {
        let (respond_to, rx) = oneshot::channel();
        self.tx
            .send(make_message(respond_to))
            .await
            .map_err(|_| ShapeCacheError::CoordinatorGone)?;
        rx.await.map_err(|_| ShapeCacheError::CoordinatorGone)?
    }
}

/// The single-threaded, single-writer serialization point for every
/// mutating operation.
struct Coordinator {
    status: Arc<ShapeStatus>,
    consumers: ConsumerRegistry,
    supervisor: ConsumerSupervisor,
    handle_generator: HandleGenerator,
    storage_factory: Arc<dyn StorageFactory>,
    preparer: Arc<dyn TablePreparer>,
    producer: Arc<dyn SnapshotProducer>,
    inspector: Arc<dyn Inspector>,
}

impl Coordinator {
    async fn run(mut self, mut rx: mpsc::Receiver<CoordinatorMessage>) {
        while let Some(message) = rx.recv().await {
            match message {
                CoordinatorMessage::GetOrCreate { shape, respond_to } => {
                    let result = self.on_get_or_create(shape).await;
                    let _ = respond_to.send(result);
                }
                CoordinatorMessage::Truncate { handle, respond_to } => {
                    let result = self.on_truncate(&handle, "rotating").await;
                    let _ = respond_to.send(result);
                }
                CoordinatorMessage::Clean { handle, respond_to } => {
                    let result = self.on_truncate(&handle, "cleaning").await;
                    let _ = respond_to.send(result);
                }
                CoordinatorMessage::RelationMessage { relation, respond_to } => {
                    self.on_relation_message(relation).await;
                    let _ = respond_to.send(());
                }
                CoordinatorMessage::HasShape { handle, respond_to } => {
                    let _ = respond_to.send(self.status.has_shape(&handle));
                }
                CoordinatorMessage::Shutdown { respond_to } => {
                    self.supervisor.stop_all();
                    let _ = respond_to.send(());
                    break;
                }
            }
        }
    }

    fn start_consumer(&mut self, handle: ShapeHandle, shape: Shape, needs_snapshot: bool) {
        let consumer = self.supervisor.start(
            handle.clone(),
            shape,
            needs_snapshot,
            self.storage_factory.as_ref(),
            self.status.clone(),
            self.preparer.clone(),
            self.producer.clone(),
        );
        self.consumers.write().insert(handle, consumer);
    }

    /// Stops and fully erases `handle`: tears down the Consumer/Snapshotter
    /// pair, drops it from the fast-path registry, and removes its record
    /// from the index and KV. Idempotent — a no-op on an unknown handle.
    async fn stop_and_erase(&mut self, handle: &ShapeHandle) -> Result<()> {
        self.supervisor.stop(handle);
        self.consumers.write().remove(handle);
        self.status
            .remove(handle)
            .await
            .map_err(|e| ShapeCacheError::KvWriteFailed(e.to_string()))
    }

    async fn on_get_or_create(&mut self, shape: Shape) -> Result<(ShapeHandle, LogOffset)> {
        if let Some(record) = self.status.get_by_fingerprint(&shape.fingerprint()) {
            if matches!(record.snapshot_state, SnapshotState::Failed(_)) {
                self.stop_and_erase(&record.handle).await?;
            } else {
                return Ok((record.handle, record.latest_offset));
            }
        }

        let handle = self.handle_generator.next();
        self.status
            .add_shape(handle.clone(), shape.clone())
            .await
            .map_err(|e| ShapeCacheError::KvWriteFailed(e.to_string()))?;
        self.start_consumer(handle.clone(), shape, true);
        info!(%handle, "created shape handle");
        Ok((handle, LogOffset::ZERO))
    }

    async fn on_truncate(&mut self, handle: &ShapeHandle, verb: &str) -> Result<()> {
        if !self.status.has_shape(handle) {
            return Ok(());
        }
        self.stop_and_erase(handle).await?;
        info!(%handle, verb, "shape removed");
        Ok(())
    }

    async fn on_relation_message(&mut self, relation: Relation) {
        let old = self.status.get_relation(relation.id);
        match old {
            None => {
                if let Err(e) = self.status.store_relation(relation).await {
                    warn!("failed to persist relation: {e}");
                }
            }
            Some(old) if old == relation => {}
            Some(old) => {
                let change = RelationChange::new(&old, &relation);
                let affected: Vec<_> = self
                    .status
                    .list_shapes()
                    .into_iter()
                    .filter(|(_, shape)| affected_by_change(shape, &change))
                    .map(|(handle, _)| handle)
                    .collect();

                for handle in &affected {
                    if let Err(e) = self.stop_and_erase(handle).await {
                        warn!(%handle, "failed to erase shape affected by relation change: {e}");
                    }
                }

                let old_table = old.table_ref();
                info!("Schema for the table {old_table} changed");

                if let Err(e) = self.status.store_relation(relation).await {
                    warn!("failed to persist relation: {e}");
                }
                self.inspector.clean_column_info(&old_table).await;
            }
        }
    }
}
