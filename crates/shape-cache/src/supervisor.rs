//! Starts and stops Consumer+Snapshotter pairs as a single unit, keyed by
//! handle. The coordinator ([`crate::cache::ShapeCache`]) is the only
//! caller; this registry exists so "stop this shape" is one call instead of
//! two call sites that can drift out of sync.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::consumer::{self, ConsumerHandle};
use crate::shape::{Shape, ShapeHandle};
use crate::snapshotter::{Snapshotter, SnapshotProducer, TablePreparer};
use crate::status::ShapeStatus;
use crate::storage::{Storage, StorageFactory};

struct Child {
    consumer: ConsumerHandle,
    snapshotter_task: JoinHandle<()>,
}

/// Registry of live Consumer+Snapshotter pairs. Not `Send`-shared directly:
/// owned by the coordinator task and mutated only from within it.
#[derive(Default)]
pub struct ConsumerSupervisor {
    children: HashMap<ShapeHandle, Child>,
}

impl ConsumerSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, handle: &ShapeHandle) -> Option<ConsumerHandle> {
        self.children.get(handle).map(|c| c.consumer.clone())
    }

    pub fn is_running(&self, handle: &ShapeHandle) -> bool {
        self.children.contains_key(handle)
    }

    /// Start a Consumer for `handle`, and if its snapshot hasn't started
    /// yet, a paired Snapshotter feeding it via a [`crate::consumer::SnapshotSink`].
    pub fn start(
        &mut self,
        handle: ShapeHandle,
        shape: Shape,
        needs_snapshot: bool,
        storage_factory: &dyn StorageFactory,
        status: Arc<ShapeStatus>,
        preparer: Arc<dyn TablePreparer>,
        producer: Arc<dyn SnapshotProducer>,
    ) -> ConsumerHandle {
        let storage: Arc<dyn Storage> = storage_factory.create(&handle);
        let consumer = consumer::spawn(handle.clone(), shape.clone(), storage.clone(), status);

        let snapshotter_task = if needs_snapshot {
            let sink = consumer.snapshot_sink();
            let snapshotter = Snapshotter::new(shape, storage, sink, preparer, producer);
            tokio::spawn(snapshotter.run())
        } else {
            tokio::spawn(async {})
        };

        self.children.insert(
            handle,
            Child {
                consumer: consumer.clone(),
                snapshotter_task,
            },
        );
        consumer
    }

    /// Stop the pair for `handle`. The Consumer runs its own cleanup
    /// (storage + index removal) in response to `Shutdown`; this just tears
    /// down the task bookkeeping. A no-op if `handle` isn't running.
    pub fn stop(&mut self, handle: &ShapeHandle) {
        if let Some(child) = self.children.remove(handle) {
            child.consumer.shutdown();
            child.snapshotter_task.abort();
        }
    }

    pub fn stop_all(&mut self) {
        let handles: Vec<_> = self.children.keys().cloned().collect();
        for handle in handles {
            self.stop(&handle);
        }
    }
}
