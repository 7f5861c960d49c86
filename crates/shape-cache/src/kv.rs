//! Durable key/value surface mirroring shape definitions, xmin, latest
//! offsets and known relations. Treated as a single-writer log: only
//! [`crate::status::ShapeStatus`] writes, serialized per-handle.

use async_trait::async_trait;

use crate::shape::ShapeHandle;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("persistent kv write failed: {0}")]
    WriteFailed(String),
    #[error("persistent kv read failed: {0}")]
    ReadFailed(String),
}

pub type KvResult<T> = std::result::Result<T, KvError>;

/// Opaque-bytes durable key/value store. No on-disk format is mandated by
/// this crate beyond "whatever the implementation serializes".
#[async_trait]
pub trait PersistentKv: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> KvResult<()>;
    async fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>>;
    async fn delete(&self, key: &str) -> KvResult<()>;
    async fn scan(&self, prefix: &str) -> KvResult<Vec<(String, Vec<u8>)>>;
}

pub fn shape_key(handle: &ShapeHandle) -> String {
    format!("shape/{handle}")
}

pub fn relation_key(id: u32) -> String {
    format!("relation/{id}")
}

pub fn xmin_key(handle: &ShapeHandle) -> String {
    format!("xmin/{handle}")
}

pub fn offset_key(handle: &ShapeHandle) -> String {
    format!("offset/{handle}")
}

/// In-memory [`PersistentKv`] used by tests. A real deployment would back
/// this with `sled`, the way a flat control-db key/value store usually does.
pub mod memory {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    #[derive(Default)]
    pub struct MemoryKv {
        map: Mutex<BTreeMap<String, Vec<u8>>>,
    }

    impl MemoryKv {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl PersistentKv for MemoryKv {
        async fn put(&self, key: &str, bytes: Vec<u8>) -> KvResult<()> {
            self.map.lock().insert(key.to_string(), bytes);
            Ok(())
        }

        async fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>> {
            Ok(self.map.lock().get(key).cloned())
        }

        async fn delete(&self, key: &str) -> KvResult<()> {
            self.map.lock().remove(key);
            Ok(())
        }

        async fn scan(&self, prefix: &str) -> KvResult<Vec<(String, Vec<u8>)>> {
            Ok(self
                .map
                .lock()
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect())
        }
    }

    /// A [`PersistentKv`] wrapper that fails every `put`, for exercising
    /// `KvWriteFailed` propagation in tests.
    pub struct FailingKv;

    #[async_trait]
    impl PersistentKv for FailingKv {
        async fn put(&self, _key: &str, _bytes: Vec<u8>) -> KvResult<()> {
            Err(KvError::WriteFailed("simulated failure".into()))
        }

        async fn get(&self, _key: &str) -> KvResult<Option<Vec<u8>>> {
            Ok(None)
        }

        async fn delete(&self, _key: &str) -> KvResult<()> {
            Ok(())
        }

        async fn scan(&self, _prefix: &str) -> KvResult<Vec<(String, Vec<u8>)>> {
            Ok(Vec::new())
        }
    }
}
