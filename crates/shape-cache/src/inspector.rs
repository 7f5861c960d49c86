//! Interface to the external Postgres column/PK inspector. The inspector
//! itself is out of scope for this crate; the Shape Cache
//! only needs to be able to invalidate its cached column info on schema
//! drift.

use async_trait::async_trait;

use crate::shape::TableRef;

#[async_trait]
pub trait Inspector: Send + Sync {
    /// Invalidate any cached column info for `table`. Called with the *old*
    /// table identity on a rename, since a rename changes the table's name
    /// in the new relation message.
    async fn clean_column_info(&self, table: &TableRef);
}

/// No-op inspector for tests and configurations with no column-info cache.
pub struct NullInspector;

#[async_trait]
impl Inspector for NullInspector {
    async fn clean_column_info(&self, _table: &TableRef) {}
}

/// Records every call, for asserting "called once with the old name" in
/// tests.
pub mod recording {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct RecordingInspector {
        calls: Mutex<Vec<TableRef>>,
    }

    impl RecordingInspector {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn calls(&self) -> Vec<TableRef> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl Inspector for RecordingInspector {
        async fn clean_column_info(&self, table: &TableRef) {
            self.calls.lock().push(table.clone());
        }
    }
}
