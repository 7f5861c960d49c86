use thiserror::Error;

use crate::shape::ShapeHandle;

/// Errors surfaced by the public [`crate::cache::ShapeCache`] API and the
/// internal consumer/snapshotter plumbing.
#[derive(Error, Debug, Clone)]
pub enum ShapeCacheError {
    #[error("shape handle `{0}` does not exist")]
    UnknownHandle(ShapeHandle),

    #[error("snapshot creation failed for shape `{handle}`: {cause}")]
    SnapshotFailed { handle: ShapeHandle, cause: String },

    #[error("storage for shape `{0}` reports no snapshot though one was claimed to exist")]
    StorageMissing(ShapeHandle),

    #[error("failed to write shape state to persistent storage: {0}")]
    KvWriteFailed(String),

    #[error("offset update for shape `{handle}` is not monotonic: latest={latest:?} update={update:?}")]
    NonMonotonicOffset {
        handle: ShapeHandle,
        latest: crate::offset::LogOffset,
        update: crate::offset::LogOffset,
    },

    #[error("the coordinator has shut down")]
    CoordinatorGone,
}

pub type Result<T> = std::result::Result<T, ShapeCacheError>;

/// The outcome of [`crate::cache::ShapeCache::await_snapshot_start`].
///
/// Modeled as its own type (rather than folding into [`ShapeCacheError`])
/// because `Started` is the common case and callers switch on all three
/// variants, not just the error ones.
#[derive(Debug, Clone)]
pub enum AwaitSnapshotResult {
    Started,
    Unknown,
    Failed(String),
}
