//! The event-store contract every back-end honors.
//!
//! The core depends only on this interface: atomic optimistic-concurrency
//! appends, a per-aggregate read cursor, and a resumable cursor over the
//! store-wide stream. Concrete engines (SQL, embedded key-value files, a
//! remote service) live outside the core; [`InMemoryStore`](crate::InMemoryStore)
//! is the reference implementation and every back-end must pass the
//! [`testsuite`](crate::testsuite) battery.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::event::{StoredEvent, Version};

/// Failures produced by an event store or snapshot store back-end.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The first event's version does not follow the stored stream head.
    ///
    /// Exactly one of two racing saves for the same (type, id) observes
    /// this; no partial write happens.
    #[error("concurrency error")]
    Concurrency,

    /// No snapshot stored for the requested (type, id).
    #[error("snapshot not found")]
    SnapshotNotFound,

    /// The operation was interrupted by its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// Any other back-end failure, wrapping the underlying cause.
    #[error("{0}")]
    Backend(Arc<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    /// Wrap a back-end cause.
    pub fn backend(cause: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        StoreError::Backend(Arc::from(cause.into()))
    }
}

/// Pull cursor over stored events.
///
/// Exhaustion is not an error; an aggregate with no events yields nothing.
/// The cursor owns whatever back-end resource backs it (a row set, a
/// transaction, a file handle) and releases it on drop, on every exit
/// path.
pub type StoredEvents = Box<dyn Iterator<Item = Result<StoredEvent, StoreError>> + Send>;

/// Stateful, resumable cursor factory over the store-wide stream.
///
/// Each invocation yields a fresh iterator that continues from the last
/// successfully yielded global version + 1, so repeated calls never
/// repeat events. Projections hold one fetcher as their read position.
pub type Fetcher = Box<dyn FnMut() -> Result<StoredEvents, StoreError> + Send>;

/// Contract for event-store back-ends.
pub trait EventStore: Send + Sync {
    /// Atomically append a contiguous slice of events belonging to one
    /// (aggregate type, id).
    ///
    /// Preconditions: `events[0].version` equals the stored stream head
    /// version + 1, and versions inside the slice are consecutive. On
    /// success every event's `global_version` is assigned in strictly
    /// increasing store-wide order and written back into the slice; the
    /// assignment happens in the same critical section as the append, so
    /// a successful save is immediately visible on both the per-stream
    /// and the [`all`](EventStore::all) read paths.
    ///
    /// An empty slice is a no-op success.
    ///
    /// # Errors
    ///
    /// [`StoreError::Concurrency`] on a version conflict, with no partial
    /// write; any other failure wrapped via [`StoreError::backend`].
    fn save(&self, events: &mut [StoredEvent]) -> Result<(), StoreError>;

    /// Events for one (type, id) with version > `after_version`, in
    /// ascending version order.
    ///
    /// An unknown aggregate yields an exhausted cursor, not an error.
    /// Back-ends should observe `ctx` and stop yielding after
    /// cancellation, surfacing [`StoreError::Cancelled`] once.
    fn get(
        &self,
        ctx: &CancellationToken,
        id: &str,
        aggregate_type: &str,
        after_version: Version,
    ) -> Result<StoredEvents, StoreError>;

    /// Resumable cursor over all events with global version ≥ `start`,
    /// in ascending global order.
    fn all(&self, start: Version) -> Fetcher;

    /// Release back-end resources. Defaults to a no-op.
    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_preserves_the_cause_message() {
        let err = StoreError::backend(std::io::Error::other("bucket vanished"));
        assert_eq!(err.to_string(), "bucket vanished");
    }

    #[test]
    fn concurrency_is_matched_by_identity() {
        let err = StoreError::Concurrency;
        assert!(matches!(err, StoreError::Concurrency));
        assert_eq!(err.to_string(), "concurrency error");
    }
}
