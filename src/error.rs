//! Crate-level error kinds for aggregates, stores, and projections.

use std::sync::Arc;

use crate::encoder::CodecError;
use crate::store::StoreError;

/// Errors surfaced by aggregate persistence and the projection engine.
///
/// Every kind is matched by variant identity, never by message text.
/// Back-end failures are wrapped under [`Error::Store`] with the original
/// cause preserved for inspection; transient conflicts surface unaltered
/// as [`Error::Concurrency`] so callers can retry the command.
///
/// The enum is `Clone` (causes are held behind `Arc`) so projection race
/// results can carry the error that cancelled the run.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// No events (or snapshot) exist for the requested aggregate id.
    ///
    /// Distinct from any back-end failure: an empty stream is a valid
    /// answer from the store, and only the load orchestration turns it
    /// into "not found".
    #[error("aggregate not found")]
    AggregateNotFound,

    /// The aggregate type was never registered before saving.
    #[error("{aggregate_type}: aggregate not registered")]
    AggregateNotRegistered {
        /// Name of the unregistered aggregate type.
        aggregate_type: String,
    },

    /// An event's reason has no registered constructor.
    ///
    /// Returned when saving an aggregate whose event type was not listed
    /// in its `register` callback, and when decoding a stored event whose
    /// reason is unknown to the current process registry.
    #[error("event not registered, aggregate type: {aggregate_type}, reason: {reason}")]
    EventNotRegistered {
        /// Aggregate type the event belongs to.
        aggregate_type: String,
        /// Event-type name used as the wire discriminator.
        reason: String,
    },

    /// Optimistic concurrency conflict.
    ///
    /// The stored stream advanced past the version this save expected.
    /// Retryable: reload the aggregate and reissue the command.
    #[error("concurrency error")]
    Concurrency,

    /// `set_id` was called on an aggregate that already has an id.
    #[error("id is already set on the aggregate")]
    AggregateAlreadyExists,

    /// A snapshot was requested while the aggregate holds unsaved events.
    #[error("aggregate holds unsaved events")]
    UnsavedEvents,

    /// `run` was called on a projection that is already running.
    #[error("projection is already running")]
    ProjectionAlreadyRunning,

    /// The operation was interrupted by its cancellation token.
    ///
    /// Never reported as success-with-partial-work: a cancelled load
    /// leaves the aggregate hydrated only up to the last applied event.
    #[error("operation cancelled")]
    Cancelled,

    /// A back-end failure other than a version conflict.
    #[error("event store: {0}")]
    Store(StoreError),

    /// Event or snapshot (de)serialization failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A projection callback rejected an event.
    #[error("projection callback: {0}")]
    Callback(Arc<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap a projection callback error.
    pub(crate) fn callback(cause: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Error::Callback(Arc::from(cause))
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Concurrency => Error::Concurrency,
            StoreError::Cancelled => Error::Cancelled,
            other => Error::Store(other),
        }
    }
}
