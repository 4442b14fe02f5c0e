//! Aggregate snapshots: checkpointed state to shortcut long replays.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::aggregate::{self, Aggregate};
use crate::encoder::{self, CodecError, Encoder};
use crate::error::Error;
use crate::event::Version;
use crate::store::{EventStore, StoreError};

/// A checkpointed aggregate state at a specific version.
///
/// The `state` bytes are opaque to the core: the aggregate serializes and
/// restores them itself through the snapshot codec, so non-public fields
/// can be included without being exposed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Aggregate id.
    pub id: String,
    /// Aggregate type name.
    pub aggregate_type: String,
    /// Version of the last event folded into the state.
    pub version: Version,
    /// Global version of the last event folded into the state.
    pub global_version: Version,
    /// Serialized aggregate state.
    pub state: Vec<u8>,
}

/// Contract for snapshot-store back-ends.
///
/// Snapshots are advisory: saves upsert by (type, id) with no version
/// check, and a missing snapshot is an ordinary outcome.
pub trait SnapshotStore: Send + Sync {
    /// Upsert the snapshot for its (type, id).
    fn save(&self, snapshot: Snapshot) -> Result<(), StoreError>;

    /// The stored snapshot for (type, id).
    ///
    /// # Errors
    ///
    /// [`StoreError::SnapshotNotFound`] when none was stored.
    fn get(
        &self,
        ctx: &CancellationToken,
        id: &str,
        aggregate_type: &str,
    ) -> Result<Snapshot, StoreError>;
}

/// Snapshot capability of an aggregate.
///
/// The aggregate controls its serialized representation through the
/// injected codec, which is what lets it checkpoint state that is not
/// otherwise visible.
pub trait AggregateSnapshot: Aggregate {
    /// Serialize the aggregate state through the snapshot codec.
    fn serialize_snapshot(&self, encoder: &dyn Encoder) -> Result<Vec<u8>, CodecError>;

    /// Restore the aggregate state from snapshot bytes. Typically uses
    /// [`decode`](crate::decode) with the aggregate's own representation
    /// type.
    fn deserialize_snapshot(&mut self, encoder: &dyn Encoder, state: &[u8])
    -> Result<(), CodecError>;
}

/// Store a snapshot of the aggregate's current saved state.
///
/// # Errors
///
/// [`Error::UnsavedEvents`] if the aggregate holds unsaved events; the
/// snapshot store is not touched in that case.
pub fn save_snapshot<A: AggregateSnapshot>(
    store: &dyn SnapshotStore,
    aggregate: &A,
) -> Result<(), Error> {
    if aggregate.root().has_unsaved_events() {
        return Err(Error::UnsavedEvents);
    }

    let state = aggregate.serialize_snapshot(encoder::snapshot_encoder().as_ref())?;
    let root = aggregate.root();
    store.save(Snapshot {
        id: root.id().to_owned(),
        aggregate_type: A::aggregate_type().to_owned(),
        version: root.version(),
        global_version: root.global_version(),
        state,
    })?;
    Ok(())
}

/// Rebuild the aggregate from its snapshot alone, not including events
/// tracked after the snapshot was taken.
///
/// # Errors
///
/// [`Error::AggregateNotFound`] when no snapshot is stored for the id.
pub fn load_snapshot<A: AggregateSnapshot>(
    ctx: &CancellationToken,
    store: &dyn SnapshotStore,
    id: &str,
    aggregate: &mut A,
) -> Result<(), Error> {
    let snapshot = match store.get(ctx, id, A::aggregate_type()) {
        Ok(snapshot) => snapshot,
        Err(StoreError::SnapshotNotFound) => return Err(Error::AggregateNotFound),
        Err(err) => return Err(err.into()),
    };

    aggregate.deserialize_snapshot(encoder::snapshot_encoder().as_ref(), &snapshot.state)?;

    let root = aggregate.root_mut();
    root.id = snapshot.id;
    root.version = snapshot.version;
    root.global_version = snapshot.global_version;
    Ok(())
}

/// Rebuild the aggregate from its snapshot, then replay the events stored
/// after the snapshot was taken. The snapshot fast-path for aggregates
/// with long histories.
pub fn load_from_snapshot<A: AggregateSnapshot>(
    ctx: &CancellationToken,
    events: &dyn EventStore,
    snapshots: &dyn SnapshotStore,
    id: &str,
    aggregate: &mut A,
) -> Result<(), Error> {
    load_snapshot(ctx, snapshots, id, aggregate)?;
    aggregate::load(ctx, events, id, aggregate)
}

/// Snapshot store backed by process memory. Cloning shares the state.
#[derive(Clone, Default)]
pub struct InMemorySnapshotStore {
    inner: Arc<RwLock<HashMap<(String, String), Snapshot>>>,
}

impl InMemorySnapshotStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn save(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        self.inner.write().insert(
            (snapshot.aggregate_type.clone(), snapshot.id.clone()),
            snapshot,
        );
        Ok(())
    }

    fn get(
        &self,
        _ctx: &CancellationToken,
        id: &str,
        aggregate_type: &str,
    ) -> Result<Snapshot, StoreError> {
        self.inner
            .read()
            .get(&(aggregate_type.to_owned(), id.to_owned()))
            .cloned()
            .ok_or(StoreError::SnapshotNotFound)
    }
}
