//! Aggregate root state, the `Aggregate` capability trait, and the
//! load/save orchestration over an event store.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::encoder;
use crate::error::Error;
use crate::event::{Event, StoredEvent, Version, short_type_name};
use crate::iterator::EventIterator;
use crate::register::{self, EventRegistrar};
use crate::store::EventStore;

/// Aggregate root state embedded by value in domain entities.
///
/// Carries the identity, the committed and global versions, and the
/// buffer of events tracked since the last save.
#[derive(Debug, Default, Clone)]
pub struct Root {
    pub(crate) id: String,
    pub(crate) version: Version,
    pub(crate) global_version: Version,
    pub(crate) events: Vec<Event>,
}

impl Root {
    /// The aggregate id; empty until assigned by [`set_id`](Root::set_id)
    /// or by the first tracked change.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Assign the aggregate id from the outside.
    ///
    /// # Errors
    ///
    /// [`Error::AggregateAlreadyExists`] if an id was already assigned.
    pub fn set_id(&mut self, id: impl Into<String>) -> Result<(), Error> {
        if !self.id.is_empty() {
            return Err(Error::AggregateAlreadyExists);
        }
        self.id = id.into();
        Ok(())
    }

    /// The version including events that are not yet saved: the last
    /// uncommitted event's version, or the committed version if the
    /// buffer is empty. `0` means no events at all.
    pub fn version(&self) -> Version {
        match self.events.last() {
            Some(event) => event.version,
            None => self.version,
        }
    }

    /// The global version of the last saved event.
    pub fn global_version(&self) -> Version {
        self.global_version
    }

    /// Events tracked since the last save, in order.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Whether the aggregate holds events that are not yet saved.
    pub fn has_unsaved_events(&self) -> bool {
        !self.events.is_empty()
    }

    fn next_version(&self) -> Version {
        self.version() + 1
    }
}

/// A domain entity whose state is the fold of its events.
///
/// This is a capability set, not an inheritance hierarchy: anything that
/// exposes its [`Root`] state plus `transition` and `register` qualifies.
///
/// # Contract
///
/// - [`transition`](Aggregate::transition) must be a pure fold step,
///   dispatching on the event's payload via
///   [`Event::data_as`](crate::Event::data_as). It is invoked both when a
///   change is tracked and when history is replayed.
/// - [`register`](Aggregate::register) must list every event type the
///   aggregate produces; saving an aggregate with an unlisted event type
///   fails with [`Error::EventNotRegistered`].
pub trait Aggregate {
    /// The embedded root state.
    fn root(&self) -> &Root;

    /// Mutable access to the embedded root state.
    fn root_mut(&mut self) -> &mut Root;

    /// Fold one event into the in-memory state.
    fn transition(&mut self, event: &Event);

    /// Enumerate the event types this aggregate folds.
    fn register(registrar: &mut EventRegistrar)
    where
        Self: Sized;

    /// The aggregate type name, part of every event and registry key.
    ///
    /// Defaults to the unqualified type name.
    fn aggregate_type() -> &'static str
    where
        Self: Sized,
    {
        short_type_name::<Self>()
    }

    /// Track a state change: append an event to the unsaved buffer and
    /// apply it to the in-memory state immediately.
    ///
    /// Assigns a fresh id on the first change of an aggregate without
    /// one. The event's version is the current version + 1.
    fn track_change<E>(&mut self, data: E)
    where
        Self: Sized,
        E: Serialize + Send + Sync + 'static,
    {
        self.track_change_with_metadata(data, HashMap::new());
    }

    /// [`track_change`](Aggregate::track_change) with metadata carrying
    /// application state that is not part of the domain event itself.
    fn track_change_with_metadata<E>(
        &mut self,
        data: E,
        metadata: HashMap<String, serde_json::Value>,
    ) where
        Self: Sized,
        E: Serialize + Send + Sync + 'static,
    {
        let reason = short_type_name::<E>();
        let aggregate_type = Self::aggregate_type();

        let root = self.root_mut();
        if root.id.is_empty() {
            root.id = Uuid::new_v4().to_string();
        }
        let event = Event {
            aggregate_id: root.id.clone(),
            aggregate_type: aggregate_type.to_owned(),
            version: root.next_version(),
            global_version: 0,
            reason: reason.to_owned(),
            timestamp: Utc::now(),
            data: Arc::new(data),
            metadata,
        };
        root.events.push(event.clone());
        self.transition(&event);
    }
}

/// Rebuild the aggregate from its event history.
///
/// Fetches events with version greater than the aggregate's current
/// version (so a snapshot-restored aggregate only replays the tail),
/// folds each through `transition`, and keeps the root bookkeeping in
/// step. Cancellation is honored between events; a cancelled load leaves
/// the aggregate hydrated up to the last applied event.
///
/// # Errors
///
/// [`Error::AggregateNotFound`] if no events exist for the id;
/// [`Error::Cancelled`] on cancellation; decode and store failures
/// otherwise.
pub fn load<A: Aggregate>(
    ctx: &CancellationToken,
    store: &dyn EventStore,
    id: &str,
    aggregate: &mut A,
) -> Result<(), Error> {
    let after = aggregate.root().version();
    let raw = store.get(ctx, id, A::aggregate_type(), after)?;

    for item in EventIterator::new(raw) {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let event = item?;
        apply_history(aggregate, &event);
    }

    if aggregate.root().version() == 0 {
        return Err(Error::AggregateNotFound);
    }
    Ok(())
}

/// Fold one stored event during replay, updating identity and versions.
fn apply_history<A: Aggregate>(aggregate: &mut A, event: &Event) {
    aggregate.transition(event);
    let root = aggregate.root_mut();
    root.id = event.aggregate_id.clone();
    root.version = event.version;
    root.global_version = event.global_version;
}

/// Persist the aggregate's unsaved events.
///
/// Serializes each event's data and metadata through the event codec,
/// verifies registry membership, and delegates to the store. On success
/// the committed and global versions advance to the last event's and the
/// unsaved buffer empties. Saving an aggregate without unsaved events is
/// a no-op success.
///
/// # Errors
///
/// [`Error::AggregateNotRegistered`] / [`Error::EventNotRegistered`] for
/// registry violations; [`Error::Concurrency`] unaltered on a version
/// conflict (retryable); other store failures wrapped under
/// [`Error::Store`].
pub fn save<A: Aggregate>(store: &dyn EventStore, aggregate: &mut A) -> Result<(), Error> {
    if !aggregate.root().has_unsaved_events() {
        return Ok(());
    }
    let aggregate_type = A::aggregate_type();
    if !register::aggregate_registered::<A>() {
        return Err(Error::AggregateNotRegistered {
            aggregate_type: aggregate_type.to_owned(),
        });
    }

    let encoder = encoder::event_encoder();
    let events = aggregate.root().events();
    let mut stored = Vec::with_capacity(events.len());
    for event in events {
        let data = encoder.serialize(event.data.as_serialize())?;
        let metadata = if event.metadata.is_empty() {
            Vec::new()
        } else {
            encoder.serialize(&event.metadata)?
        };
        let raw = StoredEvent {
            aggregate_id: event.aggregate_id.clone(),
            aggregate_type: event.aggregate_type.clone(),
            version: event.version,
            global_version: 0,
            reason: event.reason.clone(),
            timestamp: event.timestamp,
            data,
            metadata,
        };
        if register::event_registered(&raw).is_none() {
            return Err(Error::EventNotRegistered {
                aggregate_type: raw.aggregate_type,
                reason: raw.reason,
            });
        }
        stored.push(raw);
    }

    store.save(&mut stored)?;

    let last = stored.last().expect("unsaved buffer is non-empty");
    tracing::debug!(
        aggregate_type,
        aggregate_id = %last.aggregate_id,
        events = stored.len(),
        version = last.version,
        "events appended"
    );

    let root = aggregate.root_mut();
    root.version = last.version;
    root.global_version = last.global_version;
    root.events.clear();
    Ok(())
}
