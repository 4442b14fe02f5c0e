//! Process-wide registry mapping (aggregate type, event reason) to a
//! constructor for the typed event payload.
//!
//! The event store yields opaque byte payloads; the registry is what turns
//! them back into strongly-typed domain values at the boundary. Aggregates
//! register themselves once at startup (late registration is tolerated);
//! lookups are concurrent-read safe.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::aggregate::Aggregate;
use crate::encoder::{self, CodecError, Encoder};
use crate::event::{EventData, StoredEvent, short_type_name};

/// Constructor for one registered event type: decodes payload bytes into
/// a fresh boxed value of the right variant.
pub(crate) type EventFactory =
    Arc<dyn Fn(&dyn Encoder, &[u8]) -> Result<Arc<dyn EventData>, CodecError> + Send + Sync>;

struct Register {
    aggregates: RwLock<HashSet<String>>,
    events: RwLock<HashMap<String, EventFactory>>,
}

static GLOBAL_REGISTER: LazyLock<Register> = LazyLock::new(|| Register {
    aggregates: RwLock::new(HashSet::new()),
    events: RwLock::new(HashMap::new()),
});

const KEY_SEPARATOR: char = '_';

fn event_key(aggregate_type: &str, reason: &str) -> String {
    format!("{aggregate_type}{KEY_SEPARATOR}{reason}")
}

/// Record an aggregate type and the event types it folds.
///
/// Derives the aggregate type name from
/// [`Aggregate::aggregate_type`] and invokes the aggregate's
/// [`register`](Aggregate::register) callback with a registrar that mints
/// one decode constructor per listed event type.
///
/// Registering the same aggregate more than once is harmless.
pub fn register_aggregate<A: Aggregate>() {
    let aggregate_type = A::aggregate_type();
    GLOBAL_REGISTER
        .aggregates
        .write()
        .insert(aggregate_type.to_owned());

    let mut registrar = EventRegistrar { aggregate_type };
    A::register(&mut registrar);

    tracing::debug!(aggregate_type, "aggregate registered");
}

/// Collects the event exemplar types of one aggregate during registration.
///
/// Passed to [`Aggregate::register`]; each `event::<E>()` call records the
/// reason name of `E` and a constructor producing a fresh `E` from payload
/// bytes.
pub struct EventRegistrar {
    aggregate_type: &'static str,
}

impl EventRegistrar {
    /// Register one event type for the aggregate being registered.
    pub fn event<E>(&mut self)
    where
        E: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let reason = short_type_name::<E>();
        let factory: EventFactory = Arc::new(|enc: &dyn Encoder, bytes: &[u8]| {
            let value: E = encoder::decode(enc, bytes)?;
            Ok(Arc::new(value) as Arc<dyn EventData>)
        });
        GLOBAL_REGISTER
            .events
            .write()
            .insert(event_key(self.aggregate_type, reason), factory);
    }
}

/// Whether the aggregate type has been registered in this process.
pub fn aggregate_registered<A: Aggregate>() -> bool {
    GLOBAL_REGISTER
        .aggregates
        .read()
        .contains(A::aggregate_type())
}

/// Constructor for the stored event's (aggregate type, reason) pair, if
/// one was registered.
pub(crate) fn event_registered(event: &StoredEvent) -> Option<EventFactory> {
    GLOBAL_REGISTER
        .events
        .read()
        .get(&event_key(&event.aggregate_type, &event.reason))
        .cloned()
}

/// Clear the registry. Test use only; behavior is undefined while
/// projections are consuming events concurrently.
pub fn reset_register() {
    GLOBAL_REGISTER.aggregates.write().clear();
    GLOBAL_REGISTER.events.write().clear();
}
