//! Event value types: the raw stored form and the decoded form.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-aggregate monotonic counter, starting at 1 for the first event.
///
/// `0` is reserved to mean "no events yet" / "not found". The same type
/// carries the store-wide global version assigned on append.
pub type Version = u64;

/// Unqualified name of a type, used as the aggregate type name and as the
/// event reason (wire discriminator).
///
/// Generic parameters keep their qualified form; aggregates with generic
/// names should override
/// [`Aggregate::aggregate_type`](crate::Aggregate::aggregate_type).
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

/// An event in its stored form: identity, ordering, and opaque payloads.
///
/// Back-ends choose the physical layout but must preserve every field
/// round-trip; the serde derives let a back-end persist the struct as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Aggregate the event belongs to.
    pub aggregate_id: String,
    /// Aggregate type name.
    pub aggregate_type: String,
    /// Per-aggregate version, ≥ 1, gapless.
    pub version: Version,
    /// Store-wide position, assigned by the event store on append.
    pub global_version: Version,
    /// Event-type name used as the wire discriminator.
    pub reason: String,
    /// UTC instant the event was tracked.
    pub timestamp: DateTime<Utc>,
    /// Serialized event payload.
    pub data: Vec<u8>,
    /// Serialized metadata; empty means "no metadata".
    pub metadata: Vec<u8>,
}

/// Payload capability of a decoded event.
///
/// Blanket-implemented for every `Serialize + Send + Sync + 'static` type,
/// so any plain serde struct can be tracked on an aggregate. `as_any`
/// supports the typed dispatch in
/// [`Aggregate::transition`](crate::Aggregate::transition); `as_serialize`
/// feeds the payload back through the codec on save.
pub trait EventData: Any + Send + Sync {
    /// The payload as a downcastable value.
    fn as_any(&self) -> &(dyn Any + Send + Sync);

    /// The payload as a serializable value.
    fn as_serialize(&self) -> &dyn erased_serde::Serialize;
}

impl<T> EventData for T
where
    T: Serialize + Send + Sync + 'static,
{
    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    fn as_serialize(&self) -> &dyn erased_serde::Serialize {
        self
    }
}

/// A decoded, immutable event: the stored fields plus the typed payload
/// and the metadata map.
///
/// `Clone` is cheap: the payload is shared behind `Arc`.
#[derive(Clone)]
pub struct Event {
    pub(crate) aggregate_id: String,
    pub(crate) aggregate_type: String,
    pub(crate) version: Version,
    pub(crate) global_version: Version,
    pub(crate) reason: String,
    pub(crate) timestamp: DateTime<Utc>,
    pub(crate) data: Arc<dyn EventData>,
    pub(crate) metadata: HashMap<String, serde_json::Value>,
}

impl Event {
    /// Aggregate the event belongs to.
    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    /// Aggregate type name.
    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    /// Per-aggregate version of this event.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Store-wide position; `0` until the event has been saved.
    pub fn global_version(&self) -> Version {
        self.global_version
    }

    /// Event-type name.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// UTC instant the event was tracked.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// The payload as a downcastable value.
    pub fn data(&self) -> &(dyn Any + Send + Sync) {
        self.data.as_any()
    }

    /// The payload downcast to a concrete event type.
    ///
    /// Returns `None` when the payload is some other variant; `transition`
    /// implementations chain calls per event type they fold.
    pub fn data_as<T: 'static>(&self) -> Option<&T> {
        self.data.as_any().downcast_ref::<T>()
    }

    /// Decoded metadata; empty when the event carried none.
    pub fn metadata(&self) -> &HashMap<String, serde_json::Value> {
        &self.metadata
    }
}

// Manual Debug: the payload is a trait object without a Debug bound.
impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("aggregate_id", &self.aggregate_id)
            .field("aggregate_type", &self.aggregate_type)
            .field("version", &self.version)
            .field("global_version", &self.global_version)
            .field("reason", &self.reason)
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Born {
        name: String,
    }

    #[derive(Debug, Serialize)]
    struct AgedOneYear;

    fn event_with(data: impl EventData) -> Event {
        Event {
            aggregate_id: "p-1".to_owned(),
            aggregate_type: "Person".to_owned(),
            version: 1,
            global_version: 0,
            reason: "Born".to_owned(),
            timestamp: Utc::now(),
            data: Arc::new(data),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn short_type_name_strips_module_path() {
        assert_eq!(short_type_name::<Born>(), "Born");
        assert_eq!(short_type_name::<AgedOneYear>(), "AgedOneYear");
    }

    #[test]
    fn data_as_downcasts_to_the_tracked_type() {
        let event = event_with(Born {
            name: "kalle".to_owned(),
        });

        let born = event.data_as::<Born>().expect("payload should be Born");
        assert_eq!(born.name, "kalle");
    }

    #[test]
    fn data_as_other_type_is_none() {
        let event = event_with(Born {
            name: "kalle".to_owned(),
        });

        assert!(event.data_as::<AgedOneYear>().is_none());
    }

    #[test]
    fn clone_shares_the_payload() {
        let event = event_with(Born {
            name: "kalle".to_owned(),
        });
        let copy = event.clone();

        assert_eq!(copy.data_as::<Born>(), event.data_as::<Born>());
        assert_eq!(copy.version(), event.version());
    }

    #[test]
    fn debug_omits_the_payload() {
        let event = event_with(Born {
            name: "kalle".to_owned(),
        });
        let printed = format!("{event:?}");

        assert!(printed.contains("Person"));
        assert!(printed.contains("Born"));
        assert!(!printed.contains("kalle"));
    }
}
