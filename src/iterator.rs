//! Decoding cursor composing a back-end iterator with the type registry.

use std::collections::HashMap;

use crate::encoder;
use crate::error::Error;
use crate::event::{Event, StoredEvent};
use crate::register;
use crate::store::StoredEvents;

/// Streams decoded events out of a raw back-end cursor.
///
/// For each stored event the registry supplies the constructor for its
/// (aggregate type, reason) pair and the event codec materializes the
/// payload and metadata. A registry miss surfaces as
/// [`Error::EventNotRegistered`]; the projection layer decides whether
/// that is fatal (strict) or skippable (lenient).
///
/// Dropping the iterator releases the back-end cursor.
pub struct EventIterator {
    inner: StoredEvents,
}

impl EventIterator {
    /// Wrap a raw cursor obtained from an event store.
    pub fn new(inner: StoredEvents) -> Self {
        Self { inner }
    }
}

impl Iterator for EventIterator {
    type Item = Result<Event, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let raw = match self.inner.next()? {
            Ok(raw) => raw,
            Err(err) => return Some(Err(err.into())),
        };
        Some(decode_event(raw))
    }
}

fn decode_event(raw: StoredEvent) -> Result<Event, Error> {
    let Some(factory) = register::event_registered(&raw) else {
        return Err(Error::EventNotRegistered {
            aggregate_type: raw.aggregate_type,
            reason: raw.reason,
        });
    };

    let encoder = encoder::event_encoder();
    let data = factory(encoder.as_ref(), &raw.data)?;
    // Empty metadata bytes mean "no metadata", never a decode failure.
    let metadata = if raw.metadata.is_empty() {
        HashMap::new()
    } else {
        encoder::decode(encoder.as_ref(), &raw.metadata)?
    };

    Ok(Event {
        aggregate_id: raw.aggregate_id,
        aggregate_type: raw.aggregate_type,
        version: raw.version,
        global_version: raw.global_version,
        reason: raw.reason,
        timestamp: raw.timestamp,
        data,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{Born, register_person};
    use crate::store::StoreError;
    use chrono::Utc;
    use serde::Serialize;

    fn stored(reason: &str, data: &[u8], metadata: &[u8]) -> StoredEvent {
        StoredEvent {
            aggregate_id: "p-1".to_owned(),
            aggregate_type: "Person".to_owned(),
            version: 1,
            global_version: 1,
            reason: reason.to_owned(),
            timestamp: Utc::now(),
            data: data.to_vec(),
            metadata: metadata.to_vec(),
        }
    }

    fn json_of(value: impl Serialize) -> Vec<u8> {
        serde_json::to_vec(&value).expect("serialize test payload")
    }

    #[test]
    fn decodes_registered_events() {
        register_person();
        let raw = stored(
            "Born",
            &json_of(Born {
                name: "kalle".to_owned(),
            }),
            &[],
        );

        let mut iter = EventIterator::new(Box::new(vec![Ok(raw)].into_iter()));
        let event = iter.next().expect("one event").expect("decodes");

        assert_eq!(event.reason(), "Born");
        assert_eq!(event.data_as::<Born>().expect("payload").name, "kalle");
        assert!(event.metadata().is_empty());
        assert!(iter.next().is_none());
    }

    #[test]
    fn decodes_metadata_when_present() {
        register_person();
        let metadata = json_of(std::collections::HashMap::from([(
            "correlation_id".to_owned(),
            serde_json::json!("req-7"),
        )]));
        let raw = stored(
            "Born",
            &json_of(Born {
                name: "kalle".to_owned(),
            }),
            &metadata,
        );

        let event = EventIterator::new(Box::new(vec![Ok(raw)].into_iter()))
            .next()
            .expect("one event")
            .expect("decodes");

        assert_eq!(event.metadata()["correlation_id"], "req-7");
    }

    #[test]
    fn unregistered_reason_is_a_first_class_error() {
        register_person();
        let raw = stored("Ghosted", b"{}", &[]);

        let err = EventIterator::new(Box::new(vec![Ok(raw)].into_iter()))
            .next()
            .expect("one item")
            .expect_err("must fail");

        assert!(matches!(
            err,
            Error::EventNotRegistered { ref reason, .. } if reason == "Ghosted"
        ));
    }

    #[test]
    fn backend_errors_pass_through() {
        register_person();
        let mut iter = EventIterator::new(Box::new(
            vec![Err(StoreError::backend("row set lost"))].into_iter(),
        ));

        let err = iter.next().expect("one item").expect_err("must fail");
        assert!(matches!(err, Error::Store(_)));
    }
}
