//! Pluggable serialization for event payloads and snapshot bodies.
//!
//! The codec is a pair of byte-encode / byte-decode operations behind the
//! object-safe [`Encoder`] trait. Two independent process-wide slots exist,
//! one for event data and metadata and one for snapshot bodies; both
//! default to the self-describing JSON codec and may be swapped at process
//! start via [`set_event_encoder`] / [`set_snapshot_encoder`].
//!
//! Decoding a dynamically-chosen type through a trait object is done with
//! a [`DecodeSink`] minted per concrete type: the encoder erases its format
//! into an `erased_serde::Deserializer` and the sink drives it.

use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;

/// Serialization or deserialization failure from the active codec.
#[derive(Debug, Clone, thiserror::Error)]
#[error("codec: {0}")]
pub struct CodecError(Arc<dyn std::error::Error + Send + Sync>);

impl CodecError {
    /// Wrap an arbitrary cause.
    pub fn new(cause: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self(Arc::from(cause.into()))
    }
}

impl From<erased_serde::Error> for CodecError {
    fn from(err: erased_serde::Error) -> Self {
        Self::new(err)
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err)
    }
}

/// Type-erased decode target.
///
/// Implementations carry a concrete target type; [`decode`] supplies one
/// for any `DeserializeOwned` type. Event factories registered through
/// [`EventRegistrar`](crate::EventRegistrar) use the same mechanism to
/// materialize typed payloads without compile-time knowledge at the
/// call site.
pub trait DecodeSink {
    /// Drive the erased deserializer, storing the decoded value.
    fn decode(
        &mut self,
        deserializer: &mut dyn erased_serde::Deserializer<'_>,
    ) -> Result<(), erased_serde::Error>;
}

/// A serialization format for events and snapshots.
///
/// Implementations must be self-describing enough to round-trip
/// `serde_json::Value` metadata maps. The trait is object-safe so a codec
/// can be installed process-wide behind `Arc<dyn Encoder>`.
pub trait Encoder: Send + Sync {
    /// Serialize a value to bytes.
    fn serialize(&self, value: &dyn erased_serde::Serialize) -> Result<Vec<u8>, CodecError>;

    /// Deserialize bytes into the sink's target type.
    fn deserialize(&self, bytes: &[u8], sink: &mut dyn DecodeSink) -> Result<(), CodecError>;
}

/// Decode `bytes` into `T` through the given encoder.
///
/// This is the typed entry point over [`Encoder::deserialize`]; aggregates
/// use it inside
/// [`deserialize_snapshot`](crate::AggregateSnapshot::deserialize_snapshot)
/// to restore their private state representation.
pub fn decode<T: DeserializeOwned>(encoder: &dyn Encoder, bytes: &[u8]) -> Result<T, CodecError> {
    struct Sink<T>(Option<T>);

    impl<T: DeserializeOwned> DecodeSink for Sink<T> {
        fn decode(
            &mut self,
            deserializer: &mut dyn erased_serde::Deserializer<'_>,
        ) -> Result<(), erased_serde::Error> {
            self.0 = Some(erased_serde::deserialize(deserializer)?);
            Ok(())
        }
    }

    let mut sink = Sink::<T>(None);
    encoder.deserialize(bytes, &mut sink)?;
    sink.0
        .ok_or_else(|| CodecError::new("encoder finished without producing a value"))
}

/// The default codec: self-describing JSON via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoder;

impl Encoder for JsonEncoder {
    fn serialize(&self, value: &dyn erased_serde::Serialize) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::with_capacity(128);
        let mut serializer = serde_json::Serializer::new(&mut buf);
        erased_serde::serialize(value, &mut serializer)?;
        Ok(buf)
    }

    fn deserialize(&self, bytes: &[u8], sink: &mut dyn DecodeSink) -> Result<(), CodecError> {
        let mut deserializer = serde_json::Deserializer::from_slice(bytes);
        let mut erased = <dyn erased_serde::Deserializer>::erase(&mut deserializer);
        sink.decode(&mut erased).map_err(CodecError::from)
    }
}

static EVENT_ENCODER: LazyLock<RwLock<Arc<dyn Encoder>>> =
    LazyLock::new(|| RwLock::new(Arc::new(JsonEncoder)));

static SNAPSHOT_ENCODER: LazyLock<RwLock<Arc<dyn Encoder>>> =
    LazyLock::new(|| RwLock::new(Arc::new(JsonEncoder)));

/// Replace the codec used for event data and metadata.
///
/// Intended to be called once at process start, before any events are
/// saved or decoded. Events written with one codec are not readable
/// through another.
pub fn set_event_encoder(encoder: impl Encoder + 'static) {
    *EVENT_ENCODER.write() = Arc::new(encoder);
}

/// Replace the codec used for snapshot bodies.
///
/// Independent from the event codec; intended to be called once at
/// process start.
pub fn set_snapshot_encoder(encoder: impl Encoder + 'static) {
    *SNAPSHOT_ENCODER.write() = Arc::new(encoder);
}

/// Current event codec.
pub(crate) fn event_encoder() -> Arc<dyn Encoder> {
    Arc::clone(&EVENT_ENCODER.read())
}

/// Current snapshot codec.
pub(crate) fn snapshot_encoder() -> Arc<dyn Encoder> {
    Arc::clone(&SNAPSHOT_ENCODER.read())
}
