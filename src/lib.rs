//! Embedded event-sourcing toolkit: aggregates whose state is the fold of
//! an ordered, immutable event history.
//!
//! `sourcefold` provides the interlocking pieces that make event sourcing
//! work under concurrency: aggregate roots with optimistic-concurrency
//! saves, a pluggable event-store contract with per-stream and store-wide
//! ordering, optional snapshots to shortcut long replays, and projections
//! that stream events forward to build read models.
//!
//! # Key Types
//!
//! | Type | Role |
//! |------|------|
//! | [`Aggregate`] | Domain entity: tracks changes, folds events via `transition` |
//! | [`Root`] | Embedded aggregate state: id, versions, unsaved events |
//! | [`EventStore`] | Back-end contract: atomic appends, cursors, global order |
//! | [`SnapshotStore`] | Back-end contract for checkpointed aggregate state |
//! | [`Projection`] | Cancellable, trigger-able consumer of the global stream |
//! | [`ProjectionGroup`] | Runs projections concurrently under one context |
//! | [`Encoder`] | Pluggable byte codec; JSON by default |
//!
//! # Quick Start
//!
//! ```no_run
//! use serde::{Deserialize, Serialize};
//! use sourcefold::{Aggregate, CancellationToken, Event, EventRegistrar, InMemoryStore, Root};
//!
//! // 1. Define the aggregate and its events.
//! #[derive(Debug, Default)]
//! struct Person {
//!     root: Root,
//!     name: String,
//! }
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Born {
//!     name: String,
//! }
//!
//! impl Aggregate for Person {
//!     fn root(&self) -> &Root {
//!         &self.root
//!     }
//!     fn root_mut(&mut self) -> &mut Root {
//!         &mut self.root
//!     }
//!     fn transition(&mut self, event: &Event) {
//!         if let Some(born) = event.data_as::<Born>() {
//!             self.name = born.name.clone();
//!         }
//!     }
//!     fn register(registrar: &mut EventRegistrar) {
//!         registrar.event::<Born>();
//!     }
//! }
//!
//! fn main() -> Result<(), sourcefold::Error> {
//!     // 2. Register the aggregate, then save and load through a store.
//!     sourcefold::register_aggregate::<Person>();
//!     let store = InMemoryStore::new();
//!
//!     let mut person = Person::default();
//!     person.track_change(Born { name: "kalle".into() });
//!     sourcefold::save(&store, &mut person)?;
//!
//!     let mut loaded = Person::default();
//!     let ctx = CancellationToken::new();
//!     sourcefold::load(&ctx, &store, person.root().id(), &mut loaded)?;
//!     assert_eq!(loaded.name, "kalle");
//!     Ok(())
//! }
//! ```
//!
//! Concrete storage engines are out of scope for the core: back-ends
//! implement [`EventStore`] / [`SnapshotStore`] and prove themselves
//! against the [`testsuite`] battery. [`InMemoryStore`] is the shipped
//! reference implementation.

mod aggregate;
mod encoder;
mod error;
mod event;
mod iterator;
mod memory;
mod projection;
mod register;
mod snapshot;
mod store;
pub mod testsuite;

pub use aggregate::{Aggregate, Root, load, save};
pub use encoder::{
    CodecError, DecodeSink, Encoder, JsonEncoder, decode, set_event_encoder, set_snapshot_encoder,
};
pub use error::Error;
pub use event::{Event, EventData, StoredEvent, Version};
pub use iterator::EventIterator;
pub use memory::InMemoryStore;
pub use projection::{
    Callback, Projection, ProjectionGroup, ProjectionHandle, ProjectionResult, projections_race,
};
pub use register::{EventRegistrar, aggregate_registered, register_aggregate, reset_register};
pub use snapshot::{
    AggregateSnapshot, InMemorySnapshotStore, Snapshot, SnapshotStore, load_from_snapshot,
    load_snapshot, save_snapshot,
};
pub use store::{EventStore, Fetcher, StoreError, StoredEvents};

// Cancellation context carried into every long-running call.
pub use tokio_util::sync::CancellationToken;
