//! In-memory event store: the reference back-end and test aid.
//!
//! Events live in per-stream vectors plus one store-wide vector in global
//! order, all behind a single lock, so an append and its global-version
//! assignment are one critical section. Cloning the store shares the
//! underlying state.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::event::{StoredEvent, Version};
use crate::store::{EventStore, Fetcher, StoreError, StoredEvents};

/// Event store backed by process memory.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    /// Per-aggregate streams, keyed by `"{type}_{id}"`.
    streams: HashMap<String, Vec<StoredEvent>>,
    /// Every event in append order; `global[i].global_version == i + 1`.
    global: Vec<StoredEvent>,
}

fn stream_key(aggregate_type: &str, aggregate_id: &str) -> String {
    format!("{aggregate_type}_{aggregate_id}")
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStore for InMemoryStore {
    fn save(&self, events: &mut [StoredEvent]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }
        let aggregate_type = events[0].aggregate_type.clone();
        let aggregate_id = events[0].aggregate_id.clone();
        let first_version = events[0].version;

        for (offset, event) in events.iter().enumerate() {
            if event.aggregate_type != aggregate_type || event.aggregate_id != aggregate_id {
                return Err(StoreError::backend(
                    "all events in one save must belong to the same aggregate",
                ));
            }
            if event.version != first_version + offset as Version {
                return Err(StoreError::backend("event versions must be consecutive"));
            }
        }

        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let key = stream_key(&aggregate_type, &aggregate_id);
        let current = inner
            .streams
            .get(&key)
            .and_then(|stream| stream.last())
            .map(|event| event.version)
            .unwrap_or(0);
        if first_version != current + 1 {
            return Err(StoreError::Concurrency);
        }

        // Assign global order and expose it to the caller before copying
        // into both read paths.
        let mut next_global = inner.global.len() as Version;
        for event in events.iter_mut() {
            next_global += 1;
            event.global_version = next_global;
        }

        inner.streams.entry(key).or_default().extend_from_slice(events);
        inner.global.extend_from_slice(events);
        Ok(())
    }

    fn get(
        &self,
        ctx: &CancellationToken,
        id: &str,
        aggregate_type: &str,
        after_version: Version,
    ) -> Result<StoredEvents, StoreError> {
        let key = stream_key(aggregate_type, id);
        let events: Vec<StoredEvent> = {
            let inner = self.inner.read();
            inner
                .streams
                .get(&key)
                .map(|stream| {
                    stream
                        .iter()
                        .filter(|event| event.version > after_version)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };
        Ok(Box::new(StreamIter {
            events: events.into_iter(),
            ctx: ctx.clone(),
            cancelled: false,
        }))
    }

    fn all(&self, start: Version) -> Fetcher {
        let inner = Arc::clone(&self.inner);
        // Next global version to yield; advanced per yielded event so a
        // partially consumed iterator resumes exactly where it stopped.
        let cursor = Arc::new(AtomicU64::new(start.max(1)));
        Box::new(move || {
            let from = cursor.load(Ordering::Acquire);
            let events: Vec<StoredEvent> = {
                let guard = inner.read();
                let skip = (from - 1) as usize;
                if skip >= guard.global.len() {
                    Vec::new()
                } else {
                    guard.global[skip..].to_vec()
                }
            };
            Ok(Box::new(GlobalIter {
                events: events.into_iter(),
                cursor: Arc::clone(&cursor),
            }) as StoredEvents)
        })
    }
}

/// Cursor over one aggregate stream; observes cancellation between events.
struct StreamIter {
    events: std::vec::IntoIter<StoredEvent>,
    ctx: CancellationToken,
    cancelled: bool,
}

impl Iterator for StreamIter {
    type Item = Result<StoredEvent, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cancelled {
            return None;
        }
        if self.ctx.is_cancelled() {
            self.cancelled = true;
            return Some(Err(StoreError::Cancelled));
        }
        self.events.next().map(Ok)
    }
}

/// Cursor over the global stream; records the fetcher's resume position
/// as events are yielded.
struct GlobalIter {
    events: std::vec::IntoIter<StoredEvent>,
    cursor: Arc<AtomicU64>,
}

impl Iterator for GlobalIter {
    type Item = Result<StoredEvent, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        let event = self.events.next()?;
        self.cursor.store(event.global_version + 1, Ordering::Release);
        Some(Ok(event))
    }
}
