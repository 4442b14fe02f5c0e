//! Portable conformance battery for event-store back-ends.
//!
//! Every back-end must pass [`run`], which exercises the contract of
//! [`EventStore`](crate::EventStore) against fresh stores produced by the
//! given factory: append semantics, optimistic concurrency, per-stream
//! reads, global ordering, and fetcher resumption. Teardown is the
//! store's `Drop`.
//!
//! ```no_run
//! use sourcefold::{InMemoryStore, testsuite};
//!
//! #[test]
//! fn conformance() {
//!     testsuite::run(InMemoryStore::new);
//! }
//! # fn main() {}
//! ```

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::{StoredEvent, Version};
use crate::store::{EventStore, StoreError, StoredEvents};

/// Run the whole battery, one fresh store per case.
pub fn run<S, F>(new_store: F)
where
    S: EventStore,
    F: Fn() -> S,
{
    get_on_empty_store_is_exhausted(&new_store());
    save_assigns_versions_and_reads_back(&new_store());
    batched_save_is_atomic_and_ordered(&new_store());
    stale_save_is_a_concurrency_error(&new_store());
    empty_save_is_a_noop(&new_store());
    get_skips_up_to_after_version(&new_store());
    global_order_spans_streams(&new_store());
    fetcher_resumes_across_calls(&new_store());
    concurrent_writers_conflict(&new_store());
}

fn aggregate_id() -> String {
    Uuid::new_v4().to_string()
}

fn events(id: &str, from_version: Version, count: usize) -> Vec<StoredEvent> {
    (0..count as Version)
        .map(|offset| StoredEvent {
            aggregate_id: id.to_owned(),
            aggregate_type: "Booking".to_owned(),
            version: from_version + offset,
            global_version: 0,
            reason: if from_version + offset == 1 {
                "Created".to_owned()
            } else {
                "Updated".to_owned()
            },
            timestamp: Utc::now(),
            data: b"{}".to_vec(),
            metadata: Vec::new(),
        })
        .collect()
}

fn collect(iter: StoredEvents) -> Vec<StoredEvent> {
    iter.collect::<Result<Vec<_>, _>>()
        .expect("iteration must not error")
}

/// An aggregate that was never written yields an exhausted cursor, not an
/// error.
pub fn get_on_empty_store_is_exhausted(store: &dyn EventStore) {
    let ctx = CancellationToken::new();
    let read = collect(
        store
            .get(&ctx, &aggregate_id(), "Booking", 0)
            .expect("get on empty store"),
    );
    assert!(read.is_empty(), "expected no events, got {}", read.len());
}

/// A single append round-trips every field and assigns a global version.
pub fn save_assigns_versions_and_reads_back(store: &dyn EventStore) {
    let id = aggregate_id();
    let mut batch = events(&id, 1, 1);
    store.save(&mut batch).expect("save");
    assert!(
        batch[0].global_version > 0,
        "global version must be written back"
    );

    let ctx = CancellationToken::new();
    let read = collect(store.get(&ctx, &id, "Booking", 0).expect("get"));
    assert_eq!(read.len(), 1);
    assert_eq!(read[0], batch[0]);
}

/// A multi-event append keeps version order and strictly increasing
/// global versions.
pub fn batched_save_is_atomic_and_ordered(store: &dyn EventStore) {
    let id = aggregate_id();
    let mut batch = events(&id, 1, 3);
    store.save(&mut batch).expect("save");

    let ctx = CancellationToken::new();
    let read = collect(store.get(&ctx, &id, "Booking", 0).expect("get"));
    assert_eq!(read.len(), 3);
    for (index, event) in read.iter().enumerate() {
        assert_eq!(event.version, index as Version + 1, "gapless versions");
    }
    for pair in read.windows(2) {
        assert!(
            pair[1].global_version > pair[0].global_version,
            "global versions must be strictly increasing"
        );
    }
}

/// A save whose first version does not follow the stream head fails with
/// a concurrency error and writes nothing.
pub fn stale_save_is_a_concurrency_error(store: &dyn EventStore) {
    let id = aggregate_id();
    store.save(&mut events(&id, 1, 1)).expect("save v1");

    let err = store
        .save(&mut events(&id, 1, 1))
        .expect_err("duplicate v1 must fail");
    assert!(matches!(err, StoreError::Concurrency));

    let err = store
        .save(&mut events(&id, 5, 1))
        .expect_err("gapped v5 must fail");
    assert!(matches!(err, StoreError::Concurrency));

    let ctx = CancellationToken::new();
    let read = collect(store.get(&ctx, &id, "Booking", 0).expect("get"));
    assert_eq!(read.len(), 1, "failed saves must not leave partial writes");
}

/// Saving an empty slice succeeds and does not advance the global stream.
pub fn empty_save_is_a_noop(store: &dyn EventStore) {
    store.save(&mut []).expect("empty save");

    let mut fetch = store.all(0);
    let read = collect(fetch().expect("fetch"));
    assert!(read.is_empty());
}

/// `get` with a non-zero after-version yields only the tail.
pub fn get_skips_up_to_after_version(store: &dyn EventStore) {
    let id = aggregate_id();
    store.save(&mut events(&id, 1, 5)).expect("save");

    let ctx = CancellationToken::new();
    let read = collect(store.get(&ctx, &id, "Booking", 3).expect("get"));
    let versions: Vec<Version> = read.iter().map(|event| event.version).collect();
    assert_eq!(versions, vec![4, 5]);
}

/// Appends across streams surface through the fetcher in one strictly
/// increasing global order.
pub fn global_order_spans_streams(store: &dyn EventStore) {
    let first = aggregate_id();
    let second = aggregate_id();
    store.save(&mut events(&first, 1, 1)).expect("save a1");
    store.save(&mut events(&second, 1, 1)).expect("save b1");
    store.save(&mut events(&first, 2, 1)).expect("save a2");

    let mut fetch = store.all(0);
    let read = collect(fetch().expect("fetch"));
    assert_eq!(read.len(), 3);
    let ids: Vec<&str> = read.iter().map(|event| event.aggregate_id.as_str()).collect();
    assert_eq!(ids, vec![first.as_str(), second.as_str(), first.as_str()]);
    for pair in read.windows(2) {
        assert!(pair[1].global_version > pair[0].global_version);
    }
}

/// A fetcher invoked again after more appends resumes past everything it
/// already delivered.
pub fn fetcher_resumes_across_calls(store: &dyn EventStore) {
    let id = aggregate_id();
    store.save(&mut events(&id, 1, 2)).expect("save first batch");

    let mut fetch = store.all(0);
    let first_pass = collect(fetch().expect("first fetch"));
    assert_eq!(first_pass.len(), 2);

    store.save(&mut events(&id, 3, 2)).expect("save second batch");

    let second_pass = collect(fetch().expect("second fetch"));
    assert_eq!(second_pass.len(), 2, "must not re-deliver earlier events");
    assert!(second_pass[0].global_version > first_pass[1].global_version);

    let third_pass = collect(fetch().expect("third fetch"));
    assert!(third_pass.is_empty());
}

/// Two writers racing on the same expected version: exactly one wins, the
/// store matches the winner.
pub fn concurrent_writers_conflict<S: EventStore>(store: &S) {
    let id = aggregate_id();
    store.save(&mut events(&id, 1, 1)).expect("save v1");

    let outcomes: Vec<Result<(), StoreError>> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..2)
            .map(|_| {
                let id = id.clone();
                scope.spawn(move || store.save(&mut events(&id, 2, 1)))
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join().expect("writer thread panicked"))
            .collect()
    });

    let wins = outcomes.iter().filter(|outcome| outcome.is_ok()).count();
    let conflicts = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, Err(StoreError::Concurrency)))
        .count();
    assert_eq!(wins, 1, "exactly one writer must win");
    assert_eq!(conflicts, 1, "the loser must see a concurrency error");

    let ctx = CancellationToken::new();
    let read = collect(store.get(&ctx, &id, "Booking", 0).expect("get"));
    assert_eq!(read.len(), 2, "store state must match the winner");
}
