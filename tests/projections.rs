//! Projection engine end-to-end: catch-up, triggers, groups, and races.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sourcefold::{
    Aggregate, Callback, CancellationToken, Error, Event, EventRegistrar, EventStore,
    InMemoryStore, Projection, ProjectionGroup, Root, Version,
};

#[derive(Debug, Default)]
struct Person {
    root: Root,
    name: String,
    age: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Born {
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct AgedOneYear;

impl Person {
    fn new(name: &str) -> Self {
        let mut person = Person::default();
        person.track_change(Born {
            name: name.to_owned(),
        });
        person
    }

    fn grow_older(&mut self) {
        self.track_change(AgedOneYear);
    }
}

impl Aggregate for Person {
    fn root(&self) -> &Root {
        &self.root
    }

    fn root_mut(&mut self) -> &mut Root {
        &mut self.root
    }

    fn transition(&mut self, event: &Event) {
        if let Some(born) = event.data_as::<Born>() {
            self.name = born.name.clone();
        } else if event.data_as::<AgedOneYear>().is_some() {
            self.age += 1;
        }
    }

    fn register(registrar: &mut EventRegistrar) {
        registrar.event::<Born>();
        registrar.event::<AgedOneYear>();
    }
}

type Seen = Arc<Mutex<Vec<Version>>>;

fn recording_callback() -> (Seen, Callback) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback: Callback = Box::new(move |event: Event| {
        sink.lock().expect("seen lock").push(event.global_version());
        Ok(())
    });
    (seen, callback)
}

fn seen_snapshot(seen: &Seen) -> Vec<Version> {
    seen.lock().expect("seen lock").clone()
}

async fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) {
    let started = std::time::Instant::now();
    while !condition() {
        assert!(
            started.elapsed() < deadline,
            "condition not met within {deadline:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Interleaved appends across two aggregates arrive in
/// global order, and a trigger picks up later appends.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn projection_catches_up_and_reacts_to_triggers() {
    sourcefold::register_aggregate::<Person>();
    let store = InMemoryStore::new();

    let mut anna = Person::new("anna");
    sourcefold::save(&store, &mut anna).expect("save a1");
    let mut bertil = Person::new("bertil");
    sourcefold::save(&store, &mut bertil).expect("save b1");
    anna.grow_older();
    sourcefold::save(&store, &mut anna).expect("save a2");

    let (seen, callback) = recording_callback();
    let mut projection = Projection::new(store.all(0), callback);
    projection.name = "ages".to_owned();
    let handle = projection.handle();

    let ctx = CancellationToken::new();
    let runner_ctx = ctx.clone();
    // Pace far beyond the test horizon: progress after the initial
    // catch-up only happens through triggers.
    let runner = tokio::spawn(async move {
        projection
            .run(&runner_ctx, Duration::from_secs(3600))
            .await
    });

    wait_until(Duration::from_secs(5), || seen_snapshot(&seen).len() == 3).await;
    assert_eq!(seen_snapshot(&seen), vec![1, 2, 3]);

    anna.grow_older();
    sourcefold::save(&store, &mut anna).expect("save a3");
    bertil.grow_older();
    sourcefold::save(&store, &mut bertil).expect("save b2");

    handle.trigger_sync().await;
    assert_eq!(seen_snapshot(&seen), vec![1, 2, 3, 4, 5]);

    handle.trigger_async();
    ctx.cancel();
    let exit = runner.await.expect("runner task");
    assert!(matches!(exit, Err(Error::Cancelled)));
}

/// A strict projection fails on an unregistered reason; a
/// lenient one skips it and keeps going.
#[test]
fn strict_fails_and_lenient_skips_unregistered_events() {
    sourcefold::register_aggregate::<Person>();
    let store = InMemoryStore::new();

    let mut person = Person::new("anna");
    sourcefold::save(&store, &mut person).expect("save");

    // An event whose reason no aggregate in this process registered,
    // appended through the raw store contract.
    use sourcefold::StoredEvent;
    let mut raw = vec![StoredEvent {
        aggregate_id: "s-1".to_owned(),
        aggregate_type: "Specter".to_owned(),
        version: 1,
        global_version: 0,
        reason: "Materialized".to_owned(),
        timestamp: chrono_now(),
        data: b"{}".to_vec(),
        metadata: Vec::new(),
    }];
    store.save(&mut raw).expect("raw append");

    person.grow_older();
    sourcefold::save(&store, &mut person).expect("save tail");

    let (strict_seen, strict_callback) = recording_callback();
    let mut strict = Projection::new(store.all(0), strict_callback);
    let (_, result) = strict.run_once();
    assert!(matches!(
        result.error,
        Some(Error::EventNotRegistered { .. })
    ));
    assert_eq!(seen_snapshot(&strict_seen), vec![1]);

    let (lenient_seen, lenient_callback) = recording_callback();
    let mut lenient = Projection::new(store.all(0), lenient_callback);
    lenient.strict = false;
    let (ran, result) = lenient.run_once();
    assert!(ran);
    assert!(result.error.is_none());
    assert_eq!(seen_snapshot(&lenient_seen), vec![1, 3]);
}

fn chrono_now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}

/// A race with `cancel_on_error` returns the causing
/// error, and the other projections report cancellation.
#[test]
fn race_cancels_siblings_on_callback_error() {
    sourcefold::register_aggregate::<Person>();
    let store = InMemoryStore::new();

    let mut person = Person::new("anna");
    for _ in 0..20 {
        person.grow_older();
    }
    sourcefold::save(&store, &mut person).expect("save");

    let slow_callback = || -> Callback {
        Box::new(|_event| {
            std::thread::sleep(Duration::from_millis(20));
            Ok(())
        })
    };

    let mut first = Projection::new(store.all(0), slow_callback());
    first.name = "first".to_owned();
    let mut second = Projection::new(
        store.all(0),
        Box::new(|_event| Err("read model rejected".into())) as Callback,
    );
    second.name = "second".to_owned();
    let mut third = Projection::new(store.all(0), slow_callback());
    third.name = "third".to_owned();

    let mut projections = [first, second, third];
    let (results, causing) = sourcefold::projections_race(true, &mut projections);

    assert_eq!(results.len(), 3);
    assert!(matches!(causing, Some(Error::Callback(_))));

    let by_name = |name: &str| {
        results
            .iter()
            .find(|result| result.name == name)
            .expect("result present")
    };
    assert!(matches!(by_name("second").error, Some(Error::Callback(_))));
    assert!(matches!(by_name("first").error, Some(Error::Cancelled)));
    assert!(matches!(by_name("third").error, Some(Error::Cancelled)));
}

/// A race without errors drains every projection and reports none.
#[test]
fn race_without_errors_drains_all_projections() {
    sourcefold::register_aggregate::<Person>();
    let store = InMemoryStore::new();

    let mut person = Person::new("anna");
    person.grow_older();
    sourcefold::save(&store, &mut person).expect("save");

    let (first_seen, first_callback) = recording_callback();
    let (second_seen, second_callback) = recording_callback();
    let mut projections = [
        Projection::new(store.all(0), first_callback),
        Projection::new(store.all(0), second_callback),
    ];

    let (results, causing) = sourcefold::projections_race(false, &mut projections);

    assert!(causing.is_none());
    assert!(results.iter().all(|result| result.error.is_none()));
    assert_eq!(seen_snapshot(&first_seen), vec![1, 2]);
    assert_eq!(seen_snapshot(&second_seen), vec![1, 2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn group_runs_triggers_and_stops() {
    sourcefold::register_aggregate::<Person>();
    let store = InMemoryStore::new();

    let mut anna = Person::new("anna");
    sourcefold::save(&store, &mut anna).expect("save a1");
    let mut bertil = Person::new("bertil");
    sourcefold::save(&store, &mut bertil).expect("save b1");

    let (first_seen, first_callback) = recording_callback();
    let (second_seen, second_callback) = recording_callback();
    let mut group = ProjectionGroup::new(vec![
        Projection::new(store.all(0), first_callback),
        Projection::new(store.all(0), second_callback),
    ]);
    group.pace = Duration::from_secs(3600);

    let mut errors = group.start();

    wait_until(Duration::from_secs(5), || {
        seen_snapshot(&first_seen).len() == 2 && seen_snapshot(&second_seen).len() == 2
    })
    .await;

    anna.grow_older();
    sourcefold::save(&store, &mut anna).expect("save a2");
    group.trigger_sync().await;

    assert_eq!(seen_snapshot(&first_seen), vec![1, 2, 3]);
    assert_eq!(seen_snapshot(&second_seen), vec![1, 2, 3]);

    group.stop().await;
    // All workers returned through cancellation; the channel closes with
    // no error published.
    assert!(errors.recv().await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn group_publishes_projection_errors() {
    sourcefold::register_aggregate::<Person>();
    let store = InMemoryStore::new();

    let mut person = Person::new("anna");
    sourcefold::save(&store, &mut person).expect("save");

    let failing: Callback = Box::new(|_event| Err("projection exploded".into()));
    let mut group = ProjectionGroup::new(vec![Projection::new(store.all(0), failing)]);
    group.pace = Duration::from_secs(3600);

    let mut errors = group.start();
    let err = errors.recv().await.expect("error published");
    assert!(matches!(err, Error::Callback(_)));

    group.stop().await;
}
