//! Projections: cancellable, trigger-able consumers of the global event
//! stream.
//!
//! A [`Projection`] drives a stateful [`Fetcher`] cursor through the
//! registry-decoding iterator and hands each event to a callback. The
//! long-running [`run`](Projection::run) loop paces itself, reacts to
//! triggers, and exits on cancellation; [`ProjectionGroup`] runs several
//! projections concurrently and [`projections_race`] drains a set of
//! projections to the end of a stale stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::event::Event;
use crate::iterator::EventIterator;
use crate::store::Fetcher;

/// Default wait between catch-up passes when a group projection reaches
/// the end of the stream.
const DEFAULT_PACE: Duration = Duration::from_secs(10);

/// Callback invoked with each decoded event.
pub type Callback =
    Box<dyn FnMut(Event) -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send>;

/// Trigger signal; a sync trigger carries a completion rendezvous.
struct Trigger {
    done: Option<oneshot::Sender<()>>,
}

/// Outcome of a projection pass: the last successfully handled event and
/// the error that stopped the pass, if any.
#[derive(Debug, Clone)]
pub struct ProjectionResult {
    /// The projection's name (may be empty).
    pub name: String,
    /// Last event the callback handled successfully.
    pub last_handled_event: Option<Event>,
    /// What stopped the pass; `None` when the stream end was reached.
    pub error: Option<Error>,
}

/// A single-consumer cursor driver over the global event stream.
pub struct Projection {
    /// Treat unregistered events as fatal (default). When `false`, events
    /// whose reason is unknown to the registry are skipped.
    pub strict: bool,
    /// Optional name carried into results and logs.
    pub name: String,
    fetcher: Fetcher,
    callback: Callback,
    running: Arc<AtomicBool>,
    trigger_tx: mpsc::Sender<Trigger>,
    trigger_rx: mpsc::Receiver<Trigger>,
}

impl Projection {
    /// Create a projection over a fetcher, typically
    /// [`EventStore::all`](crate::EventStore::all).
    ///
    /// The fetcher remembers its cursor across passes, so the projection
    /// makes forward progress without re-delivering events.
    pub fn new<C>(fetcher: Fetcher, callback: C) -> Self
    where
        C: FnMut(Event) -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
    {
        // Capacity 1: a pending trigger coalesces further async triggers.
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        Self {
            strict: true,
            name: String::new(),
            fetcher,
            callback: Box::new(callback),
            running: Arc::new(AtomicBool::new(false)),
            trigger_tx,
            trigger_rx,
        }
    }

    /// A clone-able handle for triggering this projection while
    /// [`run`](Projection::run) owns it.
    pub fn handle(&self) -> ProjectionHandle {
        ProjectionHandle {
            name: self.name.clone(),
            running: Arc::clone(&self.running),
            trigger_tx: self.trigger_tx.clone(),
        }
    }

    /// Run one fetch pass: obtain a cursor and feed every event through
    /// the callback.
    ///
    /// Returns whether the pass processed at least one event, and the
    /// pass result. In lenient mode (`strict == false`) events whose
    /// reason is not registered are skipped without invoking the
    /// callback; any other decode failure, and any callback error, aborts
    /// the pass.
    pub fn run_once(&mut self) -> (bool, ProjectionResult) {
        let mut ran = false;
        let mut last_handled: Option<Event> = None;

        let raw = match (self.fetcher)() {
            Ok(iter) => iter,
            Err(err) => return (false, self.result(last_handled, Some(err.into()))),
        };

        for item in EventIterator::new(raw) {
            ran = true;
            let event = match item {
                Ok(event) => event,
                Err(err @ Error::EventNotRegistered { .. }) if !self.strict => {
                    tracing::warn!(projection = %self.name, error = %err, "skipping unregistered event");
                    continue;
                }
                Err(err) => return (false, self.result(last_handled, Some(err))),
            };

            if let Err(err) = (self.callback)(event.clone()) {
                return (false, self.result(last_handled, Some(Error::callback(err))));
            }
            last_handled = Some(event);
        }

        (ran, self.result(last_handled, None))
    }

    /// Run fetch passes until one processes no events or errors, checking
    /// cancellation between passes.
    ///
    /// The last handled event carries across passes, so the result always
    /// names the furthest event this call reached.
    pub fn run_to_end(&mut self, ctx: &CancellationToken) -> ProjectionResult {
        let mut last_handled: Option<Event> = None;

        loop {
            if ctx.is_cancelled() {
                return ProjectionResult {
                    name: self.name.clone(),
                    last_handled_event: last_handled,
                    error: Some(Error::Cancelled),
                };
            }

            let (ran, mut result) = self.run_once();
            if result.last_handled_event.is_none() {
                result.last_handled_event = last_handled.clone();
            }
            if result.error.is_some() || !ran {
                return result;
            }
            last_handled = result.last_handled_event.clone();
        }
    }

    /// Run until cancelled: catch up to the end of the stream, then wait
    /// for whichever comes first of cancellation, the `pace` interval, or
    /// a trigger, and repeat.
    ///
    /// Event processing itself is synchronous; a long catch-up blocks the
    /// current task until it reaches the stream end.
    ///
    /// # Errors
    ///
    /// [`Error::ProjectionAlreadyRunning`] on re-entry,
    /// [`Error::Cancelled`] when the token fires, or the first error a
    /// catch-up pass hit.
    pub async fn run(&mut self, ctx: &CancellationToken, pace: Duration) -> Result<(), Error> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::ProjectionAlreadyRunning);
        }
        tracing::debug!(projection = %self.name, "projection started");

        let result = self.run_loop(ctx, pace).await;

        self.running.store(false, Ordering::SeqCst);
        tracing::debug!(projection = %self.name, "projection stopped");
        result
    }

    async fn run_loop(&mut self, ctx: &CancellationToken, pace: Duration) -> Result<(), Error> {
        // Completion rendezvous of the sync trigger that started the
        // current pass; signalled after the following run_to_end.
        let mut pending_sync: Option<oneshot::Sender<()>> = None;

        loop {
            let result = self.run_to_end(ctx);
            if let Some(done) = pending_sync.take() {
                let _ = done.send(());
            }
            if let Some(err) = result.error {
                return Err(err);
            }

            tokio::select! {
                _ = ctx.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(pace) => {}
                trigger = self.trigger_rx.recv() => {
                    if let Some(trigger) = trigger {
                        pending_sync = trigger.done;
                    }
                }
            }
        }
    }

    fn result(&self, last_handled_event: Option<Event>, error: Option<Error>) -> ProjectionResult {
        ProjectionResult {
            name: self.name.clone(),
            last_handled_event,
            error,
        }
    }
}

/// Trigger-side view of a running projection.
///
/// Obtained from [`Projection::handle`] before handing the projection to
/// its runner; cheap to clone.
#[derive(Clone)]
pub struct ProjectionHandle {
    name: String,
    running: Arc<AtomicBool>,
    trigger_tx: mpsc::Sender<Trigger>,
}

impl ProjectionHandle {
    /// The projection's name at the time the handle was taken.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nudge a running projection to catch up immediately, independent of
    /// its pace.
    ///
    /// Non-blocking: if a trigger is already pending the signal coalesces
    /// into it. No-op when the projection is not running.
    pub fn trigger_async(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.trigger_tx.try_send(Trigger { done: None });
    }

    /// Trigger a running projection and wait until the catch-up pass it
    /// causes has completed. No-op when the projection is not running.
    pub async fn trigger_sync(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .trigger_tx
            .send(Trigger {
                done: Some(done_tx),
            })
            .await
            .is_err()
        {
            return;
        }
        let _ = done_rx.await;
    }
}

/// Runs a set of projections concurrently under one cancellable context.
pub struct ProjectionGroup {
    /// Wait between catch-up passes once a projection reaches the end of
    /// the stream. Defaults to 10 seconds.
    pub pace: Duration,
    projections: Vec<Projection>,
    handles: Vec<ProjectionHandle>,
    cancel: Option<CancellationToken>,
    workers: Vec<JoinHandle<Projection>>,
}

impl ProjectionGroup {
    /// Create a group owning the given projections.
    pub fn new(projections: Vec<Projection>) -> Self {
        Self {
            pace: DEFAULT_PACE,
            projections,
            handles: Vec::new(),
            cancel: None,
            workers: Vec::new(),
        }
    }

    /// Launch every projection on its own task.
    ///
    /// Returns the group's error channel: a projection that exits with a
    /// non-cancellation error publishes it there. The channel closes once
    /// all workers have returned after [`stop`](ProjectionGroup::stop).
    pub fn start(&mut self) -> mpsc::UnboundedReceiver<Error> {
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        self.handles = self.projections.iter().map(Projection::handle).collect();
        for mut projection in self.projections.drain(..) {
            let ctx = token.clone();
            let err_tx = err_tx.clone();
            let pace = self.pace;
            self.workers.push(tokio::spawn(async move {
                if let Err(err) = projection.run(&ctx, pace).await
                    && !matches!(err, Error::Cancelled)
                {
                    tracing::error!(
                        projection = %projection.name,
                        error = %err,
                        "projection exited with error"
                    );
                    let _ = err_tx.send(err);
                }
                projection
            }));
        }

        self.cancel = Some(token);
        err_rx
    }

    /// Trigger every member without waiting.
    pub fn trigger_async(&self) {
        for handle in &self.handles {
            handle.trigger_async();
        }
    }

    /// Trigger every member and wait until each completed the catch-up
    /// pass its trigger caused.
    pub async fn trigger_sync(&self) {
        let mut waits = Vec::with_capacity(self.handles.len());
        for handle in &self.handles {
            let handle = handle.clone();
            waits.push(tokio::spawn(async move { handle.trigger_sync().await }));
        }
        for wait in waits {
            let _ = wait.await;
        }
    }

    /// Cancel all members and wait for them to return.
    ///
    /// The projections are reclaimed into the group, so a later
    /// [`start`](ProjectionGroup::start) runs them again.
    pub async fn stop(&mut self) {
        let Some(token) = self.cancel.take() else {
            return;
        };
        token.cancel();
        for worker in self.workers.drain(..) {
            if let Ok(projection) = worker.await {
                self.projections.push(projection);
            }
        }
        self.handles.clear();
    }
}

/// Drain every projection to the end of its stream concurrently.
///
/// Intended for stale streams with no more events coming in, or when the
/// caller needs to know all projections are done. When `cancel_on_error`
/// is set and a projection stops with a non-cancellation error, the
/// remaining projections are cancelled and that first error is returned
/// alongside the results.
///
/// Blocks the calling thread; returns only after every projection has
/// finished and published its result.
pub fn projections_race(
    cancel_on_error: bool,
    projections: &mut [Projection],
) -> (Vec<ProjectionResult>, Option<Error>) {
    let token = CancellationToken::new();
    let causing: Mutex<Option<Error>> = Mutex::new(None);
    let mut results = Vec::with_capacity(projections.len());

    std::thread::scope(|scope| {
        let mut workers = Vec::with_capacity(projections.len());
        for projection in projections.iter_mut() {
            let ctx = token.clone();
            let causing = &causing;
            workers.push(scope.spawn(move || {
                let result = projection.run_to_end(&ctx);
                if cancel_on_error
                    && let Some(err) = &result.error
                    && !matches!(err, Error::Cancelled)
                {
                    ctx.cancel();
                    let mut slot = causing.lock();
                    if slot.is_none() {
                        *slot = Some(err.clone());
                    }
                }
                result
            }));
        }
        for worker in workers {
            match worker.join() {
                Ok(result) => results.push(result),
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }
    });

    (results, causing.into_inner())
}
