//! # Streaming Subscriptions & Backpressure
//!
//! This module bridges a synchronous, pull-based record source (a store
//! query) to a push-based subscriber that controls the flow with credit:
//! the subscriber asks for `n` more items with [`Subscription::request`] and
//! never receives more than it asked for.
//!
//! ## One Actor Per Subscription
//!
//! Every subscription is a small tokio task that owns its queue, its credit
//! and its state. Handles talk to it through a channel, so a `request()` from
//! any thread (including from inside `on_next`) is just a message and never
//! races with a fetch completing.
//!
//! ```text
//!   Subscription::request(n) ──┐
//!   Subscription::cancel()  ───┤ mpsc
//!                              ▼
//!                    ┌───────────────────┐   spawn_blocking    ┌────────────┐
//!                    │  subscription     │ ──── fetch(100) ──► │ RecordSource│
//!                    │  actor            │ ◄─── Batch ──────── │ (store)    │
//!                    │  queue + credit   │                     └────────────┘
//!                    └─────────┬─────────┘
//!                              │ on_next / on_error / on_complete
//!                              ▼
//!                         Subscriber
//! ```
//!
//! ## State Machine
//!
//! ```text
//!   Idle ──request──► Fetching ──batch──► Draining ──► Idle
//!                                              │
//!                                              ├──► Complete  (exhausted, queue empty)
//!   any ──cancel──► Cancelled                  └──► Error     (fetch or delivery failed)
//! ```
//!
//! - At most one fetch is in flight; it runs on the blocking pool, never on
//!   the thread that called `request()`.
//! - A batch shorter than the batch size marks the source exhausted.
//! - Once the queue falls to a third of the batch size, the next batch is
//!   prefetched, so the queue never holds more than `batch + batch / 3`.
//! - A fetch error is delivered after the items fetched before it.
//! - Cancellation is checked before every callback; results of a fetch that
//!   is in flight when the subscription is cancelled are discarded.
//!
//! ## Rust Concepts
//!
//! - **`tokio::select!`**: the actor waits on commands, the in-flight fetch
//!   and the replay timer at once.
//! - **`catch_unwind`**: a panicking subscriber callback becomes a
//!   [`Error::StreamFault`] instead of killing the actor task.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::config::StreamingConfig;
use crate::error::{Error, Result};
use crate::store::ItemIter;
use crate::types::Timestamp;

// =============================================================================
// Subscriber
// =============================================================================

/// Receiver of a stream of items.
///
/// Callbacks run on the subscription's task, one at a time. After
/// `on_error` or `on_complete` (exactly one of them, at most once) nothing
/// else is called. After [`Subscription::cancel`] nothing is called at all.
pub trait Subscriber<T>: Send + 'static {
    /// Called first, with the handle used to request items.
    fn on_subscribe(&mut self, subscription: Subscription) {
        let _ = subscription;
    }

    fn on_next(&mut self, item: T);

    fn on_error(&mut self, error: Error);

    fn on_complete(&mut self);
}

/// Lifecycle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Waiting for credit or for the subscriber to consume.
    Idle,
    /// A fetch is running on the blocking pool.
    Fetching,
    /// Delivering queued items.
    Draining,
    Complete,
    Cancelled,
    Error,
}

impl SubscriptionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SubscriptionState::Complete | SubscriptionState::Cancelled | SubscriptionState::Error
        )
    }
}

// =============================================================================
// Subscription Handle
// =============================================================================

#[derive(Debug)]
pub(crate) enum Command {
    Request(u64),
    Cancel,
    /// The idle window of a live subscription elapsed.
    TimedOut,
}

#[derive(Debug)]
pub(crate) struct Shared {
    state: Mutex<SubscriptionState>,
}

/// Cloneable handle to a running subscription.
#[derive(Debug, Clone)]
pub struct Subscription {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl Subscription {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(SubscriptionState::Idle),
        });
        (Self { commands, shared }, rx)
    }

    /// Grants credit for `n` more items. `n == 0` fails the subscription
    /// with [`Error::InvalidRequest`].
    pub fn request(&self, n: u64) {
        // a finished actor has dropped its receiver
        let _ = self.commands.send(Command::Request(n));
    }

    /// Cancels the subscription. Once this returns, the subscription's task
    /// makes at most one more callback: the one it had already started or
    /// had passed its final state check for. Nothing is delivered after it.
    /// Cancelling from inside a callback stops delivery immediately.
    pub fn cancel(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.is_terminal() {
                return;
            }
            *state = SubscriptionState::Cancelled;
        }
        let _ = self.commands.send(Command::Cancel);
    }

    pub fn state(&self) -> SubscriptionState {
        *self.shared.state.lock()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == SubscriptionState::Cancelled
    }

    /// Notifies the actor that its idle window elapsed. Returns `false`
    /// once the actor is gone.
    pub(crate) fn notify_timed_out(&self) -> bool {
        self.commands.send(Command::TimedOut).is_ok()
    }
}

// =============================================================================
// Outlet
// =============================================================================

/// The actor's side of the subscriber: credit, state and guarded callbacks.
pub(crate) struct Outlet<T> {
    subscriber: Box<dyn Subscriber<T>>,
    shared: Arc<Shared>,
    credit: u64,
}

impl<T: 'static> Outlet<T> {
    pub(crate) fn new(subscriber: Box<dyn Subscriber<T>>, handle: &Subscription) -> Self {
        Self {
            subscriber,
            shared: Arc::clone(&handle.shared),
            credit: 0,
        }
    }

    pub(crate) fn state(&self) -> SubscriptionState {
        *self.shared.state.lock()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Moves to `next` unless already terminal.
    pub(crate) fn set_state(&self, next: SubscriptionState) -> bool {
        let mut state = self.shared.state.lock();
        if state.is_terminal() {
            return false;
        }
        *state = next;
        true
    }

    pub(crate) fn credit(&self) -> u64 {
        self.credit
    }

    pub(crate) fn has_credit(&self) -> bool {
        self.credit > 0
    }

    pub(crate) fn add_credit(&mut self, n: u64) {
        self.credit = self.credit.saturating_add(n);
    }

    pub(crate) fn subscribe(&mut self, handle: Subscription) {
        if self.is_finished() {
            return;
        }
        let subscriber = &mut self.subscriber;
        if catch_unwind(AssertUnwindSafe(|| subscriber.on_subscribe(handle))).is_err() {
            self.fail(Error::StreamFault("subscriber panicked in on_subscribe".into()));
        }
    }

    /// Delivers one item against one unit of credit. Returns `false` if the
    /// subscription is finished, before or because of this delivery.
    pub(crate) fn next(&mut self, item: T) -> bool {
        if self.is_finished() || self.credit == 0 {
            return false;
        }
        self.credit -= 1;
        let subscriber = &mut self.subscriber;
        if catch_unwind(AssertUnwindSafe(|| subscriber.on_next(item))).is_err() {
            warn!("subscriber panicked in on_next");
            self.fail(Error::StreamFault("subscriber panicked in on_next".into()));
            return false;
        }
        !self.is_finished()
    }

    /// Terminates with `error`, calling `on_error` once.
    pub(crate) fn fail(&mut self, error: Error) {
        if !self.set_state(SubscriptionState::Error) {
            return;
        }
        debug!(%error, "subscription failed");
        let subscriber = &mut self.subscriber;
        if catch_unwind(AssertUnwindSafe(|| subscriber.on_error(error))).is_err() {
            warn!("subscriber panicked in on_error");
        }
    }

    /// Terminates normally, calling `on_complete` once.
    pub(crate) fn complete(&mut self) {
        if !self.set_state(SubscriptionState::Complete) {
            return;
        }
        debug!("subscription complete");
        let subscriber = &mut self.subscriber;
        if catch_unwind(AssertUnwindSafe(|| subscriber.on_complete())).is_err() {
            warn!("subscriber panicked in on_complete");
        }
    }

    /// Marks the subscription cancelled without any callback.
    pub(crate) fn cancel(&mut self) {
        if self.set_state(SubscriptionState::Cancelled) {
            debug!("subscription cancelled");
        }
    }
}

/// Errors surfaced while streaming. Client errors (a bad filter) keep their
/// kind; anything else becomes a stream fault.
pub(crate) fn stream_fault(error: Error) -> Error {
    if error.is_client_error() || matches!(error, Error::StreamFault(_)) {
        error
    } else {
        Error::StreamFault(error.to_string())
    }
}

// =============================================================================
// Record Sources
// =============================================================================

/// Items pulled by one fetch. A source that hit an error returns the items
/// read before it along with the error.
#[derive(Debug)]
pub struct Batch<T> {
    pub items: Vec<T>,
    pub error: Option<Error>,
}

impl<T> Default for Batch<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            error: None,
        }
    }
}

/// A synchronous, possibly blocking source of records.
pub trait RecordSource<T>: Send + 'static {
    /// Pulls up to `max` items. Fewer than `max` means the source is
    /// exhausted.
    fn fetch(&mut self, max: usize) -> Batch<T>;
}

type Opener<T> = Box<dyn FnOnce() -> Result<ItemIter<T>> + Send>;

enum SourceState<T> {
    Pending(Opener<T>),
    Open(ItemIter<T>),
    Done,
}

/// [`RecordSource`] over a lazily opened iterator.
///
/// The opener runs inside the first fetch, so the store query itself
/// executes on the blocking pool.
pub struct IterSource<T> {
    state: SourceState<T>,
}

impl<T: Send + 'static> IterSource<T> {
    /// Source whose iterator is produced by `open` on first fetch.
    pub fn deferred(open: impl FnOnce() -> Result<ItemIter<T>> + Send + 'static) -> Self {
        Self {
            state: SourceState::Pending(Box::new(open)),
        }
    }

    /// Source over an in-memory sequence.
    pub fn from_items<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        let iter = items.into_iter().map(Ok);
        Self {
            state: SourceState::Open(Box::new(iter)),
        }
    }
}

impl<T: Send + 'static> RecordSource<T> for IterSource<T> {
    fn fetch(&mut self, max: usize) -> Batch<T> {
        if let SourceState::Pending(_) = self.state {
            let SourceState::Pending(open) = std::mem::replace(&mut self.state, SourceState::Done)
            else {
                return Batch::default();
            };
            match open() {
                Ok(iter) => self.state = SourceState::Open(iter),
                Err(error) => {
                    return Batch {
                        items: Vec::new(),
                        error: Some(error),
                    }
                }
            }
        }

        let SourceState::Open(iter) = &mut self.state else {
            return Batch::default();
        };
        let mut batch = Batch {
            items: Vec::with_capacity(max),
            error: None,
        };
        let mut finished = false;
        while batch.items.len() < max {
            match iter.next() {
                Some(Ok(item)) => batch.items.push(item),
                Some(Err(error)) => {
                    batch.error = Some(error);
                    finished = true;
                    break;
                }
                None => {
                    finished = true;
                    break;
                }
            }
        }
        if finished {
            self.state = SourceState::Done;
        }
        batch
    }
}

// =============================================================================
// Replay Pacing
// =============================================================================

/// Releases items at the pace they were originally observed, scaled by
/// `speed`.
///
/// An item observed at `t` is released no earlier than
/// `(t - start) / speed` after the first request. Without an explicit start
/// the first item's time is used.
pub struct ReplayPacing<T> {
    start: Option<Timestamp>,
    speed: f64,
    time_of: Box<dyn Fn(&T) -> Timestamp + Send>,
}

impl<T> ReplayPacing<T> {
    pub fn new(speed: f64, time_of: impl Fn(&T) -> Timestamp + Send + 'static) -> Result<Self> {
        if !(speed.is_finite() && speed > 0.0) {
            return Err(Error::validation(format!(
                "replay speed must be positive, got {speed}"
            )));
        }
        Ok(Self {
            start: None,
            speed,
            time_of: Box::new(time_of),
        })
    }

    pub fn starting_at(mut self, start: Timestamp) -> Self {
        self.start = Some(start);
        self
    }

    fn offset(&self, start: Timestamp, item: &T) -> Duration {
        let elapsed_ms = (self.time_of)(item)
            .signed_duration_since(start)
            .num_milliseconds()
            .max(0);
        Duration::from_secs_f64(elapsed_ms as f64 / 1000.0 / self.speed)
    }
}

/// Pacing state of a running replay.
struct Pacer<T> {
    pacing: ReplayPacing<T>,
    anchor: Option<Instant>,
}

impl<T> Pacer<T> {
    fn is_due(&mut self, item: &T) -> bool {
        let Some(anchor) = self.anchor else {
            return false;
        };
        let start = *self
            .pacing
            .start
            .get_or_insert_with(|| (self.pacing.time_of)(item));
        Instant::now() >= anchor + self.pacing.offset(start, item)
    }
}

// =============================================================================
// Stream Subscription
// =============================================================================

/// Actor streaming the records of a [`RecordSource`] to a subscriber.
pub struct StreamSubscription<T, S> {
    source: Option<S>,
    in_flight: Option<JoinHandle<(S, Batch<T>)>>,
    queue: VecDeque<T>,
    pending_error: Option<Error>,
    exhausted: bool,
    requested: bool,
    batch_size: usize,
    low_water: usize,
    replay_tick: Duration,
    pacer: Option<Pacer<T>>,
    outlet: Outlet<T>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl<T, S> StreamSubscription<T, S>
where
    T: Send + 'static,
    S: RecordSource<T>,
{
    /// Starts streaming `source` to `subscriber` on the current runtime.
    pub fn spawn(
        source: S,
        subscriber: impl Subscriber<T>,
        config: &StreamingConfig,
    ) -> Subscription {
        Self::start(source, Box::new(subscriber), config, None)
    }

    /// Like [`spawn`](Self::spawn), releasing items at their recorded pace.
    pub fn spawn_replay(
        source: S,
        subscriber: impl Subscriber<T>,
        config: &StreamingConfig,
        pacing: ReplayPacing<T>,
    ) -> Subscription {
        let pacer = Pacer {
            pacing,
            anchor: None,
        };
        Self::start(source, Box::new(subscriber), config, Some(pacer))
    }

    fn start(
        source: S,
        subscriber: Box<dyn Subscriber<T>>,
        config: &StreamingConfig,
        pacer: Option<Pacer<T>>,
    ) -> Subscription {
        let (handle, commands) = Subscription::channel();
        let batch_size = config.batch_size.max(1);
        let actor = Self {
            source: Some(source),
            in_flight: None,
            queue: VecDeque::with_capacity(batch_size),
            pending_error: None,
            exhausted: false,
            requested: false,
            batch_size,
            low_water: batch_size / 3,
            replay_tick: config.replay_tick,
            pacer,
            outlet: Outlet::new(subscriber, &handle),
            commands,
        };
        tokio::spawn(actor.run(handle.clone()));
        handle
    }

    async fn run(mut self, handle: Subscription) {
        // keeps the command channel open once callers drop their handles
        self.outlet.subscribe(handle.clone());

        let mut ticker = tokio::time::interval(self.replay_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.outlet.is_finished() {
            let paced = self.pacer.is_some() && !self.queue.is_empty();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Request(n)) => self.on_request(n),
                    Some(Command::Cancel) => self.outlet.cancel(),
                    None => break,
                    Some(Command::TimedOut) => {}
                },
                fetched = join_in_flight(&mut self.in_flight), if self.in_flight.is_some() => {
                    self.on_fetched(fetched);
                }
                _ = ticker.tick(), if paced => self.pump(),
            }
        }
        trace!(state = ?self.outlet.state(), "subscription actor stopped");
    }

    fn on_request(&mut self, n: u64) {
        if n == 0 {
            self.outlet.fail(Error::InvalidRequest(
                "request(n) requires n > 0".into(),
            ));
            return;
        }
        if !self.requested {
            self.requested = true;
            if let Some(pacer) = &mut self.pacer {
                pacer.anchor = Some(Instant::now());
            }
        }
        self.outlet.add_credit(n);
        self.pump();
    }

    fn on_fetched(&mut self, fetched: std::result::Result<(S, Batch<T>), JoinError>) {
        self.in_flight = None;
        match fetched {
            Ok((source, batch)) => {
                trace!(count = batch.items.len(), "batch fetched");
                if batch.items.len() < self.batch_size || batch.error.is_some() {
                    self.exhausted = true;
                } else {
                    self.source = Some(source);
                }
                self.queue.extend(batch.items);
                self.pending_error = batch.error.map(stream_fault);
                self.pump();
            }
            Err(error) => {
                self.outlet
                    .fail(Error::StreamFault(format!("fetch task failed: {error}")));
            }
        }
    }

    /// Delivers what credit and pacing allow, then completes, fails or
    /// schedules the next fetch.
    fn pump(&mut self) {
        if self.outlet.is_finished() {
            return;
        }
        if !self.queue.is_empty() && self.outlet.has_credit() {
            self.outlet.set_state(SubscriptionState::Draining);
        }
        while self.outlet.has_credit() {
            let Some(front) = self.queue.front() else {
                break;
            };
            if let Some(pacer) = &mut self.pacer {
                if !pacer.is_due(front) {
                    break;
                }
            }
            let Some(item) = self.queue.pop_front() else {
                break;
            };
            if !self.outlet.next(item) {
                return;
            }
        }

        if self.queue.is_empty() && self.exhausted {
            match self.pending_error.take() {
                Some(error) => self.outlet.fail(error),
                None => self.outlet.complete(),
            }
            return;
        }

        self.maybe_fetch();
        let state = if self.in_flight.is_some() {
            SubscriptionState::Fetching
        } else {
            SubscriptionState::Idle
        };
        self.outlet.set_state(state);
    }

    fn maybe_fetch(&mut self) {
        if !self.requested || self.exhausted || self.in_flight.is_some() {
            return;
        }
        if self.queue.len() > self.low_water {
            return;
        }
        let Some(mut source) = self.source.take() else {
            return;
        };
        let max = self.batch_size;
        trace!(max, credit = self.outlet.credit(), "fetching batch");
        self.in_flight = Some(tokio::task::spawn_blocking(move || {
            let batch = source.fetch(max);
            (source, batch)
        }));
    }
}

async fn join_in_flight<R>(
    task: &mut Option<JoinHandle<R>>,
) -> std::result::Result<R, JoinError> {
    match task {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

// =============================================================================
// Adapters
// =============================================================================

/// Subscriber forwarding mapped items to another subscriber.
pub struct MapSubscriber<A, B, S, F> {
    inner: S,
    map: F,
    _marker: PhantomData<fn(A) -> B>,
}

impl<A, B, S, F> MapSubscriber<A, B, S, F>
where
    S: Subscriber<B>,
    F: FnMut(A) -> B + Send + 'static,
{
    pub fn new(inner: S, map: F) -> Self {
        Self {
            inner,
            map,
            _marker: PhantomData,
        }
    }
}

impl<A, B, S, F> Subscriber<A> for MapSubscriber<A, B, S, F>
where
    A: 'static,
    B: 'static,
    S: Subscriber<B>,
    F: FnMut(A) -> B + Send + 'static,
{
    fn on_subscribe(&mut self, subscription: Subscription) {
        self.inner.on_subscribe(subscription);
    }

    fn on_next(&mut self, item: A) {
        let mapped = (self.map)(item);
        self.inner.on_next(mapped);
    }

    fn on_error(&mut self, error: Error) {
        self.inner.on_error(error);
    }

    fn on_complete(&mut self) {
        self.inner.on_complete();
    }
}

// -----------------------------------------------------------------------------
// futures::Stream adapter
// -----------------------------------------------------------------------------

enum Signal<T> {
    Subscribed(Subscription),
    Next(T),
    Error(Error),
    Complete,
}

/// Subscriber half of a [`SubscriptionStream`].
pub struct ChannelSubscriber<T> {
    tx: mpsc::UnboundedSender<Signal<T>>,
}

impl<T: Send + 'static> Subscriber<T> for ChannelSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Subscription) {
        let _ = self.tx.send(Signal::Subscribed(subscription));
    }

    fn on_next(&mut self, item: T) {
        let _ = self.tx.send(Signal::Next(item));
    }

    fn on_error(&mut self, error: Error) {
        let _ = self.tx.send(Signal::Error(error));
    }

    fn on_complete(&mut self) {
        let _ = self.tx.send(Signal::Complete);
    }
}

/// A subscription consumed as a `futures::Stream`.
///
/// Keeps up to `window` items requested ahead and tops the window up once
/// half of it has been consumed. Dropping the stream cancels the
/// subscription.
///
/// ```rust,ignore
/// use futures::StreamExt;
///
/// let (subscriber, mut stream) = SubscriptionStream::channel(64);
/// StreamSubscription::spawn(source, subscriber, &config);
/// while let Some(item) = stream.next().await {
///     let obs = item?;
/// }
/// ```
pub struct SubscriptionStream<T> {
    rx: mpsc::UnboundedReceiver<Signal<T>>,
    subscription: Option<Subscription>,
    window: u64,
    outstanding: u64,
    done: bool,
}

impl<T> Unpin for SubscriptionStream<T> {}

impl<T: Send + 'static> SubscriptionStream<T> {
    pub fn channel(window: u64) -> (ChannelSubscriber<T>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stream = Self {
            rx,
            subscription: None,
            window: window.max(1),
            outstanding: 0,
            done: false,
        };
        (ChannelSubscriber { tx }, stream)
    }
}

impl<T> SubscriptionStream<T> {
    /// The underlying subscription, once the actor has started.
    pub fn subscription(&self) -> Option<&Subscription> {
        self.subscription.as_ref()
    }
}

impl<T> Stream for SubscriptionStream<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        loop {
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(Signal::Subscribed(subscription))) => {
                    subscription.request(this.window);
                    this.outstanding = this.window;
                    this.subscription = Some(subscription);
                }
                Poll::Ready(Some(Signal::Next(item))) => {
                    this.outstanding = this.outstanding.saturating_sub(1);
                    if this.outstanding <= this.window / 2 {
                        if let Some(subscription) = &this.subscription {
                            subscription.request(this.window - this.outstanding);
                        }
                        this.outstanding = this.window;
                    }
                    return Poll::Ready(Some(Ok(item)));
                }
                Poll::Ready(Some(Signal::Error(error))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(error)));
                }
                Poll::Ready(Some(Signal::Complete)) | Poll::Ready(None) => {
                    this.done = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<T> Drop for SubscriptionStream<T> {
    fn drop(&mut self) {
        if !self.done {
            if let Some(subscription) = &self.subscription {
                subscription.cancel();
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
