//! # Live Subscriptions
//!
//! Streams records published on the [`EventBus`] to a subscriber under the
//! same credit protocol as historical queries.
//!
//! ```text
//!   spawn():
//!     1. subscribe a receiver per topic
//!     2. queue each topic's latest record ("current value")
//!     3. start one forwarding task per receiver
//!
//!   receiver ──forward──┐
//!   receiver ──forward──┼──► mpsc ──► actor: filter ──► queue ──credit──► Subscriber
//!   receiver ──forward──┘                 ▲
//!                      TimeoutMonitor ────┘ TimedOut
//! ```
//!
//! Receivers are subscribed before the latest records are read, so an event
//! published in between is seen at least once; duplicates of a latest record
//! are recognized by their publish time and skipped.
//!
//! ## Termination
//!
//! | Trigger                                  | Outcome                        |
//! |------------------------------------------|--------------------------------|
//! | no event within `live_data_timeout`      | completes after queue drains   |
//! | event sampled after the requested window | completes after queue drains   |
//! | latest-only request                      | completes after latest records |
//! | queue above `live_queue_capacity`        | `CapacityExceeded`             |
//! | broadcast receiver lagged                | `CapacityExceeded`             |
//!
//! Events for an FOI that was not requested, or sampled before the window,
//! are dropped silently.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::StreamingConfig;
use crate::data::DataBlock;
use crate::error::{Error, Result};
use crate::event::{DataEvent, EventBus, Topic};
use crate::subscription::{Command, Outlet, Subscriber, Subscription, SubscriptionState};
use crate::timeout::{TimeoutHandle, TimeoutMonitor};
use crate::types::{TimeExtent, Timestamp};

/// What a live subscription listens to.
#[derive(Debug, Clone, Default)]
pub struct LiveRequest {
    pub topics: Vec<Topic>,
    /// Unique ids of accepted features of interest; `None` accepts all.
    pub foi_uids: Option<BTreeSet<String>>,
    /// Accepted sampling times; `None` accepts all.
    pub window: Option<TimeExtent>,
    /// Send the latest record of each topic, then complete.
    pub latest_only: bool,
}

impl LiveRequest {
    pub fn new(topics: Vec<Topic>) -> Self {
        Self {
            topics,
            ..Self::default()
        }
    }

    fn accepts_foi(&self, event: &DataEvent) -> bool {
        match (&self.foi_uids, event.foi_uid()) {
            (None, _) => true,
            (Some(uids), Some(uid)) => uids.contains(uid),
            (Some(_), None) => false,
        }
    }
}

/// Actor streaming event-bus records to one subscriber.
pub struct LiveSubscription {
    request: LiveRequest,
    queue: VecDeque<DataBlock>,
    capacity: usize,
    events: mpsc::Receiver<Result<DataEvent>>,
    forwarders: Vec<JoinHandle<()>>,
    seen: HashMap<Topic, Timestamp>,
    exhausted: bool,
    last_activity: Arc<Mutex<Instant>>,
    timeout: Option<TimeoutHandle>,
    outlet: Outlet<DataBlock>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl LiveSubscription {
    /// Starts a live subscription on the current runtime.
    ///
    /// Fails synchronously if the request names no topic.
    pub fn spawn(
        bus: &EventBus,
        request: LiveRequest,
        subscriber: impl Subscriber<DataBlock>,
        config: &StreamingConfig,
        monitor: &TimeoutMonitor,
    ) -> Result<Subscription> {
        if request.topics.is_empty() {
            return Err(Error::validation("live request names no output"));
        }

        let (handle, commands) = Subscription::channel();
        let capacity = config.live_queue_capacity.max(1);
        let (events_tx, events) = mpsc::channel(capacity);

        let receivers: Vec<broadcast::Receiver<DataEvent>> = if request.latest_only {
            Vec::new()
        } else {
            request.topics.iter().map(|topic| bus.subscribe(topic)).collect()
        };

        let mut queue = VecDeque::new();
        let mut seen = HashMap::new();
        for topic in &request.topics {
            let Some(latest) = bus.latest_record(topic) else {
                continue;
            };
            seen.insert(topic.clone(), latest.publish_time());
            if request.accepts_foi(&latest) {
                queue.extend(latest.records().iter().cloned());
            }
        }

        let lag_capacity = config.event_bus_capacity;
        let forwarders = receivers
            .into_iter()
            .map(|rx| tokio::spawn(forward(rx, events_tx.clone(), lag_capacity)))
            .collect();

        let last_activity = Arc::new(Mutex::new(Instant::now()));
        let timeout = (!request.latest_only).then(|| {
            let activity = Arc::clone(&last_activity);
            let notify = handle.clone();
            let idle = config.live_data_timeout;
            monitor.register(move || {
                if notify.state().is_terminal() {
                    return true;
                }
                if activity.lock().elapsed() < idle {
                    return false;
                }
                notify.notify_timed_out();
                true
            })
        });

        debug!(
            topics = request.topics.len(),
            latest = queue.len(),
            latest_only = request.latest_only,
            "live subscription started"
        );

        let exhausted = request.latest_only;
        let actor = Self {
            request,
            queue,
            capacity,
            events,
            forwarders,
            seen,
            exhausted,
            last_activity,
            timeout,
            outlet: Outlet::new(Box::new(subscriber), &handle),
            commands,
        };
        tokio::spawn(actor.run(handle.clone()));
        Ok(handle)
    }

    async fn run(mut self, handle: Subscription) {
        // keeps the command channel open once callers drop their handles
        self.outlet.subscribe(handle.clone());
        self.pump();

        while !self.outlet.is_finished() {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Request(n)) => self.on_request(n),
                    Some(Command::Cancel) => self.outlet.cancel(),
                    None => break,
                    Some(Command::TimedOut) => {
                        debug!("live subscription idle, completing");
                        self.stop_listening();
                    }
                },
                event = self.events.recv(), if !self.exhausted => match event {
                    Some(Ok(event)) => self.on_event(event),
                    Some(Err(error)) => self.outlet.fail(error),
                    None => self.stop_listening(),
                },
            }
        }

        self.stop_forwarders();
        if let Some(timeout) = self.timeout.take() {
            timeout.cancel();
        }
        trace!(state = ?self.outlet.state(), "live subscription stopped");
    }

    fn on_request(&mut self, n: u64) {
        if n == 0 {
            self.outlet
                .fail(Error::InvalidRequest("request(n) requires n > 0".into()));
            return;
        }
        self.outlet.add_credit(n);
        self.pump();
    }

    fn on_event(&mut self, event: DataEvent) {
        *self.last_activity.lock() = Instant::now();

        if let Some(latest) = self.seen.get(event.topic()) {
            if event.publish_time() <= *latest {
                return;
            }
        }
        if !self.request.accepts_foi(&event) {
            return;
        }
        if let Some(window) = &self.request.window {
            if event.sampling_time() > window.end() {
                debug!(topic = %event.topic(), "event past requested window, completing");
                self.stop_listening();
                return;
            }
            if event.sampling_time() < window.begin() {
                return;
            }
        }

        self.queue.extend(event.records().iter().cloned());
        if self.queue.len() > self.capacity {
            self.outlet.fail(Error::CapacityExceeded {
                what: "live queue",
                capacity: self.capacity,
            });
            return;
        }
        self.pump();
    }

    /// Stops taking events; the stream completes once the queue drains.
    fn stop_listening(&mut self) {
        self.exhausted = true;
        self.events.close();
        self.stop_forwarders();
        self.pump();
    }

    fn stop_forwarders(&mut self) {
        for forwarder in self.forwarders.drain(..) {
            forwarder.abort();
        }
    }

    fn pump(&mut self) {
        if self.outlet.is_finished() {
            return;
        }
        while self.outlet.has_credit() {
            let Some(item) = self.queue.pop_front() else {
                break;
            };
            if !self.outlet.next(item) {
                return;
            }
        }
        if self.queue.is_empty() && self.exhausted {
            self.outlet.complete();
            return;
        }
        self.outlet.set_state(SubscriptionState::Idle);
    }
}

async fn forward(
    mut rx: broadcast::Receiver<DataEvent>,
    tx: mpsc::Sender<Result<DataEvent>>,
    capacity: usize,
) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                if tx.send(Ok(event)).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                debug!(missed, "live receiver lagged");
                let _ = tx
                    .send(Err(Error::CapacityExceeded {
                        what: "event bus receiver",
                        capacity,
                    }))
                    .await;
                break;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataValue;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct Log {
        items: Vec<f64>,
        errors: Vec<String>,
        completions: usize,
    }

    struct Recorder {
        log: Arc<Mutex<Log>>,
        first: Option<u64>,
    }

    impl Subscriber<DataBlock> for Recorder {
        fn on_subscribe(&mut self, subscription: Subscription) {
            if let Some(n) = self.first {
                subscription.request(n);
            }
        }
        fn on_next(&mut self, item: DataBlock) {
            if let Some(DataValue::Double(v)) = item.get(0) {
                self.log.lock().items.push(*v);
            }
        }
        fn on_error(&mut self, error: Error) {
            self.log.lock().errors.push(error.to_string());
        }
        fn on_complete(&mut self) {
            self.log.lock().completions += 1;
        }
    }

    fn recorder(first: Option<u64>) -> (Recorder, Arc<Mutex<Log>>) {
        let log = Arc::new(Mutex::new(Log::default()));
        (
            Recorder {
                log: Arc::clone(&log),
                first,
            },
            log,
        )
    }

    fn topic() -> Topic {
        Topic::new("urn:sensor:1", "weather")
    }

    fn event(secs: i64) -> DataEvent {
        DataEvent::new(
            topic(),
            Utc.timestamp_opt(secs, 0).unwrap(),
            vec![DataBlock::new(vec![DataValue::from(secs as f64)])],
        )
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_latest_record_then_new_events() {
        let bus = EventBus::new(16);
        let monitor = TimeoutMonitor::new();
        bus.publish(event(1));

        let (subscriber, log) = recorder(Some(10));
        LiveSubscription::spawn(
            &bus,
            LiveRequest::new(vec![topic()]),
            subscriber,
            &StreamingConfig::default(),
            &monitor,
        )
        .unwrap();
        settle().await;
        bus.publish(event(2));
        bus.publish(event(3));
        settle().await;

        assert_eq!(log.lock().items, vec![1.0, 2.0, 3.0]);
        assert_eq!(log.lock().completions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_completes() {
        let bus = EventBus::new(16);
        let monitor = TimeoutMonitor::new();
        let config = StreamingConfig {
            live_data_timeout: Duration::from_secs(10),
            ..StreamingConfig::default()
        };
        let (subscriber, log) = recorder(Some(10));
        let handle = LiveSubscription::spawn(
            &bus,
            LiveRequest::new(vec![topic()]),
            subscriber,
            &config,
            &monitor,
        )
        .unwrap();
        settle().await;
        bus.publish(event(1));
        settle().await;

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(monitor.tick(), 0);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(monitor.tick(), 1);
        settle().await;

        let log = log.lock();
        assert_eq!(log.items, vec![1.0]);
        assert_eq!(log.completions, 1);
        assert!(log.errors.is_empty());
        assert_eq!(handle.state(), SubscriptionState::Complete);
        assert_eq!(bus.receiver_count(&topic()), 0);
    }

    #[tokio::test]
    async fn test_filters_foi_and_window() {
        let bus = EventBus::new(16);
        let monitor = TimeoutMonitor::new();
        let request = LiveRequest {
            topics: vec![topic()],
            foi_uids: Some(BTreeSet::from(["urn:foi:a".to_string()])),
            window: Some(
                TimeExtent::new(
                    Utc.timestamp_opt(10, 0).unwrap(),
                    Utc.timestamp_opt(20, 0).unwrap(),
                )
                .unwrap(),
            ),
            latest_only: false,
        };
        let (subscriber, log) = recorder(Some(10));
        LiveSubscription::spawn(&bus, request, subscriber, &StreamingConfig::default(), &monitor)
            .unwrap();
        settle().await;

        bus.publish(event(12).with_foi("urn:foi:b"));
        bus.publish(event(5).with_foi("urn:foi:a"));
        bus.publish(event(15).with_foi("urn:foi:a"));
        bus.publish(event(25).with_foi("urn:foi:a"));
        bus.publish(event(16).with_foi("urn:foi:a"));
        settle().await;

        let log = log.lock();
        assert_eq!(log.items, vec![15.0]);
        assert_eq!(log.completions, 1);
    }

    #[tokio::test]
    async fn test_latest_only_completes() {
        let bus = EventBus::new(16);
        let monitor = TimeoutMonitor::new();
        bus.publish(event(1));
        bus.publish(event(2));

        let request = LiveRequest {
            latest_only: true,
            ..LiveRequest::new(vec![topic(), Topic::new("urn:sensor:2", "weather")])
        };
        let (subscriber, log) = recorder(Some(10));
        LiveSubscription::spawn(&bus, request, subscriber, &StreamingConfig::default(), &monitor)
            .unwrap();
        settle().await;

        assert_eq!(log.lock().items, vec![2.0]);
        assert_eq!(log.lock().completions, 1);
        assert!(monitor.is_empty());
    }

    #[tokio::test]
    async fn test_queue_overflow_fails() {
        let bus = EventBus::new(16);
        let monitor = TimeoutMonitor::new();
        let config = StreamingConfig {
            live_queue_capacity: 2,
            ..StreamingConfig::default()
        };
        let (subscriber, log) = recorder(None);
        LiveSubscription::spawn(&bus, LiveRequest::new(vec![topic()]), subscriber, &config, &monitor)
            .unwrap();
        settle().await;
        for secs in 0..3 {
            bus.publish(event(secs));
            settle().await;
        }

        let log = log.lock();
        assert!(log.items.is_empty());
        assert_eq!(log.errors.len(), 1);
        assert!(log.errors[0].contains("live queue"));
    }

    #[tokio::test]
    async fn test_lagging_receiver_fails() {
        let bus = EventBus::new(1);
        let monitor = TimeoutMonitor::new();
        let (subscriber, log) = recorder(Some(100));
        LiveSubscription::spawn(
            &bus,
            LiveRequest::new(vec![topic()]),
            subscriber,
            &StreamingConfig::default(),
            &monitor,
        )
        .unwrap();
        for secs in 0..5 {
            bus.publish(event(secs));
        }
        settle().await;

        let log = log.lock();
        assert_eq!(log.errors.len(), 1);
        assert!(log.errors[0].contains("event bus receiver"));
    }

    #[test]
    fn test_empty_request_rejected() {
        let bus = EventBus::new(1);
        let monitor = TimeoutMonitor::new();
        let (subscriber, _) = recorder(None);
        let result = LiveSubscription::spawn(
            &bus,
            LiveRequest::default(),
            subscriber,
            &StreamingConfig::default(),
            &monitor,
        );
        assert!(matches!(result, Err(Error::Validation(_))));
    }
}
