//! # Event Bus
//!
//! Publish/subscribe channel for live data. Each procedure output is one
//! topic; publishing an event fans it out to every live subscriber of that
//! topic and remembers it as the topic's latest record.
//!
//! ```text
//!   producer ──publish──► Topic("urn:sensor:1", "weather")
//!                              │  broadcast (bounded)
//!                   ┌──────────┼──────────┐
//!                   ▼          ▼          ▼
//!              receiver    receiver    latest record
//! ```
//!
//! ## Rust Concepts
//!
//! - **`tokio::sync::broadcast`**: every receiver sees every event sent after
//!   it subscribed. A receiver that falls more than `capacity` events behind
//!   gets `RecvError::Lagged` and has lost data.
//! - **`Arc` payloads**: events are cloned once per receiver, so the record
//!   blocks are shared rather than copied.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use crate::data::{DataBlock, RecordSchema};
use crate::types::Timestamp;

// =============================================================================
// Topic
// =============================================================================

/// One procedure output: `(procedure uid, output name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic {
    procedure_uid: String,
    output_name: String,
}

impl Topic {
    pub fn new(procedure_uid: impl Into<String>, output_name: impl Into<String>) -> Self {
        Self {
            procedure_uid: procedure_uid.into(),
            output_name: output_name.into(),
        }
    }

    pub fn procedure_uid(&self) -> &str {
        &self.procedure_uid
    }

    pub fn output_name(&self) -> &str {
        &self.output_name
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.procedure_uid, self.output_name)
    }
}

// =============================================================================
// Data Event
// =============================================================================

/// A batch of records produced by one output.
#[derive(Debug, Clone)]
pub struct DataEvent {
    topic: Topic,
    foi_uid: Option<String>,
    sampling_time: Timestamp,
    publish_time: Timestamp,
    records: Arc<Vec<DataBlock>>,
}

impl DataEvent {
    /// Creates an event sampled at `sampling_time`; the publish time is set
    /// to now.
    pub fn new(topic: Topic, sampling_time: Timestamp, records: Vec<DataBlock>) -> Self {
        Self {
            topic,
            foi_uid: None,
            sampling_time,
            publish_time: chrono::Utc::now(),
            records: Arc::new(records),
        }
    }

    pub fn with_foi(mut self, foi_uid: impl Into<String>) -> Self {
        self.foi_uid = Some(foi_uid.into());
        self
    }

    pub fn with_publish_time(mut self, publish_time: Timestamp) -> Self {
        self.publish_time = publish_time;
        self
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn foi_uid(&self) -> Option<&str> {
        self.foi_uid.as_deref()
    }

    pub fn sampling_time(&self) -> Timestamp {
        self.sampling_time
    }

    pub fn publish_time(&self) -> Timestamp {
        self.publish_time
    }

    pub fn records(&self) -> &[DataBlock] {
        &self.records
    }
}

// =============================================================================
// Event Bus
// =============================================================================

#[derive(Debug)]
struct TopicState {
    sender: broadcast::Sender<DataEvent>,
    latest: Option<DataEvent>,
    schema: Option<RecordSchema>,
}

/// In-process event bus keyed by [`Topic`].
#[derive(Debug)]
pub struct EventBus {
    capacity: usize,
    topics: RwLock<HashMap<Topic, TopicState>>,
}

impl EventBus {
    /// Creates a bus whose per-topic broadcast channels hold `capacity`
    /// events.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: RwLock::new(HashMap::new()),
        }
    }

    fn new_topic(&self) -> TopicState {
        let (sender, _) = broadcast::channel(self.capacity);
        TopicState {
            sender,
            latest: None,
            schema: None,
        }
    }

    /// Declares an output and the structure of its records.
    pub fn register_output(&self, topic: Topic, schema: RecordSchema) {
        debug!(%topic, "output registered");
        let mut topics = self.topics.write();
        let state = topics.entry(topic).or_insert_with(|| self.new_topic());
        state.schema = Some(schema);
    }

    /// Record structure declared for `topic`, if any.
    pub fn output_schema(&self, topic: &Topic) -> Option<RecordSchema> {
        self.topics.read().get(topic).and_then(|t| t.schema.clone())
    }

    /// Every known topic, sorted.
    pub fn topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self.topics.read().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Publishes an event, returning how many receivers it reached.
    pub fn publish(&self, event: DataEvent) -> usize {
        let mut topics = self.topics.write();
        let state = topics
            .entry(event.topic.clone())
            .or_insert_with(|| self.new_topic());
        state.latest = Some(event.clone());
        // no receivers is not an error
        state.sender.send(event).unwrap_or(0)
    }

    /// New receiver for events published on `topic` from now on.
    pub fn subscribe(&self, topic: &Topic) -> broadcast::Receiver<DataEvent> {
        let mut topics = self.topics.write();
        topics
            .entry(topic.clone())
            .or_insert_with(|| self.new_topic())
            .sender
            .subscribe()
    }

    /// Most recent event published on `topic`.
    pub fn latest_record(&self, topic: &Topic) -> Option<DataEvent> {
        self.topics.read().get(topic).and_then(|t| t.latest.clone())
    }

    /// Number of live receivers on `topic`.
    pub fn receiver_count(&self, topic: &Topic) -> usize {
        self.topics
            .read()
            .get(topic)
            .map_or(0, |t| t.sender.receiver_count())
    }
}

// =============================================================================
// Tests
// =============================================================================
