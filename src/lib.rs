//! # ObsDB - Observation Datastore and Streaming Engine
//!
//! ObsDB stores time-series observations produced by procedures (sensors,
//! models, processes) about features of interest, and streams query results
//! to slow or fast consumers without blocking either side. It provides:
//!
//! - **A filter algebra**: composable, intersectable filters over features,
//!   procedures, data streams and observations
//! - **In-memory stores**: keyed, versioned, cross-linked through nested
//!   filters, with statistics and snapshots
//! - **Backpressured streaming**: credit-controlled subscriptions bridging
//!   blocking store reads to async consumers
//! - **Live feeds**: event-bus subscriptions with idle timeouts
//! - **Non-blocking output**: buffered writes toward a transport that signals
//!   readiness
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Providers                              │
//! │            (historical, replay, live; ObservationQuery)         │
//! └──────────────┬──────────────────────────────────┬───────────────┘
//!                │ filters                          │ topics
//!                ▼                                  ▼
//! ┌──────────────────────────────┐   ┌──────────────────────────────┐
//! │      ObsDatabase             │   │      EventBus                │
//! │  procedures  fois            │   │  latest record per output    │
//! │  datastreams observations    │   │                              │
//! └──────────────┬───────────────┘   └──────────────┬───────────────┘
//!                │ spawn_blocking fetch             │ broadcast
//!                ▼                                  ▼
//! ┌──────────────────────────────┐   ┌──────────────────────────────┐
//! │   StreamSubscription actor   │   │  LiveSubscription actor      │
//! │   queue + credit + replay    │   │  queue + credit + timeout    │
//! └──────────────┬───────────────┘   └──────────────┬───────────────┘
//!                └────────────────┬─────────────────┘
//!                                 ▼
//!              Subscriber (e.g. AsyncRecordWriter ──► BufferedAsyncOutput)
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Credit**: a subscriber never receives more items than it requested
//! 2. **Order**: items arrive in store order (phenomenon time, then result time)
//! 3. **Single terminal signal**: `on_complete` or `on_error`, at most once
//! 4. **Cancellation is final**: nothing is delivered after `cancel()` returns
//! 5. **No blocking on the caller**: store reads run on the blocking pool
//!
//! ## Module Organization
//!
//! - [`error`]: the crate's error type
//! - [`config`]: streaming tunables, loadable from JSON
//! - [`types`]: identity keys and time primitives
//! - [`data`]: features, data streams, observations and records
//! - [`filter`]: the filter algebra
//! - [`store`]: store traits and in-memory implementations
//! - [`subscription`]: credit-controlled streaming from store queries
//! - [`event`], [`live`]: the event bus and live subscriptions
//! - [`timeout`]: the shared idle-timeout monitor
//! - [`output`], [`writer`]: buffered output and the record writer
//! - [`provider`]: query entry points for a service layer

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for ObsDB operations.
pub mod error;

/// Streaming configuration.
pub mod config;

mod builder;

/// Identity and time types.
///
/// Feature keys pair an internal id with a unique id and a validity start
/// time; observation keys add the phenomenon and result times.
pub mod types;

/// Domain values: features, data stream descriptions, observations and
/// result records.
pub mod data;

/// Observation statistics and clusters.
pub mod stats;

/// Composable query filters.
///
/// Every filter can be intersected with another of the same kind. An
/// intersection that can match nothing is an [`Error::EmptyIntersection`].
pub mod filter;

/// Store contracts and in-memory stores.
///
/// The main entry point is [`ObsDatabase`](store::ObsDatabase), which owns
/// and links the four stores so nested filters resolve across them.
pub mod store;

/// Streaming subscriptions with backpressure.
///
/// See [`StreamSubscription`](subscription::StreamSubscription) for store
/// queries and [`SubscriptionStream`](subscription::SubscriptionStream) for
/// consuming a subscription as a `futures::Stream`.
pub mod subscription;

/// In-process publish/subscribe for live data.
pub mod event;

/// Live subscriptions over the event bus.
pub mod live;

/// Shared idle-timeout monitor.
pub mod timeout;

/// Non-blocking buffered output.
pub mod output;

/// Subscriber serializing records onto a buffered output.
pub mod writer;

/// Historical and live data providers.
pub mod provider;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::StreamingConfig;
pub use error::{Error, Result};
pub use store::ObsDatabase;

pub use data::{
    DataBlock, DataStreamInfo, DataType, DataValue, Feature, ObsData, RecordEncoding,
    RecordField, RecordSchema,
};
pub use types::{DataStreamKey, FeatureId, FeatureKey, ObsKey, TimeExtent, Timestamp};

pub use event::{DataEvent, EventBus, Topic};
pub use live::{LiveRequest, LiveSubscription};
pub use output::{AsyncTransport, BufferedAsyncOutput, WriteListener};
pub use provider::{HistoricalProvider, LiveProvider, Observation, ObservationQuery};
pub use subscription::{
    StreamSubscription, Subscriber, Subscription, SubscriptionState, SubscriptionStream,
};
pub use timeout::{TimeoutHandle, TimeoutMonitor};
pub use writer::{AsyncRecordWriter, RecordEncoder, TextResultEncoder, WriterStatus};
