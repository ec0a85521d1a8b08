//! # Error Handling for obsdb
//!
//! This module defines the error types used throughout obsdb. A single error
//! enum ([`Error`]) represents every failure mode, from a filter builder
//! rejecting a malformed key to a store read failing in the middle of a stream.
//!
//! ## Rust Pattern: thiserror
//!
//! `thiserror` derives `std::error::Error` and `Display` from the
//! `#[error(...)]` attributes, and `#[from]` generates the `From` impls that
//! let `?` convert I/O and JSON errors automatically.
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Client | Validation, EmptyIntersection, InvalidRequest | Reject the query (client error) |
//! | Stream | StreamFault, CapacityExceeded | Abort the response (server error) |
//! | Store | ReadOnly, NotFound, Duplicate | Report to the caller |
//! | Internal | Io, Json, Closed | Log and investigate |
//!
//! Idle timeouts on live feeds are deliberately absent from this list: they
//! end a stream with `on_complete`, not with an error.

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in obsdb operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Client Errors (the query or object is malformed)
    // =========================================================================

    /// A builder's required invariant was violated at `build()` time.
    ///
    /// # When This Happens
    ///
    /// - A `FeatureKey` with neither an internal id nor a unique id
    /// - A `DataStreamInfo` without a record schema
    /// - A builder whose `build()` was already called once
    #[error("validation error: {0}")]
    Validation(String),

    /// Two filters being ANDed together can never match the same record.
    ///
    /// # Recovery
    ///
    /// The composer decides: either answer with an empty result or reject the
    /// combined query. obsdb never makes that choice on the caller's behalf.
    #[error("empty intersection: {0}")]
    EmptyIntersection(String),

    /// A subscriber asked for a non-positive number of items.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The operation is valid but not implemented for these operands
    /// (e.g. intersecting two non-polygonal regions).
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    // =========================================================================
    // Stream Errors (terminate the current stream or connection)
    // =========================================================================

    /// Reading from the backing store, or delivering to a subscriber, failed
    /// while a stream was running.
    ///
    /// # Systems Concept: Exactly-Once Failure
    ///
    /// A stream fault is delivered once through `Subscriber::on_error` and
    /// terminates the subscription. It is never retried automatically.
    #[error("stream fault: {0}")]
    StreamFault(String),

    /// A bounded queue or buffer received more data than it can hold.
    ///
    /// This is fatal to the stream: the producer has no way to slow down other
    /// than the `request(n)` credit protocol, which was evidently not honored.
    #[error("capacity exceeded: {what} (capacity {capacity})")]
    CapacityExceeded {
        /// The queue or buffer that overflowed
        what: &'static str,
        /// Its fixed capacity
        capacity: usize,
    },

    // =========================================================================
    // Store Errors
    // =========================================================================

    /// A mutation was attempted on a read-only store.
    #[error("store is read-only")]
    ReadOnly,

    /// A referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An entity with the same unique id already exists.
    #[error("duplicate entity '{0}'")]
    Duplicate(String),

    // =========================================================================
    // Internal Errors (investigate and fix)
    // =========================================================================

    /// A background task or channel went away.
    #[error("closed: {0}")]
    Closed(String),

    /// I/O failure while writing output or reading a snapshot.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure for config or snapshots.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error was caused by the request rather than the server.
    ///
    /// The protocol layer maps client errors to client-error responses and
    /// everything else to aborted responses with server-error semantics.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::EmptyIntersection(_)
                | Error::InvalidRequest(_)
                | Error::Unsupported(_)
        )
    }

    /// Convenience constructor for validation failures.
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Convenience constructor for empty intersections.
    pub(crate) fn empty(msg: impl Into<String>) -> Self {
        Error::EmptyIntersection(msg.into())
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
