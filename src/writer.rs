//! # Async Record Writer
//!
//! Serializes a subscription's records onto a [`BufferedAsyncOutput`] one at
//! a time, only while the transport can take them.
//!
//! ```text
//!   subscription ──on_next──► queue ──(transport ready)──► encoder ──► output
//!        ▲                                                   │
//!        └──────────────── request(1) per written record ────┘
//!
//!   transport ready again ──► notify_ready() ──► output flushes ──► resume
//! ```
//!
//! ## Why One At A Time?
//!
//! The writer requests the next record only after the previous one has been
//! handed to the transport. A slow client therefore slows the subscription,
//! and from there the store fetches, instead of filling memory.
//!
//! ## Termination
//!
//! - Completion: `after_records`, then flush and close the transport.
//! - Subscription error: the transport is closed without trailer.
//! - Transport closed or a write failing: the subscription is cancelled.
//!
//! The outcome is published on a `watch` channel; see
//! [`AsyncRecordWriter::finished`].

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::data::{DataBlock, RecordEncoding};
use crate::error::{Error, Result};
use crate::output::{AsyncTransport, BufferedAsyncOutput, WriteListener};
use crate::subscription::{Subscriber, Subscription};

// =============================================================================
// Encoders
// =============================================================================

/// Serializes records of type `T` into bytes.
pub trait RecordEncoder<T>: Send + 'static {
    /// Header written before the first record.
    fn before_records(&mut self, out: &mut dyn io::Write) -> Result<()> {
        let _ = out;
        Ok(())
    }

    fn write_record(&mut self, record: &T, out: &mut dyn io::Write) -> Result<()>;

    /// Trailer written after the last record.
    fn after_records(&mut self, out: &mut dyn io::Write) -> Result<()> {
        let _ = out;
        Ok(())
    }
}

/// Delimited-text encoding of result blocks.
#[derive(Debug, Clone)]
pub struct TextResultEncoder {
    token_separator: String,
    block_separator: String,
}

impl TextResultEncoder {
    pub fn new(encoding: &RecordEncoding) -> Result<Self> {
        match encoding {
            RecordEncoding::Text {
                token_separator,
                block_separator,
            } => Ok(Self {
                token_separator: token_separator.clone(),
                block_separator: block_separator.clone(),
            }),
            other => Err(Error::Unsupported(format!(
                "text encoder cannot write {other:?} records"
            ))),
        }
    }
}

impl RecordEncoder<DataBlock> for TextResultEncoder {
    fn write_record(&mut self, record: &DataBlock, out: &mut dyn io::Write) -> Result<()> {
        for (i, value) in record.values().iter().enumerate() {
            if i > 0 {
                out.write_all(self.token_separator.as_bytes())?;
            }
            write!(out, "{value}")?;
        }
        out.write_all(self.block_separator.as_bytes())?;
        Ok(())
    }
}

/// Encodes records as one JSON array.
#[derive(Debug, Default, Clone)]
pub struct JsonArrayEncoder {
    written: u64,
}

impl JsonArrayEncoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<T: Serialize> RecordEncoder<T> for JsonArrayEncoder {
    fn before_records(&mut self, out: &mut dyn io::Write) -> Result<()> {
        out.write_all(b"[")?;
        Ok(())
    }

    fn write_record(&mut self, record: &T, out: &mut dyn io::Write) -> Result<()> {
        if self.written > 0 {
            out.write_all(b",")?;
        }
        serde_json::to_writer(&mut *out, record)?;
        self.written += 1;
        Ok(())
    }

    fn after_records(&mut self, out: &mut dyn io::Write) -> Result<()> {
        out.write_all(b"]")?;
        Ok(())
    }
}

// =============================================================================
// Writer
// =============================================================================

/// Outcome of a record writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterStatus {
    Running,
    /// Every record was written and the transport closed.
    Finished { records: u64 },
    /// The stream or the transport failed.
    Failed(String),
}

struct Pending<T, E> {
    encoder: E,
    queue: VecDeque<T>,
    subscription: Option<Subscription>,
    started: bool,
    completed: bool,
    records: u64,
    status: watch::Sender<WriterStatus>,
}

struct WriterInner<T, E, O> {
    output: BufferedAsyncOutput<O>,
    pending: Pending<T, E>,
}

/// Subscriber writing each record through a [`RecordEncoder`].
///
/// Clones share the same state: hand one to the subscription and keep one to
/// forward transport readiness with [`notify_ready`](Self::notify_ready).
pub struct AsyncRecordWriter<T, E, O> {
    inner: Arc<Mutex<WriterInner<T, E, O>>>,
    status: watch::Receiver<WriterStatus>,
}

impl<T, E, O> Clone for AsyncRecordWriter<T, E, O> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            status: self.status.clone(),
        }
    }
}

impl<T, E, O> AsyncRecordWriter<T, E, O>
where
    T: Send + 'static,
    E: RecordEncoder<T>,
    O: AsyncTransport,
{
    pub fn new(encoder: E, output: BufferedAsyncOutput<O>) -> Self {
        let (status_tx, status) = watch::channel(WriterStatus::Running);
        let pending = Pending {
            encoder,
            queue: VecDeque::new(),
            subscription: None,
            started: false,
            completed: false,
            records: 0,
            status: status_tx,
        };
        Self {
            inner: Arc::new(Mutex::new(WriterInner { output, pending })),
            status,
        }
    }

    /// Current outcome.
    pub fn status(&self) -> WriterStatus {
        self.status.borrow().clone()
    }

    /// Waits until the writer has finished or failed.
    pub async fn finished(&self) -> Result<u64> {
        let mut status = self.status.clone();
        loop {
            match &*status.borrow_and_update() {
                WriterStatus::Finished { records } => return Ok(*records),
                WriterStatus::Failed(reason) => return Err(Error::StreamFault(reason.clone())),
                WriterStatus::Running => {}
            }
            if status.changed().await.is_err() {
                return Err(Error::Closed("record writer dropped".into()));
            }
        }
    }

    /// Forwards a transport readiness signal.
    pub fn notify_ready(&self) {
        let mut inner = self.inner.lock();
        let WriterInner { output, pending } = &mut *inner;
        if let Err(error) = output.notify_ready(pending) {
            pending.abort(output, error);
        }
    }
}

impl<T, E> Pending<T, E> {
    fn is_done(&self) -> bool {
        !matches!(*self.status.borrow(), WriterStatus::Running)
    }

    /// Writes queued records while the transport is ready.
    fn write_pending<O: AsyncTransport>(&mut self, output: &mut BufferedAsyncOutput<O>) -> Result<()>
    where
        E: RecordEncoder<T>,
    {
        if self.is_done() {
            return Ok(());
        }
        if output.is_closed() {
            return Err(Error::Closed("transport closed by peer".into()));
        }
        let mut scratch = Vec::new();
        while output.is_ready() {
            let Some(record) = self.queue.pop_front() else {
                break;
            };
            if !self.started {
                self.encoder.before_records(&mut scratch)?;
                self.started = true;
            }
            self.encoder.write_record(&record, &mut scratch)?;
            output.write_bytes(&scratch)?;
            scratch.clear();
            self.records += 1;
            if !self.completed {
                if let Some(subscription) = &self.subscription {
                    subscription.request(1);
                }
            }
        }
        if self.completed && self.queue.is_empty() && output.is_ready() {
            self.finish(output)?;
        }
        Ok(())
    }

    fn finish<O: AsyncTransport>(&mut self, output: &mut BufferedAsyncOutput<O>) -> Result<()>
    where
        E: RecordEncoder<T>,
    {
        let mut trailer = Vec::new();
        if !self.started {
            self.encoder.before_records(&mut trailer)?;
            self.started = true;
        }
        self.encoder.after_records(&mut trailer)?;
        output.write_bytes(&trailer)?;
        output.flush_output()?;
        output.close()?;
        debug!(records = self.records, "record writer finished");
        self.status.send_replace(WriterStatus::Finished {
            records: self.records,
        });
        Ok(())
    }

    fn abort<O: AsyncTransport>(&mut self, output: &mut BufferedAsyncOutput<O>, error: Error) {
        if self.is_done() {
            return;
        }
        warn!(%error, records = self.records, "record writer aborted");
        if let Some(subscription) = &self.subscription {
            subscription.cancel();
        }
        self.queue.clear();
        // the transport may already be gone
        let _ = output.close();
        self.status.send_replace(WriterStatus::Failed(error.to_string()));
    }
}

impl<T, E, O> WriteListener<O> for Pending<T, E>
where
    E: RecordEncoder<T>,
    O: AsyncTransport,
{
    fn on_write_possible(&mut self, output: &mut BufferedAsyncOutput<O>) -> Result<()> {
        self.write_pending(output)
    }
}

impl<T, E, O> Subscriber<T> for AsyncRecordWriter<T, E, O>
where
    T: Send + 'static,
    E: RecordEncoder<T>,
    O: AsyncTransport,
{
    fn on_subscribe(&mut self, subscription: Subscription) {
        let mut inner = self.inner.lock();
        subscription.request(1);
        inner.pending.subscription = Some(subscription);
    }

    fn on_next(&mut self, item: T) {
        let mut inner = self.inner.lock();
        let WriterInner { output, pending } = &mut *inner;
        pending.queue.push_back(item);
        if let Err(error) = pending.write_pending(output) {
            pending.abort(output, error);
        }
    }

    fn on_error(&mut self, error: Error) {
        let mut inner = self.inner.lock();
        let WriterInner { output, pending } = &mut *inner;
        pending.abort(output, error);
    }

    fn on_complete(&mut self) {
        let mut inner = self.inner.lock();
        let WriterInner { output, pending } = &mut *inner;
        pending.completed = true;
        if let Err(error) = pending.write_pending(output) {
            pending.abort(output, error);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
