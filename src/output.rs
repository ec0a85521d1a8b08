//! # Buffered Async Output
//!
//! Non-blocking byte output in front of a transport that signals when it
//! can accept more data.
//!
//! ```text
//!   write(bytes) ──► transport ready? ──yes──► drain own buffer, then transport
//!                          │
//!                          no
//!                          ▼
//!                    fixed buffer ──(full)──► CapacityExceeded
//!
//!   notify_ready(listener):
//!     1. fail if the peer closed the transport
//!     2. flush buffered bytes to the transport
//!     3. honour a deferred flush()
//!     4. listener.on_write_possible()
//! ```
//!
//! The buffer is a fixed-size overflow area, not a queue to lean on: a
//! writer is expected to stop producing while the transport is not ready.
//! Overflow is fatal to the connection.

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::DEFAULT_OUTPUT_BUFFER_SIZE;
use crate::error::{Error, Result};

// =============================================================================
// Transport
// =============================================================================

/// A byte channel with a write-readiness signal.
pub trait AsyncTransport: Send + 'static {
    /// Whether a write would be accepted without blocking.
    fn is_ready(&self) -> bool;

    fn write(&mut self, buf: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()>;

    fn is_closed(&self) -> bool;
}

/// Downstream of a [`BufferedAsyncOutput`], told when it may write again.
pub trait WriteListener<O: AsyncTransport> {
    fn on_write_possible(&mut self, output: &mut BufferedAsyncOutput<O>) -> Result<()>;
}

// =============================================================================
// Buffered Output
// =============================================================================

/// Output that writes through when the transport is ready and buffers
/// otherwise.
#[derive(Debug)]
pub struct BufferedAsyncOutput<O> {
    transport: O,
    buffer: Vec<u8>,
    capacity: usize,
    flush_requested: bool,
}

impl<O: AsyncTransport> BufferedAsyncOutput<O> {
    pub fn new(transport: O) -> Self {
        Self::with_capacity(transport, DEFAULT_OUTPUT_BUFFER_SIZE)
    }

    pub fn with_capacity(transport: O, capacity: usize) -> Self {
        Self {
            transport,
            buffer: Vec::with_capacity(capacity),
            capacity,
            flush_requested: false,
        }
    }

    /// Whether the transport accepts writes right now.
    pub fn is_ready(&self) -> bool {
        self.transport.is_ready()
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    /// Bytes waiting for the transport.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn transport(&self) -> &O {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut O {
        &mut self.transport
    }

    /// Writes `bytes`, buffering them while the transport is not ready.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if self.transport.is_ready() {
            self.drain_buffer()?;
            self.transport.write(bytes)?;
            return Ok(());
        }
        if self.buffer.len() + bytes.len() > self.capacity {
            return Err(Error::CapacityExceeded {
                what: "output buffer",
                capacity: self.capacity,
            });
        }
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    /// Flushes now, or at the next readiness notification.
    pub fn flush_output(&mut self) -> Result<()> {
        if !self.transport.is_ready() {
            self.flush_requested = true;
            return Ok(());
        }
        self.drain_buffer()?;
        self.transport.flush()?;
        self.flush_requested = false;
        Ok(())
    }

    /// Called by the transport layer when it can accept data again.
    ///
    /// Fails with [`Error::Closed`] once the peer has closed the transport.
    pub fn notify_ready<L>(&mut self, listener: &mut L) -> Result<()>
    where
        L: WriteListener<O> + ?Sized,
    {
        if self.transport.is_closed() {
            return Err(Error::Closed("transport closed by peer".into()));
        }
        if !self.transport.is_ready() {
            return Ok(());
        }
        self.drain_buffer()?;
        if self.flush_requested {
            self.transport.flush()?;
            self.flush_requested = false;
        }
        if self.transport.is_ready() {
            listener.on_write_possible(self)?;
        }
        Ok(())
    }

    /// Flushes what the transport accepts and closes it.
    pub fn close(&mut self) -> Result<()> {
        if self.transport.is_ready() {
            self.drain_buffer()?;
            self.transport.flush()?;
        }
        self.transport.close()?;
        Ok(())
    }

    fn drain_buffer(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            self.transport.write(&self.buffer)?;
            self.buffer.clear();
        }
        Ok(())
    }
}

impl<O: AsyncTransport> io::Write for BufferedAsyncOutput<O> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf).map_err(into_io_error)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_output().map_err(into_io_error)
    }
}

fn into_io_error(error: Error) -> io::Error {
    match error {
        Error::Io(error) => error,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

// =============================================================================
// Memory Transport
// =============================================================================

#[derive(Debug)]
struct MemoryState {
    ready: bool,
    closed: bool,
    written: Vec<u8>,
    flushes: usize,
}

/// In-memory [`AsyncTransport`] whose readiness is controlled through a
/// [`TransportProbe`].
#[derive(Debug)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

/// Test-side view of a [`MemoryTransport`].
#[derive(Debug, Clone)]
pub struct TransportProbe {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    /// Creates a transport that starts out ready.
    pub fn new() -> (Self, TransportProbe) {
        let state = Arc::new(Mutex::new(MemoryState {
            ready: true,
            closed: false,
            written: Vec::new(),
            flushes: 0,
        }));
        (
            Self {
                state: Arc::clone(&state),
            },
            TransportProbe { state },
        )
    }
}

impl AsyncTransport for MemoryTransport {
    fn is_ready(&self) -> bool {
        let state = self.state.lock();
        state.ready && !state.closed
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "transport closed"));
        }
        state.written.extend_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.state.lock().flushes += 1;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.state.lock().closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl TransportProbe {
    pub fn set_ready(&self, ready: bool) {
        self.state.lock().ready = ready;
    }

    /// Simulates the peer going away.
    pub fn disconnect(&self) {
        self.state.lock().closed = true;
    }

    /// Every byte the transport has accepted.
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    pub fn flushes(&self) -> usize {
        self.state.lock().flushes
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct CountingListener(usize);

    impl<O: AsyncTransport> WriteListener<O> for CountingListener {
        fn on_write_possible(&mut self, _: &mut BufferedAsyncOutput<O>) -> Result<()> {
            self.0 += 1;
            Ok(())
        }
    }

    #[test]
    fn test_writes_through_when_ready() {
        let (transport, probe) = MemoryTransport::new();
        let mut output = BufferedAsyncOutput::with_capacity(transport, 8);
        output.write_bytes(b"hello").unwrap();
        assert_eq!(probe.written(), b"hello");
        assert!(output.buffered().is_empty());
    }

    #[test]
    fn test_not_ready_defers_until_notified() {
        let (transport, probe) = MemoryTransport::new();
        let mut output = BufferedAsyncOutput::with_capacity(transport, 64);
        probe.set_ready(false);

        output.write_bytes(b"abc").unwrap();
        output.write_bytes(&[0, 255, 7]).unwrap();
        output.flush_output().unwrap();
        assert!(probe.written().is_empty());
        assert_eq!(probe.flushes(), 0);

        probe.set_ready(true);
        let mut listener = CountingListener(0);
        output.notify_ready(&mut listener).unwrap();
        assert_eq!(probe.written(), vec![b'a', b'b', b'c', 0, 255, 7]);
        assert_eq!(probe.flushes(), 1);
        assert_eq!(listener.0, 1);
    }

    #[test]
    fn test_overflow_is_capacity_exceeded() {
        let (transport, probe) = MemoryTransport::new();
        let mut output = BufferedAsyncOutput::with_capacity(transport, 4);
        probe.set_ready(false);
        output.write_bytes(b"1234").unwrap();
        let err = output.write_bytes(b"5").unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { capacity: 4, .. }));
    }

    #[test]
    fn test_buffer_drains_before_direct_write() {
        let (transport, probe) = MemoryTransport::new();
        let mut output = BufferedAsyncOutput::with_capacity(transport, 16);
        probe.set_ready(false);
        output.write_bytes(b"first,").unwrap();
        probe.set_ready(true);
        output.write_bytes(b"second").unwrap();
        assert_eq!(probe.written(), b"first,second");
    }

    #[test]
    fn test_io_write_impl() {
        let (transport, probe) = MemoryTransport::new();
        let mut output = BufferedAsyncOutput::new(transport);
        write!(output, "{}-{}", 1, 2).unwrap();
        output.flush().unwrap();
        assert_eq!(probe.written(), b"1-2");
        assert_eq!(probe.flushes(), 1);
    }

    #[test]
    fn test_notify_after_disconnect_is_closed() {
        let (transport, probe) = MemoryTransport::new();
        let mut output = BufferedAsyncOutput::with_capacity(transport, 16);
        probe.disconnect();
        let mut listener = CountingListener(0);
        let err = output.notify_ready(&mut listener).unwrap_err();
        assert!(matches!(err, Error::Closed(_)));
        assert_eq!(listener.0, 0);
    }

    #[test]
    fn test_notify_while_not_ready_is_noop() {
        let (transport, probe) = MemoryTransport::new();
        let mut output = BufferedAsyncOutput::with_capacity(transport, 16);
        probe.set_ready(false);
        output.write_bytes(b"x").unwrap();
        let mut listener = CountingListener(0);
        output.notify_ready(&mut listener).unwrap();
        assert_eq!(listener.0, 0);
        assert_eq!(output.buffered(), b"x");
    }
}
