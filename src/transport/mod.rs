//! Per-connection transport: socket, write buffer and protocol.
//!
//! Each connected socket gets exactly one [`Transport`]. A driver task owns
//! the readiness side: it reads into the protocol, flushes the write buffer,
//! applies flow control and delivers `connection_lost`. Everything the
//! application calls (`write`, `close`, `pause_reading`, ...) is
//! synchronous and only records intent and wakes the driver.
//!
//! ```text
//!            write()/close()/abort()            recv → data_received
//! caller ───────────────────────────► State ◄──── driver task ────► Protocol
//!                         wake (Notify)  │          flush ← writable
//!                                        ▼
//!                             SocketHandle (fd)
//! ```
//!
//! # Phases
//!
//! `Connecting → Open → Closing → Closed`. A failed connect goes straight to
//! `Closed` without any protocol callback. A read or send error skips the
//! flush and closes with the error; `close()` flushes first.

mod protocol;

pub use protocol::Protocol;

use std::cell::RefCell;
use std::io::Read;
use std::path::Path;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BytesMut};
use socket2::Socket;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::{check_water_marks, TransportConfig};
use crate::error::{Direction, Result, TransportError};
use crate::socket::handle::{self, SocketHandle};

/// Lifecycle phase of a [`Transport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Outbound connect in progress.
    Connecting,
    /// Reading and writing.
    Open,
    /// No more writes accepted; flushing or about to report the loss.
    Closing,
    /// Descriptor released and `connection_lost` delivered.
    Closed,
}

struct State {
    phase: Phase,
    write_buf: BytesMut,
    high_water: usize,
    low_water: usize,
    reading_paused: bool,
    eof_received: bool,
    eof_requested: bool,
    eof_written: bool,
    protocol_paused: bool,
    /// Set once a close has been decided; consumed by the driver.
    pending_loss: Option<Option<TransportError>>,
    /// Error passed to `connection_lost`.
    lost_error: Option<TransportError>,
    /// Bytes still buffered when the transport closed.
    discarded: usize,
}

struct Shared {
    id: u64,
    sock: SocketHandle,
    state: RefCell<State>,
    protocol: RefCell<Option<Box<dyn Protocol>>>,
    read_chunk_size: usize,
    wake: Notify,
    drained: Notify,
    closed: CancellationToken,
    on_closed: RefCell<Option<Box<dyn FnOnce(u64)>>>,
}

/// Handle to a connection. Clones share the same connection.
#[derive(Clone)]
pub struct Transport {
    shared: Rc<Shared>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.shared.id)
            .field("fd", &self.shared.sock.fileno())
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

/// Non-owning reference to a [`Transport`].
///
/// Held by objects the protocol owns, so they do not keep the transport
/// alive through the protocol slot.
#[derive(Clone)]
pub(crate) struct WeakTransport {
    shared: Weak<Shared>,
}

impl WeakTransport {
    pub(crate) fn upgrade(&self) -> Option<Transport> {
        self.shared.upgrade().map(|shared| Transport { shared })
    }
}

/// Tears the connection down if the driver task is dropped before it
/// delivers `connection_lost`, e.g. when the event loop itself is dropped.
struct DriverGuard {
    shared: Rc<Shared>,
}

impl Drop for DriverGuard {
    fn drop(&mut self) {
        let mut state = self.shared.state.borrow_mut();
        if state.phase == Phase::Closed {
            return;
        }
        state.phase = Phase::Closed;
        state.discarded += state.write_buf.len();
        state.write_buf.clear();
        drop(state);

        log::debug!("[Transport] #{} dropped with its dispatcher", self.shared.id);
        self.shared.sock.close();
        drop(self.shared.protocol.borrow_mut().take());
        drop(self.shared.on_closed.borrow_mut().take());
        self.shared.closed.cancel();
    }
}

enum Event {
    Wake,
    Read(Result<usize>),
    Flushed(Result<usize>),
}

impl Transport {
    fn new(sock: SocketHandle, protocol: Box<dyn Protocol>, config: &TransportConfig) -> Self {
        let state = State {
            phase: Phase::Connecting,
            write_buf: BytesMut::new(),
            high_water: config.write_high_water,
            low_water: config.write_low_water,
            reading_paused: false,
            eof_received: false,
            eof_requested: false,
            eof_written: false,
            protocol_paused: false,
            pending_loss: None,
            lost_error: None,
            discarded: 0,
        };
        Self {
            shared: Rc::new(Shared {
                id: next_transport_id(),
                sock,
                state: RefCell::new(state),
                protocol: RefCell::new(Some(protocol)),
                read_chunk_size: config.read_chunk_size.max(1),
                wake: Notify::new(),
                drained: Notify::new(),
                closed: CancellationToken::new(),
                on_closed: RefCell::new(None),
            }),
        }
    }

    /// Connect `sock` to `path` and open a transport over it.
    ///
    /// On failure the socket is closed and the protocol is dropped without
    /// any callback.
    pub(crate) async fn connect(
        sock: SocketHandle,
        path: &Path,
        protocol: Box<dyn Protocol>,
        config: &TransportConfig,
    ) -> Result<Self> {
        let transport = Self::new(sock.clone(), protocol, config);
        match sock.connect(path).await {
            Ok(()) => {
                transport.start(None);
                Ok(transport)
            }
            Err(err) => {
                log::debug!(
                    "[Transport] #{} connect to {} failed: {err}",
                    transport.shared.id,
                    path.display()
                );
                transport.abandon();
                Err(err)
            }
        }
    }

    /// Open a transport over an already-connected socket.
    ///
    /// `on_closed` receives the transport id after `connection_lost` has
    /// been delivered.
    pub(crate) fn attach(
        sock: SocketHandle,
        protocol: Box<dyn Protocol>,
        config: &TransportConfig,
        on_closed: Option<Box<dyn FnOnce(u64)>>,
    ) -> Result<Self> {
        if sock.is_closed() {
            return Err(TransportError::BadDescriptor);
        }
        let transport = Self::new(sock, protocol, config);
        transport.start(on_closed);
        Ok(transport)
    }

    fn start(&self, on_closed: Option<Box<dyn FnOnce(u64)>>) {
        *self.shared.on_closed.borrow_mut() = on_closed;
        self.shared.state.borrow_mut().phase = Phase::Open;
        log::debug!(
            "[Transport] #{} open on fd {}",
            self.shared.id,
            self.shared.sock.fileno()
        );

        let guard = DriverGuard {
            shared: Rc::clone(&self.shared),
        };
        tokio::task::spawn_local(drive(guard));
        self.shared.with_protocol(|p| p.connection_made(self));
    }

    fn abandon(&self) {
        self.shared.state.borrow_mut().phase = Phase::Closed;
        self.shared.sock.close();
        drop(self.shared.protocol.borrow_mut().take());
        self.shared.closed.cancel();
    }

    pub(crate) fn downgrade(&self) -> WeakTransport {
        WeakTransport {
            shared: Rc::downgrade(&self.shared),
        }
    }

    /// Numeric id used in log lines.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.shared.state.borrow().phase
    }

    /// The underlying socket.
    pub fn socket(&self) -> &SocketHandle {
        &self.shared.sock
    }

    /// `true` once `close`/`abort` was called or the connection was lost.
    pub fn is_closing(&self) -> bool {
        matches!(self.phase(), Phase::Closing | Phase::Closed)
    }

    /// Queue `data` for the peer. Never suspends.
    ///
    /// Fails with [`TransportError::Closing`] once the transport is closing
    /// or after [`write_eof`](Self::write_eof). A send error does not fail
    /// the call; it is reported through `connection_lost`.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        let mut state = self.shared.state.borrow_mut();
        if state.phase != Phase::Open || state.eof_requested {
            return Err(TransportError::Closing);
        }
        if data.is_empty() {
            return Ok(());
        }

        let below_high = state.write_buf.len() < state.high_water;
        state.write_buf.extend_from_slice(data);
        if below_high {
            match self.shared.sock.try_send(&state.write_buf) {
                Ok(sent) => state.write_buf.advance(sent),
                Err(err) => {
                    drop(state);
                    self.shared.schedule_loss(Some(err));
                    return Ok(());
                }
            }
        }

        let pending = !state.write_buf.is_empty();
        drop(state);
        if pending {
            self.shared.wake.notify_one();
        }
        Ok(())
    }

    /// Half-close once everything buffered has been flushed.
    pub fn write_eof(&self) -> Result<()> {
        let mut state = self.shared.state.borrow_mut();
        if state.phase != Phase::Open || state.eof_requested {
            return Ok(());
        }
        state.eof_requested = true;
        if !state.write_buf.is_empty() {
            return Ok(());
        }
        state.eof_written = true;
        drop(state);

        if let Err(err) = self.shared.sock.shutdown_write() {
            self.shared.schedule_loss(Some(err.clone()));
            return Err(err);
        }
        Ok(())
    }

    /// Unix stream sockets always support half-close.
    pub fn can_write_eof(&self) -> bool {
        true
    }

    /// Stop reading, flush buffered data, then close.
    ///
    /// `connection_lost(None)` follows once the buffer is empty. Calling it
    /// again does nothing.
    pub fn close(&self) {
        let mut state = self.shared.state.borrow_mut();
        if state.phase != Phase::Open {
            return;
        }
        state.phase = Phase::Closing;
        drop(state);
        log::debug!("[Transport] #{} closing", self.shared.id);
        self.shared.wake.notify_one();
    }

    /// Close immediately, discarding buffered data.
    pub fn abort(&self) {
        let mut state = self.shared.state.borrow_mut();
        if state.phase == Phase::Closed {
            return;
        }
        state.discarded += state.write_buf.len();
        state.write_buf.clear();
        drop(state);
        log::debug!("[Transport] #{} aborted", self.shared.id);
        self.shared.schedule_loss(None);
    }

    /// Stop delivering `data_received` until [`resume_reading`](Self::resume_reading).
    pub fn pause_reading(&self) {
        let mut state = self.shared.state.borrow_mut();
        if state.reading_paused {
            return;
        }
        state.reading_paused = true;
        drop(state);
        self.shared.wake.notify_one();
    }

    /// Undo [`pause_reading`](Self::pause_reading).
    pub fn resume_reading(&self) {
        let mut state = self.shared.state.borrow_mut();
        if !state.reading_paused {
            return;
        }
        state.reading_paused = false;
        drop(state);
        self.shared.wake.notify_one();
    }

    /// `true` while open and not paused.
    pub fn is_reading(&self) -> bool {
        let state = self.shared.state.borrow();
        state.phase == Phase::Open && !state.reading_paused
    }

    /// Set the write buffer water marks. `low` defaults to `high / 4`.
    pub fn set_write_buffer_limits(&self, high: usize, low: Option<usize>) -> Result<()> {
        let low = low.unwrap_or(high / 4);
        check_water_marks(high, low)?;
        let mut state = self.shared.state.borrow_mut();
        state.high_water = high;
        state.low_water = low;
        drop(state);
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Current `(low, high)` water marks.
    pub fn write_buffer_limits(&self) -> (usize, usize) {
        let state = self.shared.state.borrow();
        (state.low_water, state.high_water)
    }

    /// Bytes queued but not yet accepted by the OS.
    pub fn write_buffer_size(&self) -> usize {
        self.shared.state.borrow().write_buf.len()
    }

    /// Suspend until the write buffer is at or below the low-water mark.
    ///
    /// Once closed, fails with the error the connection was lost with, or
    /// with `ConnectionReset` if buffered bytes never reached the peer.
    pub async fn wait_drained(&self) -> Result<()> {
        loop {
            let drained = self.shared.drained.notified();
            {
                let state = self.shared.state.borrow();
                if state.phase == Phase::Closed {
                    return match &state.lost_error {
                        Some(err) => Err(err.clone()),
                        None if state.discarded > 0 => Err(TransportError::ConnectionReset),
                        None => Ok(()),
                    };
                }
                if state.pending_loss.is_none() && state.write_buf.len() <= state.low_water {
                    return Ok(());
                }
            }
            drained.await;
        }
    }

    /// Suspend until `connection_lost` has been delivered.
    pub async fn wait_closed(&self) {
        self.shared.closed.cancelled().await;
    }
}

impl Shared {
    fn with_protocol<R>(&self, f: impl FnOnce(&mut dyn Protocol) -> R) -> Option<R> {
        let mut slot = self.protocol.borrow_mut();
        slot.as_mut().map(|protocol| f(protocol.as_mut()))
    }

    /// Record that the connection is lost. Only the first call counts.
    fn schedule_loss(&self, error: Option<TransportError>) {
        let mut state = self.state.borrow_mut();
        if state.phase == Phase::Closed || state.pending_loss.is_some() {
            return;
        }
        if let Some(err) = &error {
            log::debug!("[Transport] #{} lost: {err}", self.id);
        }
        state.pending_loss = Some(error);
        state.phase = Phase::Closing;
        drop(state);
        self.wake.notify_one();
    }

    fn take_close_decision(&self) -> Option<Option<TransportError>> {
        let mut state = self.state.borrow_mut();
        if let Some(error) = state.pending_loss.take() {
            return Some(error);
        }
        if state.phase == Phase::Closing && state.write_buf.is_empty() {
            return Some(None);
        }
        None
    }

    fn on_read(&self, data: &[u8]) {
        if self.state.borrow().pending_loss.is_some() {
            return;
        }

        if !data.is_empty() {
            self.with_protocol(|p| p.data_received(data));
            return;
        }

        log::trace!("[Transport] #{} received EOF", self.id);
        self.state.borrow_mut().eof_received = true;
        let keep_open = self.with_protocol(|p| p.eof_received()).unwrap_or(false);
        if !keep_open {
            let mut state = self.state.borrow_mut();
            if state.phase == Phase::Open {
                state.phase = Phase::Closing;
            }
        }
    }

    fn flush_into(&self, socket: &Socket) -> std::io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if state.write_buf.is_empty() {
            return Ok(0);
        }
        let sent = handle::send_raw(socket, &state.write_buf)?;
        state.write_buf.advance(sent);
        Ok(sent)
    }

    fn after_flush(&self) {
        let mut state = self.state.borrow_mut();
        let shutdown = state.write_buf.is_empty() && state.eof_requested && !state.eof_written;
        if shutdown {
            state.eof_written = true;
        }
        let drained = state.write_buf.len() <= state.low_water;
        drop(state);

        if shutdown {
            if let Err(err) = self.sock.shutdown_write() {
                self.schedule_loss(Some(err));
            }
        }
        if drained {
            self.drained.notify_waiters();
        }
    }

    fn update_flow_control(&self) {
        let mut state = self.state.borrow_mut();
        let size = state.write_buf.len();
        let pause = !state.protocol_paused && size > state.high_water;
        let resume = state.protocol_paused && size <= state.low_water;
        if pause {
            state.protocol_paused = true;
        } else if resume {
            state.protocol_paused = false;
        }
        drop(state);

        if pause {
            log::trace!("[Transport] #{} pause_writing at {size} bytes", self.id);
            self.with_protocol(|p| p.pause_writing());
        } else if resume {
            self.with_protocol(|p| p.resume_writing());
        }
    }

    fn finish(&self, error: Option<TransportError>) {
        let mut state = self.state.borrow_mut();
        state.phase = Phase::Closed;
        state.discarded += state.write_buf.len();
        state.write_buf.clear();
        state.lost_error.clone_from(&error);
        drop(state);

        self.sock.close();
        log::debug!("[Transport] #{} closed", self.id);

        let protocol = self.protocol.borrow_mut().take();
        if let Some(mut protocol) = protocol {
            protocol.connection_lost(error);
        }

        self.drained.notify_waiters();
        self.closed.cancel();

        let hook = self.on_closed.borrow_mut().take();
        if let Some(hook) = hook {
            hook(self.id);
        }
    }
}

/// Per-transport task: reads, flushes and decides when to close.
async fn drive(guard: DriverGuard) {
    let shared = &*guard.shared;
    let registration = match shared.sock.registration() {
        Ok(registration) => registration,
        Err(err) => {
            shared.finish(Some(err));
            return;
        }
    };
    let mut buf = vec![0u8; shared.read_chunk_size];

    loop {
        if let Some(error) = shared.take_close_decision() {
            drop(registration);
            shared.finish(error);
            return;
        }
        shared.update_flow_control();

        let (want_read, want_write) = {
            let state = shared.state.borrow();
            (
                state.phase == Phase::Open && !state.reading_paused && !state.eof_received,
                !state.write_buf.is_empty(),
            )
        };

        let event = tokio::select! {
            biased;
            () = shared.wake.notified() => Event::Wake,
            res = registration.io(Direction::Read, |s| (&*s).read(&mut buf)), if want_read => {
                Event::Read(res)
            }
            res = registration.io(Direction::Write, |s| shared.flush_into(s)), if want_write => {
                Event::Flushed(res)
            }
        };

        match event {
            Event::Wake => {}
            Event::Read(Ok(n)) => shared.on_read(&buf[..n]),
            Event::Read(Err(err)) | Event::Flushed(Err(err)) => shared.schedule_loss(Some(err)),
            Event::Flushed(Ok(_)) => shared.after_flush(),
        }
    }
}

fn next_transport_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}
