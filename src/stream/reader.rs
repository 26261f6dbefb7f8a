//! Buffered reader fed by a transport.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::Notify;

use crate::error::{Result, TransportError};
use crate::transport::{Transport, WeakTransport};

struct ReaderState {
    buffer: BytesMut,
    eof: bool,
    error: Option<TransportError>,
    limit: usize,
    transport: Option<WeakTransport>,
    paused: bool,
    waiting: bool,
}

struct ReaderInner {
    state: RefCell<ReaderState>,
    wakeup: Notify,
}

/// Read side of a stream connection.
///
/// Bytes arrive through [`feed_data`](Self::feed_data) from the transport
/// and leave through the `read*` methods. While more than `2 * limit` bytes
/// are buffered the transport stops reading; it resumes once the buffer is
/// back to `limit` or below.
///
/// Only one read may be suspended at a time. Clones share the buffer.
#[derive(Clone)]
pub struct StreamReader {
    inner: Rc<ReaderInner>,
}

impl std::fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("StreamReader")
            .field("buffered", &state.buffer.len())
            .field("eof", &state.eof)
            .field("limit", &state.limit)
            .field("paused", &state.paused)
            .finish_non_exhaustive()
    }
}

impl StreamReader {
    /// Create a detached reader with the given buffer limit.
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Rc::new(ReaderInner {
                state: RefCell::new(ReaderState {
                    buffer: BytesMut::new(),
                    eof: false,
                    error: None,
                    limit: limit.max(1),
                    transport: None,
                    paused: false,
                    waiting: false,
                }),
                wakeup: Notify::new(),
            }),
        }
    }

    pub(crate) fn set_transport(&self, transport: &Transport) {
        self.inner.state.borrow_mut().transport = Some(transport.downgrade());
    }

    /// Buffer limit used for flow control and separator searches.
    pub fn limit(&self) -> usize {
        self.inner.state.borrow().limit
    }

    /// Number of bytes buffered and not yet read.
    pub fn buffered_len(&self) -> usize {
        self.inner.state.borrow().buffer.len()
    }

    /// `true` once end-of-stream was fed and every byte has been read.
    pub fn at_eof(&self) -> bool {
        let state = self.inner.state.borrow();
        state.eof && state.buffer.is_empty()
    }

    /// Error the connection was lost with, if any.
    pub fn exception(&self) -> Option<TransportError> {
        self.inner.state.borrow().error.clone()
    }

    /// Append bytes received from the peer.
    pub fn feed_data(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut state = self.inner.state.borrow_mut();
        if state.eof {
            log::warn!("[Stream] Dropping {} bytes fed after EOF", data.len());
            return;
        }
        state.buffer.extend_from_slice(data);

        let pause = !state.paused && state.buffer.len() > 2 * state.limit;
        let transport = if pause {
            state.paused = true;
            state.transport.as_ref().and_then(WeakTransport::upgrade)
        } else {
            None
        };
        drop(state);

        if let Some(transport) = transport {
            transport.pause_reading();
        }
        self.inner.wakeup.notify_waiters();
    }

    /// Mark end-of-stream.
    pub fn feed_eof(&self) {
        self.inner.state.borrow_mut().eof = true;
        self.inner.wakeup.notify_waiters();
    }

    /// Fail pending and future reads with `error`.
    pub fn set_exception(&self, error: TransportError) {
        self.inner.state.borrow_mut().error = Some(error);
        self.inner.wakeup.notify_waiters();
    }

    /// Read up to `max_len` bytes.
    ///
    /// Suspends only while nothing is buffered. An empty result means
    /// end-of-stream.
    pub async fn read(&self, max_len: usize) -> Result<Bytes> {
        if max_len == 0 {
            return Ok(Bytes::new());
        }
        loop {
            {
                let mut state = self.inner.state.borrow_mut();
                if let Some(err) = &state.error {
                    return Err(err.clone());
                }
                if !state.buffer.is_empty() {
                    let n = max_len.min(state.buffer.len());
                    let data = state.buffer.split_to(n).freeze();
                    drop(state);
                    self.maybe_resume();
                    return Ok(data);
                }
                if state.eof {
                    return Ok(Bytes::new());
                }
            }
            self.wait_for_data().await?;
        }
    }

    /// Read exactly `n` bytes.
    ///
    /// If end-of-stream arrives first, fails with
    /// [`TransportError::IncompleteRead`] carrying every byte that did
    /// arrive; those bytes are removed from the buffer.
    pub async fn read_exactly(&self, n: usize) -> Result<Bytes> {
        if n == 0 {
            return Ok(Bytes::new());
        }
        loop {
            {
                let mut state = self.inner.state.borrow_mut();
                if let Some(err) = &state.error {
                    return Err(err.clone());
                }
                if state.buffer.len() >= n {
                    let data = state.buffer.split_to(n).freeze();
                    drop(state);
                    self.maybe_resume();
                    return Ok(data);
                }
                if state.eof {
                    let partial = state.buffer.split().freeze();
                    return Err(TransportError::IncompleteRead {
                        partial,
                        expected: n,
                    });
                }
            }
            self.wait_for_data().await?;
        }
    }

    /// Read until end-of-stream.
    pub async fn read_to_end(&self) -> Result<Bytes> {
        let mut out = BytesMut::new();
        let chunk = self.limit();
        loop {
            let block = self.read(chunk).await?;
            if block.is_empty() {
                return Ok(out.freeze());
            }
            out.extend_from_slice(&block);
        }
    }

    /// Read up to and including `separator`.
    ///
    /// Fails with [`TransportError::LimitOverrun`] if the separator is not
    /// within the first `limit` bytes (the buffer is left as is), and with
    /// [`TransportError::IncompleteRead`] if end-of-stream comes first; in
    /// that case `expected` counts the missing separator.
    pub async fn read_until(&self, separator: &[u8]) -> Result<Bytes> {
        if separator.is_empty() {
            let err = io::Error::new(io::ErrorKind::InvalidInput, "separator must not be empty");
            return Err(err.into());
        }
        let sep_len = separator.len();
        let mut offset = 0;

        loop {
            {
                let mut state = self.inner.state.borrow_mut();
                if let Some(err) = &state.error {
                    return Err(err.clone());
                }

                let buffered = state.buffer.len();
                if buffered >= offset + sep_len {
                    if let Some(pos) = find(&state.buffer[offset..], separator) {
                        let found = offset + pos;
                        if found > state.limit {
                            return Err(TransportError::LimitOverrun {
                                consumed: found,
                                limit: state.limit,
                            });
                        }
                        let data = state.buffer.split_to(found + sep_len).freeze();
                        drop(state);
                        self.maybe_resume();
                        return Ok(data);
                    }
                    offset = buffered + 1 - sep_len;
                    if offset > state.limit {
                        return Err(TransportError::LimitOverrun {
                            consumed: offset,
                            limit: state.limit,
                        });
                    }
                }

                if state.eof {
                    let partial = state.buffer.split().freeze();
                    let expected = partial.len() + sep_len;
                    return Err(TransportError::IncompleteRead { partial, expected });
                }
            }
            self.wait_for_data().await?;
        }
    }

    /// Read one `\n`-terminated line.
    ///
    /// At end-of-stream the unterminated tail is returned instead (empty
    /// once everything was read). A line longer than `limit` is discarded
    /// and reported as [`TransportError::LimitOverrun`].
    pub async fn read_line(&self) -> Result<Bytes> {
        match self.read_until(b"\n").await {
            Ok(line) => Ok(line),
            Err(TransportError::IncompleteRead { partial, .. }) => Ok(partial),
            Err(TransportError::LimitOverrun { consumed, limit }) => {
                let mut state = self.inner.state.borrow_mut();
                if state.buffer.get(consumed) == Some(&b'\n') {
                    state.buffer.advance(consumed + 1);
                } else {
                    state.buffer.clear();
                }
                drop(state);
                self.maybe_resume();
                Err(TransportError::LimitOverrun { consumed, limit })
            }
            Err(err) => Err(err),
        }
    }

    /// Suspend until the buffer changes, resuming the transport first.
    async fn wait_for_data(&self) -> Result<()> {
        let notified = self.inner.wakeup.notified();
        let resume = {
            let mut state = self.inner.state.borrow_mut();
            if state.waiting {
                return Err(TransportError::ReadInProgress);
            }
            state.waiting = true;
            if state.paused {
                state.paused = false;
                state.transport.as_ref().and_then(WeakTransport::upgrade)
            } else {
                None
            }
        };
        let _waiting = WaitingGuard { inner: &self.inner };

        if let Some(transport) = resume {
            transport.resume_reading();
        }
        notified.await;
        Ok(())
    }

    fn maybe_resume(&self) {
        let mut state = self.inner.state.borrow_mut();
        let transport = if state.paused && state.buffer.len() <= state.limit {
            state.paused = false;
            state.transport.as_ref().and_then(WeakTransport::upgrade)
        } else {
            None
        };
        drop(state);
        if let Some(transport) = transport {
            transport.resume_reading();
        }
    }
}

/// Clears the waiting flag even if the read is cancelled.
struct WaitingGuard<'a> {
    inner: &'a ReaderInner,
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.inner.state.borrow_mut().waiting = false;
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_read_exactly_waits_for_enough_bytes() {
        let reader = StreamReader::new(1024);
        let feeder = reader.clone();

        let read = reader.read_exactly(6);
        tokio::pin!(read);
        assert!(futures_util::poll!(&mut read).is_pending());

        feeder.feed_data(b"abc");
        assert!(futures_util::poll!(&mut read).is_pending());
        feeder.feed_data(b"defgh");

        let got = read.await.unwrap();
        assert_eq!(&got[..], b"abcdef");
        assert_eq!(reader.buffered_len(), 2);
    }

    #[tokio::test]
    async fn test_read_exactly_incomplete_keeps_partial() {
        let reader = StreamReader::new(1024);
        reader.feed_data(b"AAAA");
        reader.feed_eof();

        let err = reader.read_exactly(10).await.unwrap_err();
        assert_eq!(err.partial().map(|b| &b[..]), Some(&b"AAAA"[..]));
        assert_eq!(err.shortfall(), Some(6));
        assert!(reader.at_eof());
    }

    #[tokio::test]
    async fn test_read_returns_available_then_eof() {
        let reader = StreamReader::new(1024);
        reader.feed_data(b"hello world");
        assert_eq!(&reader.read(5).await.unwrap()[..], b"hello");
        assert_eq!(&reader.read(100).await.unwrap()[..], b" world");
        reader.feed_eof();
        assert!(reader.read(100).await.unwrap().is_empty());
        assert!(reader.read(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exception_takes_precedence_over_buffer() {
        let reader = StreamReader::new(1024);
        reader.feed_data(b"buffered");
        reader.set_exception(TransportError::ConnectionReset);

        assert!(matches!(reader.read(8).await, Err(TransportError::ConnectionReset)));
        assert!(matches!(reader.exception(), Some(TransportError::ConnectionReset)));
    }

    #[tokio::test]
    async fn test_second_waiter_is_rejected() {
        let reader = StreamReader::new(1024);
        let first = reader.read(4);
        tokio::pin!(first);
        assert!(futures_util::poll!(&mut first).is_pending());

        assert!(matches!(reader.read(4).await, Err(TransportError::ReadInProgress)));

        reader.feed_data(b"ok");
        assert_eq!(&first.await.unwrap()[..], b"ok");
    }

    #[tokio::test]
    async fn test_cancelled_read_releases_waiter() {
        let reader = StreamReader::new(1024);
        let timed_out = tokio::time::timeout(Duration::from_millis(10), reader.read_exactly(4)).await;
        assert!(timed_out.is_err());

        reader.feed_data(b"data");
        let got = tokio::time::timeout(Duration::from_secs(1), reader.read_exactly(4))
            .await
            .expect("Timed out after cancelled read")
            .unwrap();
        assert_eq!(&got[..], b"data");
    }

    #[tokio::test]
    async fn test_read_until_and_read_line() {
        let reader = StreamReader::new(1024);
        reader.feed_data(b"one\ntwo\r\nthree");

        assert_eq!(&reader.read_line().await.unwrap()[..], b"one\n");
        assert_eq!(&reader.read_until(b"\r\n").await.unwrap()[..], b"two\r\n");

        reader.feed_eof();
        assert_eq!(&reader.read_line().await.unwrap()[..], b"three");
        assert!(reader.read_line().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_until_incomplete_at_eof() {
        let reader = StreamReader::new(1024);
        reader.feed_data(b"no separator");
        reader.feed_eof();

        let err = reader.read_until(b"--").await.unwrap_err();
        assert_eq!(err.partial().map(|b| &b[..]), Some(&b"no separator"[..]));
    }

    #[tokio::test]
    async fn test_limit_overrun() {
        let reader = StreamReader::new(8);
        reader.feed_data(b"0123456789abcdef\nnext\n");

        let err = reader.read_until(b"\n").await.unwrap_err();
        assert!(matches!(err, TransportError::LimitOverrun { limit: 8, .. }));
        // read_until leaves the buffer alone
        assert_eq!(reader.buffered_len(), 22);

        let err = reader.read_line().await.unwrap_err();
        assert!(matches!(err, TransportError::LimitOverrun { .. }));
        assert_eq!(&reader.read_line().await.unwrap()[..], b"next\n");
    }

    #[tokio::test]
    async fn test_read_to_end_collects_everything() {
        let reader = StreamReader::new(4);
        reader.feed_data(b"abcdefghij");
        reader.feed_eof();
        assert_eq!(&reader.read_to_end().await.unwrap()[..], b"abcdefghij");
    }

    #[tokio::test]
    async fn test_empty_separator_rejected() {
        let reader = StreamReader::new(4);
        assert!(reader.read_until(b"").await.is_err());
    }
}
