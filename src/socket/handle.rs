//! Non-blocking `AF_UNIX` stream socket handle.
//!
//! A [`SocketHandle`] is a cheap, clonable reference to one descriptor. The
//! socket starts out detached (owned directly by the handle) and moves into
//! a multiplexer registration the first time an operation has to wait for
//! readiness. Every operation tries the syscall first and only suspends on
//! `WouldBlock`.
//!
//! Closing is idempotent: the registration is removed, pending waiters fail
//! with [`TransportError::BadDescriptor`], and `fileno()` reports `-1`.

use std::cell::RefCell;
use std::io::{self, Read};
use std::net::Shutdown;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use bytes::Bytes;
use socket2::{Domain, SockAddr, Socket, Type};

use crate::constants::{CONNECT_BACKOFF, MAX_SOCKET_PATH};
use crate::error::{Direction, Result, TransportError};
use crate::reactor::{self, Reactor, Registration};

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;

// Rust binaries ignore SIGPIPE at startup, so EPIPE is still reported here.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

enum HandleState {
    Detached(Socket),
    Registered(Rc<Registration>),
    Closed,
}

struct HandleInner {
    state: RefCell<HandleState>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if let HandleState::Registered(registration) = self.state.get_mut() {
            reactor::release(registration.fd());
        }
    }
}

/// Shared handle to a non-blocking Unix-domain stream socket.
#[derive(Clone)]
pub struct SocketHandle {
    inner: Rc<HandleInner>,
}

impl std::fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.inner.state.borrow() {
            HandleState::Detached(_) => "detached",
            HandleState::Registered(_) => "registered",
            HandleState::Closed => "closed",
        };
        f.debug_struct("SocketHandle")
            .field("fd", &self.fileno())
            .field("state", &state)
            .finish()
    }
}

impl SocketHandle {
    /// Create an unconnected stream socket (non-blocking, close-on-exec).
    pub fn stream() -> Result<Self> {
        let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        socket.set_nonblocking(true)?;
        Ok(Self::from_socket(socket))
    }

    /// Create a connected pair of stream sockets.
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::try_from(a)?, Self::try_from(b)?))
    }

    pub(crate) fn from_socket(socket: Socket) -> Self {
        Self {
            inner: Rc::new(HandleInner {
                state: RefCell::new(HandleState::Detached(socket)),
            }),
        }
    }

    /// Descriptor number, or `-1` once closed.
    pub fn fileno(&self) -> RawFd {
        match &*self.inner.state.borrow() {
            HandleState::Detached(socket) => socket.as_raw_fd(),
            HandleState::Registered(registration) => registration.fd(),
            HandleState::Closed => -1,
        }
    }

    /// `true` once [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        matches!(*self.inner.state.borrow(), HandleState::Closed)
    }

    /// Release the descriptor. Subsequent calls do nothing.
    ///
    /// Any task waiting on this socket wakes up with `BadDescriptor`.
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *self.inner.state.borrow_mut(), HandleState::Closed);
        match previous {
            HandleState::Detached(socket) => {
                log::trace!("[Socket] Closing detached fd {}", socket.as_raw_fd());
            }
            HandleState::Registered(registration) => {
                reactor::release(registration.fd());
            }
            HandleState::Closed => {}
        }
    }

    /// Bind to a filesystem path.
    pub fn bind(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        check_path_len(path)?;
        let addr = SockAddr::unix(path).map_err(|e| TransportError::at_path(e, path))?;
        self.socket_op(|s| s.bind(&addr))
            .map_err(|e| TransportError::at_path(e, path))
    }

    /// Start listening for connections.
    pub fn listen(&self, backlog: u32) -> Result<()> {
        let backlog = i32::try_from(backlog).unwrap_or(i32::MAX);
        Ok(self.socket_op(|s| s.listen(backlog))?)
    }

    /// Path this socket is bound to, if any.
    pub fn local_path(&self) -> Result<Option<PathBuf>> {
        let addr = self.socket_op(Socket::local_addr)?;
        Ok(addr.as_pathname().map(Path::to_path_buf))
    }

    /// Path of the peer's socket, if it is bound to one.
    pub fn peer_path(&self) -> Result<Option<PathBuf>> {
        let addr = self.socket_op(Socket::peer_addr)?;
        Ok(addr.as_pathname().map(Path::to_path_buf))
    }

    /// Half-close: the peer reads end-of-stream, reading here continues.
    pub fn shutdown_write(&self) -> Result<()> {
        Ok(self.socket_op(|s| s.shutdown(Shutdown::Write))?)
    }

    /// Connect to the listener at `path`.
    ///
    /// Suspends until the connection is established. A full listener
    /// backlog (`EAGAIN`) is retried after [`CONNECT_BACKOFF`].
    pub async fn connect(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        check_path_len(path)?;
        let addr = SockAddr::unix(path).map_err(|e| TransportError::at_path(e, path))?;

        loop {
            let err = match self.socket_op(|s| s.connect(&addr)) {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            match err.raw_os_error() {
                Some(libc::EINPROGRESS) => {
                    let registration = self.registration()?;
                    let pending = registration
                        .io(Direction::Write, Socket::take_error)
                        .await?;
                    return match pending {
                        None => Ok(()),
                        Some(err) => Err(TransportError::at_path(err, path)),
                    };
                }
                Some(libc::EAGAIN) => {
                    log::debug!("[Socket] Listener backlog full at {}, retrying", path.display());
                    tokio::time::sleep(CONNECT_BACKOFF).await;
                }
                Some(libc::EINTR) => {}
                _ => return Err(TransportError::at_path(err, path)),
            }
        }
    }

    /// Send as much of `data` as the OS accepts right now.
    ///
    /// Returns `0` instead of blocking when the send buffer is full.
    pub fn try_send(&self, data: &[u8]) -> Result<usize> {
        match self.socket_op(|s| send_raw(s, data)) {
            Ok(n) => Ok(n),
            Err(err) if TransportError::would_block(&err) => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    /// Send all of `data`, suspending while the send buffer is full.
    pub async fn send_all(&self, data: &[u8]) -> Result<()> {
        let mut offset = 0;
        while offset < data.len() {
            let sent = self.try_send(&data[offset..])?;
            if sent > 0 {
                offset += sent;
                continue;
            }
            let registration = self.registration()?;
            let rest = &data[offset..];
            offset += registration
                .io(Direction::Write, |s| send_raw(s, rest))
                .await?;
        }
        Ok(())
    }

    /// Receive up to `max_len` bytes, suspending until some arrive.
    ///
    /// An empty result means the peer closed its end. `max_len == 0` never
    /// suspends and returns an empty buffer on an open handle, so it says
    /// nothing about the peer.
    pub async fn recv(&self, max_len: usize) -> Result<Bytes> {
        if max_len == 0 {
            if self.is_closed() {
                return Err(TransportError::BadDescriptor);
            }
            return Ok(Bytes::new());
        }
        let mut buf = vec![0u8; max_len];
        let n = match self.socket_op(|s| (&*s).read(&mut buf)) {
            Ok(n) => n,
            Err(err) if TransportError::would_block(&err) => {
                let registration = self.registration()?;
                registration
                    .io(Direction::Read, |s| (&*s).read(&mut buf))
                    .await?
            }
            Err(err) => return Err(err.into()),
        };
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    /// Accept one pending connection, suspending until one arrives.
    pub async fn accept(&self) -> Result<SocketHandle> {
        let registration = self.registration()?;
        let (socket, _addr) = registration.io(Direction::Read, Socket::accept).await?;
        socket.set_nonblocking(true)?;
        Ok(Self::from_socket(socket))
    }

    /// Run a non-suspending syscall against the socket.
    ///
    /// A closed handle yields `EBADF`.
    pub(crate) fn socket_op<R>(&self, op: impl FnOnce(&Socket) -> io::Result<R>) -> io::Result<R> {
        match &*self.inner.state.borrow() {
            HandleState::Detached(socket) => op(socket),
            HandleState::Registered(registration) => op(registration.socket()),
            HandleState::Closed => Err(io::Error::from_raw_os_error(libc::EBADF)),
        }
    }

    /// Registration with this thread's multiplexer, created on first use.
    pub(crate) fn registration(&self) -> Result<Rc<Registration>> {
        let mut state = self.inner.state.borrow_mut();
        match std::mem::replace(&mut *state, HandleState::Closed) {
            HandleState::Registered(registration) => {
                *state = HandleState::Registered(Rc::clone(&registration));
                Ok(registration)
            }
            HandleState::Detached(socket) => match Reactor::current().register(socket) {
                Ok(registration) => {
                    *state = HandleState::Registered(Rc::clone(&registration));
                    Ok(registration)
                }
                Err((socket, err)) => {
                    *state = HandleState::Detached(socket);
                    Err(err.into())
                }
            },
            HandleState::Closed => Err(TransportError::BadDescriptor),
        }
    }
}

impl TryFrom<UnixStream> for SocketHandle {
    type Error = TransportError;

    fn try_from(stream: UnixStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self::from_socket(Socket::from(stream)))
    }
}

impl TryFrom<UnixListener> for SocketHandle {
    type Error = TransportError;

    fn try_from(listener: UnixListener) -> Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(Self::from_socket(Socket::from(listener)))
    }
}

/// Non-blocking send that reports a closed peer as `EPIPE`.
pub(crate) fn send_raw(socket: &Socket, data: &[u8]) -> io::Result<usize> {
    socket.send_with_flags(data, SEND_FLAGS)
}

/// Reject paths that do not fit in `sun_path`.
pub(crate) fn check_path_len(path: &Path) -> Result<()> {
    let len = path.as_os_str().len();
    if len > MAX_SOCKET_PATH {
        return Err(TransportError::PathTooLong {
            path: path.to_path_buf(),
            len,
            max: MAX_SOCKET_PATH,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pair_send_and_recv() {
        let (a, b) = SocketHandle::pair().unwrap();
        a.send_all(b"hello").await.unwrap();
        let got = b.recv(16).await.unwrap();
        assert_eq!(&got[..], b"hello");

        a.close();
        let eof = b.recv(16).await.unwrap();
        assert!(eof.is_empty(), "Expected end-of-stream after peer close");
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_reports_minus_one() {
        let sock = SocketHandle::stream().unwrap();
        assert!(sock.fileno() >= 0);
        sock.close();
        sock.close();
        assert_eq!(sock.fileno(), -1);
        assert!(sock.is_closed());
    }

    #[tokio::test]
    async fn test_operations_on_closed_handle_fail_immediately() {
        let (a, _b) = SocketHandle::pair().unwrap();
        a.close();

        assert!(matches!(a.try_send(b"x"), Err(TransportError::BadDescriptor)));
        assert!(matches!(a.recv(4).await, Err(TransportError::BadDescriptor)));
        assert!(matches!(a.accept().await, Err(TransportError::BadDescriptor)));
        assert!(matches!(
            a.connect("/tmp/udsio-never.sock").await,
            Err(TransportError::BadDescriptor)
        ));
    }

    #[tokio::test]
    async fn test_close_wakes_pending_recv() {
        let (a, _b) = SocketHandle::pair().unwrap();
        let reader = a.clone();
        let pending = reader.recv(4);
        tokio::pin!(pending);
        assert!(futures_util::poll!(&mut pending).is_pending());

        a.close();
        let result = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .expect("Timed out waiting for closed recv");
        assert!(matches!(result, Err(TransportError::BadDescriptor)));
    }

    #[tokio::test]
    async fn test_recv_zero_returns_without_waiting() {
        let (a, b) = SocketHandle::pair().unwrap();
        // Peer open and silent: a real read would block here
        let got = tokio::time::timeout(Duration::from_secs(2), a.recv(0))
            .await
            .expect("recv(0) suspended")
            .unwrap();
        assert!(got.is_empty());

        b.send_all(b"kept").await.unwrap();
        assert!(a.recv(0).await.unwrap().is_empty());
        assert_eq!(&a.recv(16).await.unwrap()[..], b"kept");

        a.close();
        assert!(matches!(a.recv(0).await, Err(TransportError::BadDescriptor)));
    }

    #[tokio::test]
    async fn test_connect_missing_path_is_file_not_found() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sock = SocketHandle::stream().unwrap();
        let err = sock.connect(tmp.path().join("nobody.sock")).await.unwrap_err();
        assert!(matches!(err, TransportError::FileNotFound { .. }), "got: {err:?}");
    }

    #[tokio::test]
    async fn test_bind_listen_accept_connect() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("h.sock");

        let listener = SocketHandle::stream().unwrap();
        listener.bind(&path).unwrap();
        listener.listen(8).unwrap();
        assert_eq!(listener.local_path().unwrap().as_deref(), Some(path.as_path()));

        let client = SocketHandle::stream().unwrap();
        let (accepted, connected) = tokio::join!(listener.accept(), client.connect(&path));
        connected.unwrap();
        let accepted = accepted.unwrap();

        assert_eq!(client.peer_path().unwrap().as_deref(), Some(path.as_path()));

        client.send_all(b"ping").await.unwrap();
        assert_eq!(&accepted.recv(4).await.unwrap()[..], b"ping");

        accepted.shutdown_write().unwrap();
        assert!(client.recv(4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_path_too_long_rejected() {
        let long = PathBuf::from(format!("/tmp/{}", "x".repeat(MAX_SOCKET_PATH)));
        let sock = SocketHandle::stream().unwrap();
        assert!(matches!(sock.bind(&long), Err(TransportError::PathTooLong { .. })));
    }

    #[tokio::test]
    async fn test_dropping_last_handle_releases_registration() {
        let before = reactor::registered_descriptors();
        {
            let (a, _b) = SocketHandle::pair().unwrap();
            a.registration().unwrap();
            assert_eq!(reactor::registered_descriptors(), before + 1);
        }
        assert_eq!(reactor::registered_descriptors(), before);
    }
}
