//! Readiness multiplexer.
//!
//! Maps each registered descriptor to a [`Registration`] that owns the
//! socket through tokio's [`AsyncFd`]. A registration admits at most one
//! pending read waiter and one pending write waiter; each wait resolves
//! once, runs the caller's operation once, and clears the readiness edge if
//! the operation would still block. Re-arming is the caller's loop.
//!
//! ```text
//! SocketHandle ──register──► Reactor (per dispatcher thread)
//!                              fd → Registration { AsyncFd<Socket>, closed, waiters }
//! SocketHandle ──close────► deregister(fd): cancel waiters, drop registry entry
//! ```
//!
//! The registration owns the socket, so the epoll entry is always removed
//! before the descriptor number is released and can be reused.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use socket2::Socket;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio_util::sync::CancellationToken;

use crate::error::{Direction, Result, TransportError};

thread_local! {
    static REACTOR: Rc<Reactor> = Rc::new(Reactor::default());
}

/// Number of descriptors currently registered on this thread's multiplexer.
///
/// Drops back to zero once every socket created on the thread is closed.
pub fn registered_descriptors() -> usize {
    REACTOR.with(|reactor| reactor.len())
}

/// Deregister `fd` from this thread's multiplexer.
///
/// Safe to call from destructors that run while the thread is shutting
/// down; the registry may already be gone by then.
pub(crate) fn release(fd: RawFd) -> bool {
    REACTOR
        .try_with(|reactor| reactor.deregister(fd))
        .unwrap_or(false)
}

/// Per-thread descriptor registry.
#[derive(Default)]
pub(crate) struct Reactor {
    registrations: RefCell<HashMap<RawFd, Rc<Registration>>>,
}

impl Reactor {
    /// The multiplexer of the calling dispatcher thread.
    pub(crate) fn current() -> Rc<Reactor> {
        REACTOR.with(Rc::clone)
    }

    /// Register `socket` for read and write readiness.
    ///
    /// Must run inside a tokio runtime. On failure the socket is handed
    /// back untouched.
    pub(crate) fn register(
        &self,
        socket: Socket,
    ) -> std::result::Result<Rc<Registration>, (Socket, io::Error)> {
        let fd = socket.as_raw_fd();
        let io = AsyncFd::try_with_interest(socket, Interest::READABLE | Interest::WRITABLE)
            .map_err(tokio::io::unix::AsyncFdTryNewError::into_parts)?;

        let registration = Rc::new(Registration {
            fd,
            io,
            closed: CancellationToken::new(),
            read_waiter: Cell::new(false),
            write_waiter: Cell::new(false),
        });

        let stale = self
            .registrations
            .borrow_mut()
            .insert(fd, Rc::clone(&registration));
        if let Some(stale) = stale {
            // Only possible if a registration outlived its descriptor number.
            log::warn!("[Reactor] Replaced stale registration for fd {fd}");
            stale.closed.cancel();
        }

        log::trace!("[Reactor] Registered fd {fd}");
        Ok(registration)
    }

    /// Remove `fd` from the registry and wake its waiters.
    ///
    /// Returns `false` if the descriptor was not registered; calling it
    /// twice is harmless.
    pub(crate) fn deregister(&self, fd: RawFd) -> bool {
        let removed = self.registrations.borrow_mut().remove(&fd);
        match removed {
            Some(registration) => {
                registration.closed.cancel();
                log::trace!("[Reactor] Deregistered fd {fd}");
                true
            }
            None => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.registrations.borrow().len()
    }
}

/// A socket registered with the multiplexer.
pub(crate) struct Registration {
    fd: RawFd,
    io: AsyncFd<Socket>,
    closed: CancellationToken,
    read_waiter: Cell<bool>,
    write_waiter: Cell<bool>,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("fd", &self.fd)
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Registration {
    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn socket(&self) -> &Socket {
        self.io.get_ref()
    }

    /// Wait for `direction` readiness and run `op` against the socket.
    ///
    /// `op` runs once per readiness edge; a `WouldBlock` result clears the
    /// edge and waits again. Fails with `BadDescriptor` as soon as the
    /// registration is removed, and with `InterestBusy` if another waiter
    /// already holds this direction.
    pub(crate) async fn io<R>(
        &self,
        direction: Direction,
        mut op: impl FnMut(&Socket) -> io::Result<R>,
    ) -> Result<R> {
        let _claim = self.claim(direction)?;
        let interest = match direction {
            Direction::Read => Interest::READABLE,
            Direction::Write => Interest::WRITABLE,
        };

        loop {
            if self.closed.is_cancelled() {
                return Err(TransportError::BadDescriptor);
            }

            let mut guard = tokio::select! {
                biased;
                () = self.closed.cancelled() => return Err(TransportError::BadDescriptor),
                ready = self.io.ready(interest) => ready?,
            };

            match guard.try_io(|inner| op(inner.get_ref())) {
                Ok(result) => return result.map_err(TransportError::from),
                Err(_would_block) => continue,
            }
        }
    }

    fn claim(&self, direction: Direction) -> Result<WaiterClaim<'_>> {
        let flag = match direction {
            Direction::Read => &self.read_waiter,
            Direction::Write => &self.write_waiter,
        };
        if flag.replace(true) {
            return Err(TransportError::InterestBusy {
                fd: self.fd,
                direction,
            });
        }
        Ok(WaiterClaim { flag })
    }
}

/// Releases a direction when the waiting future completes or is dropped.
struct WaiterClaim<'a> {
    flag: &'a Cell<bool>,
}

impl Drop for WaiterClaim<'_> {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    fn socket_pair() -> (Socket, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        (Socket::from(a), b)
    }

    #[tokio::test]
    async fn test_deregister_is_idempotent() {
        let reactor = Reactor::default();
        let (sock, _peer) = socket_pair();
        let registration = reactor.register(sock).unwrap();
        let fd = registration.fd();

        assert_eq!(reactor.len(), 1);
        assert!(reactor.deregister(fd));
        assert!(!reactor.deregister(fd));
        assert_eq!(reactor.len(), 0);
    }

    #[tokio::test]
    async fn test_second_waiter_on_same_direction_is_busy() {
        let reactor = Reactor::default();
        let (sock, mut peer) = socket_pair();
        let registration = reactor.register(sock).unwrap();

        let first = registration.io(Direction::Read, |s| {
            let mut buf = [0u8; 8];
            (&*s).read(&mut buf)
        });
        tokio::pin!(first);
        assert!(futures_util::poll!(&mut first).is_pending());

        let second = registration
            .io(Direction::Read, |s| {
                let mut buf = [0u8; 8];
                (&*s).read(&mut buf)
            })
            .await;
        assert!(matches!(
            second,
            Err(TransportError::InterestBusy {
                direction: Direction::Read,
                ..
            })
        ));

        // The write direction is independent
        let written = registration
            .io(Direction::Write, |s| (&*s).write(b"x"))
            .await
            .unwrap();
        assert_eq!(written, 1);

        peer.write_all(b"ping").unwrap();
        assert_eq!(first.await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_dropped_waiter_releases_claim() {
        let reactor = Reactor::default();
        let (sock, mut peer) = socket_pair();
        let registration = reactor.register(sock).unwrap();

        {
            let pending = registration.io(Direction::Read, |s| {
                let mut buf = [0u8; 8];
                (&*s).read(&mut buf)
            });
            tokio::pin!(pending);
            assert!(futures_util::poll!(&mut pending).is_pending());
        }

        peer.write_all(b"ok").unwrap();
        let n = registration
            .io(Direction::Read, |s| {
                let mut buf = [0u8; 8];
                (&*s).read(&mut buf)
            })
            .await
            .unwrap();
        assert_eq!(n, 2);
    }

    #[tokio::test]
    async fn test_deregister_wakes_pending_waiter() {
        let reactor = Reactor::default();
        let (sock, _peer) = socket_pair();
        let registration = reactor.register(sock).unwrap();
        let fd = registration.fd();

        let pending = registration.io(Direction::Read, |s| {
            let mut buf = [0u8; 8];
            (&*s).read(&mut buf)
        });
        tokio::pin!(pending);
        assert!(futures_util::poll!(&mut pending).is_pending());

        reactor.deregister(fd);
        assert!(matches!(pending.await, Err(TransportError::BadDescriptor)));
    }
}
