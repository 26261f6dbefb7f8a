//! Error taxonomy for sockets, transports and streams.
//!
//! Every fallible operation in the crate returns [`TransportError`]. Raw
//! `std::io::Error`s are classified by errno on the way in so callers can
//! match on the conditions that matter for a Unix-domain connection
//! (missing listener, closed descriptor, peer gone) without digging into
//! OS codes.
//!
//! The error is `Clone`: a single connection-lost cause is handed to the
//! protocol, stored in the stream reader and returned from `drain()`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;

/// Convenience alias used throughout the crate.
pub type Result<T, E = TransportError> = std::result::Result<T, E>;

/// Readiness direction a waiter was registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Waiting for the descriptor to become readable.
    Read,
    /// Waiting for the descriptor to become writable.
    Write,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// Errors produced by the transport layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Connect target path does not exist.
    #[error("no such file or directory: {}", .path.display())]
    FileNotFound {
        /// Path that was dialed.
        path: PathBuf,
    },

    /// A socket file exists at the path but nothing is listening on it.
    #[error("connection refused: {}", .path.display())]
    ConnectionRefused {
        /// Path that was dialed.
        path: PathBuf,
    },

    /// Operation on a closed or otherwise invalid descriptor.
    #[error("bad file descriptor")]
    BadDescriptor,

    /// End-of-stream arrived before an exact-length read was satisfied.
    #[error("{} bytes read on a total of {expected} expected bytes", .partial.len())]
    IncompleteRead {
        /// Bytes that did arrive before end-of-stream.
        partial: Bytes,
        /// Number of bytes the read asked for.
        expected: usize,
    },

    /// Separator was not found within the reader's buffer limit.
    #[error("separator not found within {limit} bytes ({consumed} buffered)")]
    LimitOverrun {
        /// Bytes inspected before giving up.
        consumed: usize,
        /// Configured reader limit.
        limit: usize,
    },

    /// Write to a peer that has already closed its end.
    #[error("broken pipe")]
    BrokenPipe,

    /// Peer reset the connection.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// Transport is closing or closed and accepts no more writes.
    #[error("transport is closing")]
    Closing,

    /// A second waiter tried to wait on a descriptor direction that already has one.
    #[error("descriptor {fd} already has a pending {direction} waiter")]
    InterestBusy {
        /// Descriptor number.
        fd: i32,
        /// Direction that was already claimed.
        direction: Direction,
    },

    /// A second read was started while another one is suspended.
    #[error("read called while another read is already waiting for data")]
    ReadInProgress,

    /// A `wait_for` deadline elapsed.
    #[error("operation timed out")]
    TimedOut,

    /// Socket path does not fit in `sun_path`.
    #[error("socket path too long ({len} bytes, max {max}): {}", .path.display())]
    PathTooLong {
        /// Offending path.
        path: PathBuf,
        /// Its length in bytes.
        len: usize,
        /// Largest accepted length.
        max: usize,
    },

    /// Configuration values are inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Any other OS-level failure.
    #[error("{0}")]
    Io(Arc<io::Error>),
}

impl TransportError {
    /// Classify an I/O error raised while operating on `path`.
    ///
    /// Identical to the `From<io::Error>` conversion except that a missing
    /// path or a refused connection keeps the path for the message.
    pub fn at_path(err: io::Error, path: &Path) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::FileNotFound {
                path: path.to_path_buf(),
            },
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused {
                path: path.to_path_buf(),
            },
            _ => Self::from(err),
        }
    }

    /// `true` for the two ways the OS reports a vanished peer.
    ///
    /// Which of the two is reported depends on timing (unread data in the
    /// peer's receive queue turns `EPIPE` into `ECONNRESET`), so callers
    /// that only care about "peer is gone" should use this.
    pub fn is_peer_closed(&self) -> bool {
        matches!(self, Self::BrokenPipe | Self::ConnectionReset)
    }

    /// `true` when nothing is listening at the dialed path.
    ///
    /// A missing path gives `FileNotFound`; a socket file left behind by a
    /// listener that is gone gives `ConnectionRefused`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::FileNotFound { .. } | Self::ConnectionRefused { .. })
    }

    /// Missing byte count of an [`IncompleteRead`](Self::IncompleteRead).
    pub fn shortfall(&self) -> Option<usize> {
        match self {
            Self::IncompleteRead { partial, expected } => {
                Some(expected.saturating_sub(partial.len()))
            }
            _ => None,
        }
    }

    /// Bytes collected before an [`IncompleteRead`](Self::IncompleteRead).
    pub fn partial(&self) -> Option<&Bytes> {
        match self {
            Self::IncompleteRead { partial, .. } => Some(partial),
            _ => None,
        }
    }

    pub(crate) fn would_block(err: &io::Error) -> bool {
        err.kind() == io::ErrorKind::WouldBlock
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EBADF) => return Self::BadDescriptor,
            Some(libc::EPIPE) => return Self::BrokenPipe,
            Some(libc::ECONNRESET) => return Self::ConnectionReset,
            _ => {}
        }
        match err.kind() {
            io::ErrorKind::BrokenPipe => Self::BrokenPipe,
            io::ErrorKind::ConnectionReset => Self::ConnectionReset,
            _ => Self::Io(Arc::new(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_classification() {
        let epipe = io::Error::from_raw_os_error(libc::EPIPE);
        assert!(matches!(TransportError::from(epipe), TransportError::BrokenPipe));

        let reset = io::Error::from_raw_os_error(libc::ECONNRESET);
        assert!(matches!(TransportError::from(reset), TransportError::ConnectionReset));

        let ebadf = io::Error::from_raw_os_error(libc::EBADF);
        assert!(matches!(TransportError::from(ebadf), TransportError::BadDescriptor));

        let other = io::Error::from_raw_os_error(libc::EACCES);
        assert!(matches!(TransportError::from(other), TransportError::Io(_)));
    }

    #[test]
    fn test_at_path_keeps_path() {
        let path = Path::new("/tmp/udsio-missing.sock");
        let err = TransportError::at_path(io::Error::from_raw_os_error(libc::ENOENT), path);
        match &err {
            TransportError::FileNotFound { path: p } => assert_eq!(p, path),
            other => panic!("Expected FileNotFound, got: {other:?}"),
        }
        assert!(err.to_string().contains("udsio-missing.sock"));

        let refused =
            TransportError::at_path(io::Error::from_raw_os_error(libc::ECONNREFUSED), path);
        assert!(matches!(refused, TransportError::ConnectionRefused { .. }));

        // Anything else falls through to errno classification
        let piped = TransportError::at_path(io::Error::from_raw_os_error(libc::EPIPE), path);
        assert!(matches!(piped, TransportError::BrokenPipe));
    }

    #[test]
    fn test_peer_closed_accepts_both_kinds() {
        assert!(TransportError::BrokenPipe.is_peer_closed());
        assert!(TransportError::ConnectionReset.is_peer_closed());
        assert!(!TransportError::BadDescriptor.is_peer_closed());
        assert!(!TransportError::Closing.is_peer_closed());
    }

    #[test]
    fn test_not_found_covers_refused_stale_socket() {
        let path = Path::new("/tmp/udsio-stale.sock");
        let missing = TransportError::at_path(io::Error::from_raw_os_error(libc::ENOENT), path);
        let refused =
            TransportError::at_path(io::Error::from_raw_os_error(libc::ECONNREFUSED), path);
        assert!(missing.is_not_found());
        assert!(refused.is_not_found());
        assert!(!TransportError::BadDescriptor.is_not_found());
        assert!(!TransportError::BrokenPipe.is_not_found());
    }

    #[test]
    fn test_incomplete_read_reports_partial_and_shortfall() {
        let err = TransportError::IncompleteRead {
            partial: Bytes::from_static(b"AAAA"),
            expected: 10,
        };
        assert_eq!(err.shortfall(), Some(6));
        assert_eq!(err.partial().map(|b| &b[..]), Some(&b"AAAA"[..]));
        assert_eq!(err.to_string(), "4 bytes read on a total of 10 expected bytes");

        assert_eq!(TransportError::TimedOut.shortfall(), None);
        assert!(TransportError::TimedOut.partial().is_none());
    }
}
