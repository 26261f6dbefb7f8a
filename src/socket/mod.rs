//! Unix-domain sockets and the listening server.
//!
//! # Architecture
//!
//! ```text
//! create_unix_server(factory, target)          create_unix_connection(protocol, target)
//! ┌──────────────────────────┐                ┌──────────────────────────┐
//! │ Server                   │                │ SocketHandle::connect    │
//! │  listening SocketHandle  │◄──────────────►│  Transport + Protocol    │
//! │  accept loop (task)      │  AF_UNIX       │                          │
//! │  Transport per accept    │  stream        │                          │
//! └────────────┬─────────────┘                └──────────────────────────┘
//!              │ readiness
//!              ▼
//!          Reactor (fd → AsyncFd registration)
//! ```
//!
//! A target is either a filesystem path or a socket the caller already
//! created; see [`UnixTarget`].

pub mod handle;
pub mod server;

use std::path::{Path, PathBuf};

use handle::SocketHandle;

/// Where a server listens or a client connects.
///
/// For servers, a `Path` target is created, bound and removed on close by
/// the server; a `Socket` target must already be bound and is left alone.
/// For clients, a `Socket` target must already be connected.
#[derive(Debug, Clone)]
pub enum UnixTarget {
    /// Filesystem path of the socket.
    Path(PathBuf),
    /// Pre-existing socket handle.
    Socket(SocketHandle),
}

impl From<PathBuf> for UnixTarget {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<&PathBuf> for UnixTarget {
    fn from(path: &PathBuf) -> Self {
        Self::Path(path.clone())
    }
}

impl From<&Path> for UnixTarget {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

impl From<SocketHandle> for UnixTarget {
    fn from(sock: SocketHandle) -> Self {
        Self::Socket(sock)
    }
}
