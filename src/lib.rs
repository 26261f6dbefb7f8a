//! udsio - asynchronous Unix-domain-socket transports.
//!
//! Turns non-blocking `AF_UNIX` stream sockets into backpressure-aware byte
//! streams on a single-threaded dispatcher. Everything here is `!Send` and
//! runs inside an [`EventLoop`] (a tokio current-thread runtime plus a
//! `LocalSet`).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ stream     StreamReader / StreamWriter, open/start_*     │
//! ├──────────────────────────────────────────────────────────┤
//! │ transport  Transport + Protocol callbacks, write buffer  │
//! ├──────────────────────────────────────────────────────────┤
//! │ socket     SocketHandle, Server (accept loop)            │
//! ├──────────────────────────────────────────────────────────┤
//! │ reactor    fd → readiness registration (AsyncFd)         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`runtime`] - Event loop and scheduling helpers
//! - [`reactor`] - Readiness multiplexer
//! - [`socket`] - Socket handles and the listening server
//! - [`transport`] - Transport state machine and the `Protocol` trait
//! - [`stream`] - Stream reader/writer API
//! - [`config`] - Configuration loading

pub mod config;
pub mod constants;
pub mod error;
pub mod reactor;
pub mod runtime;
pub mod socket;
pub mod stream;
pub mod transport;

// Re-export commonly used types
pub use config::TransportConfig;
pub use error::{Direction, Result, TransportError};
pub use runtime::{gather, sleep, spawn, wait_for, EventLoop};
pub use socket::handle::SocketHandle;
pub use socket::server::{create_unix_server, Server};
pub use socket::UnixTarget;
pub use stream::{
    create_unix_connection, open_unix_connection, start_unix_server, StreamReader, StreamWriter,
};
pub use transport::{Phase, Protocol, Transport};
