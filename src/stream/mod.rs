//! Stream API: reader/writer pairs on top of transports.
//!
//! ```text
//! Transport ──data_received──► StreamReaderProtocol ──feed_data──► StreamReader
//!     ▲                                                                 │
//!     └──────────── write / drain / close ◄── StreamWriter              ▼
//!                                                            read_exactly / read_line
//! ```
//!
//! [`open_unix_connection`] gives a client its pair directly;
//! [`start_unix_server`] hands one pair per accepted connection to a
//! handler that runs as its own task.

mod protocol;
mod reader;
mod writer;

pub use reader::StreamReader;
pub use writer::StreamWriter;

use std::fmt::Display;
use std::future::Future;
use std::rc::Rc;

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::socket::handle::SocketHandle;
use crate::socket::server::{create_unix_server, Server};
use crate::socket::UnixTarget;
use crate::transport::{Protocol, Transport};

use protocol::{ConnectedCallback, StreamReaderProtocol};

/// Open a transport to `target` driven by `protocol`.
///
/// A path target is dialed with a fresh socket; a socket target must
/// already be connected.
///
/// # Errors
///
/// `FileNotFound` if nothing exists at the path, `ConnectionRefused` if a
/// socket file exists but nothing listens on it (both satisfy
/// [`TransportError::is_not_found`]), `BadDescriptor` for a closed socket,
/// or any other connect failure.
///
/// # Panics
///
/// Panics if called outside an [`EventLoop`](crate::EventLoop) (or another
/// `LocalSet`), since the transport runs as a local task.
pub async fn create_unix_connection<P>(
    protocol: P,
    target: impl Into<UnixTarget>,
    config: &TransportConfig,
) -> Result<Transport>
where
    P: Protocol + 'static,
{
    config.validate()?;
    match target.into() {
        UnixTarget::Path(path) => {
            let sock = SocketHandle::stream()?;
            Transport::connect(sock, &path, Box::new(protocol), config).await
        }
        UnixTarget::Socket(sock) => Transport::attach(sock, Box::new(protocol), config, None),
    }
}

/// Connect to `target` and return its reader and writer.
///
/// Fails like [`create_unix_connection`]; a path with no listener behind it
/// is reported as `FileNotFound` or `ConnectionRefused`, see
/// [`TransportError::is_not_found`].
///
/// # Panics
///
/// Panics if called outside an [`EventLoop`](crate::EventLoop) (or another
/// `LocalSet`).
pub async fn open_unix_connection(
    target: impl Into<UnixTarget>,
    config: &TransportConfig,
) -> Result<(StreamReader, StreamWriter)> {
    let reader = StreamReader::new(config.read_limit);
    let protocol = StreamReaderProtocol::new(reader.clone());
    let transport = create_unix_connection(protocol, target, config).await?;
    let writer = StreamWriter::new(transport, Some(reader.clone()));
    Ok((reader, writer))
}

/// Serve `target`, running `handler` once per accepted connection.
///
/// Each handler runs as a separate task. A handler error is logged and does
/// not affect other connections; the writer it was given closes the
/// connection when dropped.
///
/// # Panics
///
/// Panics if called outside an [`EventLoop`](crate::EventLoop) (or another
/// `LocalSet`), since the accept loop and handlers run as local tasks.
pub fn start_unix_server<H, Fut, E>(
    handler: H,
    target: impl Into<UnixTarget>,
    config: &TransportConfig,
) -> Result<Server>
where
    H: Fn(StreamReader, StreamWriter) -> Fut + 'static,
    Fut: Future<Output = std::result::Result<(), E>> + 'static,
    E: Display + 'static,
{
    let spawn_handler = move |reader: StreamReader, writer: StreamWriter| {
        let id = writer.transport().id();
        let fut = handler(reader, writer);
        tokio::task::spawn_local(async move {
            if let Err(e) = fut.await {
                log::warn!("[Server] Handler for connection #{id} failed: {e}");
            }
        });
    };
    let on_connected: ConnectedCallback = Rc::new(spawn_handler);

    let limit = config.read_limit;
    let factory = move || {
        StreamReaderProtocol::with_callback(StreamReader::new(limit), Rc::clone(&on_connected))
    };
    create_unix_server(factory, target, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{wait_for, EventLoop};
    use std::time::Duration;

    #[test]
    fn test_stream_round_trip() {
        let lp = EventLoop::new().unwrap();
        lp.run_until_complete(async {
            let tmp = tempfile::TempDir::new().unwrap();
            let path = tmp.path().join("stream.sock");
            let config = TransportConfig::default();

            let server = start_unix_server(
                |reader: StreamReader, writer: StreamWriter| async move {
                    let line = reader.read_line().await?;
                    writer.write(b"echo: ")?;
                    writer.write(&line)?;
                    writer.drain().await?;
                    Ok::<_, TransportError>(())
                },
                &path,
                &config,
            )
            .unwrap();

            let (reader, writer) = open_unix_connection(&path, &config).await.unwrap();
            writer.write_lines([&b"hi"[..], &b"\n"[..]]).unwrap();
            let reply = wait_for(Duration::from_secs(2), reader.read_to_end())
                .await
                .expect("Timed out waiting for reply")
                .unwrap();
            assert_eq!(&reply[..], b"echo: hi\n");

            writer.close();
            writer.wait_closed().await;
            server.close();
            wait_for(Duration::from_secs(2), server.wait_closed())
                .await
                .expect("Timed out waiting for server");
        });
    }

    #[test]
    fn test_handler_error_does_not_stop_server() {
        let lp = EventLoop::new().unwrap();
        lp.run_until_complete(async {
            let tmp = tempfile::TempDir::new().unwrap();
            let path = tmp.path().join("failing.sock");
            let config = TransportConfig::default();

            let server = start_unix_server(
                |reader: StreamReader, writer: StreamWriter| async move {
                    let first = reader.read_exactly(1).await?;
                    if &first[..] == b"x" {
                        return Err(TransportError::Closing);
                    }
                    writer.write(b"ok")?;
                    Ok::<_, TransportError>(())
                },
                &path,
                &config,
            )
            .unwrap();

            let (bad_reader, bad_writer) = open_unix_connection(&path, &config).await.unwrap();
            bad_writer.write(b"x").unwrap();
            assert!(bad_reader.read_to_end().await.unwrap().is_empty());

            let (reader, writer) = open_unix_connection(&path, &config).await.unwrap();
            writer.write(b"y").unwrap();
            assert_eq!(&reader.read_exactly(2).await.unwrap()[..], b"ok");
            server.close();
        });
    }

    #[test]
    fn test_open_connection_missing_path() {
        let lp = EventLoop::new().unwrap();
        lp.run_until_complete(async {
            let tmp = tempfile::TempDir::new().unwrap();
            let err = open_unix_connection(tmp.path().join("nope.sock"), &TransportConfig::default())
                .await
                .unwrap_err();
            assert!(matches!(err, TransportError::FileNotFound { .. }));
        });
    }
}
