//! Listening server for Unix-domain stream sockets.
//!
//! Binds a path (or adopts a bound socket), listens, and spawns an accept
//! loop that opens a [`Transport`] with a fresh protocol for every accepted
//! connection. Closing the server stops the accept loop and releases the
//! listening descriptor; connections already accepted keep running until
//! they close on their own or [`Server::close_clients`] is called.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::handle::{check_path_len, SocketHandle};
use super::UnixTarget;
use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::transport::{Protocol, Transport};

struct ServerInner {
    sockets: Vec<SocketHandle>,
    /// Set only when the server created the socket file.
    path: Option<PathBuf>,
    serving: Cell<bool>,
    accept_task: RefCell<Option<JoinHandle<()>>>,
    connections: RefCell<HashMap<u64, Transport>>,
    idle: Notify,
    closed: CancellationToken,
    config: TransportConfig,
}

/// Handle to a listening server. Clones refer to the same server.
///
/// Dropping the last handle closes the server.
#[derive(Clone)]
pub struct Server {
    inner: Rc<ServerInner>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("path", &self.inner.path)
            .field("serving", &self.inner.serving.get())
            .field("connections", &self.inner.connections.borrow().len())
            .finish_non_exhaustive()
    }
}

/// Start listening on `target`, creating a protocol per connection.
///
/// With a path target, a stale socket file at the path is removed first and
/// the file is removed again on [`Server::close`]. A socket target must
/// already be bound; its path is never touched.
///
/// # Errors
///
/// `PathTooLong` if the path does not fit in `sun_path`, `BadDescriptor`
/// for a closed socket target, or the bind/listen failure.
///
/// # Panics
///
/// Panics if called outside an [`EventLoop`](crate::EventLoop) (or another
/// `LocalSet`): the accept loop is spawned as a local task.
pub fn create_unix_server<F, P>(
    factory: F,
    target: impl Into<UnixTarget>,
    config: &TransportConfig,
) -> Result<Server>
where
    F: Fn() -> P + 'static,
    P: Protocol + 'static,
{
    config.validate()?;

    let (sock, path) = match target.into() {
        UnixTarget::Path(path) => (bind_path(&path)?, Some(path)),
        UnixTarget::Socket(sock) => {
            if sock.is_closed() {
                return Err(TransportError::BadDescriptor);
            }
            (sock, None)
        }
    };

    if let Err(err) = sock.listen(config.backlog) {
        sock.close();
        if let Some(path) = &path {
            remove_socket_file(path);
        }
        return Err(err);
    }

    let inner = Rc::new(ServerInner {
        sockets: vec![sock.clone()],
        path,
        serving: Cell::new(true),
        accept_task: RefCell::new(None),
        connections: RefCell::new(HashMap::new()),
        idle: Notify::new(),
        closed: CancellationToken::new(),
        config: config.clone(),
    });

    let task = tokio::task::spawn_local(accept_loop(
        Rc::downgrade(&inner),
        sock.clone(),
        factory,
        config.accept_retry_delay(),
    ));
    *inner.accept_task.borrow_mut() = Some(task);

    match sock.local_path() {
        Ok(Some(local)) => log::info!("[Server] Listening on {}", local.display()),
        _ => log::info!("[Server] Listening on fd {}", sock.fileno()),
    }

    Ok(Server { inner })
}

fn bind_path(path: &Path) -> Result<SocketHandle> {
    check_path_len(path)?;

    // Remove a socket file left behind by a previous run
    if let Ok(meta) = fs::symlink_metadata(path) {
        if meta.file_type().is_socket() {
            log::info!("[Server] Removing stale socket {}", path.display());
            fs::remove_file(path).map_err(|e| TransportError::at_path(e, path))?;
        }
    }

    let sock = SocketHandle::stream()?;
    sock.bind(path)?;
    Ok(sock)
}

fn remove_socket_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => log::debug!("[Server] Removed {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("[Server] Failed to remove {}: {e}", path.display()),
    }
}

/// Accept loop. Runs as a local task until the listening socket is closed.
async fn accept_loop<F, P>(
    server: Weak<ServerInner>,
    listener: SocketHandle,
    factory: F,
    retry_delay: Duration,
) where
    F: Fn() -> P,
    P: Protocol + 'static,
{
    loop {
        match listener.accept().await {
            Ok(sock) => {
                let Some(inner) = server.upgrade() else {
                    sock.close();
                    break;
                };
                inner.adopt(sock, Box::new(factory()));
            }
            Err(TransportError::BadDescriptor) => {
                log::debug!("[Server] Listening socket closed, stopping accept loop");
                break;
            }
            Err(e) => {
                log::error!("[Server] Accept error: {e}");
                tokio::time::sleep(retry_delay).await;
            }
        }
    }
}

impl ServerInner {
    fn adopt(self: &Rc<Self>, sock: SocketHandle, protocol: Box<dyn Protocol>) {
        let server = Rc::downgrade(self);
        let on_closed: Box<dyn FnOnce(u64)> = Box::new(move |id| {
            if let Some(inner) = server.upgrade() {
                inner.forget(id);
            }
        });

        match Transport::attach(sock, protocol, &self.config, Some(on_closed)) {
            Ok(transport) => {
                log::info!("[Server] Client connected: #{}", transport.id());
                self.connections
                    .borrow_mut()
                    .insert(transport.id(), transport);
            }
            Err(e) => log::warn!("[Server] Failed to open accepted connection: {e}"),
        }
    }

    fn forget(&self, id: u64) {
        let remaining = {
            let mut connections = self.connections.borrow_mut();
            connections.remove(&id);
            connections.len()
        };
        log::info!("[Server] Client disconnected: #{id}");
        if remaining == 0 {
            self.idle.notify_waiters();
        }
    }

    fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.serving.set(false);

        let task = self.accept_task.borrow_mut().take();
        if let Some(task) = task {
            task.abort();
        }
        for sock in &self.sockets {
            sock.close();
        }
        if let Some(path) = &self.path {
            remove_socket_file(path);
        }

        self.closed.cancel();
        log::info!("[Server] Closed");
        self.idle.notify_waiters();
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        self.close();
    }
}

impl Server {
    /// Stop accepting and release the listening socket.
    ///
    /// Live connections are not touched. Calling it again does nothing.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Close every live connection gracefully.
    pub fn close_clients(&self) {
        for transport in self.connections() {
            transport.close();
        }
    }

    /// Abort every live connection, discarding unsent data.
    pub fn abort_clients(&self) {
        for transport in self.connections() {
            transport.abort();
        }
    }

    /// Listening sockets. After [`close`](Self::close) their `fileno()` is `-1`.
    pub fn sockets(&self) -> Vec<SocketHandle> {
        self.inner.sockets.clone()
    }

    /// Live connections accepted by this server.
    pub fn connections(&self) -> Vec<Transport> {
        self.inner.connections.borrow().values().cloned().collect()
    }

    /// Number of live connections.
    pub fn active_connections(&self) -> usize {
        self.inner.connections.borrow().len()
    }

    /// `true` until [`close`](Self::close).
    pub fn is_serving(&self) -> bool {
        self.inner.serving.get()
    }

    /// Socket path owned by the server, if it created one.
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// Suspend until the server is closed and every connection has finished.
    pub async fn wait_closed(&self) {
        self.inner.closed.cancelled().await;
        loop {
            let idle = self.inner.idle.notified();
            if self.inner.connections.borrow().is_empty() {
                return;
            }
            idle.await;
        }
    }

    /// Suspend until the server is closed.
    pub async fn serve_forever(&self) {
        self.inner.closed.cancelled().await;
    }
}
