//! Crate-wide constants.
//!
//! Defaults for [`TransportConfig`](crate::config::TransportConfig) and the
//! fixed timings used by the socket layer live here so they can be found in
//! one place.
//!
//! # Categories
//!
//! - **Buffers**: reader limit, read chunk, write water marks
//! - **Server**: backlog and accept retry
//! - **Socket**: connect backoff and path limits

use std::time::Duration;

// ============================================================================
// Buffers
// ============================================================================

/// Default stream reader limit (64 KiB).
///
/// `read_until`/`read_line` give up once this many bytes are buffered
/// without a separator, and reading is paused on the transport while more
/// than twice this amount is buffered.
pub const DEFAULT_READ_LIMIT: usize = 64 * 1024;

/// Default size of a single `recv` issued by a transport (64 KiB).
pub const DEFAULT_READ_CHUNK_SIZE: usize = 64 * 1024;

/// Default write buffer high-water mark (64 KiB).
///
/// Crossing it calls the protocol's `pause_writing`.
pub const DEFAULT_WRITE_HIGH_WATER: usize = 64 * 1024;

/// Default write buffer low-water mark (16 KiB).
///
/// `drain()` returns once the buffer is at or below this size, and the
/// protocol's `resume_writing` fires when the buffer falls back to it.
pub const DEFAULT_WRITE_LOW_WATER: usize = DEFAULT_WRITE_HIGH_WATER / 4;

// ============================================================================
// Server
// ============================================================================

/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 100;

/// Delay before the accept loop retries after a failed `accept`.
///
/// Typical causes are `EMFILE`/`ENFILE`; retrying immediately would spin.
pub const DEFAULT_ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

// ============================================================================
// Socket
// ============================================================================

/// Backoff before re-issuing a non-blocking `connect` that returned `EAGAIN`.
///
/// On Unix-domain sockets `EAGAIN` means the listener's backlog is full; the
/// connect was not started, so there is no readiness edge to wait for.
pub const CONNECT_BACKOFF: Duration = Duration::from_millis(5);

/// Largest socket path accepted, excluding the trailing NUL.
///
/// `sun_path` is 108 bytes on Linux and 104 on macOS.
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
pub const MAX_SOCKET_PATH: usize = 103;

/// Largest socket path accepted, excluding the trailing NUL.
///
/// `sun_path` is 108 bytes on Linux and 104 on macOS.
#[cfg(not(any(target_os = "macos", target_os = "ios", target_os = "freebsd")))]
pub const MAX_SOCKET_PATH: usize = 107;

/// Environment variable naming an optional JSON configuration file.
pub const CONFIG_FILE_ENV: &str = "UDSIO_CONFIG";
