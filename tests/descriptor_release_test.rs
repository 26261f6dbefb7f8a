// Descriptor accounting across dropped event loops.
// Run with: cargo test --test descriptor_release_test
//
// Kept in its own test binary with a single test: the fd count is
// process-wide, so other tests must not open sockets concurrently.

#![cfg(target_os = "linux")]

use std::os::unix::net::UnixListener;

use tempfile::TempDir;
use udsio::{open_unix_connection, reactor, EventLoop, TransportConfig};

fn open_fds() -> usize {
    std::fs::read_dir("/proc/self/fd").unwrap().count()
}

/// Open a stream connection and drop both halves without giving the
/// transport a chance to run.
fn connect_and_drop(path: &std::path::Path) {
    let lp = EventLoop::new().unwrap();
    lp.run_until_complete(async {
        let (reader, writer) = open_unix_connection(path, &TransportConfig::default())
            .await
            .unwrap();
        writer.write(b"AAAA").unwrap();
        drop(writer);
        drop(reader);
    });
}

/// Test a dropped loop releases stream connections it never finished
#[test]
fn test_dropped_loop_releases_stream_descriptors() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("sock");
    // Never accepts; connections wait in the backlog
    let _listener = UnixListener::bind(&path).unwrap();

    // Warm up lazily created runtime state
    connect_and_drop(&path);
    let before = open_fds();

    for _ in 0..5 {
        connect_and_drop(&path);
    }

    assert_eq!(reactor::registered_descriptors(), 0);
    assert_eq!(open_fds(), before, "Client sockets leaked after dropping the loop");
}
