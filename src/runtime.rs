//! Single-threaded dispatcher.
//!
//! All sockets, transports and streams in this crate are `!Send`: they share
//! state through `Rc`/`RefCell` and rely on every callback running on one
//! thread. [`EventLoop`] packages the tokio current-thread runtime together
//! with a [`LocalSet`] so `spawn` can run `!Send` tasks.
//!
//! The scheduling helpers (`spawn`, `sleep`, `wait_for`, `gather`) are thin
//! wrappers over tokio so call sites read the same everywhere.

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};
use tokio::task::{JoinHandle, LocalSet};

use crate::error::{Result, TransportError};

/// Current-thread runtime plus the local task set that hosts transports.
pub struct EventLoop {
    // Declared first so pending tasks drop while the runtime is still alive.
    local: LocalSet,
    runtime: Runtime,
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop").finish_non_exhaustive()
    }
}

impl EventLoop {
    /// Build a dispatcher with IO and timers enabled.
    pub fn new() -> io::Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        Ok(Self {
            local: LocalSet::new(),
            runtime,
        })
    }

    /// Drive `future` to completion on this thread.
    ///
    /// Tasks spawned with [`spawn`] while it runs keep running on later
    /// calls; they are dropped with the loop.
    pub fn run_until_complete<F: Future>(&self, future: F) -> F::Output {
        self.local.block_on(&self.runtime, future)
    }
}

/// Spawn a `!Send` task on the current dispatcher.
///
/// Must be called from inside [`EventLoop::run_until_complete`] (or any
/// other `LocalSet` context).
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    tokio::task::spawn_local(future)
}

/// Suspend the calling task for `duration`.
pub async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await;
}

/// Run `future` with a deadline.
///
/// On expiry the future is dropped, which cancels whatever it was waiting
/// on, and [`TransportError::TimedOut`] is returned.
pub async fn wait_for<F: Future>(duration: Duration, future: F) -> Result<F::Output> {
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_elapsed| TransportError::TimedOut)
}

/// Run all `futures` concurrently and collect their outputs in order.
pub async fn gather<I>(futures: I) -> Vec<<I::Item as Future>::Output>
where
    I: IntoIterator,
    I::Item: Future,
{
    futures_util::future::join_all(futures).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_spawned_tasks_share_thread_state() {
        let lp = EventLoop::new().unwrap();
        let counter = Rc::new(Cell::new(0));

        let total = lp.run_until_complete(async {
            let handles: Vec<_> = (0..10)
                .map(|_| {
                    let counter = Rc::clone(&counter);
                    spawn(async move {
                        sleep(Duration::from_millis(1)).await;
                        counter.set(counter.get() + 1);
                    })
                })
                .collect();
            for handle in gather(handles).await {
                handle.unwrap();
            }
            counter.get()
        });

        assert_eq!(total, 10);
    }

    #[test]
    fn test_wait_for_times_out() {
        let lp = EventLoop::new().unwrap();
        let result = lp.run_until_complete(wait_for(
            Duration::from_millis(10),
            sleep(Duration::from_secs(5)),
        ));
        assert!(matches!(result, Err(TransportError::TimedOut)));

        let ok = lp.run_until_complete(wait_for(Duration::from_secs(5), async { 7 }));
        assert_eq!(ok.unwrap(), 7);
    }
}
