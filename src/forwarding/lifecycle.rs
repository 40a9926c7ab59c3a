//! Listener and connection task lifecycle shared by the forwarding engines
//!
//! A forward owns one accept task and any number of connection tasks.
//! Stopping it cancels the accept task (dropping the listener), waits for
//! connection tasks up to the drain timeout, then force-closes the rest.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::stats::{ForwardStats, StatsCounters};

/// Grace period for force-closed tasks to unwind
const KILL_GRACE: Duration = Duration::from_secs(1);

pub struct ForwardLifecycle {
    /// Stops the accept task
    stop: CancellationToken,
    /// Force-closes connection tasks
    kill: CancellationToken,
    /// Fires once the accept task has exited, for whatever reason
    done: CancellationToken,
    tracker: TaskTracker,
    counters: Arc<StatsCounters>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ForwardLifecycle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            stop: CancellationToken::new(),
            kill: CancellationToken::new(),
            done: CancellationToken::new(),
            tracker: TaskTracker::new(),
            counters: Arc::new(StatsCounters::default()),
            accept_task: Mutex::new(None),
        })
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn counters(&self) -> Arc<StatsCounters> {
        self.counters.clone()
    }

    pub fn stats(&self) -> ForwardStats {
        self.counters.snapshot()
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Resolves once the accept task is gone (stopped or failed)
    pub async fn finished(&self) {
        self.done.cancelled().await
    }

    /// Run one connection as a tracked, killable task
    pub fn spawn_connection<F>(&self, conn: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let kill = self.kill.clone();
        let guard = self.counters.open_connection();
        self.tracker.spawn(async move {
            let _guard = guard;
            tokio::select! {
                _ = kill.cancelled() => debug!("Connection force-closed"),
                _ = conn => {}
            }
        });
    }

    /// Spawn the accept task; `run` must return once the stop token fires
    pub fn spawn_accept<F>(&self, run: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let done = self.done.clone();
        let handle = tokio::spawn(async move {
            run.await;
            done.cancel();
        });
        *self.accept_task.lock() = Some(handle);
    }

    /// Accept TCP connections on `listener` until stopped
    pub fn spawn_tcp_accept<H, Fut>(self: &Arc<Self>, listener: TcpListener, label: String, on_conn: H)
    where
        H: Fn(TcpStream, SocketAddr) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let lifecycle = self.clone();
        let stop = self.stop.clone();
        self.spawn_accept(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => {
                        debug!("{}: stopped accepting", label);
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            // Disable Nagle's algorithm for low-latency forwarding
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY: {}", e);
                            }
                            debug!("{}: accepted connection from {}", label, peer);
                            lifecycle.spawn_connection(on_conn(stream, peer));
                        }
                        Err(e) => {
                            error!("{}: accept error: {}", label, e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
            drop(listener);
        });
    }

    /// Stop accepting, drain in-flight connections for up to `drain`, then force-close.
    ///
    /// Never fails; a drain timeout is only logged.
    pub async fn shutdown(&self, drain: Duration) {
        self.stop.cancel();
        let accept = self.accept_task.lock().take();
        if let Some(handle) = accept {
            let _ = handle.await;
        }

        self.tracker.close();
        if self.tracker.is_empty() {
            return;
        }

        if tokio::time::timeout(drain, self.tracker.wait()).await.is_err() {
            warn!(
                "{} connection(s) still open after {}ms drain, closing them",
                self.tracker.len(),
                drain.as_millis()
            );
            self.kill.cancel();
            if tokio::time::timeout(KILL_GRACE, self.tracker.wait())
                .await
                .is_err()
            {
                warn!("{} connection(s) did not unwind", self.tracker.len());
            }
        } else {
            info!("All connections drained");
        }
    }
}
