//! Splicing two byte streams
//!
//! Two copy loops, one per direction. EOF on one side is passed on as a
//! write shutdown of the other; a read or write error, or no traffic in
//! either direction for the idle timeout, closes both sides.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::debug;

use super::stats::StatsCounters;

const BUF_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpEnd {
    Eof,
    Failed,
}

/// Last time any byte moved, as millis since the splice started
struct Activity {
    started: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_ms.store(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }
}

async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    activity: &Activity,
    on_bytes: impl Fn(u64),
) -> PumpEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                let _ = writer.shutdown().await;
                return PumpEnd::Eof;
            }
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    debug!("Bridge write error: {}", e);
                    return PumpEnd::Failed;
                }
                if let Err(e) = writer.flush().await {
                    debug!("Bridge flush error: {}", e);
                    return PumpEnd::Failed;
                }
                activity.touch();
                on_bytes(n as u64);
            }
            Err(e) => {
                debug!("Bridge read error: {}", e);
                return PumpEnd::Failed;
            }
        }
    }
}

async fn idle_watch(activity: &Activity, idle_timeout: Duration) {
    loop {
        let idle = activity.idle_for();
        if idle >= idle_timeout {
            return;
        }
        tokio::time::sleep(idle_timeout - idle).await;
    }
}

/// Copy bytes between `local` and `remote` until both directions finish.
///
/// Bytes read from `local` count as sent, bytes read from `remote` as received.
pub async fn splice<L, R>(local: L, remote: R, idle_timeout: Duration, counters: &StatsCounters)
where
    L: AsyncRead + AsyncWrite,
    R: AsyncRead + AsyncWrite,
{
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);
    let activity = Activity::new();

    let transfer = async {
        let upstream = pump(&mut local_read, &mut remote_write, &activity, |n| {
            counters.add_sent(n)
        });
        let downstream = pump(&mut remote_read, &mut local_write, &activity, |n| {
            counters.add_received(n)
        });
        tokio::pin!(upstream);
        tokio::pin!(downstream);

        let (mut up_done, mut down_done) = (false, false);
        while !(up_done && down_done) {
            tokio::select! {
                end = &mut upstream, if !up_done => {
                    up_done = true;
                    if end == PumpEnd::Failed {
                        break;
                    }
                }
                end = &mut downstream, if !down_done => {
                    down_done = true;
                    if end == PumpEnd::Failed {
                        break;
                    }
                }
            }
        }
    };

    tokio::select! {
        _ = transfer => {}
        _ = idle_watch(&activity, idle_timeout) => {
            debug!("Connection idle for {}s, closing", idle_timeout.as_secs());
        }
    }

    let _ = local_write.shutdown().await;
    let _ = remote_write.shutdown().await;
}
