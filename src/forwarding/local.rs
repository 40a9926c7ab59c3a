//! Local Port Forwarding
//!
//! Forwards connections from a local port to a remote host:port through SSH.
//! Example: Forward local:8888 -> remote_jupyter:8888

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::bridge::splice;
use super::error::{bind_error, ForwardError};
use super::lifecycle::ForwardLifecycle;
use super::stats::{ForwardStats, StatsCounters};
use crate::ssh::TunnelSession;

/// Local port forwarding configuration
#[derive(Debug, Clone)]
pub struct LocalForward {
    /// Local address to bind to (e.g., "127.0.0.1")
    pub bind_host: String,
    /// Local port, 0 lets the OS choose
    pub bind_port: u16,
    /// Host to reach, as seen from the SSH server
    pub remote_host: String,
    pub remote_port: u16,
}

impl LocalForward {
    pub fn new(
        bind_host: impl Into<String>,
        bind_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            bind_host: bind_host.into(),
            bind_port,
            remote_host: remote_host.into(),
            remote_port,
        }
    }
}

/// Handle to a running local port forward
pub struct LocalForwardHandle {
    pub config: LocalForward,
    /// Actual bound address (differs from the request when port 0 was asked)
    pub bound_addr: SocketAddr,
    lifecycle: Arc<ForwardLifecycle>,
}

impl LocalForwardHandle {
    pub fn bound_port(&self) -> u16 {
        self.bound_addr.port()
    }

    pub fn stats(&self) -> ForwardStats {
        self.lifecycle.stats()
    }

    pub fn lifecycle(&self) -> &Arc<ForwardLifecycle> {
        &self.lifecycle
    }

    /// Close the listener, then drain connections for up to `drain`
    pub async fn stop(&self, drain: Duration) {
        info!("Stopping local port forward on {}", self.bound_addr);
        self.lifecycle.shutdown(drain).await;
    }
}

/// Bind the local listener; `host:0` binds an OS-chosen port
pub(crate) async fn bind_listener(host: &str, port: u16) -> Result<TcpListener, ForwardError> {
    let addr = display_addr(host, port);
    TcpListener::bind((host, port))
        .await
        .map_err(|e| bind_error(&addr, &e))
}

pub(crate) fn display_addr(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Start local port forwarding
///
/// Binds the local address and spawns an accept task. Each accepted
/// connection opens a direct-tcpip channel to `remote_host:remote_port` and
/// is spliced with it. A channel that cannot be opened only closes that
/// one connection.
pub async fn start_local_forward(
    session: Arc<dyn TunnelSession>,
    config: LocalForward,
    idle_timeout: Duration,
) -> Result<LocalForwardHandle, ForwardError> {
    let listener = bind_listener(&config.bind_host, config.bind_port).await?;
    let bound_addr = listener.local_addr().map_err(|e| ForwardError::Bind {
        addr: display_addr(&config.bind_host, config.bind_port),
        reason: e.to_string(),
    })?;

    info!(
        "Started local port forward: {} -> {}:{}",
        bound_addr, config.remote_host, config.remote_port
    );

    let lifecycle = ForwardLifecycle::new();
    let counters = lifecycle.counters();
    let remote_host = config.remote_host.clone();
    let remote_port = config.remote_port;

    lifecycle.spawn_tcp_accept(
        listener,
        format!("local forward {}", bound_addr),
        move |stream, peer| {
            handle_connection(
                session.clone(),
                stream,
                peer,
                remote_host.clone(),
                remote_port,
                idle_timeout,
                counters.clone(),
            )
        },
    );

    Ok(LocalForwardHandle {
        config,
        bound_addr,
        lifecycle,
    })
}

async fn handle_connection(
    session: Arc<dyn TunnelSession>,
    stream: TcpStream,
    peer: SocketAddr,
    remote_host: String,
    remote_port: u16,
    idle_timeout: Duration,
    counters: Arc<StatsCounters>,
) {
    let channel = match session.open_channel(&remote_host, remote_port).await {
        Ok(channel) => channel,
        Err(e) => {
            warn!(
                "Failed to open channel to {}:{} for {}: {}",
                remote_host, remote_port, peer, e
            );
            return;
        }
    };

    debug!("Opened channel for {} -> {}:{}", peer, remote_host, remote_port);
    splice(stream, channel, idle_timeout, &counters).await;
    debug!("Forward connection from {} closed", peer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ChannelMode, FakeSession};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_forwards_through_channel() {
        let session = FakeSession::new(ChannelMode::Echo);
        let handle = start_local_forward(
            session.clone(),
            LocalForward::new("127.0.0.1", 0, "db.internal", 5432),
            Duration::from_secs(30),
        )
        .await
        .unwrap();
        assert_ne!(handle.bound_port(), 0);

        let mut client = TcpStream::connect(handle.bound_addr).await.unwrap();
        client.write_all(b"select 1").await.unwrap();
        let mut buf = [0u8; 8];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"select 1");

        assert_eq!(session.opened(), vec![("db.internal".to_string(), 5432)]);
        assert_eq!(handle.stats().connection_count, 1);

        drop(client);
        handle.stop(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn test_refused_channel_closes_only_that_connection() {
        let session = FakeSession::new(ChannelMode::Refuse);
        let handle = start_local_forward(
            session.clone(),
            LocalForward::new("127.0.0.1", 0, "nowhere", 1),
            Duration::from_secs(30),
        )
        .await
        .unwrap();

        for _ in 0..2 {
            let mut client = TcpStream::connect(handle.bound_addr).await.unwrap();
            let mut buf = [0u8; 1];
            assert_eq!(client.read(&mut buf).await.unwrap_or(0), 0);
        }
        assert_eq!(session.opened().len(), 2);

        handle.stop(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let session = FakeSession::new(ChannelMode::Echo);

        let result = start_local_forward(
            session,
            LocalForward::new("127.0.0.1", port, "db", 5432),
            Duration::from_secs(30),
        )
        .await;
        assert!(matches!(result, Err(ForwardError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_stop_drains_in_flight_connection() {
        let session = FakeSession::new(ChannelMode::Echo);
        let handle = start_local_forward(
            session,
            LocalForward::new("127.0.0.1", 0, "app", 80),
            Duration::from_secs(30),
        )
        .await
        .unwrap();

        let mut client = TcpStream::connect(handle.bound_addr).await.unwrap();
        client.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        client.read_exact(&mut buf).await.unwrap();

        let started = std::time::Instant::now();
        handle.stop(Duration::from_millis(200)).await;
        assert!(started.elapsed() >= Duration::from_millis(200));

        // New connections are refused, the in-flight one was force-closed
        assert!(TcpStream::connect(handle.bound_addr).await.is_err());
        assert_eq!(client.read(&mut buf).await.unwrap_or(0), 0);
        assert_eq!(handle.stats().active_connections, 0);
    }

    #[tokio::test]
    async fn test_stop_returns_early_when_connection_finishes() {
        let session = FakeSession::new(ChannelMode::Echo);
        let handle = start_local_forward(
            session,
            LocalForward::new("127.0.0.1", 0, "app", 80),
            Duration::from_secs(30),
        )
        .await
        .unwrap();

        let mut client = TcpStream::connect(handle.bound_addr).await.unwrap();
        client.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        client.read_exact(&mut buf).await.unwrap();

        let closer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(client);
        });

        let started = std::time::Instant::now();
        handle.stop(Duration::from_secs(5)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        closer.await.unwrap();
    }
}
