//! Dynamic SOCKS5 Proxy Forwarding
//!
//! Implements a local SOCKS5 proxy server that tunnels connections through SSH.
//! Example: Local SOCKS5 proxy on 127.0.0.1:1080 -> SSH tunnel -> any destination

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::bridge::splice;
use super::error::ForwardError;
use super::lifecycle::ForwardLifecycle;
use super::local::{bind_listener, display_addr};
use super::socks5::{self, Socks5Error};
use super::stats::{ForwardStats, StatsCounters};
use crate::ssh::TunnelSession;

/// Dynamic (SOCKS5) port forwarding configuration
#[derive(Debug, Clone)]
pub struct DynamicForward {
    /// Local address to bind the proxy to (e.g., "127.0.0.1")
    pub bind_host: String,
    /// Local port, 0 lets the OS choose
    pub bind_port: u16,
}

impl DynamicForward {
    pub fn new(bind_host: impl Into<String>, bind_port: u16) -> Self {
        Self {
            bind_host: bind_host.into(),
            bind_port,
        }
    }
}

/// Handle to a running SOCKS5 proxy
pub struct DynamicForwardHandle {
    pub config: DynamicForward,
    pub bound_addr: SocketAddr,
    lifecycle: Arc<ForwardLifecycle>,
}

impl DynamicForwardHandle {
    pub fn bound_port(&self) -> u16 {
        self.bound_addr.port()
    }

    pub fn stats(&self) -> ForwardStats {
        self.lifecycle.stats()
    }

    pub fn lifecycle(&self) -> &Arc<ForwardLifecycle> {
        &self.lifecycle
    }

    pub async fn stop(&self, drain: Duration) {
        info!("Stopping SOCKS5 proxy on {}", self.bound_addr);
        self.lifecycle.shutdown(drain).await;
    }
}

/// Start dynamic (SOCKS5) port forwarding
///
/// Every client connection negotiates on its own; a malformed greeting or
/// request closes that connection and nothing else.
pub async fn start_dynamic_forward(
    session: Arc<dyn TunnelSession>,
    config: DynamicForward,
    idle_timeout: Duration,
) -> Result<DynamicForwardHandle, ForwardError> {
    let listener = bind_listener(&config.bind_host, config.bind_port).await?;
    let bound_addr = listener.local_addr().map_err(|e| ForwardError::Bind {
        addr: display_addr(&config.bind_host, config.bind_port),
        reason: e.to_string(),
    })?;

    info!("Started SOCKS5 proxy on {}", bound_addr);

    let lifecycle = ForwardLifecycle::new();
    let counters = lifecycle.counters();

    lifecycle.spawn_tcp_accept(
        listener,
        format!("SOCKS5 proxy {}", bound_addr),
        move |stream, peer| {
            let session = session.clone();
            let counters = counters.clone();
            async move {
                if let Err(e) =
                    handle_socks5_connection(session, stream, idle_timeout, counters).await
                {
                    debug!("SOCKS5 connection from {} closed: {}", peer, e);
                }
            }
        },
    );

    Ok(DynamicForwardHandle {
        config,
        bound_addr,
        lifecycle,
    })
}

async fn handle_socks5_connection(
    session: Arc<dyn TunnelSession>,
    mut stream: TcpStream,
    idle_timeout: Duration,
    counters: Arc<StatsCounters>,
) -> Result<(), ForwardError> {
    socks5::accept_greeting(&mut stream).await.map_err(protocol)?;
    let target = socks5::read_request(&mut stream).await.map_err(protocol)?;

    debug!("SOCKS5: connecting to {}:{}", target.host, target.port);

    let channel = match session.open_channel(&target.host, target.port).await {
        Ok(channel) => channel,
        Err(e) => {
            warn!(
                "Failed to open SSH channel to {}:{}: {}",
                target.host, target.port, e
            );
            socks5::send_reply(&mut stream, socks5::REP_GENERAL_FAILURE)
                .await
                .map_err(protocol)?;
            return Ok(());
        }
    };

    socks5::send_reply(&mut stream, socks5::REP_SUCCESS)
        .await
        .map_err(protocol)?;

    debug!("SOCKS5: tunnel established to {}:{}", target.host, target.port);
    splice(stream, channel, idle_timeout, &counters).await;
    Ok(())
}

fn protocol(err: Socks5Error) -> ForwardError {
    ForwardError::Protocol(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ChannelMode, FakeSession};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn proxy(mode: ChannelMode) -> (Arc<FakeSession>, DynamicForwardHandle) {
        let session = FakeSession::new(mode);
        let handle = start_dynamic_forward(
            session.clone(),
            DynamicForward::new("127.0.0.1", 0),
            Duration::from_secs(30),
        )
        .await
        .unwrap();
        (session, handle)
    }

    async fn greet(client: &mut TcpStream) {
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn test_ipv4_connect_success() {
        let (session, handle) = proxy(ChannelMode::Echo).await;
        let mut client = TcpStream::connect(handle.bound_addr).await.unwrap();
        greet(&mut client).await;

        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 192, 168, 1, 20, 0x00, 0x50])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
        assert_eq!(session.opened(), vec![("192.168.1.20".to_string(), 80)]);

        client.write_all(b"GET /").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"GET /");

        drop(client);
        handle.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_connect_to_documentation_address() {
        let (session, handle) = proxy(ChannelMode::Echo).await;
        let mut client = TcpStream::connect(handle.bound_addr).await.unwrap();
        greet(&mut client).await;

        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 0xC0, 0x00, 0x02, 0x01, 0x00, 0x50])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(
            reply,
            [0x05, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
        assert_eq!(session.opened(), vec![("192.0.2.1".to_string(), 80)]);

        drop(client);
        handle.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_bad_atyp_then_listener_still_accepts() {
        let (session, handle) = proxy(ChannelMode::Echo).await;

        let mut bad = TcpStream::connect(handle.bound_addr).await.unwrap();
        greet(&mut bad).await;
        bad.write_all(&[0x05, 0x01, 0x00, 0x05]).await.unwrap();
        let mut reply = [0u8; 10];
        bad.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x08, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
        let mut rest = [0u8; 1];
        assert_eq!(bad.read(&mut rest).await.unwrap_or(0), 0);

        let mut good = TcpStream::connect(handle.bound_addr).await.unwrap();
        greet(&mut good).await;
        let mut req = vec![0x05, 0x01, 0x00, 0x03, 9];
        req.extend_from_slice(b"localhost");
        req.extend_from_slice(&8080u16.to_be_bytes());
        good.write_all(&req).await.unwrap();
        good.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], socks5::REP_SUCCESS);
        assert_eq!(session.opened(), vec![("localhost".to_string(), 8080)]);

        drop(good);
        handle.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_channel_failure_replies_general_failure() {
        let (_session, handle) = proxy(ChannelMode::Refuse).await;
        let mut client = TcpStream::connect(handle.bound_addr).await.unwrap();
        greet(&mut client).await;

        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 1, 0x01, 0xBB])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

        handle.stop(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_bad_version_closes_without_reply() {
        let (_session, handle) = proxy(ChannelMode::Echo).await;
        let mut client = TcpStream::connect(handle.bound_addr).await.unwrap();
        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();

        let mut buf = [0u8; 2];
        assert_eq!(client.read(&mut buf).await.unwrap_or(0), 0);

        handle.stop(Duration::from_millis(100)).await;
    }
}
