//! Remote Port Forwarding
//!
//! Forwards connections from a remote port back to a local host:port through SSH.
//! Example: Remote server:9000 -> local:3000 (expose local service to remote)
//!
//! ## Architecture
//!
//! The server listens after a `tcpip-forward` request. Each connection it
//! accepts arrives as a `forwarded-tcpip` channel, which the session routes
//! to the [`RemoteListener`](crate::ssh::RemoteListener) of the forward that
//! asked for the port. The accept task here pairs each such channel with a
//! fresh TCP connection to the local target.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::bridge::splice;
use super::error::ForwardError;
use super::lifecycle::ForwardLifecycle;
use super::local::display_addr;
use super::stats::{ForwardStats, StatsCounters};
use crate::ssh::{InboundConnection, SshError, TunnelSession};

/// Remote port forwarding configuration
#[derive(Debug, Clone)]
pub struct RemoteForward {
    /// Remote bind address (e.g., "0.0.0.0" or "localhost")
    pub bind_host: String,
    /// Remote port, 0 lets the server choose
    pub bind_port: u16,
    /// Local host inbound connections are relayed to
    pub local_host: String,
    pub local_port: u16,
}

impl RemoteForward {
    pub fn new(
        bind_host: impl Into<String>,
        bind_port: u16,
        local_host: impl Into<String>,
        local_port: u16,
    ) -> Self {
        Self {
            bind_host: bind_host.into(),
            bind_port,
            local_host: local_host.into(),
            local_port,
        }
    }
}

/// Handle to a running remote port forward
pub struct RemoteForwardHandle {
    pub config: RemoteForward,
    /// Actual bound port on the server (differs when 0 was requested)
    pub bound_port: u16,
    session: Arc<dyn TunnelSession>,
    lifecycle: Arc<ForwardLifecycle>,
}

impl RemoteForwardHandle {
    pub fn stats(&self) -> ForwardStats {
        self.lifecycle.stats()
    }

    pub fn lifecycle(&self) -> &Arc<ForwardLifecycle> {
        &self.lifecycle
    }

    /// Cancel the server-side listener, then drain connections for up to `drain`
    pub async fn stop(&self, drain: Duration) {
        info!(
            "Stopping remote port forward {}",
            display_addr(&self.config.bind_host, self.bound_port)
        );

        match self
            .session
            .cancel_remote_listener(&self.config.bind_host, self.bound_port)
            .await
        {
            Ok(()) => {}
            // The session is already gone, so is the listener
            Err(SshError::Disconnected) => {}
            Err(e) => warn!("Failed to cancel remote forward: {}", e),
        }

        self.lifecycle.shutdown(drain).await;
    }
}

/// Start remote port forwarding
///
/// The forward is active as soon as the server grants the listener.
pub async fn start_remote_forward(
    session: Arc<dyn TunnelSession>,
    config: RemoteForward,
    idle_timeout: Duration,
) -> Result<RemoteForwardHandle, ForwardError> {
    info!(
        "Requesting remote port forward: {} -> {}",
        display_addr(&config.bind_host, config.bind_port),
        display_addr(&config.local_host, config.local_port)
    );

    let listener = session
        .request_remote_listener(&config.bind_host, config.bind_port)
        .await
        .map_err(|e| match e {
            SshError::ForwardRejected(reason) => ForwardError::Bind {
                addr: display_addr(&config.bind_host, config.bind_port),
                reason,
            },
            other => ForwardError::from(other),
        })?;

    let bound_port = listener.bound_port;
    info!(
        "Remote forward established: {} (requested {}) -> {}",
        display_addr(&config.bind_host, bound_port),
        config.bind_port,
        display_addr(&config.local_host, config.local_port)
    );

    let lifecycle = ForwardLifecycle::new();
    let stop = lifecycle.stop_token();
    let counters = lifecycle.counters();
    let local_host = config.local_host.clone();
    let local_port = config.local_port;
    let mut incoming = listener.incoming;
    let conns = lifecycle.clone();

    lifecycle.spawn_accept(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                inbound = incoming.recv() => match inbound {
                    Some(conn) => {
                        info!(
                            "Inbound connection from {}:{} on remote port {}",
                            conn.originator_address, conn.originator_port, bound_port
                        );
                        conns.spawn_connection(relay(
                            conn,
                            local_host.clone(),
                            local_port,
                            idle_timeout,
                            counters.clone(),
                        ));
                    }
                    None => {
                        debug!("Remote listener on port {} closed by session", bound_port);
                        break;
                    }
                }
            }
        }
    });

    Ok(RemoteForwardHandle {
        config,
        bound_port,
        session,
        lifecycle,
    })
}

async fn relay(
    conn: InboundConnection,
    local_host: String,
    local_port: u16,
    idle_timeout: Duration,
    counters: Arc<StatsCounters>,
) {
    let local = match TcpStream::connect((local_host.as_str(), local_port)).await {
        Ok(stream) => stream,
        Err(e) => {
            // Dropping the inbound stream closes its channel
            warn!(
                "Failed to connect to local target {}: {}",
                display_addr(&local_host, local_port),
                e
            );
            return;
        }
    };
    if let Err(e) = local.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }

    // Bytes read from the local service travel to the remote peer
    splice(local, conn.stream, idle_timeout, &counters).await;
    debug!(
        "Forwarded connection from {}:{} closed",
        conn.originator_address, conn.originator_port
    );
}
