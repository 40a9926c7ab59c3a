//! ProxyJump Implementation for SSH
//!
//! Implements SSH connection through jump hosts (bastion hosts).
//! Supports unlimited multi-hop proxy with SSH-over-SSH.
//!
//! # Algorithm
//!
//! ```text
//! Client --SSH--> [Jump1] --direct-tcpip--> [Jump2] --direct-tcpip--> ... --> [JumpN] --direct-tcpip--> [Target]
//! ```
//!
//! 1. Connect to Jump1 → Session1
//! 2. Open direct-tcpip from Session1 to Jump2 → Stream1
//! 3. Connect to Jump2 over Stream1 → Session2
//! 4. Repeat until JumpN, whose tunnel goes to the target
//!
//! The last stream is returned as the transport for the target session. A
//! single hop runs the same loop once.
//!
//! If any hop fails, every session opened so far is closed (newest first)
//! before the error is returned.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::config::ProxyHopConfig;
use super::error::SshError;
use super::session::BoxedStream;

/// How the chain walker talks to one hop
///
/// The production connector (`RusshHopConnector`) opens russh sessions; tests
/// plug in scripted connectors.
#[async_trait]
pub trait HopConnector: Send + Sync {
    type Session: Send;

    /// Open an authenticated session to `hop`, over `transport` when given
    async fn connect(
        &self,
        hop: &ProxyHopConfig,
        transport: Option<BoxedStream>,
    ) -> Result<Self::Session, SshError>;

    /// Open a direct-tcpip tunnel from `session` to `host:port`
    async fn open_tunnel(
        &self,
        session: &mut Self::Session,
        host: &str,
        port: u16,
    ) -> Result<BoxedStream, SshError>;

    /// Disconnect a hop session
    async fn close(&self, session: Self::Session);
}

/// Result of walking a proxy chain
pub struct ChainedTransport<S> {
    /// Jump host sessions in chain order: [jump1, jump2, ..., jumpN]
    pub jump_sessions: Vec<S>,
    /// Tunnel from the last hop to the target
    pub stream: BoxedStream,
}

/// Walk `chain` and return a stream tunneled through every hop to the target.
pub async fn connect_via_proxy<C: HopConnector>(
    connector: &C,
    chain: &[ProxyHopConfig],
    target_host: &str,
    target_port: u16,
) -> Result<ChainedTransport<C::Session>, SshError> {
    if chain.is_empty() {
        return Err(SshError::ConnectionFailed("Proxy chain is empty".into()));
    }

    info!(
        "Establishing multi-hop SSH: {} proxy hops to {}:{}",
        chain.len(),
        target_host,
        target_port
    );

    let mut jump_sessions: Vec<C::Session> = Vec::with_capacity(chain.len());
    let mut current_stream: Option<BoxedStream> = None;

    for (i, hop) in chain.iter().enumerate() {
        let hop_no = i + 1;
        info!(
            "Proxy hop {}: connecting to {}@{}:{}",
            hop_no, hop.username, hop.host, hop.port
        );

        let mut session = match connector.connect(hop, current_stream.take()).await {
            Ok(session) => session,
            Err(e) => {
                warn!("Proxy hop {} ({}) failed: {}", hop_no, hop.host, e);
                close_all(connector, jump_sessions).await;
                return Err(chain_error(hop_no, hop, e));
            }
        };

        let (next_host, next_port) = match chain.get(i + 1) {
            Some(next) => (next.host.as_str(), next.port),
            None => (target_host, target_port),
        };

        debug!(
            "Proxy hop {}: opening tunnel to {}:{}",
            hop_no, next_host, next_port
        );

        match connector.open_tunnel(&mut session, next_host, next_port).await {
            Ok(stream) => {
                current_stream = Some(stream);
                jump_sessions.push(session);
            }
            Err(e) => {
                warn!(
                    "Proxy hop {} ({}) could not reach {}:{}: {}",
                    hop_no, hop.host, next_host, next_port, e
                );
                jump_sessions.push(session);
                close_all(connector, jump_sessions).await;
                return Err(chain_error(hop_no, hop, e));
            }
        }
    }

    let stream = match current_stream {
        Some(stream) => stream,
        None => {
            close_all(connector, jump_sessions).await;
            return Err(SshError::ConnectionFailed(
                "No stream available for target connection".into(),
            ));
        }
    };

    info!("Proxy chain established ({} hops)", jump_sessions.len());

    Ok(ChainedTransport {
        jump_sessions,
        stream,
    })
}

/// Close hop sessions newest first, so each tunnel goes away before its carrier.
pub async fn close_all<C: HopConnector>(connector: &C, mut sessions: Vec<C::Session>) {
    if !sessions.is_empty() {
        debug!("Closing {} jump host session(s)", sessions.len());
    }
    while let Some(session) = sessions.pop() {
        connector.close(session).await;
    }
}

fn chain_error(hop_no: usize, hop: &ProxyHopConfig, err: SshError) -> SshError {
    SshError::ChainFailed {
        hop: hop_no,
        host: hop.host.clone(),
        reason: err.to_string(),
    }
}
