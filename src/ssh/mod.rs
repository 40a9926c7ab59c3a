//! SSH module - sessions the forwarding engines run on
//!
//! # Features
//! - Direct SSH connections and ProxyJump chains of any length
//! - Password, private key and agent authentication
//! - Host key verification via ~/.ssh/known_hosts
//! - Single-owner handle task with keepalive probing
//! - Routing of server-opened forwarded-tcpip channels

mod agent;
mod client;
mod config;
mod error;
mod handle_owner;
pub mod proxy;
mod session;

pub use agent::SshAgentClient;
pub use client::{
    ClientHandler, ForwardedChannelRouter, RusshHopConnector, SshClient, SshSessionFactory,
};
pub use config::{expand_tilde, AuthMethod, ProxyHopConfig, SshConfig};
pub use error::SshError;
pub use handle_owner::HandleController;
pub use proxy::{connect_via_proxy, ChainedTransport, HopConnector};
pub use session::{
    wait_terminal, BoxedStream, CommandOutput, InboundConnection, RemoteListener, SessionFactory,
    SessionState, SessionStateTx, TunnelSession, TunnelStream,
};
