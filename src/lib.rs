//! OxideTunnel - SSH tunnel and port-forwarding engine
//!
//! Local (-L), remote (-R) and dynamic SOCKS5 (-D) forwards over SSH
//! sessions, with ProxyJump chains of any length, persisted forwarding
//! records and listening port discovery.
//!
//! The entry point is [`forwarding::ForwardingRegistry`]; sessions come from
//! a [`ssh::SessionFactory`], normally [`ssh::SshSessionFactory`].

pub mod config;
pub mod forwarding;
pub mod scanner;
pub mod ssh;

#[cfg(test)]
pub(crate) mod test_support;

pub use forwarding::{
    ForwardError, ForwardEvent, ForwardRequest, ForwardStatus, ForwardType, ForwardingRecord,
    ForwardingRegistry,
};
pub use scanner::{ListeningPort, PortScanner};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the tracing subscriber (`RUST_LOG` overrides the `info` default).
///
/// Calling it again once a subscriber is set does nothing.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
