//! SSH Client implementation using russh

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::ssh_key::HashAlg;
use russh::keys::PublicKey;
use russh::Channel;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::agent::SshAgentClient;
use super::config::{expand_tilde, AuthMethod, ProxyHopConfig, SshConfig};
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, HandleController};
use super::proxy::{self, HopConnector};
use super::session::{
    BoxedStream, InboundConnection, SessionFactory, SessionState, SessionStateTx, TunnelSession,
};
use crate::config::ForwardingSettings;

/// Routes server-opened `forwarded-tcpip` channels to the remote forward that asked for them.
///
/// One router per SSH session, shared between the [`ClientHandler`] (which
/// receives the channels) and the handle owner task (which registers routes
/// once `tcpip-forward` returns the bound port).
#[derive(Default)]
pub struct ForwardedChannelRouter {
    routes: RwLock<HashMap<(String, u32), mpsc::Sender<InboundConnection>>>,
}

impl ForwardedChannelRouter {
    pub fn register(&self, address: &str, port: u32, tx: mpsc::Sender<InboundConnection>) {
        debug!("Routing forwarded-tcpip {}:{}", address, port);
        self.routes.write().insert((address.to_string(), port), tx);
    }

    pub fn unregister(&self, address: &str, port: u32) {
        self.routes.write().remove(&(address.to_string(), port));
    }

    /// Exact (address, port) match first; servers may echo back a normalized
    /// bind address, so fall back to the port alone.
    fn lookup(&self, address: &str, port: u32) -> Option<mpsc::Sender<InboundConnection>> {
        let routes = self.routes.read();
        if let Some(tx) = routes.get(&(address.to_string(), port)) {
            return Some(tx.clone());
        }
        routes
            .iter()
            .find(|((_, p), _)| *p == port)
            .map(|(_, tx)| tx.clone())
    }

    pub fn clear(&self) {
        self.routes.write().clear();
    }

    /// Hand an inbound connection to its remote forward.
    ///
    /// Returns false when no forward claims the port (or it stopped listening);
    /// the connection is then dropped, which closes the channel.
    pub fn dispatch(&self, address: &str, port: u32, conn: InboundConnection) -> bool {
        match self.lookup(address, port) {
            Some(tx) => tx.try_send(conn).is_ok(),
            None => false,
        }
    }
}

/// Client handler for russh callbacks
///
/// This handler processes server-initiated events:
/// - Host key verification against ~/.ssh/known_hosts
/// - Remote port forwarding (forwarded-tcpip channels)
///
/// russh drops the handler when the session task ends, which is how the
/// session learns it has been closed.
pub struct ClientHandler {
    host: String,
    port: u16,
    /// - true: reject hosts missing from known_hosts
    /// - false: learn unknown hosts (still reject changed keys)
    strict: bool,
    /// Alternate known_hosts file; `None` means ~/.ssh/known_hosts
    known_hosts: Option<PathBuf>,
    router: Option<Arc<ForwardedChannelRouter>>,
    state: Option<SessionStateTx>,
}

impl ClientHandler {
    /// Handler for a jump host: no forwarded channels, no lifecycle tracking
    pub fn new(host: String, port: u16, strict: bool) -> Self {
        Self {
            host,
            port,
            strict,
            known_hosts: None,
            router: None,
            state: None,
        }
    }

    /// Handler for the target session
    pub fn for_target(
        host: String,
        port: u16,
        strict: bool,
        router: Arc<ForwardedChannelRouter>,
        state: SessionStateTx,
    ) -> Self {
        Self {
            host,
            port,
            strict,
            known_hosts: None,
            router: Some(router),
            state: Some(state),
        }
    }

    pub fn with_known_hosts(mut self, path: PathBuf) -> Self {
        self.known_hosts = Some(path);
        self
    }

    fn check_known(&self, key: &PublicKey) -> Result<bool, russh::keys::Error> {
        match &self.known_hosts {
            Some(path) => russh::keys::check_known_hosts_path(&self.host, self.port, key, path),
            None => russh::keys::check_known_hosts(&self.host, self.port, key),
        }
    }

    fn learn(&self, key: &PublicKey) -> Result<(), russh::keys::Error> {
        match &self.known_hosts {
            Some(path) => {
                russh::keys::known_hosts::learn_known_hosts_path(&self.host, self.port, key, path)
            }
            None => russh::keys::known_hosts::learn_known_hosts(&self.host, self.port, key),
        }
    }
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        if let Some(state) = &self.state {
            if state.transition(SessionState::Closed) {
                info!("SSH session to {}:{} closed", self.host, self.port);
            }
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256);

        match self.check_known(server_public_key) {
            Ok(true) => {
                debug!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            Ok(false) if self.strict => {
                warn!(
                    "Unknown host key for {}:{} ({}), strict mode rejects it",
                    self.host, self.port, fingerprint
                );
                Err(SshError::HostKeyRejected(format!(
                    "unknown host {}:{} (fingerprint {})",
                    self.host, self.port, fingerprint
                )))
            }
            Ok(false) => {
                info!(
                    "New host {}:{}, adding to known_hosts ({})",
                    self.host, self.port, fingerprint
                );
                if let Err(e) = self.learn(server_public_key) {
                    warn!("Failed to save host key: {}", e);
                }
                Ok(true)
            }
            Err(russh::keys::Error::KeyChanged { line }) => {
                warn!(
                    "HOST KEY CHANGED for {}:{} (known_hosts line {}), got {}",
                    self.host, self.port, line, fingerprint
                );
                Err(SshError::HostKeyRejected(format!(
                    "key for {}:{} does not match known_hosts line {} (got {})",
                    self.host, self.port, line, fingerprint
                )))
            }
            Err(e) if self.strict => Err(SshError::HostKeyRejected(format!(
                "cannot read known_hosts: {}",
                e
            ))),
            Err(e) => {
                warn!("Cannot read known_hosts, accepting {}: {}", fingerprint, e);
                Ok(true)
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "Server opened forwarded-tcpip channel: {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );

        let conn = InboundConnection {
            stream: Box::new(channel.into_stream()),
            originator_address: originator_address.to_string(),
            originator_port,
        };

        let routed = self
            .router
            .as_ref()
            .map(|router| router.dispatch(connected_address, connected_port, conn))
            .unwrap_or(false);

        if !routed {
            warn!(
                "No remote forward for {}:{}, dropping channel",
                connected_address, connected_port
            );
        }
        Ok(())
    }
}

fn client_config(settings: &ForwardingSettings) -> Arc<client::Config> {
    Arc::new(client::Config {
        // Liveness comes from keepalives, not idleness
        inactivity_timeout: None,
        keepalive_interval: settings.keepalive_interval(),
        keepalive_max: settings.keepalive_max,
        ..Default::default()
    })
}

/// TCP connect + SSH handshake to `host:port`
async fn connect_direct(
    host: &str,
    port: u16,
    handler: ClientHandler,
    settings: &ForwardingSettings,
    timeout_secs: u64,
) -> Result<Handle<ClientHandler>, SshError> {
    info!("Connecting to SSH server at {}:{}", host, port);

    tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        client::connect(client_config(settings), (host, port), handler),
    )
    .await
    .map_err(|_| SshError::Timeout(format!("Connection to {}:{} timed out", host, port)))?
    .map_err(|e| connect_error(host, port, e))
}

/// SSH handshake over an already established transport (SSH-over-SSH)
async fn connect_over(
    host: &str,
    port: u16,
    stream: BoxedStream,
    handler: ClientHandler,
    settings: &ForwardingSettings,
    timeout_secs: u64,
) -> Result<Handle<ClientHandler>, SshError> {
    debug!("Connecting via tunnel to {}:{}", host, port);

    tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        client::connect_stream(client_config(settings), stream, handler),
    )
    .await
    .map_err(|_| {
        SshError::Timeout(format!(
            "Connection to {}:{} via tunnel timed out",
            host, port
        ))
    })?
    .map_err(|e| connect_error(host, port, e))
}

fn connect_error(host: &str, port: u16, err: SshError) -> SshError {
    match err {
        SshError::HostKeyRejected(_) => err,
        other => SshError::ConnectionFailed(format!("{}:{}: {}", host, port, other)),
    }
}

/// Authenticate an established handshake with the configured method
async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    username: &str,
    auth: &AuthMethod,
) -> Result<(), SshError> {
    debug!("Authenticating {} via {}", username, auth.kind());

    let result = match auth {
        AuthMethod::Password { password } => handle
            .authenticate_password(username, password)
            .await
            .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?,
        AuthMethod::Key {
            key_path,
            passphrase,
        } => {
            let key = russh::keys::load_secret_key(expand_tilde(key_path), passphrase.as_deref())
                .map_err(|e| SshError::KeyError(format!("{}: {}", key_path, e)))?;
            let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
            handle
                .authenticate_publickey(username, key_with_hash)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
        }
        AuthMethod::Agent => {
            let mut agent = SshAgentClient::connect().await?;
            agent.authenticate(handle, username.to_string()).await?;
            return Ok(());
        }
    };

    if !result.success() {
        return Err(SshError::AuthenticationFailed(format!(
            "{} authentication for {} rejected by server",
            auth.kind(),
            username
        )));
    }
    Ok(())
}

async fn disconnect_handle(handle: Handle<ClientHandler>, reason: &str) {
    let _ = handle
        .disconnect(russh::Disconnect::ByApplication, reason, "en")
        .await;
}

/// Connects jump hosts with russh for the chain walker
pub struct RusshHopConnector {
    settings: ForwardingSettings,
    timeout_secs: u64,
    strict: bool,
}

impl RusshHopConnector {
    pub fn new(settings: ForwardingSettings, timeout_secs: u64, strict: bool) -> Self {
        Self {
            settings,
            timeout_secs,
            strict,
        }
    }
}

#[async_trait]
impl HopConnector for RusshHopConnector {
    type Session = Handle<ClientHandler>;

    async fn connect(
        &self,
        hop: &ProxyHopConfig,
        transport: Option<BoxedStream>,
    ) -> Result<Self::Session, SshError> {
        let handler = ClientHandler::new(hop.host.clone(), hop.port, self.strict);
        let mut handle = match transport {
            None => {
                connect_direct(&hop.host, hop.port, handler, &self.settings, self.timeout_secs)
                    .await?
            }
            Some(stream) => {
                connect_over(
                    &hop.host,
                    hop.port,
                    stream,
                    handler,
                    &self.settings,
                    self.timeout_secs,
                )
                .await?
            }
        };

        if let Err(e) = authenticate(&mut handle, &hop.username, &hop.auth).await {
            disconnect_handle(handle, "Authentication failed").await;
            return Err(e);
        }

        info!("Authenticated to jump host {}", hop.host);
        Ok(handle)
    }

    async fn open_tunnel(
        &self,
        session: &mut Self::Session,
        host: &str,
        port: u16,
    ) -> Result<BoxedStream, SshError> {
        let channel = session
            .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| SshError::ChannelError(format!("direct-tcpip to {}:{}: {}", host, port, e)))?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn close(&self, session: Self::Session) {
        disconnect_handle(session, "Proxy chain closed").await;
    }
}

/// Opens one SSH session (through its jump chain) and hands it to an owner task
pub struct SshClient {
    config: SshConfig,
    settings: ForwardingSettings,
}

impl SshClient {
    pub fn new(config: SshConfig, settings: ForwardingSettings) -> Self {
        Self { config, settings }
    }

    /// Connect, authenticate and return a controller for the ready session
    pub async fn connect(self) -> Result<HandleController, SshError> {
        let config = &self.config;
        let state = SessionStateTx::new();
        let router = Arc::new(ForwardedChannelRouter::default());
        let handler = ClientHandler::for_target(
            config.host.clone(),
            config.port,
            config.strict_host_key_checking,
            router.clone(),
            state.clone(),
        );

        let hops = RusshHopConnector::new(
            self.settings.clone(),
            config.timeout_secs,
            config.strict_host_key_checking,
        );

        let (mut handle, jump_handles) = if config.proxy_chain.is_empty() {
            let handle = connect_direct(
                &config.host,
                config.port,
                handler,
                &self.settings,
                config.timeout_secs,
            )
            .await?;
            (handle, Vec::new())
        } else {
            let chained =
                proxy::connect_via_proxy(&hops, &config.proxy_chain, &config.host, config.port)
                    .await?;
            match connect_over(
                &config.host,
                config.port,
                chained.stream,
                handler,
                &self.settings,
                config.timeout_secs,
            )
            .await
            {
                Ok(handle) => (handle, chained.jump_sessions),
                Err(e) => {
                    proxy::close_all(&hops, chained.jump_sessions).await;
                    return Err(e);
                }
            }
        };

        if let Err(e) = authenticate(&mut handle, &config.username, &config.auth).await {
            warn!("Authentication to {} failed: {}", config.host, e);
            disconnect_handle(handle, "Authentication failed").await;
            proxy::close_all(&hops, jump_handles).await;
            return Err(e);
        }

        info!(
            "SSH session ready: {}@{}:{} ({} jump hosts)",
            config.username,
            config.host,
            config.port,
            jump_handles.len()
        );
        state.transition(SessionState::Ready);

        Ok(spawn_handle_owner_task(
            handle,
            jump_handles,
            format!("{}@{}:{}", config.username, config.host, config.port),
            state,
            router,
            &self.settings,
        ))
    }
}

/// Production [`SessionFactory`]: a fresh russh session per call
#[derive(Clone, Default)]
pub struct SshSessionFactory {
    settings: ForwardingSettings,
}

impl SshSessionFactory {
    pub fn new(settings: ForwardingSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl SessionFactory for SshSessionFactory {
    async fn open(&self, config: &SshConfig) -> Result<Arc<dyn TunnelSession>, SshError> {
        let controller = SshClient::new(config.clone(), self.settings.clone())
            .connect()
            .await?;
        Ok(Arc::new(controller))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound() -> InboundConnection {
        let (near, _far) = tokio::io::duplex(16);
        InboundConnection {
            stream: Box::new(near),
            originator_address: "10.0.0.9".into(),
            originator_port: 51000,
        }
    }

    #[tokio::test]
    async fn test_router_exact_and_port_fallback() {
        let router = ForwardedChannelRouter::default();
        let (tx, mut rx) = mpsc::channel(4);
        router.register("localhost", 9000, tx);

        assert!(router.dispatch("localhost", 9000, inbound()));
        assert!(router.dispatch("127.0.0.1", 9000, inbound()));
        assert!(!router.dispatch("localhost", 9001, inbound()));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.originator_address, "10.0.0.9");
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_router_unregister_drops_route() {
        let router = ForwardedChannelRouter::default();
        let (tx, _rx) = mpsc::channel(4);
        router.register("0.0.0.0", 8080, tx);
        router.unregister("0.0.0.0", 8080);
        assert!(!router.dispatch("0.0.0.0", 8080, inbound()));
    }

    fn ed25519(blob: &str) -> PublicKey {
        PublicKey::from_openssh(&format!("ssh-ed25519 {}", blob)).unwrap()
    }

    #[tokio::test]
    async fn test_host_key_learned_then_enforced() {
        use client::Handler;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let key = ed25519("AAAAC3NzaC1lZDI1NTE5AAAAIAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8g");
        let other = ed25519("AAAAC3NzaC1lZDI1NTE5AAAAICEiIyQlJicoKSorLC0uLzAxMjM0NTY3ODk6Ozw9Pj9A");

        let mut strict = ClientHandler::new("bastion.example.org".into(), 2222, true)
            .with_known_hosts(path.clone());
        assert!(matches!(
            strict.check_server_key(&key).await,
            Err(SshError::HostKeyRejected(_))
        ));

        let mut learning = ClientHandler::new("bastion.example.org".into(), 2222, false)
            .with_known_hosts(path.clone());
        assert!(learning.check_server_key(&key).await.unwrap());
        assert!(std::fs::read_to_string(&path).unwrap().contains("ssh-ed25519"));

        assert!(strict.check_server_key(&key).await.unwrap());
        assert!(matches!(
            learning.check_server_key(&other).await,
            Err(SshError::HostKeyRejected(_))
        ));
    }

    #[test]
    fn test_target_handler_drop_marks_closed() {
        let state = SessionStateTx::new();
        state.transition(SessionState::Ready);
        let handler = ClientHandler::for_target(
            "host".into(),
            22,
            false,
            Arc::new(ForwardedChannelRouter::default()),
            state.clone(),
        );
        drop(handler);
        assert_eq!(state.current(), SessionState::Closed);
    }
}
