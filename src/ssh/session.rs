//! SSH Session abstraction used by the forwarding engines
//!
//! A ready session is exposed as a [`TunnelSession`]: open outbound channels,
//! ask the server for a listener, run a one-shot command, and observe the
//! session lifecycle (`connecting -> ready -> closed | error`).
//!
//! The production implementation is [`HandleController`](super::HandleController);
//! tests substitute in-memory sessions.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};

use super::config::SshConfig;
use super::error::SshError;

/// A duplex byte stream (TCP socket, SSH channel, in-memory pipe).
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> TunnelStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Type-erased duplex stream
pub type BoxedStream = Box<dyn TunnelStream>;

/// Lifecycle state of an SSH session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Ready,
    Closed,
    Error(String),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Error(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Ready => write!(f, "ready"),
            SessionState::Closed => write!(f, "closed"),
            SessionState::Error(reason) => write!(f, "error: {}", reason),
        }
    }
}

/// Shared writer side of a session's lifecycle state.
///
/// Transitions out of a terminal state are ignored, so the first close or
/// error reason wins.
#[derive(Debug, Clone)]
pub struct SessionStateTx(Arc<watch::Sender<SessionState>>);

impl SessionStateTx {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SessionState::Connecting);
        Self(Arc::new(tx))
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.0.subscribe()
    }

    pub fn current(&self) -> SessionState {
        self.0.borrow().clone()
    }

    /// Move to `next` unless the session already reached a terminal state
    pub fn transition(&self, next: SessionState) -> bool {
        self.0.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                return false;
            }
            *state = next;
            true
        })
    }
}

impl Default for SessionStateTx {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait until the session reaches `closed` or `error` and return that state.
///
/// A dropped sender counts as closed.
pub async fn wait_terminal(rx: &mut watch::Receiver<SessionState>) -> SessionState {
    loop {
        {
            let state = rx.borrow_and_update();
            if state.is_terminal() {
                return state.clone();
            }
        }
        if rx.changed().await.is_err() {
            return SessionState::Closed;
        }
    }
}

/// An inbound connection the server handed back for a remote listener
pub struct InboundConnection {
    pub stream: BoxedStream,
    pub originator_address: String,
    pub originator_port: u32,
}

impl fmt::Debug for InboundConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundConnection")
            .field("originator_address", &self.originator_address)
            .field("originator_port", &self.originator_port)
            .finish()
    }
}

/// A server-side listener granted by `tcpip-forward`
#[derive(Debug)]
pub struct RemoteListener {
    /// Port actually bound on the server (differs from the request when 0 was asked)
    pub bound_port: u16,
    pub incoming: mpsc::Receiver<InboundConnection>,
}

/// Output of a one-shot remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub exit_code: Option<u32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Operations a ready SSH session offers to the forwarding engines
#[async_trait]
pub trait TunnelSession: Send + Sync {
    /// Open a `direct-tcpip` channel to `host:port` as seen from the server
    async fn open_channel(&self, host: &str, port: u16) -> Result<BoxedStream, SshError>;

    /// Ask the server to listen on `bind_host:bind_port`
    async fn request_remote_listener(
        &self,
        bind_host: &str,
        bind_port: u16,
    ) -> Result<RemoteListener, SshError>;

    /// Withdraw a listener previously granted by `request_remote_listener`
    async fn cancel_remote_listener(&self, bind_host: &str, bind_port: u16)
        -> Result<(), SshError>;

    /// Run one command line on the server and collect stdout + exit status
    async fn run_command(&self, command: &str) -> Result<CommandOutput, SshError>;

    /// Subscribe to lifecycle state changes
    fn subscribe_state(&self) -> watch::Receiver<SessionState>;

    /// End the session (and any jump sessions beneath it)
    async fn close(&self);
}

/// Opens ready sessions for a host descriptor
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, config: &SshConfig) -> Result<Arc<dyn TunnelSession>, SshError>;
}
