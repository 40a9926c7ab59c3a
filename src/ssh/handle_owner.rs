//! Handle Owner Task
//!
//! This module implements the "single owner" pattern for the SSH Handle.
//!
//! # Architecture
//!
//! Only one task owns the target `Handle<ClientHandler>` (and the jump host
//! handles it rides on). Everything else talks to it through a
//! [`HandleController`], which sends commands over an mpsc channel.
//!
//! This avoids:
//! - `Arc<Mutex<Handle>>` lock contention
//! - Holding locks across `.await`
//! - Concurrent access to the Handle
//!
//! Channel opens, listener cancels and keepalive probes only need `&Handle`,
//! so the owner runs them side by side: a `direct-tcpip` open the server
//! takes minutes to answer does not hold up the next one. `tcpip-forward`
//! needs `&mut Handle`; such requests wait until no shared operation is in
//! flight.
//!
//! The task ends when a controller asks to disconnect, every controller is
//! dropped, the session closes underneath it, or keepalive probes keep
//! failing. On the way out it marks the session closed (or errored), fails
//! every queued command and disconnects the target before the jump hosts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{FuturesUnordered, StreamExt};
use russh::client::{Handle, Msg};
use russh::{Channel, ChannelMsg};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::client::{ClientHandler, ForwardedChannelRouter};
use super::error::SshError;
use super::session::{
    wait_terminal, BoxedStream, CommandOutput, InboundConnection, RemoteListener, SessionState,
    SessionStateTx, TunnelSession,
};
use crate::config::ForwardingSettings;

/// Queue depth for inbound connections of one remote forward
const INBOUND_QUEUE: usize = 32;

/// How long a keepalive probe may take before it counts as missed
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// The operations the owner task performs on its handle
#[async_trait]
pub(crate) trait OwnedHandle: Send + Sync + 'static {
    type Channel: Send + 'static;

    async fn open_session(&self) -> Result<Self::Channel, russh::Error>;

    async fn open_direct_tcpip(&self, host: &str, port: u32)
        -> Result<Self::Channel, russh::Error>;

    async fn request_forward(&mut self, address: &str, port: u32) -> Result<u32, russh::Error>;

    async fn cancel_forward(&self, address: &str, port: u32) -> Result<(), russh::Error>;

    async fn keepalive(&self) -> Result<(), russh::Error>;

    async fn close_connection(&self, description: &str);
}

#[async_trait]
impl OwnedHandle for Handle<ClientHandler> {
    type Channel = Channel<Msg>;

    async fn open_session(&self) -> Result<Channel<Msg>, russh::Error> {
        self.channel_open_session().await
    }

    async fn open_direct_tcpip(&self, host: &str, port: u32) -> Result<Channel<Msg>, russh::Error> {
        self.channel_open_direct_tcpip(host, port, "127.0.0.1", 0)
            .await
    }

    async fn request_forward(&mut self, address: &str, port: u32) -> Result<u32, russh::Error> {
        self.tcpip_forward(address, port).await
    }

    async fn cancel_forward(&self, address: &str, port: u32) -> Result<(), russh::Error> {
        self.cancel_tcpip_forward(address, port).await
    }

    async fn keepalive(&self) -> Result<(), russh::Error> {
        self.send_keepalive(true).await
    }

    async fn close_connection(&self, description: &str) {
        let _ = self
            .disconnect(russh::Disconnect::ByApplication, description, "en")
            .await;
    }
}

/// Commands sent to the Handle Owner Task
pub(crate) enum HandleCommand<C = Channel<Msg>> {
    /// Open a session channel (remote commands)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<C, russh::Error>>,
    },

    /// Open a direct-tcpip channel (local forward / dynamic forward)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<C, russh::Error>>,
    },

    /// Request a server listener (tcpip-forward) and route its channels to `route_tx`
    TcpipForward {
        address: String,
        port: u32,
        route_tx: mpsc::Sender<InboundConnection>,
        reply_tx: oneshot::Sender<Result<u32, russh::Error>>,
    },

    /// Cancel a server listener
    CancelTcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<(), russh::Error>>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// A queued `tcpip-forward` request
struct ListenRequest {
    address: String,
    port: u32,
    route_tx: mpsc::Sender<InboundConnection>,
    reply_tx: oneshot::Sender<Result<u32, russh::Error>>,
}

/// Controller for sending commands to the Handle Owner Task
///
/// Cloning is cheap (a sender and two Arcs); any holder has full control of
/// the session, including disconnecting it.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    state: SessionStateTx,
    command_timeout: Duration,
}

impl HandleController {
    async fn request<T>(
        &self,
        cmd: HandleCommand,
        reply_rx: oneshot::Receiver<Result<T, russh::Error>>,
    ) -> Result<Result<T, russh::Error>, SshError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx.await.map_err(|_| SshError::Disconnected)
    }

    /// Open a session channel
    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request(HandleCommand::ChannelOpenSession { reply_tx }, reply_rx)
            .await?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Open a direct-tcpip channel
    pub async fn open_direct_tcpip(&self, host: &str, port: u16) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let cmd = HandleCommand::ChannelOpenDirectTcpip {
            host: host.to_string(),
            port: port as u32,
            reply_tx,
        };
        self.request(cmd, reply_rx)
            .await?
            .map_err(|e| SshError::ChannelError(format!("{}:{}: {}", host, port, e)))
    }

    /// Whether the owner task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

#[async_trait]
impl TunnelSession for HandleController {
    async fn open_channel(&self, host: &str, port: u16) -> Result<BoxedStream, SshError> {
        let channel = self.open_direct_tcpip(host, port).await?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn request_remote_listener(
        &self,
        bind_host: &str,
        bind_port: u16,
    ) -> Result<RemoteListener, SshError> {
        let (route_tx, incoming) = mpsc::channel(INBOUND_QUEUE);
        let (reply_tx, reply_rx) = oneshot::channel();
        let cmd = HandleCommand::TcpipForward {
            address: bind_host.to_string(),
            port: bind_port as u32,
            route_tx,
            reply_tx,
        };

        let bound = self.request(cmd, reply_rx).await?.map_err(|e| {
            SshError::ForwardRejected(format!("{}:{}: {}", bind_host, bind_port, e))
        })?;

        let bound_port = u16::try_from(bound).map_err(|_| {
            SshError::ProtocolError(format!("server bound out-of-range port {}", bound))
        })?;

        Ok(RemoteListener {
            bound_port,
            incoming,
        })
    }

    async fn cancel_remote_listener(&self, bind_host: &str, bind_port: u16) -> Result<(), SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let cmd = HandleCommand::CancelTcpipForward {
            address: bind_host.to_string(),
            port: bind_port as u32,
            reply_tx,
        };
        self.request(cmd, reply_rx)
            .await?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    async fn run_command(&self, command: &str) -> Result<CommandOutput, SshError> {
        let exec = async {
            let mut channel = self.open_session_channel().await?;
            channel
                .exec(true, command)
                .await
                .map_err(|e| SshError::ChannelError(e.to_string()))?;

            let mut stdout = Vec::new();
            let mut exit_code = None;
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                    ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                    ChannelMsg::Close => break,
                    _ => {}
                }
            }

            Ok(CommandOutput {
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                exit_code,
            })
        };

        tokio::time::timeout(self.command_timeout, exec)
            .await
            .map_err(|_| {
                SshError::Timeout(format!(
                    "remote command did not finish within {}s",
                    self.command_timeout.as_secs()
                ))
            })?
    }

    fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    async fn close(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
        let mut rx = self.state.subscribe();
        let _ = tokio::time::timeout(Duration::from_secs(5), wait_terminal(&mut rx)).await;
    }
}

/// Spawn the Handle Owner Task
///
/// Takes ownership of the target handle and its jump host handles (chain
/// order) and returns a controller for sending commands.
pub(crate) fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    jump_handles: Vec<Handle<ClientHandler>>,
    label: String,
    state: SessionStateTx,
    router: Arc<ForwardedChannelRouter>,
    settings: &ForwardingSettings,
) -> HandleController {
    let (cmd_tx, cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let controller = HandleController {
        cmd_tx,
        state: state.clone(),
        command_timeout: settings.command_timeout(),
    };

    let owner = OwnerTask {
        handle,
        jump_handles,
        label,
        state,
        router,
        probe_every: settings.keepalive_interval(),
        probe_max: settings.keepalive_max.max(1),
    };
    tokio::spawn(owner.run(cmd_rx));

    controller
}

struct OwnerTask<H: OwnedHandle> {
    handle: H,
    jump_handles: Vec<H>,
    label: String,
    state: SessionStateTx,
    router: Arc<ForwardedChannelRouter>,
    probe_every: Option<Duration>,
    probe_max: usize,
}

impl<H: OwnedHandle> OwnerTask<H> {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<HandleCommand<H::Channel>>) {
        info!("Handle owner task started for {}", self.label);

        let mut state_rx = self.state.subscribe();
        let period = self.probe_every.unwrap_or(Duration::from_secs(3600));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut missed = 0usize;

        'session: loop {
            let mut listens = Vec::new();
            {
                let handle = &self.handle;
                let router = self.router.as_ref();
                let mut in_flight: FuturesUnordered<BoxFuture<'_, ()>> = FuturesUnordered::new();

                loop {
                    if in_flight.is_empty() && !listens.is_empty() {
                        break;
                    }
                    tokio::select! {
                        cmd = cmd_rx.recv() => match cmd {
                            Some(HandleCommand::Disconnect) => {
                                info!("Disconnect requested for {}", self.label);
                                break 'session;
                            }
                            Some(HandleCommand::TcpipForward {
                                address,
                                port,
                                route_tx,
                                reply_tx,
                            }) => listens.push(ListenRequest {
                                address,
                                port,
                                route_tx,
                                reply_tx,
                            }),
                            Some(cmd) => {
                                in_flight.push(execute_shared(handle, router, cmd).boxed())
                            }
                            None => {
                                info!("All controllers dropped for {}", self.label);
                                break 'session;
                            }
                        },
                        Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
                        state = wait_terminal(&mut state_rx) => {
                            info!("SSH session {} ended ({})", self.label, state);
                            break 'session;
                        }
                        _ = heartbeat.tick(), if self.probe_every.is_some() => {
                            if self.probe().await {
                                missed = 0;
                            } else {
                                missed += 1;
                                if missed >= self.probe_max {
                                    warn!("{} keepalive probes missed for {}", missed, self.label);
                                    self.state.transition(SessionState::Error(format!(
                                        "keepalive timeout after {} missed probes",
                                        missed
                                    )));
                                    break 'session;
                                }
                            }
                        }
                    }
                }
            }

            for request in listens {
                self.listen(request).await;
            }
        }

        self.shutdown(cmd_rx).await;
    }

    async fn listen(&mut self, request: ListenRequest) {
        let ListenRequest {
            address,
            port,
            route_tx,
            reply_tx,
        } = request;

        match self.handle.request_forward(&address, port).await {
            Ok(bound_port) => {
                // Some servers reply 0 when a fixed port was requested
                let bound_port = if bound_port == 0 { port } else { bound_port };
                self.router.register(&address, bound_port, route_tx);
                if reply_tx.send(Ok(bound_port)).is_err() {
                    // Caller is gone but the server is listening: undo it
                    warn!(
                        "Cancelling orphaned remote listener {}:{}",
                        address, bound_port
                    );
                    self.router.unregister(&address, bound_port);
                    let _ = self.handle.cancel_forward(&address, bound_port).await;
                }
            }
            Err(e) => {
                let _ = reply_tx.send(Err(e));
            }
        }
    }

    /// keepalive@openssh.com with want_reply; false when the probe failed
    async fn probe(&self) -> bool {
        match tokio::time::timeout(PROBE_TIMEOUT, self.handle.keepalive()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("Keepalive error for {}: {}", self.label, e);
                false
            }
            Err(_) => {
                warn!("Keepalive timeout for {}", self.label);
                false
            }
        }
    }

    async fn shutdown(self, mut cmd_rx: mpsc::Receiver<HandleCommand<H::Channel>>) {
        self.state.transition(SessionState::Closed);
        drain_pending_commands(&mut cmd_rx);
        self.router.clear();

        self.handle.close_connection("Session closed").await;

        let mut jump_handles = self.jump_handles;
        while let Some(jump) = jump_handles.pop() {
            jump.close_connection("Proxy chain closed").await;
        }

        info!("Handle owner task terminated for {}", self.label);
    }
}

/// Run a command that only needs `&H`
async fn execute_shared<H: OwnedHandle>(
    handle: &H,
    router: &ForwardedChannelRouter,
    cmd: HandleCommand<H::Channel>,
) {
    match cmd {
        HandleCommand::ChannelOpenSession { reply_tx } => {
            let result = handle.open_session().await;
            if reply_tx.send(result).is_err() {
                debug!("Caller dropped before receiving session channel");
            }
        }

        HandleCommand::ChannelOpenDirectTcpip {
            host,
            port,
            reply_tx,
        } => {
            let result = handle.open_direct_tcpip(&host, port).await;
            if reply_tx.send(result).is_err() {
                debug!("Caller dropped before receiving direct-tcpip channel");
            }
        }

        HandleCommand::CancelTcpipForward {
            address,
            port,
            reply_tx,
        } => {
            router.unregister(&address, port);
            let result = handle.cancel_forward(&address, port).await;
            let _ = reply_tx.send(result);
        }

        // Owner loop handles these itself
        HandleCommand::TcpipForward { .. } | HandleCommand::Disconnect => {}
    }
}

/// Fail every queued command with a disconnect error
fn drain_pending_commands<C>(cmd_rx: &mut mpsc::Receiver<HandleCommand<C>>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::TcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::CancelTcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Never answers opens to this address, like a black-holed destination
    const BLACKHOLE: &str = "10.255.255.1";

    struct FakeHandle {
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl OwnedHandle for FakeHandle {
        type Channel = String;

        async fn open_session(&self) -> Result<String, russh::Error> {
            Ok("session".into())
        }

        async fn open_direct_tcpip(&self, host: &str, port: u32) -> Result<String, russh::Error> {
            if host == BLACKHOLE {
                std::future::pending::<()>().await;
            }
            Ok(format!("{}:{}", host, port))
        }

        async fn request_forward(&mut self, _address: &str, port: u32) -> Result<u32, russh::Error> {
            Ok(if port == 0 { 40000 } else { port })
        }

        async fn cancel_forward(&self, _address: &str, _port: u32) -> Result<(), russh::Error> {
            Ok(())
        }

        async fn keepalive(&self) -> Result<(), russh::Error> {
            Ok(())
        }

        async fn close_connection(&self, _description: &str) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn spawn_fake() -> (
        mpsc::Sender<HandleCommand<String>>,
        SessionStateTx,
        Arc<AtomicBool>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let state = SessionStateTx::new();
        state.transition(SessionState::Ready);
        let closed = Arc::new(AtomicBool::new(false));
        let owner = OwnerTask {
            handle: FakeHandle {
                closed: closed.clone(),
            },
            jump_handles: Vec::new(),
            label: "alice@hpc.example.org:22".into(),
            state: state.clone(),
            router: Arc::new(ForwardedChannelRouter::default()),
            probe_every: None,
            probe_max: 1,
        };
        tokio::spawn(owner.run(cmd_rx));
        (cmd_tx, state, closed)
    }

    async fn open(
        tx: &mpsc::Sender<HandleCommand<String>>,
        host: &str,
        port: u32,
    ) -> oneshot::Receiver<Result<String, russh::Error>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(HandleCommand::ChannelOpenDirectTcpip {
            host: host.into(),
            port,
            reply_tx,
        })
        .await
        .unwrap();
        reply_rx
    }

    #[tokio::test]
    async fn test_stalled_open_does_not_block_other_opens() {
        let (tx, _state, _closed) = spawn_fake();

        let _stalled = open(&tx, BLACKHOLE, 80).await;
        let reachable = open(&tx, "db", 5432).await;

        let channel = tokio::time::timeout(Duration::from_secs(1), reachable)
            .await
            .expect("second open answered while the first is pending")
            .unwrap()
            .unwrap();
        assert_eq!(channel, "db:5432");

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(HandleCommand::CancelTcpipForward {
            address: "0.0.0.0".into(),
            port: 9000,
            reply_tx,
        })
        .await
        .unwrap();
        tokio::time::timeout(Duration::from_secs(1), reply_rx)
            .await
            .expect("cancel answered while an open is pending")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_with_stalled_open() {
        let (tx, state, closed) = spawn_fake();
        let stalled = open(&tx, BLACKHOLE, 80).await;

        tx.send(HandleCommand::Disconnect).await.unwrap();

        let mut state_rx = state.subscribe();
        let ended = tokio::time::timeout(Duration::from_secs(1), wait_terminal(&mut state_rx))
            .await
            .unwrap();
        assert_eq!(ended, SessionState::Closed);
        assert!(stalled.await.is_err());
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_listen_request_served_when_idle() {
        let (tx, _state, _closed) = spawn_fake();
        let channel = open(&tx, "db", 5432).await.await.unwrap().unwrap();
        assert_eq!(channel, "db:5432");

        let (route_tx, _incoming) = mpsc::channel(1);
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(HandleCommand::TcpipForward {
            address: "localhost".into(),
            port: 0,
            route_tx,
            reply_tx,
        })
        .await
        .unwrap();

        let bound = tokio::time::timeout(Duration::from_secs(1), reply_rx)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(bound, 40000);
    }

    #[tokio::test]
    async fn test_drain_fails_queued_commands() {
        let (tx, mut rx) = mpsc::channel::<HandleCommand>(4);
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(HandleCommand::ChannelOpenSession { reply_tx })
            .await
            .unwrap();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        tx.send(HandleCommand::CancelTcpipForward {
            address: "0.0.0.0".into(),
            port: 9000,
            reply_tx: cancel_tx,
        })
        .await
        .unwrap();

        drain_pending_commands(&mut rx);

        assert!(matches!(reply_rx.await, Ok(Err(russh::Error::Disconnect))));
        assert!(matches!(cancel_rx.await, Ok(Err(russh::Error::Disconnect))));
        assert!(tx.send(HandleCommand::Disconnect).await.is_err());
    }

    #[tokio::test]
    async fn test_controller_without_owner_reports_disconnected() {
        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        drop(cmd_rx);
        let controller = HandleController {
            cmd_tx,
            state: SessionStateTx::new(),
            command_timeout: Duration::from_secs(1),
        };

        assert!(!controller.is_connected());
        assert!(matches!(
            controller.open_channel("db", 5432).await,
            Err(SshError::Disconnected)
        ));
        assert!(matches!(
            controller.request_remote_listener("0.0.0.0", 0).await,
            Err(SshError::Disconnected)
        ));
    }
}
