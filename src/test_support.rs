//! In-memory sessions for engine and registry tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{duplex, split, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, watch};

use crate::ssh::{
    BoxedStream, CommandOutput, InboundConnection, RemoteListener, SessionFactory, SessionState,
    SessionStateTx, SshConfig, SshError, TunnelSession,
};

/// What `open_channel` does
#[derive(Debug, Clone)]
pub(crate) enum ChannelMode {
    /// Channel echoes everything back, then closes once its input ends
    Echo,
    /// The server refuses every channel
    Refuse,
}

type Script = (String, CommandOutput);

pub(crate) struct FakeSession {
    state: SessionStateTx,
    mode: ChannelMode,
    opened: Mutex<Vec<(String, u16)>>,
    cancelled: Mutex<Vec<(String, u16)>>,
    listeners: Mutex<HashMap<u16, mpsc::Sender<InboundConnection>>>,
    reject_listeners: AtomicBool,
    next_port: AtomicU16,
    scripts: Mutex<Vec<Script>>,
    commands: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl FakeSession {
    pub fn new(mode: ChannelMode) -> Arc<Self> {
        Self::with_scripts(mode, Vec::new())
    }

    fn with_scripts(mode: ChannelMode, scripts: Vec<Script>) -> Arc<Self> {
        let state = SessionStateTx::new();
        state.transition(SessionState::Ready);
        Arc::new(Self {
            state,
            mode,
            opened: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            listeners: Mutex::new(HashMap::new()),
            reject_listeners: AtomicBool::new(false),
            next_port: AtomicU16::new(40000),
            scripts: Mutex::new(scripts),
            commands: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Destinations of every `open_channel` call, in order
    pub fn opened(&self) -> Vec<(String, u16)> {
        self.opened.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<(String, u16)> {
        self.cancelled.lock().clone()
    }

    pub fn reject_listeners(&self) {
        self.reject_listeners.store(true, Ordering::SeqCst);
    }

    /// Answer commands containing `needle` with `stdout` and `exit_code`
    pub fn script(&self, needle: &str, stdout: &str, exit_code: u32) {
        self.scripts.lock().push(script(needle, stdout, exit_code));
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Have the server connect to remote listener `port`; returns the peer's end
    pub async fn inbound(&self, port: u16) -> Option<DuplexStream> {
        let tx = self.listeners.lock().get(&port).cloned()?;
        let (near, far) = duplex(8192);
        tx.send(InboundConnection {
            stream: Box::new(far),
            originator_address: "203.0.113.5".into(),
            originator_port: 40022,
        })
        .await
        .ok()?;
        Some(near)
    }

    /// The server went away cleanly
    pub fn simulate_close(&self) {
        self.state.transition(SessionState::Closed);
        self.listeners.lock().clear();
    }

    /// The session died (e.g. keepalive timeout)
    pub fn simulate_error(&self, reason: &str) {
        self.state.transition(SessionState::Error(reason.to_string()));
        self.listeners.lock().clear();
    }

    fn ensure_open(&self) -> Result<(), SshError> {
        if self.state.current().is_terminal() {
            return Err(SshError::Disconnected);
        }
        Ok(())
    }
}

fn script(needle: &str, stdout: &str, exit_code: u32) -> Script {
    (
        needle.to_string(),
        CommandOutput {
            stdout: stdout.to_string(),
            exit_code: Some(exit_code),
        },
    )
}

#[async_trait]
impl TunnelSession for FakeSession {
    async fn open_channel(&self, host: &str, port: u16) -> Result<BoxedStream, SshError> {
        self.ensure_open()?;
        self.opened.lock().push((host.to_string(), port));

        match self.mode {
            ChannelMode::Refuse => Err(SshError::ChannelError("connect refused".into())),
            ChannelMode::Echo => {
                let (near, far) = duplex(8192);
                tokio::spawn(async move {
                    let (mut reader, mut writer) = split(far);
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                    let _ = writer.shutdown().await;
                });
                Ok(Box::new(near))
            }
        }
    }

    async fn request_remote_listener(
        &self,
        _bind_host: &str,
        bind_port: u16,
    ) -> Result<RemoteListener, SshError> {
        self.ensure_open()?;
        if self.reject_listeners.load(Ordering::SeqCst) {
            return Err(SshError::ForwardRejected(
                "administratively prohibited".into(),
            ));
        }
        let bound_port = if bind_port == 0 {
            self.next_port.fetch_add(1, Ordering::SeqCst)
        } else {
            bind_port
        };
        let (tx, incoming) = mpsc::channel(8);
        self.listeners.lock().insert(bound_port, tx);
        Ok(RemoteListener {
            bound_port,
            incoming,
        })
    }

    async fn cancel_remote_listener(&self, bind_host: &str, bind_port: u16) -> Result<(), SshError> {
        self.ensure_open()?;
        self.listeners.lock().remove(&bind_port);
        self.cancelled.lock().push((bind_host.to_string(), bind_port));
        Ok(())
    }

    async fn run_command(&self, command: &str) -> Result<CommandOutput, SshError> {
        self.ensure_open()?;
        self.commands.lock().push(command.to_string());
        let scripted = self
            .scripts
            .lock()
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map(|(_, output)| output.clone());
        Ok(scripted.unwrap_or(CommandOutput {
            stdout: String::new(),
            exit_code: Some(127),
        }))
    }

    fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.state.transition(SessionState::Closed);
        self.listeners.lock().clear();
    }
}

/// Hands out [`FakeSession`]s and remembers them
pub(crate) struct FakeFactory {
    mode: ChannelMode,
    fail_auth: AtomicBool,
    scripts: Mutex<Vec<Script>>,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeFactory {
    pub fn new(mode: ChannelMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            fail_auth: AtomicBool::new(false),
            scripts: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_auth(&self, fail: bool) {
        self.fail_auth.store(fail, Ordering::SeqCst);
    }

    /// Script a command answer for every session opened afterwards
    pub fn script(&self, needle: &str, stdout: &str, exit_code: u32) {
        self.scripts.lock().push(script(needle, stdout, exit_code));
    }

    pub fn opens(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn last_session(&self) -> Option<Arc<FakeSession>> {
        self.sessions.lock().last().cloned()
    }
}

#[async_trait]
impl SessionFactory for FakeFactory {
    async fn open(&self, config: &SshConfig) -> Result<Arc<dyn TunnelSession>, SshError> {
        if self.fail_auth.load(Ordering::SeqCst) {
            return Err(SshError::AuthenticationFailed(format!(
                "{}@{} rejected the credentials",
                config.username, config.host
            )));
        }
        let session = FakeSession::with_scripts(self.mode.clone(), self.scripts.lock().clone());
        self.sessions.lock().push(session.clone());
        Ok(session)
    }
}
