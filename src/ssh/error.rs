//! SSH Error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A jump host in the proxy chain failed; earlier hops were already closed.
    #[error("Jump host {hop} ({host}) failed: {reason}")]
    ChainFailed {
        hop: usize,
        host: String,
        reason: String,
    },

    #[error("Host key verification failed: {0}")]
    HostKeyRejected(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Remote listener rejected: {0}")]
    ForwardRejected(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Disconnected")]
    Disconnected,

    #[error("SSH Agent not available: {0}")]
    AgentNotAvailable(String),

    #[error("SSH Agent error: {0}")]
    AgentError(String),
}

impl SshError {
    /// Whether this error means the credentials were refused.
    ///
    /// Agent and key loading failures count as authentication failures since the
    /// caller can only fix them by changing the credential material.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            SshError::AuthenticationFailed(_)
                | SshError::KeyError(_)
                | SshError::AgentNotAvailable(_)
                | SshError::AgentError(_)
        )
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ProtocolError(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

impl serde::Serialize for SshError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
