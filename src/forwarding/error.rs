//! Forwarding error types

use std::io;

use thiserror::Error;

use crate::config::StorageError;
use crate::ssh::SshError;

#[derive(Error, Debug)]
pub enum ForwardError {
    /// Credentials were refused; the record goes to `error` and is not retried.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Jump host {hop} ({host}) failed: {reason}")]
    ChainConnection {
        hop: usize,
        host: String,
        reason: String,
    },

    /// Local bind failed, or the server refused the remote listener
    #[error("Cannot listen on {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("SOCKS5 protocol error: {0}")]
    Protocol(String),

    #[error("SSH session ended: {0}")]
    SessionLifecycle(String),

    #[error(transparent)]
    Ssh(SshError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Forward not found: {0}")]
    NotFound(String),

    #[error("Invalid forward: {0}")]
    InvalidConfig(String),
}

impl From<SshError> for ForwardError {
    fn from(err: SshError) -> Self {
        if err.is_auth_failure() {
            return ForwardError::Authentication(err.to_string());
        }
        match err {
            SshError::ChainFailed { hop, host, reason } => {
                ForwardError::ChainConnection { hop, host, reason }
            }
            SshError::Disconnected => ForwardError::SessionLifecycle(err.to_string()),
            other => ForwardError::Ssh(other),
        }
    }
}

impl serde::Serialize for ForwardError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Classify a bind failure the way users can act on it
pub(crate) fn bind_error(addr: &str, err: &io::Error) -> ForwardError {
    let reason = match err.kind() {
        io::ErrorKind::AddrInUse => {
            "port already in use, another application may be using it".to_string()
        }
        io::ErrorKind::PermissionDenied => {
            "permission denied, ports below 1024 require elevated privileges".to_string()
        }
        io::ErrorKind::AddrNotAvailable => "address is not valid on this system".to_string(),
        _ => err.to_string(),
    };
    ForwardError::Bind {
        addr: addr.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_error_classification() {
        let auth: ForwardError = SshError::AuthenticationFailed("denied".into()).into();
        assert!(matches!(auth, ForwardError::Authentication(_)));

        let chain: ForwardError = SshError::ChainFailed {
            hop: 2,
            host: "jump2".into(),
            reason: "timeout".into(),
        }
        .into();
        assert!(matches!(chain, ForwardError::ChainConnection { hop: 2, .. }));

        let other: ForwardError = SshError::ConnectionFailed("refused".into()).into();
        assert!(matches!(other, ForwardError::Ssh(_)));
    }

    #[test]
    fn test_bind_error_in_use() {
        let err = io::Error::new(io::ErrorKind::AddrInUse, "in use");
        let fe = bind_error("127.0.0.1:8080", &err);
        assert!(fe.to_string().contains("already in use"));
        assert!(fe.to_string().contains("127.0.0.1:8080"));
    }
}
