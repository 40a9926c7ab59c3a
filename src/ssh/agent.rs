//! SSH Agent authentication
//!
//! Signing is delegated to the system agent:
//! - Unix: the socket named by `SSH_AUTH_SOCK`
//! - Windows: the OpenSSH named pipe `\\.\pipe\openssh-ssh-agent`
//!
//! Every identity the agent holds is offered in turn until the server accepts one.

use std::future::Future;

use russh::client::Handle;
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::ssh_key;
use russh::{AgentAuthError, CryptoVec, Signer};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

type DynAgent = AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>;

/// Signer that owns the public key it signs for.
///
/// The stock `Signer` impl on `AgentClient` borrows the key across an await,
/// which makes the `authenticate_publickey_with` future non-`Send`.
struct AgentSigner<'a> {
    agent: &'a mut DynAgent,
}

impl Signer for AgentSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        hash_alg: Option<ssh_key::HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = Result<CryptoVec, Self::Error>> + Send {
        let key = key.clone();
        async move {
            self.agent
                .sign_request(&key, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

/// Connection to the system SSH agent
pub struct SshAgentClient {
    agent: DynAgent,
}

impl SshAgentClient {
    pub async fn connect() -> Result<Self, SshError> {
        #[cfg(unix)]
        {
            let agent = AgentClient::connect_env().await.map_err(|e| {
                SshError::AgentNotAvailable(format!("{} (is SSH_AUTH_SOCK set?)", e))
            })?;
            debug!("Connected to SSH agent via SSH_AUTH_SOCK");
            Ok(Self {
                agent: agent.dynamic(),
            })
        }

        #[cfg(windows)]
        {
            let agent = AgentClient::connect_named_pipe(r"\\.\pipe\openssh-ssh-agent")
                .await
                .map_err(|e| {
                    SshError::AgentNotAvailable(format!(
                        "{} (is the OpenSSH Authentication Agent service running?)",
                        e
                    ))
                })?;
            debug!("Connected to SSH agent via named pipe");
            Ok(Self {
                agent: agent.dynamic(),
            })
        }

        #[cfg(not(any(unix, windows)))]
        {
            Err(SshError::AgentNotAvailable(
                "SSH agent is not supported on this platform".to_string(),
            ))
        }
    }

    /// Offer each agent identity to the server until one is accepted
    pub async fn authenticate(
        &mut self,
        handle: &mut Handle<ClientHandler>,
        username: String,
    ) -> Result<(), SshError> {
        let keys = self
            .agent
            .request_identities()
            .await
            .map_err(|e| SshError::AgentError(format!("failed to list agent keys: {}", e)))?;

        if keys.is_empty() {
            return Err(SshError::AgentError("agent holds no keys".to_string()));
        }

        let mut last_error: Option<String> = None;
        for key in &keys {
            debug!("Offering agent key {} ({})", key.algorithm(), key.comment());

            let mut signer = AgentSigner {
                agent: &mut self.agent,
            };
            match handle
                .authenticate_publickey_with(&username, key.clone(), None, &mut signer)
                .await
            {
                Ok(result) if result.success() => {
                    info!("Agent authentication succeeded with {}", key.comment());
                    return Ok(());
                }
                Ok(_) => debug!("Server rejected agent key {}", key.comment()),
                Err(e) => {
                    warn!("Agent signing failed for {}: {}", key.comment(), e);
                    last_error = Some(e.to_string());
                }
            }
        }

        Err(SshError::AgentError(match last_error {
            Some(e) => format!("no agent key accepted ({} tried, last error: {})", keys.len(), e),
            None => format!("no agent key accepted ({} tried)", keys.len()),
        }))
    }
}
