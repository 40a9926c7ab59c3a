//! SSH Configuration

use serde::{Deserialize, Serialize};

/// SSH connection configuration for one target host.
///
/// This is the resolved host descriptor handed over by the surrounding
/// application: credentials are already looked up, nothing here is prompted for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Authentication method
    pub auth: AuthMethod,

    /// Connection timeout in seconds, applied per hop
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Jump hosts (ProxyJump), nearest to the client first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proxy_chain: Vec<ProxyHopConfig>,

    /// Strict host key checking
    /// - true: reject hosts missing from known_hosts
    /// - false: learn unknown hosts, still reject changed keys
    #[serde(default)]
    pub strict_host_key_checking: bool,
}

impl SshConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>, auth: AuthMethod) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            auth,
            ..Default::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_jump_host(mut self, hop: ProxyHopConfig) -> Self {
        self.proxy_chain.push(hop);
        self
    }
}

/// Configuration for a single proxy hop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyHopConfig {
    /// Jump host address
    pub host: String,

    /// Jump host port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for the jump host
    pub username: String,

    /// Authentication method for the jump host
    pub auth: AuthMethod,
}

impl ProxyHopConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>, auth: AuthMethod) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            username: username.into(),
            auth,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// Authentication methods supported
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication
    Password { password: String },

    /// SSH key authentication
    Key {
        /// Path to private key file (`~` is expanded)
        key_path: String,
        /// Optional passphrase for encrypted keys
        passphrase: Option<String>,
    },

    /// SSH agent authentication
    Agent,
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn key(key_path: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::Key {
            key_path: key_path.into(),
            passphrase,
        }
    }

    /// Short name for logs (never includes secrets)
    pub fn kind(&self) -> &'static str {
        match self {
            AuthMethod::Password { .. } => "password",
            AuthMethod::Key { .. } => "key",
            AuthMethod::Agent => "agent",
        }
    }
}

/// Expand `~` to the home directory; russh::keys does not handle it.
pub fn expand_tilde(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped).to_string_lossy().into_owned();
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    30
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: String::new(),
            auth: AuthMethod::Agent,
            timeout_secs: 30,
            proxy_chain: Vec::new(),
            strict_host_key_checking: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_from_json() {
        let json = r#"{
            "host": "hpc.example.org",
            "username": "alice",
            "auth": { "type": "key", "key_path": "~/.ssh/id_ed25519", "passphrase": null }
        }"#;
        let config: SshConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.port, 22);
        assert_eq!(config.timeout_secs, 30);
        assert!(config.proxy_chain.is_empty());
        assert!(!config.strict_host_key_checking);
        assert_eq!(config.auth.kind(), "key");
    }

    #[test]
    fn test_auth_tagged_union() {
        let auth: AuthMethod = serde_json::from_str(r#"{"type":"agent"}"#).unwrap();
        assert!(matches!(auth, AuthMethod::Agent));

        let json = serde_json::to_string(&AuthMethod::password("hunter2")).unwrap();
        assert!(json.contains(r#""type":"password""#));
    }

    #[test]
    fn test_jump_host_builder() {
        let config = SshConfig::new("target", "bob", AuthMethod::Agent)
            .with_port(2222)
            .with_jump_host(ProxyHopConfig::new("jump1", "bob", AuthMethod::Agent))
            .with_jump_host(ProxyHopConfig::new("jump2", "bob", AuthMethod::Agent).port(2200));
        assert_eq!(config.port, 2222);
        assert_eq!(config.proxy_chain.len(), 2);
        assert_eq!(config.proxy_chain[1].port, 2200);
    }

    #[test]
    fn test_expand_tilde_passthrough() {
        assert_eq!(expand_tilde("/etc/ssh/key"), "/etc/ssh/key");
        if dirs::home_dir().is_some() {
            assert!(!expand_tilde("~/.ssh/id_rsa").starts_with('~'));
        }
    }
}
