//! Listening Port Discovery
//!
//! Read-only inventory of listening TCP sockets, locally and on a remote
//! host over an SSH session. Feeds forward suggestions; nothing in the
//! forwarding path depends on it.
//!
//! Each side tries an ordered list of tools and takes the first one that
//! runs. The `is_forwarded` flag is computed from the registry at scan time
//! and may already be stale when the caller reads it.

pub mod parser;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::forwarding::{ForwardStatus, ForwardType, ForwardingRegistry};
use crate::ssh::{SessionFactory, SshConfig, SshError, TunnelSession};

/// A listening TCP socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListeningPort {
    pub port: u16,
    pub pid: Option<u32>,
    pub process_name: Option<String>,
    pub listen_address: String,
    /// Full command line, remote scans only
    pub command_line: Option<String>,
    /// Whether an active forward already covers this port
    pub is_forwarded: bool,
}

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("No port listing tool available (tried {0})")]
    NoTool(String),

    #[error(transparent)]
    Ssh(#[from] SshError),
}

type Parser = fn(&str) -> Vec<ListeningPort>;

/// A shell command line and the parser for its output
struct Candidate {
    command: &'static str,
    parse: Parser,
}

const REMOTE_CANDIDATES: &[Candidate] = &[
    Candidate {
        command: "ss -tlnp 2>/dev/null",
        parse: parser::parse_ss,
    },
    Candidate {
        command: "netstat -tlnp 2>/dev/null",
        parse: parser::parse_netstat,
    },
];

#[cfg(not(windows))]
const LOCAL_CANDIDATES: &[(&str, &[&str], Parser)] = &[
    ("ss", &["-tlnp"], parser::parse_ss),
    ("netstat", &["-tlnp"], parser::parse_netstat),
    (
        "lsof",
        &["-iTCP", "-sTCP:LISTEN", "-nP"],
        parser::parse_lsof,
    ),
];

#[cfg(windows)]
const LOCAL_CANDIDATES: &[(&str, &[&str], Parser)] =
    &[("netstat", &["-ano"], parser::parse_netstat_windows)];

fn tried<'a>(names: impl Iterator<Item = &'a str>) -> String {
    names.collect::<Vec<_>>().join(", ")
}

/// Batched `/proc/<pid>/cmdline` read, one `pid<TAB>args` line per pid
fn cmdline_command(pids: &[u32]) -> String {
    let list = pids
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "for p in {}; do printf '%s\\t' \"$p\"; tr '\\0' ' ' < /proc/$p/cmdline 2>/dev/null; echo; done",
        list
    )
}

pub struct PortScanner {
    registry: ForwardingRegistry,
    factory: Arc<dyn SessionFactory>,
}

impl PortScanner {
    pub fn new(registry: ForwardingRegistry, factory: Arc<dyn SessionFactory>) -> Self {
        Self { registry, factory }
    }

    /// List listening ports on `config`'s host over a short-lived session.
    ///
    /// Local forwards of `host_id` whose target port shows up get their
    /// `running_process` annotated.
    pub async fn scan_remote_ports(
        &self,
        host_id: &str,
        config: &SshConfig,
    ) -> Result<Vec<ListeningPort>, ScanError> {
        let session = self.factory.open(config).await?;
        let result = scan_session(session.as_ref()).await;
        session.close().await;
        let mut ports = result?;

        let covered: HashSet<u16> = self
            .registry
            .list_for_host(host_id)
            .into_iter()
            .filter(|r| r.status == ForwardStatus::Active)
            .filter_map(|r| match r.forward_type {
                ForwardType::Local | ForwardType::Remote => Some(r.remote_port),
                ForwardType::Dynamic => None,
            })
            .collect();
        for port in &mut ports {
            port.is_forwarded = covered.contains(&port.port);
        }

        let processes: HashMap<u16, String> = ports
            .iter()
            .filter_map(|p| {
                let name = p.command_line.clone().or_else(|| p.process_name.clone())?;
                Some((p.port, name))
            })
            .collect();
        self.registry.annotate_running_processes(host_id, &processes);

        info!("Remote scan of {} found {} listening port(s)", host_id, ports.len());
        Ok(ports)
    }

    /// List listening ports on this machine
    pub async fn scan_local_ports(&self) -> Result<Vec<ListeningPort>, ScanError> {
        let mut ports = scan_local().await?;

        let covered: HashSet<u16> = self
            .registry
            .list()
            .into_iter()
            .filter(|r| r.status == ForwardStatus::Active)
            .filter_map(|r| match r.forward_type {
                ForwardType::Local | ForwardType::Dynamic => Some(r.local_port),
                ForwardType::Remote => None,
            })
            .collect();
        for port in &mut ports {
            port.is_forwarded = covered.contains(&port.port);
        }

        debug!("Local scan found {} listening port(s)", ports.len());
        Ok(ports)
    }
}

async fn scan_session(session: &dyn TunnelSession) -> Result<Vec<ListeningPort>, ScanError> {
    let mut found = None;
    for candidate in REMOTE_CANDIDATES {
        let output = match session.run_command(candidate.command).await {
            Ok(output) => output,
            Err(SshError::Disconnected) => return Err(SshError::Disconnected.into()),
            Err(e) => {
                debug!("Remote `{}` failed: {}", candidate.command, e);
                continue;
            }
        };
        if !output.success() && output.stdout.trim().is_empty() {
            debug!(
                "Remote `{}` unavailable (exit {:?})",
                candidate.command, output.exit_code
            );
            continue;
        }
        found = Some((candidate.parse)(&output.stdout));
        break;
    }

    let Some(ports) = found else {
        return Err(ScanError::NoTool(tried(
            REMOTE_CANDIDATES.iter().map(|c| c.command),
        )));
    };
    let mut ports = parser::normalize(ports);

    let mut pids: Vec<u32> = ports.iter().filter_map(|p| p.pid).collect();
    pids.sort_unstable();
    pids.dedup();
    if !pids.is_empty() {
        // Best effort: a failure here leaves command lines empty
        match session.run_command(&cmdline_command(&pids)).await {
            Ok(output) => {
                let cmdlines = parser::parse_cmdlines(&output.stdout);
                for port in &mut ports {
                    port.command_line = port.pid.and_then(|pid| cmdlines.get(&pid).cloned());
                }
            }
            Err(e) => warn!("Failed to read remote command lines: {}", e),
        }
    }

    Ok(ports)
}

async fn scan_local() -> Result<Vec<ListeningPort>, ScanError> {
    for (program, args, parse) in LOCAL_CANDIDATES {
        let output = match Command::new(program).args(*args).output().await {
            Ok(output) => output,
            Err(e) => {
                debug!("Local `{}` unavailable: {}", program, e);
                continue;
            }
        };
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() && stdout.trim().is_empty() {
            debug!("Local `{}` exited with {}", program, output.status);
            continue;
        }
        return Ok(parser::normalize(parse(stdout.as_ref())));
    }
    Err(ScanError::NoTool(tried(
        LOCAL_CANDIDATES.iter().map(|(program, _, _)| *program),
    )))
}
