//! Parsers for listening-socket inventories
//!
//! Every parser takes the raw stdout of one tool and returns whatever it
//! could make sense of. Header lines, non-listening sockets and malformed
//! lines are skipped.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use super::ListeningPort;

/// `users:(("sshd",pid=1234,fd=3))`
static SS_PROCESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"users:\(\("([^"]*)",pid=(\d+)"#).expect("valid ss users pattern")
});

/// Split `host:port`, `[v6]:port`, `:::port` or `*:port`
pub fn split_host_port(addr: &str) -> Option<(String, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let port = port.parse::<u16>().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

fn entry(
    listen_address: String,
    port: u16,
    pid: Option<u32>,
    process_name: Option<String>,
) -> ListeningPort {
    ListeningPort {
        port,
        pid,
        process_name,
        listen_address,
        command_line: None,
        is_forwarded: false,
    }
}

/// `ss -tlnp`
///
/// ```text
/// State  Recv-Q Send-Q Local Address:Port Peer Address:Port Process
/// LISTEN 0      128    0.0.0.0:22         0.0.0.0:*         users:(("sshd",pid=812,fd=3))
/// ```
pub fn parse_ss(output: &str) -> Vec<ListeningPort> {
    let mut ports = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // Older ss builds drop the State column when only listeners are asked for
        let local = match fields.first() {
            Some(&"LISTEN") => fields.get(3),
            Some(first) if first.parse::<u32>().is_ok() => fields.get(2),
            _ => None,
        };
        let Some((address, port)) = local.and_then(|l| split_host_port(l)) else {
            continue;
        };

        let (process_name, pid) = SS_PROCESS
            .captures(line)
            .map(|caps| {
                (
                    caps.get(1).map(|m| m.as_str().to_string()),
                    caps.get(2).and_then(|m| m.as_str().parse().ok()),
                )
            })
            .unwrap_or((None, None));

        ports.push(entry(address, port, pid, process_name));
    }
    ports
}

/// Linux `netstat -tlnp`
///
/// ```text
/// Proto Recv-Q Send-Q Local Address  Foreign Address  State   PID/Program name
/// tcp        0      0 0.0.0.0:22     0.0.0.0:*        LISTEN  812/sshd
/// ```
pub fn parse_netstat(output: &str) -> Vec<ListeningPort> {
    let mut ports = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 || !fields[0].starts_with("tcp") || fields[5] != "LISTEN" {
            continue;
        }
        let Some((address, port)) = split_host_port(fields[3]) else {
            continue;
        };

        let program = fields[6..].join(" ");
        let (pid, process_name) = match program.split_once('/') {
            Some((pid, name)) => (pid.parse().ok(), Some(name.to_string())),
            None => (None, None),
        };

        ports.push(entry(address, port, pid, process_name));
    }
    ports
}

/// Windows `netstat -ano`
///
/// ```text
///   Proto  Local Address    Foreign Address  State      PID
///   TCP    0.0.0.0:135      0.0.0.0:0        LISTENING  1000
/// ```
pub fn parse_netstat_windows(output: &str) -> Vec<ListeningPort> {
    let mut ports = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 || fields[0] != "TCP" || fields[3] != "LISTENING" {
            continue;
        }
        let Some((address, port)) = split_host_port(fields[1]) else {
            continue;
        };
        ports.push(entry(address, port, fields[4].parse().ok(), None));
    }
    ports
}

/// `lsof -iTCP -sTCP:LISTEN -nP`
///
/// ```text
/// COMMAND   PID  USER  FD  TYPE DEVICE SIZE/OFF NODE NAME
/// Python   7777 alice  5u  IPv6 0xabc       0t0  TCP [::1]:8000 (LISTEN)
/// ```
pub fn parse_lsof(output: &str) -> Vec<ListeningPort> {
    let mut ports = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.last() != Some(&"(LISTEN)") {
            continue;
        }
        let Some(tcp) = fields.iter().position(|f| *f == "TCP") else {
            continue;
        };
        let Some((address, port)) = fields.get(tcp + 1).and_then(|n| split_host_port(n)) else {
            continue;
        };
        let pid = fields.get(1).and_then(|p| p.parse().ok());
        let name = fields.first().map(|c| c.replace("\\x20", " "));
        ports.push(entry(address, port, pid, name));
    }
    ports
}

/// Output of the batched `/proc/<pid>/cmdline` read: `pid<TAB>args`
pub fn parse_cmdlines(output: &str) -> HashMap<u32, String> {
    output
        .lines()
        .filter_map(|line| {
            let (pid, cmd) = line.split_once('\t')?;
            let cmd = cmd.trim();
            if cmd.is_empty() {
                return None;
            }
            Some((pid.trim().parse().ok()?, cmd.to_string()))
        })
        .collect()
}

/// Sort by port and drop exact duplicates (tools repeat per-fd entries)
pub fn normalize(mut ports: Vec<ListeningPort>) -> Vec<ListeningPort> {
    ports.sort_by(|a, b| {
        a.port
            .cmp(&b.port)
            .then_with(|| a.listen_address.cmp(&b.listen_address))
    });
    ports.dedup_by(|a, b| a.port == b.port && a.listen_address == b.listen_address);
    ports
}
