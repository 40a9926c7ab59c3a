//! SOCKS5 server side (RFC 1928), no-auth CONNECT only

use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const VERSION: u8 = 0x05;
pub const AUTH_NONE: u8 = 0x00;
pub const CMD_CONNECT: u8 = 0x01;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;
pub const REP_SUCCESS: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;

#[derive(Error, Debug)]
pub enum Socks5Error {
    #[error("unsupported SOCKS version {0:#04x}")]
    BadVersion(u8),

    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Destination requested by a CONNECT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

/// Read the method-selection message and accept with "no authentication".
///
/// The reply is always `05 00`; clients that did not offer it will hang up.
pub async fn accept_greeting<S>(stream: &mut S) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(Socks5Error::BadVersion(head[0]));
    }

    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;

    stream.write_all(&[VERSION, AUTH_NONE]).await?;
    Ok(())
}

/// Read a CONNECT request.
///
/// Unsupported commands and address types are answered with the matching
/// error reply before the error is returned.
pub async fn read_request<S>(stream: &mut S) -> Result<ConnectTarget, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    let [version, cmd, _rsv, atyp] = head;

    if version != VERSION {
        return Err(Socks5Error::BadVersion(version));
    }
    if cmd != CMD_CONNECT {
        send_reply(stream, REP_CMD_NOT_SUPPORTED).await?;
        return Err(Socks5Error::UnsupportedCommand(cmd));
    }

    let host = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            render_ipv6(&octets)
        }
        other => {
            send_reply(stream, REP_ADDR_NOT_SUPPORTED).await?;
            return Err(Socks5Error::UnsupportedAddressType(other));
        }
    };

    let port = stream.read_u16().await?;
    Ok(ConnectTarget { host, port })
}

/// Write `05 <status> 00 01 0.0.0.0:0`; the bind address is not tracked.
pub async fn send_reply<S>(stream: &mut S, status: u8) -> Result<(), Socks5Error>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&[VERSION, status, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}

/// Eight big-endian 16-bit groups in hex, joined by `:` (no `::` compression)
fn render_ipv6(octets: &[u8; 16]) -> String {
    Ipv6Addr::from(*octets)
        .segments()
        .iter()
        .map(|group| format!("{:x}", group))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_greeting_reply_is_no_auth() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

        accept_greeting(&mut server).await.unwrap();

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn test_greeting_bad_version() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
        assert!(matches!(
            accept_greeting(&mut server).await,
            Err(Socks5Error::BadVersion(0x04))
        ));
    }

    #[tokio::test]
    async fn test_request_ipv4() {
        let (mut client, mut server) = duplex(64);
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 7, 0x1F, 0x90])
            .await
            .unwrap();
        let target = read_request(&mut server).await.unwrap();
        assert_eq!(
            target,
            ConnectTarget {
                host: "10.0.0.7".into(),
                port: 8080
            }
        );
    }

    #[tokio::test]
    async fn test_request_domain() {
        let (mut client, mut server) = duplex(64);
        let mut req = vec![0x05, 0x01, 0x00, 0x03, 11];
        req.extend_from_slice(b"example.org");
        req.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let target = read_request(&mut server).await.unwrap();
        assert_eq!(target.host, "example.org");
        assert_eq!(target.port, 443);
    }

    #[tokio::test]
    async fn test_request_ipv6_uncompressed() {
        let (mut client, mut server) = duplex(64);
        let mut req = vec![0x05, 0x01, 0x00, 0x04];
        req.extend_from_slice(&[0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x01]);
        req.extend_from_slice(&22u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let target = read_request(&mut server).await.unwrap();
        assert_eq!(target.host, "2001:db8:0:0:0:0:0:1");
    }

    #[tokio::test]
    async fn test_request_bad_atyp_replies_08() {
        let (mut client, mut server) = duplex(64);
        client
            .write_all(&[0x05, 0x01, 0x00, 0x05, 1, 2, 3, 4])
            .await
            .unwrap();

        assert!(matches!(
            read_request(&mut server).await,
            Err(Socks5Error::UnsupportedAddressType(0x05))
        ));
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x08, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_request_bind_command_replies_07() {
        let (mut client, mut server) = duplex(64);
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 1, 2, 3, 4, 0, 80])
            .await
            .unwrap();

        assert!(matches!(
            read_request(&mut server).await,
            Err(Socks5Error::UnsupportedCommand(0x02))
        ));
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    }
}
