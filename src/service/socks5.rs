//! SOCKS5 connection acceptor (RFC 1928, RFC 1929).
//!
//! Clients authenticate with username/password where the password is the
//! shared secret. CONNECT relays a TCP stream; UDP ASSOCIATE registers the
//! client with the worker's UDP relay for as long as the control connection
//! stays open.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::service::resolver::ResolveError;
use crate::service::{BoxError, ConnectionAcceptor, ConnectionContext};

const VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCEEDED: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CONNECTION_REFUSED: u8 = 0x05;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

const RELAY_BUFFER: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported protocol version {0:#04x}")]
    Version(u8),

    #[error("client offered no acceptable authentication method")]
    NoAcceptableMethod,

    #[error("authentication failed")]
    AuthFailed,

    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("truncated message")]
    Truncated,

    #[error("invalid domain name")]
    InvalidDomain,

    #[error("idle timeout")]
    IdleTimeout,

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Destination as carried in SOCKS5 requests and UDP headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    /// Decode `ATYP | ADDR | PORT` from the start of `buf`.
    ///
    /// Returns the address and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), ProtocolError> {
        let atyp = *buf.first().ok_or(ProtocolError::Truncated)?;
        let (addr_len, start) = match atyp {
            ATYP_IPV4 => (4, 1),
            ATYP_IPV6 => (16, 1),
            ATYP_DOMAIN => (*buf.get(1).ok_or(ProtocolError::Truncated)? as usize, 2),
            other => return Err(ProtocolError::UnsupportedAddressType(other)),
        };
        let end = start + addr_len + 2;
        if buf.len() < end {
            return Err(ProtocolError::Truncated);
        }

        let raw = &buf[start..start + addr_len];
        let port = u16::from_be_bytes([buf[end - 2], buf[end - 1]]);
        let target = match atyp {
            ATYP_IPV4 => {
                let octets: [u8; 4] = raw.try_into().map_err(|_| ProtocolError::Truncated)?;
                TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
            }
            ATYP_IPV6 => {
                let octets: [u8; 16] = raw.try_into().map_err(|_| ProtocolError::Truncated)?;
                TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
            }
            _ => {
                let host = std::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidDomain)?;
                if host.is_empty() {
                    return Err(ProtocolError::InvalidDomain);
                }
                TargetAddr::Domain(host.to_string(), port)
            }
        };
        Ok((target, end))
    }

    /// Append `ATYP | ADDR | PORT` to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            TargetAddr::Ip(SocketAddr::V4(addr)) => {
                out.push(ATYP_IPV4);
                out.extend_from_slice(&addr.ip().octets());
                out.extend_from_slice(&addr.port().to_be_bytes());
            }
            TargetAddr::Ip(SocketAddr::V6(addr)) => {
                out.push(ATYP_IPV6);
                out.extend_from_slice(&addr.ip().octets());
                out.extend_from_slice(&addr.port().to_be_bytes());
            }
            TargetAddr::Domain(host, port) => {
                out.push(ATYP_DOMAIN);
                out.push(host.len().min(255) as u8);
                out.extend_from_slice(&host.as_bytes()[..host.len().min(255)]);
                out.extend_from_slice(&port.to_be_bytes());
            }
        }
    }

    async fn read_from<R: AsyncRead + Unpin>(reader: &mut R, atyp: u8) -> Result<Self, ProtocolError> {
        let mut buf = vec![atyp];
        match atyp {
            ATYP_IPV4 => buf.resize(1 + 4 + 2, 0),
            ATYP_IPV6 => buf.resize(1 + 16 + 2, 0),
            ATYP_DOMAIN => {
                let len = reader.read_u8().await?;
                buf.push(len);
                buf.resize(2 + len as usize + 2, 0);
            }
            other => return Err(ProtocolError::UnsupportedAddressType(other)),
        }
        let filled = if atyp == ATYP_DOMAIN { 2 } else { 1 };
        reader.read_exact(&mut buf[filled..]).await?;
        Self::decode(&buf).map(|(target, _)| target)
    }
}

/// Request parsed after a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: u8,
    pub target: TargetAddr,
}

/// Built-in acceptor speaking SOCKS5 with shared-secret authentication.
#[derive(Debug, Default, Clone, Copy)]
pub struct Socks5Acceptor;

impl ConnectionAcceptor for Socks5Acceptor {
    fn accept(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        ctx: ConnectionContext,
    ) -> BoxFuture<'static, Result<(), BoxError>> {
        Box::pin(async move {
            serve(stream, peer, ctx).await.map_err(BoxError::from)
        })
    }
}

async fn serve(mut stream: TcpStream, peer: SocketAddr, ctx: ConnectionContext) -> Result<(), ProtocolError> {
    let idle = ctx.idle_timeout;
    let request = tokio::time::timeout(idle, handshake(&mut stream, &ctx))
        .await
        .map_err(|_| ProtocolError::IdleTimeout)??;

    tracing::debug!(
        connection_id = %ctx.id,
        peer = %peer,
        command = request.command,
        target = ?request.target,
        "SOCKS5 request"
    );

    match request.command {
        CMD_CONNECT => connect(stream, request.target, &ctx).await,
        CMD_UDP_ASSOCIATE => associate(stream, peer, &ctx).await,
        other => {
            write_reply(&mut stream, REP_COMMAND_NOT_SUPPORTED, unspecified()).await?;
            Err(ProtocolError::UnsupportedCommand(other))
        }
    }
}

/// Method negotiation, authentication and request parsing.
pub async fn handshake<S>(stream: &mut S, ctx: &ConnectionContext) -> Result<Request, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;
    if version != VERSION {
        return Err(ProtocolError::Version(version));
    }
    let count = stream.read_u8().await? as usize;
    let mut methods = vec![0u8; count];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_USER_PASS) {
        stream.write_all(&[VERSION, METHOD_NONE_ACCEPTABLE]).await?;
        return Err(ProtocolError::NoAcceptableMethod);
    }
    stream.write_all(&[VERSION, METHOD_USER_PASS]).await?;

    let auth_version = stream.read_u8().await?;
    if auth_version != AUTH_VERSION {
        return Err(ProtocolError::Version(auth_version));
    }
    let user_len = stream.read_u8().await? as usize;
    let mut user = vec![0u8; user_len];
    stream.read_exact(&mut user).await?;
    let pass_len = stream.read_u8().await? as usize;
    let mut pass = vec![0u8; pass_len];
    stream.read_exact(&mut pass).await?;

    if !ctx.secret.verify(&pass) {
        stream.write_all(&[AUTH_VERSION, 0x01]).await?;
        return Err(ProtocolError::AuthFailed);
    }
    stream.write_all(&[AUTH_VERSION, 0x00]).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(ProtocolError::Version(header[0]));
    }
    let target = match TargetAddr::read_from(stream, header[3]).await {
        Ok(target) => target,
        Err(ProtocolError::UnsupportedAddressType(atyp)) => {
            write_reply(stream, REP_ADDRESS_NOT_SUPPORTED, unspecified()).await?;
            return Err(ProtocolError::UnsupportedAddressType(atyp));
        }
        Err(e) => return Err(e),
    };

    Ok(Request {
        command: header[1],
        target,
    })
}

async fn connect(mut stream: TcpStream, target: TargetAddr, ctx: &ConnectionContext) -> Result<(), ProtocolError> {
    let dest = match target {
        TargetAddr::Ip(addr) => addr,
        TargetAddr::Domain(host, port) => match ctx.resolver.lookup(&host, port).await {
            Ok(addr) => addr,
            Err(e) => {
                write_reply(&mut stream, REP_HOST_UNREACHABLE, unspecified()).await?;
                return Err(e.into());
            }
        },
    };

    let upstream = match tokio::time::timeout(ctx.idle_timeout, TcpStream::connect(dest)).await {
        Ok(Ok(upstream)) => upstream,
        Ok(Err(e)) => {
            let rep = if e.kind() == io::ErrorKind::ConnectionRefused {
                REP_CONNECTION_REFUSED
            } else {
                REP_GENERAL_FAILURE
            };
            write_reply(&mut stream, rep, unspecified()).await?;
            return Err(e.into());
        }
        Err(_) => {
            write_reply(&mut stream, REP_HOST_UNREACHABLE, unspecified()).await?;
            return Err(ProtocolError::IdleTimeout);
        }
    };

    let bound = upstream.local_addr()?;
    write_reply(&mut stream, REP_SUCCEEDED, bound).await?;

    let (up, down) = relay_idle(stream, upstream, ctx.idle_timeout).await?;
    tracing::debug!(connection_id = %ctx.id, dest = %dest, up, down, "Relay finished");
    Ok(())
}

async fn associate(mut stream: TcpStream, peer: SocketAddr, ctx: &ConnectionContext) -> Result<(), ProtocolError> {
    let _association = ctx.relay_table.associate(peer.ip());

    let mut relay_addr = ctx.relay_addr;
    if relay_addr.ip().is_unspecified() {
        relay_addr.set_ip(stream.local_addr()?.ip());
    }
    write_reply(&mut stream, REP_SUCCEEDED, relay_addr).await?;

    // The association lives until the client closes the control connection,
    // neither side moves anything for the idle timeout, or the relay closes.
    let idle = ctx.idle_timeout;
    let mut relay_closed = ctx.relay_closed.clone();
    let mut last_read = Instant::now();
    let mut sink = [0u8; 64];
    loop {
        let udp_idle = ctx.relay_table.idle_for(&peer.ip()).unwrap_or(idle);
        let quiet = udp_idle.min(last_read.elapsed());
        if quiet >= idle {
            return Err(ProtocolError::IdleTimeout);
        }

        tokio::select! {
            read = stream.read(&mut sink) => {
                if read? == 0 {
                    return Ok(());
                }
                last_read = Instant::now();
            }
            _ = relay_closed.changed() => {
                tracing::debug!(connection_id = %ctx.id, "UDP relay closed, ending association");
                return Ok(());
            }
            _ = tokio::time::sleep(idle - quiet) => {}
        }
    }
}

async fn write_reply<W: AsyncWrite + Unpin>(stream: &mut W, rep: u8, bound: SocketAddr) -> io::Result<()> {
    let mut reply = vec![VERSION, rep, 0x00];
    TargetAddr::Ip(bound).encode(&mut reply);
    stream.write_all(&reply).await
}

fn unspecified() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
}

/// Copy both directions until either side closes or nothing moves for `idle`.
///
/// Returns bytes copied client→upstream and upstream→client.
pub async fn relay_idle<A, B>(a: A, b: B, idle: Duration) -> Result<(u64, u64), ProtocolError>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let start = Instant::now();
    let last_activity = AtomicU64::new(0);

    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let transfer = async {
        tokio::try_join!(
            pipe(&mut a_read, &mut b_write, &last_activity, start),
            pipe(&mut b_read, &mut a_write, &last_activity, start),
        )
    };

    tokio::select! {
        result = transfer => Ok(result?),
        _ = idle_deadline(&last_activity, start, idle) => Err(ProtocolError::IdleTimeout),
    }
}

async fn pipe<R, W>(reader: &mut R, writer: &mut W, last_activity: &AtomicU64, start: Instant) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            writer.shutdown().await?;
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
        last_activity.store(start.elapsed().as_millis() as u64, Ordering::Relaxed);
    }
}

async fn idle_deadline(last_activity: &AtomicU64, start: Instant, idle: Duration) {
    loop {
        let last = Duration::from_millis(last_activity.load(Ordering::Relaxed));
        let deadline = start + last + idle;
        if Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep_until(deadline.into()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::connection_context;

    #[test]
    fn decodes_each_address_type() {
        let v4 = [ATYP_IPV4, 10, 0, 0, 1, 0x01, 0xbb];
        assert_eq!(
            TargetAddr::decode(&v4).unwrap(),
            (TargetAddr::Ip("10.0.0.1:443".parse().unwrap()), 7)
        );

        let mut domain = vec![ATYP_DOMAIN, 11];
        domain.extend_from_slice(b"example.org");
        domain.extend_from_slice(&80u16.to_be_bytes());
        domain.extend_from_slice(b"payload");
        assert_eq!(
            TargetAddr::decode(&domain).unwrap(),
            (TargetAddr::Domain("example.org".into(), 80), 15)
        );

        let mut v6 = vec![ATYP_IPV6];
        v6.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        v6.extend_from_slice(&53u16.to_be_bytes());
        assert_eq!(
            TargetAddr::decode(&v6).unwrap().0,
            TargetAddr::Ip("[::1]:53".parse().unwrap())
        );
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(matches!(TargetAddr::decode(&[]), Err(ProtocolError::Truncated)));
        assert!(matches!(
            TargetAddr::decode(&[ATYP_IPV4, 1, 2]),
            Err(ProtocolError::Truncated)
        ));
        assert!(matches!(
            TargetAddr::decode(&[0x09, 0, 0]),
            Err(ProtocolError::UnsupportedAddressType(0x09))
        ));
        assert!(matches!(
            TargetAddr::decode(&[ATYP_DOMAIN, 0, 0, 80]),
            Err(ProtocolError::InvalidDomain)
        ));
    }

    #[test]
    fn encode_matches_decode_layout() {
        let target = TargetAddr::Domain("a.b".into(), 8080);
        let mut out = Vec::new();
        target.encode(&mut out);
        assert_eq!(out, [ATYP_DOMAIN, 3, b'a', b'.', b'b', 0x1f, 0x90]);
    }

    #[tokio::test]
    async fn handshake_accepts_shared_secret() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let ctx = connection_context("s3cret");

        let server_side = tokio::spawn(async move { handshake(&mut server, &ctx).await });

        client.write_all(&[VERSION, 2, 0x00, METHOD_USER_PASS]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [VERSION, METHOD_USER_PASS]);

        client
            .write_all(&[AUTH_VERSION, 1, b'u', 6, b's', b'3', b'c', b'r', b'e', b't'])
            .await
            .unwrap();
        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [AUTH_VERSION, 0x00]);

        client
            .write_all(&[VERSION, CMD_CONNECT, 0x00, ATYP_IPV4, 127, 0, 0, 1, 0x1f, 0x90])
            .await
            .unwrap();

        let request = server_side.await.unwrap().unwrap();
        assert_eq!(request.command, CMD_CONNECT);
        assert_eq!(request.target, TargetAddr::Ip("127.0.0.1:8080".parse().unwrap()));
    }

    #[tokio::test]
    async fn handshake_rejects_wrong_secret() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let ctx = connection_context("s3cret");

        let server_side = tokio::spawn(async move { handshake(&mut server, &ctx).await });

        client.write_all(&[VERSION, 1, METHOD_USER_PASS]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        client.write_all(&[AUTH_VERSION, 1, b'u', 2, b'n', b'o']).await.unwrap();
        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [AUTH_VERSION, 0x01]);

        assert!(matches!(server_side.await.unwrap(), Err(ProtocolError::AuthFailed)));
    }

    #[tokio::test]
    async fn handshake_requires_password_method() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let ctx = connection_context("s3cret");

        let server_side = tokio::spawn(async move { handshake(&mut server, &ctx).await });

        client.write_all(&[VERSION, 1, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [VERSION, METHOD_NONE_ACCEPTABLE]);
        assert!(matches!(
            server_side.await.unwrap(),
            Err(ProtocolError::NoAcceptableMethod)
        ));
    }

    #[tokio::test]
    async fn relay_copies_both_directions() {
        let (mut client, proxy_client_side) = tokio::io::duplex(1024);
        let (proxy_upstream_side, mut upstream) = tokio::io::duplex(1024);

        let relay = tokio::spawn(relay_idle(
            proxy_client_side,
            proxy_upstream_side,
            Duration::from_secs(5),
        ));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(client);
        drop(upstream);
        let (up, down) = relay.await.unwrap().unwrap();
        assert_eq!((up, down), (4, 5));
    }

    #[tokio::test]
    async fn relay_times_out_when_idle() {
        let (_client, proxy_client_side) = tokio::io::duplex(64);
        let (proxy_upstream_side, _upstream) = tokio::io::duplex(64);

        let result = relay_idle(proxy_client_side, proxy_upstream_side, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(ProtocolError::IdleTimeout)));
    }
}
