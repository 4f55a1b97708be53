use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::common::{Address, Error, Result};

pub const SOCKS_VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

async fn read_exact_timed<S>(stream: &mut S, buf: &mut [u8], deadline: Duration) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    timeout(deadline, stream.read_exact(buf))
        .await
        .map_err(|_| Error::HandshakeTimeout(deadline))??;
    Ok(())
}

/// Method negotiation: offer no-auth only, require the server to pick it.
async fn greet<S>(stream: &mut S, deadline: Duration) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS_VERSION, 0x01, METHOD_NO_AUTH])
        .await?;

    let mut resp = [0u8; 2];
    read_exact_timed(stream, &mut resp, deadline).await?;

    if resp[0] != SOCKS_VERSION {
        return Err(Error::Protocol(format!(
            "server returned unsupported version: 0x{:02x}",
            resp[0]
        )));
    }
    if resp[1] != METHOD_NO_AUTH {
        return Err(Error::Protocol(format!(
            "server rejected no-auth method: 0x{:02x}",
            resp[1]
        )));
    }
    Ok(())
}

/// Send `[VER CMD RSV ATYP ADDR PORT]`, read the reply, return BND.ADDR.
async fn request<S>(
    stream: &mut S,
    cmd: u8,
    target: &Address,
    deadline: Duration,
) -> Result<Address>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut req = BytesMut::with_capacity(32);
    req.put_u8(SOCKS_VERSION);
    req.put_u8(cmd);
    req.put_u8(0x00);
    target.encode_socks5(&mut req);
    stream.write_all(&req).await?;

    let mut head = [0u8; 3];
    read_exact_timed(stream, &mut head, deadline).await?;
    if head[0] != SOCKS_VERSION {
        return Err(Error::Protocol(format!(
            "invalid reply version: 0x{:02x}",
            head[0]
        )));
    }
    if head[1] != 0x00 {
        return Err(Error::socks5_reply(head[1]));
    }

    read_bound_address(stream, deadline).await
}

async fn read_bound_address<S>(stream: &mut S, deadline: Duration) -> Result<Address>
where
    S: AsyncRead + Unpin,
{
    let mut atyp = [0u8; 1];
    read_exact_timed(stream, &mut atyp, deadline).await?;

    match atyp[0] {
        0x01 => {
            let mut raw = [0u8; 6];
            read_exact_timed(stream, &mut raw, deadline).await?;
            let ip = IpAddr::from([raw[0], raw[1], raw[2], raw[3]]);
            let port = u16::from_be_bytes([raw[4], raw[5]]);
            Ok(Address::Ip(SocketAddr::new(ip, port)))
        }
        0x03 => {
            let mut len = [0u8; 1];
            read_exact_timed(stream, &mut len, deadline).await?;
            let mut domain = vec![0u8; len[0] as usize];
            read_exact_timed(stream, &mut domain, deadline).await?;
            let mut port = [0u8; 2];
            read_exact_timed(stream, &mut port, deadline).await?;
            let domain = String::from_utf8(domain)
                .map_err(|_| Error::Protocol("bound domain is not valid UTF-8".into()))?;
            Ok(Address::Domain(domain, u16::from_be_bytes(port)))
        }
        0x04 => {
            let mut raw = [0u8; 18];
            read_exact_timed(stream, &mut raw, deadline).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&raw[..16]);
            let port = u16::from_be_bytes([raw[16], raw[17]]);
            Ok(Address::Ip(SocketAddr::new(IpAddr::from(octets), port)))
        }
        atyp => Err(Error::Protocol(format!(
            "unsupported bound address type: 0x{atyp:02x}"
        ))),
    }
}

/// Full CONNECT establishment over a freshly opened proxy stream.
pub async fn establish_connect<S>(
    stream: &mut S,
    target: &Address,
    deadline: Duration,
) -> Result<Address>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    greet(stream, deadline).await?;
    request(stream, CMD_CONNECT, target, deadline).await
}

/// Full UDP ASSOCIATE establishment. Returns the relay endpoint datagrams
/// must be sent through. A wildcard bound address is substituted with
/// `server_ip` (some servers advertise 0.0.0.0); a zero bound port is a
/// failure.
pub async fn establish_udp_associate<S>(
    stream: &mut S,
    server_ip: IpAddr,
    deadline: Duration,
) -> Result<SocketAddr>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    greet(stream, deadline).await?;

    let placeholder = Address::Ip("0.0.0.0:0".parse().expect("static addr"));
    let bound = request(stream, CMD_UDP_ASSOCIATE, &placeholder, deadline).await?;

    if bound.port() == 0 {
        return Err(Error::Protocol("associate reply carries port 0".into()));
    }
    let relay = bound.resolve().await?;
    if relay.ip().is_unspecified() {
        Ok(SocketAddr::new(server_ip, relay.port()))
    } else {
        Ok(relay)
    }
}
