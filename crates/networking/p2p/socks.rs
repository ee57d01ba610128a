//! SOCKS5 client for dialing hidden-service targets through the local tunnel
//! daemon: RFC 1928, no-auth CONNECT, domain-name addressing only. Name
//! resolution happens inside the overlay, so the target is always passed as a
//! domain and never resolved locally.

use crate::{
    error::ChannelError,
    types::{HiddenAddr, SocksProxy},
};
use std::{io::ErrorKind, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tracing::{debug, trace};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REP_SUCCEEDED: u8 = 0x00;

/// Per-read/write deadline for the proxy exchange. Onion circuits can take
/// a long time to build, so this is deliberately generous.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(120);

/// Opens a TCP connection to the proxy and tunnels it to `target:port`.
pub async fn dial(
    proxy: SocksProxy,
    target: &HiddenAddr,
    target_port: u16,
    io_timeout: Duration,
) -> Result<TcpStream, ChannelError> {
    debug!(proxy = %proxy.addr(), %target, target_port, "Dialing through SOCKS5 proxy");
    let mut stream = timeout(io_timeout, TcpStream::connect(proxy.addr()))
        .await
        .map_err(|_| ChannelError::Timeout)??;
    negotiate(&mut stream, target, target_port, io_timeout).await?;
    trace!(%target, "SOCKS5 tunnel established");
    Ok(stream)
}

/// Runs the no-auth CONNECT exchange on an already-open stream.
///
/// Generic over the stream so tests can script the proxy side of the
/// conversation over an in-memory pipe.
pub(crate) async fn negotiate<S>(
    stream: &mut S,
    target: &HiddenAddr,
    target_port: u16,
    io_timeout: Duration,
) -> Result<(), ChannelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Method selection: we offer exactly one method, no authentication.
    write_all(stream, &[SOCKS_VERSION, 1, METHOD_NO_AUTH], io_timeout).await?;
    let mut choice = [0u8; 2];
    read_exact(stream, &mut choice, io_timeout).await?;
    if choice != [SOCKS_VERSION, METHOD_NO_AUTH] {
        return Err(ChannelError::SocksNegotiation);
    }

    // CONNECT request with a DOMAIN target; HiddenAddr caps the length at 255.
    let domain = target.as_str().as_bytes();
    let mut request = Vec::with_capacity(7 + domain.len());
    request.extend_from_slice(&[
        SOCKS_VERSION,
        CMD_CONNECT,
        0x00,
        ATYP_DOMAIN,
        domain.len() as u8,
    ]);
    request.extend_from_slice(domain);
    request.extend_from_slice(&target_port.to_be_bytes());
    write_all(stream, &request, io_timeout).await?;

    // Reply header: VER REP RSV ATYP.
    let mut reply = [0u8; 4];
    read_exact(stream, &mut reply, io_timeout).await?;
    if reply[1] != REP_SUCCEEDED {
        return Err(ChannelError::SocksConnect(reply[1]));
    }

    // Drain BND.ADDR and BND.PORT; the bound address is of no use here.
    let addr_len = match reply[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            read_exact(stream, &mut len, io_timeout).await?;
            len[0] as usize
        }
        _ => return Err(ChannelError::SocksProtocol),
    };
    let mut bound = vec![0u8; addr_len + 2];
    read_exact(stream, &mut bound, io_timeout).await?;
    Ok(())
}

async fn read_exact<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut [u8],
    io_timeout: Duration,
) -> Result<(), ChannelError> {
    match timeout(io_timeout, stream.read_exact(buf)).await {
        Err(_) => Err(ChannelError::Timeout),
        // A proxy hanging up mid-field is a protocol failure, not plain I/O.
        Ok(Err(err)) if err.kind() == ErrorKind::UnexpectedEof => Err(ChannelError::SocksProtocol),
        Ok(Err(err)) => Err(err.into()),
        Ok(Ok(_)) => Ok(()),
    }
}

async fn write_all<S: AsyncWrite + Unpin>(
    stream: &mut S,
    buf: &[u8],
    io_timeout: Duration,
) -> Result<(), ChannelError> {
    match timeout(io_timeout, stream.write_all(buf)).await {
        Err(_) => Err(ChannelError::Timeout),
        Ok(result) => Ok(result?),
    }
}
