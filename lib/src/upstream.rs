//! Outbound connection plumbing shared by the external and network
//! services: address parsing and resolution, dialing (with optional TLS),
//! and request transmission over a dedicated connection.

use crate::error::Error;
use futures::future;
use hyper::{header, Body, HeaderMap, Request, Response};
use rustls::client::ServerName;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// A single upstream or downstream byte stream.
pub enum Connection {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
    Tls(Box<tokio_rustls::TlsStream<Connection>>),
}

/// Splits `host[:port]` into its parts, supporting bracketed and bare IPv6
/// literals. `unix:` addresses are not usable here.
pub(crate) fn parse_address(addr: &str, default_port: u16) -> Result<(String, u16), Error> {
    if addr.starts_with("unix:") {
        return Err(Error::InvalidAddress(format!(
            "{addr}: unix addresses are not supported for outbound services"
        )));
    }

    let parse_port = |port: &str| {
        port.parse::<u16>()
            .map_err(|_| Error::InvalidAddress(addr.to_owned()))
    };

    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| Error::InvalidAddress(addr.to_owned()))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => parse_port(port)?,
            None if tail.is_empty() => default_port,
            None => return Err(Error::InvalidAddress(addr.to_owned())),
        };
        return Ok((host.to_owned(), port));
    }

    match addr.rsplit_once(':') {
        // A second colon means a bare IPv6 literal with no port.
        Some((host, _)) if host.contains(':') => Ok((addr.to_owned(), default_port)),
        Some((host, port)) => Ok((host.to_owned(), parse_port(port)?)),
        None => Ok((addr.to_owned(), default_port)),
    }
}

/// Resolves an address string to its socket addresses.
pub(crate) async fn resolve(addr: &str, default_port: u16) -> Result<Vec<SocketAddr>, Error> {
    let (host, port) = parse_address(addr, default_port)?;
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), port))
        .await?
        .collect();
    if addrs.is_empty() {
        return Err(Error::AddressNotFound(addr.to_owned()));
    }
    Ok(addrs)
}

/// Connects to the first reachable address, optionally wrapping in TLS.
pub(crate) async fn dial(
    addrs: &[SocketAddr],
    tls: Option<(&TlsConnector, ServerName)>,
) -> Result<Connection, Error> {
    let mut last_error: Option<io::Error> = None;
    let mut tcp = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                tcp = Some(stream);
                break;
            }
            Err(err) => last_error = Some(err),
        }
    }
    let tcp = match tcp {
        Some(tcp) => tcp,
        None => {
            return Err(last_error
                .map(Error::from)
                .unwrap_or_else(|| Error::AddressNotFound("empty address list".to_owned())))
        }
    };

    match tls {
        Some((connector, server_name)) => {
            let stream = connector
                .connect(server_name, Connection::Tcp(tcp))
                .await?;
            Ok(Connection::Tls(Box::new(stream.into())))
        }
        None => Ok(Connection::Tcp(tcp)),
    }
}

/// Removes framing headers before handing a request to hyper, which
/// computes its own framing from the body.
pub(crate) fn filter_outgoing_headers(headers: &mut HeaderMap) {
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::TRANSFER_ENCODING);
}

/// Sends one request over a dedicated connection, using the request target
/// exactly as given, and returns the response. If the upstream switches
/// protocols and the downstream asked to as well, the two upgraded streams
/// are bridged in the background.
pub(crate) async fn send_request(
    conn: Connection,
    mut req: Request<Body>,
) -> Result<Response<Body>, Error> {
    filter_outgoing_headers(req.headers_mut());
    let downstream_upgrade = req.extensions_mut().remove::<hyper::upgrade::OnUpgrade>();

    let (mut sender, connection) = hyper::client::conn::Builder::new()
        .handshake::<_, Body>(conn)
        .await?;
    tokio::spawn(async move {
        if let Err(error) = connection.await {
            tracing::debug!(%error, "upstream connection error");
        }
    });

    let mut response = sender.send_request(req).await?;

    if response.status() == http::StatusCode::SWITCHING_PROTOCOLS {
        if let Some(downstream) = downstream_upgrade {
            let upstream = hyper::upgrade::on(&mut response);
            tokio::spawn(async move {
                match future::join(downstream, upstream).await {
                    (Ok(mut down), Ok(mut up)) => {
                        let _ = tokio::io::copy_bidirectional(&mut down, &mut up).await;
                    }
                    (down, up) => {
                        let error = down.err().or(up.err());
                        tracing::debug!(?error, "protocol upgrade failed");
                    }
                }
            });
        }
    }

    Ok(response)
}

// Boilerplate forwarding implementations for `Connection`:

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<(), io::Error>> {
        match Pin::get_mut(self) {
            Connection::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Connection::Unix(s) => Pin::new(s).poll_read(cx, buf),
            Connection::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        match Pin::get_mut(self) {
            Connection::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Connection::Unix(s) => Pin::new(s).poll_write(cx, buf),
            Connection::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match Pin::get_mut(self) {
            Connection::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Connection::Unix(s) => Pin::new(s).poll_flush(cx),
            Connection::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match Pin::get_mut(self) {
            Connection::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Connection::Unix(s) => Pin::new(s).poll_shutdown(cx),
            Connection::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_parsing() {
        assert_eq!(
            parse_address("example.com", 80).unwrap(),
            ("example.com".to_owned(), 80)
        );
        assert_eq!(
            parse_address("example.com:8080", 80).unwrap(),
            ("example.com".to_owned(), 8080)
        );
        assert_eq!(
            parse_address("127.0.0.1:443", 80).unwrap(),
            ("127.0.0.1".to_owned(), 443)
        );
        assert_eq!(parse_address("[::1]", 80).unwrap(), ("::1".to_owned(), 80));
        assert_eq!(
            parse_address("[::1]:8443", 80).unwrap(),
            ("::1".to_owned(), 8443)
        );
        assert_eq!(
            parse_address("fe80::1", 80).unwrap(),
            ("fe80::1".to_owned(), 80)
        );
    }

    #[test]
    fn bad_addresses_are_rejected() {
        assert!(parse_address("example.com:notaport", 80).is_err());
        assert!(parse_address("[::1", 80).is_err());
        assert!(parse_address("[::1]8080", 80).is_err());
        assert!(parse_address("unix:/tmp/sock", 80).is_err());
    }
}
