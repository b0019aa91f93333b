//! Inbound listeners: address parsing, the accept loop, per-connection
//! client blobs, and the per-request bridge into a bound service.

use crate::error::Error;
use crate::rewriter::HttpRewriter;
use crate::service::{SharedService, SubrequestMetadata};
use crate::tasks::TaskSet;
use crate::upstream;
use crate::util::escape_json_string;
use hyper::service::Service as HyperService;
use hyper::{Body, Request, Response, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{self, Poll};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// A parsed listening address.
#[derive(Debug, PartialEq)]
pub(crate) enum ListenAddr {
    Tcp { host: String, port: u16 },
    #[cfg(unix)]
    Unix(std::path::PathBuf),
}

impl ListenAddr {
    pub fn parse(addr: &str, default_port: u16) -> Result<Self, Error> {
        if let Some(path) = addr.strip_prefix("unix:") {
            #[cfg(unix)]
            return Ok(ListenAddr::Unix(std::path::PathBuf::from(path)));
            #[cfg(not(unix))]
            return Err(Error::InvalidAddress(format!(
                "{addr}: unix sockets are not supported on this platform"
            )));
        }
        let (host, port) = upstream::parse_address(addr, default_port)?;
        let host = if host == "*" { "0.0.0.0".to_owned() } else { host };
        Ok(ListenAddr::Tcp { host, port })
    }
}

/// A bound, accepting endpoint.
pub(crate) enum BoundListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

pub(crate) async fn bind_listener(addr: ListenAddr) -> Result<BoundListener, Error> {
    match addr {
        ListenAddr::Tcp { host, port } => Ok(BoundListener::Tcp(
            TcpListener::bind((host.as_str(), port)).await?,
        )),
        #[cfg(unix)]
        ListenAddr::Unix(path) => {
            // A previous run may have left its socket file behind.
            let _ = std::fs::remove_file(&path);
            Ok(BoundListener::Unix(tokio::net::UnixListener::bind(&path)?))
        }
    }
}

/// Who is on the other end of an accepted stream.
pub(crate) enum PeerIdentity {
    Network(SocketAddr),
    #[cfg(unix)]
    Local { pid: Option<i32>, uid: Option<u32> },
}

impl BoundListener {
    pub async fn accept(&self) -> io::Result<(upstream::Connection, PeerIdentity)> {
        match self {
            BoundListener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok((upstream::Connection::Tcp(stream), PeerIdentity::Network(addr)))
            }
            #[cfg(unix)]
            BoundListener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                let peer = match stream.peer_cred() {
                    Ok(cred) => PeerIdentity::Local {
                        pid: cred.pid(),
                        uid: Some(cred.uid()),
                    },
                    Err(_) => PeerIdentity::Local {
                        pid: None,
                        uid: None,
                    },
                };
                Ok((upstream::Connection::Unix(stream), peer))
            }
        }
    }
}

/// Builds the client-describing JSON blob for a freshly accepted stream.
/// TLS streams report the transport peer underneath; client-certificate
/// details are not propagated.
fn peer_cf_blob(peer: &PeerIdentity) -> Option<String> {
    match peer {
        PeerIdentity::Network(addr) => Some(format!(
            "{{\"clientIp\": \"{}\"}}",
            escape_json_string(&addr.ip().to_string())
        )),
        #[cfg(unix)]
        PeerIdentity::Local { pid, uid } => {
            let mut parts = Vec::new();
            if let Some(pid) = pid {
                parts.push(format!("\"clientPid\":{pid}"));
            }
            if let Some(uid) = uid {
                parts.push(format!("\"clientUid\":{uid}"));
            }
            Some(format!("{{{}}}", parts.join(",")))
        }
    }
}

/// One listening socket bound to one service.
pub(crate) struct HttpListener {
    inner: Arc<ListenerInner>,
}

struct ListenerInner {
    listener: BoundListener,
    tls: Option<TlsAcceptor>,
    service: SharedService,
    physical_protocol: &'static str,
    rewriter: Arc<HttpRewriter>,
    tasks: TaskSet,
}

impl HttpListener {
    pub fn new(
        listener: BoundListener,
        tls: Option<TlsAcceptor>,
        service: SharedService,
        physical_protocol: &'static str,
        rewriter: Arc<HttpRewriter>,
    ) -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                listener,
                tls,
                service,
                physical_protocol,
                rewriter,
                tasks: TaskSet::new("connection"),
            }),
        }
    }

    /// Accepts connections forever. Accept failures propagate; they take
    /// the whole server down rather than silently dropping a socket.
    pub async fn run(self) -> Result<(), Error> {
        loop {
            let (stream, peer) = self.inner.listener.accept().await?;
            let inner = self.inner.clone();
            self.inner.tasks.add(async move {
                let stream = match &inner.tls {
                    Some(acceptor) => {
                        upstream::Connection::Tls(Box::new(acceptor.accept(stream).await?.into()))
                    }
                    None => stream,
                };

                // When the rewriter transports its own blob header, the
                // upstream told us who the client is; otherwise describe
                // the peer we accepted.
                let cf_blob_json = if inner.rewriter.has_cf_blob_header() {
                    None
                } else {
                    peer_cf_blob(&peer)
                };

                let connection = Connection {
                    inner: inner.clone(),
                    cf_blob_json,
                };
                hyper::server::conn::Http::new()
                    .serve_connection(stream, connection)
                    .with_upgrades()
                    .await?;
                Ok(())
            });
        }
    }
}

/// Per-connection request handler. Holds the connection's client blob and
/// hands each request to the bound service.
struct Connection {
    inner: Arc<ListenerInner>,
    cf_blob_json: Option<String>,
}

impl HyperService<Request<Body>> for Connection {
    type Response = Response<Body>;
    type Error = Infallible;
    #[allow(clippy::type_complexity)]
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut task::Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let inner = self.inner.clone();
        // Every request gets its own copy of the connection's blob.
        let cf_blob_json = self.cf_blob_json.clone();
        Box::pin(async move {
            let response = handle_request(inner, cf_blob_json, req)
                .await
                .unwrap_or_else(|error| {
                    tracing::error!(%error, "uncaught exception while handling a request");
                    error_response(StatusCode::INTERNAL_SERVER_ERROR)
                });
            Ok(response)
        })
    }
}

async fn handle_request(
    inner: Arc<ListenerInner>,
    cf_blob_json: Option<String>,
    mut req: Request<Body>,
) -> Result<Response<Body>, Error> {
    let mut metadata = SubrequestMetadata { cf_blob_json };
    let rewriter = &inner.rewriter;

    if rewriter.needs_rewrite_request() || metadata.cf_blob_json.is_some() {
        if rewriter
            .rewrite_incoming_request(&mut req, inner.physical_protocol, &mut metadata.cf_blob_json)
            .is_none()
        {
            // Unusable request; answer directly, skipping response rewrites.
            return Ok(error_response(StatusCode::BAD_REQUEST));
        }
    }

    let worker = inner.service.start_request(metadata);
    let mut response = worker.request(req).await?;

    if rewriter.needs_rewrite_response() {
        rewriter.rewrite_response(response.headers_mut());
    }
    Ok(response)
}

fn error_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}
