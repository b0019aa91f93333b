//! A general outbound HTTP service restricted to a configured set of peers.

use crate::error::Error;
use crate::service::{
    unsupported_event, AlarmResult, CustomEvent, CustomEventResult, ScheduledResult, Service,
    SubrequestMetadata, Trace, WorkerInterface,
};
use crate::upstream;
use futures::future::{BoxFuture, FutureExt};
use http::uri::{PathAndQuery, Uri};
use http::HeaderValue;
use hyper::{header, Body, Request, Response};
use rustls::client::ServerName;
use rustls::ClientConfig;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::SystemTime;
use tokio_rustls::TlsConnector;

const UNSUPPORTED_EVENT: &str = "External HTTP servers don't support this event type.";

/// How an address relates to the machine it was seen from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerClass {
    Public,
    Private,
    Local,
}

fn classify(ip: IpAddr) -> PeerClass {
    match ip {
        IpAddr::V4(v4) => {
            if v4.is_loopback() || v4.is_unspecified() {
                PeerClass::Local
            } else if v4.is_private() || v4.is_link_local() {
                PeerClass::Private
            } else {
                PeerClass::Public
            }
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            if v6.is_loopback() || v6.is_unspecified() {
                PeerClass::Local
            } else if first & 0xfe00 == 0xfc00 || first & 0xffc0 == 0xfe80 {
                // Unique-local (fc00::/7) and link-local (fe80::/10) space.
                PeerClass::Private
            } else {
                PeerClass::Public
            }
        }
    }
}

/// One allow/deny entry: a named address category or a CIDR block.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerPattern {
    Public,
    Private,
    Local,
    /// Any routable address, public or private.
    Network,
    Cidr {
        ip: IpAddr,
        prefix_len: u8,
    },
}

impl PeerPattern {
    pub fn parse(spec: &str) -> Result<Self, Error> {
        match spec {
            "public" => return Ok(PeerPattern::Public),
            "private" => return Ok(PeerPattern::Private),
            "local" => return Ok(PeerPattern::Local),
            "network" => return Ok(PeerPattern::Network),
            _ => {}
        }

        let (ip_text, prefix_len) = match spec.split_once('/') {
            Some((ip, len)) => (
                ip,
                Some(
                    len.parse::<u8>()
                        .map_err(|_| Error::InvalidAddress(spec.to_owned()))?,
                ),
            ),
            None => (spec, None),
        };
        let ip: IpAddr = ip_text
            .parse()
            .map_err(|_| Error::InvalidAddress(spec.to_owned()))?;
        let full = match ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix_len = prefix_len.unwrap_or(full);
        if prefix_len > full {
            return Err(Error::InvalidAddress(spec.to_owned()));
        }
        Ok(PeerPattern::Cidr { ip, prefix_len })
    }

    pub fn matches(&self, ip: IpAddr) -> bool {
        match self {
            PeerPattern::Public => classify(ip) == PeerClass::Public,
            PeerPattern::Private => classify(ip) == PeerClass::Private,
            PeerPattern::Local => classify(ip) == PeerClass::Local,
            PeerPattern::Network => classify(ip) != PeerClass::Local,
            PeerPattern::Cidr { ip: net, prefix_len } => cidr_match(ip, *net, *prefix_len),
        }
    }
}

fn cidr_match(ip: IpAddr, net: IpAddr, prefix_len: u8) -> bool {
    match (ip, net) {
        (IpAddr::V4(ip), IpAddr::V4(net)) => {
            let mask = if prefix_len == 0 {
                0
            } else {
                u32::MAX << (32 - u32::from(prefix_len))
            };
            u32::from(ip) & mask == u32::from(net) & mask
        }
        (IpAddr::V6(ip), IpAddr::V6(net)) => {
            let mask = if prefix_len == 0 {
                0
            } else {
                u128::MAX << (128 - u32::from(prefix_len))
            };
            u128::from(ip) & mask == u128::from(net) & mask
        }
        _ => false,
    }
}

/// An allow list and a deny list of peer patterns. A peer is permitted when
/// it matches some allow entry and no deny entry.
#[derive(Debug)]
pub struct PeerFilter {
    allow: Vec<PeerPattern>,
    deny: Vec<PeerPattern>,
}

impl PeerFilter {
    pub fn new(allow: &[String], deny: &[String]) -> Result<Self, Error> {
        Ok(Self {
            allow: allow
                .iter()
                .map(|spec| PeerPattern::parse(spec))
                .collect::<Result<_, _>>()?,
            deny: deny
                .iter()
                .map(|spec| PeerPattern::parse(spec))
                .collect::<Result<_, _>>()?,
        })
    }

    pub fn allows(&self, ip: IpAddr) -> bool {
        !self.deny.iter().any(|pattern| pattern.matches(ip))
            && self.allow.iter().any(|pattern| pattern.matches(ip))
    }
}

/// Outbound HTTP to anywhere the peer filter permits. A single instance
/// serves every request; there is no per-request state.
pub struct NetworkService {
    inner: Arc<Inner>,
}

struct Inner {
    filter: PeerFilter,
    tls: Option<TlsConnector>,
}

impl NetworkService {
    pub(crate) fn new(filter: PeerFilter, tls_config: Option<Arc<ClientConfig>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                filter,
                tls: tls_config.map(TlsConnector::from),
            }),
        }
    }
}

impl Service for NetworkService {
    fn start_request(&self, _metadata: SubrequestMetadata) -> Box<dyn WorkerInterface> {
        Box::new(NetworkRequest {
            inner: self.inner.clone(),
        })
    }
}

struct NetworkRequest {
    inner: Arc<Inner>,
}

impl WorkerInterface for NetworkRequest {
    fn request(
        self: Box<Self>,
        mut req: Request<Body>,
    ) -> BoxFuture<'static, Result<Response<Body>, Error>> {
        let inner = self.inner;
        async move {
            let uri = req.uri().clone();
            let scheme = uri.scheme_str().ok_or(Error::InvalidUrl)?;
            let authority = uri.authority().ok_or(Error::InvalidUrl)?.clone();
            let host = uri.host().ok_or(Error::InvalidUrl)?.to_owned();

            let (tls, default_port) = match scheme {
                "http" => (None, 80),
                "https" => {
                    let connector = inner.tls.as_ref().ok_or(Error::TlsNotConfigured)?;
                    let server_name = ServerName::try_from(host.as_str())
                        .map_err(|_| Error::InvalidUrl)?;
                    (Some((connector, server_name)), 443)
                }
                other => return Err(Error::UnknownScheme(other.to_owned())),
            };
            let port = uri.port_u16().unwrap_or(default_port);

            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), port))
                .await?
                .collect();
            if addrs.is_empty() {
                return Err(Error::AddressNotFound(host));
            }
            let permitted: Vec<SocketAddr> = addrs
                .into_iter()
                .filter(|addr| inner.filter.allows(addr.ip()))
                .collect();
            if permitted.is_empty() {
                return Err(Error::PeerNotPermitted(authority.to_string()));
            }

            // Re-emit as an ordinary origin-form request addressed by Host.
            req.headers_mut()
                .insert(header::HOST, HeaderValue::from_str(authority.as_str())?);
            let path_and_query = uri
                .path_and_query()
                .cloned()
                .unwrap_or_else(|| PathAndQuery::from_static("/"));
            *req.uri_mut() = Uri::builder().path_and_query(path_and_query).build()?;

            let conn = upstream::dial(&permitted, tls).await?;
            upstream::send_request(conn, req).await
        }
        .boxed()
    }

    fn run_scheduled(
        self: Box<Self>,
        _scheduled_time: SystemTime,
        _cron: &str,
    ) -> BoxFuture<'static, Result<ScheduledResult, Error>> {
        unsupported_event(UNSUPPORTED_EVENT)
    }

    fn run_alarm(
        self: Box<Self>,
        _scheduled_time: SystemTime,
    ) -> BoxFuture<'static, Result<AlarmResult, Error>> {
        unsupported_event(UNSUPPORTED_EVENT)
    }

    fn send_traces(self: Box<Self>, _traces: Vec<Trace>) -> Result<(), Error> {
        Err(Error::Unsupported {
            msg: UNSUPPORTED_EVENT,
        })
    }

    fn custom_event(
        self: Box<Self>,
        _event: Box<dyn CustomEvent>,
    ) -> BoxFuture<'static, Result<CustomEventResult, Error>> {
        unsupported_event(UNSUPPORTED_EVENT)
    }
}
