//! An outbound HTTP service pinned to a single configured upstream.

use crate::error::Error;
use crate::rewriter::HttpRewriter;
use crate::service::{
    unsupported_event, AlarmResult, CustomEvent, CustomEventResult, ScheduledResult, Service,
    SubrequestMetadata, Trace, WorkerInterface,
};
use crate::upstream;
use futures::future::{BoxFuture, FutureExt};
use hyper::{Body, Request, Response};
use rustls::client::ServerName;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;
use tokio_rustls::TlsConnector;

const UNSUPPORTED_EVENT: &str = "External HTTP servers don't support this event type.";

/// TLS parameters for an https upstream.
pub(crate) struct TlsUpstream {
    pub connector: TlsConnector,
    pub server_name: ServerName,
}

pub struct ExternalHttpService {
    inner: Arc<Inner>,
}

struct Inner {
    addrs: Vec<SocketAddr>,
    tls: Option<TlsUpstream>,
    rewriter: HttpRewriter,
}

impl ExternalHttpService {
    pub(crate) fn new(
        addrs: Vec<SocketAddr>,
        tls: Option<TlsUpstream>,
        rewriter: HttpRewriter,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                addrs,
                tls,
                rewriter,
            }),
        }
    }
}

impl Service for ExternalHttpService {
    fn start_request(&self, metadata: SubrequestMetadata) -> Box<dyn WorkerInterface> {
        Box::new(ExternalRequest {
            inner: self.inner.clone(),
            metadata,
        })
    }
}

struct ExternalRequest {
    inner: Arc<Inner>,
    metadata: SubrequestMetadata,
}

impl WorkerInterface for ExternalRequest {
    fn request(
        self: Box<Self>,
        mut req: Request<Body>,
    ) -> BoxFuture<'static, Result<Response<Body>, Error>> {
        let this = *self;
        async move {
            if this.inner.rewriter.needs_rewrite_request() {
                this.inner
                    .rewriter
                    .rewrite_outgoing_request(&mut req, this.metadata.cf_blob_json.as_deref())?;
            }

            let tls = this
                .inner
                .tls
                .as_ref()
                .map(|t| (&t.connector, t.server_name.clone()));
            let conn = upstream::dial(&this.inner.addrs, tls).await?;
            let mut response = upstream::send_request(conn, req).await?;

            if this.inner.rewriter.needs_rewrite_response() {
                this.inner.rewriter.rewrite_response(response.headers_mut());
            }
            Ok(response)
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
