//! Service types.
//!
//! Every configured service, whatever its kind, is driven through the same
//! two traits: [`Service`] hands out a per-request [`WorkerInterface`], and
//! the interface delivers exactly one event. The one-shot contract is
//! enforced by the event methods taking `self` by value.

use crate::error::Error;
use crate::worker::WorkerService;
use futures::future::{self, BoxFuture, FutureExt};
use hyper::{Body, Request, Response};
use std::sync::Arc;
use std::time::SystemTime;

/// A shared borrow of a service, valid for the life of the server.
pub type SharedService = Arc<dyn Service>;

/// Per-request metadata handed to a service when a request begins.
#[derive(Debug, Default)]
pub struct SubrequestMetadata {
    /// Opaque JSON describing the client, propagated into workers.
    pub cf_blob_json: Option<String>,
}

/// A named request handler inside the server.
pub trait Service: Send + Sync {
    /// Begin an incoming request. Returns a [`WorkerInterface`] that will be
    /// used for one request and then discarded.
    fn start_request(&self, metadata: SubrequestMetadata) -> Box<dyn WorkerInterface>;

    /// Downcast hook used for named-entrypoint resolution.
    fn as_worker(&self) -> Option<&WorkerService> {
        None
    }
}

/// The handle a service returns for a single request.
pub trait WorkerInterface: Send {
    fn request(self: Box<Self>, req: Request<Body>)
        -> BoxFuture<'static, Result<Response<Body>, Error>>;

    /// Hint that a request to `url` may be coming. Best-effort; the default
    /// does nothing.
    fn prewarm(&mut self, _url: &str) {}

    fn run_scheduled(
        self: Box<Self>,
        _scheduled_time: SystemTime,
        _cron: &str,
    ) -> BoxFuture<'static, Result<ScheduledResult, Error>>;

    fn run_alarm(
        self: Box<Self>,
        _scheduled_time: SystemTime,
    ) -> BoxFuture<'static, Result<AlarmResult, Error>>;

    fn send_traces(self: Box<Self>, _traces: Vec<Trace>) -> Result<(), Error>;

    fn custom_event(
        self: Box<Self>,
        _event: Box<dyn CustomEvent>,
    ) -> BoxFuture<'static, Result<CustomEventResult, Error>>;
}

/// Collected diagnostic events for one request. Tracing is not yet wired
/// through this server, so traces are never populated.
#[derive(Debug, Default)]
pub struct Trace {
    pub logs: Vec<String>,
}

/// An event type defined outside this crate.
pub trait CustomEvent: Send {
    fn type_name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Ok,
    Exception,
    ExceededCpu,
    Canceled,
    Unknown,
}

#[derive(Debug)]
pub struct ScheduledResult {
    pub retry: bool,
    pub outcome: EventOutcome,
}

#[derive(Debug)]
pub struct AlarmResult {
    pub retry: bool,
    pub retry_countable: bool,
    pub outcome: EventOutcome,
}

#[derive(Debug)]
pub struct CustomEventResult {
    pub outcome: EventOutcome,
}

/// Shorthand for the fixed failure every non-HTTP event gets on services
/// that only speak HTTP.
pub(crate) fn unsupported_event<T: Send + 'static>(
    msg: &'static str,
) -> BoxFuture<'static, Result<T, Error>> {
    future::ready(Err(Error::Unsupported { msg })).boxed()
}

/// Service used when the service's config is invalid. Every request fails
/// with a fixed configuration error; other services keep running.
pub struct InvalidConfigService;

impl Service for InvalidConfigService {
    fn start_request(&self, _metadata: SubrequestMetadata) -> Box<dyn WorkerInterface> {
        Box::new(InvalidConfigRequest)
    }
}

struct InvalidConfigRequest;

impl WorkerInterface for InvalidConfigRequest {
    fn request(
        self: Box<Self>,
        _req: Request<Body>,
    ) -> BoxFuture<'static, Result<Response<Body>, Error>> {
        future::ready(Err(Error::InvalidConfigService)).boxed()
    }

    fn run_scheduled(
        self: Box<Self>,
        _scheduled_time: SystemTime,
        _cron: &str,
    ) -> BoxFuture<'static, Result<ScheduledResult, Error>> {
        future::ready(Err(Error::InvalidConfigService)).boxed()
    }

    fn run_alarm(
        self: Box<Self>,
        _scheduled_time: SystemTime,
    ) -> BoxFuture<'static, Result<AlarmResult, Error>> {
        future::ready(Err(Error::InvalidConfigService)).boxed()
    }

    fn send_traces(self: Box<Self>, _traces: Vec<Trace>) -> Result<(), Error> {
        Err(Error::InvalidConfigService)
    }

    fn custom_event(
        self: Box<Self>,
        _event: Box<dyn CustomEvent>,
    ) -> BoxFuture<'static, Result<CustomEventResult, Error>> {
        future::ready(Err(Error::InvalidConfigService)).boxed()
    }
}

/// A request interface that fails immediately with the given error. Used
/// when a request must be answered but the target can no longer serve it.
pub(crate) struct FailedRequest(pub(crate) Error);

impl WorkerInterface for FailedRequest {
    fn request(
        self: Box<Self>,
        _req: Request<Body>,
    ) -> BoxFuture<'static, Result<Response<Body>, Error>> {
        future::ready(Err(self.0)).boxed()
    }

    fn run_scheduled(
        self: Box<Self>,
        _scheduled_time: SystemTime,
        _cron: &str,
    ) -> BoxFuture<'static, Result<ScheduledResult, Error>> {
        future::ready(Err(self.0)).boxed()
    }

    fn run_alarm(
        self: Box<Self>,
        _scheduled_time: SystemTime,
    ) -> BoxFuture<'static, Result<AlarmResult, Error>> {
        future::ready(Err(self.0)).boxed()
    }

    fn send_traces(self: Box<Self>, _traces: Vec<Trace>) -> Result<(), Error> {
        Err(self.0)
    }

    fn custom_event(
        self: Box<Self>,
        _event: Box<dyn CustomEvent>,
    ) -> BoxFuture<'static, Result<CustomEventResult, Error>> {
        future::ready(Err(self.0)).boxed()
    }
}
