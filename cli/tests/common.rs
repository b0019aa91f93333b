//! Common values and types used by the integration tests.
#![allow(dead_code)] // The exported values are used by other modules in the test suite

use futures::future::{BoxFuture, FutureExt};
use gantry_lib::config::Config;
use gantry_lib::engine::{
    CompatibilityFlags, EventContext, Global, IsolateLimits, ScriptEngine, ScriptHandle,
    ScriptSource, ValidationErrorReporter, WorkerEvent, WorkerEventResult,
};
use gantry_lib::service::SubrequestMetadata;
use gantry_lib::{Error, Overrides, Server, SocketOverride};
use hyper::{header, Body, Request, Response};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// A catch-all error, so we can easily use `?` in test cases.
pub type TestError = Box<dyn std::error::Error + Send + Sync>;

/// Handy alias for the return type of async tokio tests.
pub type TestResult = Result<(), TestError>;

/// The script engine used by test workers. HTTP events echo the request
/// back: the internal URL, the pinned entrypoint, the client blob, and the
/// `x-inject` header if present. Paths of the form `/sub/N` are forwarded
/// through subrequest channel `N` instead.
pub struct EchoEngine;

impl ScriptEngine for EchoEngine {
    fn compile(
        &self,
        _name: &str,
        _source: &ScriptSource,
        _flags: &CompatibilityFlags,
        _limits: &IsolateLimits,
        _globals: Vec<Global>,
        reporter: &mut dyn ValidationErrorReporter,
    ) -> Result<Arc<dyn ScriptHandle>, Error> {
        reporter.add_handler(None, "fetch");
        reporter.add_handler(Some("admin"), "fetch");
        Ok(Arc::new(EchoHandle))
    }
}

pub struct EchoHandle;

impl ScriptHandle for EchoHandle {
    fn dispatch(
        &self,
        event: WorkerEvent,
        ctx: EventContext,
    ) -> BoxFuture<'static, Result<WorkerEventResult, Error>> {
        async move {
            let WorkerEvent::Http(req) = event else {
                return Err(Error::Unsupported { msg: "http only" });
            };

            if let Some(channel) = req
                .uri()
                .path()
                .strip_prefix("/sub/")
                .and_then(|c| c.parse::<usize>().ok())
            {
                let sub = ctx
                    .channels
                    .start_subrequest(channel, SubrequestMetadata::default());
                let response = sub.request(req).await?;
                return Ok(WorkerEventResult::Http(response));
            }

            let inject = req
                .headers()
                .get("x-inject")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-");
            let body = format!(
                "url={} entrypoint={} cf={} x-inject={inject}",
                req.uri(),
                ctx.entrypoint.as_deref().unwrap_or("-"),
                ctx.cf_blob_json.as_deref().unwrap_or("-"),
            );
            Ok(WorkerEventResult::Http(Response::new(Body::from(body))))
        }
        .boxed()
    }
}

/// A builder for one server-under-test.
pub struct Test {
    config: Config,
    overrides: Overrides,
}

impl Test {
    pub fn from_toml(toml: &str) -> Self {
        Self {
            config: toml.parse().expect("valid test config"),
            overrides: Overrides::default(),
        }
    }

    pub fn external_addr(mut self, name: &str, addr: SocketAddr) -> Self {
        self.overrides
            .external_addresses
            .insert(name.to_owned(), addr.to_string());
        self
    }

    /// Binds a local listener for each named socket and starts the server
    /// in the background.
    pub async fn start(mut self, socket_names: &[&str]) -> RunningTest {
        let mut addrs = HashMap::new();
        for name in socket_names {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
                .await
                .expect("can bind a test listener");
            addrs.insert(
                (*name).to_owned(),
                listener.local_addr().expect("listener has an address"),
            );
            self.overrides
                .sockets
                .insert((*name).to_owned(), SocketOverride::Listener(listener));
        }

        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let config = self.config;
        let overrides = self.overrides;
        let server = tokio::spawn(async move {
            let mut server = Server::new(move |message| sink.lock().unwrap().push(message));
            let _ = server.run(Arc::new(EchoEngine), config, overrides).await;
        });

        // Let the service registry and listeners wire themselves up.
        tokio::time::sleep(Duration::from_millis(100)).await;

        RunningTest {
            addrs,
            errors,
            server,
        }
    }
}

pub struct RunningTest {
    addrs: HashMap<String, SocketAddr>,
    errors: Arc<Mutex<Vec<String>>>,
    server: JoinHandle<()>,
}

impl RunningTest {
    pub fn addr(&self, socket: &str) -> SocketAddr {
        self.addrs[socket]
    }

    pub fn config_errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    pub async fn get(&self, socket: &str, path: &str) -> Response<Body> {
        self.request(socket, Request::get(path).body(Body::empty()).unwrap())
            .await
    }

    pub async fn request(&self, socket: &str, mut req: Request<Body>) -> Response<Body> {
        let addr = self.addr(socket);
        let uri = format!("http://{}{}", addr, req.uri());
        *req.uri_mut() = uri.parse().expect("valid request URI");
        hyper::Client::new()
            .request(req)
            .await
            .expect("request reaches the server")
    }
}

impl Drop for RunningTest {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// Reads a whole response body as text.
pub async fn body_text(response: Response<Body>) -> String {
    let bytes = hyper::body::to_bytes(response.into_body())
        .await
        .expect("can read response body");
    String::from_utf8(bytes.to_vec()).expect("response body is UTF-8")
}

/// Spawns a plain hyper origin server that reports the path and Host
/// header it sees.
pub async fn spawn_backend() -> (SocketAddr, JoinHandle<()>) {
    let make_svc = hyper::service::make_service_fn(|_conn| async {
        Ok::<_, Infallible>(hyper::service::service_fn(|req: Request<Body>| async move {
            let host = req
                .headers()
                .get(header::HOST)
                .and_then(|h| h.to_str().ok())
                .unwrap_or("-")
                .to_owned();
            let body = format!("backend path={} host={host}", req.uri());
            Ok::<_, Infallible>(Response::new(Body::from(body)))
        }))
    });
    let server = hyper::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_svc);
    let addr = server.local_addr();
    let handle = tokio::spawn(async move {
        let _ = server.await;
    });
    (addr, handle)
}
