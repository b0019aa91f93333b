//! The seam between this server and the embedded script executor.
//!
//! The server compiles nothing itself: it collects a worker's source,
//! compatibility flags, and materialized bindings, hands them across this
//! boundary, and gets back a handle that can dispatch individual events.
//! The executor reaches back into the server for subrequests through the
//! [`IoChannelFactory`] it is given per event.

use crate::config::ModuleType;
use crate::error::Error;
use crate::service::{
    AlarmResult, ScheduledResult, SubrequestMetadata, WorkerInterface,
};
use crate::tasks::TaskSet;
use futures::future::BoxFuture;
use hyper::{Body, Request, Response};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Compiles workers into dispatchable handles.
pub trait ScriptEngine: Send + Sync {
    fn compile(
        &self,
        name: &str,
        source: &ScriptSource,
        flags: &CompatibilityFlags,
        limits: &IsolateLimits,
        globals: Vec<Global>,
        reporter: &mut dyn ValidationErrorReporter,
    ) -> Result<Arc<dyn ScriptHandle>, Error>;
}

/// A compiled worker. One handle serves many concurrent events.
pub trait ScriptHandle: Send + Sync {
    fn dispatch(
        &self,
        event: WorkerEvent,
        ctx: EventContext,
    ) -> BoxFuture<'static, Result<WorkerEventResult, Error>>;
}

/// Receives validation problems and discovered handlers during compilation.
pub trait ValidationErrorReporter: Send {
    fn add_error(&mut self, error: String);

    /// Reports an exported handler. `export_name` is `None` for the default
    /// export.
    fn add_handler(&mut self, export_name: Option<&str>, handler_type: &str);
}

/// Worker source code, either as a module graph or a single classic script.
#[derive(Debug, Clone)]
pub enum ScriptSource {
    Modules { main: String, modules: Vec<Module> },
    ServiceWorker { script: String },
}

#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub module_type: ModuleType,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct CompatibilityFlags {
    pub compatibility_date: String,
    pub flags: Vec<String>,
}

/// Fixed limits handed to the executor when building an isolate. Nothing is
/// enforced on requests; the actor-cache LRU settings are the only real
/// numbers.
#[derive(Debug, Clone)]
pub struct IsolateLimits {
    pub actor_cache_soft_limit: u64,
    pub actor_cache_hard_limit: u64,
    pub actor_cache_stale_timeout: Duration,
    pub actor_cache_dirty_key_soft_limit: u32,
    pub actor_cache_max_keys_per_rpc: u32,
}

impl Default for IsolateLimits {
    fn default() -> Self {
        Self {
            actor_cache_soft_limit: 16 << 20,
            actor_cache_hard_limit: 128 << 20,
            actor_cache_stale_timeout: Duration::from_secs(30),
            actor_cache_dirty_key_soft_limit: 64,
            actor_cache_max_keys_per_rpc: 128,
        }
    }
}

/// A named global injected into the worker's environment.
#[derive(Debug)]
pub struct Global {
    pub name: String,
    pub value: GlobalValue,
}

#[derive(Debug)]
pub enum GlobalValue {
    Text(String),
    Data(Vec<u8>),
    /// A JSON document, passed through verbatim.
    Json(String),
    WasmModule(Vec<u8>),
    CryptoKey {
        format: String,
        key_data: CryptoKeyData,
        /// The import algorithm as a JSON document.
        algorithm: Option<String>,
        extractable: bool,
        usages: Vec<String>,
    },
    Fetcher {
        channel: usize,
        requires_host: bool,
        is_in_house: bool,
    },
    KvNamespace {
        subrequest_channel: usize,
    },
    R2Bucket {
        subrequest_channel: usize,
    },
    R2Admin {
        subrequest_channel: usize,
    },
}

#[derive(Debug)]
pub enum CryptoKeyData {
    Bytes(Vec<u8>),
    /// Key material that is itself JSON (JWK).
    Json(String),
}

/// One event delivered to a worker.
pub enum WorkerEvent {
    Http(Request<Body>),
    Scheduled {
        scheduled_time: SystemTime,
        cron: String,
    },
    Alarm {
        scheduled_time: SystemTime,
    },
}

pub enum WorkerEventResult {
    Http(Response<Body>),
    Scheduled(ScheduledResult),
    Alarm(AlarmResult),
}

/// Everything an event needs from the hosting server.
pub struct EventContext {
    pub entrypoint: Option<String>,
    pub cf_blob_json: Option<String>,
    pub channels: Arc<dyn IoChannelFactory>,
    pub limits: Arc<dyn LimitEnforcer>,
    pub observer: Arc<dyn RequestObserver>,
    pub wait_until_tasks: TaskSet,
    /// When set, uncaught exceptions become error responses instead of
    /// failing the event future.
    pub tunnel_exceptions: bool,
}

/// The I/O channels a worker may open during an event. Only subrequest
/// channels are wired up; the other channel classes are not implemented in
/// this server and fail with fixed errors.
pub trait IoChannelFactory: Send + Sync {
    /// Channel numbers index the worker's subrequest table. Passing a
    /// channel that was never allocated is a bug in the caller and panics.
    fn start_subrequest(
        &self,
        channel: usize,
        metadata: SubrequestMetadata,
    ) -> Box<dyn WorkerInterface>;

    fn get_capability(&self, _channel: usize) -> Result<CapabilityChannel, Error> {
        Err(Error::Unsupported {
            msg: "no capability channels",
        })
    }

    fn get_cache(&self) -> Result<CacheChannel, Error> {
        Err(Error::Unsupported {
            msg: "The cache API is not yet implemented.",
        })
    }

    fn write_log(&self, _channel: usize, _message: String) -> Result<(), Error> {
        Err(Error::Unsupported {
            msg: "no logging channels",
        })
    }

    fn get_global_actor(&self, _channel: usize, _id: &str) -> Result<ActorChannel, Error> {
        Err(Error::Unsupported {
            msg: "no actor channels",
        })
    }

    fn get_colo_local_actor(&self, _channel: usize, _id: &str) -> Result<ActorChannel, Error> {
        Err(Error::Unsupported {
            msg: "no actor channels",
        })
    }
}

/// Channel classes that exist in the interface but have no implementation
/// here. Uninhabited: they can be named, never produced.
pub enum CapabilityChannel {}
pub enum CacheChannel {}
pub enum ActorChannel {}

/// Per-event limit hooks. This server enforces no limits.
pub trait LimitEnforcer: Send + Sync {
    fn new_subrequest(&self) {}
    fn buffering_limit(&self) -> usize {
        usize::MAX
    }
}

pub struct NullLimitEnforcer;

impl LimitEnforcer for NullLimitEnforcer {}

/// Per-event observation hooks. The default observer observes nothing.
pub trait RequestObserver: Send + Sync {
    fn request_started(&self) {}
    fn request_finished(&self) {}
}

pub struct NoopRequestObserver;

impl RequestObserver for NoopRequestObserver {}

/// Placeholder engine for builds without an embedded script executor.
/// Worker services fail construction with a configuration error; every
/// other service kind keeps working.
pub struct NoScriptEngine;

impl ScriptEngine for NoScriptEngine {
    fn compile(
        &self,
        _name: &str,
        _source: &ScriptSource,
        _flags: &CompatibilityFlags,
        _limits: &IsolateLimits,
        _globals: Vec<Global>,
        _reporter: &mut dyn ValidationErrorReporter,
    ) -> Result<Arc<dyn ScriptHandle>, Error> {
        Err(Error::Unsupported {
            msg: "this build does not include an embedded script engine",
        })
    }
}
