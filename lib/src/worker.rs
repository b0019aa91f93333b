//! Worker services: binding materialization, the per-request entrypoint,
//! and the subrequest channel table.

use crate::config::{AlgorithmConf, BindingKind, CryptoKeyFormat, WorkerConf};
use crate::engine::{
    CompatibilityFlags, CryptoKeyData, EventContext, Global, GlobalValue, IoChannelFactory,
    IsolateLimits, Module, NoopRequestObserver, NullLimitEnforcer, ScriptEngine, ScriptHandle,
    ScriptSource, ValidationErrorReporter, WorkerEvent, WorkerEventResult,
};
use crate::error::Error;
use crate::server::ServiceRegistry;
use crate::service::{
    AlarmResult, CustomEvent, CustomEventResult, FailedRequest, ScheduledResult, Service,
    SharedService, SubrequestMetadata, Trace, WorkerInterface,
};
use crate::tasks::TaskSet;
use crate::util::{decode_hex, decode_pem, escape_json_string};
use anyhow::anyhow;
use base64::{engine::general_purpose, Engine as _};
use futures::future::{self, BoxFuture, FutureExt};
use hyper::{Body, Request, Response, StatusCode};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::fs;

/// The newest compatibility date this binary understands.
const SUPPORTED_COMPATIBILITY_DATE: &str = "2022-11-30";

/// A compiled worker bound to its subrequest channels and entrypoints.
pub struct WorkerService {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    worker: Arc<dyn ScriptHandle>,
    subrequest_channels: Vec<SharedService>,
    named_entrypoints: HashSet<String>,
    wait_until_tasks: TaskSet,
}

impl WorkerService {
    pub(crate) fn new(
        worker: Arc<dyn ScriptHandle>,
        subrequest_channels: Vec<SharedService>,
        named_entrypoints: HashSet<String>,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                worker,
                subrequest_channels,
                named_entrypoints,
                wait_until_tasks: TaskSet::new("waitUntil"),
            }),
        }
    }

    pub fn has_entrypoint(&self, name: &str) -> bool {
        self.inner.named_entrypoints.contains(name)
    }

    pub(crate) fn start_request_with_entrypoint(
        &self,
        metadata: SubrequestMetadata,
        entrypoint: Option<String>,
    ) -> Box<dyn WorkerInterface> {
        Box::new(WorkerEntrypoint {
            worker: self.inner.worker.clone(),
            entrypoint,
            channels: self.inner.clone(),
            wait_until_tasks: self.inner.wait_until_tasks.clone(),
            tunnel_exceptions: true,
            cf_blob_json: metadata.cf_blob_json,
        })
    }
}

impl Service for WorkerService {
    fn start_request(&self, metadata: SubrequestMetadata) -> Box<dyn WorkerInterface> {
        self.start_request_with_entrypoint(metadata, None)
    }

    fn as_worker(&self) -> Option<&WorkerService> {
        Some(self)
    }
}

impl IoChannelFactory for WorkerInner {
    fn start_subrequest(
        &self,
        channel: usize,
        metadata: SubrequestMetadata,
    ) -> Box<dyn WorkerInterface> {
        assert!(
            channel < self.subrequest_channels.len(),
            "invalid subrequest channel number"
        );
        self.subrequest_channels[channel].start_request(metadata)
    }
}

/// Routes every request to one named entrypoint of the wrapped worker.
pub struct WorkerEntrypointService {
    inner: SharedService,
    entrypoint: String,
}

impl WorkerEntrypointService {
    pub(crate) fn new(inner: SharedService, entrypoint: String) -> Self {
        Self { inner, entrypoint }
    }
}

impl Service for WorkerEntrypointService {
    fn start_request(&self, metadata: SubrequestMetadata) -> Box<dyn WorkerInterface> {
        match self.inner.as_worker() {
            Some(worker) => {
                worker.start_request_with_entrypoint(metadata, Some(self.entrypoint.clone()))
            }
            None => Box::new(FailedRequest(Error::InvalidConfigService)),
        }
    }
}

/// The per-request interface onto a worker. Constructed fresh for every
/// request and discarded afterwards.
struct WorkerEntrypoint {
    worker: Arc<dyn ScriptHandle>,
    entrypoint: Option<String>,
    channels: Arc<WorkerInner>,
    wait_until_tasks: TaskSet,
    tunnel_exceptions: bool,
    cf_blob_json: Option<String>,
}

impl WorkerEntrypoint {
    fn dispatch(self, event: WorkerEvent) -> BoxFuture<'static, Result<WorkerEventResult, Error>> {
        let ctx = EventContext {
            entrypoint: self.entrypoint,
            cf_blob_json: self.cf_blob_json,
            channels: self.channels,
            limits: Arc::new(NullLimitEnforcer),
            observer: Arc::new(NoopRequestObserver),
            wait_until_tasks: self.wait_until_tasks,
            tunnel_exceptions: self.tunnel_exceptions,
        };
        self.worker.dispatch(event, ctx)
    }
}

impl WorkerInterface for WorkerEntrypoint {
    fn request(
        self: Box<Self>,
        req: Request<Body>,
    ) -> BoxFuture<'static, Result<Response<Body>, Error>> {
        let tunnel_exceptions = self.tunnel_exceptions;
        let fut = (*self).dispatch(WorkerEvent::Http(req));
        async move {
            match fut.await {
                Ok(WorkerEventResult::Http(response)) => Ok(response),
                Ok(_) => Err(anyhow!("worker returned a non-HTTP result for an HTTP event").into()),
                Err(error) if tunnel_exceptions => {
                    tracing::error!(%error, "worker threw while handling a request");
                    Ok(Response::builder()
                        .status(StatusCode::INTERNAL_SERVER_ERROR)
                        .body(Body::from(error.to_string()))?)
                }
                Err(error) => Err(error),
            }
        }
        .boxed()
    }

    fn run_scheduled(
        self: Box<Self>,
        scheduled_time: SystemTime,
        cron: &str,
    ) -> BoxFuture<'static, Result<ScheduledResult, Error>> {
        let fut = (*self).dispatch(WorkerEvent::Scheduled {
            scheduled_time,
            cron: cron.to_owned(),
        });
        async move {
            match fut.await? {
                WorkerEventResult::Scheduled(result) => Ok(result),
                _ => Err(anyhow!("worker returned a mismatched result for a scheduled event").into()),
            }
        }
        .boxed()
    }

    fn run_alarm(
        self: Box<Self>,
        scheduled_time: SystemTime,
    ) -> BoxFuture<'static, Result<AlarmResult, Error>> {
        let fut = (*self).dispatch(WorkerEvent::Alarm { scheduled_time });
        async move {
            match fut.await? {
                WorkerEventResult::Alarm(result) => Ok(result),
                _ => Err(anyhow!("worker returned a mismatched result for an alarm event").into()),
            }
        }
        .boxed()
    }

    fn send_traces(self: Box<Self>, _traces: Vec<Trace>) -> Result<(), Error> {
        Err(Error::Unsupported {
            msg: "trace events are not yet supported",
        })
    }

    fn custom_event(
        self: Box<Self>,
        _event: Box<dyn CustomEvent>,
    ) -> BoxFuture<'static, Result<CustomEventResult, Error>> {
        future::ready(Err(Error::Unsupported {
            msg: "custom events are not yet supported",
        }))
        .boxed()
    }
}

/// Collects validation errors under the service's name and remembers which
/// entrypoints the worker exports.
struct WorkerErrorReporter<'a> {
    registry: &'a ServiceRegistry,
    name: &'a str,
    named_entrypoints: HashSet<String>,
    has_default_entrypoint: bool,
}

impl<'a> WorkerErrorReporter<'a> {
    fn new(registry: &'a ServiceRegistry, name: &'a str) -> Self {
        Self {
            registry,
            name,
            named_entrypoints: HashSet::new(),
            has_default_entrypoint: false,
        }
    }
}

impl ValidationErrorReporter for WorkerErrorReporter<'_> {
    fn add_error(&mut self, error: String) {
        self.registry
            .report_config_error(format!("service {}: {}", self.name, error));
    }

    fn add_handler(&mut self, export_name: Option<&str>, _handler_type: &str) {
        match export_name {
            Some(name) => {
                self.named_entrypoints.insert(name.to_owned());
            }
            None => self.has_default_entrypoint = true,
        }
    }
}

/// Builds a worker service from its configuration. Validation problems are
/// reported as configuration errors; only the affected worker degrades to
/// the invalid-config service.
pub(crate) async fn make_worker(
    engine: Arc<dyn ScriptEngine>,
    registry: ServiceRegistry,
    name: String,
    conf: WorkerConf,
) -> Result<SharedService, Error> {
    // Let the registry finish populating before any lookups below.
    tokio::task::yield_now().await;

    let mut reporter = WorkerErrorReporter::new(&registry, &name);

    let flags = compile_compatibility_flags(&conf, &mut reporter);
    let Some(source) = load_script_source(&conf, &mut reporter).await else {
        return Ok(registry.invalid_service());
    };

    let mut subrequest_channels: Vec<SharedService> = Vec::new();
    {
        let service = registry
            .lookup(
                &conf.global_outbound,
                format!("Worker \"{name}\"'s globalOutbound"),
            )
            .await;
        // Channels 0 and 1 both route to the global outbound. The
        // distinction is a legacy artifact nothing should depend on.
        subrequest_channels.push(service.clone());
        subrequest_channels.push(service);
    }

    let mut globals = Vec::new();
    for binding in &conf.bindings {
        let binding_name = binding.name.clone();
        let error_context = format!("Worker \"{name}\"'s binding \"{binding_name}\"");
        let mut add_global = |value: GlobalValue| {
            globals.push(Global {
                name: binding_name.clone(),
                value,
            });
        };

        match binding.kind() {
            BindingKind::Unspecified => {
                reporter.add_error(format!("{error_context} does not specify any binding value."));
            }
            BindingKind::Ambiguous => {
                reporter.add_error(format!(
                    "{error_context} specifies more than one binding value."
                ));
            }
            BindingKind::Text(text) => add_global(GlobalValue::Text(text.to_owned())),
            BindingKind::Data(base64_text) => {
                match general_purpose::STANDARD.decode(base64_text) {
                    Ok(bytes) => add_global(GlobalValue::Data(bytes)),
                    Err(_) => {
                        reporter.add_error(format!("{error_context} contained invalid base64."))
                    }
                }
            }
            BindingKind::Json(json) => add_global(GlobalValue::Json(json.to_owned())),
            BindingKind::WasmModule(path) => match &source {
                ScriptSource::ServiceWorker { .. } => match fs::read(path).await {
                    Ok(bytes) => add_global(GlobalValue::WasmModule(bytes)),
                    Err(err) => reporter.add_error(format!(
                        "{error_context} names a Wasm file that could not be read: {err}"
                    )),
                },
                ScriptSource::Modules { .. } => reporter.add_error(format!(
                    "{error_context} is a Wasm binding, but Wasm bindings are not allowed in \
                     modules-based scripts. Use Wasm modules instead."
                )),
            },
            BindingKind::CryptoKey(key_conf) => {
                if let Some(value) = decode_crypto_key(key_conf, &binding_name, &mut reporter) {
                    add_global(value);
                }
            }
            BindingKind::Service(designator) => {
                let service = registry.lookup(designator, error_context).await;
                add_global(GlobalValue::Fetcher {
                    channel: subrequest_channels.len(),
                    requires_host: true,
                    is_in_house: false,
                });
                subrequest_channels.push(service);
            }
            BindingKind::KvNamespace(designator) => {
                let service = registry.lookup(designator, error_context).await;
                add_global(GlobalValue::KvNamespace {
                    subrequest_channel: subrequest_channels.len(),
                });
                subrequest_channels.push(service);
            }
            BindingKind::R2Bucket(designator) => {
                let service = registry.lookup(designator, error_context).await;
                add_global(GlobalValue::R2Bucket {
                    subrequest_channel: subrequest_channels.len(),
                });
                subrequest_channels.push(service);
            }
            BindingKind::R2Admin(designator) => {
                let service = registry.lookup(designator, error_context).await;
                add_global(GlobalValue::R2Admin {
                    subrequest_channel: subrequest_channels.len(),
                });
                subrequest_channels.push(service);
            }
            BindingKind::Parameter => {
                reporter.add_error(format!(
                    "{error_context} uses parameter bindings, which are not yet implemented (TODO)."
                ));
            }
            BindingKind::DurableObjectNamespace => {
                reporter.add_error(format!(
                    "{error_context} uses durable object namespaces, which are not yet \
                     implemented (TODO)."
                ));
            }
        }
    }

    let handle = match engine.compile(
        &name,
        &source,
        &flags,
        &IsolateLimits::default(),
        globals,
        &mut reporter,
    ) {
        Ok(handle) => handle,
        Err(error) => {
            reporter.add_error(error.to_string());
            return Ok(registry.invalid_service());
        }
    };

    if !reporter.has_default_entrypoint && reporter.named_entrypoints.is_empty() {
        tracing::debug!(worker = %name, "worker exports no handlers");
    }

    Ok(Arc::new(WorkerService::new(
        handle,
        subrequest_channels,
        reporter.named_entrypoints,
    )))
}

fn compile_compatibility_flags(
    conf: &WorkerConf,
    reporter: &mut dyn ValidationErrorReporter,
) -> CompatibilityFlags {
    let compatibility_date = match &conf.compatibility_date {
        Some(date) => {
            if !is_valid_compatibility_date(date) {
                reporter.add_error(format!("Invalid compatibility date: {date}"));
                String::new()
            } else if date.as_str() > SUPPORTED_COMPATIBILITY_DATE {
                reporter.add_error(format!(
                    "This Worker requires compatibility date \"{date}\", but the newest date \
                     supported by this server binary is \"{SUPPORTED_COMPATIBILITY_DATE}\"."
                ));
                date.clone()
            } else {
                date.clone()
            }
        }
        None => {
            reporter.add_error("Worker must specify compatibilityDate.".to_owned());
            String::new()
        }
    };

    let mut seen = HashSet::new();
    for flag in &conf.compatibility_flags {
        if !seen.insert(flag.as_str()) {
            reporter.add_error(format!("Feature flag specified multiple times: {flag}"));
        }
    }

    CompatibilityFlags {
        compatibility_date,
        flags: conf.compatibility_flags.clone(),
    }
}

fn is_valid_compatibility_date(date: &str) -> bool {
    let bytes = date.as_bytes();
    if bytes.len() != 10 || bytes[4] != b'-' || bytes[7] != b'-' {
        return false;
    }
    let digit = |i: usize| (bytes[i] as char).to_digit(10);
    let field = |range: std::ops::Range<usize>| -> Option<u32> {
        range.map(digit).try_fold(0, |acc, d| Some(acc * 10 + d?))
    };
    match (field(0..4), field(5..7), field(8..10)) {
        (Some(_), Some(month), Some(day)) => (1..=12).contains(&month) && (1..=31).contains(&day),
        _ => false,
    }
}

async fn load_script_source(
    conf: &WorkerConf,
    reporter: &mut dyn ValidationErrorReporter,
) -> Option<ScriptSource> {
    match (&conf.service_worker_script, conf.modules.is_empty()) {
        (Some(_), false) => {
            reporter.add_error(
                "Worker specifies both modules and a service worker script.".to_owned(),
            );
            None
        }
        (Some(path), true) => match fs::read_to_string(path).await {
            Ok(script) => Some(ScriptSource::ServiceWorker { script }),
            Err(err) => {
                reporter.add_error(format!(
                    "Could not read service worker script {}: {err}",
                    path.display()
                ));
                None
            }
        },
        (None, true) => {
            reporter.add_error(
                "Worker has no code. Specify `modules` or `service_worker_script`.".to_owned(),
            );
            None
        }
        (None, false) => {
            let main = conf.modules[0].name.clone();
            let mut modules = Vec::new();
            for module_conf in &conf.modules {
                let content = match (&module_conf.content, &module_conf.path) {
                    (Some(content), None) => content.clone().into_bytes(),
                    (None, Some(path)) => match fs::read(path).await {
                        Ok(bytes) => bytes,
                        Err(err) => {
                            reporter.add_error(format!(
                                "Could not read module {}: {err}",
                                path.display()
                            ));
                            return None;
                        }
                    },
                    _ => {
                        reporter.add_error(format!(
                            "Module \"{}\" must specify exactly one of `path` or `content`.",
                            module_conf.name
                        ));
                        return None;
                    }
                };
                modules.push(Module {
                    name: module_conf.name.clone(),
                    module_type: module_conf.module_type,
                    content,
                });
            }
            Some(ScriptSource::Modules { main, modules })
        }
    }
}

fn decode_crypto_key(
    conf: &crate::config::CryptoKeyConf,
    binding_name: &str,
    reporter: &mut dyn ValidationErrorReporter,
) -> Option<GlobalValue> {
    let (format, key_data) = match conf.format() {
        CryptoKeyFormat::Unspecified => {
            reporter.add_error(format!(
                "CryptoKey binding \"{binding_name}\" does not specify a key format."
            ));
            return None;
        }
        CryptoKeyFormat::Ambiguous => {
            reporter.add_error(format!(
                "CryptoKey binding \"{binding_name}\" specifies more than one key format."
            ));
            return None;
        }
        CryptoKeyFormat::Raw(base64_text) | CryptoKeyFormat::Base64(base64_text) => {
            match general_purpose::STANDARD.decode(base64_text) {
                Ok(bytes) => ("raw", CryptoKeyData::Bytes(bytes)),
                Err(_) => {
                    reporter.add_error(format!(
                        "CryptoKey binding \"{binding_name}\" contained invalid base64."
                    ));
                    return None;
                }
            }
        }
        CryptoKeyFormat::Hex(hex_text) => match decode_hex(hex_text) {
            Some(bytes) => ("raw", CryptoKeyData::Bytes(bytes)),
            None => {
                reporter.add_error(format!(
                    "CryptoKey binding \"{binding_name}\" contained invalid hex."
                ));
                return None;
            }
        },
        CryptoKeyFormat::Pkcs8(pem_text) => {
            match checked_pem(pem_text, "PRIVATE KEY", binding_name, reporter) {
                Some(data) => ("pkcs8", CryptoKeyData::Bytes(data)),
                None => return None,
            }
        }
        CryptoKeyFormat::Spki(pem_text) => {
            match checked_pem(pem_text, "PUBLIC KEY", binding_name, reporter) {
                Some(data) => ("spki", CryptoKeyData::Bytes(data)),
                None => return None,
            }
        }
        CryptoKeyFormat::Jwk(json) => ("jwk", CryptoKeyData::Json(json.to_owned())),
    };

    let algorithm = match &conf.algorithm {
        None => None,
        Some(AlgorithmConf::Name(name)) => Some(format!("\"{}\"", escape_json_string(name))),
        Some(AlgorithmConf::Json(value)) => match serde_json::to_string(value) {
            Ok(json) => Some(json),
            Err(err) => {
                reporter.add_error(format!(
                    "CryptoKey binding \"{binding_name}\" has an unusable algorithm: {err}"
                ));
                return None;
            }
        },
    };

    Some(GlobalValue::CryptoKey {
        format: format.to_owned(),
        key_data,
        algorithm,
        extractable: conf.extractable,
        usages: conf.usages.clone(),
    })
}

fn checked_pem(
    pem_text: &str,
    expected_label: &str,
    binding_name: &str,
    reporter: &mut dyn ValidationErrorReporter,
) -> Option<Vec<u8>> {
    let Some(pem) = decode_pem(pem_text) else {
        reporter.add_error(format!(
            "CryptoKey binding \"{binding_name}\" contained invalid PEM format."
        ));
        return None;
    };
    if pem.label != expected_label {
        reporter.add_error(format!(
            "CryptoKey binding \"{binding_name}\" contained wrong PEM type, expected \
             \"{expected_label}\" but got \"{}\".",
            pem.label
        ));
        return None;
    }
    Some(pem.data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CryptoKeyConf;

    #[derive(Default)]
    struct CapturingReporter {
        errors: Vec<String>,
        handlers: Vec<(Option<String>, String)>,
    }

    impl ValidationErrorReporter for CapturingReporter {
        fn add_error(&mut self, error: String) {
            self.errors.push(error);
        }
        fn add_handler(&mut self, export_name: Option<&str>, handler_type: &str) {
            self.handlers
                .push((export_name.map(str::to_owned), handler_type.to_owned()));
        }
    }

    fn key_conf() -> CryptoKeyConf {
        CryptoKeyConf {
            raw: None,
            hex: None,
            base64: None,
            pkcs8: None,
            spki: None,
            jwk: None,
            algorithm: None,
            extractable: false,
            usages: vec![],
        }
    }

    #[test]
    fn hex_keys_decode_to_raw() {
        let conf = CryptoKeyConf {
            hex: Some("deadbeef".to_owned()),
            algorithm: Some(AlgorithmConf::Name("AES-GCM".to_owned())),
            usages: vec!["encrypt".to_owned()],
            ..key_conf()
        };
        let mut reporter = CapturingReporter::default();
        match decode_crypto_key(&conf, "KEY", &mut reporter) {
            Some(GlobalValue::CryptoKey {
                format,
                key_data: CryptoKeyData::Bytes(bytes),
                algorithm,
                ..
            }) => {
                assert_eq!(format, "raw");
                assert_eq!(bytes, vec![0xde, 0xad, 0xbe, 0xef]);
                assert_eq!(algorithm.as_deref(), Some("\"AES-GCM\""));
            }
            other => panic!("unexpected decode result: {other:?}"),
        }
        assert!(reporter.errors.is_empty());
    }

    #[test]
    fn invalid_hex_reports_an_error() {
        let conf = CryptoKeyConf {
            hex: Some("xyz".to_owned()),
            ..key_conf()
        };
        let mut reporter = CapturingReporter::default();
        assert!(decode_crypto_key(&conf, "KEY", &mut reporter).is_none());
        assert!(reporter.errors[0].contains("invalid hex"));
    }

    #[test]
    fn pkcs8_requires_a_private_key_block() {
        let pem = format!(
            "-----BEGIN PUBLIC KEY-----\n{}\n-----END PUBLIC KEY-----\n",
            general_purpose::STANDARD.encode(b"bytes")
        );
        let conf = CryptoKeyConf {
            pkcs8: Some(pem),
            ..key_conf()
        };
        let mut reporter = CapturingReporter::default();
        assert!(decode_crypto_key(&conf, "KEY", &mut reporter).is_none());
        assert!(reporter.errors[0].contains("wrong PEM type"));
        assert!(reporter.errors[0].contains("expected \"PRIVATE KEY\""));
    }

    #[test]
    fn spki_keys_decode() {
        let pem = format!(
            "-----BEGIN PUBLIC KEY-----\n{}\n-----END PUBLIC KEY-----\n",
            general_purpose::STANDARD.encode(b"bytes")
        );
        let conf = CryptoKeyConf {
            spki: Some(pem),
            ..key_conf()
        };
        let mut reporter = CapturingReporter::default();
        match decode_crypto_key(&conf, "KEY", &mut reporter) {
            Some(GlobalValue::CryptoKey { format, .. }) => assert_eq!(format, "spki"),
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn jwk_key_material_stays_json() {
        let conf = CryptoKeyConf {
            jwk: Some("{\"kty\":\"oct\"}".to_owned()),
            ..key_conf()
        };
        let mut reporter = CapturingReporter::default();
        match decode_crypto_key(&conf, "KEY", &mut reporter) {
            Some(GlobalValue::CryptoKey {
                format,
                key_data: CryptoKeyData::Json(json),
                ..
            }) => {
                assert_eq!(format, "jwk");
                assert_eq!(json, "{\"kty\":\"oct\"}");
            }
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn a_key_needs_exactly_one_format() {
        let mut reporter = CapturingReporter::default();
        assert!(decode_crypto_key(&key_conf(), "KEY", &mut reporter).is_none());
        assert!(reporter.errors[0].contains("does not specify a key format"));

        let conf = CryptoKeyConf {
            hex: Some("00".to_owned()),
            base64: Some("AA==".to_owned()),
            ..key_conf()
        };
        let mut reporter = CapturingReporter::default();
        assert!(decode_crypto_key(&conf, "KEY", &mut reporter).is_none());
        assert!(reporter.errors[0].contains("more than one key format"));
    }

    #[test]
    fn compatibility_date_is_required_and_validated() {
        let mut conf = WorkerConf {
            compatibility_date: None,
            compatibility_flags: vec![],
            modules: vec![],
            service_worker_script: None,
            bindings: vec![],
            global_outbound: crate::config::ServiceDesignator::Name("internet".to_owned()),
        };

        let mut reporter = CapturingReporter::default();
        compile_compatibility_flags(&conf, &mut reporter);
        assert!(reporter.errors[0].contains("must specify compatibilityDate"));

        conf.compatibility_date = Some("not-a-date".to_owned());
        let mut reporter = CapturingReporter::default();
        compile_compatibility_flags(&conf, &mut reporter);
        assert!(reporter.errors[0].contains("Invalid compatibility date"));

        conf.compatibility_date = Some("2099-01-01".to_owned());
        let mut reporter = CapturingReporter::default();
        compile_compatibility_flags(&conf, &mut reporter);
        assert!(reporter.errors[0].contains("newest date supported"));

        conf.compatibility_date = Some("2022-10-31".to_owned());
        conf.compatibility_flags =
            vec!["nodejs_compat".to_owned(), "nodejs_compat".to_owned()];
        let mut reporter = CapturingReporter::default();
        let flags = compile_compatibility_flags(&conf, &mut reporter);
        assert_eq!(flags.compatibility_date, "2022-10-31");
        assert!(reporter.errors[0].contains("specified multiple times"));
    }

    #[test]
    fn date_format_checking() {
        assert!(is_valid_compatibility_date("2022-10-31"));
        assert!(!is_valid_compatibility_date("2022-13-01"));
        assert!(!is_valid_compatibility_date("2022-00-10"));
        assert!(!is_valid_compatibility_date("22-10-31"));
        assert!(!is_valid_compatibility_date("2022/10/31"));
    }
}
