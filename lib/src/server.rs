//! Server lifecycle: configuration-to-service materialization, the shared
//! service registry, socket wiring, and the run loop.
//!
//! Construction is deliberately two-phase. Everything that allocates header
//! ids (rewriters, injectors) runs synchronously inside [`Server::run`]
//! before the header table freezes; address resolution and worker builds
//! continue as background tasks while early listeners already serve. A
//! configuration problem disables only the service it belongs to; a failed
//! background task takes the whole server down through the fatal channel.

use crate::config::{
    Config, DiskConf, ExternalConf, ExternalProtocol, NetworkConf, ServiceConf,
    ServiceDesignator, ServiceKind, SocketProtocol,
};
use crate::disk::DiskDirectoryService;
use crate::engine::ScriptEngine;
use crate::error::Error;
use crate::external::{ExternalHttpService, TlsUpstream};
use crate::headers::HeaderTableBuilder;
use crate::listener::{bind_listener, BoundListener, HttpListener, ListenAddr};
use crate::network::{NetworkService, PeerFilter};
use crate::rewriter::HttpRewriter;
use crate::service::{InvalidConfigService, SharedService};
use crate::tls;
use crate::upstream;
use crate::worker::{make_worker, WorkerEntrypointService};
use futures::future::{self, BoxFuture, FutureExt, Shared};
use rustls::client::ServerName;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_rustls::TlsConnector;

/// Callback receiving configuration problems as they are discovered.
pub type ConfigErrorReporter = Arc<dyn Fn(String) + Send + Sync>;

/// The registry's value: a multi-consumer future resolving to a service.
type ServiceFuture = Shared<BoxFuture<'static, SharedService>>;

/// Sparse command-line overrides, keyed by configured name. Every entry
/// must match something in the config; leftovers are configuration errors.
#[derive(Default)]
pub struct Overrides {
    pub sockets: HashMap<String, SocketOverride>,
    pub external_addresses: HashMap<String, String>,
    pub directory_paths: HashMap<String, PathBuf>,
}

pub enum SocketOverride {
    /// Listen on this address instead of the configured one.
    Address(String),
    /// Use an already-bound listener. Tests use this to pick their ports.
    Listener(tokio::net::TcpListener),
}

/// The name-to-service map shared by sockets, worker bindings, and the
/// global-outbound lookup. Entries hold shared futures so that any number
/// of consumers can await the same service while it is still being built.
#[derive(Clone)]
pub(crate) struct ServiceRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    entries: Mutex<HashMap<String, ServiceFuture>>,
    invalid: SharedService,
    report_config_error: ConfigErrorReporter,
}

impl ServiceRegistry {
    fn new(report_config_error: ConfigErrorReporter) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: Mutex::new(HashMap::new()),
                invalid: Arc::new(InvalidConfigService),
                report_config_error,
            }),
        }
    }

    pub(crate) fn report_config_error(&self, message: String) {
        (self.inner.report_config_error)(message)
    }

    pub(crate) fn invalid_service(&self) -> SharedService {
        self.inner.invalid.clone()
    }

    fn insert(&self, name: &str, service: ServiceFuture) -> bool {
        match self.inner.entries.lock().unwrap().entry(name.to_owned()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(service);
                true
            }
        }
    }

    fn contains(&self, name: &str) -> bool {
        self.inner.entries.lock().unwrap().contains_key(name)
    }

    /// Resolves a service designator, applying named-entrypoint rules.
    /// Never fails: unresolvable references are reported and answered with
    /// the invalid-config service.
    pub(crate) async fn lookup(
        &self,
        designator: &ServiceDesignator,
        error_context: String,
    ) -> SharedService {
        // Wait a turn so that every configured service has been registered.
        tokio::task::yield_now().await;

        let target_name = designator.name();
        let entry = self
            .inner
            .entries
            .lock()
            .unwrap()
            .get(target_name)
            .cloned();
        let Some(entry) = entry else {
            self.report_config_error(format!(
                "{error_context} refers to a service \"{target_name}\", but no such service \
                 is defined."
            ));
            return self.invalid_service();
        };
        let service = entry.await;

        let Some(entrypoint) = designator.entrypoint() else {
            return service;
        };
        match service.as_worker() {
            Some(worker) if worker.has_entrypoint(entrypoint) => Arc::new(
                WorkerEntrypointService::new(service.clone(), entrypoint.to_owned()),
            ),
            Some(_) => {
                self.report_config_error(format!(
                    "{error_context} refers to service \"{target_name}\" with a named \
                     entrypoint \"{entrypoint}\", but \"{target_name}\" has no such named \
                     entrypoint."
                ));
                self.invalid_service()
            }
            None => {
                self.report_config_error(format!(
                    "{error_context} refers to service \"{target_name}\" with a named \
                     entrypoint \"{entrypoint}\", but \"{target_name}\" is not a Worker, so \
                     does not have any named entrypoints."
                ));
                self.invalid_service()
            }
        }
    }
}

enum ServiceSource {
    Ready(SharedService),
    Pending(BoxFuture<'static, Result<SharedService, Error>>),
}

enum ListenerSource {
    Bound(tokio::net::TcpListener),
    Addr(String),
}

pub struct Server {
    report_config_error: ConfigErrorReporter,
}

impl Server {
    pub fn new(report_config_error: impl Fn(String) + Send + Sync + 'static) -> Self {
        Self {
            report_config_error: Arc::new(report_config_error),
        }
    }

    fn report(&self, message: String) {
        (self.report_config_error)(message)
    }

    /// Materializes the configuration and serves until something fatal
    /// happens. Dropping the returned future cancels every listener,
    /// connection, and in-flight service build.
    pub async fn run(
        &mut self,
        engine: Arc<dyn ScriptEngine>,
        config: Config,
        mut overrides: Overrides,
    ) -> Result<(), Error> {
        let header_builder = HeaderTableBuilder::new();
        let registry = ServiceRegistry::new(self.report_config_error.clone());
        let mut tasks: JoinSet<()> = JoinSet::new();
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<Error>(1);

        // -------------------------------------------------------------
        // Configure services

        for conf in &config.services {
            let name = conf.name.clone();
            let source =
                self.make_service(conf, &engine, &registry, &header_builder, &mut overrides);
            let entry: ServiceFuture = match source {
                ServiceSource::Ready(service) => future::ready(service).boxed().shared(),
                ServiceSource::Pending(pending) => {
                    let (tx, rx) = oneshot::channel::<SharedService>();
                    let invalid = registry.invalid_service();
                    spawn_task(&mut tasks, fatal_tx.clone(), async move {
                        match pending.await {
                            Ok(service) => {
                                let _ = tx.send(service);
                                Ok(())
                            }
                            // The sender is dropped, so concurrent lookups
                            // settle on the invalid service while the error
                            // tears the server down.
                            Err(error) => Err(error),
                        }
                    });
                    async move { rx.await.unwrap_or(invalid) }.boxed().shared()
                }
            };
            if !registry.insert(&name, entry) {
                self.report(format!(
                    "Config defines multiple services named \"{name}\"."
                ));
            }
        }

        // Make the default "internet" service if it's not there already.
        if !registry.contains("internet") {
            let service = match make_internet_service() {
                Ok(service) => service,
                Err(error) => {
                    self.report(format!(
                        "Could not create the default \"internet\" service: {error}"
                    ));
                    registry.invalid_service()
                }
            };
            registry.insert("internet", future::ready(service).boxed().shared());
        }

        // -------------------------------------------------------------
        // Start sockets

        for sock in &config.sockets {
            let name = sock.name.clone();

            let listener_source = match overrides.sockets.remove(&name) {
                Some(SocketOverride::Listener(listener)) => ListenerSource::Bound(listener),
                Some(SocketOverride::Address(addr)) => ListenerSource::Addr(addr),
                None => match &sock.address {
                    Some(addr) => ListenerSource::Addr(addr.clone()),
                    None => {
                        self.report(format!(
                            "Socket \"{name}\" has no address in the config, so must be \
                             specified on the command line with `--socket-addr`."
                        ));
                        continue;
                    }
                },
            };

            let (default_port, options, tls_acceptor, physical_protocol) = match sock.protocol() {
                SocketProtocol::Http(opts) => {
                    (80, opts.cloned().unwrap_or_default(), None, "http")
                }
                SocketProtocol::Https(https) => {
                    match tls::make_server_acceptor(&https.tls_options) {
                        Ok(acceptor) => (443, https.options.clone(), Some(acceptor), "https"),
                        Err(error) => {
                            self.report(format!(
                                "Socket \"{name}\" has unusable TLS options: {error}"
                            ));
                            continue;
                        }
                    }
                }
                SocketProtocol::Ambiguous => {
                    self.report(format!("Socket \"{name}\" specifies both http and https."));
                    continue;
                }
            };

            // The rewriter has to be created now; the header table freezes
            // as soon as this loop finishes.
            let rewriter = match HttpRewriter::new(&options, &header_builder) {
                Ok(rewriter) => Arc::new(rewriter),
                Err(error) => {
                    self.report(format!(
                        "Socket \"{name}\" has unusable HTTP options: {error}"
                    ));
                    continue;
                }
            };

            let registry_for_socket = registry.clone();
            let designator = sock.service.clone();
            spawn_task(&mut tasks, fatal_tx.clone(), async move {
                let bound = match listener_source {
                    ListenerSource::Bound(listener) => BoundListener::Tcp(listener),
                    ListenerSource::Addr(addr) => {
                        bind_listener(ListenAddr::parse(&addr, default_port)?).await?
                    }
                };
                let service = registry_for_socket
                    .lookup(&designator, format!("Socket \"{name}\""))
                    .await;
                HttpListener::new(bound, tls_acceptor, service, physical_protocol, rewriter)
                    .run()
                    .await
            });
        }

        // -------------------------------------------------------------
        // Leftover overrides never matched anything.

        for name in overrides.sockets.keys() {
            self.report(format!(
                "Config did not define any socket named \"{name}\" to match the override \
                 provided on the command line."
            ));
        }
        for name in overrides.external_addresses.keys() {
            self.report(format!(
                "Config did not define any external service named \"{name}\" to match the \
                 override provided on the command line."
            ));
        }
        for name in overrides.directory_paths.keys() {
            self.report(format!(
                "Config did not define any disk service named \"{name}\" to match the \
                 override provided on the command line."
            ));
        }

        // All header ids were registered synchronously above; freeze the
        // table so listeners may accept as soon as their services resolve.
        header_builder.build();

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => return Ok(()),
                    Some(Ok(())) => {}
                    Some(Err(join_error)) => {
                        return Err(Error::TaskFailed(join_error.to_string()));
                    }
                },
                Some(error) = fatal_rx.recv() => return Err(error),
            }
        }
    }

    fn make_service(
        &self,
        conf: &ServiceConf,
        engine: &Arc<dyn ScriptEngine>,
        registry: &ServiceRegistry,
        header_builder: &HeaderTableBuilder,
        overrides: &mut Overrides,
    ) -> ServiceSource {
        let name = &conf.name;
        match conf.kind() {
            ServiceKind::Unspecified => {
                self.report(format!(
                    "Service named \"{name}\" does not specify what to serve."
                ));
                ServiceSource::Ready(registry.invalid_service())
            }
            ServiceKind::Ambiguous => {
                self.report(format!(
                    "Service named \"{name}\" specifies more than one kind of service."
                ));
                ServiceSource::Ready(registry.invalid_service())
            }
            ServiceKind::External(external) => {
                self.make_external_service(name, external, header_builder, registry, overrides)
            }
            ServiceKind::Network(network) => {
                ServiceSource::Ready(self.make_network_service(name, network, registry))
            }
            ServiceKind::Worker(worker) => ServiceSource::Pending(
                make_worker(
                    engine.clone(),
                    registry.clone(),
                    name.clone(),
                    worker.clone(),
                )
                .boxed(),
            ),
            ServiceKind::Disk(disk) => {
                ServiceSource::Ready(self.make_disk_directory_service(
                    name, disk, registry, overrides,
                ))
            }
        }
    }

    fn make_external_service(
        &self,
        name: &str,
        conf: &ExternalConf,
        header_builder: &HeaderTableBuilder,
        registry: &ServiceRegistry,
        overrides: &mut Overrides,
    ) -> ServiceSource {
        let addr = match overrides.external_addresses.remove(name) {
            Some(addr) => addr,
            None => match &conf.address {
                Some(addr) => addr.clone(),
                None => {
                    self.report(format!(
                        "External service \"{name}\" has no address in the config, so must \
                         be specified on the command line with `--external-addr`."
                    ));
                    return ServiceSource::Ready(registry.invalid_service());
                }
            },
        };

        let (options, default_port, tls_params) = match conf.protocol() {
            ExternalProtocol::Http(opts) => (opts.cloned().unwrap_or_default(), 80, None),
            ExternalProtocol::Https(https) => {
                match tls::make_client_config(&https.tls_options) {
                    Ok(client_config) => (
                        https.options.clone(),
                        443,
                        Some((client_config, https.certificate_host.clone())),
                    ),
                    Err(error) => {
                        self.report(format!(
                            "External service \"{name}\" has unusable TLS options: {error}"
                        ));
                        return ServiceSource::Ready(registry.invalid_service());
                    }
                }
            }
            ExternalProtocol::Ambiguous => {
                self.report(format!(
                    "External service \"{name}\" specifies both http and https."
                ));
                return ServiceSource::Ready(registry.invalid_service());
            }
        };

        let host = match upstream::parse_address(&addr, default_port) {
            Ok((host, _port)) => host,
            Err(error) => {
                self.report(format!(
                    "External service \"{name}\" has an invalid address: {error}"
                ));
                return ServiceSource::Ready(registry.invalid_service());
            }
        };

        let tls_upstream = match tls_params {
            None => None,
            Some((client_config, certificate_host)) => {
                let sni_host = certificate_host.unwrap_or(host);
                match ServerName::try_from(sni_host.as_str()) {
                    Ok(server_name) => Some(TlsUpstream {
                        connector: TlsConnector::from(client_config),
                        server_name,
                    }),
                    Err(_) => {
                        self.report(format!(
                            "External service \"{name}\" has an invalid certificate host: \
                             {sni_host}"
                        ));
                        return ServiceSource::Ready(registry.invalid_service());
                    }
                }
            }
        };

        // The rewriter has to be constructed before any awaits; the header
        // table builder is only usable synchronously.
        let rewriter = match HttpRewriter::new(&options, header_builder) {
            Ok(rewriter) => rewriter,
            Err(error) => {
                self.report(format!(
                    "External service \"{name}\" has unusable HTTP options: {error}"
                ));
                return ServiceSource::Ready(registry.invalid_service());
            }
        };

        ServiceSource::Pending(
            async move {
                let addrs = upstream::resolve(&addr, default_port).await?;
                Ok(Arc::new(ExternalHttpService::new(addrs, tls_upstream, rewriter))
                    as SharedService)
            }
            .boxed(),
        )
    }

    fn make_network_service(
        &self,
        name: &str,
        conf: &NetworkConf,
        registry: &ServiceRegistry,
    ) -> SharedService {
        let filter = match PeerFilter::new(&conf.allow, &conf.deny) {
            Ok(filter) => filter,
            Err(error) => {
                self.report(format!(
                    "Network service \"{name}\" has an invalid peer list: {error}"
                ));
                return registry.invalid_service();
            }
        };
        let tls_config = match &conf.tls_options {
            Some(opts) => match tls::make_client_config(opts) {
                Ok(config) => Some(config),
                Err(error) => {
                    self.report(format!(
                        "Network service \"{name}\" has unusable TLS options: {error}"
                    ));
                    return registry.invalid_service();
                }
            },
            None => None,
        };
        Arc::new(NetworkService::new(filter, tls_config))
    }

    fn make_disk_directory_service(
        &self,
        name: &str,
        conf: &DiskConf,
        registry: &ServiceRegistry,
        overrides: &mut Overrides,
    ) -> SharedService {
        let path = match overrides.directory_paths.remove(name) {
            Some(path) => path,
            None => match &conf.path {
                Some(path) => path.clone(),
                None => {
                    self.report(format!(
                        "Directory \"{name}\" has no path in the config, so must be \
                         specified on the command line with `--directory-path`."
                    ));
                    return registry.invalid_service();
                }
            },
        };
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_dir() => {}
            _ => {
                self.report(format!(
                    "Directory named \"{name}\" not found: {}",
                    path.display()
                ));
                return registry.invalid_service();
            }
        }
        Arc::new(DiskDirectoryService::new(
            path,
            conf.writable,
            conf.allow_dotfiles,
        ))
    }
}

fn make_internet_service() -> Result<SharedService, Error> {
    let filter = PeerFilter::new(&["public".to_owned()], &[])?;
    let tls_config = tls::system_trust_client_config()?;
    Ok(Arc::new(NetworkService::new(filter, Some(tls_config))))
}

fn spawn_task<F>(tasks: &mut JoinSet<()>, fatal: mpsc::Sender<Error>, task: F)
where
    F: Future<Output = Result<(), Error>> + Send + 'static,
{
    tasks.spawn(async move {
        if let Err(error) = task.await {
            let _ = fatal.try_send(error);
        }
    });
}
