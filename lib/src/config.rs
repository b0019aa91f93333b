//! Gantry configuration: the typed model and its TOML loader.
//!
//! A configuration names a set of services and a set of sockets that route
//! into them. Most validation is deferred to service construction so that a
//! single bad section disables only the service it describes; the loader
//! itself rejects only malformed TOML and unknown keys.

use crate::error::ConfigFileError;
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Unit tests for the configuration model.
#[cfg(test)]
mod unit_tests;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub services: Vec<ServiceConf>,
    #[serde(default)]
    pub sockets: Vec<SocketConf>,
}

impl Config {
    /// Parse a configuration file into a `Config`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        fs::read_to_string(path.as_ref())
            .map_err(|err| ConfigFileError::IoError {
                path: path.as_ref().display().to_string(),
                err,
            })
            .and_then(|text| Self::from_str(&text))
    }
}

impl FromStr for Config {
    type Err = ConfigFileError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).map_err(Into::into)
    }
}

/// A named service definition. Exactly one of the kind tables should be
/// present; a definition with none (or several) becomes the invalid-config
/// service when the server materializes it.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConf {
    pub name: String,
    pub external: Option<ExternalConf>,
    pub network: Option<NetworkConf>,
    pub worker: Option<WorkerConf>,
    pub disk: Option<DiskConf>,
}

pub enum ServiceKind<'a> {
    Unspecified,
    Ambiguous,
    External(&'a ExternalConf),
    Network(&'a NetworkConf),
    Worker(&'a WorkerConf),
    Disk(&'a DiskConf),
}

impl ServiceConf {
    pub fn kind(&self) -> ServiceKind<'_> {
        let mut kind = ServiceKind::Unspecified;
        let mut count = 0;
        if let Some(conf) = &self.external {
            kind = ServiceKind::External(conf);
            count += 1;
        }
        if let Some(conf) = &self.network {
            kind = ServiceKind::Network(conf);
            count += 1;
        }
        if let Some(conf) = &self.worker {
            kind = ServiceKind::Worker(conf);
            count += 1;
        }
        if let Some(conf) = &self.disk {
            kind = ServiceKind::Disk(conf);
            count += 1;
        }
        match count {
            0 => ServiceKind::Unspecified,
            1 => kind,
            _ => ServiceKind::Ambiguous,
        }
    }
}

/// A listening socket bound to a service.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SocketConf {
    pub name: String,
    pub address: Option<String>,
    pub service: ServiceDesignator,
    pub http: Option<HttpOptionsConf>,
    pub https: Option<HttpsSocketConf>,
}

pub enum SocketProtocol<'a> {
    /// Plain HTTP; `None` means no options table was given and defaults apply.
    Http(Option<&'a HttpOptionsConf>),
    Https(&'a HttpsSocketConf),
    Ambiguous,
}

impl SocketConf {
    pub fn protocol(&self) -> SocketProtocol<'_> {
        match (&self.http, &self.https) {
            (_, None) => SocketProtocol::Http(self.http.as_ref()),
            (None, Some(https)) => SocketProtocol::Https(https),
            (Some(_), Some(_)) => SocketProtocol::Ambiguous,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpsSocketConf {
    #[serde(default)]
    pub options: HttpOptionsConf,
    #[serde(default)]
    pub tls_options: TlsOptionsConf,
}

/// A reference to a service, optionally naming a worker entrypoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ServiceDesignator {
    Name(String),
    WithEntrypoint {
        name: String,
        entrypoint: Option<String>,
    },
}

impl ServiceDesignator {
    pub fn name(&self) -> &str {
        match self {
            ServiceDesignator::Name(name) => name,
            ServiceDesignator::WithEntrypoint { name, .. } => name,
        }
    }

    pub fn entrypoint(&self) -> Option<&str> {
        match self {
            ServiceDesignator::Name(_) => None,
            ServiceDesignator::WithEntrypoint { entrypoint, .. } => entrypoint.as_deref(),
        }
    }
}

impl From<&str> for ServiceDesignator {
    fn from(name: &str) -> Self {
        ServiceDesignator::Name(name.to_owned())
    }
}

// =======================================================================
// HTTP options

/// Per-socket / per-external-server HTTP translation options.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpOptionsConf {
    #[serde(default)]
    pub style: HttpStyle,
    pub forwarded_proto_header: Option<String>,
    pub cf_blob_header: Option<String>,
    #[serde(default)]
    pub inject_request_headers: Vec<InjectedHeaderConf>,
    #[serde(default)]
    pub inject_response_headers: Vec<InjectedHeaderConf>,
}

/// The request-line convention spoken on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpStyle {
    /// Origin-form request lines; the authority lives in the `Host` header.
    #[default]
    Host,
    /// Absolute-form request lines carrying scheme and authority.
    Proxy,
}

/// A header edit: a value sets the header, no value removes it.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InjectedHeaderConf {
    pub name: String,
    pub value: Option<String>,
}

// =======================================================================
// TLS options

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsOptionsConf {
    pub keypair: Option<TlsKeypairConf>,
    /// PEM text, one certificate per entry.
    #[serde(default)]
    pub trusted_certificates: Vec<String>,
    #[serde(default)]
    pub require_client_certs: bool,
    #[serde(default)]
    pub trust_browser_cas: bool,
    #[serde(default)]
    pub min_version: TlsVersion,
    pub cipher_list: Option<String>,
}

/// A private key and certificate chain, both as PEM text.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsKeypairConf {
    pub private_key: String,
    pub certificate_chain: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum TlsVersion {
    #[default]
    #[serde(rename = "default")]
    GoodDefault,
    #[serde(rename = "ssl3")]
    Ssl3,
    #[serde(rename = "tls1.0")]
    Tls1Dot0,
    #[serde(rename = "tls1.1")]
    Tls1Dot1,
    #[serde(rename = "tls1.2")]
    Tls1Dot2,
    #[serde(rename = "tls1.3")]
    Tls1Dot3,
}

// =======================================================================
// Service kinds

/// An outbound HTTP service pinned to a single upstream address.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExternalConf {
    pub address: Option<String>,
    pub http: Option<HttpOptionsConf>,
    pub https: Option<ExternalHttpsConf>,
}

pub enum ExternalProtocol<'a> {
    Http(Option<&'a HttpOptionsConf>),
    Https(&'a ExternalHttpsConf),
    Ambiguous,
}

impl ExternalConf {
    pub fn protocol(&self) -> ExternalProtocol<'_> {
        match (&self.http, &self.https) {
            (_, None) => ExternalProtocol::Http(self.http.as_ref()),
            (None, Some(https)) => ExternalProtocol::Https(https),
            (Some(_), Some(_)) => ExternalProtocol::Ambiguous,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExternalHttpsConf {
    #[serde(default)]
    pub options: HttpOptionsConf,
    #[serde(default)]
    pub tls_options: TlsOptionsConf,
    /// Expected certificate host, when it differs from the address.
    pub certificate_host: Option<String>,
}

/// A general outbound HTTP service restricted to a set of peers.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConf {
    #[serde(default = "default_network_allow")]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    pub tls_options: Option<TlsOptionsConf>,
}

fn default_network_allow() -> Vec<String> {
    vec!["public".to_owned()]
}

/// A filesystem-backed static server.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiskConf {
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub writable: bool,
    #[serde(default)]
    pub allow_dotfiles: bool,
}

// =======================================================================
// Workers

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConf {
    pub compatibility_date: Option<String>,
    #[serde(default)]
    pub compatibility_flags: Vec<String>,
    #[serde(default)]
    pub modules: Vec<ModuleConf>,
    /// A classic service-worker-syntax script, as an alternative to modules.
    pub service_worker_script: Option<PathBuf>,
    #[serde(default)]
    pub bindings: Vec<BindingConf>,
    #[serde(default = "default_global_outbound")]
    pub global_outbound: ServiceDesignator,
}

fn default_global_outbound() -> ServiceDesignator {
    ServiceDesignator::Name("internet".to_owned())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleConf {
    pub name: String,
    pub path: Option<PathBuf>,
    /// Inline module source, as an alternative to `path`.
    pub content: Option<String>,
    #[serde(default, rename = "type")]
    pub module_type: ModuleType,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleType {
    #[default]
    EsModule,
    CommonJs,
    Text,
    Data,
    Wasm,
    Json,
}

/// A single global binding for a worker. Exactly one of the kind fields
/// should be present.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BindingConf {
    pub name: String,
    pub text: Option<String>,
    /// Base64-encoded bytes.
    pub data: Option<String>,
    /// A JSON document, passed through verbatim.
    pub json: Option<String>,
    pub wasm_module: Option<PathBuf>,
    pub crypto_key: Option<CryptoKeyConf>,
    pub service: Option<ServiceDesignator>,
    pub kv_namespace: Option<ServiceDesignator>,
    pub r2_bucket: Option<ServiceDesignator>,
    pub r2_admin: Option<ServiceDesignator>,
    pub parameter: Option<String>,
    pub durable_object_namespace: Option<String>,
}

pub enum BindingKind<'a> {
    Unspecified,
    Ambiguous,
    Text(&'a str),
    Data(&'a str),
    Json(&'a str),
    WasmModule(&'a Path),
    CryptoKey(&'a CryptoKeyConf),
    Service(&'a ServiceDesignator),
    KvNamespace(&'a ServiceDesignator),
    R2Bucket(&'a ServiceDesignator),
    R2Admin(&'a ServiceDesignator),
    Parameter,
    DurableObjectNamespace,
}

impl BindingConf {
    pub fn kind(&self) -> BindingKind<'_> {
        let mut kind = BindingKind::Unspecified;
        let mut count = 0;
        if let Some(v) = &self.text {
            kind = BindingKind::Text(v);
            count += 1;
        }
        if let Some(v) = &self.data {
            kind = BindingKind::Data(v);
            count += 1;
        }
        if let Some(v) = &self.json {
            kind = BindingKind::Json(v);
            count += 1;
        }
        if let Some(v) = &self.wasm_module {
            kind = BindingKind::WasmModule(v);
            count += 1;
        }
        if let Some(v) = &self.crypto_key {
            kind = BindingKind::CryptoKey(v);
            count += 1;
        }
        if let Some(v) = &self.service {
            kind = BindingKind::Service(v);
            count += 1;
        }
        if let Some(v) = &self.kv_namespace {
            kind = BindingKind::KvNamespace(v);
            count += 1;
        }
        if let Some(v) = &self.r2_bucket {
            kind = BindingKind::R2Bucket(v);
            count += 1;
        }
        if let Some(v) = &self.r2_admin {
            kind = BindingKind::R2Admin(v);
            count += 1;
        }
        if self.parameter.is_some() {
            kind = BindingKind::Parameter;
            count += 1;
        }
        if self.durable_object_namespace.is_some() {
            kind = BindingKind::DurableObjectNamespace;
            count += 1;
        }
        match count {
            0 => BindingKind::Unspecified,
            1 => kind,
            _ => BindingKind::Ambiguous,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CryptoKeyConf {
    /// Base64-encoded raw key bytes.
    pub raw: Option<String>,
    pub hex: Option<String>,
    pub base64: Option<String>,
    /// PEM text; the block must be a `PRIVATE KEY`.
    pub pkcs8: Option<String>,
    /// PEM text; the block must be a `PUBLIC KEY`.
    pub spki: Option<String>,
    /// A JWK as JSON text.
    pub jwk: Option<String>,
    pub algorithm: Option<AlgorithmConf>,
    #[serde(default)]
    pub extractable: bool,
    #[serde(default)]
    pub usages: Vec<String>,
}

pub enum CryptoKeyFormat<'a> {
    Unspecified,
    Ambiguous,
    Raw(&'a str),
    Hex(&'a str),
    Base64(&'a str),
    Pkcs8(&'a str),
    Spki(&'a str),
    Jwk(&'a str),
}

impl CryptoKeyConf {
    pub fn format(&self) -> CryptoKeyFormat<'_> {
        let mut format = CryptoKeyFormat::Unspecified;
        let mut count = 0;
        if let Some(v) = &self.raw {
            format = CryptoKeyFormat::Raw(v);
            count += 1;
        }
        if let Some(v) = &self.hex {
            format = CryptoKeyFormat::Hex(v);
            count += 1;
        }
        if let Some(v) = &self.base64 {
            format = CryptoKeyFormat::Base64(v);
            count += 1;
        }
        if let Some(v) = &self.pkcs8 {
            format = CryptoKeyFormat::Pkcs8(v);
            count += 1;
        }
        if let Some(v) = &self.spki {
            format = CryptoKeyFormat::Spki(v);
            count += 1;
        }
        if let Some(v) = &self.jwk {
            format = CryptoKeyFormat::Jwk(v);
            count += 1;
        }
        match count {
            0 => CryptoKeyFormat::Unspecified,
            1 => format,
            _ => CryptoKeyFormat::Ambiguous,
        }
    }
}

/// A WebCrypto algorithm: either a bare name or a full JSON object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AlgorithmConf {
    Name(String),
    Json(toml::Value),
}
