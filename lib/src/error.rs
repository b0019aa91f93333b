//! Error types.

use std::io;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Error when a gantry configuration file cannot be used.
    #[error(transparent)]
    Config(#[from] ConfigFileError),

    /// Raised by the invalid-config placeholder service on every request.
    #[error("Service cannot handle requests because its config is invalid.")]
    InvalidConfigService,

    /// Request HOST header is missing or invalid under host-style rewriting.
    #[error("Request HOST header is missing or invalid")]
    InvalidHost,

    #[error("Request URL is invalid")]
    InvalidUrl,

    /// Error when a service is asked to deliver an event it has no handler for.
    #[error("{msg}")]
    Unsupported { msg: &'static str },

    /// An outbound destination was resolved, but the peer rules for the
    /// service do not permit connecting to it.
    #[error("Connection to {0} blocked by peer restrictions")]
    PeerNotPermitted(String),

    #[error("Could not resolve address: {0}")]
    AddressNotFound(String),

    #[error("Invalid listen or upstream address: {0}")]
    InvalidAddress(String),

    #[error("Cannot connect to an https URL because this service has no TLS options configured")]
    TlsNotConfigured,

    #[error("Unsupported URL scheme: {0}")]
    UnknownScheme(String),

    /// Could not load the native root certificate store.
    #[error("Could not load native certificates: {0}")]
    BadCerts(io::Error),

    #[error(transparent)]
    Tls(#[from] rustls::Error),

    #[error(transparent)]
    HyperError(#[from] hyper::Error),

    #[error(transparent)]
    HttpError(#[from] http::Error),

    #[error(transparent)]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    #[error(transparent)]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    #[error(transparent)]
    InvalidUri(#[from] http::uri::InvalidUri),

    #[error(transparent)]
    IoError(#[from] io::Error),

    /// A background task exited abnormally (panic or cancellation).
    #[error("Background task failed: {0}")]
    TaskFailed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors that can occur while reading a gantry configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// An I/O error that occurred while reading the file.
    #[error("error reading '{path}': {err}")]
    IoError {
        path: String,
        #[source]
        err: io::Error,
    },

    /// An error that occurred while deserializing the file.
    ///
    /// This represents errors caused by syntactically invalid TOML data,
    /// missing fields, etc.
    #[error("error parsing configuration: {0}")]
    InvalidToml(#[from] toml::de::Error),
}
