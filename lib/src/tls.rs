//! Materializes configured TLS options into rustls server acceptors and
//! client configurations.

use crate::config::{TlsOptionsConf, TlsVersion};
use crate::error::Error;
use anyhow::anyhow;
use rustls::{
    server::AllowAnyAuthenticatedClient, Certificate, ClientConfig, PrivateKey, RootCertStore,
    ServerConfig, SupportedCipherSuite,
};
use std::io::Cursor;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::warn;

/// Builds the acceptor for an https socket. The keypair is required here;
/// a socket cannot terminate TLS without one.
pub fn make_server_acceptor(opts: &TlsOptionsConf) -> Result<TlsAcceptor, Error> {
    let keypair = opts
        .keypair
        .as_ref()
        .ok_or_else(|| anyhow!("https sockets require a TLS keypair"))?;
    let certs = parse_certificates(&keypair.certificate_chain)?;
    let key = parse_private_key(&keypair.private_key)?;

    let suites = cipher_suites(opts.cipher_list.as_deref())?;
    let builder = ServerConfig::builder()
        .with_cipher_suites(&suites)
        .with_safe_default_kx_groups()
        .with_protocol_versions(protocol_versions(opts.min_version))?;

    let builder = if opts.require_client_certs {
        let roots = root_store(opts)?;
        builder.with_client_cert_verifier(AllowAnyAuthenticatedClient::new(roots).boxed())
    } else {
        builder.with_no_client_auth()
    };

    let config = builder.with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Builds the client-side configuration used by outbound services.
pub fn make_client_config(opts: &TlsOptionsConf) -> Result<Arc<ClientConfig>, Error> {
    let suites = cipher_suites(opts.cipher_list.as_deref())?;
    let builder = ClientConfig::builder()
        .with_cipher_suites(&suites)
        .with_safe_default_kx_groups()
        .with_protocol_versions(protocol_versions(opts.min_version))?;

    let builder = builder.with_root_certificates(root_store(opts)?);

    let config = match &opts.keypair {
        Some(keypair) => builder.with_client_auth_cert(
            parse_certificates(&keypair.certificate_chain)?,
            parse_private_key(&keypair.private_key)?,
        )?,
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

/// The client configuration for the default `internet` service: system
/// trust store, no client certificate.
pub fn system_trust_client_config() -> Result<Arc<ClientConfig>, Error> {
    make_client_config(&TlsOptionsConf {
        trust_browser_cas: true,
        ..Default::default()
    })
}

fn root_store(opts: &TlsOptionsConf) -> Result<RootCertStore, Error> {
    let mut roots = RootCertStore::empty();
    for pem in &opts.trusted_certificates {
        for cert in parse_certificates(pem)? {
            roots.add(&cert)?;
        }
    }
    if opts.trust_browser_cas {
        match rustls_native_certs::load_native_certs() {
            Ok(certs) => {
                for cert in certs {
                    if let Err(e) = roots.add(&Certificate(cert.0)) {
                        warn!("failed to load certificate: {e}");
                    }
                }
            }
            Err(err) => return Err(Error::BadCerts(err)),
        }
    }
    if roots.is_empty() {
        warn!("no CA certificates available");
    }
    Ok(roots)
}

fn parse_certificates(pem: &str) -> Result<Vec<Certificate>, Error> {
    let certs = rustls_pemfile::certs(&mut Cursor::new(pem.as_bytes()))?;
    if certs.is_empty() {
        return Err(anyhow!("no certificates found in PEM data").into());
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn parse_private_key(pem: &str) -> Result<PrivateKey, Error> {
    let mut keys = Vec::new();
    for item in rustls_pemfile::read_all(&mut Cursor::new(pem.as_bytes()))? {
        match item {
            rustls_pemfile::Item::RSAKey(key)
            | rustls_pemfile::Item::PKCS8Key(key)
            | rustls_pemfile::Item::ECKey(key) => keys.push(PrivateKey(key)),
            _ => {}
        }
    }
    match keys.len() {
        0 => Err(anyhow!("no private key found in PEM data").into()),
        1 => Ok(keys.remove(0)),
        n => Err(anyhow!("expected one private key in PEM data, found {n}").into()),
    }
}

fn protocol_versions(min: TlsVersion) -> &'static [&'static rustls::SupportedProtocolVersion] {
    static TLS1_3_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];
    match min {
        TlsVersion::GoodDefault | TlsVersion::Tls1Dot2 => rustls::ALL_VERSIONS,
        TlsVersion::Ssl3 | TlsVersion::Tls1Dot0 | TlsVersion::Tls1Dot1 => {
            warn!("rustls does not support TLS below 1.2; raising the configured minimum version");
            rustls::ALL_VERSIONS
        }
        TlsVersion::Tls1Dot3 => TLS1_3_ONLY,
    }
}

/// Resolves a colon-separated cipher list against the suites rustls knows,
/// or returns the defaults when none was configured.
fn cipher_suites(list: Option<&str>) -> Result<Vec<SupportedCipherSuite>, Error> {
    let Some(list) = list else {
        return Ok(rustls::DEFAULT_CIPHER_SUITES.to_vec());
    };

    let mut suites = Vec::new();
    for name in list.split(':').filter(|name| !name.is_empty()) {
        let found = rustls::ALL_CIPHER_SUITES
            .iter()
            .find(|suite| format!("{:?}", suite.suite()).eq_ignore_ascii_case(name));
        match found {
            Some(suite) => suites.push(*suite),
            None => return Err(anyhow!("unknown cipher suite '{name}'").into()),
        }
    }
    if suites.is_empty() {
        return Err(anyhow!("cipher list selects no cipher suites").into());
    }
    Ok(suites)
}
