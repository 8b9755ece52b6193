//! TLS configuration for secure listeners.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig, SupportedProtocolVersion};
use serde::{Deserialize, Serialize};
use tokio_rustls::TlsAcceptor;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

/// Certificate material and policy for a secure listener. Snapshotted at
/// start time; later edits do not affect the live run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsSettings {
    /// PEM certificate chain, leaf first.
    pub certificate: Option<PathBuf>,
    /// PEM private key (PKCS#8, RSA or SEC1).
    pub private_key: Option<PathBuf>,
    /// Root certificates for validating client certificates.
    pub client_ca: Option<PathBuf>,
    pub client_cert_required: bool,
    /// Accepted protocol versions; empty means the rustls defaults.
    pub protocols: Vec<TlsVersion>,
}

impl TlsSettings {
    pub fn has_certificate(&self) -> bool {
        self.certificate.is_some() && self.private_key.is_some()
    }

    pub(crate) fn build_acceptor(&self) -> Result<TlsAcceptor> {
        let cert_path = self
            .certificate
            .as_ref()
            .ok_or_else(|| Error::config("TLS certificate is not configured"))?;
        let key_path = self
            .private_key
            .as_ref()
            .ok_or_else(|| Error::config("TLS private key is not configured"))?;
        let certs = load_certs(cert_path)?;
        let key = load_key(key_path)?;

        let versions: Vec<&'static SupportedProtocolVersion> = if self.protocols.is_empty() {
            rustls::DEFAULT_VERSIONS.to_vec()
        } else {
            self.protocols
                .iter()
                .map(|v| match v {
                    TlsVersion::Tls12 => &rustls::version::TLS12,
                    TlsVersion::Tls13 => &rustls::version::TLS13,
                })
                .collect()
        };

        let builder = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_protocol_versions(&versions)
        .map_err(|e| Error::config(format!("unsupported TLS protocol set: {}", e)))?;

        let config = if self.client_cert_required {
            let ca_path = self.client_ca.as_ref().ok_or_else(|| {
                Error::config("client certificates required but no client CA configured")
            })?;
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca_path)? {
                roots
                    .add(cert)
                    .map_err(|e| Error::config(format!("bad client CA certificate: {}", e)))?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| Error::config(format!("client verifier: {}", e)))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
        } else {
            builder.with_no_client_auth().with_single_cert(certs, key)
        }
        .map_err(|e| Error::config(format!("invalid TLS certificate: {}", e)))?;

        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::config(format!("cannot open {}: {}", path.display(), e)))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::io::Result<_>>()
        .map_err(|e| Error::config(format!("cannot parse {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(Error::config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| Error::config(format!("cannot open {}: {}", path.display(), e)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| Error::config(format!("cannot parse {}: {}", path.display(), e)))?
        .ok_or_else(|| Error::config(format!("no private key found in {}", path.display())))
}
