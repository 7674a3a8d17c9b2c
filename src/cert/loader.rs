use std::fs;
use std::path::Path;

use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tracing::info;

use crate::error::{Error, Result};

/// Load the relay's certificate chain and private key from PEM files.
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig> {
    let cert_pem = fs::read_to_string(cert_path).map_err(|e| {
        Error::CertParse(format!("failed to read certificate '{}': {e}", cert_path.display()))
    })?;
    let key_pem = fs::read_to_string(key_path).map_err(|e| {
        Error::CertParse(format!("failed to read private key '{}': {e}", key_path.display()))
    })?;

    build_server_config(&cert_pem, &key_pem)
}

/// Parse PEM certificate chain and private key, then build a rustls ServerConfig.
pub fn build_server_config(cert_pem: &str, key_pem: &str) -> Result<ServerConfig> {
    let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::CertParse(format!("failed to parse certificate PEM: {e}")))?;

    if certs.is_empty() {
        return Err(Error::CertParse("no certificates found in PEM".into()));
    }

    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(|e| Error::CertParse(format!("failed to parse private key PEM: {e}")))?
        .ok_or_else(|| Error::CertParse("no private key found in PEM".into()))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(format!("failed to build TLS server config: {e}")))?;

    Ok(config)
}

/// Build the client config used to dial the backend.
///
/// Verification uses the bundled Mozilla roots; `extra_ca` adds anchors on top
/// of them for backends signed by a private CA.
pub fn load_client_config(extra_ca: Option<&Path>) -> Result<ClientConfig> {
    let extra_pem = match extra_ca {
        Some(path) => Some(fs::read_to_string(path).map_err(|e| {
            Error::CertParse(format!("failed to read backend CA '{}': {e}", path.display()))
        })?),
        None => None,
    };

    let roots = root_store(extra_pem.as_deref())?;
    Ok(build_client_config(roots))
}

pub fn root_store(extra_ca_pem: Option<&str>) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(pem) = extra_ca_pem {
        let certs = rustls_pemfile::certs(&mut pem.as_bytes())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::CertParse(format!("failed to parse backend CA PEM: {e}")))?;

        if certs.is_empty() {
            return Err(Error::CertParse("no certificates found in backend CA PEM".into()));
        }

        let count = certs.len();
        for cert in certs {
            roots
                .add(cert)
                .map_err(|e| Error::CertParse(format!("invalid backend CA certificate: {e}")))?;
        }
        info!(count, "added backend trust anchors");
    }

    Ok(roots)
}

pub fn build_client_config(roots: RootCertStore) -> ClientConfig {
    ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}
