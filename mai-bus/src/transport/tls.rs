// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! TLS acceptor construction for the service endpoint.

use std::path::Path;
use std::sync::Arc;

use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;
use tracing::info;

use super::TransportError;
use crate::config::TlsConfig;

/// Builds an acceptor from PEM files, or `None` when TLS is disabled.
///
/// With `verify` set, clients must present a certificate signed by `ca`.
pub fn build_acceptor(config: &TlsConfig) -> Result<Option<TlsAcceptor>, TransportError> {
    if !config.enabled {
        return Ok(None);
    }

    let cert_path = config
        .cert
        .as_deref()
        .ok_or_else(|| TransportError::Tls("TLS enabled but no certificate configured".into()))?;
    let key_path = config
        .key
        .as_deref()
        .ok_or_else(|| TransportError::Tls("TLS enabled but no private key configured".into()))?;

    let certs = load_certs(cert_path)?;
    let key = PrivateKeyDer::from_pem_file(key_path).map_err(|e| {
        TransportError::Tls(format!("Failed to read key {}: {}", key_path.display(), e))
    })?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    let builder = if config.verify {
        let ca_path = config.ca.as_deref().ok_or_else(|| {
            TransportError::Tls("Client verification requires a CA bundle".into())
        })?;
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_path)? {
            roots
                .add(cert)
                .map_err(|e| TransportError::Tls(format!("Invalid CA certificate: {}", e)))?;
        }
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    };

    let server_config = builder
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(format!("Certificate rejected: {}", e)))?;

    info!(
        "TLS enabled (client verification: {})",
        if config.verify { "required" } else { "off" }
    );
    Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let read_error =
        |e: rustls_pki_types::pem::Error| TransportError::Tls(format!("Failed to read {}: {}", path.display(), e));
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(read_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(read_error)?;
    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}
