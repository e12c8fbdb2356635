use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use rustls::ServerConfig;
use rustls_pemfile::certs;
use tokio_rustls::TlsAcceptor;

use crate::config::TlsPaths;
use crate::logger::log;

/// Build an acceptor from the configured PEM files, or None when TLS is
/// disabled.
pub fn get_tls_acceptor(paths: Option<&TlsPaths>) -> Result<Option<TlsAcceptor>> {
    match paths {
        Some(paths) => {
            log::info!(cert = %paths.cert.display(), key = %paths.key.display(), "Loading TLS certificates");
            let config = load_tls_config(paths)?;
            Ok(Some(TlsAcceptor::from(Arc::new(config))))
        }
        None => Ok(None),
    }
}

fn load_tls_config(paths: &TlsPaths) -> Result<ServerConfig> {
    let cert_file = File::open(&paths.cert)?;
    let mut reader = BufReader::new(cert_file);
    let certs = certs(&mut reader).collect::<Result<Vec<_>, _>>()?;

    if certs.is_empty() {
        return Err(anyhow!("No certificates found in {}", paths.cert.display()));
    }

    let key_file = File::open(&paths.key)?;
    let mut reader = BufReader::new(key_file);
    let key = rustls_pemfile::private_key(&mut reader)?;
    let key = key.ok_or_else(|| anyhow!("No private key found in {}", paths.key.display()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(config)
}
