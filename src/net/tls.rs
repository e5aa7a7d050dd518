//! rustls client configuration for `mqtts` and `wss` transports.

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::core::config::{TlsOptions, TransportConfig};

/// Client config trusting the webpki roots plus any configured CA bundle.
pub(crate) fn client_config(opts: Option<&TlsOptions>) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if let Some(path) = opts.and_then(|o| o.ca_file.as_ref()) {
        let pem = fs::read(path)
            .with_context(|| format!("reading CA bundle {}", path.display()))?;
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            let cert = cert.context("parsing CA certificate")?;
            roots.add(cert).context("adding CA certificate")?;
        }
    }
    Ok(Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    ))
}

pub(crate) async fn connect(
    cfg: &TransportConfig,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let tcp = TcpStream::connect((cfg.host.as_str(), cfg.port()))
        .await
        .with_context(|| format!("connecting to {}:{}", cfg.host, cfg.port()))?;
    let config = client_config(cfg.tls.as_ref())?;
    let name = cfg
        .tls
        .as_ref()
        .and_then(|o| o.server_name.clone())
        .unwrap_or_else(|| cfg.host.clone());
    let server_name = ServerName::try_from(name).context("invalid TLS server name")?;
    TlsConnector::from(config)
        .connect(server_name, tcp)
        .await
        .context("TLS handshake failed")
}
