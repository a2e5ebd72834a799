//! Support for TLS-wrapped connections.

use std::{fmt, io, net::TcpStream, sync::Arc};

use rustls::{pki_types::ServerName, ClientConfig, ClientConnection, RootCertStore, StreamOwned};

use crate::error::{Error, ErrorKind, Result};

/// Configuration required to use TLS. The pool does not construct TLS policy itself; it
/// receives a ready-to-use [`rustls::ClientConfig`]. Creating the underlying config is
/// expensive, so a `TlsConfig` is cheap to clone and should be shared between pools.
#[derive(Clone)]
pub struct TlsConfig {
    config: Arc<ClientConfig>,
}

impl TlsConfig {
    /// Create a new `TlsConfig` from a prepared [`rustls::ClientConfig`].
    pub fn new(config: impl Into<Arc<ClientConfig>>) -> Self {
        Self {
            config: config.into(),
        }
    }

    /// Create a `TlsConfig` trusting the `webpki-roots` certificate store, with no client
    /// authentication.
    pub fn with_webpki_roots() -> Self {
        let store = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = ClientConfig::builder()
            .with_root_certificates(store)
            .with_no_client_auth();

        Self::new(config)
    }
}

impl From<Arc<ClientConfig>> for TlsConfig {
    fn from(config: Arc<ClientConfig>) -> Self {
        Self::new(config)
    }
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("TlsConfig").finish_non_exhaustive()
    }
}

/// Performs a TLS handshake over `tcp_stream`, verifying the peer against `host` (the
/// pre-resolution hostname) when the config mandates verification.
pub(crate) fn wrap_stream(
    host: &str,
    tcp_stream: TcpStream,
    cfg: &TlsConfig,
) -> Result<StreamOwned<ClientConnection, TcpStream>> {
    let name = ServerName::try_from(host.to_string()).map_err(|e| ErrorKind::DnsResolve {
        message: format!("could not resolve {:?}: {}", host, e),
    })?;

    let session =
        ClientConnection::new(cfg.config.clone(), name).map_err(|e| tls_error(host, &e))?;
    let mut stream = StreamOwned::new(session, tcp_stream);

    // StreamOwned completes the handshake lazily; drive it to completion here so handshake
    // and certificate failures surface at connect time rather than on the first frame.
    while stream.conn.is_handshaking() {
        if let Err(err) = stream.conn.complete_io(&mut stream.sock) {
            return Err(handshake_error(host, err));
        }
    }

    Ok(stream)
}

fn handshake_error(host: &str, err: io::Error) -> Error {
    if let Some(tls_err) = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
    {
        return tls_error(host, tls_err);
    }
    Error::connection_failure(format!(
        "SSL handshake failed. The server may not be configured for TLS: {}",
        err
    ))
    .with_source(Error::from(ErrorKind::from(err)))
}

fn tls_error(host: &str, err: &rustls::Error) -> Error {
    match err {
        rustls::Error::InvalidCertificate(reason) => ErrorKind::Certificate {
            message: format!("{:?} for hostname {:?}", reason, host),
        }
        .into(),
        other => Error::connection_failure(format!(
            "SSL handshake failed. The server may not be configured for TLS: {}",
            other
        )),
    }
}
