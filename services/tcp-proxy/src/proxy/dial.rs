//! Outbound connection to the upstream.
//!
//! The upstream address is resolved once at startup; dialing never resolves
//! again. With TLS unwrap enabled the proxy acts as a TLS client towards the
//! upstream so the local side can speak plaintext.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::ProxyError;

/// Any bidirectional byte stream a session can pipe.
pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexStream for T {}

/// An established outbound stream, plain or TLS.
pub type BoxedStream = Box<dyn DuplexStream>;

/// Opens outbound streams to the upstream.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Establish a new outbound stream.
    async fn dial(&self) -> Result<BoxedStream, ProxyError>;

    /// Resolved upstream address, for logging.
    fn remote_addr(&self) -> SocketAddr;
}

/// TLS client settings used when unwrapping the upstream.
#[derive(Clone)]
pub struct TlsUnwrap {
    connector: TlsConnector,
    server_name: ServerName<'static>,
    dial_target: String,
}

impl TlsUnwrap {
    /// Build TLS unwrap settings.
    ///
    /// `dial_target` is the upstream as configured (before resolution) and is
    /// only used for logging. Without a `config` the built-in web PKI roots
    /// are used for verification.
    pub fn new(
        dial_target: impl Into<String>,
        server_name: &str,
        config: Option<Arc<ClientConfig>>,
    ) -> Result<Self, ProxyError> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| ProxyError::InvalidServerName(server_name.to_string()))?;

        let config = match config {
            Some(config) => config,
            None => default_client_config()?,
        };

        Ok(Self {
            connector: TlsConnector::from(config),
            server_name,
            dial_target: dial_target.into(),
        })
    }

    #[cfg(test)]
    fn dial_target(&self) -> &str {
        &self.dial_target
    }
}

/// Client config trusting the web PKI roots.
pub fn default_client_config() -> Result<Arc<ClientConfig>, ProxyError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    client_config(roots)
}

/// Client config trusting only the certificates in a PEM bundle.
pub fn client_config_from_ca_file(path: &Path) -> Result<Arc<ClientConfig>, ProxyError> {
    let ca_error = |message: String| ProxyError::CaBundle {
        path: path.to_path_buf(),
        message,
    };

    let file = File::open(path).map_err(|e| ca_error(e.to_string()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ca_error(e.to_string()))?;

    if certs.is_empty() {
        return Err(ca_error("no certificates found".to_string()));
    }

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if added == 0 {
        return Err(ca_error(format!("{} certificates could not be parsed", ignored)));
    }

    client_config(roots)
}

fn client_config(roots: RootCertStore) -> Result<Arc<ClientConfig>, ProxyError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Dials the single upstream, optionally completing a TLS handshake.
#[derive(Clone)]
pub struct OutboundDialer {
    remote_addr: SocketAddr,
    tls: Option<TlsUnwrap>,
}

impl OutboundDialer {
    /// Plain TCP dialer.
    pub fn plain(remote_addr: SocketAddr) -> Self {
        Self {
            remote_addr,
            tls: None,
        }
    }

    /// Dialer that unwraps TLS from the upstream.
    pub fn with_tls(remote_addr: SocketAddr, tls: TlsUnwrap) -> Self {
        Self {
            remote_addr,
            tls: Some(tls),
        }
    }

    #[cfg(test)]
    pub(crate) fn is_tls(&self) -> bool {
        self.tls.is_some()
    }
}

#[async_trait]
impl Dialer for OutboundDialer {
    async fn dial(&self) -> Result<BoxedStream, ProxyError> {
        let stream = TcpStream::connect(self.remote_addr)
            .await
            .map_err(|source| ProxyError::Connect {
                addr: self.remote_addr,
                source,
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY on upstream stream");
        }

        let Some(tls) = &self.tls else {
            return Ok(Box::new(stream));
        };

        let tls_stream = tls
            .connector
            .connect(tls.server_name.clone(), stream)
            .await
            .map_err(|source| ProxyError::Handshake {
                target: tls.dial_target.clone(),
                source,
            })?;

        debug!(dial_target = %tls.dial_target, "TLS handshake with upstream complete");
        Ok(Box::new(tls_stream))
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_invalid_server_name_rejected() {
        let result = TlsUnwrap::new("example.test:443", "not a hostname!", None);
        assert!(matches!(result, Err(ProxyError::InvalidServerName(_))));
    }

    #[test]
    fn test_ip_server_name_accepted() {
        let tls = TlsUnwrap::new("127.0.0.1:443", "127.0.0.1", None).unwrap();
        assert_eq!(tls.dial_target(), "127.0.0.1:443");
    }

    #[test]
    fn test_missing_ca_file() {
        let result = client_config_from_ca_file(Path::new("/nonexistent/ca.pem"));
        assert!(matches!(result, Err(ProxyError::CaBundle { .. })));
    }

    #[test]
    fn test_ca_file_without_certificates() {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();
        file.write_all(key.serialize_pem().as_bytes()).unwrap();

        match client_config_from_ca_file(file.path()) {
            Err(ProxyError::CaBundle { path, message }) => {
                assert_eq!(path, file.path());
                assert_eq!(message, "no certificates found");
            }
            other => panic!("expected CA bundle error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_ca_file_with_certificate() {
        let cert = rcgen::generate_simple_self_signed(vec!["upstream.test".to_string()]).unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(cert.cert.pem().as_bytes()).unwrap();

        assert!(client_config_from_ca_file(file.path()).is_ok());
    }

    #[tokio::test]
    async fn test_plain_dial() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"hi").await.unwrap();
        });

        let dialer = OutboundDialer::plain(addr);
        assert!(!dialer.is_tls());

        let mut stream = dialer.dial().await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = OutboundDialer::plain(addr).dial().await.err().unwrap();
        assert!(err.is_dial_failure());
        assert!(matches!(err, ProxyError::Connect { .. }));
    }
}
