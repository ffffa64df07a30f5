//! Error types for the proxy engine.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while setting up the proxy or dialing the upstream.
///
/// Per-connection failures are reported through these values but never
/// escape a session; only setup errors reach the caller of `main`.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Address could not be resolved to any socket address.
    #[error("failed to resolve address '{addr}': {source}")]
    Resolve {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Listening socket could not be opened.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Plain TCP dial to the upstream failed.
    #[error("failed to connect to upstream {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// TLS handshake with the upstream failed.
    #[error("TLS handshake with {target} failed: {source}")]
    Handshake {
        target: String,
        #[source]
        source: io::Error,
    },

    /// The configured TLS server name is not a valid DNS name or IP.
    #[error("invalid TLS server name '{0}'")]
    InvalidServerName(String),

    /// CA bundle could not be read or parsed.
    #[error("failed to load CA certificates from {path}: {message}")]
    CaBundle { path: PathBuf, message: String },

    /// rustls rejected the client configuration.
    #[error("TLS configuration error: {0}")]
    TlsConfig(#[from] rustls::Error),
}

impl ProxyError {
    /// Returns true if this error happened while dialing the upstream.
    pub fn is_dial_failure(&self) -> bool {
        matches!(
            self,
            ProxyError::Connect { .. } | ProxyError::Handshake { .. }
        )
    }
}
