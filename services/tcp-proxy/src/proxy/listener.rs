//! TCP listener and accept loop.
//!
//! Accepts inbound connections and hands each one to a [`ProxySession`]
//! running in its own task. Accept errors are logged and never stop the loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn, Instrument};

use super::dial::Dialer;
use super::session::ProxySession;
use super::trace::TraceFormat;
use crate::error::ProxyError;
use crate::metrics::MetricsRecorder;

/// Pause after a failed accept so persistent errors do not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections. `None` means unbounded.
    pub max_connections: Option<usize>,
    /// Format of per-chunk debug traces.
    pub trace_format: TraceFormat,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: None,
            trace_format: TraceFormat::Raw,
        }
    }
}

/// The proxy's accepting socket.
pub struct Listener {
    config: ListenerConfig,
    listener: TcpListener,
    dialer: Arc<dyn Dialer>,
    metrics: Arc<dyn MetricsRecorder>,
    /// Limits concurrent sessions when a maximum is configured.
    conn_semaphore: Option<Arc<Semaphore>>,
}

impl Listener {
    /// Bind the listening socket.
    pub async fn bind(
        config: ListenerConfig,
        dialer: Arc<dyn Dialer>,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: config.bind_addr,
                source,
            })?;

        info!(
            bind_addr = %config.bind_addr,
            remote_addr = %dialer.remote_addr(),
            max_connections = ?config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: config
                .max_connections
                .map(|max| Arc::new(Semaphore::new(max))),
            listener,
            config,
            dialer,
            metrics,
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            };

            let permit = match &self.conn_semaphore {
                Some(semaphore) => match Arc::clone(semaphore).try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                        continue;
                    }
                },
                None => None,
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer_addr = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
            }

            self.metrics.increment_active_inbound();
            self.metrics.record_inbound_connection_opened();

            let session = ProxySession::new(
                stream,
                peer_addr,
                Arc::clone(&self.dialer),
                self.config.trace_format,
                Arc::clone(&self.metrics),
            );

            tokio::spawn(
                async move {
                    debug!("Accepted connection");
                    session.run().await;
                    drop(permit);
                }
                .instrument(tracing::info_span!("connection", peer = %peer_addr)),
            );
        }
    }
}
