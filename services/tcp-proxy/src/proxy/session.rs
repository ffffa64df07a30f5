//! Proxy session lifecycle.
//!
//! A session owns one accepted inbound stream. It dials the upstream, runs
//! one [`Pipe`] task per direction and tears everything down when the first
//! pipe fails.
//!
//! ```text
//! Dialing --dial error--> Closed (inbound gauge released, no pipes)
//!    |
//!    v
//! Piping --first pipe failure--> Closing --> Closed
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tracing::{debug, info, warn, Instrument};

use super::dial::Dialer;
use super::pipe::{Direction, Pipe, PipeError};
use super::trace::TraceFormat;
use crate::metrics::MetricsRecorder;

/// The pipe failure that ended a session.
#[derive(Debug)]
pub struct PipeFailure {
    pub direction: Direction,
    pub error: PipeError,
}

/// Single-shot teardown signal shared by both pipes of a session.
///
/// Only the first [`report`](Teardown::report) is recorded and wakes the
/// session; later reports are dropped.
#[derive(Debug, Default)]
pub struct Teardown {
    first: OnceLock<PipeFailure>,
    notify: Notify,
}

impl Teardown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report a pipe failure. Returns true if this call fired the teardown.
    pub fn report(&self, direction: Direction, error: PipeError) -> bool {
        let fired = self.first.set(PipeFailure { direction, error }).is_ok();
        if fired {
            // Stores a permit if the session is not waiting yet.
            self.notify.notify_one();
        } else {
            debug!(direction = %direction, "Teardown already in progress");
        }
        fired
    }

    #[cfg(test)]
    fn has_fired(&self) -> bool {
        self.first.get().is_some()
    }

    /// Wait for the first reported failure.
    pub async fn wait(&self) -> &PipeFailure {
        loop {
            if let Some(failure) = self.first.get() {
                return failure;
            }
            self.notify.notified().await;
        }
    }
}

/// Terminal state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The upstream could not be dialed; no pipes were started.
    DialFailed,
    /// Piping ended because one direction stopped.
    Closed {
        /// Direction whose pipe failed first.
        closed_by: Direction,
        /// Whether that failure was a clean EOF.
        eof: bool,
    },
}

/// Final accounting for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub outcome: SessionOutcome,
    /// Bytes written to the upstream.
    pub sent_bytes: u64,
    /// Bytes written back to the client.
    pub received_bytes: u64,
}

/// One proxied connection.
pub struct ProxySession<S> {
    inbound: S,
    peer_addr: SocketAddr,
    dialer: Arc<dyn Dialer>,
    format: TraceFormat,
    metrics: Arc<dyn MetricsRecorder>,
}

impl<S> ProxySession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Create a session for an accepted stream.
    ///
    /// The acceptor has already counted the inbound connection; the session
    /// owns releasing that count.
    pub fn new(
        inbound: S,
        peer_addr: SocketAddr,
        dialer: Arc<dyn Dialer>,
        format: TraceFormat,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        Self {
            inbound,
            peer_addr,
            dialer,
            format,
            metrics,
        }
    }

    /// Drive the session to completion.
    pub async fn run(self) -> SessionSummary {
        let Self {
            inbound,
            peer_addr,
            dialer,
            format,
            metrics,
        } = self;

        let outbound = match dialer.dial().await {
            Ok(stream) => stream,
            Err(e) => {
                metrics.decrement_active_inbound();
                warn!(
                    peer_addr = %peer_addr,
                    remote_addr = %dialer.remote_addr(),
                    error = %e,
                    "Failed to dial upstream"
                );
                return SessionSummary {
                    outcome: SessionOutcome::DialFailed,
                    sent_bytes: 0,
                    received_bytes: 0,
                };
            }
        };

        metrics.increment_active_outbound();
        metrics.record_outbound_connection_opened();
        debug!(
            peer_addr = %peer_addr,
            remote_addr = %dialer.remote_addr(),
            "Connected to upstream"
        );

        let sent = Arc::new(AtomicU64::new(0));
        let received = Arc::new(AtomicU64::new(0));
        let teardown = Arc::new(Teardown::new());

        let (inbound_read, inbound_write) = tokio::io::split(inbound);
        let (outbound_read, outbound_write) = tokio::io::split(outbound);

        let upload = Pipe::new(
            inbound_read,
            outbound_write,
            Direction::Sent,
            format,
            Arc::clone(&sent),
        );
        let download = Pipe::new(
            outbound_read,
            inbound_write,
            Direction::Received,
            format,
            Arc::clone(&received),
        );

        let upload = tokio::spawn(upload.run(Arc::clone(&teardown)).in_current_span());
        let download = tokio::spawn(download.run(Arc::clone(&teardown)).in_current_span());

        let failure = teardown.wait().await;

        // Each pipe task owns one half of each stream. Once both tasks are
        // gone every half has been dropped, which closes both streams.
        upload.abort();
        download.abort();
        let _ = upload.await;
        let _ = download.await;

        let sent_bytes = sent.load(Ordering::Relaxed);
        let received_bytes = received.load(Ordering::Relaxed);

        if failure.error.is_eof() {
            debug!(direction = %failure.direction, "Peer closed connection");
        } else {
            debug!(
                direction = %failure.direction,
                error = %failure.error,
                "Pipe failed"
            );
        }

        metrics.add_inbound_bytes(sent_bytes);
        metrics.add_outbound_bytes(received_bytes);
        metrics.decrement_active_inbound();
        metrics.decrement_active_outbound();

        info!(
            peer_addr = %peer_addr,
            sent_bytes,
            received_bytes,
            "Connection closed"
        );

        SessionSummary {
            outcome: SessionOutcome::Closed {
                closed_by: failure.direction,
                eof: failure.error.is_eof(),
            },
            sent_bytes,
            received_bytes,
        }
    }
}
