//! Connection and byte metrics.
//!
//! Sessions report their activity through the [`MetricsRecorder`] trait so
//! the engine never touches process-global state. The production recorder
//! is [`ProxyMetrics`], which keeps six Prometheus series labelled with a
//! per-process instance id and is served by [`MetricsServer`].

mod prom;
mod server;

pub use prom::{MetricsSnapshot, ProxyMetrics};
pub use server::MetricsServer;

/// Sink for connection and byte accounting.
///
/// All methods are fire-and-forget and must be safe to call concurrently
/// from any number of sessions.
pub trait MetricsRecorder: Send + Sync {
    /// An inbound connection was accepted.
    fn record_inbound_connection_opened(&self);

    /// An outbound connection to the upstream was established.
    fn record_outbound_connection_opened(&self);

    /// Bytes that arrived on inbound connections.
    fn add_inbound_bytes(&self, n: u64);

    /// Bytes that arrived on outbound connections.
    fn add_outbound_bytes(&self, n: u64);

    fn increment_active_inbound(&self);

    fn decrement_active_inbound(&self);

    fn increment_active_outbound(&self);

    fn decrement_active_outbound(&self);
}

/// Recorder that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {
    fn record_inbound_connection_opened(&self) {}
    fn record_outbound_connection_opened(&self) {}
    fn add_inbound_bytes(&self, _n: u64) {}
    fn add_outbound_bytes(&self, _n: u64) {}
    fn increment_active_inbound(&self) {}
    fn decrement_active_inbound(&self) {}
    fn increment_active_outbound(&self) {}
    fn decrement_active_outbound(&self) {}
}
