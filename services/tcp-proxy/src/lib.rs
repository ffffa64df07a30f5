pub mod config;
pub mod error;
pub mod metrics;
pub mod proxy;

pub use error::ProxyError;
pub use metrics::{MetricsRecorder, MetricsServer, MetricsSnapshot, NoopMetrics, ProxyMetrics};
pub use proxy::{
    Dialer, Direction, Listener, ListenerConfig, OutboundDialer, ProxySession, SessionOutcome,
    SessionSummary, TlsUnwrap, TraceFormat,
};
