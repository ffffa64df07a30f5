//! TCP proxy engine.
//!
//! This module provides:
//! - The accept loop ([`Listener`])
//! - Outbound dialing with optional TLS unwrap ([`OutboundDialer`])
//! - Per-connection sessions with single-shot teardown ([`ProxySession`])
//! - Unidirectional byte pipes with debug tracing ([`Pipe`])
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> ProxySession -> Dialer (TCP | TLS) -> Upstream
//!                            |
//!              Pipe (sent) + Pipe (received)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let dialer = Arc::new(OutboundDialer::plain("127.0.0.1:9100".parse()?));
//! let metrics = Arc::new(NoopMetrics);
//!
//! let config = ListenerConfig::new("127.0.0.1:9000".parse()?);
//! let listener = Listener::bind(config, dialer, metrics).await?;
//! Arc::new(listener).run().await?;
//! ```

mod dial;
mod listener;
mod pipe;
mod session;
mod trace;

pub use dial::{
    client_config_from_ca_file, default_client_config, BoxedStream, Dialer, DuplexStream,
    OutboundDialer, TlsUnwrap,
};
pub use listener::{Listener, ListenerConfig};
pub use pipe::{Direction, Pipe, PipeError, PIPE_BUFFER_SIZE};
pub use session::{PipeFailure, ProxySession, SessionOutcome, SessionSummary, Teardown};
pub use trace::{hex_dump, TraceFormat};
