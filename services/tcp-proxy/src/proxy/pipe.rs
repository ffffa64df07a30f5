//! Unidirectional byte pipe between two streams.
//!
//! A pipe copies chunks from its source to its destination until the first
//! read or write failure, clean EOF included. It never closes either stream;
//! it reports the failure to the owning session's [`Teardown`] and exits.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use super::session::Teardown;
use super::trace::TraceFormat;

/// Size of the single chunk buffer each pipe reads into.
pub const PIPE_BUFFER_SIZE: usize = 64 * 1024;

/// Which way a pipe forwards bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Inbound (client) to outbound (upstream).
    Sent,
    /// Outbound (upstream) to inbound (client).
    Received,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Sent => "sent",
            Direction::Received => "received",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a pipe stopped.
#[derive(Debug, Error)]
pub enum PipeError {
    /// The source reached end of stream.
    #[error("end of stream")]
    Eof,

    #[error("read failed: {0}")]
    Read(#[source] io::Error),

    #[error("write failed: {0}")]
    Write(#[source] io::Error),
}

impl PipeError {
    /// Clean EOF is the normal way for a connection to end.
    pub fn is_eof(&self) -> bool {
        matches!(self, PipeError::Eof)
    }
}

/// One direction of a proxied connection.
pub struct Pipe<R, W> {
    source: R,
    destination: W,
    direction: Direction,
    format: TraceFormat,
    counter: Arc<AtomicU64>,
}

impl<R, W> Pipe<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Create a pipe. `counter` must only be written by this pipe.
    pub fn new(
        source: R,
        destination: W,
        direction: Direction,
        format: TraceFormat,
        counter: Arc<AtomicU64>,
    ) -> Self {
        Self {
            source,
            destination,
            direction,
            format,
            counter,
        }
    }

    /// Copy until failure, then report it to `teardown`.
    pub async fn run(mut self, teardown: Arc<Teardown>) {
        let error = self.copy().await;
        teardown.report(self.direction, error);
    }

    /// Copy until failure and return the cause.
    pub(crate) async fn copy(&mut self) -> PipeError {
        let mut buf = vec![0u8; PIPE_BUFFER_SIZE];

        loop {
            let n = match self.source.read(&mut buf).await {
                Ok(0) => return PipeError::Eof,
                Ok(n) => n,
                Err(e) => return PipeError::Read(e),
            };
            let chunk = &buf[..n];

            trace!(
                direction = %self.direction,
                bytes = n,
                data = %self.format.render(chunk),
                "Forwarding chunk"
            );

            if let Err(e) = self.destination.write_all(chunk).await {
                return PipeError::Write(e);
            }
            // TLS writers buffer records until flushed.
            if let Err(e) = self.destination.flush().await {
                return PipeError::Write(e);
            }

            self.counter.fetch_add(n as u64, Ordering::Relaxed);
        }
    }
}
