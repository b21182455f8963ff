//! Connection and transfer observability.
//!
//! Endpoints and the accept loop report through an injected
//! [`TransferLogger`]; nothing here touches global state. Production uses
//! [`TracingLogger`], tests use [`MemoryLogger`] to assert on what was
//! recorded.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use crate::endpoint::{Direction, TransferOutcome, TransferRequest};
use crate::split::ByteRange;

/// Identity of one accepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnInfo {
    /// Process-unique id used to correlate transfers with their connection.
    pub id: u64,
    pub remote: SocketAddr,
    pub local: SocketAddr,
    /// Negotiated ALPN protocol, `"none"` when the client sent none.
    pub alpn: String,
}

impl ConnInfo {
    pub fn new(id: u64, remote: SocketAddr, local: SocketAddr, alpn: Option<&[u8]>) -> Self {
        let alpn = alpn
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .unwrap_or_else(|| "none".to_string());
        Self {
            id,
            remote,
            local,
            alpn,
        }
    }

    #[cfg(test)]
    pub(crate) fn test() -> Self {
        Self::new(
            1,
            "127.0.0.1:50000".parse().unwrap(),
            "127.0.0.1:4443".parse().unwrap(),
            Some(b"h2"),
        )
    }
}

/// Everything the servers record.
#[derive(Debug, Clone, PartialEq)]
pub enum MeasurementEvent {
    /// TLS handshake finished on a new connection.
    ConnNew(ConnInfo),
    /// Connection torn down (by either side or by shutdown).
    ConnClosed { conn: ConnInfo, lifetime: Duration },
    /// Connection ended with a transport error.
    ConnError { conn: ConnInfo, message: String },
    /// Handshake failed; no `ConnInfo` exists yet.
    HandshakeFailed { remote: SocketAddr, message: String },
    RequestReceived {
        request: TransferRequest,
        range: Option<ByteRange>,
        conn: ConnInfo,
    },
    RequestDone(TransferOutcome),
    /// Periodic server-side sample during an ndt7 session.
    Ndt7Sample {
        conn: ConnInfo,
        test: Direction,
        bytes: u64,
        elapsed: Duration,
        message_size: usize,
    },
}

impl fmt::Display for MeasurementEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnNew(conn) => {
                write!(f, "conn new conn={} remote={} alpn={}", conn.id, conn.remote, conn.alpn)
            }
            Self::ConnClosed { conn, lifetime } => write!(
                f,
                "conn closed conn={} remote={} lifetime={:.3}s",
                conn.id,
                conn.remote,
                lifetime.as_secs_f64()
            ),
            Self::ConnError { conn, message } => {
                write!(f, "conn error conn={} remote={}: {}", conn.id, conn.remote, message)
            }
            Self::HandshakeFailed { remote, message } => {
                write!(f, "tls handshake failed remote={}: {}", remote, message)
            }
            Self::RequestReceived { request, range, conn } => {
                write!(
                    f,
                    "{} received {} proto={} alpn={} remote={} conn={}",
                    request.direction, request.extent, request.protocol, conn.alpn, conn.remote, conn.id
                )?;
                if let Some(range) = range {
                    write!(f, " range={}", range)?;
                }
                Ok(())
            }
            Self::RequestDone(outcome) => {
                write!(
                    f,
                    "{} done bytes={} elapsed={:.3}s remote={} conn={}",
                    outcome.request.direction,
                    outcome.stats.bytes,
                    outcome.stats.elapsed.as_secs_f64(),
                    outcome.conn.remote,
                    outcome.conn.id
                )?;
                if let Some(range) = outcome.range {
                    write!(f, " range={}", range)?;
                }
                Ok(())
            }
            Self::Ndt7Sample {
                conn,
                test,
                bytes,
                elapsed,
                message_size,
            } => write!(
                f,
                "ndt7 {} sample bytes={} elapsed={:.3}s message_size={} conn={}",
                test,
                bytes,
                elapsed.as_secs_f64(),
                message_size,
                conn.id
            ),
        }
    }
}

/// Sink for measurement events. Implementations can write to `tracing`,
/// collect in memory, or discard.
pub trait TransferLogger: Send + Sync {
    fn log(&self, event: MeasurementEvent);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, event: MeasurementEvent) {
        match &event {
            MeasurementEvent::ConnNew(conn) => {
                tracing::info!(conn = conn.id, remote = %conn.remote, alpn = %conn.alpn, "{}", event);
            }
            MeasurementEvent::ConnClosed { conn, lifetime } => {
                tracing::info!(
                    conn = conn.id,
                    remote = %conn.remote,
                    lifetime_ms = lifetime.as_millis() as u64,
                    "{}",
                    event
                );
            }
            MeasurementEvent::ConnError { conn, .. } => {
                tracing::warn!(conn = conn.id, remote = %conn.remote, "{}", event);
            }
            MeasurementEvent::HandshakeFailed { remote, .. } => {
                tracing::warn!(remote = %remote, "{}", event);
            }
            MeasurementEvent::RequestReceived { request, conn, .. } => {
                tracing::info!(
                    conn = conn.id,
                    remote = %conn.remote,
                    alpn = %conn.alpn,
                    proto = %request.protocol,
                    "{}",
                    event
                );
            }
            MeasurementEvent::RequestDone(outcome) => {
                let expected = outcome.expected();
                if outcome.is_complete() {
                    tracing::info!(
                        conn = outcome.conn.id,
                        remote = %outcome.conn.remote,
                        bytes = outcome.stats.bytes,
                        elapsed_ms = outcome.stats.elapsed.as_millis() as u64,
                        "{}",
                        event
                    );
                } else {
                    tracing::warn!(
                        conn = outcome.conn.id,
                        remote = %outcome.conn.remote,
                        bytes = outcome.stats.bytes,
                        expected = ?expected,
                        elapsed_ms = outcome.stats.elapsed.as_millis() as u64,
                        "{} (short transfer)",
                        event
                    );
                }
            }
            MeasurementEvent::Ndt7Sample { conn, .. } => {
                tracing::debug!(conn = conn.id, "{}", event);
            }
        }
    }
}

/// Logger that keeps every event in memory, in arrival order.
#[derive(Default)]
pub struct MemoryLogger {
    events: Mutex<Vec<MeasurementEvent>>,
}

impl MemoryLogger {
    pub fn events(&self) -> Vec<MeasurementEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Outcomes of every finished transfer.
    pub fn completions(&self) -> Vec<TransferOutcome> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                MeasurementEvent::RequestDone(outcome) => Some(outcome),
                _ => None,
            })
            .collect()
    }
}

impl TransferLogger for MemoryLogger {
    fn log(&self, event: MeasurementEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
