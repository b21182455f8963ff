//! The measurement-endpoint contract shared by every transport.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::accounting::{Meter, TransferStats};
use crate::observe::{ConnInfo, MeasurementEvent, TransferLogger};
use crate::split::ByteRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Download,
    Upload,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Download => "download",
            Self::Upload => "upload",
        })
    }
}

/// Application protocol a transfer runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Protocol {
    Http1,
    Http2,
    WebSocket,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Http1 => "HTTP/1.1",
            Self::Http2 => "HTTP/2.0",
            Self::WebSocket => "ndt7",
        })
    }
}

/// How much a transfer is asked to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Extent {
    /// Exact byte count (HTTP endpoints).
    Bytes(u64),
    /// Fixed measurement window (ndt7); message sizes adapt inside it.
    Window(Duration),
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(n) => write!(f, "size={}", n),
            Self::Window(d) => write!(f, "window={:.3}s", d.as_secs_f64()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransferRequest {
    pub extent: Extent,
    pub direction: Direction,
    pub protocol: Protocol,
}

/// Result of one completed or aborted transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub request: TransferRequest,
    /// Partition of the parent transfer, when the request carried a range.
    pub range: Option<ByteRange>,
    pub conn: ConnInfo,
    pub stats: TransferStats,
}

impl TransferOutcome {
    /// Byte count the transfer had to reach, if it was size-bound.
    pub fn expected(&self) -> Option<u64> {
        match (self.range, self.request.extent) {
            (Some(range), _) => Some(range.len),
            (None, Extent::Bytes(n)) => Some(n),
            (None, Extent::Window(_)) => None,
        }
    }

    /// False for a size-bound transfer that moved fewer bytes than asked.
    pub fn is_complete(&self) -> bool {
        self.expected().is_none_or(|n| self.stats.bytes == n)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SizeError {
    #[error("missing transfer size")]
    Empty,
    #[error("invalid transfer size {0:?}")]
    Invalid(String),
    #[error("transfer size {size} exceeds limit {limit}")]
    TooLarge { size: u64, limit: u64 },
}

/// Parse a transfer size: a non-negative decimal integer, nothing else.
pub fn parse_size(raw: &str) -> Result<u64, SizeError> {
    if raw.is_empty() {
        return Err(SizeError::Empty);
    }
    if !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SizeError::Invalid(raw.to_string()));
    }
    raw.parse().map_err(|_| SizeError::Invalid(raw.to_string()))
}

/// Behaviour common to the HTTP and ndt7 endpoints.
///
/// Variants provide the transport plumbing; the default methods keep size
/// validation, the `request received` / `request done` events and the
/// accounting identical everywhere.
pub trait MeasurementEndpoint: Send + Sync {
    fn logger(&self) -> &Arc<dyn TransferLogger>;

    /// Largest transfer this endpoint accepts, if limited.
    fn size_limit(&self) -> Option<u64> {
        None
    }

    fn validate_size(&self, raw: &str) -> Result<u64, SizeError> {
        let size = parse_size(raw)?;
        match self.size_limit() {
            Some(limit) if size > limit => Err(SizeError::TooLarge { size, limit }),
            _ => Ok(size),
        }
    }

    /// Log `request received` and return the meter whose close logs
    /// `request done` with the bytes that actually moved.
    fn begin(&self, request: TransferRequest, conn: &ConnInfo, range: Option<ByteRange>) -> Meter {
        let logger = self.logger().clone();
        logger.log(MeasurementEvent::RequestReceived {
            request,
            range,
            conn: conn.clone(),
        });
        let conn = conn.clone();
        Meter::on_close(move |stats| {
            logger.log(MeasurementEvent::RequestDone(TransferOutcome {
                request,
                range,
                conn,
                stats,
            }));
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observe::MemoryLogger;

    struct Plain {
        logger: Arc<dyn TransferLogger>,
        limit: Option<u64>,
    }

    impl MeasurementEndpoint for Plain {
        fn logger(&self) -> &Arc<dyn TransferLogger> {
            &self.logger
        }

        fn size_limit(&self) -> Option<u64> {
            self.limit
        }
    }

    #[test]
    fn parse_size_accepts_only_digits() {
        assert_eq!(parse_size("0"), Ok(0));
        assert_eq!(parse_size("1048576"), Ok(1_048_576));
        assert_eq!(parse_size("18446744073709551615"), Ok(u64::MAX));
        assert_eq!(parse_size(""), Err(SizeError::Empty));
        for bad in ["-1", "+5", "abc", "1e6", " 1", "18446744073709551616"] {
            assert_eq!(parse_size(bad), Err(SizeError::Invalid(bad.to_string())));
        }
    }

    #[test]
    fn limit_is_enforced() {
        let ep = Plain {
            logger: Arc::new(MemoryLogger::default()),
            limit: Some(100),
        };
        assert_eq!(ep.validate_size("100"), Ok(100));
        assert_eq!(
            ep.validate_size("101"),
            Err(SizeError::TooLarge { size: 101, limit: 100 })
        );
    }

    #[test]
    fn begin_logs_received_then_done_with_real_count() {
        let logger = Arc::new(MemoryLogger::default());
        let ep = Plain {
            logger: logger.clone(),
            limit: None,
        };
        let request = TransferRequest {
            extent: Extent::Bytes(1000),
            direction: Direction::Upload,
            protocol: Protocol::Http2,
        };
        let mut meter = ep.begin(request, &ConnInfo::test(), None);
        assert_eq!(logger.events().len(), 1);
        assert!(logger.completions().is_empty());

        meter.add(400);
        drop(meter);

        let done = logger.completions();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].stats.bytes, 400);
        assert_eq!(done[0].expected(), Some(1000));
        assert!(!done[0].is_complete());
    }

    #[test]
    fn ranged_outcome_expects_range_length() {
        let outcome = TransferOutcome {
            request: TransferRequest {
                extent: Extent::Bytes(4096),
                direction: Direction::Download,
                protocol: Protocol::Http2,
            },
            range: Some(ByteRange { start: 1024, len: 1024 }),
            conn: ConnInfo::test(),
            stats: TransferStats {
                bytes: 1024,
                elapsed: Duration::from_millis(3),
            },
        };
        assert!(outcome.is_complete());

        let windowed = TransferOutcome {
            request: TransferRequest {
                extent: Extent::Window(Duration::from_secs(10)),
                ..outcome.request
            },
            range: None,
            ..outcome
        };
        assert_eq!(windowed.expected(), None);
        assert!(windowed.is_complete());
    }
}
