//! HTTP/2 stream-split policy.
//!
//! Large transfers are divided into contiguous byte ranges that a client
//! requests concurrently over one HTTP/2 connection. The automatic stream
//! count is a tunable heuristic: more parallelism for larger totals, capped
//! so that per-partition overhead never dominates. Every knob lives in
//! [`SplitPolicy`] and is exposed as configuration.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

/// Upper bound on streams per transfer.
pub const MAX_STREAMS: u32 = 16;

/// Transfers at or below this size are never split (256 MiB).
pub const DEFAULT_SPLIT_THRESHOLD: u64 = 256 << 20;

/// Size the automatic mode aims to keep each partition under (256 MiB).
pub const DEFAULT_TARGET_PARTITION: u64 = 256 << 20;

/// Requested stream count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamCount {
    #[default]
    Auto,
    Fixed(u32),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StreamCountError {
    #[error("stream count must be `auto` or a number, got {0:?}")]
    NotANumber(String),
    #[error("stream count {0} is not a power of two between 1 and {max}", max = MAX_STREAMS)]
    OutOfRange(u32),
}

impl StreamCount {
    pub fn fixed(n: u32) -> Result<Self, StreamCountError> {
        if n == 0 || n > MAX_STREAMS || !n.is_power_of_two() {
            return Err(StreamCountError::OutOfRange(n));
        }
        Ok(Self::Fixed(n))
    }
}

impl FromStr for StreamCount {
    type Err = StreamCountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        let n: u32 = s
            .parse()
            .map_err(|_| StreamCountError::NotANumber(s.to_string()))?;
        Self::fixed(n)
    }
}

impl fmt::Display for StreamCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Fixed(n) => write!(f, "{}", n),
        }
    }
}

/// Tunables of the splitting heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SplitPolicy {
    /// Splitting activates only for totals strictly above this.
    pub threshold: u64,
    /// Auto mode picks the fewest streams keeping partitions at or below this.
    pub target_partition: u64,
    /// Cap on the automatic count (power of two, at most [`MAX_STREAMS`]).
    pub max_streams: u32,
}

impl Default for SplitPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SPLIT_THRESHOLD,
            target_partition: DEFAULT_TARGET_PARTITION,
            max_streams: MAX_STREAMS,
        }
    }
}

impl SplitPolicy {
    /// Number of streams to use for a transfer of `total` bytes.
    pub fn stream_count(&self, total: u64, mode: StreamCount) -> u32 {
        if total <= self.threshold {
            return 1;
        }
        match mode {
            StreamCount::Fixed(n) => n.max(1),
            StreamCount::Auto => {
                let cap = self.max_streams.clamp(1, MAX_STREAMS);
                let target = self.target_partition.max(1);
                let mut count = 1u32;
                while count < cap && total.div_ceil(count as u64) > target {
                    count *= 2;
                }
                count.min(cap)
            }
        }
    }

    /// Partition plan for a transfer of `total` bytes.
    pub fn plan(&self, total: u64, mode: StreamCount) -> Vec<Partition> {
        partition(total, self.stream_count(total, mode))
    }
}

/// Contiguous byte range `[start, start + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ByteRange {
    pub start: u64,
    pub len: u64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("malformed range {0:?}")]
    Malformed(String),
    #[error("range not satisfiable for {size} bytes")]
    Unsatisfiable { size: u64 },
}

impl ByteRange {
    /// Last byte offset covered (inclusive). Only meaningful when `len > 0`.
    pub fn last(&self) -> u64 {
        self.start + self.len.saturating_sub(1)
    }

    /// Value for a `Range` request header: `bytes=start-last`.
    pub fn range_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.last())
    }

    /// Value for a `Content-Range` header: `bytes start-last/total`.
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.last(), total)
    }

    /// Parse a single-range `Range` header (`bytes=a-b`, `bytes=a-`, `bytes=-n`)
    /// against a resource of `size` bytes. The end is clamped to the resource.
    pub fn parse_range(value: &str, size: u64) -> Result<Self, RangeError> {
        let malformed = || RangeError::Malformed(value.to_string());
        let ranges = value.trim().strip_prefix("bytes=").ok_or_else(malformed)?;
        if ranges.contains(',') {
            return Err(malformed());
        }
        let (first, last) = ranges.split_once('-').ok_or_else(malformed)?;
        let (first, last) = (first.trim(), last.trim());

        let (start, end) = match (first.is_empty(), last.is_empty()) {
            (true, true) => return Err(malformed()),
            // Suffix: the last `n` bytes.
            (true, false) => {
                let n = parse_offset(last).ok_or_else(malformed)?;
                if n == 0 || size == 0 {
                    return Err(RangeError::Unsatisfiable { size });
                }
                (size.saturating_sub(n), size - 1)
            }
            (false, true) => {
                let start = parse_offset(first).ok_or_else(malformed)?;
                (start, size.saturating_sub(1))
            }
            (false, false) => {
                let start = parse_offset(first).ok_or_else(malformed)?;
                let end = parse_offset(last).ok_or_else(malformed)?;
                if end < start {
                    return Err(malformed());
                }
                (start, end.min(size.saturating_sub(1)))
            }
        };
        if start >= size {
            return Err(RangeError::Unsatisfiable { size });
        }
        Ok(Self {
            start,
            len: end - start + 1,
        })
    }

    /// Parse a `Content-Range: bytes a-b/total` header for an upload whose
    /// declared size is `size`. The total must match (or be `*`) and the
    /// range must lie inside it.
    pub fn parse_content_range(value: &str, size: u64) -> Result<Self, RangeError> {
        let malformed = || RangeError::Malformed(value.to_string());
        let body = value.trim().strip_prefix("bytes ").ok_or_else(malformed)?;
        let (range, total) = body.split_once('/').ok_or_else(malformed)?;
        let total = total.trim();
        if total != "*" && parse_offset(total) != Some(size) {
            return Err(malformed());
        }
        let (first, last) = range.trim().split_once('-').ok_or_else(malformed)?;
        let start = parse_offset(first.trim()).ok_or_else(malformed)?;
        let end = parse_offset(last.trim()).ok_or_else(malformed)?;
        if end < start || end >= size {
            return Err(RangeError::Unsatisfiable { size });
        }
        Ok(Self {
            start,
            len: end - start + 1,
        })
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.start, self.len)
    }
}

fn parse_offset(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// One sub-transfer of a split transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Partition {
    /// Size of the whole transfer this partition belongs to.
    pub parent: u64,
    pub index: u32,
    pub count: u32,
    pub start: u64,
    pub len: u64,
}

impl Partition {
    pub fn range(&self) -> ByteRange {
        ByteRange {
            start: self.start,
            len: self.len,
        }
    }

    /// True when this partition is the whole transfer.
    pub fn is_whole(&self) -> bool {
        self.start == 0 && self.len == self.parent
    }
}

/// Divide `total` bytes into `count` contiguous ranges.
///
/// Every partition gets `total / count` bytes except the last, which also
/// absorbs `total % count`. `count` is clamped so no partition is empty,
/// except for `total == 0` which yields a single empty partition.
pub fn partition(total: u64, count: u32) -> Vec<Partition> {
    let count = (count.max(1) as u64).min(total.max(1)) as u32;
    let base = total / count as u64;
    let mut parts = Vec::with_capacity(count as usize);
    let mut start = 0u64;
    for index in 0..count {
        let len = if index + 1 == count { total - start } else { base };
        parts.push(Partition {
            parent: total,
            index,
            count,
            start,
            len,
        });
        start += len;
    }
    parts
}
