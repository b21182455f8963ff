//! Transport-independent pieces of the jsperf measurement servers.
//!
//! - synthetic payload source that feeds downloads without disk I/O
//! - per-transfer byte and time accounting
//! - the measurement-endpoint contract shared by HTTP and ndt7
//! - the HTTP/2 stream-split policy
//! - connection/transfer observability events

pub mod accounting;
pub mod endpoint;
pub mod ndt7;
pub mod observe;
pub mod payload;
pub mod split;

// Re-export key types for convenience.
pub use accounting::{Meter, Metered, TransferStats};
pub use endpoint::{
    Direction, Extent, MeasurementEndpoint, Protocol, SizeError, TransferOutcome,
    TransferRequest, parse_size,
};
pub use observe::{ConnInfo, MeasurementEvent, MemoryLogger, TracingLogger, TransferLogger};
pub use payload::{CHUNK_SIZE, Payload};
pub use split::{ByteRange, Partition, RangeError, SplitPolicy, StreamCount, StreamCountError, partition};
