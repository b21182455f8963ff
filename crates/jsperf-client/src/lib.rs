//! HTTP/2 split-transfer client for the jsperf measurement servers.
//!
//! A transfer above the split threshold is cut into contiguous partitions
//! that run concurrently as independent streams on one connection.

pub mod split;
pub mod tls;

pub use split::{ClientOptions, PartitionReport, SplitClient, SplitError, SplitReport};
