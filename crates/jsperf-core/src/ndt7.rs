//! ndt7 protocol constants, measurement messages and message-size scaling.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// WebSocket subprotocol a client must offer.
pub const SUBPROTOCOL: &str = "net.measurementlab.ndt.v7";

pub const DOWNLOAD_PATH: &str = "/ndt/v7/download";
pub const UPLOAD_PATH: &str = "/ndt/v7/upload";

/// First binary message size during download (8 KiB).
pub const INITIAL_MESSAGE_SIZE: usize = 1 << 13;

/// Download messages never grow past this (8 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1 << 23;

/// Largest message accepted from an uploading client (16 MiB).
pub const MAX_READ_MESSAGE_SIZE: usize = 1 << 24;

/// The message size doubles once the bytes already sent reach this many
/// times the current size.
pub const SCALING_FRACTION: u64 = 16;

/// Interval between server measurement messages.
pub const MEASUREMENT_INTERVAL: Duration = Duration::from_millis(250);

/// Default length of a measurement window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10);

/// Adaptive download message size.
#[derive(Debug, Clone, Copy)]
pub struct MessageSizer {
    size: usize,
    cap: usize,
}

impl Default for MessageSizer {
    fn default() -> Self {
        Self::new(INITIAL_MESSAGE_SIZE, MAX_MESSAGE_SIZE)
    }
}

impl MessageSizer {
    pub fn new(initial: usize, cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            size: initial.clamp(1, cap),
            cap,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Update for `sent` total bytes; returns true when the size changed.
    pub fn observe(&mut self, sent: u64) -> bool {
        if self.size >= self.cap || sent < self.size as u64 * SCALING_FRACTION {
            return false;
        }
        self.size = (self.size * 2).min(self.cap);
        true
    }
}

/// Application-level numbers of a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AppInfo {
    /// Microseconds since the start of the test.
    pub elapsed_time: i64,
    pub num_bytes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnectionInfo {
    pub client: String,
    pub server: String,
    #[serde(rename = "UUID")]
    pub uuid: String,
}

/// Text message exchanged alongside the binary payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Measurement {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub app_info: Option<AppInfo>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub connection_info: Option<ConnectionInfo>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub origin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub test: Option<String>,
}

impl Measurement {
    /// Server-originated measurement for the given test.
    pub fn server(test: &str, elapsed: Duration, bytes: u64, connection_info: Option<ConnectionInfo>) -> Self {
        Self {
            app_info: Some(AppInfo {
                elapsed_time: elapsed.as_micros().min(i64::MAX as u128) as i64,
                num_bytes: bytes.min(i64::MAX as u64) as i64,
            }),
            connection_info,
            origin: Some("server".to_string()),
            test: Some(test.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizer_doubles_when_enough_was_sent() {
        let mut sizer = MessageSizer::default();
        assert_eq!(sizer.size(), 8192);

        assert!(!sizer.observe(8192 * 16 - 1));
        assert_eq!(sizer.size(), 8192);

        assert!(sizer.observe(8192 * 16));
        assert_eq!(sizer.size(), 16384);
    }

    #[test]
    fn sizer_stops_at_cap() {
        let mut sizer = MessageSizer::default();
        let mut sent = 0u64;
        for _ in 0..10_000 {
            sent += sizer.size() as u64;
            sizer.observe(sent);
        }
        assert_eq!(sizer.size(), MAX_MESSAGE_SIZE);
        assert!(!sizer.observe(u64::MAX));
    }

    #[test]
    fn measurement_uses_ndt7_field_names() {
        let m = Measurement::server(
            "download",
            Duration::from_millis(250),
            1024,
            Some(ConnectionInfo {
                client: "127.0.0.1:50000".into(),
                server: "127.0.0.1:4567".into(),
                uuid: "abc".into(),
            }),
        );
        let json: serde_json::Value = serde_json::to_value(&m).unwrap();
        assert_eq!(json["AppInfo"]["ElapsedTime"], 250_000);
        assert_eq!(json["AppInfo"]["NumBytes"], 1024);
        assert_eq!(json["ConnectionInfo"]["UUID"], "abc");
        assert_eq!(json["Origin"], "server");
        assert_eq!(json["Test"], "download");
    }

    #[test]
    fn client_measurements_parse_with_missing_fields() {
        let m: Measurement =
            serde_json::from_str(r#"{"AppInfo":{"ElapsedTime":10,"NumBytes":20},"Origin":"client"}"#)
                .unwrap();
        assert_eq!(m.app_info.unwrap().num_bytes, 20);
        assert_eq!(m.connection_info, None);
        assert_eq!(m.origin.as_deref(), Some("client"));
    }
}
