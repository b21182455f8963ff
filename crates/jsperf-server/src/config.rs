//! Server configuration.
//!
//! Every flag can also come from a `JSPERF_*` environment variable (a `.env`
//! file is loaded first by the binary). Command-line values win.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use jsperf_core::ndt7::DEFAULT_WINDOW;
use jsperf_core::split::{DEFAULT_SPLIT_THRESHOLD, DEFAULT_TARGET_PARTITION, MAX_STREAMS};
use jsperf_core::{SplitPolicy, StreamCount};

/// Largest HTTP/2 flow-control window the protocol allows.
const MAX_WINDOW_SIZE: u32 = (1 << 31) - 1;

/// Command-line arguments for the measurement servers
#[derive(Parser, Debug)]
#[command(name = "jsperf-server")]
#[command(version)]
#[command(about = "TLS measurement servers for bulk-transfer benchmarks", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve /api/{size} over HTTP/1.1+TLS.
    Http1(ListenArgs),
    /// Serve /api/{size} over HTTP/2+TLS.
    Http2(Http2Args),
    /// Serve the ndt7 WebSocket endpoints over TLS.
    Ndt7(Ndt7Args),
}

#[derive(Args, Debug, Clone)]
pub struct ListenArgs {
    /// IP address to listen on
    #[arg(short = 'A', long, env = "JSPERF_ADDRESS", default_value = "127.0.0.1")]
    pub address: IpAddr,

    /// TCP port (defaults: http1 4443, http2 4444, ndt7 4567)
    #[arg(short, long, env = "JSPERF_PORT")]
    pub port: Option<u16>,

    /// TLS certificate (PEM)
    #[arg(long, env = "JSPERF_CERT", default_value = "testdata/cert.pem")]
    pub cert: PathBuf,

    /// TLS private key (PEM)
    #[arg(long, env = "JSPERF_KEY", default_value = "testdata/key.pem")]
    pub key: PathBuf,

    /// Reject transfers larger than this many bytes
    #[arg(long, env = "JSPERF_MAX_SIZE")]
    pub max_size: Option<u64>,

    /// Seconds to let open connections drain on shutdown
    #[arg(long, env = "JSPERF_DRAIN_TIMEOUT", default_value_t = 5)]
    pub drain_timeout: u64,
}

#[derive(Args, Debug, Clone)]
pub struct Http2Args {
    #[command(flatten)]
    pub listen: ListenArgs,

    /// Default stream count for split transfers: `auto` or a power of two up to 16
    #[arg(long, env = "JSPERF_STREAMS", default_value = "auto")]
    pub streams: StreamCount,

    /// Transfers above this many bytes are split across streams
    #[arg(long, env = "JSPERF_SPLIT_THRESHOLD", default_value_t = DEFAULT_SPLIT_THRESHOLD)]
    pub split_threshold: u64,

    /// Auto mode keeps partitions at or below this many bytes
    #[arg(long, env = "JSPERF_TARGET_PARTITION", default_value_t = DEFAULT_TARGET_PARTITION)]
    pub target_partition: u64,

    /// Cap on the automatic stream count
    #[arg(long, env = "JSPERF_MAX_STREAMS", default_value_t = MAX_STREAMS)]
    pub max_streams: u32,

    /// HTTP/2 stream and connection flow-control window in bytes
    #[arg(long, env = "JSPERF_WINDOW_SIZE", default_value_t = 1 << 30)]
    pub window_size: u32,
}

#[derive(Args, Debug, Clone)]
pub struct Ndt7Args {
    #[command(flatten)]
    pub listen: ListenArgs,

    /// Length of each measurement window in seconds
    #[arg(long, env = "JSPERF_NDT7_DURATION", default_value_t = DEFAULT_WINDOW.as_secs())]
    pub duration: u64,
}

/// Which server flavour to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Http1,
    Http2,
    Ndt7,
}

impl Mode {
    pub fn default_port(self) -> u16 {
        match self {
            Self::Http1 => 4443,
            Self::Http2 => 4444,
            Self::Ndt7 => 4567,
        }
    }

    /// ALPN protocols offered during the TLS handshake.
    pub fn alpn(self) -> Vec<Vec<u8>> {
        match self {
            Self::Http1 | Self::Ndt7 => vec![b"http/1.1".to_vec()],
            Self::Http2 => vec![b"h2".to_vec()],
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Http1 => "http1",
            Self::Http2 => "http2",
            Self::Ndt7 => "ndt7",
        })
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max-streams must be a power of two between 1 and {max}, got {0}", max = MAX_STREAMS)]
    MaxStreams(u32),
    #[error("target-partition must be greater than zero")]
    TargetPartition,
    #[error("stream count {streams} exceeds max-streams {max}")]
    StreamsAboveMax { streams: u32, max: u32 },
    #[error("window-size must be between 65535 and {max}, got {0}", max = MAX_WINDOW_SIZE)]
    WindowSize(u32),
    #[error("ndt7 duration must be at least one second")]
    Duration,
}

/// Resolved configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub mode: Mode,
    pub addr: SocketAddr,
    pub cert: PathBuf,
    pub key: PathBuf,
    pub max_size: Option<u64>,
    pub drain_timeout: Duration,
    pub split: SplitPolicy,
    pub streams: StreamCount,
    /// HTTP/2 flow-control window; `None` keeps hyper's defaults.
    pub h2_window: Option<u32>,
    pub ndt7_window: Duration,
}

impl ServerConfig {
    /// Defaults for `mode`, listening on localhost.
    pub fn for_mode(mode: Mode) -> Self {
        Self {
            mode,
            addr: SocketAddr::from(([127, 0, 0, 1], mode.default_port())),
            cert: PathBuf::from("testdata/cert.pem"),
            key: PathBuf::from("testdata/key.pem"),
            max_size: None,
            drain_timeout: Duration::from_secs(5),
            split: SplitPolicy::default(),
            streams: StreamCount::Auto,
            h2_window: (mode == Mode::Http2).then_some(1 << 30),
            ndt7_window: DEFAULT_WINDOW,
        }
    }

    fn with_listen(mode: Mode, args: ListenArgs) -> Self {
        let port = args.port.unwrap_or(mode.default_port());
        Self {
            addr: SocketAddr::new(args.address, port),
            cert: args.cert,
            key: args.key,
            max_size: args.max_size,
            drain_timeout: Duration::from_secs(args.drain_timeout),
            ..Self::for_mode(mode)
        }
    }
}

impl Cli {
    /// Validate the arguments into a [`ServerConfig`].
    pub fn into_config(self) -> Result<ServerConfig, ConfigError> {
        match self.command {
            Command::Http1(listen) => Ok(ServerConfig::with_listen(Mode::Http1, listen)),
            Command::Http2(args) => {
                let max = args.max_streams;
                if max == 0 || max > MAX_STREAMS || !max.is_power_of_two() {
                    return Err(ConfigError::MaxStreams(max));
                }
                if args.target_partition == 0 {
                    return Err(ConfigError::TargetPartition);
                }
                if let StreamCount::Fixed(streams) = args.streams {
                    if streams > max {
                        return Err(ConfigError::StreamsAboveMax { streams, max });
                    }
                }
                if !(65_535..=MAX_WINDOW_SIZE).contains(&args.window_size) {
                    return Err(ConfigError::WindowSize(args.window_size));
                }
                Ok(ServerConfig {
                    split: SplitPolicy {
                        threshold: args.split_threshold,
                        target_partition: args.target_partition,
                        max_streams: max,
                    },
                    streams: args.streams,
                    h2_window: Some(args.window_size),
                    ..ServerConfig::with_listen(Mode::Http2, args.listen)
                })
            }
            Command::Ndt7(args) => {
                if args.duration == 0 {
                    return Err(ConfigError::Duration);
                }
                Ok(ServerConfig {
                    ndt7_window: Duration::from_secs(args.duration),
                    ..ServerConfig::with_listen(Mode::Ndt7, args.listen)
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<ServerConfig, ConfigError> {
        let mut argv = vec!["jsperf-server"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).expect("arguments parse").into_config()
    }

    #[test]
    fn http1_defaults() {
        let config = parse(&["http1"]).unwrap();
        assert_eq!(config.mode, Mode::Http1);
        assert_eq!(config.addr, "127.0.0.1:4443".parse().unwrap());
        assert_eq!(config.cert, PathBuf::from("testdata/cert.pem"));
        assert_eq!(config.h2_window, None);
        assert_eq!(config.max_size, None);
    }

    #[test]
    fn http2_split_flags() {
        let config = parse(&[
            "http2",
            "-A",
            "0.0.0.0",
            "-p",
            "9000",
            "--streams",
            "8",
            "--split-threshold",
            "1048576",
        ])
        .unwrap();
        assert_eq!(config.addr, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.streams, StreamCount::Fixed(8));
        assert_eq!(config.split.threshold, 1_048_576);
        assert_eq!(config.split.max_streams, 16);
        assert_eq!(config.h2_window, Some(1 << 30));
    }

    #[test]
    fn http2_rejects_inconsistent_split_flags() {
        assert_eq!(
            parse(&["http2", "--max-streams", "6"]).unwrap_err(),
            ConfigError::MaxStreams(6)
        );
        assert_eq!(
            parse(&["http2", "--max-streams", "4", "--streams", "8"]).unwrap_err(),
            ConfigError::StreamsAboveMax { streams: 8, max: 4 }
        );
        assert_eq!(
            parse(&["http2", "--window-size", "1024"]).unwrap_err(),
            ConfigError::WindowSize(1024)
        );
        assert!(Cli::try_parse_from(["jsperf-server", "http2", "--streams", "3"]).is_err());
    }

    #[test]
    fn config_errors_name_the_bounds() {
        assert_eq!(
            ConfigError::MaxStreams(6).to_string(),
            "max-streams must be a power of two between 1 and 16, got 6"
        );
        assert_eq!(
            ConfigError::WindowSize(1024).to_string(),
            format!("window-size must be between 65535 and {}, got 1024", MAX_WINDOW_SIZE)
        );
    }

    #[test]
    fn ndt7_window() {
        let config = parse(&["ndt7", "--duration", "3"]).unwrap();
        assert_eq!(config.addr.port(), 4567);
        assert_eq!(config.ndt7_window, Duration::from_secs(3));
        assert_eq!(parse(&["ndt7", "--duration", "0"]).unwrap_err(), ConfigError::Duration);
    }

    #[test]
    fn alpn_per_mode() {
        assert_eq!(Mode::Http1.alpn(), vec![b"http/1.1".to_vec()]);
        assert_eq!(Mode::Http2.alpn(), vec![b"h2".to_vec()]);
        assert_eq!(Mode::Ndt7.alpn(), vec![b"http/1.1".to_vec()]);
    }
}
