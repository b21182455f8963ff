use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use jsperf_client::{ClientOptions, SplitClient, tls};
use jsperf_core::split::{DEFAULT_SPLIT_THRESHOLD, DEFAULT_TARGET_PARTITION, MAX_STREAMS};
use jsperf_core::{SplitPolicy, StreamCount};

/// Run one split transfer against a jsperf HTTP/2 server
#[derive(Parser, Debug)]
#[command(name = "jsperf-split")]
#[command(version)]
#[command(about = "HTTP/2 split-transfer client", long_about = None)]
struct Args {
    /// Server address (host:port)
    #[arg(short = 'A', long, env = "JSPERF_SERVER", default_value = "127.0.0.1:4444")]
    addr: String,

    /// Name to verify in the server certificate
    #[arg(long, env = "JSPERF_SERVER_NAME", default_value = "localhost")]
    server_name: String,

    /// CA or self-signed server certificate to trust (PEM)
    #[arg(long, env = "JSPERF_CA", default_value = "testdata/cert.pem")]
    ca: PathBuf,

    /// Transfer size in bytes
    #[arg(short, long)]
    size: u64,

    /// Upload instead of download
    #[arg(long)]
    upload: bool,

    /// `auto` or a power of two up to 16
    #[arg(long, env = "JSPERF_STREAMS", default_value = "auto")]
    streams: StreamCount,

    #[arg(long, env = "JSPERF_SPLIT_THRESHOLD", default_value_t = DEFAULT_SPLIT_THRESHOLD)]
    split_threshold: u64,

    #[arg(long, env = "JSPERF_TARGET_PARTITION", default_value_t = DEFAULT_TARGET_PARTITION)]
    target_partition: u64,

    #[arg(long, env = "JSPERF_MAX_STREAMS", default_value_t = MAX_STREAMS)]
    max_streams: u32,

    /// HTTP/2 flow-control window in bytes
    #[arg(long, env = "JSPERF_WINDOW_SIZE", default_value_t = 1 << 30)]
    window_size: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jsperf_client=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if args.target_partition == 0 {
        anyhow::bail!("target-partition must be greater than zero");
    }

    let tls = tls::load_client_config(&args.ca)
        .with_context(|| format!("loading CA from {}", args.ca.display()))?;
    let options = ClientOptions {
        policy: SplitPolicy {
            threshold: args.split_threshold,
            target_partition: args.target_partition,
            max_streams: args.max_streams.clamp(1, MAX_STREAMS),
        },
        streams: args.streams,
        h2_window: Some(args.window_size),
    };

    let client = SplitClient::connect(&args.addr, &args.server_name, tls, options).await?;
    let report = if args.upload {
        client.upload(args.size).await?
    } else {
        client.download(args.size).await?
    };
    client.close().await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_complete() {
        anyhow::bail!("short transfer: {} of {} bytes", report.bytes(), report.total);
    }
    Ok(())
}
