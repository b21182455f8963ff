//! Split dispatcher: one logical transfer as concurrent range requests over
//! a single HTTP/2 connection.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::Frame;
use hyper::client::conn::http2;
use hyper::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use jsperf_core::{
    CHUNK_SIZE, Direction, Meter, Metered, Partition, Payload, SplitPolicy, StreamCount,
    TransferStats,
};
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsConnector;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

pub type SplitBody = UnsyncBoxBody<Bytes, io::Error>;

#[derive(Debug, thiserror::Error)]
pub enum SplitError {
    #[error("failed to connect to {addr}: {source}")]
    Connect { addr: String, source: io::Error },
    #[error("invalid server name {0:?}")]
    ServerName(String),
    #[error("server negotiated {0:?} instead of h2")]
    Alpn(String),
    #[error(transparent)]
    Http(#[from] hyper::Error),
    #[error(transparent)]
    Request(#[from] hyper::http::Error),
    #[error("partition {index}: unexpected status {status}")]
    Status { index: u32, status: StatusCode },
    #[error("partition task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Dispatcher settings.
#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub policy: SplitPolicy,
    pub streams: StreamCount,
    /// HTTP/2 stream and connection window; `None` keeps hyper's defaults.
    pub h2_window: Option<u32>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            policy: SplitPolicy::default(),
            streams: StreamCount::Auto,
            h2_window: Some(1 << 30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PartitionReport {
    pub partition: Partition,
    pub bytes: u64,
    pub elapsed: Duration,
}

impl PartitionReport {
    fn new(partition: Partition, stats: TransferStats) -> Self {
        Self {
            partition,
            bytes: stats.bytes,
            elapsed: stats.elapsed,
        }
    }
}

/// Outcome of one split transfer.
#[derive(Debug, Clone, Serialize)]
pub struct SplitReport {
    pub direction: Direction,
    pub total: u64,
    /// Wall-clock time from the first request to the last partition.
    pub elapsed: Duration,
    /// Sorted by partition index.
    pub partitions: Vec<PartitionReport>,
}

impl SplitReport {
    pub fn bytes(&self) -> u64 {
        self.partitions.iter().map(|p| p.bytes).sum()
    }

    /// Every partition moved exactly its length.
    pub fn is_complete(&self) -> bool {
        self.bytes() == self.total && self.partitions.iter().all(|p| p.bytes == p.partition.len)
    }

    pub fn bits_per_second(&self) -> f64 {
        TransferStats {
            bytes: self.bytes(),
            elapsed: self.elapsed,
        }
        .bits_per_second()
    }
}

/// An HTTP/2 connection to a measurement server.
pub struct SplitClient {
    sender: http2::SendRequest<SplitBody>,
    authority: String,
    options: ClientOptions,
    driver: JoinHandle<()>,
}

impl SplitClient {
    /// Open a TLS connection to `addr` and complete the HTTP/2 handshake.
    pub async fn connect(
        addr: &str,
        server_name: &str,
        tls: Arc<ClientConfig>,
        options: ClientOptions,
    ) -> Result<Self, SplitError> {
        let connect_err = |source| SplitError::Connect {
            addr: addr.to_string(),
            source,
        };
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| SplitError::ServerName(server_name.to_string()))?;

        let tcp = TcpStream::connect(addr).await.map_err(connect_err)?;
        let _ = tcp.set_nodelay(true);
        let stream = TlsConnector::from(tls)
            .connect(name, tcp)
            .await
            .map_err(connect_err)?;

        match stream.get_ref().1.alpn_protocol() {
            Some(b"h2") => {}
            other => {
                let got = other
                    .map(|p| String::from_utf8_lossy(p).into_owned())
                    .unwrap_or_else(|| "none".to_string());
                return Err(SplitError::Alpn(got));
            }
        }

        let mut builder = http2::Builder::new(TokioExecutor::new());
        if let Some(window) = options.h2_window {
            builder
                .initial_stream_window_size(window)
                .initial_connection_window_size(window)
                .max_frame_size((1 << 24) - 1);
        }
        let (sender, conn) = builder.handshake(TokioIo::new(stream)).await?;
        let driver = tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("h2 connection ended: {}", e);
            }
        });

        info!("Connected to {} (h2)", addr);
        Ok(Self {
            sender,
            authority: addr.to_string(),
            options,
            driver,
        })
    }

    pub fn plan(&self, total: u64) -> Vec<Partition> {
        self.options.policy.plan(total, self.options.streams)
    }

    pub async fn download(&self, total: u64) -> Result<SplitReport, SplitError> {
        self.run(Direction::Download, total).await
    }

    pub async fn upload(&self, total: u64) -> Result<SplitReport, SplitError> {
        self.run(Direction::Upload, total).await
    }

    async fn run(&self, direction: Direction, total: u64) -> Result<SplitReport, SplitError> {
        let plan = self.plan(total);
        debug!(total, streams = plan.len(), "{} plan ready", direction);

        let started = Instant::now();
        let uri = format!("https://{}/api/{}", self.authority, total);
        let mut tasks = JoinSet::new();
        for part in plan {
            let sender = self.sender.clone();
            let uri = uri.clone();
            tasks.spawn(async move {
                match direction {
                    Direction::Download => download_partition(sender, &uri, part).await,
                    Direction::Upload => upload_partition(sender, &uri, part).await,
                }
            });
        }

        // Partitions finish in any order.
        let mut partitions = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            partitions.push(joined??);
        }
        partitions.sort_by_key(|p| p.partition.index);

        let report = SplitReport {
            direction,
            total,
            elapsed: started.elapsed(),
            partitions,
        };
        info!(
            total,
            bytes = report.bytes(),
            streams = report.partitions.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "{} finished at {:.1} Mbit/s",
            direction,
            report.bits_per_second() / 1e6
        );
        Ok(report)
    }

    /// Close the connection and wait for it to wind down.
    pub async fn close(self) {
        drop(self.sender);
        let mut driver = self.driver;
        if tokio::time::timeout(Duration::from_secs(1), &mut driver).await.is_err() {
            driver.abort();
        }
    }
}

// ── Partitions ──────────────────────────────────────────────────────────

/// Request for one partition. A whole-transfer partition goes out without
/// range headers, exactly like an unsplit transfer.
fn partition_request(
    uri: &str,
    direction: Direction,
    part: Partition,
    body: SplitBody,
) -> Result<Request<SplitBody>, hyper::http::Error> {
    let mut req = Request::builder().uri(uri);
    match direction {
        Direction::Download => {
            req = req.method(Method::GET);
            if !part.is_whole() {
                req = req.header(RANGE, part.range().range_header());
            }
        }
        Direction::Upload => {
            req = req
                .method(Method::PUT)
                .header(CONTENT_TYPE, "application/octet-stream")
                .header(CONTENT_LENGTH, part.len);
            if !part.is_whole() {
                req = req.header(CONTENT_RANGE, part.range().content_range(part.parent));
            }
        }
    }
    req.body(body)
}

fn expected_status(direction: Direction, part: &Partition) -> StatusCode {
    match direction {
        Direction::Upload => StatusCode::NO_CONTENT,
        Direction::Download if part.is_whole() => StatusCode::OK,
        Direction::Download => StatusCode::PARTIAL_CONTENT,
    }
}

async fn download_partition(
    mut sender: http2::SendRequest<SplitBody>,
    uri: &str,
    part: Partition,
) -> Result<PartitionReport, SplitError> {
    let body = Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync();
    let req = partition_request(uri, Direction::Download, part, body)?;

    sender.ready().await?;
    let res = sender.send_request(req).await?;
    let status = res.status();
    if status != expected_status(Direction::Download, &part) {
        return Err(SplitError::Status {
            index: part.index,
            status,
        });
    }

    let mut meter = Meter::new();
    meter.touch();
    let mut stream = Metered::new(res.into_body().into_data_stream(), meter);
    while stream.try_next().await?.is_some() {}
    Ok(PartitionReport::new(part, stream.finish()))
}

async fn upload_partition(
    mut sender: http2::SendRequest<SplitBody>,
    uri: &str,
    part: Partition,
) -> Result<PartitionReport, SplitError> {
    let (stats_tx, stats_rx) = oneshot::channel();
    let meter = Meter::on_close(move |stats| {
        let _ = stats_tx.send(stats);
    });
    let source = ReaderStream::with_capacity(Payload.bounded(part.len), CHUNK_SIZE);
    let body = StreamBody::new(Metered::new(source, meter).map_ok(Frame::data)).boxed_unsync();
    let req = partition_request(uri, Direction::Upload, part, body)?;

    sender.ready().await?;
    let res = sender.send_request(req).await?;
    let status = res.status();
    if status != expected_status(Direction::Upload, &part) {
        return Err(SplitError::Status {
            index: part.index,
            status,
        });
    }

    // The body is dropped once hyper has sent it, which closes the meter.
    let stats = stats_rx.await.unwrap_or_default();
    Ok(PartitionReport::new(part, stats))
}
