//! Split transfers against a real TLS HTTP/2 server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use jsperf_client::{ClientOptions, SplitClient, tls};
use jsperf_core::{
    Direction, MeasurementEvent, MemoryLogger, Protocol, SplitPolicy, StreamCount, TransferLogger,
    TransferOutcome,
};
use jsperf_server::{Mode, Server, ServerConfig, app, conn_options};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const MIB: u64 = 1 << 20;

/// Split anything above 1 MiB into partitions of at most 1 MiB.
fn policy() -> SplitPolicy {
    SplitPolicy {
        threshold: MIB,
        target_partition: MIB,
        max_streams: 16,
    }
}

struct Harness {
    addr: SocketAddr,
    logger: Arc<MemoryLogger>,
    shutdown: CancellationToken,
    server: JoinHandle<std::io::Result<()>>,
    ca: String,
}

async fn start() -> Harness {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let (cert_pem, key_pem) = (cert.pem(), key_pair.serialize_pem());

    let mut config = ServerConfig::for_mode(Mode::Http2);
    config.split = policy();
    config.drain_timeout = Duration::from_secs(1);

    let server_tls = jsperf_server::tls::server_config_from_pem(
        cert_pem.as_bytes(),
        key_pem.as_bytes(),
        config.mode.alpn(),
    )
    .unwrap();

    let logger = Arc::new(MemoryLogger::default());
    let shared: Arc<dyn TransferLogger> = logger.clone();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server = Server::new(
        listener,
        server_tls,
        app(&config, shared.clone()),
        shared,
        conn_options(&config),
    );
    let addr = server.local_addr().unwrap();

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(server.run(shutdown.clone()));

    Harness {
        addr,
        logger,
        shutdown,
        server,
        ca: cert_pem,
    }
}

/// Server-side completions land when hyper drops the body, which can trail
/// the client seeing the end of the stream.
async fn completions(logger: &MemoryLogger, n: usize) -> Vec<TransferOutcome> {
    for _ in 0..100 {
        let done = logger.completions();
        if done.len() >= n {
            return done;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    logger.completions()
}

async fn client(h: &Harness) -> SplitClient {
    let tls = tls::client_config_from_pem(h.ca.as_bytes()).unwrap();
    let options = ClientOptions {
        policy: policy(),
        streams: StreamCount::Auto,
        h2_window: Some(1 << 24),
    };
    SplitClient::connect(&h.addr.to_string(), "localhost", tls, options)
        .await
        .unwrap()
}

#[tokio::test]
async fn split_download_covers_the_transfer() {
    let h = start().await;
    let client = client(&h).await;

    let total = 4 * MIB + 3;
    let report = client.download(total).await.unwrap();
    assert_eq!(report.partitions.len(), 8);
    assert_eq!(report.bytes(), total);
    assert!(report.is_complete());
    for (i, p) in report.partitions.iter().enumerate() {
        assert_eq!(p.partition.index as usize, i);
    }

    let done = completions(&h.logger, 8).await;
    assert_eq!(done.len(), 8);
    assert!(done.iter().all(|d| d.range.is_some() && d.is_complete()));
    assert!(done.iter().all(|d| d.request.protocol == Protocol::Http2));
    assert!(done.iter().all(|d| d.conn.alpn == "h2"));
    assert_eq!(done.iter().map(|d| d.stats.bytes).sum::<u64>(), total);

    // All partitions shared one connection.
    let conn_id = done[0].conn.id;
    assert!(done.iter().all(|d| d.conn.id == conn_id));

    client.close().await;
}

#[tokio::test]
async fn split_upload_covers_the_transfer() {
    let h = start().await;
    let client = client(&h).await;

    let total = 2 * MIB + 1;
    let report = client.upload(total).await.unwrap();
    assert_eq!(report.partitions.len(), 4);
    assert!(report.is_complete());

    let done = completions(&h.logger, 4).await;
    assert_eq!(done.len(), 4);
    assert!(done.iter().all(|d| d.request.direction == Direction::Upload));
    assert_eq!(done.iter().map(|d| d.stats.bytes).sum::<u64>(), total);

    client.close().await;
}

#[tokio::test]
async fn small_transfer_is_not_split() {
    let h = start().await;
    let client = client(&h).await;

    let report = client.download(1000).await.unwrap();
    assert_eq!(report.partitions.len(), 1);
    assert!(report.is_complete());

    let done = completions(&h.logger, 1).await;
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].range, None);

    client.close().await;
}

#[tokio::test]
async fn connection_lifecycle_is_logged() {
    let h = start().await;
    let client = client(&h).await;
    client.download(10).await.unwrap();
    client.close().await;

    h.shutdown.cancel();
    h.server.await.unwrap().unwrap();

    let events = h.logger.events();
    let new = events
        .iter()
        .find_map(|e| match e {
            MeasurementEvent::ConnNew(conn) => Some(conn.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(new.alpn, "h2");
    assert!(events.iter().any(|e| matches!(
        e,
        MeasurementEvent::ConnClosed { conn, .. } if conn.id == new.id
    )));
}
