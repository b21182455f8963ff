//! ndt7 sessions over a real socket (plain TCP; TLS is covered elsewhere).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use jsperf_core::ndt7::{Measurement, SUBPROTOCOL};
use jsperf_core::{
    ConnInfo, Direction, MeasurementEvent, MemoryLogger, Protocol, TransferLogger,
    TransferOutcome,
};
use jsperf_server::{ConnOptions, Mode, ServerConfig, app, serve_connection};
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;

const WINDOW: Duration = Duration::from_secs(1);

async fn spawn_ndt7() -> (SocketAddr, Arc<MemoryLogger>, CancellationToken) {
    spawn_ndt7_with(WINDOW).await
}

async fn spawn_ndt7_with(window: Duration) -> (SocketAddr, Arc<MemoryLogger>, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let logger = Arc::new(MemoryLogger::default());
    let shutdown = CancellationToken::new();

    let mut config = ServerConfig::for_mode(Mode::Ndt7);
    config.ndt7_window = window;
    let router = app(&config, logger.clone() as Arc<dyn TransferLogger>);

    let server_logger: Arc<dyn TransferLogger> = logger.clone();
    let token = shutdown.clone();
    tokio::spawn(async move {
        let mut id = 0;
        while let Ok((tcp, remote)) = listener.accept().await {
            id += 1;
            let conn = ConnInfo::new(id, remote, addr, None);
            tokio::spawn(serve_connection(
                tcp,
                conn,
                router.clone(),
                ConnOptions::default().builder(),
                server_logger.clone(),
                token.clone(),
                Duration::from_secs(1),
            ));
        }
    });

    (addr, logger, shutdown)
}

fn ndt7_request(
    addr: SocketAddr,
    path: &str,
) -> tokio_tungstenite::tungstenite::handshake::client::Request {
    let mut req = format!("ws://{}{}", addr, path).into_client_request().unwrap();
    req.headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));
    req
}

/// Wait until the session's `request done` event shows up.
async fn completion(logger: &MemoryLogger) -> TransferOutcome {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(done) = logger.completions().pop() {
            return done;
        }
        assert!(Instant::now() < deadline, "no completion logged");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Wait until `conn closed` shows up and return every event so far.
async fn closed_events(logger: &MemoryLogger) -> Vec<MeasurementEvent> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let events = logger.events();
        if events.iter().any(|e| matches!(e, MeasurementEvent::ConnClosed { .. })) {
            return events;
        }
        assert!(Instant::now() < deadline, "connection close not logged");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn position(events: &[MeasurementEvent], f: impl Fn(&MeasurementEvent) -> bool) -> usize {
    events.iter().position(f).expect("event logged")
}

/// Read the stream until the server closes it; returns binary bytes seen.
async fn read_to_close<S>(ws: &mut S) -> u64
where
    S: futures_util::Stream<Item = Result<Message, WsError>> + Unpin,
{
    let mut binary = 0;
    while let Some(msg) = ws.next().await {
        match msg {
            Ok(Message::Binary(data)) => binary += data.len() as u64,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
    binary
}

#[tokio::test]
async fn download_runs_for_the_window_and_closes() {
    let (addr, logger, _shutdown) = spawn_ndt7().await;
    let started = Instant::now();
    let (mut ws, response) = connect_async(ndt7_request(addr, "/ndt/v7/download"))
        .await
        .unwrap();
    assert_eq!(response.headers()["sec-websocket-protocol"], SUBPROTOCOL);

    let mut binary = 0u64;
    let mut largest = 0usize;
    let mut measurements = Vec::new();
    let mut closed = false;
    while let Some(msg) = ws.next().await {
        match msg.unwrap() {
            Message::Binary(data) => {
                binary += data.len() as u64;
                largest = largest.max(data.len());
            }
            Message::Text(text) => {
                measurements.push(serde_json::from_str::<Measurement>(text.as_str()).unwrap());
            }
            Message::Close(_) => {
                closed = true;
                break;
            }
            _ => {}
        }
    }

    // The server ended the session on its own, close to the window.
    assert!(closed);
    let elapsed = started.elapsed();
    assert!(elapsed >= WINDOW - Duration::from_millis(50), "{:?}", elapsed);
    assert!(elapsed < WINDOW + Duration::from_secs(2), "{:?}", elapsed);

    assert!(binary > 0);
    assert!(largest >= 8192);
    assert!(largest <= 1 << 23);

    assert!(!measurements.is_empty());
    let first = &measurements[0];
    assert_eq!(first.origin.as_deref(), Some("server"));
    assert_eq!(first.test.as_deref(), Some("download"));
    assert!(first.connection_info.is_some());
    let app_info = measurements.last().unwrap().app_info.unwrap();
    assert!(app_info.num_bytes as u64 <= binary);

    let done = completion(&logger).await;
    assert_eq!(done.request.direction, Direction::Download);
    assert_eq!(done.request.protocol, Protocol::WebSocket);
    assert_eq!(done.stats.bytes, binary);
    assert!(done.is_complete());
}

#[tokio::test]
async fn upload_counts_client_bytes_without_counterflow() {
    let (addr, logger, _shutdown) = spawn_ndt7().await;
    let (ws, _) = connect_async(ndt7_request(addr, "/ndt/v7/upload")).await.unwrap();
    let (mut tx, mut rx) = ws.split();

    let sent: u64 = 20 * 65_536;
    for _ in 0..20 {
        tx.send(Message::binary(vec![0u8; 65_536])).await.unwrap();
    }

    let mut texts = 0;
    while let Some(msg) = rx.next().await {
        match msg {
            Ok(Message::Text(_)) => texts += 1,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
    assert_eq!(texts, 0);

    let done = completion(&logger).await;
    assert_eq!(done.request.direction, Direction::Upload);
    assert_eq!(done.stats.bytes, sent);
}

#[tokio::test]
async fn missing_subprotocol_is_rejected() {
    let (addr, logger, _shutdown) = spawn_ndt7().await;
    let req = format!("ws://{}/ndt/v7/download", addr)
        .into_client_request()
        .unwrap();
    match connect_async(req).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 400),
        other => panic!("expected HTTP 400, got {:?}", other.map(|(_, r)| r.status())),
    }
    assert!(logger.completions().is_empty());
}

#[tokio::test]
async fn shutdown_closes_idle_connections() {
    let (addr, logger, shutdown) = spawn_ndt7().await;
    let tcp = tokio::net::TcpStream::connect(addr).await.unwrap();

    shutdown.cancel();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let closed = logger
            .events()
            .iter()
            .any(|e| matches!(e, jsperf_core::MeasurementEvent::ConnClosed { .. }));
        if closed {
            break;
        }
        assert!(Instant::now() < deadline, "connection was not closed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    drop(tcp);
}

#[tokio::test]
async fn connection_closes_after_the_session() {
    let (addr, logger, _shutdown) = spawn_ndt7().await;
    let (mut ws, _) = connect_async(ndt7_request(addr, "/ndt/v7/download"))
        .await
        .unwrap();
    read_to_close(&mut ws).await;
    drop(ws);

    let events = closed_events(&logger).await;
    let new = position(&events, |e| matches!(e, MeasurementEvent::ConnNew(_)));
    let received = position(&events, |e| matches!(e, MeasurementEvent::RequestReceived { .. }));
    let done = position(&events, |e| matches!(e, MeasurementEvent::RequestDone(_)));
    let closed = position(&events, |e| matches!(e, MeasurementEvent::ConnClosed { .. }));
    assert!(new < received && received < done && done < closed, "{:?}", events);

    match &events[closed] {
        MeasurementEvent::ConnClosed { lifetime, .. } => {
            assert!(*lifetime >= WINDOW - Duration::from_millis(50), "{:?}", lifetime);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn shutdown_ends_running_sessions() {
    let (addr, logger, shutdown) = spawn_ndt7_with(Duration::from_secs(10)).await;
    let (mut ws, _) = connect_async(ndt7_request(addr, "/ndt/v7/download"))
        .await
        .unwrap();
    assert!(matches!(ws.next().await, Some(Ok(_))));

    shutdown.cancel();
    let cancelled = Instant::now();
    read_to_close(&mut ws).await;
    assert!(cancelled.elapsed() < Duration::from_secs(3), "{:?}", cancelled.elapsed());

    let done = completion(&logger).await;
    assert!(done.stats.bytes > 0);
    assert!(done.stats.elapsed < Duration::from_secs(5));
    closed_events(&logger).await;
}

#[tokio::test]
async fn dropped_client_still_logs_partial_count() {
    let (addr, logger, _shutdown) = spawn_ndt7_with(Duration::from_secs(10)).await;
    let (mut ws, _) = connect_async(ndt7_request(addr, "/ndt/v7/download"))
        .await
        .unwrap();

    let mut messages = 0;
    while messages < 4 {
        match ws.next().await {
            Some(Ok(Message::Binary(_))) => messages += 1,
            Some(Ok(_)) => {}
            other => panic!("session ended early: {:?}", other),
        }
    }
    drop(ws);
    let dropped = Instant::now();

    let done = completion(&logger).await;
    assert!(dropped.elapsed() < Duration::from_secs(3), "{:?}", dropped.elapsed());
    assert_eq!(done.request.direction, Direction::Download);
    assert!(done.stats.bytes > 0);
    assert!(done.stats.elapsed < Duration::from_secs(5));
}
