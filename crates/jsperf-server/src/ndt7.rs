//! ndt7 download and upload sessions over WebSocket.
//!
//! A session lasts one measurement window. Download floods binary messages
//! whose size grows with the bytes already sent and interleaves a server
//! measurement every [`MEASUREMENT_INTERVAL`]. Upload only counts what the
//! client sends; the server does not send measurements back during upload.
//!
//! A session holds the connection's [`ConnLease`] until it is done and ends
//! early with a Close frame when the server shuts down.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Extension, Router,
    extract::{
        State,
        ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade, close_code},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use jsperf_core::ndt7::{
    ConnectionInfo, DOWNLOAD_PATH, MAX_READ_MESSAGE_SIZE, MEASUREMENT_INTERVAL, Measurement,
    MessageSizer, SUBPROTOCOL, UPLOAD_PATH,
};
use jsperf_core::{
    ConnInfo, Direction, Extent, MeasurementEndpoint, MeasurementEvent, Meter, Payload, Protocol,
    TransferLogger, TransferRequest,
};
use tokio::time::{Instant, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::listener::ConnLease;

/// How long the closing handshake may take after the window ends.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct Ndt7Endpoint {
    pub logger: Arc<dyn TransferLogger>,
    /// Length of every session.
    pub window: Duration,
}

impl MeasurementEndpoint for Ndt7Endpoint {
    fn logger(&self) -> &Arc<dyn TransferLogger> {
        &self.logger
    }
}

impl Ndt7Endpoint {
    fn begin_session(&self, direction: Direction, conn: &ConnInfo) -> Meter {
        let request = TransferRequest {
            extent: Extent::Window(self.window),
            direction,
            protocol: Protocol::WebSocket,
        };
        self.begin(request, conn, None)
    }

    fn sample(&self, conn: &ConnInfo, test: Direction, meter: &Meter, message_size: usize) {
        self.logger.log(MeasurementEvent::Ndt7Sample {
            conn: conn.clone(),
            test,
            bytes: meter.bytes(),
            elapsed: meter.elapsed(),
            message_size,
        });
    }
}

pub fn router(endpoint: Ndt7Endpoint) -> Router {
    Router::new()
        .route(DOWNLOAD_PATH, get(download))
        .route(UPLOAD_PATH, get(upload))
        .with_state(endpoint)
}

/// True when the client listed the ndt7 subprotocol.
fn offers_subprotocol(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|p| p.trim() == SUBPROTOCOL)
}

fn upgrade<F, Fut>(ws: WebSocketUpgrade, headers: &HeaderMap, lease: ConnLease, session: F) -> Response
where
    F: FnOnce(WebSocket, ConnLease) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    if !offers_subprotocol(headers) {
        debug!(conn = lease.conn().id, "ndt7 upgrade without {}", SUBPROTOCOL);
        return StatusCode::BAD_REQUEST.into_response();
    }
    ws.protocols([SUBPROTOCOL])
        .max_message_size(MAX_READ_MESSAGE_SIZE)
        .on_upgrade(move |socket| session(socket, lease))
}

// ── Handlers ────────────────────────────────────────────────────────────

pub async fn download(
    State(ep): State<Ndt7Endpoint>,
    Extension(lease): Extension<ConnLease>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(ws, &headers, lease, move |socket, lease| download_session(ep, socket, lease))
}

pub async fn upload(
    State(ep): State<Ndt7Endpoint>,
    Extension(lease): Extension<ConnLease>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(ws, &headers, lease, move |socket, lease| upload_session(ep, socket, lease))
}

// ── Sessions ────────────────────────────────────────────────────────────

async fn download_session(ep: Ndt7Endpoint, socket: WebSocket, lease: ConnLease) {
    let conn = lease.conn();
    let shutdown = lease.shutdown();
    let mut meter = ep.begin_session(Direction::Download, conn);
    let (mut tx, rx) = socket.split();

    // Client messages are read and dropped so the socket never stalls.
    let reader = tokio::spawn(drain(rx));

    let start = Instant::now();
    let deadline = start + ep.window;
    let mut next_measurement = start + MEASUREMENT_INTERVAL;
    let mut connection_info = Some(ConnectionInfo {
        client: conn.remote.to_string(),
        server: conn.local.to_string(),
        uuid: Uuid::new_v4().to_string(),
    });

    let mut sizer = MessageSizer::default();
    let mut message = Payload::message(sizer.size());
    // Bytes queued on the socket but not yet flushed.
    let mut pending = 0u64;
    meter.touch();

    while Instant::now() < deadline && !reader.is_finished() && !shutdown.is_cancelled() {
        if Instant::now() >= next_measurement {
            next_measurement += MEASUREMENT_INTERVAL;
            ep.sample(conn, Direction::Download, &meter, sizer.size());
            let measurement = Measurement::server(
                "download",
                meter.elapsed(),
                meter.bytes(),
                connection_info.take(),
            );
            let text = match serde_json::to_string(&measurement) {
                Ok(text) => text,
                Err(e) => {
                    warn!(conn = conn.id, "failed to encode measurement: {}", e);
                    break;
                }
            };
            if !queue(&mut tx, Message::Text(text.into()), deadline, shutdown).await {
                break;
            }
        }

        if !queue(&mut tx, Message::Binary(message.clone()), deadline, shutdown).await {
            break;
        }
        pending = message.len() as u64;
        match bounded(tx.flush(), deadline, shutdown).await {
            Some(Ok(())) => meter.add(std::mem::take(&mut pending)),
            // Window over or shutting down: the close frame flushes it.
            None => break,
            // Broken connection: the message never left.
            Some(Err(_)) => {
                pending = 0;
                break;
            }
        }
        if sizer.observe(meter.bytes()) {
            message = Payload::message(sizer.size());
        }
    }

    if close(&mut tx).await && pending > 0 {
        meter.add(pending);
    }
    let _ = timeout(CLOSE_TIMEOUT, reader).await;
    meter.finish();
    drop(lease);
}

async fn upload_session(ep: Ndt7Endpoint, socket: WebSocket, lease: ConnLease) {
    let conn = lease.conn();
    let mut meter = ep.begin_session(Direction::Upload, conn);
    let (mut tx, mut rx) = socket.split();
    let deadline = Instant::now() + ep.window;
    meter.touch();

    loop {
        match bounded(rx.next(), deadline, lease.shutdown()).await {
            None => break,
            Some(None) | Some(Some(Err(_))) => break,
            Some(Some(Ok(msg))) => match msg {
                Message::Binary(data) => meter.add(data.len() as u64),
                Message::Text(text) => meter.add(text.as_str().len() as u64),
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => {}
            },
        }
    }
    ep.sample(conn, Direction::Upload, &meter, 0);

    close(&mut tx).await;
    meter.finish();
    drop(lease);
}

/// Run `fut` unless the window closes or the server shuts down first.
async fn bounded<F: Future>(
    fut: F,
    deadline: Instant,
    shutdown: &CancellationToken,
) -> Option<F::Output> {
    tokio::select! {
        _ = shutdown.cancelled() => None,
        res = timeout_at(deadline, fut) => res.ok(),
    }
}

/// Queue one message; false ends the session.
async fn queue(
    tx: &mut SplitSink<WebSocket, Message>,
    msg: Message,
    deadline: Instant,
    shutdown: &CancellationToken,
) -> bool {
    matches!(bounded(tx.feed(msg), deadline, shutdown).await, Some(Ok(())))
}

/// Send a normal Close frame; false when it could not be flushed.
async fn close(tx: &mut SplitSink<WebSocket, Message>) -> bool {
    let frame = CloseFrame {
        code: close_code::NORMAL,
        reason: Utf8Bytes::from_static(""),
    };
    matches!(
        timeout(CLOSE_TIMEOUT, tx.send(Message::Close(Some(frame)))).await,
        Ok(Ok(()))
    )
}

async fn drain(mut rx: SplitStream<WebSocket>) {
    while let Some(Ok(msg)) = rx.next().await {
        if matches!(msg, Message::Close(_)) {
            break;
        }
    }
}
