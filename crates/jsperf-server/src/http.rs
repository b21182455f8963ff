//! `GET`/`PUT /api/{size}` over HTTP/1.1 and HTTP/2.
//!
//! Downloads stream `size` synthetic bytes, uploads read and discard at most
//! `size` bytes. Both honour a single byte range so the split dispatcher can
//! address partitions of one logical transfer.

use std::io;
use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, Version, header},
    response::{IntoResponse, Response},
    routing::get,
};
use futures_util::TryStreamExt;
use jsperf_core::{
    ByteRange, CHUNK_SIZE, ConnInfo, Direction, Extent, MeasurementEndpoint, Metered, Partition,
    Payload, Protocol, RangeError, SizeError, SplitPolicy, StreamCount, TransferLogger,
    TransferRequest,
};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, warn};

/// Shared state of the HTTP measurement routes.
#[derive(Clone)]
pub struct HttpEndpoint {
    pub logger: Arc<dyn TransferLogger>,
    pub max_size: Option<u64>,
    pub split: SplitPolicy,
    /// Stream count used by `/api/split/{size}` when the query has none.
    pub streams: StreamCount,
}

impl MeasurementEndpoint for HttpEndpoint {
    fn logger(&self) -> &Arc<dyn TransferLogger> {
        &self.logger
    }

    fn size_limit(&self) -> Option<u64> {
        self.max_size
    }
}

pub fn router(endpoint: HttpEndpoint) -> Router {
    Router::new()
        .route("/api/{size}", get(download).put(upload))
        .route("/api/split/{size}", get(split_plan))
        .layer(DefaultBodyLimit::disable())
        .with_state(endpoint)
}

// ── Errors ──────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Size(#[from] SizeError),
    #[error("range not satisfiable for {size} bytes")]
    Unsatisfiable { size: u64 },
    #[error("bad content-range: {0}")]
    ContentRange(RangeError),
    #[error("bad stream count: {0}")]
    Streams(String),
    #[error("request body failed: {0}")]
    Body(#[source] io::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Size(SizeError::TooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE.into_response(),
            Self::Size(_) | Self::ContentRange(_) | Self::Streams(_) | Self::Body(_) => {
                StatusCode::BAD_REQUEST.into_response()
            }
            Self::Unsatisfiable { size } => (
                StatusCode::RANGE_NOT_SATISFIABLE,
                [(header::CONTENT_RANGE, format!("bytes */{}", size))],
            )
                .into_response(),
        }
    }
}

fn protocol_of(version: Version) -> Protocol {
    if version == Version::HTTP_2 {
        Protocol::Http2
    } else {
        Protocol::Http1
    }
}

// ── Handlers ────────────────────────────────────────────────────────────

/// GET /api/{size}: stream `size` synthetic bytes (or the requested range).
pub async fn download(
    State(ep): State<HttpEndpoint>,
    Extension(conn): Extension<ConnInfo>,
    Path(size): Path<String>,
    version: Version,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let size = ep.validate_size(&size).inspect_err(|e| {
        debug!(conn = conn.id, "rejected download: {}", e);
    })?;

    let range = match headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        None => None,
        Some(value) => match ByteRange::parse_range(value, size) {
            Ok(range) => Some(range),
            Err(RangeError::Unsatisfiable { size }) => return Err(ApiError::Unsatisfiable { size }),
            // A malformed Range is ignored and the whole resource served.
            Err(RangeError::Malformed(_)) => None,
        },
    };

    let request = TransferRequest {
        extent: Extent::Bytes(size),
        direction: Direction::Download,
        protocol: protocol_of(version),
    };
    let meter = ep.begin(request, &conn, range);
    let len = range.map_or(size, |r| r.len);

    let reader = Metered::new(Payload.bounded(len), meter);
    let body = Body::from_stream(ReaderStream::with_capacity(reader, CHUNK_SIZE));

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    match range {
        Some(range) => {
            // Digits, spaces and punctuation only.
            if let Ok(value) = HeaderValue::try_from(range.content_range(size)) {
                response_headers.insert(header::CONTENT_RANGE, value);
            }
            Ok((StatusCode::PARTIAL_CONTENT, response_headers, body).into_response())
        }
        None => Ok((StatusCode::OK, response_headers, body).into_response()),
    }
}

/// PUT /api/{size}: read and discard the body, at most `size` bytes.
pub async fn upload(
    State(ep): State<HttpEndpoint>,
    Extension(conn): Extension<ConnInfo>,
    Path(size): Path<String>,
    version: Version,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode, ApiError> {
    let size = ep.validate_size(&size).inspect_err(|e| {
        debug!(conn = conn.id, "rejected upload: {}", e);
    })?;

    let range = headers
        .get(header::CONTENT_RANGE)
        .map(|v| {
            let value = v
                .to_str()
                .map_err(|_| RangeError::Malformed("<non-ascii>".to_string()))?;
            ByteRange::parse_content_range(value, size)
        })
        .transpose()
        .map_err(ApiError::ContentRange)?;
    let expected = range.map_or(size, |r| r.len);

    let request = TransferRequest {
        extent: Extent::Bytes(size),
        direction: Direction::Upload,
        protocol: protocol_of(version),
    };
    let meter = ep.begin(request, &conn, range);

    let stream = body.into_data_stream().map_err(io::Error::other);
    let mut reader = Metered::new(StreamReader::new(stream).take(expected), meter);

    match tokio::io::copy_buf(&mut reader, &mut tokio::io::sink()).await {
        Ok(_) => Ok(StatusCode::NO_CONTENT),
        Err(e) => {
            warn!(
                conn = conn.id,
                bytes = reader.meter().bytes(),
                "upload body failed: {}",
                e
            );
            Err(ApiError::Body(e))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PlanQuery {
    pub streams: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SplitPlan {
    pub size: u64,
    pub streams: u32,
    pub partitions: Vec<Partition>,
}

/// GET /api/split/{size}: the partition plan for a transfer of `size` bytes.
pub async fn split_plan(
    State(ep): State<HttpEndpoint>,
    Path(size): Path<String>,
    Query(query): Query<PlanQuery>,
) -> Result<Json<SplitPlan>, ApiError> {
    let size = ep.validate_size(&size)?;
    let mode = match query.streams.as_deref() {
        None => ep.streams,
        Some(raw) => raw
            .parse::<StreamCount>()
            .map_err(|e| ApiError::Streams(e.to_string()))?,
    };
    let partitions = ep.split.plan(size, mode);
    Ok(Json(SplitPlan {
        size,
        streams: partitions.len() as u32,
        partitions,
    }))
}
