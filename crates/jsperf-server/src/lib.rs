//! TLS measurement servers for HTTP/1.1, HTTP/2 and ndt7.
//!
//! The binary wires these pieces together; tests drive them directly with
//! an in-memory logger and a plain TCP or in-process transport. Paths other
//! than the measurement routes answer 404.

pub mod config;
pub mod http;
pub mod listener;
pub mod ndt7;
pub mod tls;

use std::sync::Arc;

use axum::Router;
use axum::http::{Method, header};
use jsperf_core::TransferLogger;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::{Cli, Mode, ServerConfig};
pub use http::HttpEndpoint;
pub use listener::{ConnLease, ConnOptions, Server, serve_connection};
pub use ndt7::Ndt7Endpoint;

/// Build the router for `config.mode`.
pub fn app(config: &ServerConfig, logger: Arc<dyn TransferLogger>) -> Router {
    let router = match config.mode {
        Mode::Http1 | Mode::Http2 => http::router(HttpEndpoint {
            logger,
            max_size: config.max_size,
            split: config.split,
            streams: config.streams,
        }),
        Mode::Ndt7 => ndt7::router(Ndt7Endpoint {
            logger,
            window: config.ndt7_window,
        }),
    };

    // Browser test pages may be served from another origin.
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([Method::GET, Method::PUT, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::RANGE, header::CONTENT_RANGE])
        .expose_headers([header::CONTENT_LENGTH, header::CONTENT_RANGE])
        .allow_credentials(false);

    router.layer(cors).layer(TraceLayer::new_for_http())
}

/// Connection settings for `config`.
pub fn conn_options(config: &ServerConfig) -> ConnOptions {
    ConnOptions {
        h2_window: config.h2_window,
        drain_timeout: config.drain_timeout,
    }
}
