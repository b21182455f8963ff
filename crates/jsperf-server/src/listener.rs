//! TLS accept loop.
//!
//! One task per connection. Each connection records `conn new` with the
//! negotiated ALPN once the handshake is done and `conn closed` when the last
//! [`ConnLease`] goes away: either hyper is finished with it, or a WebSocket
//! session that took the connection over has ended. A cancelled shutdown
//! token stops accepting, asks every live connection and upgraded session to
//! shut down and waits at most the drain timeout.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Body;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use jsperf_core::{ConnInfo, MeasurementEvent, TransferLogger};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tower::Service;
use tracing::{debug, info, warn};

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Per-connection HTTP settings.
#[derive(Debug, Clone, Copy)]
pub struct ConnOptions {
    /// HTTP/2 stream and connection window; `None` keeps hyper's defaults.
    pub h2_window: Option<u32>,
    pub drain_timeout: Duration,
}

impl Default for ConnOptions {
    fn default() -> Self {
        Self {
            h2_window: None,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl ConnOptions {
    /// hyper builder serving HTTP/1.1 and HTTP/2 with these settings.
    pub fn builder(&self) -> Builder<TokioExecutor> {
        let mut builder = Builder::new(TokioExecutor::new());
        if let Some(window) = self.h2_window {
            builder
                .http2()
                .initial_stream_window_size(window)
                .initial_connection_window_size(window)
                .max_frame_size((1 << 24) - 1); // protocol maximum
        }
        builder
    }
}

/// Shared handle on one accepted connection.
///
/// Every request on the connection carries a clone in its extensions.
/// Upgraded sessions keep theirs until they finish, so `conn closed` is
/// logged after their last request event and the server's drain waits for
/// them.
#[derive(Clone)]
pub struct ConnLease(Arc<Lease>);

struct Lease {
    conn: ConnInfo,
    logger: Arc<dyn TransferLogger>,
    shutdown: CancellationToken,
    opened: Instant,
    _task: Option<TaskTrackerToken>,
}

impl ConnLease {
    fn open(
        conn: ConnInfo,
        logger: Arc<dyn TransferLogger>,
        shutdown: CancellationToken,
        task: Option<TaskTrackerToken>,
    ) -> Self {
        logger.log(MeasurementEvent::ConnNew(conn.clone()));
        Self(Arc::new(Lease {
            conn,
            logger,
            shutdown,
            opened: Instant::now(),
            _task: task,
        }))
    }

    pub fn conn(&self) -> &ConnInfo {
        &self.0.conn
    }

    /// Cancelled when the server starts shutting down.
    pub fn shutdown(&self) -> &CancellationToken {
        &self.0.shutdown
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.logger.log(MeasurementEvent::ConnClosed {
            conn: self.conn.clone(),
            lifetime: self.opened.elapsed(),
        });
    }
}

/// A bound listener plus everything needed to serve it.
pub struct Server {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    app: Router,
    logger: Arc<dyn TransferLogger>,
    options: ConnOptions,
}

impl Server {
    pub fn new(
        listener: TcpListener,
        tls: Arc<rustls::ServerConfig>,
        app: Router,
        logger: Arc<dyn TransferLogger>,
        options: ConnOptions,
    ) -> Self {
        Self {
            listener,
            acceptor: TlsAcceptor::from(tls),
            app,
            logger,
            options,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` is cancelled, then drain.
    pub async fn run(self, shutdown: CancellationToken) -> io::Result<()> {
        let local = self.listener.local_addr()?;
        let builder = self.options.builder();
        let tracker = TaskTracker::new();
        let mut next_id: u64 = 0;

        loop {
            let (tcp, remote) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("accept error: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };
            next_id += 1;
            let id = next_id;

            let acceptor = self.acceptor.clone();
            let app = self.app.clone();
            let builder = builder.clone();
            let logger = self.logger.clone();
            let shutdown = shutdown.clone();
            let drain = self.options.drain_timeout;
            let task = tracker.token();

            tracker.spawn(async move {
                let tls = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    res = acceptor.accept(tcp) => match res {
                        Ok(tls) => tls,
                        Err(e) => {
                            logger.log(MeasurementEvent::HandshakeFailed {
                                remote,
                                message: e.to_string(),
                            });
                            return;
                        }
                    },
                };
                let conn = ConnInfo::new(id, remote, local, tls.get_ref().1.alpn_protocol());
                let lease = ConnLease::open(conn, logger.clone(), shutdown, Some(task));
                serve_leased(tls, lease, app, builder, logger, drain).await;
            });
        }

        info!("listener closed, draining {} connections", tracker.len());
        tracker.close();
        if tokio::time::timeout(self.options.drain_timeout, tracker.wait())
            .await
            .is_err()
        {
            warn!("drain timeout elapsed with {} connections still open", tracker.len());
        }
        Ok(())
    }
}

/// Serve HTTP on an established connection.
///
/// Requests reach `app` with the connection's [`ConnInfo`] and
/// [`ConnLease`] in their extensions. WebSocket upgrades are supported.
pub async fn serve_connection<IO>(
    io: IO,
    conn: ConnInfo,
    app: Router,
    builder: Builder<TokioExecutor>,
    logger: Arc<dyn TransferLogger>,
    shutdown: CancellationToken,
    drain: Duration,
) where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let lease = ConnLease::open(conn, logger.clone(), shutdown, None);
    serve_leased(io, lease, app, builder, logger, drain).await;
}

async fn serve_leased<IO>(
    io: IO,
    lease: ConnLease,
    app: Router,
    builder: Builder<TokioExecutor>,
    logger: Arc<dyn TransferLogger>,
    drain: Duration,
) where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let conn = lease.conn().clone();
    let shutdown = lease.shutdown().clone();

    let held = lease.clone();
    let service = hyper::service::service_fn(move |mut req: hyper::Request<Incoming>| {
        let mut app = app.clone();
        req.extensions_mut().insert(held.conn().clone());
        req.extensions_mut().insert(held.clone());
        async move { app.call(req.map(Body::new)).await }
    });

    let serving = builder.serve_connection_with_upgrades(TokioIo::new(io), service);
    tokio::pin!(serving);

    let result = tokio::select! {
        res = serving.as_mut() => res,
        _ = shutdown.cancelled() => {
            serving.as_mut().graceful_shutdown();
            match tokio::time::timeout(drain, serving.as_mut()).await {
                Ok(res) => res,
                Err(_) => {
                    debug!(conn = conn.id, "connection did not drain in time");
                    Ok(())
                }
            }
        }
    };

    if let Err(e) = result {
        logger.log(MeasurementEvent::ConnError {
            conn,
            message: e.to_string(),
        });
    }
    // `conn closed` is logged here unless an upgraded session still holds
    // the lease.
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsperf_core::MemoryLogger;

    fn closes(logger: &MemoryLogger) -> usize {
        logger
            .events()
            .iter()
            .filter(|e| matches!(e, MeasurementEvent::ConnClosed { .. }))
            .count()
    }

    #[tokio::test]
    async fn lease_closes_once_after_the_last_holder() {
        let logger = Arc::new(MemoryLogger::default());
        let conn = ConnInfo::new(
            1,
            "127.0.0.1:5000".parse().unwrap(),
            "127.0.0.1:4443".parse().unwrap(),
            None,
        );
        let tracker = TaskTracker::new();
        let lease = ConnLease::open(
            conn,
            logger.clone(),
            CancellationToken::new(),
            Some(tracker.token()),
        );
        let session = lease.clone();
        tracker.close();

        drop(lease);
        assert_eq!(closes(&logger), 0);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), tracker.wait())
                .await
                .is_err()
        );

        drop(session);
        assert_eq!(closes(&logger), 1);
        tokio::time::timeout(Duration::from_secs(1), tracker.wait())
            .await
            .unwrap();
        assert!(matches!(logger.events()[0], MeasurementEvent::ConnNew(_)));
    }
}
