//! Byte and wall-clock accounting for a single transfer.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::Stream;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, ReadBuf};

/// Final numbers of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferStats {
    pub bytes: u64,
    pub elapsed: Duration,
}

impl TransferStats {
    /// Average throughput in bits per second (0 when nothing elapsed).
    pub fn bits_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes as f64 * 8.0 / secs
    }
}

type Completion = Box<dyn FnOnce(TransferStats) + Send>;

/// Counts bytes and measures time from first use to close.
///
/// A meter is closed either explicitly with [`Meter::finish`] or by being
/// dropped; the completion callback runs exactly once either way, so an
/// aborted transfer (client gone, future cancelled, handler unwinding) still
/// reports the bytes that really moved.
#[derive(Default)]
pub struct Meter {
    bytes: u64,
    started: Option<Instant>,
    on_close: Option<Completion>,
}

impl Meter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Meter that hands its final stats to `f` when closed.
    pub fn on_close(f: impl FnOnce(TransferStats) + Send + 'static) -> Self {
        Self {
            bytes: 0,
            started: None,
            on_close: Some(Box::new(f)),
        }
    }

    /// Start the clock if it is not running yet.
    #[inline]
    pub fn touch(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    #[inline]
    pub fn add(&mut self, n: u64) {
        self.touch();
        self.bytes += n;
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn elapsed(&self) -> Duration {
        self.started.map(|t| t.elapsed()).unwrap_or_default()
    }

    pub fn stats(&self) -> TransferStats {
        TransferStats {
            bytes: self.bytes,
            elapsed: self.elapsed(),
        }
    }

    /// Close the meter now and return its final stats.
    pub fn finish(mut self) -> TransferStats {
        let stats = self.stats();
        if let Some(f) = self.on_close.take() {
            f(stats);
        }
        stats
    }
}

impl Drop for Meter {
    fn drop(&mut self) {
        if let Some(f) = self.on_close.take() {
            f(self.stats());
        }
    }
}

impl fmt::Debug for Meter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Meter")
            .field("bytes", &self.bytes)
            .field("started", &self.started)
            .field("closed", &self.on_close.is_none())
            .finish()
    }
}

/// Transparent proxy that feeds a [`Meter`] with every byte passing through.
///
/// Works on the read side (`AsyncRead`, `AsyncBufRead`, byte `Stream`) and
/// the write side (`AsyncWrite`). Data is never modified or buffered here,
/// and errors from the inner stream are returned untouched.
#[derive(Debug)]
pub struct Metered<T> {
    inner: T,
    meter: Meter,
}

impl<T> Metered<T> {
    pub fn new(inner: T, meter: Meter) -> Self {
        Self { inner, meter }
    }

    pub fn meter(&self) -> &Meter {
        &self.meter
    }

    pub fn into_parts(self) -> (T, Meter) {
        (self.inner, self.meter)
    }

    /// Drop the inner stream and close the meter.
    pub fn finish(self) -> TransferStats {
        self.meter.finish()
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Metered<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.meter.touch();
        let before = buf.filled().len();
        let res = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            this.meter.add((buf.filled().len() - before) as u64);
        }
        res
    }
}

impl<T: AsyncBufRead + Unpin> AsyncBufRead for Metered<T> {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        let this = self.get_mut();
        this.meter.touch();
        Pin::new(&mut this.inner).poll_fill_buf(cx)
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        let this = self.get_mut();
        this.meter.add(amt as u64);
        Pin::new(&mut this.inner).consume(amt);
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Metered<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.meter.touch();
        let res = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = res {
            this.meter.add(n as u64);
        }
        res
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<T, E> Stream for Metered<T>
where
    T: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.meter.touch();
        let res = Pin::new(&mut this.inner).poll_next(cx);
        if let Poll::Ready(Some(Ok(chunk))) = &res {
            this.meter.add(chunk.len() as u64);
        }
        res
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
