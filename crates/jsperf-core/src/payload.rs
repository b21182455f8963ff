//! Synthetic payload source for downloads.
//!
//! The content is a constant filler byte: only byte counts and timing matter
//! to the benchmark, so generation must cost nothing and never touch disk.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf, Take};

/// Largest slice a single read hands out (1 MiB).
pub const CHUNK_SIZE: usize = 1 << 20;

/// Filler byte used for every synthetic byte.
pub const FILL_BYTE: u8 = 0x00;

static FILL: [u8; CHUNK_SIZE] = [FILL_BYTE; CHUNK_SIZE];

/// Infinite, deterministic byte source.
///
/// Reads never block and never report end-of-stream; bounding a transfer
/// to its requested size is the caller's job (see [`Payload::bounded`]).
/// Being zero-sized and `Copy`, one instance can be shared freely between
/// concurrent downloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct Payload;

impl Payload {
    /// Limit the source to exactly `len` bytes.
    pub fn bounded(self, len: u64) -> Take<Payload> {
        AsyncReadExt::take(self, len)
    }

    /// Build one contiguous message of `len` synthetic bytes.
    ///
    /// Messages up to [`CHUNK_SIZE`] borrow the static buffer; larger ones
    /// are assembled once and can be cloned cheaply afterwards.
    pub fn message(len: usize) -> Bytes {
        if len <= CHUNK_SIZE {
            return Bytes::from_static(&FILL[..len]);
        }
        let mut buf = BytesMut::with_capacity(len);
        while buf.len() < len {
            let n = (len - buf.len()).min(CHUNK_SIZE);
            buf.extend_from_slice(&FILL[..n]);
        }
        buf.freeze()
    }

    fn fill(dst: &mut [u8]) -> usize {
        let n = dst.len().min(CHUNK_SIZE);
        dst[..n].copy_from_slice(&FILL[..n]);
        n
    }
}

impl io::Read for Payload {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(Self::fill(buf))
    }
}

impl AsyncRead for Payload {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let n = buf.remaining().min(CHUNK_SIZE);
        buf.put_slice(&FILL[..n]);
        Poll::Ready(Ok(()))
    }
}
