//! Snappy-framed compression layer
//!
//! Each write chunk becomes one frame: a big-endian u32 compressed length
//! followed by the snappy block. Chunks are capped at 64 KiB of plaintext so
//! frames stay bounded in both directions.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const MAX_PLAIN_CHUNK: usize = 64 * 1024;

fn max_frame_len() -> usize {
    snap::raw::max_compress_len(MAX_PLAIN_CHUNK)
}

pin_project! {
    /// Transport wrapper compressing writes and decompressing reads.
    pub struct SnappyStream<S> {
        #[pin]
        inner: S,
        encoder: snap::raw::Encoder,
        decoder: snap::raw::Decoder,
        // outgoing frame not yet fully written, and the plaintext bytes it covers
        write_pending: BytesMut,
        write_pending_plain: usize,
        // raw bytes read but not yet forming a complete frame
        read_raw: BytesMut,
        // decompressed bytes ready to hand to the caller
        read_ready: BytesMut,
    }
}

impl<S> SnappyStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            encoder: snap::raw::Encoder::new(),
            decoder: snap::raw::Decoder::new(),
            write_pending: BytesMut::new(),
            write_pending_plain: 0,
            read_raw: BytesMut::with_capacity(8 * 1024),
            read_ready: BytesMut::new(),
        }
    }
}

impl<S: AsyncRead> AsyncRead for SnappyStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();

        loop {
            // Serve already-decompressed bytes first.
            if !this.read_ready.is_empty() {
                let n = this.read_ready.len().min(buf.remaining());
                buf.put_slice(&this.read_ready[..n]);
                this.read_ready.advance(n);
                return Poll::Ready(Ok(()));
            }

            // Decode as many complete frames as the raw buffer holds.
            let mut decoded_any = false;
            while this.read_raw.len() >= 4 {
                let frame_len =
                    u32::from_be_bytes([this.read_raw[0], this.read_raw[1], this.read_raw[2], this.read_raw[3]])
                        as usize;
                if frame_len == 0 || frame_len > max_frame_len() {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("compressed frame length {} out of range", frame_len),
                    )));
                }
                if this.read_raw.len() < 4 + frame_len {
                    break;
                }
                this.read_raw.advance(4);
                let block = this.read_raw.split_to(frame_len);
                let plain = this
                    .decoder
                    .decompress_vec(&block)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                this.read_ready.extend_from_slice(&plain);
                decoded_any = true;
            }
            if decoded_any {
                continue;
            }

            // Need more raw bytes.
            let mut chunk = [0u8; 8 * 1024];
            let mut chunk_buf = ReadBuf::new(&mut chunk);
            match this.inner.as_mut().poll_read(cx, &mut chunk_buf) {
                Poll::Ready(Ok(())) => {
                    let filled = chunk_buf.filled();
                    if filled.is_empty() {
                        // EOF: a partial frame means the peer died mid-write.
                        if this.read_raw.is_empty() {
                            return Poll::Ready(Ok(()));
                        }
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "EOF inside compressed frame",
                        )));
                    }
                    this.read_raw.extend_from_slice(filled);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S: AsyncWrite> AsyncWrite for SnappyStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut this = self.project();

        if this.write_pending.is_empty() {
            let chunk = &buf[..buf.len().min(MAX_PLAIN_CHUNK)];
            let block = this
                .encoder
                .compress_vec(chunk)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            this.write_pending
                .extend_from_slice(&(block.len() as u32).to_be_bytes());
            this.write_pending.extend_from_slice(&block);
            *this.write_pending_plain = chunk.len();
        }

        while !this.write_pending.is_empty() {
            let n = match this.inner.as_mut().poll_write(cx, this.write_pending) {
                Poll::Ready(Ok(n)) => n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            this.write_pending.advance(n);
        }

        Poll::Ready(Ok(std::mem::replace(this.write_pending_plain, 0)))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
