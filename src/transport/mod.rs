//! Transport layer
//!
//! Unified stream types plus the pieces the control plane dials through:
//! TLS (self-signed server side, verification-free client side), WebSocket
//! framing, KCP, and the prefix-replay stream used by the connection muxer.

pub mod kcp;
pub mod tls;
pub mod ws;

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

use crate::compress::SnappyStream;
use crate::crypto::CryptoStream;

/// Unified stream trait for everything a tunnel can run over
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Owned, type-erased transport stream
pub type BoxedStream = Pin<Box<dyn AsyncStream>>;

/// Box a concrete stream
pub fn boxed<S: AsyncStream + 'static>(stream: S) -> BoxedStream {
    Box::pin(stream)
}

/// Apply the optional work-connection layers, outermost first: compression,
/// then encryption. Both peers must wrap symmetrically.
pub async fn apply_layers(
    stream: BoxedStream,
    use_encryption: bool,
    use_compression: bool,
    secret: &[u8],
) -> io::Result<BoxedStream> {
    let mut stream = stream;
    if use_encryption {
        stream = boxed(CryptoStream::handshake(stream, secret).await?);
    }
    if use_compression {
        stream = boxed(SnappyStream::new(stream));
    }
    Ok(stream)
}

pin_project! {
    /// Stream that replays bytes consumed while sniffing a connection's
    /// protocol before handing it to the selected listener.
    pub struct PrefixedStream<S> {
        #[pin]
        inner: S,
        prefix: Bytes,
    }
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { inner, prefix }
    }

    pub fn into_parts(self) -> (Bytes, S) {
        (self.prefix, self.inner)
    }
}

impl<S: AsyncRead> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            let _ = this.prefix.split_to(n);
            return Poll::Ready(Ok(()));
        }
        this.inner.poll_read(cx, buf)
    }
}

impl<S: AsyncWrite> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// Dial a TCP endpoint, optionally through an HTTP proxy with CONNECT.
pub async fn connect_tcp(target: &str, http_proxy: Option<&str>) -> io::Result<TcpStream> {
    let stream = match http_proxy {
        None => TcpStream::connect(target).await?,
        Some(proxy) => {
            let mut stream = TcpStream::connect(proxy).await?;
            let request = format!(
                "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nUser-Agent: portway\r\n\r\n"
            );
            stream.write_all(request.as_bytes()).await?;
            read_connect_response(&mut stream).await?;
            stream
        }
    };
    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Read an HTTP CONNECT response head and require a 2xx status.
async fn read_connect_response(stream: &mut TcpStream) -> io::Result<()> {
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > 8 * 1024 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "oversized CONNECT response",
            ));
        }
        stream.read_exact(&mut byte).await?;
        head.push(byte[0]);
    }
    let line = head.split(|&b| b == b'\r').next().unwrap_or_default();
    let line = String::from_utf8_lossy(line);
    let status = line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(0);
    if !(200..300).contains(&status) {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("HTTP proxy CONNECT failed: {}", line),
        ));
    }
    Ok(())
}
