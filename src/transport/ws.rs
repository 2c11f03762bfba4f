//! WebSocket transport
//!
//! Carries the framed control protocol over a WebSocket connection so the
//! tunnel can pass middleboxes that only speak HTTP. Binary frames only; the
//! adapter exposes the socket as a plain byte stream.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::{boxed, AsyncStream, BoxedStream};

/// Well-known tunnel path; the muxer sniffs for `GET /~!frp` to route
/// WebSocket control connections.
pub const WEBSOCKET_PATH: &str = "/~!frp";

fn ws_err(e: tokio_tungstenite::tungstenite::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

/// Byte-stream adapter over a WebSocket connection
pub struct WsByteStream<S> {
    ws: WebSocketStream<S>,
    read_buffer: Vec<u8>,
    read_pos: usize,
    closed: bool,
}

impl<S> WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(ws: WebSocketStream<S>) -> Self {
        Self {
            ws,
            read_buffer: Vec::new(),
            read_pos: 0,
            closed: false,
        }
    }
}

impl<S> AsyncRead for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if self.closed {
                return Poll::Ready(Ok(()));
            }

            if self.read_pos < self.read_buffer.len() {
                let remaining = &self.read_buffer[self.read_pos..];
                let n = remaining.len().min(buf.remaining());
                buf.put_slice(&remaining[..n]);
                self.read_pos += n;
                if self.read_pos >= self.read_buffer.len() {
                    self.read_buffer.clear();
                    self.read_pos = 0;
                }
                return Poll::Ready(Ok(()));
            }

            match Stream::poll_next(Pin::new(&mut self.ws), cx) {
                Poll::Ready(Some(Ok(Message::Binary(data)))) => {
                    let n = data.len().min(buf.remaining());
                    buf.put_slice(&data[..n]);
                    if n < data.len() {
                        self.read_buffer = data[n..].to_vec();
                        self.read_pos = 0;
                    }
                    return Poll::Ready(Ok(()));
                }
                // Control frames are handled by tungstenite itself; skip.
                Poll::Ready(Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Text(_)))) => {
                    continue;
                }
                Poll::Ready(Some(Ok(Message::Close(_)))) | Poll::Ready(None) => {
                    self.closed = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Ok(Message::Frame(_)))) => continue,
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(ws_err(e))),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> AsyncWrite for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Sink::poll_ready(Pin::new(&mut self.ws), cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(ws_err(e))),
            Poll::Pending => return Poll::Pending,
        }
        Sink::start_send(Pin::new(&mut self.ws), Message::Binary(buf.to_vec()))
            .map_err(ws_err)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Sink::poll_flush(Pin::new(&mut self.ws), cx).map_err(ws_err)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Sink::poll_close(Pin::new(&mut self.ws), cx).map_err(ws_err)
    }
}

/// Server side: run the WebSocket handshake on a connection the muxer already
/// classified, rejecting paths other than [`WEBSOCKET_PATH`].
pub async fn accept_websocket<S>(stream: S) -> io::Result<BoxedStream>
where
    S: AsyncStream + 'static,
{
    let check_path = |req: &Request, resp: Response| {
        if req.uri().path() == WEBSOCKET_PATH {
            Ok(resp)
        } else {
            let reject = Response::builder()
                .status(404)
                .body(Some("no such tunnel endpoint".to_string()))
                .expect("static response");
            Err(reject)
        }
    };
    let ws = tokio_tungstenite::accept_hdr_async(stream, check_path)
        .await
        .map_err(ws_err)?;
    Ok(boxed(WsByteStream::new(ws)))
}

/// Client side: upgrade an established TCP stream to the tunnel WebSocket.
pub async fn connect_websocket<S>(stream: S, host: &str) -> io::Result<BoxedStream>
where
    S: AsyncStream + 'static,
{
    let url = format!("ws://{}{}", host, WEBSOCKET_PATH);
    let (ws, _resp) = tokio_tungstenite::client_async(url, stream)
        .await
        .map_err(ws_err)?;
    Ok(boxed(WsByteStream::new(ws)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_websocket_byte_stream_roundtrip() {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);

        let server = tokio::spawn(async move {
            let mut stream = accept_websocket(server_io).await.unwrap();
            let mut buf = [0u8; 12];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"framed bytes");
            stream.write_all(b"echoed").await.unwrap();
            stream.flush().await.unwrap();
        });

        let mut stream = connect_websocket(client_io, "127.0.0.1:7000").await.unwrap();
        stream.write_all(b"framed bytes").await.unwrap();
        stream.flush().await.unwrap();
        let mut buf = [0u8; 6];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"echoed");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_path_rejected() {
        let (mut client_io, server_io) = tokio::io::duplex(16 * 1024);

        let server = tokio::spawn(async move { accept_websocket(server_io).await });

        let request = "GET /other HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\n\
                       Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                       Sec-WebSocket-Version: 13\r\n\r\n";
        client_io.write_all(request.as_bytes()).await.unwrap();
        let result = server.await.unwrap();
        assert!(result.is_err());
    }
}
