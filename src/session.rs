//! Stream multiplexing over one control transport
//!
//! When both sides enable `tcp_mux` the control connection carries a yamux
//! session and every work connection becomes a logical stream instead of a
//! fresh dial. A single driver task owns the yamux connection; stream opens
//! and accepts go through channels.

use std::collections::VecDeque;
use std::io;
use std::task::Poll;

use futures_util::future;
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};

use crate::logger::log;
use crate::transport::{boxed, AsyncStream, BoxedStream};

/// Ceiling on concurrently live logical streams per session
pub const MAX_STREAMS: usize = 256;

/// Queue depth for inbound streams not yet accepted
const ACCEPT_BACKLOG: usize = 64;

fn mux_config() -> yamux::Config {
    let mut config = yamux::Config::default();
    config.set_max_num_streams(MAX_STREAMS);
    config
}

type OpenRequest = oneshot::Sender<io::Result<BoxedStream>>;

/// Handle for opening outbound logical streams; clonable across tasks.
#[derive(Clone)]
pub struct MuxConnector {
    open_tx: mpsc::Sender<OpenRequest>,
}

impl MuxConnector {
    /// Open a new logical stream on the session.
    pub async fn open_stream(&self) -> io::Result<BoxedStream> {
        let (tx, rx) = oneshot::channel();
        self.open_tx
            .send(tx)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "mux session closed"))?;
        rx.await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "mux session closed"))?
    }
}

/// Handle for accepting inbound logical streams.
pub struct MuxAcceptor {
    incoming_rx: mpsc::Receiver<BoxedStream>,
}

impl MuxAcceptor {
    /// Wait for the peer to open a stream. `None` once the session died.
    pub async fn accept_stream(&mut self) -> Option<BoxedStream> {
        self.incoming_rx.recv().await
    }
}

/// Start a yamux session over `io` and spawn its driver task. The session
/// terminates on the first unrecoverable transport error; afterwards opens
/// fail and accepts return `None`.
pub fn spawn_session<S>(io: S, server_mode: bool) -> (MuxConnector, MuxAcceptor)
where
    S: AsyncStream + 'static,
{
    let mode = if server_mode {
        yamux::Mode::Server
    } else {
        yamux::Mode::Client
    };
    let mut connection = yamux::Connection::new(io.compat(), mux_config(), mode);

    let (open_tx, mut open_rx) = mpsc::channel::<OpenRequest>(16);
    let (incoming_tx, incoming_rx) = mpsc::channel::<BoxedStream>(ACCEPT_BACKLOG);

    tokio::spawn(async move {
        let mut pending_open: VecDeque<OpenRequest> = VecDeque::new();
        let mut open_requests_live = true;

        future::poll_fn(move |cx| {
            // Collect open requests queued by connectors.
            while open_requests_live {
                match open_rx.poll_recv(cx) {
                    Poll::Ready(Some(request)) => pending_open.push_back(request),
                    Poll::Ready(None) => {
                        open_requests_live = false;
                    }
                    Poll::Pending => break,
                }
            }

            // Progress outbound opens.
            while !pending_open.is_empty() {
                match connection.poll_new_outbound(cx) {
                    Poll::Ready(Ok(stream)) => {
                        let request = pending_open.pop_front().expect("checked non-empty");
                        let _ = request.send(Ok(boxed(stream.compat())));
                    }
                    Poll::Ready(Err(e)) => {
                        log::debug!(error = %e, "mux outbound open failed, closing session");
                        for request in pending_open.drain(..) {
                            let _ = request.send(Err(io::Error::new(
                                io::ErrorKind::BrokenPipe,
                                "mux session closed",
                            )));
                        }
                        return Poll::Ready(());
                    }
                    Poll::Pending => break,
                }
            }

            // Drive connection I/O and inbound streams.
            loop {
                match connection.poll_next_inbound(cx) {
                    Poll::Ready(Some(Ok(stream))) => {
                        if incoming_tx.try_send(boxed(stream.compat())).is_err() {
                            log::warn!("mux accept backlog full, dropping inbound stream");
                        }
                    }
                    Poll::Ready(Some(Err(e))) => {
                        log::debug!(error = %e, "mux session error");
                        return Poll::Ready(());
                    }
                    Poll::Ready(None) => {
                        log::debug!("mux session closed by peer");
                        return Poll::Ready(());
                    }
                    Poll::Pending => return Poll::Pending,
                }
            }
        })
        .await;
    });

    (MuxConnector { open_tx }, MuxAcceptor { incoming_rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_open_and_accept_one_stream() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client, _client_acceptor) = spawn_session(client_io, false);
        let (_server_conn, mut server_acceptor) = spawn_session(server_io, true);

        let server = tokio::spawn(async move {
            let mut stream = server_acceptor.accept_stream().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            stream.write_all(b"world").await.unwrap();
            stream.flush().await.unwrap();
        });

        let mut stream = client.open_stream().await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        stream.flush().await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_streams_are_independent() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client, _client_acceptor) = spawn_session(client_io, false);
        let (_server_conn, mut server_acceptor) = spawn_session(server_io, true);

        let server = tokio::spawn(async move {
            for _ in 0..3 {
                let mut stream = server_acceptor.accept_stream().await.unwrap();
                tokio::spawn(async move {
                    let mut buf = [0u8; 1];
                    stream.read_exact(&mut buf).await.unwrap();
                    stream.write_all(&[buf[0] + 1]).await.unwrap();
                    stream.flush().await.unwrap();
                });
            }
        });

        let mut streams = Vec::new();
        for i in 0..3u8 {
            let mut stream = client.open_stream().await.unwrap();
            stream.write_all(&[i * 10]).await.unwrap();
            stream.flush().await.unwrap();
            streams.push((i, stream));
        }
        for (i, mut stream) in streams {
            let mut buf = [0u8; 1];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf[0], i * 10 + 1);
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_open_fails_after_session_death() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client, _acceptor) = spawn_session(client_io, false);
        drop(server_io);

        // The driver may need a moment to observe the dead transport.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let result = client.open_stream().await;
        assert!(result.is_err());
    }
}
