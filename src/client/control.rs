//! Client control session
//!
//! Mirrors the server's three fibers: reader, writer, dispatcher. The
//! dispatcher sends `Ping` on the configured interval, watches the `Pong`
//! deadline, supplies work connections on `ReqWorkConn`, and surfaces
//! `NewProxyResp` verdicts to the proxy manager.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::codec;
use crate::config::ClientConfig;
use crate::error::Error;
use crate::logger::log;
use crate::msg::{Message, NewWorkConn, Ping};
use crate::transport::BoxedStream;

use super::proxy::ProxyManager;
use super::Transporter;

const MESSAGE_QUEUE: usize = 100;

pub struct ClientControl {
    config: Arc<ClientConfig>,
    pub run_id: String,
    server_udp_addr: Option<SocketAddr>,
    transporter: Arc<Transporter>,
    proxy_manager: Arc<ProxyManager>,
    send_tx: mpsc::Sender<Message>,
    last_pong: Mutex<Instant>,
    shutdown: CancellationToken,
    closed: CancellationToken,
}

impl ClientControl {
    pub fn new(
        config: Arc<ClientConfig>,
        run_id: String,
        server_udp_addr: Option<SocketAddr>,
        transporter: Arc<Transporter>,
        proxy_manager: Arc<ProxyManager>,
        send_tx: mpsc::Sender<Message>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            run_id,
            server_udp_addr,
            transporter,
            proxy_manager,
            send_tx,
            last_pong: Mutex::new(Instant::now()),
            shutdown: CancellationToken::new(),
            closed: CancellationToken::new(),
        })
    }

    /// Start the session fibers over an already logged-in control stream.
    pub fn start(self: &Arc<Self>, stream: BoxedStream, send_rx: mpsc::Receiver<Message>) {
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let (msg_tx, msg_rx) = mpsc::channel::<Message>(MESSAGE_QUEUE);

        let reader_ctl = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match codec::read_message(&mut read_half).await {
                    Ok(msg) => {
                        if msg_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                        log::debug!("control connection EOF");
                        break;
                    }
                    Err(e) => {
                        log::warn!(error = %e, "control read error");
                        break;
                    }
                }
            }
            reader_ctl.shutdown.cancel();
        });

        let writer_ctl = Arc::clone(self);
        let mut send_rx = send_rx;
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    msg = send_rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                    _ = writer_ctl.shutdown.cancelled() => break,
                };
                if let Err(e) = codec::write_message(&mut write_half, &msg).await {
                    log::warn!(error = %e, "control write error");
                    break;
                }
            }
            writer_ctl.shutdown.cancel();
        });

        let dispatcher_ctl = Arc::clone(self);
        tokio::spawn(async move { dispatcher_ctl.dispatch(msg_rx).await });

        let supervisor_ctl = Arc::clone(self);
        tokio::spawn(async move {
            supervisor_ctl.shutdown.cancelled().await;
            supervisor_ctl.closed.cancel();
        });
    }

    async fn dispatch(self: Arc<Self>, mut msg_rx: mpsc::Receiver<Message>) {
        let mut ping_ticker = tokio::time::interval(self.config.heartbeat_interval);
        let mut check_ticker = tokio::time::interval(Duration::from_secs(1));
        *self.last_pong.lock().expect("last pong lock poisoned") = Instant::now();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ping_ticker.tick() => {
                    let _ = self.send_tx.send(Message::Ping(Ping {})).await;
                }
                _ = check_ticker.tick() => {
                    let idle = self.last_pong.lock().expect("last pong lock poisoned").elapsed();
                    if idle > self.config.heartbeat_timeout {
                        log::warn!(idle_secs = idle.as_secs(), "server heartbeat timeout");
                        self.shutdown.cancel();
                        return;
                    }
                }
                msg = msg_rx.recv() => {
                    let Some(msg) = msg else { return };
                    self.handle_message(msg).await;
                }
            }
        }
    }

    async fn handle_message(self: &Arc<Self>, msg: Message) {
        match msg {
            Message::ReqWorkConn(_) => {
                let ctl = Arc::clone(self);
                tokio::spawn(async move { ctl.supply_work_conn().await });
            }
            Message::NewProxyResp(resp) => {
                self.proxy_manager
                    .on_proxy_resp(&resp.proxy_name, &resp.remote_addr, &resp.error)
                    .await;
            }
            Message::Pong(_) => {
                *self.last_pong.lock().expect("last pong lock poisoned") = Instant::now();
            }
            other => {
                log::debug!(msg = other.name(), "ignoring unexpected control message");
            }
        }
    }

    /// Dial one work connection and park it until the server starts a user
    /// session on it.
    async fn supply_work_conn(self: Arc<Self>) {
        let mut conn = match self.transporter.open().await {
            Ok(conn) => conn,
            Err(e) => {
                log::warn!(error = %e, "cannot dial work connection");
                return;
            }
        };

        let hello = Message::NewWorkConn(NewWorkConn {
            run_id: self.run_id.clone(),
        });
        if let Err(e) = codec::write_message(&mut conn, &hello).await {
            log::warn!(error = %e, "work connection handshake failed");
            return;
        }

        // The connection may sit warm in the server pool; only the session
        // shutdown bounds the wait for StartWorkConn.
        let start = tokio::select! {
            msg = codec::read_message(&mut conn) => msg,
            _ = self.shutdown.cancelled() => return,
        };
        let start = match start {
            Ok(Message::StartWorkConn(start)) => start,
            Ok(other) => {
                log::warn!(msg = other.name(), "unexpected message on work connection");
                return;
            }
            Err(e) => {
                log::debug!(error = %e, "work connection closed before start");
                return;
            }
        };
        if !start.error.is_empty() {
            log::warn!(error = %start.error, "server refused work connection");
            return;
        }

        self.proxy_manager
            .handle_work_conn(start, conn, self.server_udp_addr)
            .await;
    }

    pub fn start_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn wait_closed(&self) {
        self.closed.cancelled().await;
    }
}
