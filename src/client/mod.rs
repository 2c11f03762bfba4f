//! Client service
//!
//! Dials the server over the configured protocol, logs in, keeps the
//! control session alive, and reconnects with capped exponential backoff
//! when it drops. Proxy declarations, visitors and health checkers are
//! restarted per session.

pub mod control;
pub mod health;
pub mod proxy;
pub mod visitor;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::lookup_host;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::codec;
use crate::config::{ClientConfig, Protocol, ProxyConf, VisitorConf};
use crate::crypto::auth_key;
use crate::error::{Error, Result};
use crate::logger::log;
use crate::msg::{Login, Message};
use crate::session::{self, MuxConnector};
use crate::transport::{boxed, connect_tcp, kcp, tls, ws, BoxedStream};
use crate::version;

use control::ClientControl;
use proxy::ProxyManager;

/// Deadline for the server's `LoginResp`
const LOGIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Reconnect backoff bounds: 1s doubling up to 60s
const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Dials connections to the server, going through the mux session when
/// `tcp_mux` is enabled and fresh transports otherwise.
pub struct Transporter {
    config: Arc<ClientConfig>,
    mux: Mutex<Option<MuxConnector>>,
}

impl Transporter {
    pub fn new(config: Arc<ClientConfig>) -> Arc<Self> {
        Arc::new(Self {
            config,
            mux: Mutex::new(None),
        })
    }

    fn set_mux(&self, connector: Option<MuxConnector>) {
        *self.mux.lock().expect("transporter lock poisoned") = connector;
    }

    /// One server-bound transport: a mux stream or a fresh dial.
    pub async fn open(&self) -> Result<BoxedStream> {
        let mux = self
            .mux
            .lock()
            .expect("transporter lock poisoned")
            .clone();
        match mux {
            Some(connector) => Ok(connector.open_stream().await?),
            None => dial_transport(&self.config).await,
        }
    }
}

/// Dial the server's main endpoint over the configured protocol.
pub async fn dial_transport(config: &ClientConfig) -> Result<BoxedStream> {
    let target = format!("{}:{}", config.server_addr, config.server_port);
    match config.protocol {
        Protocol::Tcp => {
            let stream = connect_tcp(&target, config.http_proxy.as_deref()).await?;
            if config.tls_enable {
                Ok(tls::connect_tls(stream).await?)
            } else {
                Ok(boxed(stream))
            }
        }
        Protocol::Kcp => {
            let addr = resolve(&target).await?;
            Ok(kcp::connect(addr).await?)
        }
        Protocol::Websocket => {
            let stream = connect_tcp(&target, config.http_proxy.as_deref()).await?;
            Ok(ws::connect_websocket(stream, &target).await?)
        }
    }
}

async fn resolve(target: &str) -> Result<SocketAddr> {
    lookup_host(target)
        .await?
        .next()
        .ok_or_else(|| Error::Config(format!("cannot resolve {}", target)))
}

/// The running client
pub struct Service {
    config: Arc<ClientConfig>,
    proxies: HashMap<String, ProxyConf>,
    visitors: HashMap<String, VisitorConf>,
    run_id: Mutex<String>,
}

impl Service {
    pub fn new(
        config: ClientConfig,
        proxies: HashMap<String, ProxyConf>,
        visitors: HashMap<String, VisitorConf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config: Arc::new(config),
            proxies,
            visitors,
            run_id: Mutex::new(String::new()),
        })
    }

    /// Log in and serve until `shutdown`, reconnecting on failure. The very
    /// first login failure is fatal when `login_fail_exit` is set.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut backoff = BACKOFF_START;
        let mut first_attempt = true;

        loop {
            match self.session_once(&shutdown).await {
                Ok(()) => {
                    // Session ran and ended; retry promptly.
                    backoff = BACKOFF_START;
                }
                Err(e) => {
                    if first_attempt && self.config.login_fail_exit {
                        return Err(e);
                    }
                    log::warn!(error = %e, "session failed");
                }
            }
            first_attempt = false;

            if shutdown.is_cancelled() {
                return Ok(());
            }
            log::info!(delay_secs = backoff.as_secs(), "reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.cancelled() => return Ok(()),
            }
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
    }

    /// One full control session: dial, login, serve until it dies.
    async fn session_once(self: &Arc<Self>, shutdown: &CancellationToken) -> Result<()> {
        let main = dial_transport(&self.config).await?;
        let transporter = Transporter::new(Arc::clone(&self.config));

        let mut control_stream = if self.config.tcp_mux {
            let (connector, _acceptor) = session::spawn_session(main, false);
            transporter.set_mux(Some(connector.clone()));
            connector.open_stream().await?
        } else {
            main
        };

        let resp = self.login(&mut control_stream).await?;
        {
            let mut run_id = self.run_id.lock().expect("run id lock poisoned");
            *run_id = resp.run_id.clone();
        }
        log::info!(run_id = %resp.run_id, "logged in");

        let server_udp_addr = if resp.server_udp_port > 0 {
            Some(
                resolve(&format!(
                    "{}:{}",
                    self.config.server_addr, resp.server_udp_port
                ))
                .await?,
            )
        } else {
            None
        };

        let (send_tx, send_rx) = mpsc::channel::<Message>(100);
        let proxy_manager = ProxyManager::new(Arc::clone(&self.config), send_tx.clone());
        let ctl = ClientControl::new(
            Arc::clone(&self.config),
            resp.run_id,
            server_udp_addr,
            Arc::clone(&transporter),
            Arc::clone(&proxy_manager),
            send_tx,
        );
        ctl.start(control_stream, send_rx);

        proxy_manager.reload(&self.proxies).await;
        let health_stop = health::spawn_checkers(&proxy_manager, self.proxies.values().cloned());
        let visitor_stop = visitor::spawn_visitors(
            Arc::clone(&transporter),
            self.visitors.values().cloned(),
            server_udp_addr,
        )
        .await?;

        tokio::select! {
            _ = ctl.wait_closed() => {}
            _ = shutdown.cancelled() => ctl.start_shutdown(),
        }
        health_stop.cancel();
        visitor_stop.cancel();
        Ok(())
    }

    async fn login(&self, stream: &mut BoxedStream) -> Result<crate::msg::LoginResp> {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let login = Login {
            version: version::full().to_string(),
            hostname: std::env::var("HOSTNAME").unwrap_or_default(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            user: self.config.user.clone(),
            auth_key: auth_key(&self.config.token, timestamp),
            timestamp,
            run_id: self.run_id.lock().expect("run id lock poisoned").clone(),
            pool_count: self.config.pool_count,
        };
        codec::write_message(stream, &Message::Login(login)).await?;

        let resp = tokio::time::timeout(LOGIN_TIMEOUT, codec::read_message(stream))
            .await
            .map_err(|_| Error::PeerTimeout("no LoginResp from server".to_string()))??;
        match resp {
            Message::LoginResp(resp) if resp.error.is_empty() => Ok(resp),
            Message::LoginResp(resp) => Err(Error::Auth(resp.error)),
            other => Err(Error::Codec(format!(
                "expected LoginResp, got {}",
                other.name()
            ))),
        }
    }
}
