//! Server service
//!
//! Owns every public listener: the shared bind port (demultiplexed into
//! control, WebSocket, TLS and optionally vhost traffic), the optional KCP
//! port, the standalone vhost ports, and the NAT-hole UDP port. Connections
//! that announce `Login` become control sessions; `NewWorkConn` transports
//! are delivered into their session's pool; `NewVisitorConn` goes to the
//! STCP pairing hub.

pub mod control;
pub mod proxy;
pub mod visitor;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::codec;
use crate::config::ServerConfig;
use crate::crypto::{auth_key, AUTH_TIMESTAMP_SKEW_SECS};
use crate::error::{Error, Result};
use crate::group::{HttpGroupCtl, TcpGroupCtl};
use crate::logger::log;
use crate::msg::{LoginResp, Message};
use crate::muxer::{
    looks_like_http, looks_like_tunnel_websocket, ConnMuxer, VirtualListener, HTTP_NEED_BYTES,
    WEBSOCKET_NEED_BYTES,
};
use crate::nathole::NatHoleController;
use crate::ports::PortManager;
use crate::session;
use crate::transport::tls::{self, TLS_SENTINEL};
use crate::transport::ws;
use crate::transport::{boxed, BoxedStream};
use crate::version;
use crate::vhost::{self, VhostRouter};

use control::{Control, ControlManager};
use visitor::VisitorHub;

/// Deadline for the first message on a fresh connection
const FIRST_MESSAGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-user rate limits attached by an external login validator;
/// zero means unlimited.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoginLimits {
    pub in_kbps: u64,
    pub out_kbps: u64,
}

/// Seam for an external token-validation API: reject logins beyond the
/// shared-token check, or attach per-user limits. The in-tree default
/// accepts everyone.
#[async_trait::async_trait]
pub trait LoginValidator: Send + Sync {
    async fn validate(&self, login: &crate::msg::Login) -> Result<LoginLimits>;
}

/// Per-proxy byte counters, monotonic across each proxy's lifetime
#[derive(Default)]
pub struct StatsRegistry {
    counters: DashMap<String, Arc<ProxyStats>>,
}

#[derive(Default)]
pub struct ProxyStats {
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
}

impl StatsRegistry {
    pub fn record(&self, proxy: &str, bytes_in: u64, bytes_out: u64) {
        let stats = self
            .counters
            .entry(proxy.to_string())
            .or_default()
            .clone();
        stats.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        stats.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
    }

    pub fn snapshot(&self, proxy: &str) -> (u64, u64) {
        self.counters
            .get(proxy)
            .map(|s| {
                (
                    s.bytes_in.load(Ordering::Relaxed),
                    s.bytes_out.load(Ordering::Relaxed),
                )
            })
            .unwrap_or((0, 0))
    }
}

/// Global proxy-name uniqueness across all control sessions
#[derive(Default)]
pub struct ProxyNameRegistry {
    names: Mutex<HashMap<String, String>>,
}

impl ProxyNameRegistry {
    pub fn register(&self, name: &str, run_id: &str) -> Result<()> {
        let mut names = self.names.lock().expect("proxy name lock poisoned");
        if names.contains_key(name) {
            return Err(Error::NameCollision(name.to_string()));
        }
        names.insert(name.to_string(), run_id.to_string());
        Ok(())
    }

    pub fn unregister(&self, name: &str) {
        let mut names = self.names.lock().expect("proxy name lock poisoned");
        names.remove(name);
    }

    pub fn owner(&self, name: &str) -> Option<String> {
        self.names
            .lock()
            .expect("proxy name lock poisoned")
            .get(name)
            .cloned()
    }
}

/// Everything proxies grab resources from
pub struct ResourceCenter {
    pub tcp_ports: Arc<PortManager>,
    pub udp_ports: Arc<PortManager>,
    pub tcp_group: TcpGroupCtl,
    pub http_group: HttpGroupCtl,
    pub http_router: Arc<VhostRouter>,
    pub https_router: Arc<VhostRouter>,
    pub nathole: Option<Arc<NatHoleController>>,
    pub visitor_hub: VisitorHub,
    pub proxy_names: ProxyNameRegistry,
    pub stats: Arc<StatsRegistry>,
    pub server_udp_port: u16,
    pub vhost_http_port: u16,
    pub vhost_https_port: u16,
}

impl ResourceCenter {
    async fn build(config: &ServerConfig) -> Result<Arc<Self>> {
        let tcp_ports = Arc::new(PortManager::new(config.allow_ports.clone()));
        let udp_ports = Arc::new(PortManager::new(config.allow_ports.clone()));
        let http_router = Arc::new(VhostRouter::new());
        let https_router = Arc::new(VhostRouter::new());
        let stats = Arc::new(StatsRegistry::default());

        let nathole = if config.bind_udp_port > 0 {
            let addr: SocketAddr = format!("{}:{}", config.bind_addr, config.bind_udp_port)
                .parse()
                .map_err(|e| Error::Config(format!("bad bind_addr: {}", e)))?;
            let controller = NatHoleController::bind(addr).await?;
            tokio::spawn(Arc::clone(&controller).run());
            log::info!(addr = %addr, "nat hole rendezvous listening");
            Some(controller)
        } else {
            None
        };

        Ok(Arc::new(Self {
            tcp_ports: Arc::clone(&tcp_ports),
            udp_ports,
            tcp_group: TcpGroupCtl::new(config.proxy_bind_addr.clone(), tcp_ports),
            http_group: HttpGroupCtl::new(Arc::clone(&http_router)),
            http_router,
            https_router,
            nathole,
            visitor_hub: VisitorHub::new(Arc::clone(&stats)),
            proxy_names: ProxyNameRegistry::default(),
            stats,
            server_udp_port: config.bind_udp_port,
            vhost_http_port: config.vhost_http_port,
            vhost_https_port: config.vhost_https_port,
        }))
    }

    #[cfg(test)]
    pub fn for_tests() -> Arc<Self> {
        let tcp_ports = Arc::new(PortManager::new(Vec::new()));
        let http_router = Arc::new(VhostRouter::new());
        let stats = Arc::new(StatsRegistry::default());
        Arc::new(Self {
            tcp_ports: Arc::clone(&tcp_ports),
            udp_ports: Arc::new(PortManager::new(Vec::new())),
            tcp_group: TcpGroupCtl::new("127.0.0.1".to_string(), tcp_ports),
            http_group: HttpGroupCtl::new(Arc::clone(&http_router)),
            http_router,
            https_router: Arc::new(VhostRouter::new()),
            nathole: None,
            visitor_hub: VisitorHub::new(Arc::clone(&stats)),
            proxy_names: ProxyNameRegistry::default(),
            stats,
            server_udp_port: 0,
            vhost_http_port: 8080,
            vhost_https_port: 8443,
        })
    }
}

/// The running server
pub struct Service {
    config: Arc<ServerConfig>,
    resources: Arc<ResourceCenter>,
    ctl_manager: Arc<ControlManager>,
    login_validator: Option<Arc<dyn LoginValidator>>,
    shutdown: CancellationToken,
}

impl Service {
    pub async fn new(config: ServerConfig) -> Result<Arc<Self>> {
        Self::with_login_validator(config, None).await
    }

    /// Build the service with an external login validator attached.
    pub async fn with_login_validator(
        config: ServerConfig,
        login_validator: Option<Arc<dyn LoginValidator>>,
    ) -> Result<Arc<Self>> {
        let resources = ResourceCenter::build(&config).await?;
        Ok(Arc::new(Self {
            config: Arc::new(config),
            resources,
            ctl_manager: Arc::new(ControlManager::new()),
            login_validator,
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    #[cfg(test)]
    pub fn control_manager(&self) -> Arc<ControlManager> {
        Arc::clone(&self.ctl_manager)
    }

    #[cfg(test)]
    pub fn resources(&self) -> Arc<ResourceCenter> {
        Arc::clone(&self.resources)
    }

    /// Bind all listeners and serve until the shutdown token fires.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let config = &self.config;
        let bind = format!("{}:{}", config.bind_addr, config.bind_port);
        let listener = TcpListener::bind(&bind).await?;
        log::info!(addr = %bind, "server listening");

        let mut muxer = ConnMuxer::new();
        let ws_listener = muxer.listen(WEBSOCKET_NEED_BYTES, looks_like_tunnel_websocket);
        let http_listener = if config.vhost_http_port == config.bind_port {
            Some(muxer.listen(HTTP_NEED_BYTES, looks_like_http))
        } else {
            None
        };
        let https_listener = if config.vhost_https_port != 0
            && config.vhost_https_port == config.bind_port
        {
            Some(muxer.listen(1, |p| p.first() == Some(&tls::TLS_HANDSHAKE_BYTE)))
        } else {
            None
        };
        let tls_listener = muxer.listen(1, |p| p.first() == Some(&TLS_SENTINEL));
        let default_listener = muxer.default_listener();
        tokio::spawn(muxer.serve(listener, self.shutdown.clone()));

        self.spawn_websocket_loop(ws_listener);
        self.spawn_tls_loop(tls_listener)?;
        self.spawn_vhost_http(http_listener).await?;
        self.spawn_vhost_https(https_listener).await?;
        self.spawn_kcp_loop().await?;

        // Plain control connections arrive on the default listener.
        let mut default_listener = default_listener;
        loop {
            let conn = tokio::select! {
                conn = default_listener.accept() => conn,
                _ = self.shutdown.cancelled() => return Ok(()),
            };
            let Some((stream, peer)) = conn else {
                return Ok(());
            };
            let service = Arc::clone(&self);
            tokio::spawn(async move { service.handle_connection(boxed(stream), peer).await });
        }
    }

    fn spawn_websocket_loop(self: &Arc<Self>, mut listener: VirtualListener) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            while let Some((stream, peer)) = listener.accept().await {
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    match ws::accept_websocket(stream).await {
                        Ok(stream) => service.handle_connection(stream, peer).await,
                        Err(e) => {
                            log::debug!(peer = %peer, error = %e, "websocket handshake failed")
                        }
                    }
                });
            }
        });
    }

    fn spawn_tls_loop(self: &Arc<Self>, mut listener: VirtualListener) -> Result<()> {
        let tls_config = tls::self_signed_server_config()
            .map_err(|e| Error::Config(format!("TLS setup failed: {}", e)))?;
        let service = Arc::clone(self);
        tokio::spawn(async move {
            while let Some((stream, peer)) = listener.accept().await {
                let service = Arc::clone(&service);
                let tls_config = Arc::clone(&tls_config);
                tokio::spawn(async move {
                    // Consume the sentinel byte the muxer matched on.
                    let mut stream = stream;
                    let mut sentinel = [0u8; 1];
                    if tokio::io::AsyncReadExt::read_exact(&mut stream, &mut sentinel)
                        .await
                        .is_err()
                    {
                        return;
                    }
                    match tls::accept_tls(tls_config, stream).await {
                        Ok(stream) => service.handle_connection(stream, peer).await,
                        Err(e) => log::debug!(peer = %peer, error = %e, "TLS accept failed"),
                    }
                });
            }
        });
        Ok(())
    }

    async fn spawn_vhost_http(self: &Arc<Self>, muxed: Option<VirtualListener>) -> Result<()> {
        if self.config.vhost_http_port == 0 {
            return Ok(());
        }
        let router = Arc::clone(&self.resources.http_router);
        match muxed {
            Some(mut listener) => {
                tokio::spawn(async move {
                    while let Some((stream, peer)) = listener.accept().await {
                        let router = Arc::clone(&router);
                        tokio::spawn(async move {
                            let _ = vhost::http::handle_http_connection(router, stream, peer).await;
                        });
                    }
                });
            }
            None => {
                let addr = format!(
                    "{}:{}",
                    self.config.proxy_bind_addr, self.config.vhost_http_port
                );
                let listener = TcpListener::bind(&addr).await?;
                log::info!(addr = %addr, "vhost http listening");
                let shutdown = self.shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        let accepted = tokio::select! {
                            accepted = listener.accept() => accepted,
                            _ = shutdown.cancelled() => return,
                        };
                        let Ok((stream, peer)) = accepted else { continue };
                        stream.set_nodelay(true).ok();
                        let router = Arc::clone(&router);
                        tokio::spawn(async move {
                            let _ = vhost::http::handle_http_connection(router, stream, peer).await;
                        });
                    }
                });
            }
        }
        Ok(())
    }

    async fn spawn_vhost_https(self: &Arc<Self>, muxed: Option<VirtualListener>) -> Result<()> {
        if self.config.vhost_https_port == 0 {
            return Ok(());
        }
        let router = Arc::clone(&self.resources.https_router);
        match muxed {
            Some(mut listener) => {
                tokio::spawn(async move {
                    while let Some((stream, peer)) = listener.accept().await {
                        let router = Arc::clone(&router);
                        tokio::spawn(async move {
                            let _ =
                                vhost::https::handle_https_connection(router, stream, peer).await;
                        });
                    }
                });
            }
            None => {
                let addr = format!(
                    "{}:{}",
                    self.config.proxy_bind_addr, self.config.vhost_https_port
                );
                let listener = TcpListener::bind(&addr).await?;
                log::info!(addr = %addr, "vhost https listening");
                let shutdown = self.shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        let accepted = tokio::select! {
                            accepted = listener.accept() => accepted,
                            _ = shutdown.cancelled() => return,
                        };
                        let Ok((stream, peer)) = accepted else { continue };
                        stream.set_nodelay(true).ok();
                        let router = Arc::clone(&router);
                        tokio::spawn(async move {
                            let _ =
                                vhost::https::handle_https_connection(router, stream, peer).await;
                        });
                    }
                });
            }
        }
        Ok(())
    }

    async fn spawn_kcp_loop(self: &Arc<Self>) -> Result<()> {
        if self.config.kcp_bind_port == 0 {
            return Ok(());
        }
        let addr: SocketAddr = format!("{}:{}", self.config.bind_addr, self.config.kcp_bind_port)
            .parse()
            .map_err(|e| Error::Config(format!("bad bind_addr: {}", e)))?;
        let mut listener = crate::transport::kcp::listen(addr).await?;
        log::info!(addr = %addr, "kcp listening");
        let service = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match crate::transport::kcp::accept(&mut listener).await {
                    Ok((stream, peer)) => {
                        let service = Arc::clone(&service);
                        tokio::spawn(async move { service.handle_connection(stream, peer).await });
                    }
                    Err(e) => {
                        log::warn!(error = %e, "kcp accept error");
                        return;
                    }
                }
            }
        });
        Ok(())
    }

    /// A transport-level connection: either one framed session, or a mux
    /// session carrying several.
    pub async fn handle_connection(self: Arc<Self>, stream: BoxedStream, peer: SocketAddr) {
        if self.config.tcp_mux {
            let (_connector, mut acceptor) = session::spawn_session(stream, true);
            while let Some(stream) = acceptor.accept_stream().await {
                let service = Arc::clone(&self);
                tokio::spawn(async move { service.deal(stream, peer).await });
            }
        } else {
            self.deal(stream, peer).await;
        }
    }

    /// Classify one framed session by its first message.
    async fn deal(self: Arc<Self>, mut stream: BoxedStream, peer: SocketAddr) {
        let first = tokio::time::timeout(FIRST_MESSAGE_TIMEOUT, codec::read_message(&mut stream))
            .await;
        let msg = match first {
            Ok(Ok(msg)) => msg,
            Ok(Err(e)) => {
                log::debug!(peer = %peer, error = %e, "unreadable first message");
                return;
            }
            Err(_) => {
                log::debug!(peer = %peer, "no first message before deadline");
                return;
            }
        };

        match msg {
            Message::Login(login) => {
                if let Err(e) = self.register_control(stream, login, peer).await {
                    log::warn!(peer = %peer, error = %e, "login rejected");
                }
            }
            Message::NewWorkConn(new_work) => {
                match self.ctl_manager.get(&new_work.run_id).await {
                    Some(ctl) => ctl.register_work_conn(stream),
                    None => {
                        log::warn!(peer = %peer, run_id = %new_work.run_id, "work connection for unknown run id");
                    }
                }
            }
            Message::NewVisitorConn(visitor) => {
                let service = Arc::clone(&self);
                tokio::spawn(async move {
                    if let Err(e) = service
                        .resources
                        .visitor_hub
                        .handle(stream, visitor, peer)
                        .await
                    {
                        log::debug!(peer = %peer, error = %e, "visitor connection failed");
                    }
                });
            }
            other => {
                log::warn!(peer = %peer, msg = other.name(), "unexpected first message");
            }
        }
    }

    async fn register_control(
        self: &Arc<Self>,
        mut stream: BoxedStream,
        login: crate::msg::Login,
        peer: SocketAddr,
    ) -> Result<()> {
        let verdict = match self.verify_login(&login) {
            Ok(()) => match &self.login_validator {
                Some(validator) => validator.validate(&login).await.map(Some),
                None => Ok(None),
            },
            Err(e) => Err(e),
        };
        let limits = match verdict {
            Ok(limits) => limits,
            Err(e) => {
                log::login(&peer.to_string(), &login.user, false);
                let resp = Message::LoginResp(LoginResp {
                    version: version::full().to_string(),
                    run_id: String::new(),
                    server_udp_port: 0,
                    error: e.to_string(),
                });
                let _ = codec::write_message(&mut stream, &resp).await;
                return Err(e);
            }
        };
        if let Some(limits) = limits {
            log::debug!(
                user = %login.user,
                in_kbps = limits.in_kbps,
                out_kbps = limits.out_kbps,
                "validator attached limits"
            );
        }

        let run_id = if login.run_id.is_empty() {
            format!("{}-{}", login.user, random_hex16())
        } else {
            login.run_id.clone()
        };

        let ctl = Control::new(
            run_id.clone(),
            login.user.clone(),
            login.pool_count,
            Arc::clone(&self.config),
            Arc::clone(&self.resources),
        );

        // A re-login with the same run id evicts the previous session and
        // waits for its resources to drain before taking over.
        if let Some(old) = self.ctl_manager.install(Arc::clone(&ctl)).await {
            log::info!(run_id = %run_id, "evicting previous control session");
            old.start_shutdown();
            old.wait_closed().await;
        }

        log::login(&peer.to_string(), &login.user, true);
        log::info!(
            peer = %peer,
            user = %login.user,
            run_id = %run_id,
            version = %login.version,
            hostname = %login.hostname,
            "client logged in"
        );
        ctl.start(stream, Arc::clone(&self.ctl_manager)).await;
        Ok(())
    }

    fn verify_login(&self, login: &crate::msg::Login) -> Result<()> {
        if !version::compat(&login.version) {
            return Err(Error::Auth(format!(
                "version {} is not compatible with {}",
                login.version,
                version::full()
            )));
        }
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        if (now - login.timestamp).abs() > AUTH_TIMESTAMP_SKEW_SECS {
            return Err(Error::Auth("login timestamp expired".to_string()));
        }
        if auth_key(&self.config.token, login.timestamp) != login.auth_key {
            return Err(Error::Auth("token mismatch".to_string()));
        }
        Ok(())
    }
}

fn random_hex16() -> String {
    let mut bytes = [0u8; 8];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
    hex::encode(bytes)
}
