//! Server-side proxy handlers
//!
//! One handler per exposure shape. All of them move user bytes the same
//! way: take a work connection from the owning control, announce it with
//! `StartWorkConn`, apply the optional cipher/compressor layers, splice.
//! They differ only in how user connections arrive.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::codec;
use crate::config::{ProxyType, ServerConfig};
use crate::error::{Error, Result};
use crate::logger::log;
use crate::msg::{Message, NatHoleSid, NewProxy, StartWorkConn};
use crate::nathole::SidNotifier;
use crate::splice;
use crate::transport::{apply_layers, boxed, BoxedStream};
use crate::udp;
use crate::vhost::{ConnFactory, VhostRoute};

use super::control::Control;
use super::visitor::StcpEntry;
use super::ResourceCenter;

/// Attempts to hand off a pooled work connection before giving up; stale
/// pooled sockets fail on the first write and are simply retried.
const WORK_CONN_ATTEMPTS: usize = 3;

/// Takes work connections from a control session on behalf of one proxy
pub struct WorkConnSource {
    ctl: Weak<Control>,
    proxy_name: String,
}

impl WorkConnSource {
    pub fn new(ctl: Weak<Control>, proxy_name: String) -> Arc<Self> {
        Arc::new(Self { ctl, proxy_name })
    }

    /// Pop a work connection and announce the user session on it.
    pub async fn get(
        &self,
        src: Option<SocketAddr>,
        dst: Option<SocketAddr>,
    ) -> Result<BoxedStream> {
        let ctl = self
            .ctl
            .upgrade()
            .ok_or_else(|| Error::PoolExhausted(self.proxy_name.clone()))?;

        let start = StartWorkConn {
            proxy_name: self.proxy_name.clone(),
            src_addr: src.map(|a| a.ip().to_string()).unwrap_or_default(),
            src_port: src.map(|a| a.port()).unwrap_or_default(),
            dst_addr: dst.map(|a| a.ip().to_string()).unwrap_or_default(),
            dst_port: dst.map(|a| a.port()).unwrap_or_default(),
            error: String::new(),
        };

        let mut last_err = None;
        for _ in 0..WORK_CONN_ATTEMPTS {
            let mut conn = ctl.get_work_conn().await?;
            match codec::write_message(&mut conn, &Message::StartWorkConn(start.clone())).await {
                Ok(()) => return Ok(conn),
                Err(e) => {
                    log::debug!(proxy = %self.proxy_name, error = %e, "stale work connection, retrying");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::PoolExhausted(self.proxy_name.clone())))
    }
}

/// A running server-side proxy
#[async_trait]
pub trait ServerProxy: Send + Sync {
    fn name(&self) -> &str;
    /// Reserve resources and start listening. Returns the public address
    /// users should hit, reported back in `NewProxyResp`.
    async fn run(&self) -> Result<String>;
    /// Release all listening resources. Idempotent.
    async fn close(&self);
}

/// Build the handler matching the declared proxy type.
pub async fn create_proxy(
    ctl: Weak<Control>,
    config: Arc<ServerConfig>,
    resources: Arc<ResourceCenter>,
    conf: NewProxy,
) -> Result<Arc<dyn ServerProxy>> {
    let proxy_type = ProxyType::parse(&conf.proxy_type)?;
    let source = WorkConnSource::new(ctl, conf.proxy_name.clone());

    let proxy: Arc<dyn ServerProxy> = match proxy_type {
        ProxyType::Tcp => Arc::new(TcpProxy {
            conf,
            config,
            resources,
            source,
            shutdown: CancellationToken::new(),
            state: tokio::sync::Mutex::new(TcpState::Idle),
        }),
        ProxyType::Udp => Arc::new(UdpProxy {
            conf,
            config,
            resources,
            source,
            shutdown: CancellationToken::new(),
            state: tokio::sync::Mutex::new(0),
        }),
        ProxyType::Http => Arc::new(HttpProxy {
            conf,
            config,
            resources,
            source,
            registrations: tokio::sync::Mutex::new(Vec::new()),
        }),
        ProxyType::Https => Arc::new(HttpsProxy {
            conf,
            config,
            resources,
            source,
            registrations: tokio::sync::Mutex::new(Vec::new()),
        }),
        ProxyType::Stcp => Arc::new(StcpProxy {
            conf,
            config,
            resources,
            source,
        }),
        ProxyType::Xtcp => Arc::new(XtcpProxy {
            conf,
            resources,
            source,
        }),
    };
    Ok(proxy)
}

/// Shared post-accept path: fetch a work connection, layer it, splice, and
/// record the byte counters.
async fn splice_user_conn(
    user: BoxedStream,
    peer: SocketAddr,
    local: Option<SocketAddr>,
    conf: &NewProxy,
    config: &ServerConfig,
    resources: &ResourceCenter,
    source: &WorkConnSource,
) {
    let work = match source.get(Some(peer), local).await {
        Ok(work) => work,
        Err(e) => {
            log::warn!(proxy = %conf.proxy_name, error = %e, "no work connection for user session");
            return;
        }
    };
    let work = match apply_layers(
        work,
        conf.use_encryption,
        conf.use_compression,
        config.token.as_bytes(),
    )
    .await
    {
        Ok(work) => work,
        Err(e) => {
            log::warn!(proxy = %conf.proxy_name, error = %e, "work connection layer setup failed");
            return;
        }
    };

    log::connection(&conf.proxy_name, &peer.to_string(), "open");
    let (counts, _result) = splice::join(user, work).await;
    resources
        .stats
        .record(&conf.proxy_name, counts.a_to_b, counts.b_to_a);
    log::connection(&conf.proxy_name, &peer.to_string(), "closed");
}

enum TcpState {
    Idle,
    Port(u16),
    Group(String),
}

struct TcpProxy {
    conf: NewProxy,
    config: Arc<ServerConfig>,
    resources: Arc<ResourceCenter>,
    source: Arc<WorkConnSource>,
    shutdown: CancellationToken,
    state: tokio::sync::Mutex<TcpState>,
}

impl TcpProxy {
    fn spawn_conn_loop(&self, mut rx: mpsc::Receiver<(TcpStream, SocketAddr)>) {
        let conf = self.conf.clone();
        let config = Arc::clone(&self.config);
        let resources = Arc::clone(&self.resources);
        let source = Arc::clone(&self.source);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let (stream, peer) = tokio::select! {
                    conn = rx.recv() => match conn {
                        Some(pair) => pair,
                        None => return,
                    },
                    _ = shutdown.cancelled() => return,
                };
                let local = stream.local_addr().ok();
                let conf = conf.clone();
                let config = Arc::clone(&config);
                let resources = Arc::clone(&resources);
                let source = Arc::clone(&source);
                tokio::spawn(async move {
                    splice_user_conn(
                        boxed(stream),
                        peer,
                        local,
                        &conf,
                        &config,
                        &resources,
                        &source,
                    )
                    .await;
                });
            }
        });
    }
}

#[async_trait]
impl ServerProxy for TcpProxy {
    fn name(&self) -> &str {
        &self.conf.proxy_name
    }

    async fn run(&self) -> Result<String> {
        if !self.conf.group.is_empty() {
            let (port, rx) = self
                .resources
                .tcp_group
                .register(
                    &self.conf.proxy_name,
                    &self.conf.group,
                    &self.conf.group_key,
                    self.conf.remote_port,
                )
                .await?;
            *self.state.lock().await = TcpState::Group(self.conf.group.clone());
            self.spawn_conn_loop(rx);
            return Ok(format!("{}:{}", self.config.proxy_bind_addr, port));
        }

        let port = self
            .resources
            .tcp_ports
            .acquire(&self.conf.proxy_name, self.conf.remote_port)?;
        let listener =
            match TcpListener::bind((self.config.proxy_bind_addr.as_str(), port)).await {
                Ok(listener) => listener,
                Err(e) => {
                    self.resources.tcp_ports.release(port);
                    return Err(Error::PortUnavailable(format!(
                        "bind port {} failed: {}",
                        port, e
                    )));
                }
            };
        *self.state.lock().await = TcpState::Port(port);

        let (tx, rx) = mpsc::channel(64);
        let shutdown = self.shutdown.clone();
        let name = self.conf.proxy_name.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    accepted = listener.accept() => accepted,
                    _ = shutdown.cancelled() => return,
                };
                match accepted {
                    Ok(pair) => {
                        if tx.send(pair).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => log::warn!(proxy = %name, error = %e, "accept error"),
                }
            }
        });
        self.spawn_conn_loop(rx);
        Ok(format!("{}:{}", self.config.proxy_bind_addr, port))
    }

    async fn close(&self) {
        self.shutdown.cancel();
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, TcpState::Idle) {
            TcpState::Port(port) => self.resources.tcp_ports.release(port),
            TcpState::Group(group) => {
                self.resources
                    .tcp_group
                    .unregister(&self.conf.proxy_name, &group)
                    .await;
            }
            TcpState::Idle => {}
        }
    }
}

struct UdpProxy {
    conf: NewProxy,
    config: Arc<ServerConfig>,
    resources: Arc<ResourceCenter>,
    source: Arc<WorkConnSource>,
    shutdown: CancellationToken,
    state: tokio::sync::Mutex<u16>,
}

#[async_trait]
impl ServerProxy for UdpProxy {
    fn name(&self) -> &str {
        &self.conf.proxy_name
    }

    async fn run(&self) -> Result<String> {
        let port = self
            .resources
            .udp_ports
            .acquire(&self.conf.proxy_name, self.conf.remote_port)?;
        let socket = match UdpSocket::bind((self.config.proxy_bind_addr.as_str(), port)).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                self.resources.udp_ports.release(port);
                return Err(Error::PortUnavailable(format!(
                    "bind udp port {} failed: {}",
                    port, e
                )));
            }
        };
        *self.state.lock().await = port;

        let conf = self.conf.clone();
        let config = Arc::clone(&self.config);
        let resources = Arc::clone(&self.resources);
        let source = Arc::clone(&self.source);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            // The forwarder survives work-connection churn: when the tunnel
            // side fails it asks for a fresh work connection and carries on.
            loop {
                if shutdown.is_cancelled() {
                    return;
                }
                let work = tokio::select! {
                    work = source.get(None, None) => work,
                    _ = shutdown.cancelled() => return,
                };
                let work = match work {
                    Ok(work) => work,
                    Err(e) => {
                        log::warn!(proxy = %conf.proxy_name, error = %e, "udp proxy has no work connection");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                let work = match apply_layers(
                    work,
                    conf.use_encryption,
                    conf.use_compression,
                    config.token.as_bytes(),
                )
                .await
                {
                    Ok(work) => work,
                    Err(e) => {
                        log::warn!(proxy = %conf.proxy_name, error = %e, "udp work connection layers failed");
                        continue;
                    }
                };

                run_udp_work_conn(
                    Arc::clone(&socket),
                    work,
                    &conf.proxy_name,
                    &resources,
                    &shutdown,
                )
                .await;
            }
        });

        Ok(format!("{}:{}", self.config.proxy_bind_addr, port))
    }

    async fn close(&self) {
        self.shutdown.cancel();
        let mut state = self.state.lock().await;
        if *state != 0 {
            self.resources.udp_ports.release(*state);
            *state = 0;
        }
    }
}

/// Bridge one work connection to the public UDP socket until either fails.
async fn run_udp_work_conn(
    socket: Arc<UdpSocket>,
    work: BoxedStream,
    proxy_name: &str,
    resources: &ResourceCenter,
    shutdown: &CancellationToken,
) {
    let (mut read_half, mut write_half) = tokio::io::split(work);
    let (to_client_tx, mut to_client_rx) = mpsc::channel::<Message>(128);
    let (from_client_tx, from_client_rx) = mpsc::channel::<crate::msg::UdpPacket>(128);

    let pump = tokio::spawn(udp::pump_public_socket(
        Arc::clone(&socket),
        to_client_tx,
        from_client_rx,
    ));

    let stats = Arc::clone(&resources.stats);
    let name_out = proxy_name.to_string();
    let writer = async move {
        while let Some(msg) = to_client_rx.recv().await {
            if let Message::UdpPacket(ref packet) = msg {
                stats.record(&name_out, packet.content.len() as u64, 0);
            }
            if codec::write_message(&mut write_half, &msg).await.is_err() {
                return;
            }
        }
    };

    let stats = Arc::clone(&resources.stats);
    let name_in = proxy_name.to_string();
    let reader = async move {
        loop {
            match codec::read_message(&mut read_half).await {
                Ok(Message::UdpPacket(packet)) => {
                    stats.record(&name_in, 0, packet.content.len() as u64);
                    if from_client_tx.send(packet).await.is_err() {
                        return;
                    }
                }
                // Keep-alive from the client side; nothing to answer.
                Ok(Message::Ping(_)) => {}
                Ok(other) => {
                    log::debug!(msg = other.name(), "unexpected message on udp work connection");
                }
                Err(_) => return,
            }
        }
    };

    tokio::select! {
        _ = writer => {}
        _ = reader => {}
        _ = shutdown.cancelled() => {}
    }
    pump.abort();
}

/// Conn factory behind vhost routes: every user session turns into one
/// layered work connection.
struct WorkConnFactory {
    source: Arc<WorkConnSource>,
    use_encryption: bool,
    use_compression: bool,
    token: String,
}

#[async_trait]
impl ConnFactory for WorkConnFactory {
    async fn open(&self, src: SocketAddr) -> std::io::Result<BoxedStream> {
        let work = self
            .source
            .get(Some(src), None)
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::NotConnected, e.to_string()))?;
        apply_layers(
            work,
            self.use_encryption,
            self.use_compression,
            self.token.as_bytes(),
        )
        .await
    }
}

enum VhostRegistration {
    Plain { domain: String, location: String },
    Grouped { group: String, domain: String, location: String },
}

fn vhost_domains(conf: &NewProxy, config: &ServerConfig) -> Result<Vec<String>> {
    let mut domains: Vec<String> = conf
        .custom_domains
        .iter()
        .filter(|d| !d.is_empty())
        .cloned()
        .collect();
    if !conf.subdomain.is_empty() {
        if config.subdomain_host.is_empty() {
            return Err(Error::Config(
                "subdomain requires subdomain_host on the server".to_string(),
            ));
        }
        domains.push(format!("{}.{}", conf.subdomain, config.subdomain_host));
    }
    if domains.is_empty() {
        return Err(Error::Config(format!(
            "proxy [{}] has no domains",
            conf.proxy_name
        )));
    }
    Ok(domains)
}

fn vhost_route(conf: &NewProxy, factory: Arc<dyn ConnFactory>) -> VhostRoute {
    VhostRoute {
        proxy_name: conf.proxy_name.clone(),
        host_header_rewrite: conf.host_header_rewrite.clone(),
        headers: conf.headers.clone(),
        http_user: conf.http_user.clone(),
        http_pwd: conf.http_pwd.clone(),
        factory,
        group_key: conf.group_key.clone(),
    }
}

struct HttpProxy {
    conf: NewProxy,
    config: Arc<ServerConfig>,
    resources: Arc<ResourceCenter>,
    source: Arc<WorkConnSource>,
    registrations: tokio::sync::Mutex<Vec<VhostRegistration>>,
}

#[async_trait]
impl ServerProxy for HttpProxy {
    fn name(&self) -> &str {
        &self.conf.proxy_name
    }

    async fn run(&self) -> Result<String> {
        if self.resources.vhost_http_port == 0 {
            return Err(Error::Config(
                "server has no vhost_http_port configured".to_string(),
            ));
        }
        let domains = vhost_domains(&self.conf, &self.config)?;
        let locations = if self.conf.locations.is_empty() {
            vec![String::new()]
        } else {
            self.conf.locations.clone()
        };

        let factory: Arc<dyn ConnFactory> = Arc::new(WorkConnFactory {
            source: Arc::clone(&self.source),
            use_encryption: self.conf.use_encryption,
            use_compression: self.conf.use_compression,
            token: self.config.token.clone(),
        });

        let mut registrations = self.registrations.lock().await;
        let mut addrs = Vec::new();
        for domain in &domains {
            for location in &locations {
                let route = vhost_route(&self.conf, Arc::clone(&factory));
                let outcome = if self.conf.group.is_empty() {
                    self.resources.http_router.register(domain, location, route)
                } else {
                    self.resources.http_group.register(
                        &self.conf.proxy_name,
                        &self.conf.group,
                        &self.conf.group_key,
                        domain,
                        location,
                        route,
                    )
                };
                if let Err(e) = outcome {
                    // Roll back everything registered so far.
                    rollback(&self.resources, &mut registrations, &self.conf.proxy_name);
                    return Err(e);
                }
                registrations.push(if self.conf.group.is_empty() {
                    VhostRegistration::Plain {
                        domain: domain.clone(),
                        location: location.clone(),
                    }
                } else {
                    VhostRegistration::Grouped {
                        group: self.conf.group.clone(),
                        domain: domain.clone(),
                        location: location.clone(),
                    }
                });
            }
            addrs.push(format!("{}:{}", domain, self.resources.vhost_http_port));
        }
        Ok(addrs.join(","))
    }

    async fn close(&self) {
        let mut registrations = self.registrations.lock().await;
        rollback(&self.resources, &mut registrations, &self.conf.proxy_name);
    }
}

fn rollback(
    resources: &ResourceCenter,
    registrations: &mut Vec<VhostRegistration>,
    proxy_name: &str,
) {
    for registration in registrations.drain(..) {
        match registration {
            VhostRegistration::Plain { domain, location } => {
                resources.http_router.unregister(&domain, &location);
            }
            VhostRegistration::Grouped {
                group,
                domain,
                location,
            } => {
                resources
                    .http_group
                    .unregister(proxy_name, &group, &domain, &location);
            }
        }
    }
}

struct HttpsProxy {
    conf: NewProxy,
    config: Arc<ServerConfig>,
    resources: Arc<ResourceCenter>,
    source: Arc<WorkConnSource>,
    registrations: tokio::sync::Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl ServerProxy for HttpsProxy {
    fn name(&self) -> &str {
        &self.conf.proxy_name
    }

    async fn run(&self) -> Result<String> {
        if self.resources.vhost_https_port == 0 {
            return Err(Error::Config(
                "server has no vhost_https_port configured".to_string(),
            ));
        }
        let domains = vhost_domains(&self.conf, &self.config)?;
        let factory: Arc<dyn ConnFactory> = Arc::new(WorkConnFactory {
            source: Arc::clone(&self.source),
            use_encryption: self.conf.use_encryption,
            use_compression: self.conf.use_compression,
            token: self.config.token.clone(),
        });

        let mut registrations = self.registrations.lock().await;
        let mut addrs = Vec::new();
        for domain in &domains {
            let route = vhost_route(&self.conf, Arc::clone(&factory));
            if let Err(e) = self.resources.https_router.register(domain, "", route) {
                for (domain, location) in registrations.drain(..) {
                    self.resources.https_router.unregister(&domain, &location);
                }
                return Err(e);
            }
            registrations.push((domain.clone(), String::new()));
            addrs.push(format!("{}:{}", domain, self.resources.vhost_https_port));
        }
        Ok(addrs.join(","))
    }

    async fn close(&self) {
        let mut registrations = self.registrations.lock().await;
        for (domain, location) in registrations.drain(..) {
            self.resources.https_router.unregister(&domain, &location);
        }
    }
}

struct StcpProxy {
    conf: NewProxy,
    config: Arc<ServerConfig>,
    resources: Arc<ResourceCenter>,
    source: Arc<WorkConnSource>,
}

#[async_trait]
impl ServerProxy for StcpProxy {
    fn name(&self) -> &str {
        &self.conf.proxy_name
    }

    async fn run(&self) -> Result<String> {
        self.resources.visitor_hub.register(
            &self.conf.proxy_name,
            StcpEntry {
                sk: self.conf.sk.clone(),
                use_encryption: self.conf.use_encryption,
                use_compression: self.conf.use_compression,
                token: self.config.token.clone(),
                source: Arc::clone(&self.source),
            },
        );
        // No public address: visitors reach this proxy by name.
        Ok(String::new())
    }

    async fn close(&self) {
        self.resources.visitor_hub.unregister(&self.conf.proxy_name);
    }
}

struct XtcpProxy {
    conf: NewProxy,
    resources: Arc<ResourceCenter>,
    source: Arc<WorkConnSource>,
}

struct XtcpSidNotifier {
    source: Arc<WorkConnSource>,
}

#[async_trait]
impl SidNotifier for XtcpSidNotifier {
    async fn notify(&self, sid: &str) -> Result<()> {
        // The work connection only signals; the punched path carries data.
        let mut conn = self.source.get(None, None).await?;
        codec::write_message(
            &mut conn,
            &Message::NatHoleSid(NatHoleSid {
                sid: sid.to_string(),
            }),
        )
        .await?;
        conn.flush().await.ok();
        Ok(())
    }
}

#[async_trait]
impl ServerProxy for XtcpProxy {
    fn name(&self) -> &str {
        &self.conf.proxy_name
    }

    async fn run(&self) -> Result<String> {
        let Some(nathole) = &self.resources.nathole else {
            return Err(Error::Config(
                "xtcp requires bind_udp_port on the server".to_string(),
            ));
        };
        nathole.register_proxy(
            &self.conf.proxy_name,
            Arc::new(XtcpSidNotifier {
                source: Arc::clone(&self.source),
            }),
        );
        Ok(String::new())
    }

    async fn close(&self) {
        if let Some(nathole) = &self.resources.nathole {
            nathole.unregister_proxy(&self.conf.proxy_name);
        }
    }
}
