//! Client-side proxy manager and work-connection handlers
//!
//! The manager mirrors the declared proxy set to the server and dispatches
//! incoming work connections by proxy name. TCP-shaped proxies splice the
//! work connection to the local service; UDP runs the datagram forwarder;
//! XTCP turns the work connection into a hole-punch errand.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::codec;
use crate::config::{ClientConfig, ProxyConf, ProxyType};
use crate::crypto::auth_key;
use crate::error::{Error, Result};
use crate::logger::log;
use crate::msg::{CloseProxy, Message, NatHoleClient, NatHoleClientDetectOk, Ping, StartWorkConn};
use crate::nathole;
use crate::proxy_protocol::{self, ProxyProtocolVersion};
use crate::session;
use crate::splice;
use crate::transport::{apply_layers, kcp, BoxedStream};
use crate::udp;

/// Deadline for dialing the exposed local service
const LOCAL_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Ping cadence on a UDP work connection
const UDP_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// In-process alternative to a local service; delivery seam for bundled
/// handlers such as a static file server. The work connection arrives with
/// layers already applied and `extra` holds any PROXY protocol header.
#[async_trait::async_trait]
pub trait Plugin: Send + Sync {
    async fn handle(&self, work: BoxedStream, extra: Vec<u8>) -> Result<()>;
}

/// Resolver for configured plugin names; the in-tree set is empty, callers
/// embedding the crate can provide their own.
pub type PluginFactory =
    dyn Fn(&str, &HashMap<String, String>) -> Option<Arc<dyn Plugin>> + Send + Sync;

struct ProxyEntry {
    conf: ProxyConf,
    plugin: Option<Arc<dyn Plugin>>,
    // UDP: tear down the previous forwarder when a new work conn arrives
    udp_session: Option<CancellationToken>,
}

/// Name-keyed registry of the proxies this client exposes
pub struct ProxyManager {
    config: Arc<ClientConfig>,
    send_tx: mpsc::Sender<Message>,
    proxies: AsyncMutex<HashMap<String, ProxyEntry>>,
    plugin_factory: Option<Box<PluginFactory>>,
}

impl ProxyManager {
    pub fn new(config: Arc<ClientConfig>, send_tx: mpsc::Sender<Message>) -> Arc<Self> {
        Arc::new(Self {
            config,
            send_tx,
            proxies: AsyncMutex::new(HashMap::new()),
            plugin_factory: None,
        })
    }

    /// Same as [`ProxyManager::new`] with a resolver for `plugin = ...`
    /// proxy entries.
    pub fn with_plugins(
        config: Arc<ClientConfig>,
        send_tx: mpsc::Sender<Message>,
        plugin_factory: Box<PluginFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            send_tx,
            proxies: AsyncMutex::new(HashMap::new()),
            plugin_factory: Some(plugin_factory),
        })
    }

    /// Diff the declared set against the running set and send the matching
    /// `NewProxy` / `CloseProxy` messages. A changed proxy is re-declared.
    pub async fn reload(&self, confs: &HashMap<String, ProxyConf>) {
        let mut proxies = self.proxies.lock().await;

        let stale: Vec<String> = proxies
            .keys()
            .filter(|name| {
                confs
                    .get(*name)
                    .map(|conf| conf != &proxies[*name].conf)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        for name in stale {
            proxies.remove(&name);
            let _ = self
                .send_tx
                .send(Message::CloseProxy(CloseProxy { proxy_name: name }))
                .await;
        }

        for (name, conf) in confs {
            if proxies.contains_key(name) {
                continue;
            }
            let plugin = self.plugin_factory.as_ref().and_then(|factory| {
                if conf.plugin.is_empty() {
                    None
                } else {
                    factory(&conf.plugin, &conf.plugin_params)
                }
            });
            if !conf.plugin.is_empty() && plugin.is_none() && self.plugin_factory.is_some() {
                log::warn!(proxy = %name, plugin = %conf.plugin, "unknown plugin, proxy skipped");
                continue;
            }
            proxies.insert(
                name.clone(),
                ProxyEntry {
                    conf: conf.clone(),
                    plugin,
                    udp_session: None,
                },
            );
            let _ = self
                .send_tx
                .send(Message::NewProxy(conf.to_new_proxy()))
                .await;
        }
    }

    /// Server's verdict for one `NewProxy`.
    pub async fn on_proxy_resp(&self, name: &str, remote_addr: &str, error: &str) {
        if error.is_empty() {
            log::info!(proxy = %name, remote_addr = %remote_addr, "proxy started");
        } else {
            log::warn!(proxy = %name, error = %error, "proxy rejected by server");
        }
    }

    /// Re-declare one proxy (used by health-check recovery).
    pub async fn redeclare(&self, name: &str) {
        let proxies = self.proxies.lock().await;
        if let Some(entry) = proxies.get(name) {
            let _ = self
                .send_tx
                .send(Message::NewProxy(entry.conf.to_new_proxy()))
                .await;
        }
    }

    /// Withdraw one proxy without forgetting it (health-check failure).
    pub async fn withdraw(&self, name: &str) {
        let _ = self
            .send_tx
            .send(Message::CloseProxy(CloseProxy {
                proxy_name: name.to_string(),
            }))
            .await;
    }

    pub async fn proxy_conf(&self, name: &str) -> Option<ProxyConf> {
        self.proxies.lock().await.get(name).map(|e| e.conf.clone())
    }

    /// Route an announced work connection to its proxy handler.
    pub async fn handle_work_conn(
        self: &Arc<Self>,
        start: StartWorkConn,
        conn: BoxedStream,
        server_udp_addr: Option<SocketAddr>,
    ) {
        let mut proxies = self.proxies.lock().await;
        let Some(entry) = proxies.get_mut(&start.proxy_name) else {
            log::warn!(proxy = %start.proxy_name, "work connection for unknown proxy");
            return;
        };
        let conf = entry.conf.clone();
        let plugin = entry.plugin.clone();
        let token = self.config.token.clone();

        match conf.proxy_type {
            ProxyType::Udp => {
                // One live forwarder per UDP proxy; a new work connection
                // replaces the previous session.
                if let Some(old) = entry.udp_session.take() {
                    old.cancel();
                }
                let cancel = CancellationToken::new();
                entry.udp_session = Some(cancel.clone());
                drop(proxies);
                tokio::spawn(async move {
                    if let Err(e) = run_udp_work_conn(conf, conn, token, cancel).await {
                        log::debug!(error = %e, "udp work connection ended");
                    }
                });
            }
            ProxyType::Xtcp => {
                drop(proxies);
                tokio::spawn(async move {
                    if let Err(e) = run_xtcp_work_conn(conf, conn, plugin, server_udp_addr).await {
                        log::warn!(error = %e, "xtcp hole punch failed");
                    }
                });
            }
            _ => {
                drop(proxies);
                tokio::spawn(async move {
                    if let Err(e) =
                        run_tcp_work_conn(conf, conn, token.as_bytes(), plugin, start).await
                    {
                        log::debug!(error = %e, "work connection ended");
                    }
                });
            }
        }
    }
}

/// The common TCP-shaped path: layer the work connection, write the PROXY
/// protocol header when configured, then splice against the local service
/// (or hand everything to a plugin).
pub async fn run_tcp_work_conn(
    conf: ProxyConf,
    conn: BoxedStream,
    secret: &[u8],
    plugin: Option<Arc<dyn Plugin>>,
    start: StartWorkConn,
) -> Result<()> {
    let work = apply_layers(conn, conf.use_encryption, conf.use_compression, secret).await?;

    let header = proxy_protocol_header(&conf, &start);

    if let Some(plugin) = plugin {
        return plugin.handle(work, header.unwrap_or_default()).await;
    }

    let local_addr = format!("{}:{}", conf.local_ip, conf.local_port);
    let local = tokio::time::timeout(LOCAL_CONNECT_TIMEOUT, TcpStream::connect(&local_addr))
        .await
        .map_err(|_| Error::LocalServiceUnreachable(format!("{} (timeout)", local_addr)))?
        .map_err(|e| Error::LocalServiceUnreachable(format!("{}: {}", local_addr, e)))?;
    local.set_nodelay(true).ok();
    let mut local = local;

    if let Some(header) = header {
        local.write_all(&header).await?;
    }

    let (counts, _result) = splice::join(local, work).await;
    log::debug!(
        proxy = %conf.name,
        to_local = counts.b_to_a,
        from_local = counts.a_to_b,
        "work connection closed"
    );
    Ok(())
}

fn proxy_protocol_header(conf: &ProxyConf, start: &StartWorkConn) -> Option<Vec<u8>> {
    let version = ProxyProtocolVersion::parse(&conf.proxy_protocol_version).ok()??;
    if start.src_addr.is_empty() || start.src_port == 0 {
        return None;
    }
    let src: SocketAddr = format!("{}:{}", start.src_addr, start.src_port)
        .parse()
        .ok()?;
    let dst_addr = if start.dst_addr.is_empty() {
        "127.0.0.1"
    } else {
        &start.dst_addr
    };
    let dst: SocketAddr = format!("{}:{}", dst_addr, start.dst_port).parse().ok()?;
    Some(proxy_protocol::encode_header(version, src, dst))
}

/// UDP proxy: pump `UdpPacket` frames between the work connection and the
/// local service, with a periodic keep-alive ping.
async fn run_udp_work_conn(
    conf: ProxyConf,
    conn: BoxedStream,
    token: String,
    cancel: CancellationToken,
) -> Result<()> {
    let work = apply_layers(
        conn,
        conf.use_encryption,
        conf.use_compression,
        token.as_bytes(),
    )
    .await?;
    let (mut read_half, mut write_half) = tokio::io::split(work);

    let local_addr: SocketAddr = format!("{}:{}", conf.local_ip, conf.local_port)
        .parse()
        .map_err(|e| Error::Config(format!("bad local udp endpoint: {}", e)))?;

    let (from_server_tx, from_server_rx) = mpsc::channel(128);
    let (to_server_tx, mut to_server_rx) = mpsc::channel::<Message>(128);

    tokio::spawn(udp::run_local_forwarder(
        local_addr,
        from_server_rx,
        to_server_tx.clone(),
    ));

    let reader = async {
        loop {
            match codec::read_message(&mut read_half).await {
                Ok(Message::UdpPacket(packet)) => {
                    if from_server_tx.send(packet).await.is_err() {
                        return;
                    }
                }
                Ok(Message::Pong(_)) | Ok(Message::Ping(_)) => {}
                Ok(other) => {
                    log::debug!(msg = other.name(), "unexpected message on udp work connection");
                }
                Err(_) => return,
            }
        }
    };

    let writer = async {
        let mut heartbeat = tokio::time::interval(UDP_HEARTBEAT_INTERVAL);
        loop {
            let msg = tokio::select! {
                msg = to_server_rx.recv() => match msg {
                    Some(msg) => msg,
                    None => return,
                },
                _ = heartbeat.tick() => Message::Ping(Ping {}),
            };
            if codec::write_message(&mut write_half, &msg).await.is_err() {
                return;
            }
        }
    };

    tokio::select! {
        _ = reader => {}
        _ = writer => {}
        _ = cancel.cancelled() => {}
    }
    Ok(())
}

/// XTCP server-role: the work connection only tells us a punch is wanted.
/// Call the rendezvous over UDP, punch towards the visitor, then serve a
/// KCP+mux session on the punched port whose first stream becomes the work
/// channel.
async fn run_xtcp_work_conn(
    conf: ProxyConf,
    mut conn: BoxedStream,
    plugin: Option<Arc<dyn Plugin>>,
    server_udp_addr: Option<SocketAddr>,
) -> Result<()> {
    let server_udp_addr = server_udp_addr
        .ok_or_else(|| Error::Config("server has no nat hole port".to_string()))?;

    let sid_msg = match codec::read_message(&mut conn).await? {
        Message::NatHoleSid(sid) => sid,
        other => {
            return Err(Error::Codec(format!(
                "expected NatHoleSid, got {}",
                other.name()
            )));
        }
    };

    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    let call_in = Message::NatHoleClient(NatHoleClient {
        proxy_name: conf.name.clone(),
        sid: sid_msg.sid.clone(),
    });
    let resp = nathole::exchange(
        &socket,
        server_udp_addr,
        &call_in,
        nathole::PAIRING_TIMEOUT,
    )
    .await?;
    let resp = match resp {
        Message::NatHoleResp(resp) if resp.error.is_empty() => resp,
        Message::NatHoleResp(resp) => return Err(Error::NatHoleTimeout(resp.error)),
        other => {
            return Err(Error::Codec(format!(
                "expected NatHoleResp, got {}",
                other.name()
            )));
        }
    };

    let visitor_addr: SocketAddr = resp
        .visitor_addr
        .parse()
        .map_err(|e| Error::NatHoleTimeout(format!("bad visitor address: {}", e)))?;

    nathole::send_detect(&socket, visitor_addr, &resp.sid).await?;
    let _ = codec::write_message(
        &mut conn,
        &Message::NatHoleClientDetectOk(NatHoleClientDetectOk {}),
    )
    .await;
    drop(conn);

    // Wait for the visitor's sid on the punched socket, then rebind the
    // same local port for the reliable session.
    let local_port = socket.local_addr()?.port();
    nathole::await_sid(&socket, &resp.sid).await?;
    drop(socket);

    let mut listener = kcp::listen(SocketAddr::from(([0, 0, 0, 0], local_port))).await?;
    let (kcp_stream, _peer) = tokio::time::timeout(nathole::DETECT_TIMEOUT, kcp::accept(&mut listener))
        .await
        .map_err(|_| Error::NatHoleTimeout("no kcp session after punch".to_string()))??;

    let (_connector, mut acceptor) = session::spawn_session(kcp_stream, true);
    let mut stream = acceptor
        .accept_stream()
        .await
        .ok_or_else(|| Error::NatHoleTimeout("mux session died before first stream".to_string()))?;

    // The visitor proves knowledge of the shared secret before any payload.
    let preamble = match codec::read_message(&mut stream).await? {
        Message::NatHoleVisitor(preamble) => preamble,
        other => {
            return Err(Error::Auth(format!(
                "expected visitor preamble, got {}",
                other.name()
            )));
        }
    };
    if auth_key(&conf.sk, preamble.timestamp) != preamble.sign_key {
        return Err(Error::Auth("visitor secret mismatch".to_string()));
    }

    log::info!(proxy = %conf.name, sid = %resp.sid, "nat hole session established");
    let start = StartWorkConn {
        proxy_name: conf.name.clone(),
        ..Default::default()
    };
    let sk = conf.sk.clone();
    run_tcp_work_conn(conf, stream, sk.as_bytes(), plugin, start).await
}
