//! NAT hole punching rendezvous
//!
//! XTCP never relays payload through the server. The server only brokers the
//! exchange: a visitor announces itself over UDP, the server hands the
//! owning client a fresh sid through a work connection, the client calls in
//! over UDP, and both sides learn each other's observed address from
//! `NatHoleResp`. The endpoints then punch with raw sid datagrams and layer
//! KCP + a stream session over the opened path. The shared secret is
//! verified end-to-end by the server-role client, not by the server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::net::UdpSocket;

use crate::error::{Error, Result};
use crate::logger::log;
use crate::msg::{Message, NatHoleResp};

/// A buffered visitor is dropped if the client does not call in this fast
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(5);

/// How long each endpoint waits for the peer's sid datagram
pub const DETECT_TIMEOUT: Duration = Duration::from_secs(8);

const MAX_UDP_MESSAGE: usize = 4 * 1024;

/// Encode one control message into a single datagram (same tag + length +
/// JSON frame as the TCP codec).
pub fn encode_datagram(msg: &Message) -> Result<Vec<u8>> {
    let payload = msg.encode_payload()?;
    let mut frame = Vec::with_capacity(1 + 8 + payload.len());
    frame.push(msg.tag());
    frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode one datagram into a control message.
pub fn decode_datagram(data: &[u8]) -> Result<Message> {
    if data.len() < 9 {
        return Err(Error::Codec("datagram shorter than frame header".to_string()));
    }
    let tag = data[0];
    let len = u64::from_be_bytes(data[1..9].try_into().expect("sliced 8 bytes")) as usize;
    if data.len() < 9 + len {
        return Err(Error::Codec("datagram shorter than declared frame".to_string()));
    }
    Message::decode(tag, &data[9..9 + len])
}

/// Fresh random sid per punch attempt
pub fn new_sid() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

/// Asks an XTCP proxy's owning client to call in for one punch attempt
#[async_trait::async_trait]
pub trait SidNotifier: Send + Sync {
    async fn notify(&self, sid: &str) -> Result<()>;
}

struct PendingPunch {
    proxy_name: String,
    visitor_addr: SocketAddr,
}

/// Server-side rendezvous point, one per server, on its own UDP port
pub struct NatHoleController {
    socket: Arc<UdpSocket>,
    proxies: DashMap<String, Arc<dyn SidNotifier>>,
    pending: Arc<DashMap<String, PendingPunch>>,
}

impl NatHoleController {
    pub async fn bind(addr: SocketAddr) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            proxies: DashMap::new(),
            pending: Arc::new(DashMap::new()),
        }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Called when an XTCP proxy registers; `notifier` delivers the sid to
    /// the owning client over a work connection.
    pub fn register_proxy(&self, name: &str, notifier: Arc<dyn SidNotifier>) {
        self.proxies.insert(name.to_string(), notifier);
    }

    pub fn unregister_proxy(&self, name: &str) {
        self.proxies.remove(name);
    }

    /// Receive loop; runs for the life of the server.
    pub async fn run(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_UDP_MESSAGE];
        loop {
            let (n, from) = match self.socket.recv_from(&mut buf).await {
                Ok(pair) => pair,
                Err(e) => {
                    log::warn!(error = %e, "nat hole socket read error");
                    continue;
                }
            };
            let msg = match decode_datagram(&buf[..n]) {
                Ok(msg) => msg,
                Err(e) => {
                    log::debug!(from = %from, error = %e, "undecodable nat hole datagram");
                    continue;
                }
            };
            match msg {
                Message::NatHoleVisitor(visitor) => {
                    self.handle_visitor(visitor.proxy_name, from).await;
                }
                Message::NatHoleClient(client) => {
                    self.handle_client(client.proxy_name, client.sid, from).await;
                }
                other => {
                    log::debug!(from = %from, msg = other.name(), "unexpected nat hole message");
                }
            }
        }
    }

    async fn handle_visitor(&self, proxy_name: String, visitor_addr: SocketAddr) {
        let Some(notifier) = self.proxies.get(&proxy_name).map(|n| Arc::clone(&n)) else {
            log::debug!(proxy = %proxy_name, "nat hole visitor for unknown proxy");
            let resp = Message::NatHoleResp(NatHoleResp {
                error: format!("no xtcp proxy [{}]", proxy_name),
                ..Default::default()
            });
            self.send_to(&resp, visitor_addr).await;
            return;
        };

        let sid = new_sid();
        self.pending.insert(
            sid.clone(),
            PendingPunch {
                proxy_name: proxy_name.clone(),
                visitor_addr,
            },
        );

        // Expire the attempt if the client never calls in.
        let pending = Arc::clone(&self.pending);
        let expire_sid = sid.clone();
        tokio::spawn(async move {
            tokio::time::sleep(PAIRING_TIMEOUT).await;
            if pending.remove(&expire_sid).is_some() {
                log::debug!(sid = %expire_sid, "nat hole pairing timed out");
            }
        });

        if let Err(e) = notifier.notify(&sid).await {
            log::warn!(proxy = %proxy_name, error = %e, "failed to reach xtcp client");
            self.pending.remove(&sid);
            let resp = Message::NatHoleResp(NatHoleResp {
                error: "xtcp client unreachable".to_string(),
                ..Default::default()
            });
            self.send_to(&resp, visitor_addr).await;
        }
    }

    async fn handle_client(&self, proxy_name: String, sid: String, client_addr: SocketAddr) {
        let Some((_, punch)) = self.pending.remove(&sid) else {
            log::debug!(sid = %sid, "nat hole client with unknown sid");
            return;
        };
        if punch.proxy_name != proxy_name {
            log::warn!(sid = %sid, "nat hole client proxy name mismatch");
            return;
        }

        let resp = NatHoleResp {
            sid: sid.clone(),
            visitor_addr: punch.visitor_addr.to_string(),
            client_addr: client_addr.to_string(),
            error: String::new(),
        };
        self.send_to(&Message::NatHoleResp(resp.clone()), client_addr).await;
        self.send_to(&Message::NatHoleResp(resp), punch.visitor_addr).await;
        log::info!(
            proxy = %proxy_name,
            sid = %sid,
            visitor = %punch.visitor_addr,
            client = %client_addr,
            "nat hole pair brokered"
        );
    }

    async fn send_to(&self, msg: &Message, addr: SocketAddr) {
        match encode_datagram(msg) {
            Ok(datagram) => {
                if let Err(e) = self.socket.send_to(&datagram, addr).await {
                    log::debug!(to = %addr, error = %e, "nat hole send error");
                }
            }
            Err(e) => log::warn!(error = %e, "nat hole encode error"),
        }
    }
}

/// Send one message and wait for the next decodable reply on the socket.
pub async fn exchange(
    socket: &UdpSocket,
    server: SocketAddr,
    msg: &Message,
    timeout: Duration,
) -> Result<Message> {
    let datagram = encode_datagram(msg)?;
    socket.send_to(&datagram, server).await?;

    let mut buf = vec![0u8; MAX_UDP_MESSAGE];
    let (n, _from) = tokio::time::timeout(timeout, socket.recv_from(&mut buf))
        .await
        .map_err(|_| Error::NatHoleTimeout("no response from rendezvous".to_string()))??;
    decode_datagram(&buf[..n])
}

/// Fire the sid datagram at the peer's observed address.
pub async fn send_detect(socket: &UdpSocket, peer: SocketAddr, sid: &str) -> Result<()> {
    socket.send_to(sid.as_bytes(), peer).await?;
    Ok(())
}

/// Listening side: wait for a datagram equal to `sid` and echo it back.
/// Returns the address the sid arrived from.
pub async fn await_sid(socket: &UdpSocket, sid: &str) -> Result<SocketAddr> {
    let mut buf = vec![0u8; 512];
    let deadline = tokio::time::Instant::now() + DETECT_TIMEOUT;
    loop {
        let (n, from) = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf))
            .await
            .map_err(|_| Error::NatHoleTimeout(format!("no sid datagram for [{}]", sid)))??;
        if &buf[..n] == sid.as_bytes() {
            socket.send_to(sid.as_bytes(), from).await?;
            return Ok(from);
        }
        log::debug!(from = %from, "ignoring non-sid datagram during punch");
    }
}

/// Punching side: wait for the listener to echo our sid back.
pub async fn await_echo(socket: &UdpSocket, sid: &str) -> Result<SocketAddr> {
    let mut buf = vec![0u8; 512];
    let deadline = tokio::time::Instant::now() + DETECT_TIMEOUT;
    loop {
        let (n, from) = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf))
            .await
            .map_err(|_| Error::NatHoleTimeout(format!("no sid echo for [{}]", sid)))??;
        if &buf[..n] == sid.as_bytes() {
            return Ok(from);
        }
    }
}
