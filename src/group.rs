//! Load-balancing groups
//!
//! Proxies sharing `(group, group_key)` also share one ingress: a TCP listen
//! port or a vhost route. The first registrant creates the ingress, later
//! ones must present the same key and join as round-robin targets.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::logger::log;
use crate::ports::PortManager;
use crate::transport::BoxedStream;
use crate::vhost::{ConnFactory, VhostRoute, VhostRouter};

/// Queue of accepted user connections per group member
const MEMBER_BACKLOG: usize = 32;

struct TcpMember {
    name: String,
    tx: mpsc::Sender<(TcpStream, SocketAddr)>,
}

struct TcpMembers {
    members: Vec<TcpMember>,
    cursor: usize,
}

struct TcpGroupEntry {
    port: u16,
    key: String,
    members: Arc<Mutex<TcpMembers>>,
    shutdown: CancellationToken,
}

/// Controller for TCP groups: one shared listener, round-robin dispatch.
pub struct TcpGroupCtl {
    bind_addr: String,
    port_manager: Arc<PortManager>,
    groups: tokio::sync::Mutex<HashMap<String, TcpGroupEntry>>,
}

impl TcpGroupCtl {
    pub fn new(bind_addr: String, port_manager: Arc<PortManager>) -> Self {
        Self {
            bind_addr,
            port_manager,
            groups: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Join `proxy_name` to `group`. The first member fixes the port and
    /// starts the listener; later members must match key and port.
    pub async fn register(
        &self,
        proxy_name: &str,
        group: &str,
        group_key: &str,
        port: u16,
    ) -> Result<(u16, mpsc::Receiver<(TcpStream, SocketAddr)>)> {
        let mut groups = self.groups.lock().await;

        if let Some(entry) = groups.get(group) {
            if entry.key != group_key {
                return Err(Error::GroupAuth(group.to_string()));
            }
            if port != 0 && port != entry.port {
                return Err(Error::Config(format!(
                    "group [{}] already listens on port {}, not {}",
                    group, entry.port, port
                )));
            }
            let (tx, rx) = mpsc::channel(MEMBER_BACKLOG);
            let mut members = entry.members.lock().expect("group members lock poisoned");
            members.members.push(TcpMember {
                name: proxy_name.to_string(),
                tx,
            });
            return Ok((entry.port, rx));
        }

        let port = self
            .port_manager
            .acquire(&format!("group:{}", group), port)?;
        let listener = match TcpListener::bind((self.bind_addr.as_str(), port)).await {
            Ok(listener) => listener,
            Err(e) => {
                self.port_manager.release(port);
                return Err(Error::PortUnavailable(format!(
                    "bind {}:{} failed: {}",
                    self.bind_addr, port, e
                )));
            }
        };

        let (tx, rx) = mpsc::channel(MEMBER_BACKLOG);
        let members = Arc::new(Mutex::new(TcpMembers {
            members: vec![TcpMember {
                name: proxy_name.to_string(),
                tx,
            }],
            cursor: 0,
        }));
        let shutdown = CancellationToken::new();

        let accept_members = Arc::clone(&members);
        let accept_shutdown = shutdown.clone();
        let group_name = group.to_string();
        tokio::spawn(async move {
            loop {
                let (stream, peer) = tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!(group = %group_name, error = %e, "group accept error");
                            continue;
                        }
                    },
                    _ = accept_shutdown.cancelled() => return,
                };
                dispatch_round_robin(&accept_members, stream, peer, &group_name);
            }
        });

        groups.insert(
            group.to_string(),
            TcpGroupEntry {
                port,
                key: group_key.to_string(),
                members,
                shutdown,
            },
        );
        Ok((port, rx))
    }

    /// Drop a member; the last member out closes the listener and releases
    /// the port.
    pub async fn unregister(&self, proxy_name: &str, group: &str) {
        let mut groups = self.groups.lock().await;
        let empty = match groups.get(group) {
            Some(entry) => {
                let mut members = entry.members.lock().expect("group members lock poisoned");
                members.members.retain(|m| m.name != proxy_name);
                members.members.is_empty()
            }
            None => return,
        };
        if empty {
            if let Some(entry) = groups.remove(group) {
                entry.shutdown.cancel();
                self.port_manager.release(entry.port);
            }
        }
    }
}

/// Hand one accepted connection to the next live member. Members whose
/// queue is closed or full are skipped; with no takers the connection drops.
fn dispatch_round_robin(
    members: &Arc<Mutex<TcpMembers>>,
    stream: TcpStream,
    peer: SocketAddr,
    group: &str,
) {
    let mut state = members.lock().expect("group members lock poisoned");
    if state.members.is_empty() {
        return;
    }
    let len = state.members.len();
    let start = state.cursor % len;
    state.cursor = state.cursor.wrapping_add(1);

    let mut item = (stream, peer);
    for offset in 0..len {
        let idx = (start + offset) % len;
        match state.members[idx].tx.try_send(item) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(back))
            | Err(mpsc::error::TrySendError::Closed(back)) => item = back,
        }
    }
    log::warn!(group = %group, peer = %peer, "no live group member, dropping connection");
}

struct HttpGroupEntry {
    key: String,
    factory: Arc<GroupFactory>,
}

/// Round-robin factory fronting the members of one HTTP group
pub struct GroupFactory {
    members: Mutex<Vec<(String, Arc<dyn ConnFactory>)>>,
    cursor: AtomicUsize,
}

#[async_trait]
impl ConnFactory for GroupFactory {
    async fn open(&self, src: SocketAddr) -> io::Result<BoxedStream> {
        // Snapshot the member list so no lock is held across I/O.
        let snapshot: Vec<Arc<dyn ConnFactory>> = {
            let members = self.members.lock().expect("group factory lock poisoned");
            members.iter().map(|(_, f)| Arc::clone(f)).collect()
        };
        if snapshot.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "group has no members",
            ));
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % snapshot.len();
        let mut last_err = None;
        for offset in 0..snapshot.len() {
            let factory = &snapshot[(start + offset) % snapshot.len()];
            match factory.open(src).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "group exhausted")
        }))
    }
}

/// Controller for HTTP groups: one vhost route per `(group, domain,
/// location)`, fronted by a [`GroupFactory`].
pub struct HttpGroupCtl {
    router: Arc<VhostRouter>,
    groups: Mutex<HashMap<(String, String, String), HttpGroupEntry>>,
}

impl HttpGroupCtl {
    pub fn new(router: Arc<VhostRouter>) -> Self {
        Self {
            router,
            groups: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(
        &self,
        proxy_name: &str,
        group: &str,
        group_key: &str,
        domain: &str,
        location: &str,
        route: VhostRoute,
    ) -> Result<()> {
        let key = (group.to_string(), domain.to_lowercase(), location.to_string());
        let mut groups = self.groups.lock().expect("http group lock poisoned");

        if let Some(entry) = groups.get(&key) {
            if entry.key != group_key {
                return Err(Error::GroupAuth(group.to_string()));
            }
            entry
                .factory
                .members
                .lock()
                .expect("group factory lock poisoned")
                .push((proxy_name.to_string(), route.factory));
            return Ok(());
        }

        let factory = Arc::new(GroupFactory {
            members: Mutex::new(vec![(proxy_name.to_string(), Arc::clone(&route.factory))]),
            cursor: AtomicUsize::new(0),
        });
        let grouped_route = VhostRoute {
            factory: Arc::clone(&factory) as Arc<dyn ConnFactory>,
            group_key: group_key.to_string(),
            ..route
        };
        self.router.register(domain, location, grouped_route)?;
        groups.insert(
            key,
            HttpGroupEntry {
                key: group_key.to_string(),
                factory,
            },
        );
        Ok(())
    }

    pub fn unregister(&self, proxy_name: &str, group: &str, domain: &str, location: &str) {
        let key = (group.to_string(), domain.to_lowercase(), location.to_string());
        let mut groups = self.groups.lock().expect("http group lock poisoned");
        let empty = match groups.get(&key) {
            Some(entry) => {
                let mut members = entry
                    .factory
                    .members
                    .lock()
                    .expect("group factory lock poisoned");
                members.retain(|(name, _)| name != proxy_name);
                members.is_empty()
            }
            None => return,
        };
        if empty {
            groups.remove(&key);
            self.router.unregister(domain, location);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::parse_allow_ports;
    use crate::vhost::test_support::{route, PipeFactory};
    use tokio::io::AsyncWriteExt;

    fn port_manager() -> Arc<PortManager> {
        Arc::new(PortManager::new(parse_allow_ports("").unwrap()))
    }

    #[tokio::test]
    async fn test_tcp_group_round_robin() {
        let ctl = TcpGroupCtl::new("127.0.0.1".to_string(), port_manager());
        let (port, mut rx_a) = ctl.register("a", "g", "key", 0).await.unwrap();
        let (port_b, mut rx_b) = ctl.register("b", "g", "key", 0).await.unwrap();
        assert_eq!(port, port_b);

        // Four connections must land two on each member (P3: max-min <= 1).
        for _ in 0..4 {
            let mut c = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            c.write_all(b"x").await.unwrap();
            // Keep the socket open long enough to be dispatched.
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            drop(c);
        }

        let mut count_a: i32 = 0;
        let mut count_b: i32 = 0;
        while let Ok(Some(_)) =
            tokio::time::timeout(std::time::Duration::from_millis(100), rx_a.recv()).await
        {
            count_a += 1;
        }
        while let Ok(Some(_)) =
            tokio::time::timeout(std::time::Duration::from_millis(100), rx_b.recv()).await
        {
            count_b += 1;
        }
        assert_eq!(count_a + count_b, 4);
        assert!(count_a.abs_diff(count_b) <= 1, "a={} b={}", count_a, count_b);
    }

    #[tokio::test]
    async fn test_tcp_group_key_mismatch() {
        let ctl = TcpGroupCtl::new("127.0.0.1".to_string(), port_manager());
        let (_, _rx) = ctl.register("a", "g", "right", 0).await.unwrap();
        let err = ctl.register("b", "g", "wrong", 0).await.unwrap_err();
        assert!(matches!(err, Error::GroupAuth(_)));
    }

    #[tokio::test]
    async fn test_tcp_group_releases_port_when_empty() {
        let pm = port_manager();
        let ctl = TcpGroupCtl::new("127.0.0.1".to_string(), Arc::clone(&pm));
        let (port, _rx) = ctl.register("a", "g", "key", 0).await.unwrap();
        ctl.unregister("a", "g").await;

        // The port must be reusable immediately.
        assert_eq!(pm.acquire("again", port).unwrap(), port);
    }

    #[tokio::test]
    async fn test_http_group_key_and_dispatch() {
        let router = Arc::new(VhostRouter::new());
        let ctl = HttpGroupCtl::new(Arc::clone(&router));

        let (far_a, _near_a) = tokio::io::duplex(64);
        let (far_b, _near_b) = tokio::io::duplex(64);
        ctl.register(
            "a",
            "g",
            "key",
            "lb.example.com",
            "",
            route("a", PipeFactory::new(vec![far_a])),
        )
        .unwrap();
        ctl.register(
            "b",
            "g",
            "key",
            "lb.example.com",
            "",
            route("b", PipeFactory::new(vec![far_b])),
        )
        .unwrap();

        let err = ctl
            .register(
                "c",
                "g",
                "other",
                "lb.example.com",
                "",
                route("c", PipeFactory::new(vec![])),
            )
            .unwrap_err();
        assert!(matches!(err, Error::GroupAuth(_)));

        // Both members reachable through the single route.
        let resolved = router.resolve("lb.example.com", "/").unwrap();
        let src: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        assert!(resolved.factory.open(src).await.is_ok());
        assert!(resolved.factory.open(src).await.is_ok());
        // Factories exhausted: both pipes handed out.
        assert!(resolved.factory.open(src).await.is_err());
    }

    #[tokio::test]
    async fn test_http_group_unregister_removes_route() {
        let router = Arc::new(VhostRouter::new());
        let ctl = HttpGroupCtl::new(Arc::clone(&router));
        ctl.register(
            "a",
            "g",
            "key",
            "lb.example.com",
            "",
            route("a", PipeFactory::new(vec![])),
        )
        .unwrap();
        ctl.unregister("a", "g", "lb.example.com", "");
        assert!(router.resolve("lb.example.com", "/").is_none());
    }
}
