//! Per-client control sessions
//!
//! One `Control` per logged-in client. Three fibers own the transport: a
//! reader decoding frames, a writer draining the outbound queue, and a
//! dispatcher handling messages plus the heartbeat clock. A supervisor fiber
//! releases proxies and signals full drain once the session dies, which is
//! what re-login eviction waits on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::codec;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::logger::log;
use crate::msg::{LoginResp, Message, NewProxyResp, Pong, ReqWorkConn};
use crate::transport::BoxedStream;
use crate::version;

use super::proxy::{self, ServerProxy};
use super::ResourceCenter;

/// How long a user session waits for the client to supply a work connection
const WORK_CONN_WAIT: Duration = Duration::from_secs(60);

/// Outbound message queue depth per control session
const SEND_QUEUE: usize = 100;

/// Registry enforcing at most one control session per run id
#[derive(Default)]
pub struct ControlManager {
    ctls: AsyncMutex<HashMap<String, Arc<Control>>>,
}

impl ControlManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `ctl` under its run id, returning the previous session if one
    /// was still registered. The caller must drain the old session before
    /// starting the new one.
    pub async fn install(&self, ctl: Arc<Control>) -> Option<Arc<Control>> {
        let mut ctls = self.ctls.lock().await;
        ctls.insert(ctl.run_id.clone(), ctl)
    }

    /// Remove `ctl` if it is still the registered session for its run id.
    pub async fn remove(&self, ctl: &Arc<Control>) {
        let mut ctls = self.ctls.lock().await;
        if let Some(current) = ctls.get(&ctl.run_id) {
            if Arc::ptr_eq(current, ctl) {
                ctls.remove(&ctl.run_id);
            }
        }
    }

    pub async fn get(&self, run_id: &str) -> Option<Arc<Control>> {
        self.ctls.lock().await.get(run_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.ctls.lock().await.len()
    }
}

/// Server side of one client's control connection
pub struct Control {
    pub run_id: String,
    pub user: String,
    pool_count: usize,
    config: Arc<ServerConfig>,
    resources: Arc<ResourceCenter>,

    send_tx: mpsc::Sender<Message>,
    send_rx: AsyncMutex<Option<mpsc::Receiver<Message>>>,
    work_tx: mpsc::Sender<BoxedStream>,
    work_rx: AsyncMutex<mpsc::Receiver<BoxedStream>>,

    proxies: AsyncMutex<HashMap<String, Arc<dyn ServerProxy>>>,
    last_ping: Mutex<Instant>,

    shutdown: CancellationToken,
    closed_done: CancellationToken,
}

impl Control {
    pub fn new(
        run_id: String,
        user: String,
        pool_count: usize,
        config: Arc<ServerConfig>,
        resources: Arc<ResourceCenter>,
    ) -> Arc<Self> {
        let pool_count = pool_count.clamp(1, config.max_pool_count.max(1));
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE);
        let (work_tx, work_rx) = mpsc::channel(pool_count.max(1));
        Arc::new(Self {
            run_id,
            user,
            pool_count,
            config,
            resources,
            send_tx,
            send_rx: AsyncMutex::new(Some(send_rx)),
            work_tx,
            work_rx: AsyncMutex::new(work_rx),
            proxies: AsyncMutex::new(HashMap::new()),
            last_ping: Mutex::new(Instant::now()),
            shutdown: CancellationToken::new(),
            closed_done: CancellationToken::new(),
        })
    }

    /// Start the session fibers and greet the client. `manager` is used by
    /// the supervisor to deregister on drain.
    pub async fn start(
        self: &Arc<Self>,
        stream: BoxedStream,
        manager: Arc<ControlManager>,
    ) {
        let (mut read_half, mut write_half) = tokio::io::split(stream);

        // Greeting and initial pool warm-up go through the ordinary queue.
        let greeting = Message::LoginResp(LoginResp {
            version: version::full().to_string(),
            run_id: self.run_id.clone(),
            server_udp_port: self.resources.server_udp_port,
            error: String::new(),
        });
        let _ = self.send_tx.send(greeting).await;
        for _ in 0..self.pool_count {
            let _ = self.send_tx.send(Message::ReqWorkConn(ReqWorkConn {})).await;
        }

        let (msg_tx, msg_rx) = mpsc::channel::<Message>(SEND_QUEUE);

        // Reader: decode frames until the transport dies.
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
                        log::debug!(run_id = %reader_ctl.run_id, "control connection EOF");
                        break;
                    }
                    Err(e) => {
                        log::warn!(run_id = %reader_ctl.run_id, error = %e, "control read error");
                        break;
                    }
                }
            }
            reader_ctl.shutdown.cancel();
        });

        // Writer: drain the outbound queue.
        let writer_ctl = Arc::clone(self);
        let mut send_rx = self
            .send_rx
            .lock()
            .await
            .take()
            .expect("control started twice");
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
                    log::warn!(run_id = %writer_ctl.run_id, error = %e, "control write error");
                    break;
                }
            }
            writer_ctl.shutdown.cancel();
        });

        // Dispatcher: inbound messages plus the heartbeat clock.
        let dispatcher_ctl = Arc::clone(self);
        tokio::spawn(async move { dispatcher_ctl.dispatch(msg_rx).await });

        // Supervisor: release everything once the session dies.
        let supervisor_ctl = Arc::clone(self);
        tokio::spawn(async move {
            supervisor_ctl.shutdown.cancelled().await;
            supervisor_ctl.release_all().await;
            manager.remove(&supervisor_ctl).await;
            supervisor_ctl.closed_done.cancel();
            log::info!(run_id = %supervisor_ctl.run_id, "control session drained");
        });
    }

    async fn dispatch(self: Arc<Self>, mut msg_rx: mpsc::Receiver<Message>) {
        let mut heartbeat = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = heartbeat.tick() => {
                    let idle = self.last_ping.lock().expect("last ping lock poisoned").elapsed();
                    if idle > self.config.heartbeat_timeout {
                        log::warn!(run_id = %self.run_id, idle_secs = idle.as_secs(), "heartbeat timeout");
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
            Message::Ping(_) => {
                *self.last_ping.lock().expect("last ping lock poisoned") = Instant::now();
                let _ = self.send_tx.send(Message::Pong(Pong {})).await;
            }
            Message::NewProxy(new_proxy) => {
                let name = new_proxy.proxy_name.clone();
                let resp = match self.register_proxy(new_proxy).await {
                    Ok(remote_addr) => NewProxyResp {
                        proxy_name: name,
                        remote_addr,
                        error: String::new(),
                    },
                    Err(e) => {
                        log::warn!(run_id = %self.run_id, error = %e, "proxy registration failed");
                        NewProxyResp {
                            proxy_name: name,
                            remote_addr: String::new(),
                            error: e.to_string(),
                        }
                    }
                };
                let _ = self.send_tx.send(Message::NewProxyResp(resp)).await;
            }
            Message::CloseProxy(close) => {
                self.close_proxy(&close.proxy_name).await;
            }
            Message::NatHoleClientDetectOk(_) => {}
            other => {
                log::debug!(run_id = %self.run_id, msg = other.name(), "ignoring unexpected control message");
            }
        }
    }

    async fn register_proxy(self: &Arc<Self>, conf: crate::msg::NewProxy) -> Result<String> {
        let name = conf.proxy_name.clone();
        self.resources.proxy_names.register(&name, &self.run_id)?;

        let created = proxy::create_proxy(
            Arc::downgrade(self),
            Arc::clone(&self.config),
            Arc::clone(&self.resources),
            conf,
        )
        .await;

        let proxy = match created {
            Ok(proxy) => proxy,
            Err(e) => {
                self.resources.proxy_names.unregister(&name);
                return Err(e);
            }
        };

        match proxy.run().await {
            Ok(remote_addr) => {
                self.proxies.lock().await.insert(name.clone(), proxy);
                log::info!(run_id = %self.run_id, proxy = %name, remote_addr = %remote_addr, "proxy registered");
                Ok(remote_addr)
            }
            Err(e) => {
                proxy.close().await;
                self.resources.proxy_names.unregister(&name);
                Err(e)
            }
        }
    }

    /// Close one proxy; listening resources are released before the name is
    /// freed, and a second close is a no-op.
    pub async fn close_proxy(&self, name: &str) {
        let proxy = self.proxies.lock().await.remove(name);
        if let Some(proxy) = proxy {
            proxy.close().await;
            self.resources.proxy_names.unregister(name);
            log::info!(run_id = %self.run_id, proxy = %name, "proxy closed");
        }
    }

    async fn release_all(&self) {
        let names: Vec<String> = self.proxies.lock().await.keys().cloned().collect();
        for name in names {
            self.close_proxy(&name).await;
        }
        // Discard pooled work connections.
        let mut work_rx = self.work_rx.lock().await;
        while work_rx.try_recv().is_ok() {}
    }

    /// Begin shutdown without waiting.
    pub fn start_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Resolves once every proxy and work connection has been released.
    pub async fn wait_closed(&self) {
        self.closed_done.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Deliver a `NewWorkConn` transport into the pool; surplus connections
    /// beyond the pool size are dropped on the floor.
    pub fn register_work_conn(&self, conn: BoxedStream) {
        if self.work_tx.try_send(conn).is_err() {
            log::debug!(run_id = %self.run_id, "work conn pool full, discarding connection");
        }
    }

    /// Take one work connection, asking the client for a fresh one when the
    /// pool is empty, and top the pool back up afterwards.
    pub async fn get_work_conn(&self) -> Result<BoxedStream> {
        let mut work_rx = self.work_rx.lock().await;

        if let Ok(conn) = work_rx.try_recv() {
            // Replenish in the background.
            let _ = self.send_tx.try_send(Message::ReqWorkConn(ReqWorkConn {}));
            return Ok(conn);
        }

        self.send_tx
            .try_send(Message::ReqWorkConn(ReqWorkConn {}))
            .map_err(|_| Error::PoolExhausted(self.run_id.clone()))?;

        match tokio::time::timeout(WORK_CONN_WAIT, work_rx.recv()).await {
            Ok(Some(conn)) => Ok(conn),
            Ok(None) => Err(Error::PoolExhausted(self.run_id.clone())),
            Err(_) => Err(Error::PeerTimeout(format!(
                "no work connection from [{}] within {:?}",
                self.run_id, WORK_CONN_WAIT
            ))),
        }
    }

    /// Queue a message to the client.
    pub async fn send_message(&self, msg: Message) -> Result<()> {
        self.send_tx
            .send(msg)
            .await
            .map_err(|_| Error::Codec("control session closed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::boxed;

    fn test_resources() -> Arc<ResourceCenter> {
        ResourceCenter::for_tests()
    }

    fn test_config() -> Arc<ServerConfig> {
        Arc::new(ServerConfig::default())
    }

    fn new_control(run_id: &str) -> Arc<Control> {
        Control::new(
            run_id.to_string(),
            "alice".to_string(),
            1,
            test_config(),
            test_resources(),
        )
    }

    #[tokio::test]
    async fn test_manager_single_session_per_run_id() {
        let manager = Arc::new(ControlManager::new());
        let first = new_control("alice-1");
        let second = new_control("alice-1");

        assert!(manager.install(Arc::clone(&first)).await.is_none());
        let evicted = manager.install(Arc::clone(&second)).await.unwrap();
        assert!(Arc::ptr_eq(&evicted, &first));
        assert_eq!(manager.len().await, 1);

        // Removing the evicted control must not unregister the live one.
        manager.remove(&first).await;
        assert!(manager.get("alice-1").await.is_some());
        manager.remove(&second).await;
        assert!(manager.get("alice-1").await.is_none());
    }

    #[tokio::test]
    async fn test_work_conn_pool_take_and_replenish() {
        let ctl = new_control("alice-2");
        let (a, _b) = tokio::io::duplex(64);
        ctl.register_work_conn(boxed(a));

        let conn = ctl.get_work_conn().await;
        assert!(conn.is_ok());
    }

    #[tokio::test]
    async fn test_work_conn_pool_overflow_discards() {
        let ctl = new_control("alice-3");
        for _ in 0..5 {
            let (a, _b) = tokio::io::duplex(64);
            // Pool size is 1; the extra connections are dropped quietly.
            ctl.register_work_conn(boxed(a));
        }
        assert!(ctl.get_work_conn().await.is_ok());
    }

    #[tokio::test]
    async fn test_login_resp_and_req_work_conn_sent_on_start() {
        let manager = Arc::new(ControlManager::new());
        let ctl = new_control("alice-4");
        manager.install(Arc::clone(&ctl)).await;

        let (server_io, client_io) = tokio::io::duplex(16 * 1024);
        ctl.start(boxed(server_io), Arc::clone(&manager)).await;

        let mut client_io = client_io;
        let first = codec::read_message(&mut client_io).await.unwrap();
        match first {
            Message::LoginResp(resp) => {
                assert_eq!(resp.run_id, "alice-4");
                assert!(resp.error.is_empty());
            }
            other => panic!("expected LoginResp, got {}", other.name()),
        }
        let second = codec::read_message(&mut client_io).await.unwrap();
        assert!(matches!(second, Message::ReqWorkConn(_)));
    }

    #[tokio::test]
    async fn test_ping_gets_pong_and_refreshes_deadline() {
        let manager = Arc::new(ControlManager::new());
        let ctl = new_control("alice-5");
        manager.install(Arc::clone(&ctl)).await;

        let (server_io, client_io) = tokio::io::duplex(16 * 1024);
        ctl.start(boxed(server_io), Arc::clone(&manager)).await;

        let mut client_io = client_io;
        // Skip greeting + pool warm-up.
        let _ = codec::read_message(&mut client_io).await.unwrap();
        let _ = codec::read_message(&mut client_io).await.unwrap();

        let before = *ctl.last_ping.lock().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        codec::write_message(&mut client_io, &Message::Ping(crate::msg::Ping {}))
            .await
            .unwrap();
        let reply = codec::read_message(&mut client_io).await.unwrap();
        assert!(matches!(reply, Message::Pong(_)));
        assert!(*ctl.last_ping.lock().unwrap() > before);
    }

    #[tokio::test]
    async fn test_transport_eof_triggers_drain() {
        let manager = Arc::new(ControlManager::new());
        let ctl = new_control("alice-6");
        manager.install(Arc::clone(&ctl)).await;

        let (server_io, client_io) = tokio::io::duplex(16 * 1024);
        ctl.start(boxed(server_io), Arc::clone(&manager)).await;
        drop(client_io);

        tokio::time::timeout(Duration::from_secs(5), ctl.wait_closed())
            .await
            .expect("control must drain after EOF");
        assert!(manager.get("alice-6").await.is_none());
    }
}
