//! Connection muxer
//!
//! One TCP bind port serves several protocols. Each accepted connection is
//! sniffed for a short prefix under a deadline and routed to the first
//! virtual listener whose predicate matches, in registration order. Sniffed
//! bytes are replayed to the selected listener.
//!
//! Predicates receive up to `need_bytes` of prefix and must answer whether
//! the prefix is still compatible; the verdict is final once `need_bytes`
//! are available. That lets `GET /~!frp` outrank a plain HTTP match without
//! racing on short reads.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::logger::log;
use crate::transport::PrefixedStream;

/// How long a fresh connection may take to produce its protocol prefix
const SNIFF_TIMEOUT: Duration = Duration::from_secs(10);

/// Pending connections per virtual listener before new ones are dropped
const LISTENER_BACKLOG: usize = 64;

/// Connection delivered by the muxer, with sniffed bytes replayed in front
pub type MuxedConn = (PrefixedStream<TcpStream>, SocketAddr);

type Predicate = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

struct Entry {
    need_bytes: usize,
    predicate: Predicate,
    tx: mpsc::Sender<MuxedConn>,
}

/// A protocol-specific accept queue fed by the muxer
pub struct VirtualListener {
    rx: mpsc::Receiver<MuxedConn>,
}

impl VirtualListener {
    /// Next connection for this protocol; `None` once the muxer stopped.
    pub async fn accept(&mut self) -> Option<MuxedConn> {
        self.rx.recv().await
    }
}

/// Builder collecting virtual listeners before the accept loop starts
#[derive(Default)]
pub struct ConnMuxer {
    entries: Vec<Entry>,
    default_tx: Option<mpsc::Sender<MuxedConn>>,
}

impl ConnMuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a virtual listener. Earlier registrations win ties.
    pub fn listen(
        &mut self,
        need_bytes: usize,
        predicate: impl Fn(&[u8]) -> bool + Send + Sync + 'static,
    ) -> VirtualListener {
        let (tx, rx) = mpsc::channel(LISTENER_BACKLOG);
        self.entries.push(Entry {
            need_bytes,
            predicate: Box::new(predicate),
            tx,
        });
        VirtualListener { rx }
    }

    /// The listener receiving everything no predicate claimed.
    pub fn default_listener(&mut self) -> VirtualListener {
        let (tx, rx) = mpsc::channel(LISTENER_BACKLOG);
        self.default_tx = Some(tx);
        VirtualListener { rx }
    }

    /// Run the accept loop until `shutdown` fires. Consumes the muxer; all
    /// virtual listeners must be taken beforehand.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) {
        let max_need = self.entries.iter().map(|e| e.need_bytes).max().unwrap_or(0);
        let entries = std::sync::Arc::new(self.entries);
        let default_tx = self.default_tx;

        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::warn!(error = %e, "muxer accept error");
                        continue;
                    }
                },
                _ = shutdown.cancelled() => {
                    log::debug!("muxer shutting down");
                    return;
                }
            };

            stream.set_nodelay(true).ok();
            let entries = std::sync::Arc::clone(&entries);
            let default_tx = default_tx.clone();
            tokio::spawn(async move {
                match sniff(stream, max_need, &entries).await {
                    Ok((Some(index), conn)) => {
                        if entries[index].tx.try_send((conn, peer)).is_err() {
                            log::warn!(peer = %peer, "virtual listener backlog full, dropping connection");
                        }
                    }
                    Ok((None, conn)) => {
                        if let Some(tx) = default_tx {
                            if tx.try_send((conn, peer)).is_err() {
                                log::warn!(peer = %peer, "default listener backlog full, dropping connection");
                            }
                        }
                    }
                    Err(e) => {
                        log::debug!(peer = %peer, error = %e, "dropping unreadable connection");
                    }
                }
            });
        }
    }
}

/// Read prefix bytes until a registered predicate is confirmed or refuted.
/// Timeouts and EOF fall through to the default listener with whatever was
/// read so far.
async fn sniff(
    mut stream: TcpStream,
    max_need: usize,
    entries: &[Entry],
) -> std::io::Result<(Option<usize>, PrefixedStream<TcpStream>)> {
    let mut buf = vec![0u8; max_need.max(1)];
    let mut have = 0usize;

    let selected = tokio::time::timeout(SNIFF_TIMEOUT, async {
        loop {
            let mut undecided = false;
            for (index, entry) in entries.iter().enumerate() {
                let n = have.min(entry.need_bytes);
                if (entry.predicate)(&buf[..n]) {
                    if have >= entry.need_bytes {
                        return Ok::<_, std::io::Error>(Some(index));
                    }
                    // A higher-priority candidate is still possible; read on.
                    undecided = true;
                    break;
                }
            }
            if !undecided && have > 0 {
                return Ok(None);
            }
            if have >= max_need {
                return Ok(None);
            }
            let n = stream.read(&mut buf[have..]).await?;
            if n == 0 {
                return Ok(None);
            }
            have += n;
        }
    })
    .await
    .unwrap_or(Ok(None))?;

    buf.truncate(have);
    Ok((selected, PrefixedStream::new(Bytes::from(buf), stream)))
}

/// Prefix-compatibility check for plain HTTP: the first bytes must be the
/// start of a known request method.
pub fn looks_like_http(prefix: &[u8]) -> bool {
    const METHODS: [&[u8]; 9] = [
        b"GET ", b"POST", b"PUT ", b"HEAD", b"DELE", b"OPTI", b"PATC", b"CONN", b"TRAC",
    ];
    if prefix.is_empty() {
        return true;
    }
    METHODS.iter().any(|m| {
        let n = prefix.len().min(m.len());
        &m[..n] == &prefix[..n]
    })
}

/// Number of bytes [`looks_like_http`] needs for a final verdict
pub const HTTP_NEED_BYTES: usize = 4;

/// Prefix-compatibility check for the WebSocket tunnel endpoint
pub fn looks_like_tunnel_websocket(prefix: &[u8]) -> bool {
    let expect: &[u8] = b"GET /~!frp";
    let n = prefix.len().min(expect.len());
    prefix[..n] == expect[..n]
}

/// Number of bytes [`looks_like_tunnel_websocket`] needs for a final verdict
pub const WEBSOCKET_NEED_BYTES: usize = 10;
