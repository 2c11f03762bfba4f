//! STCP visitor pairing
//!
//! An STCP proxy has no public listener. A second client, the visitor,
//! dials the server, proves knowledge of the shared secret, and is spliced
//! to a work connection from the proxy's owning client. The visitor leg is
//! keyed by the shared secret; the work leg by the server token.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;

use crate::codec;
use crate::crypto::{auth_key, AUTH_TIMESTAMP_SKEW_SECS};
use crate::error::{Error, Result};
use crate::logger::log;
use crate::msg::{Message, NewVisitorConn, NewVisitorConnResp};
use crate::splice;
use crate::transport::{apply_layers, BoxedStream};

use super::proxy::WorkConnSource;
use super::StatsRegistry;

/// A registered STCP proxy reachable by name
pub struct StcpEntry {
    pub sk: String,
    pub use_encryption: bool,
    pub use_compression: bool,
    pub token: String,
    pub source: Arc<WorkConnSource>,
}

/// Name-keyed registry of STCP proxies
#[derive(Default)]
pub struct VisitorHub {
    entries: DashMap<String, Arc<StcpEntry>>,
    stats: Arc<StatsRegistry>,
}

impl VisitorHub {
    pub fn new(stats: Arc<StatsRegistry>) -> Self {
        Self {
            entries: DashMap::new(),
            stats,
        }
    }

    pub fn register(&self, name: &str, entry: StcpEntry) {
        self.entries.insert(name.to_string(), Arc::new(entry));
    }

    pub fn unregister(&self, name: &str) {
        self.entries.remove(name);
    }

    /// Handle one visitor connection end to end: verify, acknowledge,
    /// splice. Errors are answered on the wire before the connection drops.
    pub async fn handle(
        &self,
        mut stream: BoxedStream,
        msg: NewVisitorConn,
        peer: SocketAddr,
    ) -> Result<()> {
        let verified = self.verify(&msg);
        let resp = NewVisitorConnResp {
            proxy_name: msg.proxy_name.clone(),
            error: verified
                .as_ref()
                .err()
                .map(|e| e.to_string())
                .unwrap_or_default(),
        };
        codec::write_message(&mut stream, &Message::NewVisitorConnResp(resp)).await?;
        let entry = verified?;

        let visitor = apply_layers(
            stream,
            msg.use_encryption,
            msg.use_compression,
            entry.sk.as_bytes(),
        )
        .await?;

        let work = entry.source.get(Some(peer), None).await?;
        let work = apply_layers(
            work,
            entry.use_encryption,
            entry.use_compression,
            entry.token.as_bytes(),
        )
        .await?;

        log::connection(&msg.proxy_name, &peer.to_string(), "visitor-open");
        let (counts, _result) = splice::join(visitor, work).await;
        self.stats
            .record(&msg.proxy_name, counts.a_to_b, counts.b_to_a);
        log::connection(&msg.proxy_name, &peer.to_string(), "visitor-closed");
        Ok(())
    }

    fn verify(&self, msg: &NewVisitorConn) -> Result<Arc<StcpEntry>> {
        let entry = self
            .entries
            .get(&msg.proxy_name)
            .map(|e| Arc::clone(&e))
            .ok_or_else(|| Error::Auth(format!("no stcp proxy [{}]", msg.proxy_name)))?;

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        if (now - msg.timestamp).abs() > AUTH_TIMESTAMP_SKEW_SECS {
            return Err(Error::Auth("visitor timestamp too old".to_string()));
        }
        if auth_key(&entry.sk, msg.timestamp) != msg.sign_key {
            return Err(Error::Auth("visitor secret mismatch".to_string()));
        }
        Ok(entry)
    }
}
