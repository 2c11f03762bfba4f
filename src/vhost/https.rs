//! HTTPS virtual-host demultiplexer
//!
//! Routes by the SNI name in the ClientHello and splices the TLS stream
//! end-to-end. TLS is terminated by the exposed service, never here.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;

use crate::logger::log;
use crate::sni;
use crate::splice;
use crate::transport::AsyncStream;

use super::VhostRouter;

/// Serve one user connection accepted on the vhost HTTPS port.
pub async fn handle_https_connection<S>(
    router: Arc<VhostRouter>,
    mut stream: S,
    peer: SocketAddr,
) -> io::Result<()>
where
    S: AsyncStream,
{
    let (raw_hello, sni) = sni::read_client_hello(&mut stream).await?;
    let host = match sni {
        Some(host) => host,
        None => {
            log::debug!(peer = %peer, "dropping TLS connection without SNI");
            return Ok(());
        }
    };

    let route = match router.resolve(&host, "") {
        Some(route) => route,
        None => {
            log::debug!(peer = %peer, host = %host, "no https vhost route");
            return Ok(());
        }
    };

    let mut backend = match route.factory.open(peer).await {
        Ok(backend) => backend,
        Err(e) => {
            log::warn!(proxy = %route.proxy_name, error = %e, "https backend unavailable");
            return Ok(());
        }
    };

    backend.write_all(&raw_hello).await?;
    backend.flush().await?;

    log::connection(&route.proxy_name, &peer.to_string(), "sni-open");
    let (counts, _result) = splice::join(stream, backend).await;
    log::debug!(
        proxy = %route.proxy_name,
        rx = counts.a_to_b,
        tx = counts.b_to_a,
        "https connection closed"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vhost::test_support::{route, PipeFactory};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn peer() -> SocketAddr {
        "198.51.100.20:40000".parse().unwrap()
    }

    fn hello_record(host: &str) -> Vec<u8> {
        // Reuse the SNI test builder through its public parse contract:
        // build a record the parser accepts for `host`.
        let name = host.as_bytes();
        let mut sni_entry = vec![0u8];
        sni_entry.extend_from_slice(&(name.len() as u16).to_be_bytes());
        sni_entry.extend_from_slice(name);

        let mut sni_ext = Vec::new();
        sni_ext.extend_from_slice(&(sni_entry.len() as u16).to_be_bytes());
        sni_ext.extend_from_slice(&sni_entry);

        let mut extensions = Vec::new();
        extensions.extend_from_slice(&0u16.to_be_bytes());
        extensions.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&sni_ext);

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]);
        body.extend_from_slice(&[0u8; 32]);
        body.push(0);
        body.extend_from_slice(&2u16.to_be_bytes());
        body.extend_from_slice(&[0x13, 0x01]);
        body.push(1);
        body.push(0);
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = vec![0x01];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[tokio::test]
    async fn test_sni_routing_replays_hello() {
        let router = Arc::new(VhostRouter::new());
        let (backend_far, mut backend_near) = tokio::io::duplex(16 * 1024);
        router
            .register(
                "secure.example.com",
                "",
                route("tls-app", PipeFactory::new(vec![backend_far])),
            )
            .unwrap();

        let (mut user, server_side) = tokio::io::duplex(16 * 1024);
        let task = tokio::spawn(handle_https_connection(router, server_side, peer()));

        let record = hello_record("secure.example.com");
        user.write_all(&record).await.unwrap();
        user.write_all(b"rest-of-handshake").await.unwrap();

        let mut got = vec![0u8; record.len() + 17];
        backend_near.read_exact(&mut got).await.unwrap();
        assert_eq!(&got[..record.len()], &record[..]);
        assert_eq!(&got[record.len()..], b"rest-of-handshake");

        drop(user);
        drop(backend_near);
        let _ = task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_sni_dropped() {
        let router = Arc::new(VhostRouter::new());
        let (mut user, server_side) = tokio::io::duplex(16 * 1024);
        let task = tokio::spawn(handle_https_connection(router, server_side, peer()));

        user.write_all(&hello_record("nobody.example.com"))
            .await
            .unwrap();
        task.await.unwrap().unwrap();

        // Connection closed without any bytes back.
        let mut buf = [0u8; 1];
        let n = user.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
