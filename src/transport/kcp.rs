//! KCP transport
//!
//! Used two ways: as an alternative dial protocol for the control connection,
//! and as the reliable session layered over a freshly punched UDP path.

use std::io;
use std::net::SocketAddr;

use tokio_kcp::{KcpConfig, KcpListener, KcpStream};

use super::{boxed, BoxedStream};

/// Shared KCP tuning for all tunnel uses
pub fn kcp_config() -> KcpConfig {
    KcpConfig::default()
}

fn kcp_err(e: kcp::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

/// Bind a KCP listener on `addr`.
pub async fn listen(addr: SocketAddr) -> io::Result<KcpListener> {
    KcpListener::bind(kcp_config(), addr).await.map_err(kcp_err)
}

/// Accept one KCP session.
pub async fn accept(listener: &mut KcpListener) -> io::Result<(BoxedStream, SocketAddr)> {
    let (stream, peer) = listener.accept().await.map_err(kcp_err)?;
    Ok((boxed(stream), peer))
}

/// Dial a KCP session to `addr`.
pub async fn connect(addr: SocketAddr) -> io::Result<BoxedStream> {
    let stream = KcpStream::connect(&kcp_config(), addr)
        .await
        .map_err(kcp_err)?;
    Ok(boxed(stream))
}
