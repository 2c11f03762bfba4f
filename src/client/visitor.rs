//! Visitor side of STCP and XTCP proxies
//!
//! A visitor exposes a local listen port; each accepted connection is
//! carried to the `server`-role peer either through the rendezvous server
//! (STCP) or over a freshly punched path (XTCP).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

use crate::codec;
use crate::config::{ProxyType, VisitorConf};
use crate::crypto::auth_key;
use crate::error::{Error, Result};
use crate::logger::log;
use crate::msg::{Message, NatHoleVisitor, NewVisitorConn};
use crate::nathole;
use crate::session;
use crate::splice;
use crate::transport::{apply_layers, kcp};

use super::Transporter;

/// Deadline for the server's answer to a visitor connection
const VISITOR_RESP_TIMEOUT: Duration = Duration::from_secs(10);

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Start listeners for all configured visitors. The returned token tears
/// them down on reconnect.
pub async fn spawn_visitors(
    transporter: Arc<Transporter>,
    confs: impl Iterator<Item = VisitorConf>,
    server_udp_addr: Option<SocketAddr>,
) -> Result<CancellationToken> {
    let stop = CancellationToken::new();
    for conf in confs {
        let listener = TcpListener::bind((conf.bind_addr.as_str(), conf.bind_port))
            .await
            .map_err(|e| {
                Error::Config(format!(
                    "visitor [{}] cannot bind {}:{}: {}",
                    conf.name, conf.bind_addr, conf.bind_port, e
                ))
            })?;
        log::info!(
            visitor = %conf.name,
            addr = %format!("{}:{}", conf.bind_addr, conf.bind_port),
            "visitor listening"
        );

        let transporter = Arc::clone(&transporter);
        let stop = stop.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    accepted = listener.accept() => accepted,
                    _ = stop.cancelled() => return,
                };
                let Ok((user, peer)) = accepted else { continue };
                user.set_nodelay(true).ok();

                let conf = conf.clone();
                let transporter = Arc::clone(&transporter);
                tokio::spawn(async move {
                    let result = match conf.proxy_type {
                        ProxyType::Stcp => handle_stcp_user(&conf, &transporter, user).await,
                        ProxyType::Xtcp => {
                            handle_xtcp_user(&conf, user, server_udp_addr).await
                        }
                        _ => Err(Error::Config("visitor must be stcp or xtcp".to_string())),
                    };
                    if let Err(e) = result {
                        log::warn!(visitor = %conf.name, peer = %peer, error = %e, "visitor session failed");
                    }
                });
            }
        });
    }
    Ok(stop)
}

/// STCP: dial the server, authenticate with the shared secret, splice.
async fn handle_stcp_user(
    conf: &VisitorConf,
    transporter: &Transporter,
    user: TcpStream,
) -> Result<()> {
    let mut conn = transporter.open().await?;

    let timestamp = unix_now();
    let request = Message::NewVisitorConn(NewVisitorConn {
        proxy_name: conf.server_name.clone(),
        sign_key: auth_key(&conf.sk, timestamp),
        timestamp,
        use_encryption: conf.use_encryption,
        use_compression: conf.use_compression,
    });
    codec::write_message(&mut conn, &request).await?;

    let resp = tokio::time::timeout(VISITOR_RESP_TIMEOUT, codec::read_message(&mut conn))
        .await
        .map_err(|_| Error::PeerTimeout("visitor response".to_string()))??;
    match resp {
        Message::NewVisitorConnResp(resp) if resp.error.is_empty() => {}
        Message::NewVisitorConnResp(resp) => return Err(Error::Auth(resp.error)),
        other => {
            return Err(Error::Codec(format!(
                "expected NewVisitorConnResp, got {}",
                other.name()
            )));
        }
    }

    let tunnel = apply_layers(
        conn,
        conf.use_encryption,
        conf.use_compression,
        conf.sk.as_bytes(),
    )
    .await?;

    let (counts, _result) = splice::join(user, tunnel).await;
    log::debug!(
        visitor = %conf.name,
        tx = counts.a_to_b,
        rx = counts.b_to_a,
        "visitor session closed"
    );
    Ok(())
}

/// XTCP: run the rendezvous dance, punch, and carry the user connection
/// over the first stream of a KCP+mux session.
async fn handle_xtcp_user(
    conf: &VisitorConf,
    user: TcpStream,
    server_udp_addr: Option<SocketAddr>,
) -> Result<()> {
    let server_udp_addr = server_udp_addr
        .ok_or_else(|| Error::Config("server has no nat hole port".to_string()))?;

    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    let timestamp = unix_now();
    let announce = Message::NatHoleVisitor(NatHoleVisitor {
        proxy_name: conf.server_name.clone(),
        sign_key: auth_key(&conf.sk, timestamp),
        timestamp,
    });
    let resp = nathole::exchange(&socket, server_udp_addr, &announce, nathole::PAIRING_TIMEOUT)
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

    let client_addr: SocketAddr = resp
        .client_addr
        .parse()
        .map_err(|e| Error::NatHoleTimeout(format!("bad client address: {}", e)))?;

    // Punch towards the peer and wait for our sid to come back.
    nathole::send_detect(&socket, client_addr, &resp.sid).await?;
    nathole::await_echo(&socket, &resp.sid).await?;
    drop(socket);

    let kcp_stream = kcp::connect(client_addr).await?;
    let (connector, _acceptor) = session::spawn_session(kcp_stream, false);
    let mut stream = connector.open_stream().await?;

    // Prove knowledge of the shared secret before any payload.
    let timestamp = unix_now();
    let preamble = Message::NatHoleVisitor(NatHoleVisitor {
        proxy_name: conf.server_name.clone(),
        sign_key: auth_key(&conf.sk, timestamp),
        timestamp,
    });
    codec::write_message(&mut stream, &preamble).await?;

    let tunnel = apply_layers(
        stream,
        conf.use_encryption,
        conf.use_compression,
        conf.sk.as_bytes(),
    )
    .await?;

    log::info!(visitor = %conf.name, sid = %resp.sid, "nat hole session established");
    let (counts, _result) = splice::join(user, tunnel).await;
    log::debug!(
        visitor = %conf.name,
        tx = counts.a_to_b,
        rx = counts.b_to_a,
        "xtcp visitor session closed"
    );
    Ok(())
}
