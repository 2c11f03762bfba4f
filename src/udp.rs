//! UDP-over-TCP forwarding
//!
//! A UDP proxy carries datagrams as `UdpPacket` frames on a work connection.
//! The server half pumps its public socket into the tunnel, keyed by the
//! user's source address; the client half fans packets out to one local
//! socket per user peer and pumps replies back.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::logger::log;
use crate::msg::{Message, UdpPacket};

/// Largest datagram carried through the tunnel
pub const MAX_DATAGRAM: usize = 64 * 1024;

/// A local-service socket is dropped after this long without traffic
pub const LOCAL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Server half: move datagrams between the public socket and the tunnel
/// channels until either side closes. Each inbound datagram is tagged with
/// the user's source address so replies find their way back.
pub async fn pump_public_socket(
    socket: Arc<UdpSocket>,
    to_client: mpsc::Sender<Message>,
    mut from_client: mpsc::Receiver<UdpPacket>,
) {
    let reader_socket = Arc::clone(&socket);
    let reader = async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, peer) = match reader_socket.recv_from(&mut buf).await {
                Ok(pair) => pair,
                Err(e) => {
                    log::warn!(error = %e, "public udp socket read error");
                    return;
                }
            };
            let packet = Message::UdpPacket(UdpPacket {
                content: buf[..n].to_vec(),
                local_addr: None,
                remote_addr: Some(peer),
            });
            if to_client.send(packet).await.is_err() {
                return;
            }
        }
    };

    let writer = async move {
        while let Some(packet) = from_client.recv().await {
            let Some(peer) = packet.remote_addr else {
                log::debug!("dropping udp reply without remote address");
                continue;
            };
            if let Err(e) = socket.send_to(&packet.content, peer).await {
                log::debug!(peer = %peer, error = %e, "public udp socket write error");
            }
        }
    };

    tokio::select! {
        _ = reader => {}
        _ = writer => {}
    }
}

/// Client half: deliver tunnel packets to the local service and pump the
/// replies back, multiplexing user peers onto per-peer local sockets.
pub async fn run_local_forwarder(
    local_addr: SocketAddr,
    mut from_server: mpsc::Receiver<UdpPacket>,
    to_server: mpsc::Sender<Message>,
) {
    let sessions: Arc<DashMap<SocketAddr, mpsc::Sender<Vec<u8>>>> = Arc::new(DashMap::new());

    while let Some(packet) = from_server.recv().await {
        let Some(peer) = packet.remote_addr else {
            log::debug!("dropping udp packet without remote address");
            continue;
        };

        let entry = sessions.get(&peer).map(|s| s.clone());
        let tx = match entry {
            Some(tx) => tx,
            None => {
                let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
                sessions.insert(peer, tx.clone());
                let sessions = Arc::clone(&sessions);
                let to_server = to_server.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        run_local_session(local_addr, peer, rx, to_server).await
                    {
                        log::debug!(peer = %peer, error = %e, "udp local session ended");
                    }
                    sessions.remove(&peer);
                });
                tx
            }
        };

        if tx.send(packet.content).await.is_err() {
            // Session died between lookup and send; retry on the next packet.
            sessions.remove(&peer);
        }
    }
}

/// One user peer's conversation with the local service.
async fn run_local_session(
    local_addr: SocketAddr,
    peer: SocketAddr,
    mut from_tunnel: mpsc::Receiver<Vec<u8>>,
    to_server: mpsc::Sender<Message>,
) -> std::io::Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    socket.connect(local_addr).await?;

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            outbound = from_tunnel.recv() => {
                match outbound {
                    Some(content) => {
                        socket.send(&content).await?;
                    }
                    None => return Ok(()),
                }
            }
            inbound = tokio::time::timeout(LOCAL_IDLE_TIMEOUT, socket.recv(&mut buf)) => {
                match inbound {
                    Ok(Ok(n)) => {
                        let reply = Message::UdpPacket(UdpPacket {
                            content: buf[..n].to_vec(),
                            local_addr: None,
                            remote_addr: Some(peer),
                        });
                        if to_server.send(reply).await.is_err() {
                            return Ok(());
                        }
                    }
                    Ok(Err(e)) => return Err(e),
                    // Idle: let the session be rebuilt on the next datagram.
                    Err(_) => return Ok(()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn_udp_echo() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                let mut reply = b"echo:".to_vec();
                reply.extend_from_slice(&buf[..n]);
                let _ = socket.send_to(&reply, peer).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_local_forwarder_roundtrip() {
        let echo_addr = spawn_udp_echo().await;
        let (to_forwarder, from_server) = mpsc::channel(16);
        let (to_server, mut from_forwarder) = mpsc::channel(16);

        tokio::spawn(run_local_forwarder(echo_addr, from_server, to_server));

        let user: SocketAddr = "203.0.113.5:5353".parse().unwrap();
        to_forwarder
            .send(UdpPacket {
                content: b"query".to_vec(),
                local_addr: None,
                remote_addr: Some(user),
            })
            .await
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), from_forwarder.recv())
            .await
            .unwrap()
            .unwrap();
        match reply {
            Message::UdpPacket(packet) => {
                assert_eq!(packet.content, b"echo:query");
                assert_eq!(packet.remote_addr, Some(user));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_local_forwarder_separates_peers() {
        let echo_addr = spawn_udp_echo().await;
        let (to_forwarder, from_server) = mpsc::channel(16);
        let (to_server, mut from_forwarder) = mpsc::channel(16);
        tokio::spawn(run_local_forwarder(echo_addr, from_server, to_server));

        let peer_a: SocketAddr = "203.0.113.5:1000".parse().unwrap();
        let peer_b: SocketAddr = "203.0.113.5:2000".parse().unwrap();
        for (peer, payload) in [(peer_a, b"aaa".as_ref()), (peer_b, b"bbb".as_ref())] {
            to_forwarder
                .send(UdpPacket {
                    content: payload.to_vec(),
                    local_addr: None,
                    remote_addr: Some(peer),
                })
                .await
                .unwrap();
        }

        let mut got = std::collections::HashMap::new();
        for _ in 0..2 {
            let reply = tokio::time::timeout(Duration::from_secs(5), from_forwarder.recv())
                .await
                .unwrap()
                .unwrap();
            if let Message::UdpPacket(packet) = reply {
                got.insert(packet.remote_addr.unwrap(), packet.content);
            }
        }
        assert_eq!(got[&peer_a], b"echo:aaa");
        assert_eq!(got[&peer_b], b"echo:bbb");
    }

    #[tokio::test]
    async fn test_pump_public_socket_roundtrip() {
        let public = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let public_addr = public.local_addr().unwrap();

        let (to_client, mut client_rx) = mpsc::channel(16);
        let (client_tx, from_client) = mpsc::channel(16);
        tokio::spawn(pump_public_socket(public, to_client, from_client));

        // A user sends a datagram to the public port.
        let user = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        user.send_to(b"ping", public_addr).await.unwrap();

        // It shows up tagged with the user's source address.
        let forwarded = tokio::time::timeout(Duration::from_secs(5), client_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let packet = match forwarded {
            Message::UdpPacket(packet) => packet,
            other => panic!("unexpected message {:?}", other),
        };
        assert_eq!(packet.content, b"ping");
        let user_addr = packet.remote_addr.unwrap();
        assert_eq!(user_addr, user.local_addr().unwrap());

        // The client's reply reaches the user.
        client_tx
            .send(UdpPacket {
                content: b"pong".to_vec(),
                local_addr: None,
                remote_addr: Some(user_addr),
            })
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = tokio::time::timeout(Duration::from_secs(5), user.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(from, public_addr);
    }
}
