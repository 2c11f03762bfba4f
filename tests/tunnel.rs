//! End-to-end tunnel tests on loopback: a real server service, a real
//! client service, and real user sockets.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use portway::client;
use portway::config::{self, ClientConfig, ServerConfig};
use portway::server;

/// Grab a free loopback port by binding and dropping a listener.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// TCP echo service standing in for the private application.
async fn spawn_tcp_echo() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    port
}

/// Minimal local HTTP server answering every request with a fixed body.
async fn spawn_local_http() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let Ok(n) = stream.read(&mut buf).await else {
                    return;
                };
                let head = String::from_utf8_lossy(&buf[..n]).to_string();
                let body = format!("seen-host:{}", extract_host(&head));
                let resp = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(resp.as_bytes()).await;
            });
        }
    });
    port
}

fn extract_host(head: &str) -> String {
    head.lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("host").then(|| value.trim().to_string())
        })
        .unwrap_or_default()
}

async fn start_server(ini: &str) -> Arc<server::Service> {
    let config: ServerConfig = config::load_server_config(ini).unwrap();
    let service = server::Service::new(config).await.unwrap();
    tokio::spawn(Arc::clone(&service).run());
    // Give the listeners a moment to bind.
    tokio::time::sleep(Duration::from_millis(200)).await;
    service
}

async fn start_client(ini: &str) -> (Arc<client::Service>, CancellationToken) {
    let (config, proxies, visitors): (ClientConfig, _, _) =
        config::load_client_config(ini).unwrap();
    let service = client::Service::new(config, proxies, visitors);
    let shutdown = CancellationToken::new();
    tokio::spawn(Arc::clone(&service).run(shutdown.clone()));
    (service, shutdown)
}

/// Retry until the public port accepts connections.
async fn connect_with_retry(port: u16) -> TcpStream {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("port {} never became reachable", port);
}

#[tokio::test]
async fn tcp_tunnel_delivers_bytes_verbatim() {
    let echo_port = spawn_tcp_echo().await;
    let bind_port = free_port();
    let remote_port = free_port();

    let _server = start_server(&format!(
        "[common]\nbind_addr = 127.0.0.1\nbind_port = {bind_port}\ntoken = integration\n"
    ))
    .await;
    let (_client, _shutdown) = start_client(&format!(
        "[common]\nserver_addr = 127.0.0.1\nserver_port = {bind_port}\ntoken = integration\nuser = itest\n\
         \n[echo]\ntype = tcp\nlocal_ip = 127.0.0.1\nlocal_port = {echo_port}\nremote_port = {remote_port}\n"
    ))
    .await;

    let mut user = connect_with_retry(remote_port).await;
    user.write_all(b"hello\n").await.unwrap();
    let mut buf = [0u8; 6];
    tokio::time::timeout(Duration::from_secs(10), user.read_exact(&mut buf))
        .await
        .expect("echo reply in time")
        .unwrap();
    assert_eq!(&buf, b"hello\n");

    // The splice must keep streaming, not just deliver the first write.
    user.write_all(b"second round").await.unwrap();
    let mut buf = [0u8; 12];
    tokio::time::timeout(Duration::from_secs(10), user.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"second round");
}

#[tokio::test]
async fn encrypted_compressed_tunnel_is_byte_identical() {
    let echo_port = spawn_tcp_echo().await;
    let bind_port = free_port();
    let remote_port = free_port();

    let _server = start_server(&format!(
        "[common]\nbind_addr = 127.0.0.1\nbind_port = {bind_port}\ntoken = integration\n"
    ))
    .await;
    let (_client, _shutdown) = start_client(&format!(
        "[common]\nserver_addr = 127.0.0.1\nserver_port = {bind_port}\ntoken = integration\nuser = itest\n\
         \n[echo_sec]\ntype = tcp\nlocal_ip = 127.0.0.1\nlocal_port = {echo_port}\nremote_port = {remote_port}\n\
         use_encryption = true\nuse_compression = true\n"
    ))
    .await;

    // A pseudo-random 1 MiB blob; poorly compressible on purpose.
    let blob: Vec<u8> = (0..1_048_576u32)
        .map(|i| (i.wrapping_mul(2654435761) >> 11) as u8)
        .collect();

    let mut user = connect_with_retry(remote_port).await;
    let expected = blob.clone();
    let writer = tokio::spawn(async move {
        let (mut read_half, mut write_half) = user.into_split();
        let write = async {
            write_half.write_all(&blob).await.unwrap();
            write_half.flush().await.unwrap();
        };
        let read = async {
            let mut got = vec![0u8; expected.len()];
            read_half.read_exact(&mut got).await.unwrap();
            got
        };
        let (_, got) = tokio::join!(write, read);
        (expected, got)
    });

    let (expected, got) = tokio::time::timeout(Duration::from_secs(60), writer)
        .await
        .expect("transfer in time")
        .unwrap();
    assert_eq!(got, expected);
}

#[tokio::test]
async fn vhost_http_routes_by_host_header() {
    let http_port = spawn_local_http().await;
    let bind_port = free_port();
    let vhost_port = free_port();

    let _server = start_server(&format!(
        "[common]\nbind_addr = 127.0.0.1\nbind_port = {bind_port}\nvhost_http_port = {vhost_port}\ntoken = integration\n"
    ))
    .await;
    let (_client, _shutdown) = start_client(&format!(
        "[common]\nserver_addr = 127.0.0.1\nserver_port = {bind_port}\ntoken = integration\nuser = itest\n\
         \n[web]\ntype = http\nlocal_ip = 127.0.0.1\nlocal_port = {http_port}\ncustom_domains = app.test\n\
         host_header_rewrite = internal.test\n"
    ))
    .await;

    // Wait for the route to be registered end to end.
    let mut response = String::new();
    for _ in 0..100 {
        let mut conn = connect_with_retry(vhost_port).await;
        conn.write_all(b"GET /hi HTTP/1.1\r\nHost: app.test\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut raw = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(5), conn.read_to_end(&mut raw)).await;
        response = String::from_utf8_lossy(&raw).to_string();
        if response.starts_with("HTTP/1.1 200") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert!(response.starts_with("HTTP/1.1 200"), "got: {response:?}");
    // Host header was rewritten before reaching the local service.
    assert!(response.contains("seen-host:internal.test"), "got: {response:?}");

    // Unknown hosts are refused at the vhost layer.
    let mut conn = connect_with_retry(vhost_port).await;
    conn.write_all(b"GET / HTTP/1.1\r\nHost: nobody.test\r\n\r\n")
        .await
        .unwrap();
    let mut raw = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), conn.read_to_end(&mut raw)).await;
    let response = String::from_utf8_lossy(&raw);
    assert!(response.starts_with("HTTP/1.1 404"), "got: {response:?}");
}

#[tokio::test]
async fn stcp_visitor_reaches_hidden_service() {
    let echo_port = spawn_tcp_echo().await;
    let bind_port = free_port();
    let visitor_port = free_port();

    let _server = start_server(&format!(
        "[common]\nbind_addr = 127.0.0.1\nbind_port = {bind_port}\ntoken = integration\n"
    ))
    .await;

    // One client exposes the service...
    let (_exposer, _shutdown_a) = start_client(&format!(
        "[common]\nserver_addr = 127.0.0.1\nserver_port = {bind_port}\ntoken = integration\nuser = hider\n\
         \n[secret_echo]\ntype = stcp\nsk = punched-card\nlocal_ip = 127.0.0.1\nlocal_port = {echo_port}\n"
    ))
    .await;
    // ...a second client visits it by name and shared secret.
    let (_visitor, _shutdown_b) = start_client(&format!(
        "[common]\nserver_addr = 127.0.0.1\nserver_port = {bind_port}\ntoken = integration\nuser = seeker\n\
         \n[secret_echo_visitor]\ntype = stcp\nrole = visitor\nserver_name = secret_echo\nsk = punched-card\n\
         bind_addr = 127.0.0.1\nbind_port = {visitor_port}\n"
    ))
    .await;

    // The exposing client may not have registered the proxy yet when the
    // visitor listener comes up; retry the whole round trip.
    let mut delivered = None;
    for _ in 0..100 {
        let mut user = connect_with_retry(visitor_port).await;
        if user.write_all(b"via stcp").await.is_err() {
            tokio::time::sleep(Duration::from_millis(100)).await;
            continue;
        }
        let mut buf = [0u8; 8];
        match tokio::time::timeout(Duration::from_secs(2), user.read_exact(&mut buf)).await {
            Ok(Ok(_)) => {
                delivered = Some(buf);
                break;
            }
            _ => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }
    assert_eq!(delivered.as_ref().map(|b| &b[..]), Some(b"via stcp".as_ref()));
}

#[tokio::test]
async fn plain_transport_without_mux_also_works() {
    let echo_port = spawn_tcp_echo().await;
    let bind_port = free_port();
    let remote_port = free_port();

    let _server = start_server(&format!(
        "[common]\nbind_addr = 127.0.0.1\nbind_port = {bind_port}\ntoken = integration\ntcp_mux = false\n"
    ))
    .await;
    let (_client, _shutdown) = start_client(&format!(
        "[common]\nserver_addr = 127.0.0.1\nserver_port = {bind_port}\ntoken = integration\nuser = itest\ntcp_mux = false\n\
         \n[echo_plain]\ntype = tcp\nlocal_ip = 127.0.0.1\nlocal_port = {echo_port}\nremote_port = {remote_port}\n"
    ))
    .await;

    let mut user = connect_with_retry(remote_port).await;
    user.write_all(b"no mux here").await.unwrap();
    let mut buf = [0u8; 11];
    tokio::time::timeout(Duration::from_secs(10), user.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"no mux here");
}

#[tokio::test]
async fn wrong_token_is_rejected_at_login() {
    let bind_port = free_port();
    let _server = start_server(&format!(
        "[common]\nbind_addr = 127.0.0.1\nbind_port = {bind_port}\ntoken = right-token\n"
    ))
    .await;

    let (config, proxies, visitors) = config::load_client_config(&format!(
        "[common]\nserver_addr = 127.0.0.1\nserver_port = {bind_port}\ntoken = wrong-token\nuser = evil\n\
         \n[echo]\ntype = tcp\nlocal_port = 9\nremote_port = {}\n",
        free_port()
    ))
    .unwrap();
    let service = client::Service::new(config, proxies, visitors);
    let shutdown = CancellationToken::new();

    // login_fail_exit defaults to true: the first rejection is fatal.
    let result = tokio::time::timeout(Duration::from_secs(10), service.run(shutdown))
        .await
        .expect("login verdict in time");
    assert!(result.is_err());
}
