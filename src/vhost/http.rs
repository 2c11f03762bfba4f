//! HTTP virtual-host reverse proxy
//!
//! Parses the first request head on each user connection, routes by
//! `(host, path)`, enforces optional basic auth, rewrites the head and then
//! splices the connection to a back-end stream obtained from the route's
//! factory. Follow-up requests on a keep-alive connection ride the
//! established splice to the same back end.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::logger::log;
use crate::splice;
use crate::transport::AsyncStream;

use super::VhostRouter;

/// Upper bound for one request head
const MAX_HEAD_SIZE: usize = 64 * 1024;

const RESPONSE_404: &str = "HTTP/1.1 404 Not Found\r\n\
    Content-Type: text/plain; charset=utf-8\r\n\
    Content-Length: 17\r\n\
    Connection: close\r\n\r\n\
    no route to host\n";

const RESPONSE_401: &str = "HTTP/1.1 401 Unauthorized\r\n\
    WWW-Authenticate: Basic realm=\"Restricted\"\r\n\
    Content-Length: 0\r\n\
    Connection: close\r\n\r\n";

const RESPONSE_431: &str = "HTTP/1.1 431 Request Header Fields Too Large\r\n\
    Content-Length: 0\r\n\
    Connection: close\r\n\r\n";

/// Serve one user connection accepted on the vhost HTTP port.
pub async fn handle_http_connection<S>(
    router: Arc<VhostRouter>,
    mut stream: S,
    peer: SocketAddr,
) -> io::Result<()>
where
    S: AsyncStream,
{
    let mut buffered = Vec::with_capacity(2 * 1024);
    let head_len = match read_head(&mut stream, &mut buffered).await? {
        Some(len) => len,
        None => {
            stream.write_all(RESPONSE_431.as_bytes()).await?;
            return Ok(());
        }
    };

    let request = match parse_request(&buffered[..head_len]) {
        Some(req) => req,
        None => {
            stream.write_all(RESPONSE_404.as_bytes()).await?;
            return Ok(());
        }
    };

    let route = match router.resolve(&request.host, &request.path) {
        Some(route) => route,
        None => {
            log::debug!(host = %request.host, path = %request.path, "no vhost route");
            stream.write_all(RESPONSE_404.as_bytes()).await?;
            return Ok(());
        }
    };

    if !route.http_user.is_empty() {
        let expected = BASE64.encode(format!("{}:{}", route.http_user, route.http_pwd));
        let authorized = request
            .authorization
            .as_deref()
            .and_then(|v| v.strip_prefix("Basic "))
            .map(|got| got.trim() == expected)
            .unwrap_or(false);
        if !authorized {
            stream.write_all(RESPONSE_401.as_bytes()).await?;
            return Ok(());
        }
    }

    let mut backend = match route.factory.open(peer).await {
        Ok(backend) => backend,
        Err(e) => {
            log::warn!(proxy = %route.proxy_name, error = %e, "vhost backend unavailable");
            stream.write_all(RESPONSE_404.as_bytes()).await?;
            return Ok(());
        }
    };

    let head = String::from_utf8_lossy(&buffered[..head_len]);
    let rewritten = rewrite_head(&head, &route.host_header_rewrite, &route.headers, peer);
    backend.write_all(rewritten.as_bytes()).await?;
    // Body bytes that arrived together with the head.
    backend.write_all(&buffered[head_len..]).await?;
    backend.flush().await?;

    log::connection(&route.proxy_name, &peer.to_string(), "vhost-open");
    let (counts, _result) = splice::join(stream, backend).await;
    log::debug!(
        proxy = %route.proxy_name,
        rx = counts.a_to_b,
        tx = counts.b_to_a,
        "vhost connection closed"
    );
    Ok(())
}

/// Read until the end of the request head. Returns the head length within
/// `buffered`, or `None` when the head exceeds the cap.
async fn read_head<S>(stream: &mut S, buffered: &mut Vec<u8>) -> io::Result<Option<usize>>
where
    S: AsyncStream,
{
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(pos) = find_head_end(buffered) {
            return Ok(Some(pos));
        }
        if buffered.len() > MAX_HEAD_SIZE {
            return Ok(None);
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before request head",
            ));
        }
        buffered.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

struct ParsedRequest {
    host: String,
    path: String,
    authorization: Option<String>,
}

fn parse_request(head: &[u8]) -> Option<ParsedRequest> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut request = httparse::Request::new(&mut headers);
    match request.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return None,
    }

    let path = request.path?.to_string();
    let mut host = None;
    let mut authorization = None;
    for header in request.headers.iter() {
        if header.name.eq_ignore_ascii_case("host") {
            host = Some(String::from_utf8_lossy(header.value).trim().to_string());
        } else if header.name.eq_ignore_ascii_case("authorization") {
            authorization = Some(String::from_utf8_lossy(header.value).trim().to_string());
        }
    }

    Some(ParsedRequest {
        host: host?,
        path,
        authorization,
    })
}

/// Rebuild the request head: optional `Host` rewrite, configured extra
/// headers (replacing same-named ones), and an appended `X-Forwarded-For`.
fn rewrite_head(
    head: &str,
    host_rewrite: &str,
    extra_headers: &std::collections::HashMap<String, String>,
    peer: SocketAddr,
) -> String {
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();

    let mut out = String::with_capacity(head.len() + 128);
    out.push_str(request_line);
    out.push_str("\r\n");

    let mut forwarded_for: Option<String> = None;
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let name = line.split(':').next().unwrap_or_default().trim();
        if name.eq_ignore_ascii_case("host") && !host_rewrite.is_empty() {
            out.push_str("Host: ");
            out.push_str(host_rewrite);
            out.push_str("\r\n");
            continue;
        }
        if name.eq_ignore_ascii_case("x-forwarded-for") {
            let value = line.splitn(2, ':').nth(1).unwrap_or_default().trim();
            forwarded_for = Some(value.to_string());
            continue;
        }
        if extra_headers.keys().any(|k| k.eq_ignore_ascii_case(name)) {
            continue;
        }
        out.push_str(line);
        out.push_str("\r\n");
    }

    for (name, value) in extra_headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }

    match forwarded_for {
        Some(existing) => {
            out.push_str(&format!("X-Forwarded-For: {}, {}\r\n", existing, peer.ip()));
        }
        None => {
            out.push_str(&format!("X-Forwarded-For: {}\r\n", peer.ip()));
        }
    }

    out.push_str("\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vhost::test_support::{route, PipeFactory};
    use crate::vhost::VhostRoute;
    use std::collections::HashMap;

    fn peer() -> SocketAddr {
        "203.0.113.9:51000".parse().unwrap()
    }

    #[test]
    fn test_find_head_end() {
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n\r\nbody"), Some(18));
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n"), None);
    }

    #[test]
    fn test_parse_request_extracts_fields() {
        let head = b"GET /v2/items HTTP/1.1\r\nHost: api.example.com\r\nAuthorization: Basic abc\r\n\r\n";
        let req = parse_request(head).unwrap();
        assert_eq!(req.host, "api.example.com");
        assert_eq!(req.path, "/v2/items");
        assert_eq!(req.authorization.as_deref(), Some("Basic abc"));
    }

    #[test]
    fn test_parse_request_requires_host() {
        let head = b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n";
        assert!(parse_request(head).is_none());
    }

    #[test]
    fn test_rewrite_host_header() {
        let head = "GET / HTTP/1.1\r\nHost: public.example.com\r\nAccept: */*\r\n\r\n";
        let out = rewrite_head(head, "internal.local", &HashMap::new(), peer());
        assert!(out.contains("Host: internal.local\r\n"));
        assert!(!out.contains("public.example.com"));
        assert!(out.contains("X-Forwarded-For: 203.0.113.9\r\n"));
        assert!(out.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_extra_headers_replace_existing() {
        let mut extra = HashMap::new();
        extra.insert("X-From-Where".to_string(), "tunnel".to_string());
        let head = "GET / HTTP/1.1\r\nHost: h\r\nX-From-Where: outside\r\n\r\n";
        let out = rewrite_head(head, "", &extra, peer());
        assert!(out.contains("X-From-Where: tunnel\r\n"));
        assert!(!out.contains("outside"));
    }

    #[test]
    fn test_forwarded_for_appends() {
        let head = "GET / HTTP/1.1\r\nHost: h\r\nX-Forwarded-For: 198.51.100.4\r\n\r\n";
        let out = rewrite_head(head, "", &HashMap::new(), peer());
        assert!(out.contains("X-Forwarded-For: 198.51.100.4, 203.0.113.9\r\n"));
    }

    #[tokio::test]
    async fn test_end_to_end_routing_and_relay() {
        let router = Arc::new(VhostRouter::new());
        let (backend_far, backend_near) = tokio::io::duplex(16 * 1024);
        router
            .register(
                "app.example.com",
                "",
                route("app", PipeFactory::new(vec![backend_far])),
            )
            .unwrap();

        let (user, server_side) = tokio::io::duplex(16 * 1024);
        let task = tokio::spawn(handle_http_connection(router, server_side, peer()));

        let mut user = user;
        user.write_all(b"GET /hello HTTP/1.1\r\nHost: app.example.com\r\n\r\n")
            .await
            .unwrap();

        // The backend sees the rewritten head...
        let mut backend = backend_near;
        let mut head = vec![0u8; 4096];
        let n = backend.read(&mut head).await.unwrap();
        let head = String::from_utf8_lossy(&head[..n]).to_string();
        assert!(head.starts_with("GET /hello HTTP/1.1\r\n"));
        assert!(head.contains("Host: app.example.com\r\n"));
        assert!(head.contains("X-Forwarded-For: 203.0.113.9\r\n"));

        // ...and its response reaches the user.
        backend
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();
        let mut resp = vec![0u8; 256];
        let n = user.read(&mut resp).await.unwrap();
        assert!(String::from_utf8_lossy(&resp[..n]).starts_with("HTTP/1.1 200 OK"));

        drop(user);
        drop(backend);
        let _ = task.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_route_gets_404() {
        let router = Arc::new(VhostRouter::new());
        let (user, server_side) = tokio::io::duplex(4096);
        let task = tokio::spawn(handle_http_connection(router, server_side, peer()));

        let mut user = user;
        user.write_all(b"GET / HTTP/1.1\r\nHost: unknown.example.com\r\n\r\n")
            .await
            .unwrap();
        let mut resp = vec![0u8; 256];
        let n = user.read(&mut resp).await.unwrap();
        assert!(String::from_utf8_lossy(&resp[..n]).starts_with("HTTP/1.1 404"));
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_basic_auth_enforced() {
        let router = Arc::new(VhostRouter::new());
        let (backend_far, _backend_near) = tokio::io::duplex(4096);
        let mut guarded: VhostRoute = route("app", PipeFactory::new(vec![backend_far]));
        guarded.http_user = "admin".to_string();
        guarded.http_pwd = "hunter2".to_string();
        router.register("app.example.com", "", guarded).unwrap();

        let (user, server_side) = tokio::io::duplex(4096);
        let task = tokio::spawn(handle_http_connection(router, server_side, peer()));

        let mut user = user;
        user.write_all(b"GET / HTTP/1.1\r\nHost: app.example.com\r\n\r\n")
            .await
            .unwrap();
        let mut resp = vec![0u8; 256];
        let n = user.read(&mut resp).await.unwrap();
        assert!(String::from_utf8_lossy(&resp[..n]).starts_with("HTTP/1.1 401"));
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_basic_auth_accepts_correct_credentials() {
        let router = Arc::new(VhostRouter::new());
        let (backend_far, mut backend_near) = tokio::io::duplex(4096);
        let mut guarded: VhostRoute = route("app", PipeFactory::new(vec![backend_far]));
        guarded.http_user = "admin".to_string();
        guarded.http_pwd = "hunter2".to_string();
        router.register("app.example.com", "", guarded).unwrap();

        let (user, server_side) = tokio::io::duplex(4096);
        let task = tokio::spawn(handle_http_connection(router, server_side, peer()));

        let credentials = BASE64.encode("admin:hunter2");
        let request = format!(
            "GET / HTTP/1.1\r\nHost: app.example.com\r\nAuthorization: Basic {}\r\n\r\n",
            credentials
        );
        let mut user = user;
        user.write_all(request.as_bytes()).await.unwrap();

        let mut head = vec![0u8; 1024];
        let n = backend_near.read(&mut head).await.unwrap();
        assert!(String::from_utf8_lossy(&head[..n]).starts_with("GET / HTTP/1.1"));
        drop(user);
        drop(backend_near);
        let _ = task.await.unwrap();
    }
}
