//! Local service health checks
//!
//! A proxy with a health check flips between declared and withdrawn: after
//! `max_failed` consecutive failures the client sends `CloseProxy`, and the
//! first success afterwards re-declares it with `NewProxy`.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::config::{HealthCheckConf, HealthCheckType, ProxyConf};
use crate::logger::log;

use super::proxy::ProxyManager;

/// Spawn watchers for every proxy carrying a health check. Returns a token
/// that stops them all (used on reconnect and reload).
pub fn spawn_checkers(
    manager: &Arc<ProxyManager>,
    confs: impl Iterator<Item = ProxyConf>,
) -> CancellationToken {
    let stop = CancellationToken::new();
    for conf in confs {
        let Some(check) = conf.health_check.clone() else {
            continue;
        };
        let manager = Arc::clone(manager);
        let stop = stop.clone();
        tokio::spawn(async move {
            watch(manager, conf, check, stop).await;
        });
    }
    stop
}

async fn watch(
    manager: Arc<ProxyManager>,
    conf: ProxyConf,
    check: HealthCheckConf,
    stop: CancellationToken,
) {
    let mut failed: u32 = 0;
    let mut withdrawn = false;
    let mut ticker = tokio::time::interval(check.interval);

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let healthy = run_check(&conf, &check).await;
        if healthy {
            if withdrawn {
                log::info!(proxy = %conf.name, "local service recovered, re-declaring proxy");
                manager.redeclare(&conf.name).await;
                withdrawn = false;
            }
            failed = 0;
        } else {
            failed = failed.saturating_add(1);
            log::debug!(proxy = %conf.name, failed = failed, "health check failed");
            if failed >= check.max_failed && !withdrawn {
                log::warn!(proxy = %conf.name, "local service unhealthy, withdrawing proxy");
                manager.withdraw(&conf.name).await;
                withdrawn = true;
            }
        }
    }
}

async fn run_check(conf: &ProxyConf, check: &HealthCheckConf) -> bool {
    let addr = format!("{}:{}", conf.local_ip, conf.local_port);
    match check.check_type {
        HealthCheckType::Tcp => check_tcp(&addr, check.timeout).await,
        HealthCheckType::Http => check_http(&addr, &check.url, check.timeout).await,
    }
}

async fn check_tcp(addr: &str, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Minimal GET: anything in the 2xx class counts as healthy.
async fn check_http(addr: &str, url: &str, timeout: Duration) -> bool {
    let attempt = async {
        let mut stream = TcpStream::connect(addr).await.ok()?;
        let path = if url.is_empty() { "/" } else { url };
        let request = format!(
            "GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await.ok()?;

        let mut head = Vec::with_capacity(256);
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n") && head.len() < 1024 {
            stream.read_exact(&mut byte).await.ok()?;
            head.push(byte[0]);
        }
        let line = String::from_utf8_lossy(&head);
        let status: u16 = line.split_whitespace().nth(1)?.parse().ok()?;
        Some((200..300).contains(&status))
    };
    matches!(tokio::time::timeout(timeout, attempt).await, Ok(Some(true)))
}
