//! Listen port allocation
//!
//! Remote ports for TCP and UDP proxies come out of a configured allow-list.
//! `acquire(0)` picks any free allowed port with a rotating cursor so churny
//! clients do not always land on the same port.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Ports below this are never handed out automatically
const MIN_AUTO_PORT: u16 = 1024;

/// Parse an allow-list like `"2000-3000,5000,6000-6010"`.
/// An empty string allows every non-privileged port.
pub fn parse_allow_ports(spec: &str) -> Result<Vec<RangeInclusive<u16>>> {
    let mut ranges = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u16 = lo
                    .trim()
                    .parse()
                    .map_err(|_| Error::Config(format!("bad port range start: {}", part)))?;
                let hi: u16 = hi
                    .trim()
                    .parse()
                    .map_err(|_| Error::Config(format!("bad port range end: {}", part)))?;
                if lo > hi {
                    return Err(Error::Config(format!("inverted port range: {}", part)));
                }
                ranges.push(lo..=hi);
            }
            None => {
                let port: u16 = part
                    .parse()
                    .map_err(|_| Error::Config(format!("bad port: {}", part)))?;
                ranges.push(port..=port);
            }
        }
    }
    Ok(ranges)
}

struct PortState {
    used: HashMap<u16, String>,
    cursor: u16,
}

/// Allocator for one protocol family (the server holds one for TCP and one
/// for UDP).
pub struct PortManager {
    allowed: Vec<RangeInclusive<u16>>,
    state: Mutex<PortState>,
}

impl PortManager {
    pub fn new(allowed: Vec<RangeInclusive<u16>>) -> Self {
        Self {
            allowed,
            state: Mutex::new(PortState {
                used: HashMap::new(),
                cursor: 0,
            }),
        }
    }

    fn is_allowed(&self, port: u16) -> bool {
        if self.allowed.is_empty() {
            return port >= MIN_AUTO_PORT;
        }
        self.allowed.iter().any(|r| r.contains(&port))
    }

    /// Reserve `port` for `owner`; `port == 0` picks any free allowed port.
    pub fn acquire(&self, owner: &str, port: u16) -> Result<u16> {
        let mut state = self.state.lock().expect("port manager lock poisoned");

        if port != 0 {
            if !self.is_allowed(port) {
                return Err(Error::PortUnavailable(format!("port {} is not allowed", port)));
            }
            if state.used.contains_key(&port) {
                return Err(Error::PortUnavailable(format!("port {} is in use", port)));
            }
            state.used.insert(port, owner.to_string());
            return Ok(port);
        }

        let candidates: Vec<u16> = if self.allowed.is_empty() {
            (MIN_AUTO_PORT..=u16::MAX).collect()
        } else {
            self.allowed.iter().cloned().flatten().collect()
        };
        if candidates.is_empty() {
            return Err(Error::PortUnavailable("allow list is empty".to_string()));
        }

        let start = state.cursor as usize % candidates.len();
        for offset in 0..candidates.len() {
            let candidate = candidates[(start + offset) % candidates.len()];
            if !state.used.contains_key(&candidate) {
                state.cursor = state.cursor.wrapping_add(offset as u16).wrapping_add(1);
                state.used.insert(candidate, owner.to_string());
                return Ok(candidate);
            }
        }
        Err(Error::PortUnavailable(
            "no free port in the allow list".to_string(),
        ))
    }

    /// Return a port to the pool. Releasing an unowned port is a no-op.
    pub fn release(&self, port: u16) {
        let mut state = self.state.lock().expect("port manager lock poisoned");
        state.used.remove(&port);
    }

    #[cfg(test)]
    fn in_use(&self, port: u16) -> bool {
        self.state
            .lock()
            .expect("port manager lock poisoned")
            .used
            .contains_key(&port)
    }
}
