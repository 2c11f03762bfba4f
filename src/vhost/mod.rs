//! Virtual-host routing
//!
//! HTTP and HTTPS proxies do not get their own listen ports; they share the
//! vhost ports and are selected by host name (and, for HTTP, by path
//! prefix). A route maps `(domain, location)` to a factory producing back-end
//! streams, which on the server side means taking a work connection from the
//! owning client.

pub mod http;
pub mod https;

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::transport::BoxedStream;

/// Produces one back-end byte stream per user session
#[async_trait]
pub trait ConnFactory: Send + Sync {
    async fn open(&self, src: SocketAddr) -> io::Result<BoxedStream>;
}

/// Route descriptor registered per proxy (or per group)
#[derive(Clone)]
pub struct VhostRoute {
    pub proxy_name: String,
    pub host_header_rewrite: String,
    pub headers: HashMap<String, String>,
    pub http_user: String,
    pub http_pwd: String,
    pub factory: Arc<dyn ConnFactory>,
    pub group_key: String,
}

type RouteKey = (String, String);

/// Routing table keyed by `(domain, location)`
#[derive(Default)]
pub struct VhostRouter {
    routes: RwLock<HashMap<RouteKey, Arc<VhostRoute>>>,
}

impl VhostRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route; conflicts on `(domain, location)` are rejected.
    pub fn register(&self, domain: &str, location: &str, route: VhostRoute) -> Result<()> {
        let key = (domain.to_lowercase(), location.to_string());
        let mut routes = self.routes.write().expect("vhost router lock poisoned");
        if routes.contains_key(&key) {
            return Err(Error::VhostConflict {
                domain: key.0,
                location: key.1,
            });
        }
        routes.insert(key, Arc::new(route));
        Ok(())
    }

    pub fn unregister(&self, domain: &str, location: &str) {
        let key = (domain.to_lowercase(), location.to_string());
        let mut routes = self.routes.write().expect("vhost router lock poisoned");
        routes.remove(&key);
    }

    /// Longest-prefix location match under the exact host, then under
    /// wildcard hosts (`*.example.com` matches `api.example.com`). The empty
    /// location matches every path.
    pub fn resolve(&self, host: &str, path: &str) -> Option<Arc<VhostRoute>> {
        let host = host.split(':').next().unwrap_or(host).to_lowercase();
        let routes = self.routes.read().expect("vhost router lock poisoned");

        if let Some(route) = best_location_match(&routes, &host, path) {
            return Some(route);
        }

        // Wildcard fallback: replace leading labels with `*` one at a time.
        let mut rest = host.as_str();
        while let Some(idx) = rest.find('.') {
            rest = &rest[idx + 1..];
            let candidate = format!("*.{}", rest);
            if let Some(route) = best_location_match(&routes, &candidate, path) {
                return Some(route);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.routes.read().expect("vhost router lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn best_location_match(
    routes: &HashMap<RouteKey, Arc<VhostRoute>>,
    host: &str,
    path: &str,
) -> Option<Arc<VhostRoute>> {
    let mut best: Option<(&str, &Arc<VhostRoute>)> = None;
    for ((domain, location), route) in routes.iter() {
        if domain != host {
            continue;
        }
        if !path.starts_with(location.as_str()) && !location.is_empty() {
            continue;
        }
        match best {
            Some((bl, _)) if bl.len() >= location.len() => {}
            _ => best = Some((location, route)),
        }
    }
    best.map(|(_, r)| Arc::clone(r))
}


#[cfg(test)]
mod tests {
    use super::test_support::{route, PipeFactory};
    use super::*;

    fn test_router() -> VhostRouter {
        VhostRouter::new()
    }

    fn dummy_route(name: &str) -> VhostRoute {
        route(name, PipeFactory::new(vec![]))
    }

    #[test]
    fn test_register_and_resolve_exact() {
        let router = test_router();
        router
            .register("api.example.com", "", dummy_route("web"))
            .unwrap();
        let hit = router.resolve("api.example.com", "/anything").unwrap();
        assert_eq!(hit.proxy_name, "web");
        assert!(router.resolve("other.example.com", "/").is_none());
    }

    #[test]
    fn test_conflict_rejected() {
        let router = test_router();
        router
            .register("api.example.com", "/", dummy_route("one"))
            .unwrap();
        let err = router
            .register("API.example.com", "/", dummy_route("two"))
            .unwrap_err();
        assert!(matches!(err, Error::VhostConflict { .. }));
    }

    #[test]
    fn test_longest_prefix_wins() {
        let router = test_router();
        router
            .register("api.example.com", "/", dummy_route("root"))
            .unwrap();
        router
            .register("api.example.com", "/v2", dummy_route("v2"))
            .unwrap();

        assert_eq!(
            router.resolve("api.example.com", "/v2/items").unwrap().proxy_name,
            "v2"
        );
        assert_eq!(
            router.resolve("api.example.com", "/v1/items").unwrap().proxy_name,
            "root"
        );
        assert_eq!(
            router.resolve("api.example.com", "/v2").unwrap().proxy_name,
            "v2"
        );
    }

    #[test]
    fn test_wildcard_fallback() {
        let router = test_router();
        router
            .register("*.example.com", "", dummy_route("wild"))
            .unwrap();
        router
            .register("api.example.com", "", dummy_route("exact"))
            .unwrap();

        assert_eq!(
            router.resolve("api.example.com", "/").unwrap().proxy_name,
            "exact"
        );
        assert_eq!(
            router.resolve("www.example.com", "/").unwrap().proxy_name,
            "wild"
        );
        assert!(router.resolve("example.com", "/").is_none());
    }

    #[test]
    fn test_host_port_is_stripped() {
        let router = test_router();
        router
            .register("api.example.com", "", dummy_route("web"))
            .unwrap();
        assert!(router.resolve("api.example.com:8080", "/").is_some());
    }

    #[test]
    fn test_unregister() {
        let router = test_router();
        router
            .register("api.example.com", "", dummy_route("web"))
            .unwrap();
        router.unregister("api.example.com", "");
        assert!(router.resolve("api.example.com", "/").is_none());
        assert!(router.is_empty());
    }
}
