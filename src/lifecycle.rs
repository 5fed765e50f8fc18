//! Proxy lifecycle and status reporting

use crate::config::{Config, RoutingMode, ServerConfig, TlsKind};
use crate::error::Result;
use crate::proxy::ProxyRouter;
use crate::routing::RouteTable;
use serde::Serialize;
use std::sync::Arc;

/// Proxy state as reported to the dashboard
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStatus {
    pub enabled: bool,
    pub running: bool,
    pub tls_mode: TlsKind,
    pub routing: Option<RoutingMode>,
    pub domain: Option<String>,
    pub gateway: Option<String>,
    pub routes: usize,
}

/// Owns the proxy router when a `[server]` section is configured
pub struct ProxyController {
    router: Option<Arc<ProxyRouter>>,
    server: Option<ServerConfig>,
}

impl ProxyController {
    pub fn from_config(config: &Config) -> Result<Self> {
        let Some(server) = config.server.clone() else {
            return Ok(Self::disabled());
        };

        let routes = RouteTable::from_apps(&config.apps)?;
        let router = Arc::new(ProxyRouter::new(server.clone(), routes));
        Ok(Self {
            router: Some(router),
            server: Some(server),
        })
    }

    pub fn disabled() -> Self {
        Self {
            router: None,
            server: None,
        }
    }

    pub fn router(&self) -> Option<&Arc<ProxyRouter>> {
        self.router.as_ref()
    }

    pub fn enabled(&self) -> bool {
        self.router.is_some()
    }

    pub fn running(&self) -> bool {
        self.router.as_ref().is_some_and(|r| r.is_running())
    }

    pub fn tls_mode(&self) -> TlsKind {
        self.router
            .as_ref()
            .map(|r| r.tls_kind())
            .unwrap_or(TlsKind::None)
    }

    pub fn domain(&self) -> Option<&str> {
        self.server.as_ref().and_then(|s| s.domain())
    }

    pub fn gateway(&self) -> Option<&str> {
        self.server.as_ref().and_then(|s| s.gateway.as_deref())
    }

    pub fn status(&self) -> ProxyStatus {
        ProxyStatus {
            enabled: self.enabled(),
            running: self.running(),
            tls_mode: self.tls_mode(),
            routing: self.server.as_ref().map(|s| s.routing),
            domain: self.domain().map(String::from),
            gateway: self.gateway().map(String::from),
            routes: self.router.as_ref().map(|r| r.route_table().len()).unwrap_or(0),
        }
    }

    /// External URL for `slug`; empty when the proxy is off or the app is not routed
    pub fn proxy_url(&self, slug: &str) -> String {
        self.router
            .as_ref()
            .map(|r| r.get_proxy_url(slug))
            .unwrap_or_default()
    }
}
