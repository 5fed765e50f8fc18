//! Route table and slug resolution
//!
//! The active table lives behind an `ArcSwap`: the request path takes a
//! snapshot with a single atomic load and never locks against a writer.

use crate::config::{AppConfig, RoutingMode, ServerConfig};
use crate::error::Result;
use arc_swap::ArcSwap;
use hyper::Uri;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;
use url::{Position, Url};

/// A proxied application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub slug: String,
    pub name: String,
    pub target: Url,
    pub enabled: bool,
}

impl Route {
    pub fn new(slug: &str, name: &str, target: Url, enabled: bool) -> Self {
        Self {
            slug: slug.to_string(),
            name: name.to_string(),
            target,
            enabled,
        }
    }

    /// `host:port` of the backend
    pub fn authority(&self) -> &str {
        &self.target[Position::BeforeHost..Position::AfterPort]
    }

    /// Backend URI for a forwarded `path_and_query`, below the target's base path
    pub fn upstream_uri(&self, path_and_query: &str) -> std::result::Result<Uri, hyper::http::uri::InvalidUri> {
        let base = self.target.path().trim_end_matches('/');
        format!(
            "{}://{}{}{}",
            self.target.scheme(),
            self.authority(),
            base,
            path_and_query
        )
        .parse()
    }
}

/// Immutable slug → route mapping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTable {
    routes: HashMap<String, Route>,
}

impl RouteTable {
    pub fn new(routes: impl IntoIterator<Item = Route>) -> Self {
        Self {
            routes: routes.into_iter().map(|r| (r.slug.clone(), r)).collect(),
        }
    }

    /// Build a table from app configs.
    ///
    /// The data path speaks plain HTTP to backends, so apps with an https
    /// target are kept in the table but disabled.
    pub fn from_apps(apps: &[AppConfig]) -> Result<Self> {
        let mut routes = Vec::with_capacity(apps.len());
        for app in apps {
            let target = app.target_url()?;
            let mut enabled = app.enabled;
            if enabled && target.scheme() != "http" {
                warn!(
                    slug = %app.slug,
                    url = %app.url,
                    "Only http:// backends can be proxied, disabling route"
                );
                enabled = false;
            }
            routes.push(Route::new(&app.slug, &app.name, target, enabled));
        }
        Ok(Self::new(routes))
    }

    pub fn get(&self, slug: &str) -> Option<&Route> {
        self.routes.get(slug)
    }

    /// Route for `slug` if it exists and is enabled
    pub fn enabled(&self, slug: &str) -> Option<&Route> {
        self.routes.get(slug).filter(|r| r.enabled)
    }

    /// All routes ordered by slug
    pub fn sorted(&self) -> Vec<&Route> {
        let mut routes: Vec<&Route> = self.routes.values().collect();
        routes.sort_by(|a, b| a.slug.cmp(&b.slug));
        routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Atomically swappable route table shared with the request path
#[derive(Debug)]
pub struct SharedRouteTable {
    inner: ArcSwap<RouteTable>,
}

impl SharedRouteTable {
    pub fn new(table: RouteTable) -> Self {
        Self {
            inner: ArcSwap::from_pointee(table),
        }
    }

    /// Current table; the snapshot stays valid after a swap
    pub fn load(&self) -> Arc<RouteTable> {
        self.inner.load_full()
    }

    pub fn store(&self, table: RouteTable) {
        self.inner.store(Arc::new(table));
    }
}

/// Slug matched for an inbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub slug: String,
    /// Path and query to send to the backend
    pub forward_path: String,
}

/// Maps an inbound request to an app slug
pub trait SlugResolver: Send + Sync {
    fn resolve(&self, host: Option<&str>, path_and_query: &str) -> Option<Resolved>;
}

/// `/{slug}/rest` → slug, forwards `/rest`
#[derive(Debug, Clone, Default)]
pub struct PathPrefix;

impl SlugResolver for PathPrefix {
    fn resolve(&self, _host: Option<&str>, path_and_query: &str) -> Option<Resolved> {
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (path_and_query, None),
        };

        let trimmed = path.strip_prefix('/')?;
        let (slug, rest) = match trimmed.split_once('/') {
            Some((slug, rest)) => (slug, rest),
            None => (trimmed, ""),
        };
        if slug.is_empty() {
            return None;
        }

        let mut forward_path = format!("/{}", rest);
        if let Some(query) = query {
            forward_path.push('?');
            forward_path.push_str(query);
        }

        Some(Resolved {
            slug: slug.to_string(),
            forward_path,
        })
    }
}

/// `{slug}.{domain}` → slug, forwards the path unchanged
#[derive(Debug, Clone)]
pub struct Subdomain {
    suffix: String,
}

impl Subdomain {
    pub fn new(domain: &str) -> Self {
        Self {
            suffix: format!(".{}", domain.trim_start_matches('.').to_ascii_lowercase()),
        }
    }
}

impl SlugResolver for Subdomain {
    fn resolve(&self, host: Option<&str>, path_and_query: &str) -> Option<Resolved> {
        let host = strip_port(host?).to_ascii_lowercase();
        let label = host.strip_suffix(&self.suffix)?;
        if label.is_empty() || label.contains('.') {
            return None;
        }

        Some(Resolved {
            slug: label.to_string(),
            forward_path: path_and_query.to_string(),
        })
    }
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // IPv6 literal
        return host.split_once(']').map(|(h, _)| &host[..h.len() + 1]).unwrap_or(host);
    }
    host.split(':').next().unwrap_or(host)
}

/// Resolver for the configured routing mode
pub fn resolver_for(server: &ServerConfig) -> Arc<dyn SlugResolver> {
    match server.routing {
        RoutingMode::Path => Arc::new(PathPrefix),
        RoutingMode::Subdomain => Arc::new(Subdomain::new(server.domain().unwrap_or_default())),
    }
}

/// Builds externally reachable URLs for slugs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalBase {
    mode: RoutingMode,
    scheme: String,
    host: String,
    port: Option<u16>,
    path: String,
}

impl ExternalBase {
    /// Derive the external base from `public_url`, the domain, or the listener
    pub fn from_server(server: &ServerConfig, secure: bool) -> Self {
        if let Some(public) = server.public_url.as_deref().and_then(|u| Url::parse(u).ok()) {
            return Self {
                mode: server.routing,
                scheme: public.scheme().to_string(),
                host: public.host_str().unwrap_or("localhost").to_string(),
                port: public.port(),
                path: public.path().trim_end_matches('/').to_string(),
            };
        }

        let scheme = if secure { "https" } else { "http" };
        let listen: Option<SocketAddr> = server.listen.parse().ok();
        let host = match (server.domain(), listen) {
            (Some(domain), _) => domain.to_string(),
            (None, Some(addr)) if addr.ip().is_unspecified() => "localhost".to_string(),
            (None, Some(addr)) if addr.is_ipv6() => format!("[{}]", addr.ip()),
            (None, Some(addr)) => addr.ip().to_string(),
            (None, None) => "localhost".to_string(),
        };
        let default_port = if secure { 443 } else { 80 };
        let port = listen.map(|a| a.port()).filter(|p| *p != default_port);

        Self {
            mode: server.routing,
            scheme: scheme.to_string(),
            host,
            port,
            path: String::new(),
        }
    }

    pub fn url_for(&self, slug: &str) -> String {
        let port = self.port.map(|p| format!(":{}", p)).unwrap_or_default();
        match self.mode {
            RoutingMode::Path => format!("{}://{}{}{}/{}/", self.scheme, self.host, port, self.path, slug),
            RoutingMode::Subdomain => format!("{}://{}.{}{}{}/", self.scheme, slug, self.host, port, self.path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(slug: &str, target: &str, enabled: bool) -> Route {
        Route::new(slug, slug, Url::parse(target).unwrap(), enabled)
    }

    #[test]
    fn test_path_prefix_resolution() {
        let resolver = PathPrefix;

        let r = resolver.resolve(None, "/grafana/api/health?full=1").unwrap();
        assert_eq!(r.slug, "grafana");
        assert_eq!(r.forward_path, "/api/health?full=1");

        let r = resolver.resolve(None, "/grafana").unwrap();
        assert_eq!(r.forward_path, "/");

        let r = resolver.resolve(None, "/grafana?x=1").unwrap();
        assert_eq!(r.slug, "grafana");
        assert_eq!(r.forward_path, "/?x=1");

        let r = resolver.resolve(None, "/grafana/").unwrap();
        assert_eq!(r.forward_path, "/");

        assert!(resolver.resolve(None, "/").is_none());
        assert!(resolver.resolve(None, "/?x=1").is_none());
    }

    #[test]
    fn test_subdomain_resolution() {
        let resolver = Subdomain::new("example.com");

        let r = resolver.resolve(Some("Sonarr.Example.com:8443"), "/api?x=1").unwrap();
        assert_eq!(r.slug, "sonarr");
        assert_eq!(r.forward_path, "/api?x=1");

        assert!(resolver.resolve(Some("example.com"), "/").is_none());
        assert!(resolver.resolve(Some("a.b.example.com"), "/").is_none());
        assert!(resolver.resolve(Some("sonarr.other.com"), "/").is_none());
        assert!(resolver.resolve(None, "/").is_none());
    }

    #[test]
    fn test_upstream_uri() {
        let r = route("sonarr", "http://127.0.0.1:8989", true);
        assert_eq!(r.authority(), "127.0.0.1:8989");
        assert_eq!(
            r.upstream_uri("/api/v3?apikey=x").unwrap().to_string(),
            "http://127.0.0.1:8989/api/v3?apikey=x"
        );

        let r = route("grafana", "http://10.0.0.2:3000/grafana/", true);
        assert_eq!(
            r.upstream_uri("/login").unwrap().to_string(),
            "http://10.0.0.2:3000/grafana/login"
        );
    }

    #[test]
    fn test_table_from_apps_disables_https_targets() {
        let apps = vec![
            AppConfig::new("Sonarr", "sonarr", "http://127.0.0.1:8989"),
            AppConfig::new("NAS", "nas", "https://nas.local:5001"),
            AppConfig::new("Plex", "plex", "http://127.0.0.1:32400").disabled(),
        ];
        let table = RouteTable::from_apps(&apps).unwrap();

        assert_eq!(table.len(), 3);
        assert!(table.enabled("sonarr").is_some());
        assert!(table.enabled("nas").is_none());
        assert!(table.get("nas").is_some());
        assert!(table.enabled("plex").is_none());
        assert!(table.enabled("missing").is_none());

        let slugs: Vec<&str> = table.sorted().iter().map(|r| r.slug.as_str()).collect();
        assert_eq!(slugs, vec!["nas", "plex", "sonarr"]);
    }

    #[test]
    fn test_shared_table_snapshot_survives_swap() {
        let shared = SharedRouteTable::new(RouteTable::new([route("a", "http://127.0.0.1:1", true)]));
        let before = shared.load();

        shared.store(RouteTable::new([route("b", "http://127.0.0.1:2", true)]));

        assert!(before.get("a").is_some());
        assert!(shared.load().get("a").is_none());
        assert!(shared.load().get("b").is_some());
    }

    #[test]
    fn test_external_base_path_mode_from_listener() {
        let server = ServerConfig {
            listen: "0.0.0.0:8080".to_string(),
            ..ServerConfig::default()
        };
        let base = ExternalBase::from_server(&server, false);
        assert_eq!(base.url_for("grafana"), "http://localhost:8080/grafana/");
    }

    #[test]
    fn test_external_base_subdomain_with_domain() {
        let mut server = ServerConfig {
            listen: "0.0.0.0:443".to_string(),
            routing: RoutingMode::Subdomain,
            ..ServerConfig::default()
        };
        server.tls.domain = Some("example.com".to_string());

        let base = ExternalBase::from_server(&server, true);
        assert_eq!(base.url_for("sonarr"), "https://sonarr.example.com/");
    }

    #[test]
    fn test_external_base_public_url_override() {
        let server = ServerConfig {
            public_url: Some("https://home.example.org/apps/".to_string()),
            ..ServerConfig::default()
        };
        let base = ExternalBase::from_server(&server, false);
        assert_eq!(base.url_for("plex"), "https://home.example.org/apps/plex/");
    }
}
