use crate::error::{Error, Result};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Top-level configuration file
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Health monitor settings
    #[serde(default)]
    pub health: HealthSettings,

    /// Proxy listener; proxying is disabled when absent
    pub server: Option<ServerConfig>,

    /// Applications shown on the dashboard
    #[serde(default)]
    pub apps: Vec<AppConfig>,
}

/// Health monitor settings shared by all apps
#[derive(Debug, Deserialize, Clone)]
pub struct HealthSettings {
    /// Default interval between checks in milliseconds
    #[serde(default = "default_check_interval")]
    pub interval_ms: u64,

    /// Timeout for a single probe in milliseconds
    #[serde(default = "default_check_timeout")]
    pub timeout_ms: u64,

    /// Latency above which a successful check counts as degraded
    #[serde(default = "default_slow_threshold")]
    pub slow_threshold_ms: u64,

    /// Consecutive failures before an app is marked unhealthy
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Grace period for in-flight checks when the monitor stops
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,

    /// User-Agent sent with probes
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_check_interval(),
            timeout_ms: default_check_timeout(),
            slow_threshold_ms: default_slow_threshold(),
            failure_threshold: default_failure_threshold(),
            stop_timeout_ms: default_stop_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl HealthSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn slow_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_threshold_ms)
    }
}

/// A proxied application
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct AppConfig {
    /// Display name
    pub name: String,

    /// URL-safe unique identifier, used as the routing key
    pub slug: String,

    /// Backend base URL
    pub url: String,

    /// Health check override: a path below `url`'s base path, or an absolute URL
    pub health_check_path: Option<String>,

    /// Check interval in milliseconds (overrides `health.interval_ms`)
    pub check_interval_ms: Option<u64>,

    /// Whether the proxy routes traffic to this app
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl AppConfig {
    pub fn new(name: &str, slug: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            slug: slug.to_string(),
            url: url.to_string(),
            health_check_path: None,
            check_interval_ms: None,
            enabled: true,
        }
    }

    /// Set the health check override (builder pattern)
    pub fn with_health_check_path(mut self, path: &str) -> Self {
        self.health_check_path = Some(path.to_string());
        self
    }

    /// Set the check interval (builder pattern)
    pub fn with_check_interval_ms(mut self, interval_ms: u64) -> Self {
        self.check_interval_ms = Some(interval_ms);
        self
    }

    /// Disable proxying for this app (builder pattern)
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn check_interval(&self, settings: &HealthSettings) -> Duration {
        Duration::from_millis(self.check_interval_ms.unwrap_or(settings.interval_ms))
    }

    pub fn target_url(&self) -> Result<Url> {
        Url::parse(&self.url)
            .map_err(|e| Error::Config(format!("app '{}': invalid url '{}': {}", self.slug, self.url, e)))
    }

    /// URL probed by the health monitor
    pub fn health_url(&self) -> Result<Url> {
        let target = self.target_url()?;
        match self.health_check_path.as_deref() {
            None | Some("") => Ok(target),
            Some(path) if path.starts_with('/') => {
                let below_base = format!("{}{}", target.path().trim_end_matches('/'), path);
                target.join(&below_base).map_err(|e| {
                    Error::Config(format!(
                        "app '{}': invalid health_check_path '{}': {}",
                        self.slug, path, e
                    ))
                })
            }
            Some(url) => Url::parse(url).map_err(|e| {
                Error::Config(format!(
                    "app '{}': invalid health_check_path '{}': {}",
                    self.slug, url, e
                ))
            }),
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.slug.is_empty() {
            return Err(format!("app '{}': 'slug' must not be empty", self.name));
        }
        if !self
            .slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(format!(
                "app '{}': slug may only contain a-z, 0-9 and '-'",
                self.slug
            ));
        }

        let target = self.target_url().map_err(|e| e.to_string())?;
        if target.scheme() != "http" && target.scheme() != "https" {
            return Err(format!(
                "app '{}': url scheme must be http or https",
                self.slug
            ));
        }
        if target.host_str().is_none() {
            return Err(format!("app '{}': url has no host", self.slug));
        }

        if self.check_interval_ms == Some(0) {
            return Err(format!(
                "app '{}': check_interval_ms must be greater than 0",
                self.slug
            ));
        }

        self.health_url().map_err(|e| e.to_string())?;
        Ok(())
    }
}

/// How the proxy maps an inbound request to an app slug
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    /// `/{slug}/...` on a single host
    #[default]
    Path,
    /// `{slug}.{domain}`
    Subdomain,
}

/// Proxy listener configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0:8080)
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Slug resolution strategy (default: path)
    #[serde(default)]
    pub routing: RoutingMode,

    /// Externally reachable base URL, if it differs from the listener
    pub public_url: Option<String>,

    /// Maximum time to wait for a backend response in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Grace period for in-flight requests on shutdown in seconds
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// Bind address for the JSON status API (disabled when unset)
    pub admin_listen: Option<String>,

    /// Output path for a generated Caddyfile mirroring the route table
    pub gateway: Option<String>,

    /// TLS termination
    #[serde(default)]
    pub tls: TlsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            routing: RoutingMode::default(),
            public_url: None,
            request_timeout_secs: default_request_timeout(),
            drain_timeout_secs: default_drain_timeout(),
            admin_listen: None,
            gateway: None,
            tls: TlsConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Public domain, used for URLs, subdomain routing and ACME
    pub fn domain(&self) -> Option<&str> {
        self.tls.domain.as_deref().filter(|d| !d.is_empty())
    }

    /// Validate the whole server section and resolve the TLS mode
    pub fn validate(&self) -> Result<TlsMode> {
        self.listen.parse::<std::net::SocketAddr>().map_err(|e| {
            Error::Config(format!("server.listen '{}' is not a socket address: {}", self.listen, e))
        })?;

        if self.routing == RoutingMode::Subdomain && self.domain().is_none() {
            return Err(Error::Config(
                "server.routing = \"subdomain\" requires server.tls.domain".to_string(),
            ));
        }

        if let Some(public_url) = &self.public_url {
            Url::parse(public_url).map_err(|e| {
                Error::Config(format!("server.public_url '{}' is invalid: {}", public_url, e))
            })?;
        }

        if let Some(gateway) = &self.gateway {
            if gateway.is_empty() {
                return Err(Error::Config("server.gateway must not be empty".to_string()));
            }
        }

        self.tls.mode()
    }
}

/// Challenge type for ACME domain validation
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum AcmeChallengeType {
    /// TLS-ALPN-01: answered on the proxy listener itself
    #[default]
    #[serde(alias = "tls-alpn01", alias = "TLS-ALPN-01")]
    #[serde(rename = "tls-alpn-01")]
    TlsAlpn01,
    /// HTTP-01: answered on a plaintext listener at `http_listen`
    #[serde(alias = "http01", alias = "HTTP-01")]
    #[serde(rename = "http-01")]
    Http01,
}

/// TLS settings. `domain` + `email` enables automatic certificates,
/// `cert` + `key` loads static files. Configuring both is an error.
#[derive(Debug, Deserialize, Clone)]
pub struct TlsConfig {
    pub domain: Option<String>,
    pub email: Option<String>,

    /// Path to TLS certificate chain (PEM)
    pub cert: Option<String>,
    /// Path to TLS private key (PEM)
    pub key: Option<String>,

    /// Local directory for ACME account and certificate cache
    #[serde(default = "default_acme_cache_dir")]
    pub cache_dir: String,

    /// ACME directory URL (defaults to Let's Encrypt production)
    pub directory_url: Option<String>,

    #[serde(default)]
    pub challenge: AcmeChallengeType,

    /// Plaintext listener for HTTP-01 challenges and HTTPS redirects
    pub http_listen: Option<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            domain: None,
            email: None,
            cert: None,
            key: None,
            cache_dir: default_acme_cache_dir(),
            directory_url: None,
            challenge: AcmeChallengeType::default(),
            http_listen: None,
        }
    }
}

/// Resolved TLS mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsMode {
    /// Serve plaintext HTTP
    None,
    /// Load a certificate from disk and reload it when the files change
    Static { cert: PathBuf, key: PathBuf },
    /// Obtain and renew a certificate automatically
    Acme { domain: String, email: String },
}

impl TlsMode {
    pub fn is_tls(&self) -> bool {
        !matches!(self, TlsMode::None)
    }

    pub fn kind(&self) -> TlsKind {
        match self {
            TlsMode::None => TlsKind::None,
            TlsMode::Static { .. } => TlsKind::Static,
            TlsMode::Acme { .. } => TlsKind::Acme,
        }
    }
}

/// TLS mode without its parameters, for status reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsKind {
    None,
    Static,
    Acme,
}

impl TlsConfig {
    pub fn mode(&self) -> Result<TlsMode> {
        let non_empty = |v: &Option<String>| v.as_deref().filter(|s| !s.is_empty()).map(String::from);
        let domain = non_empty(&self.domain);
        let email = non_empty(&self.email);
        let cert = non_empty(&self.cert);
        let key = non_empty(&self.key);

        let wants_acme = email.is_some();
        let wants_static = cert.is_some() || key.is_some();

        if wants_acme && wants_static {
            return Err(Error::Config(
                "server.tls: automatic certificates (domain + email) and static certificates (cert + key) are mutually exclusive"
                    .to_string(),
            ));
        }

        if wants_static {
            return match (cert, key) {
                (Some(cert), Some(key)) => Ok(TlsMode::Static {
                    cert: PathBuf::from(cert),
                    key: PathBuf::from(key),
                }),
                (Some(_), None) => Err(Error::Config("server.tls: 'cert' requires 'key'".to_string())),
                _ => Err(Error::Config("server.tls: 'key' requires 'cert'".to_string())),
            };
        }

        if let Some(email) = email {
            let domain = domain.ok_or_else(|| {
                Error::Config("server.tls: 'email' requires 'domain' for automatic certificates".to_string())
            })?;
            if self.cache_dir.contains("..") {
                return Err(Error::Config(
                    "server.tls.cache_dir must not contain '..'".to_string(),
                ));
            }
            return Ok(TlsMode::Acme { domain, email });
        }

        Ok(TlsMode::None)
    }
}

fn default_true() -> bool {
    true
}

fn default_check_interval() -> u64 {
    30_000
}

fn default_check_timeout() -> u64 {
    5_000
}

fn default_slow_threshold() -> u64 {
    1_000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_stop_timeout() -> u64 {
    5_000
}

fn default_user_agent() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_drain_timeout() -> u64 {
    10
}

fn default_acme_cache_dir() -> String {
    "./acme_cache".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate apps and the server section
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();

        for app in &self.apps {
            if let Err(e) = app.validate() {
                errors.push(e);
            }
            if !seen.insert(app.slug.as_str()) {
                errors.push(format!("app '{}': duplicate slug", app.slug));
            }
        }

        if self.health.failure_threshold == 0 {
            errors.push("health.failure_threshold must be at least 1".to_string());
        }
        if self.health.interval_ms == 0 {
            errors.push("health.interval_ms must be greater than 0".to_string());
        }
        if self.health.timeout_ms == 0 {
            errors.push("health.timeout_ms must be greater than 0".to_string());
        }

        if let Some(server) = &self.server {
            if let Err(e) = server.validate() {
                errors.push(e.to_string());
            }
        }

        if !errors.is_empty() {
            return Err(Error::Config(format!(
                "\n  - {}",
                errors.join("\n  - ")
            )));
        }

        Ok(())
    }
}
