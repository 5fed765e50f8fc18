//! Caddyfile rendering for an external gateway
//!
//! The proxy can hand its routing table to a separate Caddy instance. The
//! file is replaced with write-to-temp-then-rename so Caddy never reads a
//! partial config.

use crate::config::{RoutingMode, ServerConfig};
use crate::error::{Error, Result};
use crate::routing::{Route, RouteTable};
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;

const HEADER: &str = "# Generated by dashgate. Manual changes will be overwritten.\n";

/// Writes the route table as a Caddyfile
#[derive(Debug, Clone)]
pub struct GatewayWriter {
    path: PathBuf,
    mode: RoutingMode,
    /// Caddy site address: the domain, or `:port` of the listener
    site: String,
}

impl GatewayWriter {
    pub fn new(path: impl Into<PathBuf>, mode: RoutingMode, site: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mode,
            site: site.into(),
        }
    }

    /// Writer for `server.gateway`, if configured
    pub fn from_server(server: &ServerConfig) -> Option<Self> {
        let path = server.gateway.as_ref()?;
        let site = match server.domain() {
            Some(domain) => domain.to_string(),
            None => {
                let port = server
                    .listen
                    .parse::<std::net::SocketAddr>()
                    .map(|a| a.port())
                    .unwrap_or(80);
                format!(":{}", port)
            }
        };
        Some(Self::new(path, server.routing, site))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Render enabled routes, ordered by slug
    pub fn render(&self, table: &RouteTable) -> String {
        let routes: Vec<&Route> = table.sorted().into_iter().filter(|r| r.enabled).collect();
        let mut out = String::from(HEADER);

        match self.mode {
            RoutingMode::Path => {
                let _ = writeln!(out, "{} {{", self.site);
                for route in &routes {
                    let _ = writeln!(out, "\tredir /{0} /{0}/", route.slug);
                    let _ = writeln!(out, "\thandle_path /{}/* {{", route.slug);
                    write_upstream(&mut out, route, "\t\t");
                    out.push_str("\t}\n");
                }
                out.push_str("\trespond 404\n}\n");
            }
            RoutingMode::Subdomain => {
                let domain = self.site.trim_start_matches(':');
                for (i, route) in routes.iter().enumerate() {
                    if i > 0 {
                        out.push('\n');
                    }
                    let _ = writeln!(out, "{}.{} {{", route.slug, domain);
                    write_upstream(&mut out, route, "\t");
                    out.push_str("}\n");
                }
            }
        }

        out
    }

    /// Render and atomically replace the gateway file
    pub fn write(&self, table: &RouteTable) -> Result<()> {
        let rendered = self.render(table);
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| {
            Error::Gateway(format!("failed to create temp file in {}: {}", dir.display(), e))
        })?;
        tmp.write_all(rendered.as_bytes())
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| Error::Gateway(format!("failed to write gateway config: {}", e)))?;
        if let Some(permissions) = target_permissions(&self.path) {
            tmp.as_file().set_permissions(permissions).map_err(|e| {
                Error::Gateway(format!("failed to set gateway config permissions: {}", e))
            })?;
        }
        tmp.persist(&self.path).map_err(|e| {
            Error::Gateway(format!("failed to replace {}: {}", self.path.display(), e.error))
        })?;

        info!(
            path = %self.path.display(),
            routes = table.len(),
            "Gateway config written"
        );
        Ok(())
    }
}

/// Mode for the replacement file: the existing file's, else world-readable
/// so a gateway running as another user can load it
fn target_permissions(path: &Path) -> Option<std::fs::Permissions> {
    if let Ok(meta) = std::fs::metadata(path) {
        return Some(meta.permissions());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        Some(std::fs::Permissions::from_mode(0o644))
    }
    #[cfg(not(unix))]
    {
        None
    }
}

fn write_upstream(out: &mut String, route: &Route, indent: &str) {
    let base = route.target.path().trim_end_matches('/');
    if !base.is_empty() {
        let _ = writeln!(out, "{}rewrite * {}{{uri}}", indent, base);
    }
    let _ = writeln!(
        out,
        "{}reverse_proxy {}://{}",
        indent,
        route.target.scheme(),
        route.authority()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn table() -> RouteTable {
        RouteTable::new([
            Route::new("sonarr", "Sonarr", Url::parse("http://127.0.0.1:8989").unwrap(), true),
            Route::new("grafana", "Grafana", Url::parse("http://10.0.0.2:3000/grafana/").unwrap(), true),
            Route::new("plex", "Plex", Url::parse("http://127.0.0.1:32400").unwrap(), false),
        ])
    }

    #[test]
    fn test_render_path_mode() {
        let writer = GatewayWriter::new("/tmp/unused", RoutingMode::Path, "example.com");
        let rendered = writer.render(&table());

        let expected = "\
# Generated by dashgate. Manual changes will be overwritten.
example.com {
\tredir /grafana /grafana/
\thandle_path /grafana/* {
\t\trewrite * /grafana{uri}
\t\treverse_proxy http://10.0.0.2:3000
\t}
\tredir /sonarr /sonarr/
\thandle_path /sonarr/* {
\t\treverse_proxy http://127.0.0.1:8989
\t}
\trespond 404
}
";
        assert_eq!(rendered, expected);
    }

    #[test]
    fn test_render_subdomain_mode_skips_disabled() {
        let writer = GatewayWriter::new("/tmp/unused", RoutingMode::Subdomain, "example.com");
        let rendered = writer.render(&table());

        assert!(rendered.contains("sonarr.example.com {\n\treverse_proxy http://127.0.0.1:8989\n}"));
        assert!(rendered.contains("grafana.example.com {"));
        assert!(!rendered.contains("plex"));
    }

    #[test]
    fn test_site_from_listener_port() {
        let server = ServerConfig {
            listen: "0.0.0.0:8080".to_string(),
            gateway: Some("/tmp/dashgate.caddy".to_string()),
            ..ServerConfig::default()
        };
        let writer = GatewayWriter::from_server(&server).unwrap();
        assert!(writer.render(&RouteTable::default()).contains(":8080 {"));

        assert!(GatewayWriter::from_server(&ServerConfig::default()).is_none());
    }

    #[test]
    fn test_write_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Caddyfile");
        std::fs::write(&path, "stale").unwrap();

        let writer = GatewayWriter::new(&path, RoutingMode::Path, ":80");
        writer.write(&table()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with(HEADER));
        assert!(content.contains("handle_path /sonarr/*"));

        // Only the target file remains, no temp files left behind
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_write_keeps_existing_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Caddyfile");
        std::fs::write(&path, "stale").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o640)).unwrap();

        GatewayWriter::new(&path, RoutingMode::Path, ":80")
            .write(&table())
            .unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);
    }

    #[cfg(unix)]
    #[test]
    fn test_new_file_is_world_readable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Caddyfile");

        GatewayWriter::new(&path, RoutingMode::Path, ":80")
            .write(&table())
            .unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);
    }

    #[test]
    fn test_write_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let writer = GatewayWriter::new(dir.path().join("missing/Caddyfile"), RoutingMode::Path, ":80");
        assert!(matches!(writer.write(&table()), Err(Error::Gateway(_))));
    }
}
