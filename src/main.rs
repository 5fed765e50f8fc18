use anyhow::Context;
use dashgate::admin::{AdminServer, PKG_NAME, VERSION};
use dashgate::config::Config;
use dashgate::health::HealthMonitor;
use dashgate::lifecycle::ProxyController;
use dashgate::routing::RouteTable;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dashgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("dashgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(
        name = PKG_NAME,
        version = VERSION,
        path = %config_path.display(),
        apps = config.apps.len(),
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor = Arc::new(HealthMonitor::new(config.health.clone())?);
    monitor.start(&config.apps)?;

    let proxy = Arc::new(ProxyController::from_config(&config)?);
    if let Some(router) = proxy.router() {
        router.start().await.context("failed to start proxy router")?;
    } else {
        info!("No [server] section, proxy disabled");
    }

    let admin_handle = match config.server.as_ref().and_then(|s| s.admin_listen.as_deref()) {
        Some(addr) => {
            let admin = AdminServer::bind(addr, Arc::clone(&monitor), Arc::clone(&proxy), shutdown_rx.clone())
                .await
                .context("failed to start status API")?;
            Some(tokio::spawn(admin.run()))
        }
        None => None,
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        let mut sighup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "Received SIGHUP, reloading apps...");
                    reload(&config_path, &monitor, &proxy);
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    if let Some(router) = proxy.router() {
        router.stop().await;
    }
    monitor.stop().await;

    if let Some(handle) = admin_handle {
        let _ = handle.await;
    }

    info!("Shutdown complete");
    Ok(())
}

fn reload(path: &Path, monitor: &HealthMonitor, proxy: &ProxyController) {
    let config = match Config::load(path) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to reload configuration");
            return;
        }
    };

    // New slugs get a record and a loop; existing ones keep theirs
    if let Err(e) = monitor.start(&config.apps) {
        error!(error = %e, "Failed to monitor reloaded apps");
    }

    let Some(router) = proxy.router() else {
        debug!("Proxy disabled, no routes to reload");
        return;
    };

    match RouteTable::from_apps(&config.apps).and_then(|table| router.replace_route_table(table)) {
        Ok(()) => info!(routes = router.route_table().len(), "Routes reloaded"),
        Err(e) => error!(error = %e, "Failed to reload routes"),
    }
}
