//! Health monitoring for dashboard applications
//!
//! Every configured app gets its own record and its own polling task. A
//! check for one app never waits on another: the only shared state is the
//! slug map, and each entry carries its own record lock and in-flight guard.

use crate::config::{AppConfig, HealthSettings};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};
use url::Url;

/// Fraction of the interval added as random delay before each check
const JITTER_RATIO: f64 = 0.1;

/// Health status of an app
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// No check has completed yet
    Unknown,
    /// Last check succeeded within the slow threshold
    Healthy,
    /// Last check was slow, or failed without reaching the failure threshold
    Degraded,
    /// Failure threshold reached
    Unhealthy,
}

/// Snapshot of an app's health
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppHealth {
    pub status: HealthStatus,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_error: String,
    /// Duration of the last successful check
    pub latency_ms: u64,
    pub consecutive_failures: u32,
}

impl Default for AppHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            last_checked_at: None,
            last_error: String::new(),
            latency_ms: 0,
            consecutive_failures: 0,
        }
    }
}

/// Thresholds used to turn probe outcomes into a status
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub failure_threshold: u32,
    pub slow: Duration,
}

impl From<&HealthSettings> for Thresholds {
    fn from(settings: &HealthSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            slow: settings.slow_threshold(),
        }
    }
}

/// Result of a single probe
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Up { latency: Duration },
    Down { error: String },
}

impl AppHealth {
    /// Fold a probe outcome into the record
    pub fn apply(&mut self, outcome: ProbeOutcome, thresholds: Thresholds, at: DateTime<Utc>) {
        self.last_checked_at = Some(at);
        match outcome {
            ProbeOutcome::Up { latency } => {
                self.consecutive_failures = 0;
                self.last_error.clear();
                self.latency_ms = latency.as_millis() as u64;
                self.status = if latency > thresholds.slow {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                };
            }
            ProbeOutcome::Down { error } => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.last_error = error;
                self.status = if self.consecutive_failures >= thresholds.failure_threshold {
                    HealthStatus::Unhealthy
                } else {
                    HealthStatus::Degraded
                };
            }
        }
    }
}

/// Issues HTTP reachability probes
struct Prober {
    client: reqwest::Client,
    timeout: Duration,
}

impl Prober {
    fn new(settings: &HealthSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout())
            .user_agent(settings.user_agent.as_str())
            .no_proxy()
            .build()
            .map_err(|e| Error::Config(format!("failed to build probe client: {}", e)))?;

        Ok(Self {
            client,
            timeout: settings.timeout(),
        })
    }

    async fn probe(&self, url: &Url) -> ProbeOutcome {
        let started = Instant::now();

        match tokio::time::timeout(self.timeout, self.client.get(url.clone()).send()).await {
            Ok(Ok(response)) if response.status().is_success() => ProbeOutcome::Up {
                latency: started.elapsed(),
            },
            Ok(Ok(response)) => ProbeOutcome::Down {
                error: format!("unexpected status {}", response.status()),
            },
            Ok(Err(e)) if e.is_timeout() => ProbeOutcome::Down {
                error: format!("timed out after {}ms", self.timeout.as_millis()),
            },
            Ok(Err(e)) => ProbeOutcome::Down {
                error: format!("request failed: {}", e),
            },
            Err(_) => ProbeOutcome::Down {
                error: format!("timed out after {}ms", self.timeout.as_millis()),
            },
        }
    }
}

/// Per-app monitoring state
struct AppSlot {
    slug: String,
    url: Url,
    interval: Duration,
    record: RwLock<AppHealth>,
    /// Held for the duration of a probe; waiters join the running check
    in_flight: tokio::sync::Mutex<()>,
    /// Number of checks that have completed
    completed: AtomicU64,
}

struct MonitorInner {
    slots: DashMap<String, Arc<AppSlot>>,
    prober: Prober,
    thresholds: Thresholds,
}

impl MonitorInner {
    /// Run one check for `slot`, or wait for the one already running.
    async fn check(&self, slot: &AppSlot) -> AppHealth {
        let seen = slot.completed.load(Ordering::Acquire);
        let _guard = slot.in_flight.lock().await;

        if slot.completed.load(Ordering::Acquire) != seen {
            // Another check finished while we waited for the guard
            return slot.record.read().clone();
        }

        let outcome = self.prober.probe(&slot.url).await;
        let (previous, snapshot) = {
            let mut record = slot.record.write();
            let previous = record.status;
            record.apply(outcome, self.thresholds, Utc::now());
            (previous, record.clone())
        };
        slot.completed.fetch_add(1, Ordering::Release);

        if previous != snapshot.status {
            match snapshot.status {
                HealthStatus::Unhealthy => warn!(
                    slug = %slot.slug,
                    failures = snapshot.consecutive_failures,
                    error = %snapshot.last_error,
                    "App is now unhealthy"
                ),
                status => info!(slug = %slot.slug, ?previous, ?status, "App health changed"),
            }
        } else {
            debug!(
                slug = %slot.slug,
                status = ?snapshot.status,
                latency_ms = snapshot.latency_ms,
                "Health check completed"
            );
        }

        snapshot
    }
}

/// Tracks reachability of every configured app.
///
/// ```ignore
/// let monitor = HealthMonitor::new(HealthSettings::default())?;
/// monitor.start(&config.apps)?;
/// let health = monitor.check_now("grafana").await;
/// ```
pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
    settings: HealthSettings,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(settings: HealthSettings) -> Result<Self> {
        if settings.interval_ms == 0 || settings.timeout_ms == 0 {
            return Err(Error::Config(
                "health.interval_ms and health.timeout_ms must be greater than 0".to_string(),
            ));
        }
        let prober = Prober::new(&settings)?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(MonitorInner {
                slots: DashMap::new(),
                prober,
                thresholds: Thresholds::from(&settings),
            }),
            settings,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Create a record for every app and schedule its polling loop.
    ///
    /// Apps that are already monitored keep their record and loop, so calling
    /// this again with a reloaded app list only adds the new slugs. Returns as
    /// soon as the loops are spawned. Must be called from within a Tokio
    /// runtime.
    pub fn start(&self, apps: &[AppConfig]) -> Result<()> {
        // Resolve every URL first so a bad entry schedules nothing
        let mut slots = Vec::with_capacity(apps.len());
        for app in apps {
            app.validate().map_err(Error::Config)?;
            slots.push(Arc::new(AppSlot {
                slug: app.slug.clone(),
                url: app.health_url()?,
                interval: app.check_interval(&self.settings),
                record: RwLock::new(AppHealth::default()),
                in_flight: tokio::sync::Mutex::new(()),
                completed: AtomicU64::new(0),
            }));
        }

        self.shutdown_tx.send_replace(false);
        let mut tasks = self.tasks.lock();

        for slot in slots {
            if self.inner.slots.contains_key(&slot.slug) {
                debug!(slug = %slot.slug, "App already monitored, skipping");
                continue;
            }
            self.inner.slots.insert(slot.slug.clone(), Arc::clone(&slot));

            debug!(
                slug = %slot.slug,
                url = %slot.url,
                interval_ms = slot.interval.as_millis() as u64,
                "Scheduling health checks"
            );

            let inner = Arc::clone(&self.inner);
            let shutdown_rx = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(check_loop(inner, slot, shutdown_rx)));
        }

        info!(apps = self.inner.slots.len(), "Health monitor started");
        Ok(())
    }

    /// Snapshot of one app's record
    pub fn get_health(&self, slug: &str) -> Option<AppHealth> {
        self.inner.slots.get(slug).map(|slot| slot.record.read().clone())
    }

    /// Snapshot of every record, keyed by slug
    pub fn get_all_health(&self) -> HashMap<String, AppHealth> {
        self.inner
            .slots
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().record.read().clone()))
            .collect()
    }

    /// Check an app immediately, joining a check already in flight.
    pub async fn check_now(&self, slug: &str) -> Option<AppHealth> {
        // Clone the Arc so no map guard is held across the probe
        let slot = self.inner.slots.get(slug).map(|s| Arc::clone(s.value()))?;
        Some(self.inner.check(&slot).await)
    }

    /// Number of completed checks for an app
    pub fn checks_completed(&self, slug: &str) -> Option<u64> {
        self.inner
            .slots
            .get(slug)
            .map(|slot| slot.completed.load(Ordering::Acquire))
    }

    /// Cancel all loops. In-flight checks get `stop_timeout` to finish.
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return;
        }
        let aborts: Vec<AbortHandle> = tasks.iter().map(|t| t.abort_handle()).collect();

        let grace = self.settings.stop_timeout();
        if tokio::time::timeout(grace, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "Health checks still running after grace period, cancelling"
            );
            for abort in aborts {
                abort.abort();
            }
        }

        info!("Health monitor stopped");
    }
}

async fn check_loop(inner: Arc<MonitorInner>, slot: Arc<AppSlot>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        inner.check(&slot).await;

        tokio::select! {
            _ = tokio::time::sleep(jittered(slot.interval)) => {}
            res = shutdown_rx.changed() => {
                if res.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    debug!(slug = %slot.slug, "Health check loop exited");
}

/// Interval plus up to 10% random delay
fn jittered(interval: Duration) -> Duration {
    let max_jitter = (interval.as_millis() as f64 * JITTER_RATIO) as u64;
    if max_jitter == 0 {
        return interval;
    }
    interval + Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> Thresholds {
        Thresholds {
            failure_threshold: 3,
            slow: Duration::from_millis(1000),
        }
    }

    fn down() -> ProbeOutcome {
        ProbeOutcome::Down {
            error: "connection refused".to_string(),
        }
    }

    #[test]
    fn test_new_record_is_unknown() {
        let health = AppHealth::default();
        assert_eq!(health.status, HealthStatus::Unknown);
        assert!(health.last_checked_at.is_none());
        assert_eq!(health.consecutive_failures, 0);
    }

    #[test]
    fn test_fast_success_is_healthy() {
        let mut health = AppHealth::default();
        health.apply(
            ProbeOutcome::Up { latency: Duration::from_millis(50) },
            thresholds(),
            Utc::now(),
        );
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.latency_ms, 50);
        assert!(health.last_error.is_empty());
        assert!(health.last_checked_at.is_some());
    }

    #[test]
    fn test_slow_success_is_degraded() {
        let mut health = AppHealth::default();
        health.apply(
            ProbeOutcome::Up { latency: Duration::from_millis(1500) },
            thresholds(),
            Utc::now(),
        );
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.latency_ms, 1500);
    }

    #[test]
    fn test_unhealthy_after_threshold_then_recovery() {
        let mut health = AppHealth::default();

        health.apply(down(), thresholds(), Utc::now());
        assert_eq!(health.status, HealthStatus::Degraded);
        health.apply(down(), thresholds(), Utc::now());
        assert_eq!(health.status, HealthStatus::Degraded);
        health.apply(down(), thresholds(), Utc::now());
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.consecutive_failures, 3);
        assert_eq!(health.last_error, "connection refused");

        health.apply(down(), thresholds(), Utc::now());
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.consecutive_failures, 4);

        health.apply(
            ProbeOutcome::Up { latency: Duration::from_millis(20) },
            thresholds(),
            Utc::now(),
        );
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.last_error.is_empty());
    }

    #[test]
    fn test_recovery_to_degraded_when_slow() {
        let mut health = AppHealth::default();
        for _ in 0..3 {
            health.apply(down(), thresholds(), Utc::now());
        }
        health.apply(
            ProbeOutcome::Up { latency: Duration::from_millis(2500) },
            thresholds(),
            Utc::now(),
        );
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.consecutive_failures, 0);
    }

    #[test]
    fn test_failure_keeps_last_latency() {
        let mut health = AppHealth::default();
        health.apply(
            ProbeOutcome::Up { latency: Duration::from_millis(80) },
            thresholds(),
            Utc::now(),
        );
        health.apply(down(), thresholds(), Utc::now());
        assert_eq!(health.latency_ms, 80);
    }

    #[test]
    fn test_jitter_bounds() {
        let interval = Duration::from_secs(30);
        for _ in 0..100 {
            let delay = jittered(interval);
            assert!(delay >= interval);
            assert!(delay <= interval + Duration::from_secs(3));
        }
        assert_eq!(jittered(Duration::from_millis(5)), Duration::from_millis(5));
    }

    #[test]
    fn test_health_serializes_camel_case() {
        let json = serde_json::to_value(AppHealth::default()).unwrap();
        assert_eq!(json["status"], "unknown");
        assert_eq!(json["consecutiveFailures"], 0);
        assert!(json.get("lastCheckedAt").is_some());
    }

    #[tokio::test]
    async fn test_unknown_slug_not_found() {
        let monitor = HealthMonitor::new(HealthSettings::default()).unwrap();
        monitor.start(&[]).unwrap();
        assert!(monitor.get_health("missing").is_none());
        assert!(monitor.check_now("missing").await.is_none());
        assert!(monitor.get_all_health().is_empty());
        monitor.stop().await;
    }
}
