//! Self and peer health tracking.
//!
//! Status only flips after `healthy_threshold` consecutive successes or
//! `unhealthy_threshold` consecutive failures. A failed check updates state
//! and is logged; it never stops the loop.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use node_proto::mesh::HealthReport;
use node_proto::now_ms;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::peers::PeerManager;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
        })
    }
}

impl From<HealthStatus> for node_proto::mesh::HealthStatus {
    fn from(status: HealthStatus) -> Self {
        match status {
            HealthStatus::Unknown => Self::Unknown,
            HealthStatus::Healthy => Self::Healthy,
            HealthStatus::Unhealthy => Self::Unhealthy,
        }
    }
}

impl From<node_proto::mesh::HealthStatus> for HealthStatus {
    fn from(status: node_proto::mesh::HealthStatus) -> Self {
        match status {
            node_proto::mesh::HealthStatus::Unknown => Self::Unknown,
            node_proto::mesh::HealthStatus::Healthy => Self::Healthy,
            node_proto::mesh::HealthStatus::Unhealthy => Self::Unhealthy,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthInfo {
    pub status: HealthStatus,
    pub message: String,
    pub last_checked_ms: u64,
    pub last_error: Option<String>,
}

impl HealthInfo {
    pub fn to_report(&self) -> HealthReport {
        HealthReport {
            status: node_proto::mesh::HealthStatus::from(self.status) as i32,
            message: self.message.clone(),
            last_checked_ms: self.last_checked_ms,
            last_error: self.last_error.clone().unwrap_or_default(),
        }
    }

    pub fn from_report(report: &HealthReport) -> Self {
        Self {
            status: report.status().into(),
            message: report.message.clone(),
            last_checked_ms: report.last_checked_ms,
            last_error: (!report.last_error.is_empty()).then(|| report.last_error.clone()),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    info: HealthInfo,
    successes: u32,
    failures: u32,
}

/// Current health of one node, safe to share between the monitor loop and
/// request handlers.
#[derive(Debug)]
pub struct HealthState {
    inner: Mutex<Counters>,
    healthy_threshold: u32,
    unhealthy_threshold: u32,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new(&HealthConfig::default())
    }
}

impl HealthState {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            inner: Mutex::new(Counters::default()),
            healthy_threshold: config.healthy_threshold.max(1),
            unhealthy_threshold: config.unhealthy_threshold.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Overwrite status and message directly, bypassing the thresholds.
    pub fn update(&self, status: HealthStatus, message: impl Into<String>) {
        let mut inner = self.lock();
        inner.info.status = status;
        inner.info.message = message.into();
        inner.info.last_checked_ms = now_ms();
    }

    pub fn record_success(&self, message: impl Into<String>) -> HealthStatus {
        let mut inner = self.lock();
        inner.failures = 0;
        inner.successes = inner.successes.saturating_add(1);
        inner.info.message = message.into();
        inner.info.last_checked_ms = now_ms();
        if inner.successes >= self.healthy_threshold {
            inner.info.status = HealthStatus::Healthy;
        }
        inner.info.status
    }

    pub fn record_failure(&self, error: impl Into<String>) -> HealthStatus {
        let mut inner = self.lock();
        inner.successes = 0;
        inner.failures = inner.failures.saturating_add(1);
        let error = error.into();
        inner.info.message = format!("check failed: {error}");
        inner.info.last_error = Some(error);
        inner.info.last_checked_ms = now_ms();
        if inner.failures >= self.unhealthy_threshold {
            inner.info.status = HealthStatus::Unhealthy;
        }
        inner.info.status
    }

    pub fn status(&self) -> HealthStatus {
        self.lock().info.status
    }

    pub fn snapshot(&self) -> HealthInfo {
        self.lock().info.clone()
    }
}

/// One self-check. `Ok` carries a short status message.
#[async_trait::async_trait]
pub trait HealthCheck: Send + Sync + 'static {
    async fn check(&self) -> Result<String, String>;
}

pub struct HealthMonitor;

impl HealthMonitor {
    /// Run `check` every `interval`, bounding each run by `timeout`, until
    /// `shutdown` turns true.
    pub fn spawn(
        state: Arc<HealthState>,
        check: Arc<dyn HealthCheck>,
        config: HealthConfig,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.wait_for(|stop| *stop) => break,
                }
                let before = state.status();
                let after = match tokio::time::timeout(config.timeout(), check.check()).await {
                    Ok(Ok(message)) => state.record_success(message),
                    Ok(Err(error)) => state.record_failure(error),
                    Err(_) => state.record_failure(format!(
                        "health check timed out after {:?}",
                        config.timeout()
                    )),
                };
                if before != after {
                    info!("health changed: {before} -> {after}");
                }
            }
            debug!("health monitor stopped");
        })
    }
}

/// Per-peer health, fed by pinging every connected peer.
pub struct PeerHealthMonitor {
    peers: Arc<PeerManager>,
    config: HealthConfig,
    table: Mutex<HashMap<String, Arc<HealthState>>>,
}

impl PeerHealthMonitor {
    pub fn new(peers: Arc<PeerManager>, config: HealthConfig) -> Self {
        Self {
            peers,
            config,
            table: Mutex::new(HashMap::new()),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Arc<HealthState>>> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, peer_id: &str) -> Option<HealthInfo> {
        self.table().get(peer_id).map(|s| s.snapshot())
    }

    pub fn all(&self) -> HashMap<String, HealthInfo> {
        self.table()
            .iter()
            .map(|(id, state)| (id.clone(), state.snapshot()))
            .collect()
    }

    /// Ping every current peer once and record the results. Peers that are
    /// no longer known are dropped from the table.
    pub async fn check_all(&self) {
        let peer_ids = self.peers.peer_ids().await;
        self.table().retain(|id, _| peer_ids.contains(id));

        for peer_id in peer_ids {
            let state = self
                .table()
                .entry(peer_id.clone())
                .or_insert_with(|| Arc::new(HealthState::new(&self.config)))
                .clone();
            let nonce = now_ms();
            let before = state.status();
            let after = match tokio::time::timeout(
                self.config.timeout(),
                self.peers.ping_peer(&peer_id, nonce),
            )
            .await
            {
                Ok(Ok(_)) => state.record_success("pong"),
                Ok(Err(e)) => state.record_failure(e.to_string()),
                Err(_) => state.record_failure(format!(
                    "ping timed out after {:?}",
                    self.config.timeout()
                )),
            };
            if before != after {
                if after == HealthStatus::Unhealthy {
                    warn!("peer {peer_id} is now {after}");
                } else {
                    info!("peer {peer_id} is now {after}");
                }
            }
        }
    }

    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                let stop = tokio::select! {
                    _ = ticker.tick() => false,
                    _ = shutdown.wait_for(|stop| *stop) => true,
                };
                if stop {
                    break;
                }
                self.check_all().await;
            }
            debug!("peer health monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn config(healthy: u32, unhealthy: u32) -> HealthConfig {
        HealthConfig {
            interval_ms: 100,
            timeout_ms: 50,
            healthy_threshold: healthy,
            unhealthy_threshold: unhealthy,
        }
    }

    #[test]
    fn thresholds_gate_status_changes() {
        let state = HealthState::new(&config(2, 2));
        assert_eq!(state.status(), HealthStatus::Unknown);

        assert_eq!(state.record_success("ok"), HealthStatus::Unknown);
        assert_eq!(state.record_success("ok"), HealthStatus::Healthy);

        assert_eq!(state.record_failure("disk"), HealthStatus::Healthy);
        assert_eq!(state.record_success("ok"), HealthStatus::Healthy);
        assert_eq!(state.record_failure("disk"), HealthStatus::Healthy);
        assert_eq!(state.record_failure("disk"), HealthStatus::Unhealthy);

        let info = state.snapshot();
        assert_eq!(info.last_error.as_deref(), Some("disk"));
        assert!(info.last_checked_ms > 0);
    }

    #[test]
    fn report_conversion_keeps_fields() {
        let info = HealthInfo {
            status: HealthStatus::Unhealthy,
            message: "check failed: disk".into(),
            last_checked_ms: 7,
            last_error: Some("disk".into()),
        };
        assert_eq!(HealthInfo::from_report(&info.to_report()), info);
        assert_eq!(
            HealthInfo::from_report(&HealthInfo::default().to_report()).last_error,
            None
        );
    }

    struct Toggle(AtomicBool);

    #[async_trait::async_trait]
    impl HealthCheck for Toggle {
        async fn check(&self) -> Result<String, String> {
            if self.0.load(Ordering::SeqCst) {
                Ok("fine".into())
            } else {
                Err("broken".into())
            }
        }
    }

    struct Hang;

    #[async_trait::async_trait]
    impl HealthCheck for Hang {
        async fn check(&self) -> Result<String, String> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_follows_check_results() {
        let state = Arc::new(HealthState::new(&config(1, 1)));
        let check = Arc::new(Toggle(AtomicBool::new(true)));
        let (stop, rx) = watch::channel(false);
        let handle = HealthMonitor::spawn(state.clone(), check.clone(), config(1, 1), rx);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(state.status(), HealthStatus::Healthy);

        check.0.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(state.status(), HealthStatus::Unhealthy);
        assert_eq!(state.snapshot().last_error.as_deref(), Some("broken"));

        stop.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn hung_check_counts_as_failure() {
        let state = Arc::new(HealthState::new(&config(1, 1)));
        let (stop, rx) = watch::channel(false);
        let handle = HealthMonitor::spawn(state.clone(), Arc::new(Hang), config(1, 1), rx);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(state.status(), HealthStatus::Unhealthy);
        assert!(state.snapshot().message.contains("timed out"));

        stop.send(true).unwrap();
        handle.await.unwrap();
    }
}
