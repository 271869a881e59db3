use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, warn};

use crate::config::HealthConfig;
use crate::infrastructure::failover::{FailoverDriver, FailoverOutcome};
use crate::infrastructure::shard_binding::{FailoverRecord, ShardBinding};

/// Most recent transition events retained for observability.
const TRANSITION_LOG_CAPACITY: usize = 100;

/// Liveness state of one shard as seen by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    /// Failing probes below the threshold. Distinguishes transient glitches
    /// from sustained outages.
    Degraded,
    Failed,
    FailedOver,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthRecord {
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
            last_check_at: None,
            last_success_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransitionKind {
    PrimaryFailed,
    PrimaryRecovered,
    FailoverBegin,
    FailoverSuccess,
    FailoverFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionEvent {
    pub timestamp: DateTime<Utc>,
    pub shard_id: usize,
    pub kind: TransitionKind,
    pub detail: String,
}

/// Bounded ring buffer of transition events, shared between the monitor and
/// the failover manager.
pub struct TransitionLog {
    events: RwLock<VecDeque<TransitionEvent>>,
}

impl TransitionLog {
    pub fn new() -> Self {
        Self {
            events: RwLock::new(VecDeque::with_capacity(TRANSITION_LOG_CAPACITY)),
        }
    }

    pub async fn record(&self, shard_id: usize, kind: TransitionKind, detail: String) {
        match kind {
            TransitionKind::PrimaryFailed | TransitionKind::FailoverFailed => {
                warn!("Shard {} transition {:?}: {}", shard_id, kind, detail);
            }
            _ => info!("Shard {} transition {:?}: {}", shard_id, kind, detail),
        }

        let mut events = self.events.write().await;
        if events.len() == TRANSITION_LOG_CAPACITY {
            events.pop_front();
        }
        events.push_back(TransitionEvent {
            timestamp: Utc::now(),
            shard_id,
            kind,
            detail,
        });
    }

    pub async fn recent(&self) -> Vec<TransitionEvent> {
        self.events.read().await.iter().cloned().collect()
    }
}

impl Default for TransitionLog {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardHealthSummary {
    pub shard_id: usize,
    pub shard_name: String,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub failover: FailoverRecord,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub shards: Vec<ShardHealthSummary>,
    pub recent_events: Vec<TransitionEvent>,
}

/// Clears the per-shard in-flight marker when a probe finishes or is
/// cancelled.
struct ProbeGuard<'a>(&'a AtomicBool);

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Periodic liveness prober. Each tick probes every shard concurrently;
/// per-shard probes never overlap, and threshold breaches hand the shard to
/// the failover driver.
pub struct HealthMonitor {
    bindings: Vec<Arc<ShardBinding>>,
    records: Vec<RwLock<HealthRecord>>,
    probing: Vec<AtomicBool>,
    driver: Arc<dyn FailoverDriver>,
    transitions: Arc<TransitionLog>,
    config: HealthConfig,
    shutdown: watch::Sender<bool>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    probes: Mutex<JoinSet<()>>,
}

impl HealthMonitor {
    pub fn new(
        bindings: Vec<Arc<ShardBinding>>,
        driver: Arc<dyn FailoverDriver>,
        transitions: Arc<TransitionLog>,
        config: HealthConfig,
    ) -> Self {
        let records = bindings.iter().map(|_| RwLock::new(HealthRecord::default())).collect();
        let probing = bindings.iter().map(|_| AtomicBool::new(false)).collect();
        let (shutdown, _) = watch::channel(false);
        Self {
            bindings,
            records,
            probing,
            driver,
            transitions,
            config,
            shutdown,
            loop_handle: Mutex::new(None),
            probes: Mutex::new(JoinSet::new()),
        }
    }

    /// Starts the background probe loop. A second call is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut handle = self.loop_handle.lock().await;
        if handle.is_some() {
            return;
        }

        let monitor = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        let interval_ms = self.config.check_interval_ms;
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => monitor.run_probe_round().await,
                    _ = shutdown_rx.changed() => break,
                }
            }
        }));
        info!(
            "Health monitor started: {} shards, {}ms interval",
            self.bindings.len(),
            interval_ms
        );
    }

    async fn run_probe_round(self: &Arc<Self>) {
        let mut probes = self.probes.lock().await;
        while probes.try_join_next().is_some() {}
        for shard_id in 0..self.bindings.len() {
            let monitor = Arc::clone(self);
            probes.spawn(async move {
                monitor.probe_shard(shard_id).await;
            });
        }
    }

    /// Stops the loop and cancels outstanding probes. Idempotent.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.loop_handle.lock().await.take() {
            let _ = handle.await;
        }
        self.probes.lock().await.shutdown().await;
        info!("Health monitor stopped");
    }

    /// One probe of one shard. Skipped when the previous probe for the same
    /// shard is still in flight.
    pub async fn probe_shard(&self, shard_id: usize) {
        let Some(binding) = self.bindings.get(shard_id) else {
            return;
        };
        if self.probing[shard_id].swap(true, Ordering::Acquire) {
            return;
        }
        let _in_flight = ProbeGuard(&self.probing[shard_id]);

        let deadline = Duration::from_millis(self.config.probe_timeout_ms);
        let status = self.records[shard_id].read().await.status;

        match status {
            HealthStatus::Healthy | HealthStatus::Degraded => {
                let endpoint = binding.write_endpoint().await;
                match endpoint.ping(deadline).await {
                    Ok(()) => self.note_probe_success(shard_id, status).await,
                    Err(e) => self.note_probe_failure(shard_id, e.to_string()).await,
                }
            }
            HealthStatus::Failed => {
                // Promotion has not succeeded yet, so the write endpoint is
                // still the original primary. Reachable again means it
                // recovered on its own; still down means another promotion
                // attempt.
                let endpoint = binding.write_endpoint().await;
                match endpoint.ping(deadline).await {
                    Ok(()) => self.note_primary_recovery(shard_id).await,
                    Err(_) => {
                        let outcome = self.driver.failover_to_replica(shard_id).await;
                        self.apply_failover_outcome(shard_id, &outcome).await;
                    }
                }
            }
            HealthStatus::FailedOver => {
                // The write endpoint is the promoted replica and healthy by
                // construction; recovery detection probes the original
                // primary by its startup identity.
                let original = binding.original_primary().await;
                if original.ping(deadline).await.is_ok() {
                    self.note_primary_recovery(shard_id).await;
                } else {
                    self.records[shard_id].write().await.last_check_at = Some(Utc::now());
                }
            }
        }
    }

    async fn note_probe_success(&self, shard_id: usize, previous: HealthStatus) {
        let mut record = self.records[shard_id].write().await;
        record.status = HealthStatus::Healthy;
        record.consecutive_failures = 0;
        let now = Utc::now();
        record.last_check_at = Some(now);
        record.last_success_at = Some(now);
        drop(record);

        if previous == HealthStatus::Degraded {
            info!("Shard {} recovered before reaching the failure threshold", shard_id);
        }
    }

    async fn note_probe_failure(&self, shard_id: usize, detail: String) {
        let mut record = self.records[shard_id].write().await;
        record.consecutive_failures += 1;
        record.last_check_at = Some(Utc::now());
        let failures = record.consecutive_failures;

        if failures < self.config.failure_threshold {
            record.status = HealthStatus::Degraded;
            drop(record);
            warn!(
                "Probe for shard {} failed ({}/{}): {}",
                shard_id, failures, self.config.failure_threshold, detail
            );
            return;
        }

        record.status = HealthStatus::Failed;
        drop(record);

        self.transitions
            .record(
                shard_id,
                TransitionKind::PrimaryFailed,
                format!("{} consecutive probe failures: {}", failures, detail),
            )
            .await;

        let outcome = self.driver.failover_to_replica(shard_id).await;
        self.apply_failover_outcome(shard_id, &outcome).await;
    }

    /// Folds a promotion attempt back into the health record. Also used by
    /// the manual trigger path so both stay in lockstep.
    pub async fn apply_failover_outcome(&self, shard_id: usize, outcome: &FailoverOutcome) {
        let Some(record) = self.records.get(shard_id) else {
            return;
        };
        let mut record = record.write().await;
        if outcome.ok {
            record.status = HealthStatus::FailedOver;
            record.consecutive_failures = 0;
        } else {
            record.status = HealthStatus::Failed;
        }
    }

    async fn note_primary_recovery(&self, shard_id: usize) {
        match self.driver.handle_primary_recovery(shard_id).await {
            Ok(()) => {
                let mut record = self.records[shard_id].write().await;
                record.status = HealthStatus::Healthy;
                record.consecutive_failures = 0;
                let now = Utc::now();
                record.last_check_at = Some(now);
                record.last_success_at = Some(now);
            }
            Err(e) => {
                // Leave the state unchanged; the next probe retries.
                warn!("Primary recovery handling for shard {} failed: {}", shard_id, e);
                self.records[shard_id].write().await.last_check_at = Some(Utc::now());
            }
        }
    }

    pub async fn shard_status(&self, shard_id: usize) -> Option<HealthStatus> {
        match self.records.get(shard_id) {
            Some(record) => Some(record.read().await.status),
            None => None,
        }
    }

    pub async fn summary(&self) -> HealthSummary {
        let mut shards = Vec::with_capacity(self.bindings.len());
        for (i, binding) in self.bindings.iter().enumerate() {
            let record = self.records[i].read().await.clone();
            shards.push(ShardHealthSummary {
                shard_id: binding.id(),
                shard_name: binding.name().to_string(),
                status: record.status,
                consecutive_failures: record.consecutive_failures,
                last_check_at: record.last_check_at,
                last_success_at: record.last_success_at,
                failover: binding.failover_record().await,
            });
        }
        HealthSummary {
            shards,
            recent_events: self.transitions.recent().await,
        }
    }
}
