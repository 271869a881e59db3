use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::infrastructure::health_monitor::{TransitionKind, TransitionLog};
use crate::infrastructure::shard_binding::{FailoverStatus, ShardBinding};

/// Result of one promotion attempt. `ok: false` leaves the shard FAILED;
/// the monitor retries on its next probe.
#[derive(Debug, Clone, Serialize)]
pub struct FailoverOutcome {
    pub ok: bool,
    pub shard_id: usize,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

impl FailoverOutcome {
    fn failed(shard_id: usize, error: String) -> Self {
        Self {
            ok: false,
            shard_id,
            duration_ms: None,
            error: Some(error),
        }
    }
}

/// Monotonic failover counters plus the derived average, computed at read
/// time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FailoverMetrics {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub cumulative_duration_ms: u64,
    pub average_duration_ms: f64,
}

#[derive(Debug, Default)]
struct FailoverCounters {
    total: u64,
    successful: u64,
    failed: u64,
    cumulative_duration_ms: u64,
}

/// Seam between the health monitor and the failover machinery. The monitor
/// only ever talks to this trait, which keeps its state machine testable
/// with a scripted driver.
#[async_trait]
pub trait FailoverDriver: Send + Sync {
    async fn failover_to_replica(&self, shard_id: usize) -> FailoverOutcome;
    async fn handle_primary_recovery(&self, shard_id: usize) -> CoordinatorResult<()>;
}

/// Executes role swaps on primary failure and re-integrates recovered
/// primaries as replicas of the promoted endpoint. Never swaps back.
pub struct FailoverManager {
    bindings: Vec<Arc<ShardBinding>>,
    /// Per-shard mutual exclusion for promotions and recoveries.
    locks: Vec<Mutex<()>>,
    counters: RwLock<FailoverCounters>,
    transitions: Arc<TransitionLog>,
    probe_timeout: Duration,
    command_timeout: Duration,
}

/// Lowers the failover gate when the promotion attempt leaves scope, on any
/// exit path.
struct GateGuard<'a>(&'a ShardBinding);

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.0.lower_gate();
    }
}

impl FailoverManager {
    pub fn new(
        bindings: Vec<Arc<ShardBinding>>,
        transitions: Arc<TransitionLog>,
        config: &Config,
    ) -> Self {
        let locks = bindings.iter().map(|_| Mutex::new(())).collect();
        Self {
            bindings,
            locks,
            counters: RwLock::new(FailoverCounters::default()),
            transitions,
            probe_timeout: Duration::from_millis(config.health.probe_timeout_ms),
            command_timeout: Duration::from_millis(config.timeouts.command_timeout_ms),
        }
    }

    pub async fn metrics(&self) -> FailoverMetrics {
        let counters = self.counters.read().await;
        let average_duration_ms = if counters.successful > 0 {
            counters.cumulative_duration_ms as f64 / counters.successful as f64
        } else {
            0.0
        };
        FailoverMetrics {
            total: counters.total,
            successful: counters.successful,
            failed: counters.failed,
            cumulative_duration_ms: counters.cumulative_duration_ms,
            average_duration_ms,
        }
    }

    async fn abort_failover(&self, binding: &ShardBinding, error: String) -> FailoverOutcome {
        warn!("Failover for shard {} aborted: {}", binding.id(), error);
        binding
            .with_failover_record(|record| {
                record.status = FailoverStatus::FailoverFailed;
            })
            .await;

        {
            let mut counters = self.counters.write().await;
            counters.total += 1;
            counters.failed += 1;
        }
        self.transitions
            .record(binding.id(), TransitionKind::FailoverFailed, error.clone())
            .await;

        FailoverOutcome::failed(binding.id(), error)
    }
}

#[async_trait]
impl FailoverDriver for FailoverManager {
    /// Promotes the shard's replica to primary. Idempotent: a shard already
    /// FAILING_OVER or FAILED_OVER returns immediately without a second
    /// promotion sequence.
    async fn failover_to_replica(&self, shard_id: usize) -> FailoverOutcome {
        let Some(binding) = self.bindings.get(shard_id) else {
            return FailoverOutcome::failed(shard_id, format!("Unknown shard {}", shard_id));
        };
        let binding = binding.as_ref();
        let _exclusive = self.locks[shard_id].lock().await;

        let short_circuit = binding
            .with_failover_record(|record| match record.status {
                FailoverStatus::FailingOver => Some(FailoverOutcome::failed(
                    shard_id,
                    "Failover already in progress".to_string(),
                )),
                FailoverStatus::FailedOver => Some(FailoverOutcome {
                    ok: true,
                    shard_id,
                    duration_ms: record.last_duration_ms,
                    error: None,
                }),
                _ => {
                    record.status = FailoverStatus::FailingOver;
                    record.since = Some(Utc::now());
                    None
                }
            })
            .await;
        if let Some(outcome) = short_circuit {
            return outcome;
        }

        binding.raise_gate();
        let _gate = GateGuard(binding);
        let started = Instant::now();

        let replica = binding.replica_endpoint().await;
        self.transitions
            .record(
                shard_id,
                TransitionKind::FailoverBegin,
                format!("Promoting replica {}", replica.addr()),
            )
            .await;

        // The replica must answer before it is made writable.
        if let Err(e) = replica.ping(self.probe_timeout).await {
            return self
                .abort_failover(binding, format!("Replica {} unreachable: {}", replica.addr(), e))
                .await;
        }

        if let Err(e) = replica
            .config_set("replica-read-only", "no", self.command_timeout)
            .await
        {
            return self
                .abort_failover(binding, format!("Could not make replica writable: {}", e))
                .await;
        }
        if let Err(e) = replica.replicaof_no_one(self.command_timeout).await {
            return self
                .abort_failover(binding, format!("Could not detach replica: {}", e))
                .await;
        }

        binding.swap_roles().await;

        let duration_ms = started.elapsed().as_millis() as u64;
        binding
            .with_failover_record(|record| {
                record.status = FailoverStatus::FailedOver;
                record.promoted = true;
                record.last_duration_ms = Some(duration_ms);
            })
            .await;

        {
            let mut counters = self.counters.write().await;
            counters.total += 1;
            counters.successful += 1;
            counters.cumulative_duration_ms += duration_ms;
        }
        self.transitions
            .record(
                shard_id,
                TransitionKind::FailoverSuccess,
                format!("{} promoted in {}ms", replica.addr(), duration_ms),
            )
            .await;
        info!(
            "Failover for shard {} complete: {} now serves writes ({}ms)",
            shard_id,
            replica.addr(),
            duration_ms
        );

        FailoverOutcome {
            ok: true,
            shard_id,
            duration_ms: Some(duration_ms),
            error: None,
        }
    }

    /// Re-integrates a recovered original primary. After a completed
    /// failover it sits in the replica slot; it is reattached as a replica
    /// of the promoted endpoint. Roles are never swapped back: immediate
    /// failback would mean a second role change against possibly-stale data.
    async fn handle_primary_recovery(&self, shard_id: usize) -> CoordinatorResult<()> {
        let binding = self
            .bindings
            .get(shard_id)
            .ok_or_else(|| CoordinatorError::Command(format!("Unknown shard {}", shard_id)))?;
        let _exclusive = self.locks[shard_id].lock().await;

        let record = binding.failover_record().await;
        match record.status {
            FailoverStatus::Recovered => Ok(()),
            FailoverStatus::FailedOver => {
                let promoted = binding.write_endpoint().await;
                let recovered = binding.replica_endpoint().await;

                recovered
                    .replicaof(promoted.addr(), self.command_timeout)
                    .await?;
                recovered
                    .config_set("replica-read-only", "yes", self.command_timeout)
                    .await?;

                binding
                    .with_failover_record(|r| {
                        r.status = FailoverStatus::Recovered;
                    })
                    .await;
                self.transitions
                    .record(
                        shard_id,
                        TransitionKind::PrimaryRecovered,
                        format!(
                            "{} reattached as replica of {}",
                            recovered.addr(),
                            promoted.addr()
                        ),
                    )
                    .await;
                info!(
                    "Shard {}: recovered primary {} reattached as replica of {}",
                    shard_id,
                    recovered.addr(),
                    promoted.addr()
                );
                Ok(())
            }
            // No completed promotion: the primary came back on its own and
            // still holds the primary slot. Nothing to reconfigure.
            _ => {
                self.transitions
                    .record(
                        shard_id,
                        TransitionKind::PrimaryRecovered,
                        "Primary reachable again without promotion".to_string(),
                    )
                    .await;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ClusterConfig, HealthConfig, ReplicationConfig, ReplicationMode, TimeoutConfig,
    };
    use crate::infrastructure::endpoint::EndpointAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Stand-in shard: acknowledges every command with a RESP status reply,
    /// which satisfies PING, CONFIG SET, and REPLICAOF alike.
    async fn ok_server() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 512];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(_) => {
                                if socket.write_all(b"+OK\r\n").await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        port
    }

    fn test_config() -> Config {
        Config {
            cluster: ClusterConfig {
                primaries: vec![EndpointAddr::new("127.0.0.1".to_string(), 1)],
                replicas: vec![EndpointAddr::new("127.0.0.1".to_string(), 2)],
                virtual_nodes: 8,
            },
            replication: ReplicationConfig {
                default_mode: ReplicationMode::Async,
                wait_timeout_ms: 100,
            },
            health: HealthConfig {
                check_interval_ms: 50,
                probe_timeout_ms: 200,
                failure_threshold: 3,
            },
            timeouts: TimeoutConfig {
                command_timeout_ms: 200,
                shutdown_drain_ms: 500,
            },
        }
    }

    fn unreachable_binding(id: usize) -> Arc<ShardBinding> {
        // Loopback port 1 refuses connections immediately.
        Arc::new(
            ShardBinding::new(
                id,
                EndpointAddr::new("127.0.0.1".to_string(), 1),
                EndpointAddr::new("127.0.0.1".to_string(), 2),
            )
            .unwrap(),
        )
    }

    fn manager(bindings: Vec<Arc<ShardBinding>>) -> FailoverManager {
        FailoverManager::new(bindings, Arc::new(TransitionLog::new()), &test_config())
    }

    #[tokio::test]
    async fn unreachable_replica_aborts_and_lowers_gate() {
        let binding = unreachable_binding(0);
        let manager = manager(vec![binding.clone()]);

        let outcome = manager.failover_to_replica(0).await;
        assert!(!outcome.ok);
        assert!(outcome.error.is_some());

        let record = binding.failover_record().await;
        assert_eq!(record.status, FailoverStatus::FailoverFailed);
        assert!(!record.promoted);
        assert!(!binding.gate_raised(), "gate must not stay raised after abort");

        // Roles did not move.
        assert_eq!(binding.write_endpoint().await.addr().port, 1);

        let metrics = manager.metrics().await;
        assert_eq!(metrics.total, 1);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.successful, 0);
        assert_eq!(metrics.average_duration_ms, 0.0);
    }

    #[tokio::test]
    async fn in_progress_failover_short_circuits() {
        let binding = unreachable_binding(0);
        binding
            .with_failover_record(|r| r.status = FailoverStatus::FailingOver)
            .await;
        let manager = manager(vec![binding.clone()]);

        let outcome = manager.failover_to_replica(0).await;
        assert!(!outcome.ok);
        assert_eq!(outcome.error.as_deref(), Some("Failover already in progress"));

        // The guard path must not touch the record or the metrics.
        assert_eq!(
            binding.failover_record().await.status,
            FailoverStatus::FailingOver
        );
        assert_eq!(manager.metrics().await.total, 0);
    }

    #[tokio::test]
    async fn completed_failover_short_circuits_with_prior_duration() {
        let binding = unreachable_binding(0);
        binding
            .with_failover_record(|r| {
                r.status = FailoverStatus::FailedOver;
                r.promoted = true;
                r.last_duration_ms = Some(42);
            })
            .await;
        let manager = manager(vec![binding]);

        let outcome = manager.failover_to_replica(0).await;
        assert!(outcome.ok);
        assert_eq!(outcome.duration_ms, Some(42));
    }

    #[tokio::test]
    async fn recovery_without_promotion_is_a_no_op() {
        let binding = unreachable_binding(0);
        let transitions = Arc::new(TransitionLog::new());
        let manager =
            FailoverManager::new(vec![binding.clone()], transitions.clone(), &test_config());

        manager.handle_primary_recovery(0).await.unwrap();

        assert_eq!(
            binding.failover_record().await.status,
            FailoverStatus::NeverFailed
        );
        let events = transitions.recent().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, TransitionKind::PrimaryRecovered);
    }

    #[tokio::test]
    async fn recovery_reconfigure_failure_keeps_failed_over_status() {
        let binding = unreachable_binding(0);
        binding
            .with_failover_record(|r| {
                r.status = FailoverStatus::FailedOver;
                r.promoted = true;
            })
            .await;
        let manager = manager(vec![binding.clone()]);

        // REPLICAOF against an unreachable endpoint fails; the record must
        // stay FAILED_OVER so the monitor retries on its next probe.
        assert!(manager.handle_primary_recovery(0).await.is_err());
        assert_eq!(
            binding.failover_record().await.status,
            FailoverStatus::FailedOver
        );
    }

    #[tokio::test]
    async fn unknown_shard_is_rejected() {
        let manager = manager(vec![unreachable_binding(0)]);
        assert!(!manager.failover_to_replica(7).await.ok);
        assert!(manager.handle_primary_recovery(7).await.is_err());
    }

    #[tokio::test]
    async fn successful_promotion_swaps_roles_and_records_metrics() {
        let replica_port = ok_server().await;
        let binding = Arc::new(
            ShardBinding::new(
                0,
                EndpointAddr::new("127.0.0.1".to_string(), 1),
                EndpointAddr::new("127.0.0.1".to_string(), replica_port),
            )
            .unwrap(),
        );
        let manager = manager(vec![binding.clone()]);

        let outcome = manager.failover_to_replica(0).await;
        assert!(outcome.ok, "promotion failed: {:?}", outcome.error);
        assert!(outcome.duration_ms.is_some());

        // The promoted replica now serves writes; the dead primary moved to
        // the replica slot, and the pair stays distinct throughout.
        let write = binding.write_endpoint().await;
        let replica = binding.replica_endpoint().await;
        assert_eq!(write.addr().port, replica_port);
        assert_eq!(replica.addr().port, 1);
        assert!(!Arc::ptr_eq(&write, &replica));
        assert!(!write.is_original_primary());
        assert_eq!(binding.original_primary().await.addr().port, 1);

        let record = binding.failover_record().await;
        assert_eq!(record.status, FailoverStatus::FailedOver);
        assert!(record.promoted);
        assert!(!binding.gate_raised());

        let metrics = manager.metrics().await;
        assert_eq!(metrics.total, 1);
        assert_eq!(metrics.successful, 1);
        assert_eq!(metrics.failed, 0);
    }

    #[tokio::test]
    async fn concurrent_triggers_promote_exactly_once() {
        let replica_port = ok_server().await;
        let binding = Arc::new(
            ShardBinding::new(
                0,
                EndpointAddr::new("127.0.0.1".to_string(), 1),
                EndpointAddr::new("127.0.0.1".to_string(), replica_port),
            )
            .unwrap(),
        );
        let manager = Arc::new(manager(vec![binding.clone()]));

        let a = tokio::spawn({
            let manager = manager.clone();
            async move { manager.failover_to_replica(0).await }
        });
        let b = tokio::spawn({
            let manager = manager.clone();
            async move { manager.failover_to_replica(0).await }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(a.ok && b.ok);

        // One promotion sequence ran; the other call short-circuited.
        let metrics = manager.metrics().await;
        assert_eq!(metrics.total, 1);
        assert_eq!(metrics.successful, 1);
        assert_eq!(binding.write_endpoint().await.addr().port, replica_port);
    }

    #[tokio::test]
    async fn recovery_reattaches_without_failback() {
        let promoted_port = ok_server().await;
        let recovered_port = ok_server().await;
        let binding = Arc::new(
            ShardBinding::new(
                0,
                EndpointAddr::new("127.0.0.1".to_string(), recovered_port),
                EndpointAddr::new("127.0.0.1".to_string(), promoted_port),
            )
            .unwrap(),
        );
        // A completed failover put the original primary in the replica slot.
        binding.swap_roles().await;
        binding
            .with_failover_record(|r| {
                r.status = FailoverStatus::FailedOver;
                r.promoted = true;
            })
            .await;
        let manager = manager(vec![binding.clone()]);

        manager.handle_primary_recovery(0).await.unwrap();

        let record = binding.failover_record().await;
        assert_eq!(record.status, FailoverStatus::Recovered);
        assert!(record.promoted);

        // No failback: the promoted endpoint keeps serving writes and the
        // recovered original primary stays in the replica slot.
        assert_eq!(binding.write_endpoint().await.addr().port, promoted_port);
        assert_eq!(binding.replica_endpoint().await.addr().port, recovered_port);

        // A second detection pass is a no-op.
        manager.handle_primary_recovery(0).await.unwrap();
        assert_eq!(
            binding.failover_record().await.status,
            FailoverStatus::Recovered
        );
    }
}
