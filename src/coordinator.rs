use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

use crate::config::{Config, ReplicationMode};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::infrastructure::endpoint::Endpoint;
use crate::infrastructure::failover::{FailoverDriver, FailoverManager, FailoverMetrics, FailoverOutcome};
use crate::infrastructure::hash_ring::{ring_hash, HashRing, RingDescription};
use crate::infrastructure::health_monitor::{HealthMonitor, HealthSummary, TransitionLog};
use crate::infrastructure::shard_binding::ShardBinding;
use crate::infrastructure::stats::{ClusterStats, ReplicationLagReport, StatsAggregator};

/// Suggested client back-off for writes rejected mid-promotion.
const FAILOVER_RETRY_AFTER_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteTarget {
    Primary,
    PromotedReplica,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadSource {
    Primary,
    Replica,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Confirmed,
    Timeout,
}

/// Synchronous-replication acknowledgement attached to sync-mode writes.
/// `Timeout` is informational; the write itself succeeded.
#[derive(Debug, Clone, Serialize)]
pub struct ReplicationAck {
    pub mode: ReplicationMode,
    pub replicas: i64,
    pub status: AckStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetResponse {
    pub ok: bool,
    pub shard_id: usize,
    pub shard_name: String,
    pub hash: u32,
    pub target: WriteTarget,
    pub replication: Option<ReplicationAck>,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GetResponse {
    pub ok: bool,
    pub shard_id: usize,
    pub shard_name: String,
    pub value: Option<Value>,
    pub source: Option<ReadSource>,
    pub failover: bool,
    pub warning: Option<String>,
    pub reason: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteResponse {
    pub ok: bool,
    pub shard_id: usize,
    pub shard_name: String,
}

/// Strings travel verbatim; everything else as its JSON encoding.
fn encode_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Stored payloads parse as JSON when possible, raw strings otherwise.
fn decode_value(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

fn target_of(endpoint: &Endpoint) -> WriteTarget {
    if endpoint.is_original_primary() {
        WriteTarget::Primary
    } else {
        WriteTarget::PromotedReplica
    }
}

/// Counts an in-flight cache operation for the shutdown drain window.
struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Stateless routing core between the API front-ends and the shard fleet.
/// Owns the ring, the health monitor, and the failover manager; rebuilt from
/// configuration on every start.
pub struct CacheCoordinator {
    config: Config,
    ring: Arc<HashRing>,
    monitor: Arc<HealthMonitor>,
    failover: Arc<FailoverManager>,
    stats: StatsAggregator,
    in_flight: Arc<AtomicUsize>,
    command_timeout: Duration,
}

impl CacheCoordinator {
    pub fn new(config: Config) -> CoordinatorResult<Self> {
        config.validate()?;

        let bindings = config
            .cluster
            .primaries
            .iter()
            .zip(config.cluster.replicas.iter())
            .enumerate()
            .map(|(id, (primary, replica))| {
                Ok(Arc::new(ShardBinding::new(
                    id,
                    primary.clone(),
                    replica.clone(),
                )?))
            })
            .collect::<CoordinatorResult<Vec<_>>>()?;

        let transitions = Arc::new(TransitionLog::new());
        let ring = Arc::new(HashRing::new(
            bindings.clone(),
            config.cluster.virtual_nodes,
        ));
        let failover = Arc::new(FailoverManager::new(
            bindings.clone(),
            Arc::clone(&transitions),
            &config,
        ));
        let monitor = Arc::new(HealthMonitor::new(
            bindings.clone(),
            Arc::clone(&failover) as Arc<dyn FailoverDriver>,
            transitions,
            config.health.clone(),
        ));
        let stats = StatsAggregator::new(bindings, &config);
        let command_timeout = Duration::from_millis(config.timeouts.command_timeout_ms);

        info!(
            "Cache coordinator initialized with {} shards, {} virtual nodes each",
            config.shard_count(),
            config.cluster.virtual_nodes
        );

        Ok(Self {
            config,
            ring,
            monitor,
            failover,
            stats,
            in_flight: Arc::new(AtomicUsize::new(0)),
            command_timeout,
        })
    }

    /// Starts the background health monitor.
    pub async fn start(&self) {
        self.monitor.start().await;
    }

    /// Stops the monitor, drains in-flight operations within the configured
    /// window, then closes every endpoint connection.
    pub async fn shutdown(&self) {
        info!("Coordinator shutting down");
        self.monitor.stop().await;

        let deadline = Instant::now() + Duration::from_millis(self.config.timeouts.shutdown_drain_ms);
        while self.in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let remaining = self.in_flight.load(Ordering::SeqCst);
        if remaining > 0 {
            warn!("Drain window elapsed with {} requests still in flight", remaining);
        }

        for binding in self.ring.bindings() {
            binding.disconnect().await;
        }
        info!("Coordinator shutdown complete");
    }

    #[instrument(skip(self, value))]
    pub async fn set(
        &self,
        key: &str,
        value: &Value,
        ttl_seconds: Option<u64>,
        mode: Option<ReplicationMode>,
    ) -> CoordinatorResult<SetResponse> {
        let _op = InFlightGuard::enter(&self.in_flight);
        let binding = self.ring.lookup_shard(key)?;

        if binding.gate_raised() {
            return Err(CoordinatorError::NodeInFailover {
                shard_id: binding.id(),
                retry_after_ms: FAILOVER_RETRY_AFTER_MS,
            });
        }

        let mode = mode.unwrap_or(self.config.replication.default_mode);
        let payload = encode_value(value);
        let started = Instant::now();

        let endpoint = binding.write_endpoint().await;
        match ttl_seconds {
            Some(ttl) => {
                endpoint
                    .setex(key, ttl, &payload, self.command_timeout)
                    .await?
            }
            None => endpoint.set(key, &payload, self.command_timeout).await?,
        }

        let replication = if mode == ReplicationMode::Sync {
            let wait_timeout_ms = self.config.replication.wait_timeout_ms;
            let deadline = Duration::from_millis(wait_timeout_ms) + self.command_timeout;
            let replicas = endpoint.wait(1, wait_timeout_ms, deadline).await?;
            Some(ReplicationAck {
                mode,
                replicas,
                status: if replicas >= 1 {
                    AckStatus::Confirmed
                } else {
                    AckStatus::Timeout
                },
            })
        } else {
            None
        };

        Ok(SetResponse {
            ok: true,
            shard_id: binding.id(),
            shard_name: binding.name().to_string(),
            hash: ring_hash(key),
            target: target_of(&endpoint),
            replication,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    #[instrument(skip(self))]
    pub async fn get(&self, key: &str) -> CoordinatorResult<GetResponse> {
        let _op = InFlightGuard::enter(&self.in_flight);
        let binding = self.ring.lookup_shard(key)?;

        let primary = binding.read_endpoint().await;
        let primary_err = match primary.get(key, self.command_timeout).await {
            Ok(Some(raw)) => {
                return Ok(GetResponse {
                    ok: true,
                    shard_id: binding.id(),
                    shard_name: binding.name().to_string(),
                    value: Some(decode_value(raw)),
                    source: Some(ReadSource::Primary),
                    failover: false,
                    warning: None,
                    reason: None,
                })
            }
            Ok(None) => {
                return Ok(GetResponse {
                    ok: false,
                    shard_id: binding.id(),
                    shard_name: binding.name().to_string(),
                    value: None,
                    source: Some(ReadSource::Primary),
                    failover: false,
                    warning: None,
                    reason: Some("KEY_NOT_FOUND"),
                })
            }
            Err(e) => e,
        };

        warn!(
            "Primary read for shard {} failed ({}), falling back to replica",
            binding.id(),
            primary_err
        );
        let fallback = binding.replica_endpoint().await;
        match fallback.get(key, self.command_timeout).await {
            Ok(Some(raw)) => Ok(GetResponse {
                ok: true,
                shard_id: binding.id(),
                shard_name: binding.name().to_string(),
                value: Some(decode_value(raw)),
                source: Some(ReadSource::Replica),
                failover: true,
                warning: Some("Primary unavailable, reading from replica".to_string()),
                reason: None,
            }),
            Ok(None) => Ok(GetResponse {
                ok: false,
                shard_id: binding.id(),
                shard_name: binding.name().to_string(),
                value: None,
                source: Some(ReadSource::Replica),
                failover: true,
                warning: Some("Primary unavailable, reading from replica".to_string()),
                reason: Some("KEY_NOT_FOUND"),
            }),
            Err(replica_err) => Err(CoordinatorError::NodeUnavailable {
                shard_id: binding.id(),
                detail: format!("primary: {}; replica: {}", primary_err, replica_err),
            }),
        }
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, key: &str) -> CoordinatorResult<DeleteResponse> {
        let _op = InFlightGuard::enter(&self.in_flight);
        let binding = self.ring.lookup_shard(key)?;

        if binding.gate_raised() {
            return Err(CoordinatorError::NodeInFailover {
                shard_id: binding.id(),
                retry_after_ms: FAILOVER_RETRY_AFTER_MS,
            });
        }

        let endpoint = binding.write_endpoint().await;
        let removed = endpoint.del(key, self.command_timeout).await?;

        Ok(DeleteResponse {
            ok: removed == 1,
            shard_id: binding.id(),
            shard_name: binding.name().to_string(),
        })
    }

    pub fn shard_for_key(&self, key: &str) -> CoordinatorResult<usize> {
        self.ring.shard_for_key(key)
    }

    pub fn describe_ring(&self) -> RingDescription {
        self.ring.describe()
    }

    pub async fn get_all_stats(&self) -> ClusterStats {
        self.stats.cluster_stats().await
    }

    pub async fn get_replication_lag(&self) -> ReplicationLagReport {
        self.stats.replication_lag().await
    }

    pub async fn get_health_summary(&self) -> HealthSummary {
        self.monitor.summary().await
    }

    pub async fn get_failover_metrics(&self) -> FailoverMetrics {
        self.failover.metrics().await
    }

    /// Manually runs the promotion sequence for one shard, with the same
    /// health bookkeeping as the monitor path. Intended for testing.
    pub async fn trigger_failover(&self, shard_id: usize) -> FailoverOutcome {
        let outcome = self.failover.failover_to_replica(shard_id).await;
        self.monitor.apply_failover_outcome(shard_id, &outcome).await;
        outcome
    }
}

impl std::fmt::Debug for CacheCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCoordinator")
            .field("shards", &self.config.shard_count())
            .field("virtual_nodes", &self.config.cluster.virtual_nodes)
            .finish()
    }
}
