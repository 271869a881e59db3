use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::infrastructure::shard_binding::ShardBinding;

static DB0_KEYS: Lazy<Regex> = Lazy::new(|| Regex::new(r"db0:keys=(\d+)").unwrap());
static KEYSPACE_HITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"keyspace_hits:(\d+)").unwrap());
static KEYSPACE_MISSES: Lazy<Regex> = Lazy::new(|| Regex::new(r"keyspace_misses:(\d+)").unwrap());
static REPL_OFFSET: Lazy<Regex> = Lazy::new(|| Regex::new(r"master_repl_offset:(\d+)").unwrap());
static CONNECTED_SLAVES: Lazy<Regex> = Lazy::new(|| Regex::new(r"connected_slaves:(\d+)").unwrap());

fn extract(pattern: &Regex, info: &str) -> Option<u64> {
    pattern
        .captures(info)
        .and_then(|captures| captures.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

pub(crate) fn parse_keyspace_keys(info: &str) -> u64 {
    extract(&DB0_KEYS, info).unwrap_or(0)
}

pub(crate) fn parse_keyspace_hits(info: &str) -> u64 {
    extract(&KEYSPACE_HITS, info).unwrap_or(0)
}

pub(crate) fn parse_keyspace_misses(info: &str) -> u64 {
    extract(&KEYSPACE_MISSES, info).unwrap_or(0)
}

pub(crate) fn parse_repl_offset(info: &str) -> u64 {
    extract(&REPL_OFFSET, info).unwrap_or(0)
}

pub(crate) fn parse_connected_slaves(info: &str) -> u64 {
    extract(&CONNECTED_SLAVES, info).unwrap_or(0)
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardStats {
    pub shard_id: usize,
    pub shard_name: String,
    pub keys: u64,
    pub keyspace_hits: u64,
    pub keyspace_misses: u64,
    pub hit_rate: f64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterStats {
    pub shards: Vec<ShardStats>,
    pub total_keys: u64,
    pub total_hits: u64,
    pub total_misses: u64,
    pub overall_hit_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardReplicationLag {
    pub shard_id: usize,
    pub shard_name: String,
    pub primary_offset: u64,
    pub replica_offset: u64,
    pub lag_bytes: u64,
    pub connected_replicas: u64,
    pub synced: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplicationLagReport {
    pub shards: Vec<ShardReplicationLag>,
    pub all_synced: bool,
}

fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

/// Read-only aggregation over the textual `INFO` output of every endpoint.
/// Non-critical: a shard that fails to answer contributes an error entry
/// instead of failing the aggregate.
pub struct StatsAggregator {
    bindings: Vec<Arc<ShardBinding>>,
    command_timeout: Duration,
}

impl StatsAggregator {
    pub fn new(bindings: Vec<Arc<ShardBinding>>, config: &Config) -> Self {
        Self {
            bindings,
            command_timeout: Duration::from_millis(config.timeouts.command_timeout_ms),
        }
    }

    pub async fn cluster_stats(&self) -> ClusterStats {
        let shards = join_all(self.bindings.iter().map(|b| self.shard_stats(b))).await;

        let total_keys = shards.iter().map(|s| s.keys).sum();
        let total_hits: u64 = shards.iter().map(|s| s.keyspace_hits).sum();
        let total_misses: u64 = shards.iter().map(|s| s.keyspace_misses).sum();

        ClusterStats {
            shards,
            total_keys,
            total_hits,
            total_misses,
            overall_hit_rate: hit_rate(total_hits, total_misses),
        }
    }

    async fn shard_stats(&self, binding: &Arc<ShardBinding>) -> ShardStats {
        let endpoint = binding.write_endpoint().await;

        let keyspace = endpoint.info("keyspace", self.command_timeout).await;
        let stats = endpoint.info("stats", self.command_timeout).await;

        match (keyspace, stats) {
            (Ok(keyspace), Ok(stats)) => {
                let hits = parse_keyspace_hits(&stats);
                let misses = parse_keyspace_misses(&stats);
                ShardStats {
                    shard_id: binding.id(),
                    shard_name: binding.name().to_string(),
                    keys: parse_keyspace_keys(&keyspace),
                    keyspace_hits: hits,
                    keyspace_misses: misses,
                    hit_rate: hit_rate(hits, misses),
                    error: None,
                }
            }
            (Err(e), _) | (_, Err(e)) => ShardStats {
                shard_id: binding.id(),
                shard_name: binding.name().to_string(),
                keys: 0,
                keyspace_hits: 0,
                keyspace_misses: 0,
                hit_rate: 0.0,
                error: Some(e.to_string()),
            },
        }
    }

    pub async fn replication_lag(&self) -> ReplicationLagReport {
        let shards = join_all(self.bindings.iter().map(|b| self.shard_lag(b))).await;
        let all_synced = shards.iter().all(|s| s.synced && s.error.is_none());
        ReplicationLagReport { shards, all_synced }
    }

    async fn shard_lag(&self, binding: &Arc<ShardBinding>) -> ShardReplicationLag {
        let primary = binding.write_endpoint().await;
        let replica = binding.replica_endpoint().await;

        let primary_info = primary.info("replication", self.command_timeout).await;
        let replica_info = replica.info("replication", self.command_timeout).await;

        match (primary_info, replica_info) {
            (Ok(primary_info), Ok(replica_info)) => {
                let primary_offset = parse_repl_offset(&primary_info);
                let replica_offset = parse_repl_offset(&replica_info);
                // A replica that briefly runs ahead of the snapshot still
                // reports zero lag, never an underflow.
                let lag_bytes = primary_offset.saturating_sub(replica_offset);
                ShardReplicationLag {
                    shard_id: binding.id(),
                    shard_name: binding.name().to_string(),
                    primary_offset,
                    replica_offset,
                    lag_bytes,
                    connected_replicas: parse_connected_slaves(&primary_info),
                    synced: lag_bytes == 0,
                    error: None,
                }
            }
            (Err(e), _) | (_, Err(e)) => ShardReplicationLag {
                shard_id: binding.id(),
                shard_name: binding.name().to_string(),
                primary_offset: 0,
                replica_offset: 0,
                lag_bytes: 0,
                connected_replicas: 0,
                synced: false,
                error: Some(e.to_string()),
            },
        }
    }
}
