use serde::{Deserialize, Serialize};
use std::env;

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::infrastructure::endpoint::EndpointAddr;

/// Replication mode applied to writes when the caller does not override it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationMode {
    Async,
    Sync,
}

impl ReplicationMode {
    pub fn parse(value: &str) -> CoordinatorResult<Self> {
        match value.to_ascii_lowercase().as_str() {
            "async" => Ok(ReplicationMode::Async),
            "sync" => Ok(ReplicationMode::Sync),
            other => Err(CoordinatorError::Config(format!(
                "Unknown replication mode '{}', expected 'async' or 'sync'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub cluster: ClusterConfig,
    pub replication: ReplicationConfig,
    pub health: HealthConfig,
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Primary endpoints, one per shard. Order defines shard ordinals.
    pub primaries: Vec<EndpointAddr>,
    /// Replica endpoints, paired with primaries by index.
    pub replicas: Vec<EndpointAddr>,
    /// Virtual nodes per shard.
    pub virtual_nodes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    pub default_mode: ReplicationMode,
    /// Deadline handed to `WAIT` in sync mode.
    pub wait_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub check_interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// Consecutive failed probes before a shard is declared FAILED.
    pub failure_threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Per-command deadline for data-path shard calls.
    pub command_timeout_ms: u64,
    /// How long graceful shutdown waits for in-flight requests.
    pub shutdown_drain_ms: u64,
}

impl Config {
    pub fn from_env() -> CoordinatorResult<Self> {
        let primaries = parse_endpoint_list(&required_var("CACHE_PRIMARY_ENDPOINTS")?)?;
        let replicas = parse_endpoint_list(&required_var("CACHE_REPLICA_ENDPOINTS")?)?;

        let config = Self {
            cluster: ClusterConfig {
                primaries,
                replicas,
                virtual_nodes: parsed_var("CACHE_VIRTUAL_NODES", 150)?,
            },
            replication: ReplicationConfig {
                default_mode: match env::var("CACHE_REPLICATION_MODE") {
                    Ok(raw) => ReplicationMode::parse(&raw)?,
                    Err(_) => ReplicationMode::Async,
                },
                wait_timeout_ms: parsed_var("CACHE_WAIT_TIMEOUT_MS", 1_000)?,
            },
            health: HealthConfig {
                check_interval_ms: parsed_var("CACHE_HEALTH_CHECK_INTERVAL_MS", 5_000)?,
                probe_timeout_ms: parsed_var("CACHE_PROBE_TIMEOUT_MS", 3_000)?,
                failure_threshold: parsed_var("CACHE_FAILURE_THRESHOLD", 3)?,
            },
            timeouts: TimeoutConfig {
                command_timeout_ms: parsed_var("CACHE_COMMAND_TIMEOUT_MS", 5_000)?,
                shutdown_drain_ms: parsed_var("CACHE_SHUTDOWN_DRAIN_MS", 10_000)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CoordinatorResult<()> {
        if self.cluster.primaries.is_empty() {
            return Err(CoordinatorError::Config(
                "At least one primary endpoint is required".to_string(),
            ));
        }
        if self.cluster.primaries.len() != self.cluster.replicas.len() {
            return Err(CoordinatorError::Config(format!(
                "Primary/replica count mismatch: {} primaries, {} replicas",
                self.cluster.primaries.len(),
                self.cluster.replicas.len()
            )));
        }
        if self.cluster.virtual_nodes == 0 {
            return Err(CoordinatorError::Config(
                "Virtual node count must be at least 1".to_string(),
            ));
        }
        for (i, (primary, replica)) in self
            .cluster
            .primaries
            .iter()
            .zip(self.cluster.replicas.iter())
            .enumerate()
        {
            if primary == replica {
                return Err(CoordinatorError::Config(format!(
                    "Shard {} primary and replica resolve to the same endpoint {}",
                    i, primary
                )));
            }
        }
        Ok(())
    }

    pub fn shard_count(&self) -> usize {
        self.cluster.primaries.len()
    }
}

fn required_var(name: &str) -> CoordinatorResult<String> {
    env::var(name).map_err(|_| {
        CoordinatorError::Config(format!("Required environment variable {} is not set", name))
    })
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> CoordinatorResult<T> {
    match env::var(name) {
        Ok(raw) => raw.parse::<T>().map_err(|_| {
            CoordinatorError::Config(format!("Could not parse {}='{}'", name, raw))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_endpoint_list(raw: &str) -> CoordinatorResult<Vec<EndpointAddr>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(EndpointAddr::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(host: &str, port: u16) -> EndpointAddr {
        EndpointAddr::new(host.to_string(), port)
    }

    fn base_config() -> Config {
        Config {
            cluster: ClusterConfig {
                primaries: vec![addr("10.0.0.1", 6379), addr("10.0.0.2", 6379)],
                replicas: vec![addr("10.0.1.1", 6379), addr("10.0.1.2", 6379)],
                virtual_nodes: 150,
            },
            replication: ReplicationConfig {
                default_mode: ReplicationMode::Async,
                wait_timeout_ms: 1_000,
            },
            health: HealthConfig {
                check_interval_ms: 5_000,
                probe_timeout_ms: 3_000,
                failure_threshold: 3,
            },
            timeouts: TimeoutConfig {
                command_timeout_ms: 5_000,
                shutdown_drain_ms: 10_000,
            },
        }
    }

    #[test]
    fn valid_config_passes_validation() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn mismatched_cardinality_is_config_error() {
        let mut config = base_config();
        config.cluster.replicas.pop();
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), "CONFIG_ERROR");
    }

    #[test]
    fn identical_pair_is_config_error() {
        let mut config = base_config();
        config.cluster.replicas[0] = config.cluster.primaries[0].clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn endpoint_list_parsing_trims_and_splits() {
        let endpoints = parse_endpoint_list("10.0.0.1:6379, 10.0.0.2:6380 ,").unwrap();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[1].port, 6380);
    }

    #[test]
    fn malformed_endpoint_is_config_error() {
        assert!(parse_endpoint_list("not-an-endpoint").is_err());
        assert!(parse_endpoint_list("host:notaport").is_err());
    }

    #[test]
    fn replication_mode_parses_case_insensitively() {
        assert_eq!(ReplicationMode::parse("SYNC").unwrap(), ReplicationMode::Sync);
        assert_eq!(ReplicationMode::parse("async").unwrap(), ReplicationMode::Async);
        assert!(ReplicationMode::parse("quorum").is_err());
    }
}
