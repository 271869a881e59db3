use cache_coordinator::config::{
    ClusterConfig, HealthConfig, ReplicationConfig, TimeoutConfig,
};
use cache_coordinator::infrastructure::endpoint::EndpointAddr;
use cache_coordinator::infrastructure::health_monitor::HealthStatus;
use cache_coordinator::infrastructure::shard_binding::FailoverStatus;
use cache_coordinator::{CacheCoordinator, Config, CoordinatorError, ReplicationMode};

fn offline_config(shards: u16) -> Config {
    // Low loopback ports refuse connections immediately, so every remote
    // call fails fast without a live shard fleet.
    Config {
        cluster: ClusterConfig {
            primaries: (0..shards)
                .map(|i| EndpointAddr::new("127.0.0.1".to_string(), 1 + i))
                .collect(),
            replicas: (0..shards)
                .map(|i| EndpointAddr::new("127.0.0.1".to_string(), 101 + i))
                .collect(),
            virtual_nodes: 150,
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
            shutdown_drain_ms: 300,
        },
    }
}

#[test]
fn key_placement_is_stable_across_coordinator_restarts() {
    let first = CacheCoordinator::new(offline_config(3)).unwrap();
    let second = CacheCoordinator::new(offline_config(3)).unwrap();

    for i in 0..1_000 {
        let key = format!("user:{}", i);
        assert_eq!(
            first.shard_for_key(&key).unwrap(),
            second.shard_for_key(&key).unwrap()
        );
    }
}

#[test]
fn ring_description_accounts_for_every_virtual_node() {
    let coordinator = CacheCoordinator::new(offline_config(3)).unwrap();
    let description = coordinator.describe_ring();

    assert_eq!(description.total_positions, 450);
    assert_eq!(description.virtual_nodes_per_shard, 150);
    let coverage: f64 = description.shards.iter().map(|s| s.coverage_percent).sum();
    assert!((coverage - 100.0).abs() < 1e-6);
}

#[test]
fn mismatched_endpoint_lists_are_rejected_at_construction() {
    let mut config = offline_config(3);
    config.cluster.replicas.pop();
    let err = CacheCoordinator::new(config).unwrap_err();
    assert_eq!(err.kind(), "CONFIG_ERROR");
}

#[tokio::test]
async fn shards_start_healthy_with_clean_failover_records() {
    let coordinator = CacheCoordinator::new(offline_config(3)).unwrap();
    let summary = coordinator.get_health_summary().await;

    assert_eq!(summary.shards.len(), 3);
    for (i, shard) in summary.shards.iter().enumerate() {
        assert_eq!(shard.shard_id, i);
        assert_eq!(shard.shard_name, format!("cache_node_{}", i));
        assert_eq!(shard.status, HealthStatus::Healthy);
        assert_eq!(shard.consecutive_failures, 0);
        assert_eq!(shard.failover.status, FailoverStatus::NeverFailed);
    }
    assert!(summary.recent_events.is_empty());
}

#[tokio::test]
async fn writes_against_a_dead_fleet_surface_transport_errors() {
    let coordinator = CacheCoordinator::new(offline_config(3)).unwrap();

    let err = coordinator
        .set("k", &serde_json::json!("v"), Some(60), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoordinatorError::Connection(_) | CoordinatorError::Timeout(_)
    ));
}

#[tokio::test]
async fn manual_failover_against_dead_replica_is_recorded() {
    let coordinator = CacheCoordinator::new(offline_config(3)).unwrap();

    let outcome = coordinator.trigger_failover(0).await;
    assert!(!outcome.ok);

    let summary = coordinator.get_health_summary().await;
    assert_eq!(summary.shards[0].status, HealthStatus::Failed);
    assert_eq!(summary.shards[0].failover.status, FailoverStatus::FailoverFailed);
    assert!(!summary.recent_events.is_empty());

    let metrics = coordinator.get_failover_metrics().await;
    assert_eq!(metrics.total, 1);
    assert_eq!(metrics.failed, 1);
    assert_eq!(metrics.successful, 0);
}

#[tokio::test]
async fn stats_aggregation_tolerates_unresponsive_shards() {
    let coordinator = CacheCoordinator::new(offline_config(2)).unwrap();

    let stats = coordinator.get_all_stats().await;
    assert_eq!(stats.shards.len(), 2);
    for shard in &stats.shards {
        assert!(shard.error.is_some());
        assert_eq!(shard.keys, 0);
    }
    assert_eq!(stats.total_keys, 0);

    let lag = coordinator.get_replication_lag().await;
    assert_eq!(lag.shards.len(), 2);
    assert!(!lag.all_synced);
}

#[tokio::test]
async fn control_surface_responses_serialize_for_the_front_end() {
    let coordinator = CacheCoordinator::new(offline_config(2)).unwrap();

    let description = serde_json::to_value(coordinator.describe_ring()).unwrap();
    assert_eq!(description["virtual_nodes_per_shard"], 150);

    let summary = serde_json::to_value(coordinator.get_health_summary().await).unwrap();
    assert_eq!(summary["shards"][0]["status"], "HEALTHY");
    assert_eq!(summary["shards"][0]["failover"]["status"], "NEVER_FAILED");

    let metrics = serde_json::to_value(coordinator.get_failover_metrics().await).unwrap();
    assert_eq!(metrics["total"], 0);
    assert_eq!(metrics["average_duration_ms"], 0.0);
}

#[tokio::test]
async fn startup_and_shutdown_round_trip() {
    let coordinator = CacheCoordinator::new(offline_config(2)).unwrap();
    coordinator.start().await;
    tokio::time::sleep(std::time::Duration::from_millis(80)).await;
    coordinator.shutdown().await;
}
