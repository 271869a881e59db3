use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::CoordinatorResult;
use crate::infrastructure::endpoint::{Endpoint, EndpointAddr, OriginalRole};

/// Lifecycle of a shard's failover record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailoverStatus {
    NeverFailed,
    FailingOver,
    FailedOver,
    Recovered,
    FailoverFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverRecord {
    pub status: FailoverStatus,
    pub since: Option<DateTime<Utc>>,
    /// True once a replica has been promoted for this shard. Stays true after
    /// recovery: the promoted endpoint remains primary (no failback).
    pub promoted: bool,
    pub last_duration_ms: Option<u64>,
}

impl Default for FailoverRecord {
    fn default() -> Self {
        Self {
            status: FailoverStatus::NeverFailed,
            since: None,
            promoted: false,
            last_duration_ms: None,
        }
    }
}

struct Roles {
    primary: Arc<Endpoint>,
    replica: Arc<Endpoint>,
}

/// Per-shard handle pairing the two fixed endpoints with swappable role
/// pointers. The endpoints never change after construction; only which one
/// acts as primary does.
pub struct ShardBinding {
    id: usize,
    name: String,
    roles: RwLock<Roles>,
    failover_gate: AtomicBool,
    failover_record: RwLock<FailoverRecord>,
}

impl ShardBinding {
    pub fn new(
        id: usize,
        primary_addr: EndpointAddr,
        replica_addr: EndpointAddr,
    ) -> CoordinatorResult<Self> {
        let primary = Arc::new(Endpoint::new(primary_addr, OriginalRole::Primary)?);
        let replica = Arc::new(Endpoint::new(replica_addr, OriginalRole::Replica)?);
        Ok(Self {
            id,
            name: format!("cache_node_{}", id),
            roles: RwLock::new(Roles { primary, replica }),
            failover_gate: AtomicBool::new(false),
            failover_record: RwLock::new(FailoverRecord::default()),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Endpoint currently acting as primary. After a failover this is the
    /// promoted replica; callers never cache it across suspension points.
    pub async fn write_endpoint(&self) -> Arc<Endpoint> {
        self.roles.read().await.primary.clone()
    }

    /// Steady-state reads go to the same endpoint as writes, preserving
    /// read-your-writes under async replication.
    pub async fn read_endpoint(&self) -> Arc<Endpoint> {
        self.write_endpoint().await
    }

    /// The endpoint currently in the replica slot. The read path falls back
    /// to it when the write endpoint errors.
    pub async fn replica_endpoint(&self) -> Arc<Endpoint> {
        self.roles.read().await.replica.clone()
    }

    /// The endpoint configured as primary at startup, wherever the role
    /// pointers have moved it since. Recovery detection probes this one.
    pub async fn original_primary(&self) -> Arc<Endpoint> {
        let roles = self.roles.read().await;
        if roles.primary.is_original_primary() {
            roles.primary.clone()
        } else {
            roles.replica.clone()
        }
    }

    /// Exchanges the primary and replica pointers. Called only by the
    /// failover manager, with the gate raised.
    pub async fn swap_roles(&self) {
        let mut guard = self.roles.write().await;
        let roles = &mut *guard;
        std::mem::swap(&mut roles.primary, &mut roles.replica);
    }

    pub fn raise_gate(&self) {
        self.failover_gate.store(true, Ordering::Release);
    }

    pub fn lower_gate(&self) {
        self.failover_gate.store(false, Ordering::Release);
    }

    pub fn gate_raised(&self) -> bool {
        self.failover_gate.load(Ordering::Acquire)
    }

    pub async fn failover_record(&self) -> FailoverRecord {
        self.failover_record.read().await.clone()
    }

    /// Runs `f` with exclusive access to the failover record. Status checks
    /// and updates inside `f` are atomic with respect to other callers.
    pub async fn with_failover_record<R>(&self, f: impl FnOnce(&mut FailoverRecord) -> R) -> R {
        let mut record = self.failover_record.write().await;
        f(&mut record)
    }

    /// Closes both endpoint connections. Part of coordinator shutdown.
    pub async fn disconnect(&self) {
        let roles = self.roles.read().await;
        roles.primary.disconnect().await;
        roles.replica.disconnect().await;
    }
}

impl std::fmt::Debug for ShardBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardBinding")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("gate_raised", &self.gate_raised())
            .finish()
    }
}
