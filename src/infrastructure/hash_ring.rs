use lru::LruCache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::infrastructure::shard_binding::ShardBinding;

/// Size of the 32-bit ring hash space, as a u64 for arc arithmetic.
const RING_SPACE: u64 = 1 << 32;

/// Keys resolved per lookup-cache entry before eviction.
const LOOKUP_CACHE_CAPACITY: usize = 10_000;

/// SHA-256 truncated to its first 32 bits, big-endian. Positions both the
/// virtual nodes and the keys on the ring.
pub fn ring_hash(data: &str) -> u32 {
    let digest = Sha256::digest(data.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Consistent-hash ring over the shard bindings. Immutable after
/// construction: failover swaps role pointers inside bindings, never ring
/// geometry.
pub struct HashRing {
    /// Virtual-node positions, ascending. Read-only on the hot path.
    positions: Vec<u32>,
    /// Position -> owning shard ordinal.
    owners: HashMap<u32, usize>,
    bindings: Vec<Arc<ShardBinding>>,
    virtual_nodes: usize,
    /// Key -> shard ordinal cache in front of the binary search. Entries
    /// never invalidate because the ring never changes.
    lookup_cache: Mutex<LruCache<String, usize>>,
}

impl HashRing {
    pub fn new(bindings: Vec<Arc<ShardBinding>>, virtual_nodes: usize) -> Self {
        let mut owners = HashMap::with_capacity(bindings.len() * virtual_nodes);
        let mut positions = Vec::with_capacity(bindings.len() * virtual_nodes);

        for binding in &bindings {
            for vnode in 0..virtual_nodes {
                let mut position = ring_hash(&format!("{}:vnode{}", binding.name(), vnode));
                // Collisions are resolved by probing the next slot.
                while owners.contains_key(&position) {
                    position = position.wrapping_add(1);
                }
                owners.insert(position, binding.id());
                positions.push(position);
            }
        }
        positions.sort_unstable();

        info!(
            "Hash ring constructed: {} shards, {} virtual nodes each, {} positions",
            bindings.len(),
            virtual_nodes,
            positions.len()
        );

        Self {
            positions,
            owners,
            bindings,
            virtual_nodes,
            lookup_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(LOOKUP_CACHE_CAPACITY).unwrap(),
            )),
        }
    }

    /// Resolves the shard ordinal owning a ring position: the first virtual
    /// node at or after it, wrapping to the smallest position past the seam.
    pub(crate) fn shard_for_position(&self, position: u32) -> CoordinatorResult<usize> {
        if self.positions.is_empty() {
            return Err(CoordinatorError::EmptyRing);
        }
        let idx = self.positions.partition_point(|&p| p < position);
        let slot = if idx == self.positions.len() { 0 } else { idx };
        Ok(self.owners[&self.positions[slot]])
    }

    pub fn shard_for_key(&self, key: &str) -> CoordinatorResult<usize> {
        {
            let mut cache = self
                .lookup_cache
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(&shard_id) = cache.get(key) {
                return Ok(shard_id);
            }
        }

        let shard_id = self.shard_for_position(ring_hash(key))?;

        let mut cache = self
            .lookup_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.put(key.to_string(), shard_id);
        Ok(shard_id)
    }

    /// Resolves a key to its owning shard binding.
    pub fn lookup_shard(&self, key: &str) -> CoordinatorResult<&Arc<ShardBinding>> {
        let shard_id = self.shard_for_key(key)?;
        self.bindings
            .get(shard_id)
            .ok_or(CoordinatorError::EmptyRing)
    }

    pub fn bindings(&self) -> &[Arc<ShardBinding>] {
        &self.bindings
    }

    pub fn binding(&self, shard_id: usize) -> Option<&Arc<ShardBinding>> {
        self.bindings.get(shard_id)
    }

    pub fn shard_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    /// Arc-coverage summary for observability. The arc between consecutive
    /// positions is attributed to the successor's owner, matching lookup
    /// semantics; the seam arc wraps past 2^32.
    pub fn describe(&self) -> RingDescription {
        let mut spans: Vec<u64> = vec![0; self.bindings.len()];
        let mut vnode_counts: Vec<usize> = vec![0; self.bindings.len()];

        for (k, &position) in self.positions.iter().enumerate() {
            vnode_counts[self.owners[&position]] += 1;

            let successor = self.positions[(k + 1) % self.positions.len()];
            let arc = if successor > position {
                (successor - position) as u64
            } else {
                (RING_SPACE - position as u64) + successor as u64
            };
            spans[self.owners[&successor]] += arc;
        }

        let shards = self
            .bindings
            .iter()
            .map(|binding| ShardArcSummary {
                shard_id: binding.id(),
                shard_name: binding.name().to_string(),
                virtual_nodes: vnode_counts[binding.id()],
                arc_span: spans[binding.id()],
                coverage_percent: spans[binding.id()] as f64 / RING_SPACE as f64 * 100.0,
            })
            .collect();

        RingDescription {
            total_positions: self.positions.len(),
            virtual_nodes_per_shard: self.virtual_nodes,
            shards,
        }
    }
}

impl std::fmt::Debug for HashRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashRing")
            .field("shards", &self.bindings.len())
            .field("virtual_nodes", &self.virtual_nodes)
            .field("positions", &self.positions.len())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RingDescription {
    pub total_positions: usize,
    pub virtual_nodes_per_shard: usize,
    pub shards: Vec<ShardArcSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardArcSummary {
    pub shard_id: usize,
    pub shard_name: String,
    pub virtual_nodes: usize,
    pub arc_span: u64,
    pub coverage_percent: f64,
}
