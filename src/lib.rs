// Cache coordinator - stateless routing core for a partitioned in-memory cache

// Configuration, loaded once at startup
pub mod config;

// Coordinator orchestration and cache operations
pub mod coordinator;

// Common error types
pub mod error;

// Ring, bindings, health, failover, and stats components
pub mod infrastructure;

// Re-exports for convenience
pub use config::{Config, ReplicationMode};
pub use coordinator::{CacheCoordinator, DeleteResponse, GetResponse, SetResponse};
pub use error::{CoordinatorError, CoordinatorResult};
