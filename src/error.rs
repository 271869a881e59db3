use std::fmt;

#[derive(Debug)]
pub enum CoordinatorError {
    /// Lookup against a ring with zero virtual nodes. Fatal misconfiguration.
    EmptyRing,
    /// Malformed endpoint lists or mismatched primary/replica cardinality.
    Config(String),
    /// Could not establish or reuse the connection to a storage shard.
    Connection(String),
    /// A storage-shard command failed at the protocol level.
    Command(String),
    /// A deadline-bounded shard call did not complete in time.
    Timeout(String),
    /// Write issued against a shard mid-promotion. Retryable.
    NodeInFailover { shard_id: usize, retry_after_ms: u64 },
    /// Both primary and replica endpoints failed for the shard.
    NodeUnavailable { shard_id: usize, detail: String },
    /// Promotion sequence aborted; the shard remains FAILED.
    FailoverFailed { shard_id: usize, detail: String },
}

impl fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorError::EmptyRing => write!(f, "Hash ring has no virtual nodes"),
            CoordinatorError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CoordinatorError::Connection(msg) => write!(f, "Connection error: {}", msg),
            CoordinatorError::Command(msg) => write!(f, "Command error: {}", msg),
            CoordinatorError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            CoordinatorError::NodeInFailover {
                shard_id,
                retry_after_ms,
            } => write!(
                f,
                "Shard {} is failing over, retry after {}ms",
                shard_id, retry_after_ms
            ),
            CoordinatorError::NodeUnavailable { shard_id, detail } => {
                write!(f, "Shard {} unavailable: {}", shard_id, detail)
            }
            CoordinatorError::FailoverFailed { shard_id, detail } => {
                write!(f, "Failover for shard {} failed: {}", shard_id, detail)
            }
        }
    }
}

impl std::error::Error for CoordinatorError {}

impl CoordinatorError {
    /// Stable wire-level error kind consumed by the front-end.
    pub fn kind(&self) -> &'static str {
        match self {
            CoordinatorError::EmptyRing => "EMPTY_RING",
            CoordinatorError::Config(_) => "CONFIG_ERROR",
            CoordinatorError::Connection(_) => "CONNECTION_ERROR",
            CoordinatorError::Command(_) => "COMMAND_ERROR",
            CoordinatorError::Timeout(_) => "TIMEOUT",
            CoordinatorError::NodeInFailover { .. } => "NODE_IN_FAILOVER",
            CoordinatorError::NodeUnavailable { .. } => "NODE_UNAVAILABLE",
            CoordinatorError::FailoverFailed { .. } => "FAILOVER_FAILED",
        }
    }
}

impl From<redis::RedisError> for CoordinatorError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_io_error() {
            CoordinatorError::Connection(err.to_string())
        } else {
            CoordinatorError::Command(err.to_string())
        }
    }
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
