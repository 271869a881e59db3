use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{CoordinatorError, CoordinatorResult};

/// Network address of one storage shard endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointAddr {
    pub host: String,
    pub port: u16,
}

impl EndpointAddr {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }

    /// Parses a `host:port` entry from the endpoint configuration lists.
    pub fn parse(raw: &str) -> CoordinatorResult<Self> {
        let (host, port) = raw.rsplit_once(':').ok_or_else(|| {
            CoordinatorError::Config(format!("Endpoint '{}' is missing a port", raw))
        })?;
        if host.is_empty() {
            return Err(CoordinatorError::Config(format!(
                "Endpoint '{}' is missing a host",
                raw
            )));
        }
        let port = port.parse::<u16>().map_err(|_| {
            CoordinatorError::Config(format!("Endpoint '{}' has an invalid port", raw))
        })?;
        Ok(Self::new(host.to_string(), port))
    }

    fn url(&self) -> String {
        format!("redis://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for EndpointAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Role an endpoint was configured with at startup. Never changes, even when
/// failover swaps the binding's role pointers; recovery detection relies on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginalRole {
    Primary,
    Replica,
}

/// One storage-shard endpoint: its address, its configured role, and a
/// long-lived connection created on first use so a shard that is down at
/// coordinator startup does not abort boot.
pub struct Endpoint {
    addr: EndpointAddr,
    original_role: OriginalRole,
    client: redis::Client,
    conn: Mutex<Option<ConnectionManager>>,
}

impl Endpoint {
    pub fn new(addr: EndpointAddr, original_role: OriginalRole) -> CoordinatorResult<Self> {
        let client = redis::Client::open(addr.url())
            .map_err(|e| CoordinatorError::Config(format!("Endpoint {}: {}", addr, e)))?;
        Ok(Self {
            addr,
            original_role,
            client,
            conn: Mutex::new(None),
        })
    }

    pub fn addr(&self) -> &EndpointAddr {
        &self.addr
    }

    pub fn original_role(&self) -> OriginalRole {
        self.original_role
    }

    pub fn is_original_primary(&self) -> bool {
        self.original_role == OriginalRole::Primary
    }

    /// Clones out the shared connection, establishing it first if needed.
    /// Concurrent commands on the clone are serialized by the client.
    async fn connection(&self) -> CoordinatorResult<ConnectionManager> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        debug!("Establishing shard connection to {}", self.addr);
        let conn = ConnectionManager::new(self.client.clone())
            .await
            .map_err(|e| CoordinatorError::Connection(format!("{}: {}", self.addr, e)))?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Drops the cached connection. The next command reconnects.
    pub async fn disconnect(&self) {
        let mut guard = self.conn.lock().await;
        *guard = None;
    }

    async fn run<T: redis::FromRedisValue>(
        &self,
        cmd: redis::Cmd,
        deadline: Duration,
        what: &str,
    ) -> CoordinatorResult<T> {
        let work = async {
            let mut conn = self.connection().await?;
            cmd.query_async::<_, T>(&mut conn)
                .await
                .map_err(CoordinatorError::from)
        };
        match tokio::time::timeout(deadline, work).await {
            Ok(result) => result,
            Err(_) => Err(CoordinatorError::Timeout(format!(
                "{} against {} exceeded {}ms",
                what,
                self.addr,
                deadline.as_millis()
            ))),
        }
    }

    pub async fn ping(&self, deadline: Duration) -> CoordinatorResult<()> {
        self.run::<String>(redis::cmd("PING").to_owned(), deadline, "PING")
            .await
            .map(|_| ())
    }

    pub async fn get(&self, key: &str, deadline: Duration) -> CoordinatorResult<Option<String>> {
        self.run(redis::cmd("GET").arg(key).to_owned(), deadline, "GET")
            .await
    }

    pub async fn set(&self, key: &str, value: &str, deadline: Duration) -> CoordinatorResult<()> {
        self.run::<String>(
            redis::cmd("SET").arg(key).arg(value).to_owned(),
            deadline,
            "SET",
        )
        .await
        .map(|_| ())
    }

    pub async fn setex(
        &self,
        key: &str,
        ttl_seconds: u64,
        value: &str,
        deadline: Duration,
    ) -> CoordinatorResult<()> {
        self.run::<String>(
            redis::cmd("SETEX").arg(key).arg(ttl_seconds).arg(value).to_owned(),
            deadline,
            "SETEX",
        )
        .await
        .map(|_| ())
    }

    pub async fn del(&self, key: &str, deadline: Duration) -> CoordinatorResult<i64> {
        self.run(redis::cmd("DEL").arg(key).to_owned(), deadline, "DEL")
            .await
    }

    /// `WAIT numreplicas timeout` issued on the same connection as the
    /// preceding write. Returns the number of replicas that acknowledged.
    pub async fn wait(
        &self,
        num_replicas: u32,
        wait_timeout_ms: u64,
        deadline: Duration,
    ) -> CoordinatorResult<i64> {
        self.run(
            redis::cmd("WAIT").arg(num_replicas).arg(wait_timeout_ms).to_owned(),
            deadline,
            "WAIT",
        )
        .await
    }

    pub async fn info(&self, section: &str, deadline: Duration) -> CoordinatorResult<String> {
        self.run(redis::cmd("INFO").arg(section).to_owned(), deadline, "INFO")
            .await
    }

    pub async fn replicaof(
        &self,
        master: &EndpointAddr,
        deadline: Duration,
    ) -> CoordinatorResult<()> {
        self.run::<String>(
            redis::cmd("REPLICAOF")
                .arg(&master.host)
                .arg(master.port)
                .to_owned(),
            deadline,
            "REPLICAOF",
        )
        .await
        .map(|_| ())
    }

    pub async fn replicaof_no_one(&self, deadline: Duration) -> CoordinatorResult<()> {
        self.run::<String>(
            redis::cmd("REPLICAOF").arg("NO").arg("ONE").to_owned(),
            deadline,
            "REPLICAOF NO ONE",
        )
        .await
        .map(|_| ())
    }

    pub async fn config_set(
        &self,
        parameter: &str,
        value: &str,
        deadline: Duration,
    ) -> CoordinatorResult<()> {
        self.run::<String>(
            redis::cmd("CONFIG").arg("SET").arg(parameter).arg(value).to_owned(),
            deadline,
            "CONFIG SET",
        )
        .await
        .map(|_| ())
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("addr", &self.addr)
            .field("original_role", &self.original_role)
            .finish()
    }
}
