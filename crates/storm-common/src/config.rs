//! Configuration types for StormGate

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Default keyspace for unqualified table names (optional).
    pub default_keyspace: Option<String>,

    /// Query timeout (queries exceeding this are cancelled)
    #[serde(default = "default_query_timeout", with = "humantime_serde")]
    pub query_timeout: Duration,

    /// Connection pool configuration, applied per (tablet, user) pool.
    pub pool: PoolConfig,

    /// Throttler configuration.
    pub throttler: ThrottlerConfig,

    /// Execution-engine configuration.
    pub execution: ExecutionConfig,
}

fn default_query_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Connection pool tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum connections per pool.
    pub capacity: usize,

    /// Connections older than this are discarded on return.
    #[serde(default = "default_conn_lifetime", with = "humantime_serde")]
    pub max_lifetime: Duration,

    /// How long a caller may wait on the waitlist before timing out.
    #[serde(default = "default_pool_wait", with = "humantime_serde")]
    pub wait_timeout: Duration,
}

fn default_conn_lifetime() -> Duration {
    Duration::from_secs(600)
}

fn default_pool_wait() -> Duration {
    Duration::from_secs(5)
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            max_lifetime: default_conn_lifetime(),
            wait_timeout: default_pool_wait(),
        }
    }
}

/// Throttler tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottlerConfig {
    /// Number of worker threads sharing the rate.
    pub thread_count: usize,
    /// Maximum queries per second across all threads. 0 disables admission
    /// entirely (all requests are told to back off).
    pub max_qps: u64,
}

impl Default for ThrottlerConfig {
    fn default() -> Self {
        Self {
            thread_count: 8,
            max_qps: 10_000,
        }
    }
}

/// Execution-engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Upper bound on concurrent shard fragments per query. The effective
    /// fanout is min(shard count, this value).
    pub scatter_concurrency: usize,
    /// Maximum rows buffered by an in-memory sort before the query fails
    /// with ResourceExhausted.
    pub memory_sort_rows: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            scatter_concurrency: 64,
            memory_sort_rows: 300_000,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_keyspace: None,
            query_timeout: default_query_timeout(),
            pool: PoolConfig::default(),
            throttler: ThrottlerConfig::default(),
            execution: ExecutionConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Validate the configuration. All problems are accumulated and
    /// returned together.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.query_timeout.is_zero() {
            errors.push("query_timeout must be > 0".to_string());
        }
        if self.pool.capacity == 0 {
            errors.push("pool.capacity must be > 0".to_string());
        }
        if self.throttler.thread_count == 0 {
            errors.push("throttler.thread_count must be > 0".to_string());
        }
        if self.execution.scatter_concurrency == 0 {
            errors.push("execution.scatter_concurrency must be > 0".to_string());
        }
        if self.execution.memory_sort_rows == 0 {
            errors.push("execution.memory_sort_rows must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
