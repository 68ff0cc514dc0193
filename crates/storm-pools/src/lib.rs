//! # Storm Pools
//!
//! The shared, bounded resource layer underneath query execution: a
//! per-backend connection pool with a FIFO waitlist, and a per-thread QPS
//! throttler shaping request admission.

pub mod conn_pool;
pub mod throttler;

pub use conn_pool::{ConnPool, Connector, PoolStats, PooledConn};
pub use throttler::Throttler;
