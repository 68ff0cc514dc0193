//! # Storm Common
//!
//! Common types, errors, and utilities shared across all StormGate crates.

pub mod config;
pub mod context;
pub mod error;
pub mod metrics;
pub mod types;

pub use config::*;
pub use context::{CallerId, ExecContext};
pub use error::{Error, Result};
pub use types::*;

/// Re-export commonly used external types
pub mod prelude {
    pub use super::config::*;
    pub use super::context::{CallerId, ExecContext};
    pub use super::error::{Error, Result};
    pub use super::types::*;
    pub use async_trait::async_trait;
    pub use bytes::Bytes;
    pub use tracing::{debug, error, info, instrument, trace, warn};
}
