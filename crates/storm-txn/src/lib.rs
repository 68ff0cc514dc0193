//! # Storm Txn
//!
//! Bookkeeping for best-effort multi-shard transactions: distributed
//! transaction ids and the prepared-transaction pool that guards the
//! commit/rollback state machine.

pub mod dtid;
pub mod prep_pool;

pub use dtid::Dtid;
pub use prep_pool::PreparedTxPool;
