//! Prepared-transaction pool.
//!
//! Holds the shard transactions that have been prepared but not yet
//! committed, keyed by dtid, plus a reservation map recording dtids whose
//! commit is in flight or has failed. The reservation distinguishes three
//! caller-visible states:
//!
//! - **Present**: the transaction is in `conns`, ready to commit.
//! - **Committing**: a commit reserved the dtid; a concurrent commit
//!   attempt gets a retryable "locked" error.
//! - **Failed**: an earlier commit failed; further commit attempts return
//!   the failure until an operator rolls the dtid back.

use std::collections::HashMap;

use parking_lot::Mutex;
use storm_common::prelude::*;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reservation {
    Committing,
    Failed,
}

impl Reservation {
    fn to_error(self) -> Error {
        match self {
            Reservation::Committing => Error::Prepared("locked for committing".into()),
            Reservation::Failed => Error::Prepared("failed to commit".into()),
        }
    }
}

struct PoolState<T> {
    conns: HashMap<String, T>,
    reserved: HashMap<String, Reservation>,
    open: bool,
}

/// Pool of prepared transactions, generic over the per-shard transaction
/// handle it stores.
pub struct PreparedTxPool<T> {
    state: Mutex<PoolState<T>>,
    capacity: usize,
}

impl<T> PreparedTxPool<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(PoolState {
                conns: HashMap::with_capacity(capacity),
                reserved: HashMap::new(),
                open: false,
            }),
            capacity,
        }
    }

    /// Mark the pool open for use.
    pub fn open(&self) {
        self.state.lock().open = true;
    }

    /// Mark the pool closed. Prepared transactions stay in place for
    /// `fetch_all_for_rollback`.
    pub fn close(&self) {
        self.state.lock().open = false;
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Record a prepared transaction. Fails on duplicate dtid, shutdown, or
    /// a full pool.
    pub fn put(&self, dtid: &str, txn: T) -> Result<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(Error::Prepared("pool is shutdown".into()));
        }
        if state.reserved.contains_key(dtid) || state.conns.contains_key(dtid) {
            return Err(Error::Prepared(format!("duplicate DTID in Prepare: {}", dtid)));
        }
        if state.conns.len() >= self.capacity {
            return Err(Error::ResourceExhausted(format!(
                "prepared transactions exceeded limit: {}",
                self.capacity
            )));
        }
        state.conns.insert(dtid.to_string(), txn);
        Ok(())
    }

    /// Take a transaction for committing, reserving the dtid as Committing.
    /// On success the caller must finish with [`Self::forget`] (commit
    /// succeeded) or [`Self::set_failed`] (commit failed).
    ///
    /// `Ok(None)` means the dtid is unknown — it may already have been
    /// resolved.
    pub fn fetch_for_commit(&self, dtid: &str) -> Result<Option<T>> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(Error::Prepared("pool is shutdown".into()));
        }
        if let Some(reservation) = state.reserved.get(dtid) {
            return Err(reservation.to_error());
        }
        match state.conns.remove(dtid) {
            Some(txn) => {
                state
                    .reserved
                    .insert(dtid.to_string(), Reservation::Committing);
                Ok(Some(txn))
            }
            None => Ok(None),
        }
    }

    /// Take a transaction for rollback and drop any reservation. Rolling
    /// back a Failed or Committing dtid is idempotent: the reservation is
    /// removed and `None` returned.
    pub fn fetch_for_rollback(&self, dtid: &str) -> Option<T> {
        let mut state = self.state.lock();
        if state.reserved.remove(dtid).is_some() {
            return None;
        }
        state.conns.remove(dtid)
    }

    /// Record that the commit of a reserved dtid failed. Future commit
    /// attempts return the failure until the dtid is rolled back.
    pub fn set_failed(&self, dtid: &str) {
        warn!(dtid = dtid, "prepared transaction commit failed; reserving dtid");
        self.state
            .lock()
            .reserved
            .insert(dtid.to_string(), Reservation::Failed);
    }

    /// Drop the reservation after a successful commit.
    pub fn forget(&self, dtid: &str) {
        self.state.lock().reserved.remove(dtid);
    }

    /// Drain everything for shutdown rollback. Closes the pool and clears
    /// all reservations.
    pub fn fetch_all_for_rollback(&self) -> Vec<T> {
        let mut state = self.state.lock();
        state.open = false;
        state.reserved.clear();
        state.conns.drain().map(|(_, txn)| txn).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
