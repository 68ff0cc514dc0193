//! Bounded connection pool with a FIFO waitlist.
//!
//! One pool exists per (tablet, database-user) pair. Checkout prefers an
//! idle connection whose session setting matches, then any idle connection
//! (re-applying the setting), then opens a new connection below capacity,
//! and otherwise parks the caller on the waitlist. Returned connections are
//! handed directly to the oldest waiter; `put(None)` vacates the slot so a
//! waiter may open a fresh one.
//!
//! Invariants: open connections (idle + checked out + connecting) never
//! exceed capacity, and a connection is never held by two callers at once —
//! handoff moves ownership through a oneshot channel.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use storm_common::metrics::Counter;
use storm_common::prelude::*;
use tokio::sync::oneshot;
use tracing::debug;

/// Opens backend connections and applies session settings to them.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: Send + 'static;

    async fn connect(&self) -> Result<Self::Conn>;

    /// Apply (or with `None`, reset) a session setting on a connection.
    async fn apply_setting(&self, conn: &mut Self::Conn, setting: Option<&str>) -> Result<()>;
}

/// A checked-out connection. Return it with [`ConnPool::put`]; dropping it
/// without returning leaks its capacity slot until the pool is closed.
pub struct PooledConn<C: Connector> {
    pub conn: C::Conn,
    created_at: Instant,
    setting: Option<String>,
}

impl<C: Connector> PooledConn<C> {
    /// Whether the connection has outlived the configured lifetime and must
    /// be discarded instead of reused.
    pub fn expired(&self, lifetime: Duration) -> bool {
        self.created_at.elapsed() >= lifetime
    }

    pub fn setting(&self) -> Option<&str> {
        self.setting.as_deref()
    }
}

impl<C: Connector> std::fmt::Debug for PooledConn<C>
where
    C::Conn: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn")
            .field("conn", &self.conn)
            .field("created_at", &self.created_at)
            .field("setting", &self.setting)
            .finish()
    }
}

enum Handoff<C: Connector> {
    Conn(PooledConn<C>),
    /// A slot was vacated; the waiter may open a fresh connection.
    Vacated,
    Expired,
    Closed,
}

struct Waiter<C: Connector> {
    id: u64,
    tx: oneshot::Sender<Handoff<C>>,
    deadline: Option<Instant>,
}

struct PoolState<C: Connector> {
    idle: Vec<PooledConn<C>>,
    waiters: VecDeque<Waiter<C>>,
    /// idle + checked out + currently connecting.
    open: usize,
    closed: bool,
    next_waiter_id: u64,
}

/// Pool statistics snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub open: usize,
    pub idle: usize,
    pub waiters: usize,
}

pub struct ConnPool<C: Connector> {
    connector: C,
    capacity: usize,
    max_lifetime: Duration,
    state: Mutex<PoolState<C>>,
    pub gets: Counter,
    pub waits: Counter,
    pub expired_conns: Counter,
}

impl<C: Connector> ConnPool<C> {
    pub fn new(connector: C, capacity: usize, max_lifetime: Duration) -> Self {
        Self {
            connector,
            capacity,
            max_lifetime,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                waiters: VecDeque::new(),
                open: 0,
                closed: false,
                next_waiter_id: 0,
            }),
            gets: Counter::new(),
            waits: Counter::new(),
            expired_conns: Counter::new(),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            capacity: self.capacity,
            open: state.open,
            idle: state.idle.len(),
            waiters: state.waiters.len(),
        }
    }

    /// Check out a connection, optionally with a session setting.
    pub async fn get(
        &self,
        ctx: &ExecContext,
        setting: Option<&str>,
    ) -> Result<PooledConn<C>> {
        self.gets.inc();
        loop {
            ctx.checked()?;

            enum Action<C: Connector> {
                Use(PooledConn<C>),
                Open,
                Park(oneshot::Receiver<Handoff<C>>, u64),
            }

            let action = {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(Error::unavailable("connection pool is closed"));
                }
                // Prefer an idle conn already carrying the right setting.
                if let Some(pos) = state
                    .idle
                    .iter()
                    .position(|c| c.setting.as_deref() == setting)
                {
                    Action::Use(state.idle.remove(pos))
                } else if let Some(conn) = state.idle.pop() {
                    Action::Use(conn)
                } else if state.open < self.capacity {
                    state.open += 1;
                    Action::Open
                } else {
                    let (tx, rx) = oneshot::channel();
                    let id = state.next_waiter_id;
                    state.next_waiter_id += 1;
                    state.waiters.push_back(Waiter {
                        id,
                        tx,
                        deadline: ctx.deadline(),
                    });
                    Action::Park(rx, id)
                }
            };

            match action {
                Action::Use(conn) => {
                    if conn.expired(self.max_lifetime) {
                        self.discard(conn);
                        continue;
                    }
                    match self.with_setting(conn, setting).await {
                        Ok(conn) => return Ok(conn),
                        // A conn that rejects its setting is treated as dead.
                        Err(_) => continue,
                    }
                }
                Action::Open => match self.connector.connect().await {
                    Ok(conn) => {
                        let conn = PooledConn {
                            conn,
                            created_at: Instant::now(),
                            setting: None,
                        };
                        match self.with_setting(conn, setting).await {
                            Ok(conn) => return Ok(conn),
                            Err(err) => return Err(err),
                        }
                    }
                    Err(err) => {
                        self.vacate_slot();
                        return Err(err);
                    }
                },
                Action::Park(rx, id) => {
                    self.waits.inc();
                    tokio::select! {
                        handoff = rx => match handoff {
                            Ok(Handoff::Conn(conn)) => {
                                if conn.expired(self.max_lifetime) {
                                    self.discard(conn);
                                    continue;
                                }
                                match self.with_setting(conn, setting).await {
                                    Ok(conn) => return Ok(conn),
                                    Err(_) => continue,
                                }
                            }
                            Ok(Handoff::Vacated) => continue,
                            Ok(Handoff::Expired) => {
                                return Err(Error::DeadlineExceeded(
                                    "timed out waiting for a connection".into(),
                                ))
                            }
                            Ok(Handoff::Closed) | Err(_) => {
                                return Err(Error::unavailable("connection pool is closed"))
                            }
                        },
                        err = ctx.done() => {
                            self.remove_waiter(id);
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    /// Return a connection. `None` signals the slot is vacated (the
    /// connection died) so a waiter may open a fresh one.
    pub fn put(&self, conn: Option<PooledConn<C>>) {
        match conn {
            Some(conn) if conn.expired(self.max_lifetime) => {
                self.expired_conns.inc();
                debug!("discarding expired connection on return");
                self.discard(conn);
            }
            Some(conn) => {
                let mut state = self.state.lock();
                if state.closed {
                    state.open = state.open.saturating_sub(1);
                    return;
                }
                let mut conn = conn;
                // Hand off to the oldest live waiter; a waiter that gave up
                // bounces the send and we try the next one.
                while let Some(waiter) = state.waiters.pop_front() {
                    match waiter.tx.send(Handoff::Conn(conn)) {
                        Ok(()) => return,
                        Err(Handoff::Conn(returned)) => conn = returned,
                        Err(_) => unreachable!("handoff payload is always Conn here"),
                    }
                }
                state.idle.push(conn);
            }
            None => self.vacate_slot(),
        }
    }

    /// Wake every waiter whose deadline has passed (or, with `all`, every
    /// waiter) and deliver a timeout error to each.
    pub fn expire_waiters(&self, all: bool) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let mut kept = VecDeque::new();
        while let Some(waiter) = state.waiters.pop_front() {
            let expired = all || matches!(waiter.deadline, Some(d) if d <= now);
            if expired {
                let _ = waiter.tx.send(Handoff::Expired);
            } else {
                kept.push_back(waiter);
            }
        }
        state.waiters = kept;
    }

    /// Close the pool: drain idle connections and fail every waiter.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        let idle = std::mem::take(&mut state.idle);
        state.open = state.open.saturating_sub(idle.len());
        while let Some(waiter) = state.waiters.pop_front() {
            let _ = waiter.tx.send(Handoff::Closed);
        }
    }

    fn discard(&self, conn: PooledConn<C>) {
        drop(conn);
        self.vacate_slot();
    }

    fn vacate_slot(&self) {
        let mut state = self.state.lock();
        state.open = state.open.saturating_sub(1);
        // Wake one waiter; it re-enters the capacity check and opens a
        // fresh connection itself.
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.tx.send(Handoff::Vacated).is_ok() {
                return;
            }
        }
    }

    fn remove_waiter(&self, id: u64) {
        let mut state = self.state.lock();
        state.waiters.retain(|w| w.id != id);
    }

    async fn with_setting(
        &self,
        mut conn: PooledConn<C>,
        setting: Option<&str>,
    ) -> Result<PooledConn<C>> {
        if conn.setting.as_deref() == setting {
            return Ok(conn);
        }
        match self.connector.apply_setting(&mut conn.conn, setting).await {
            Ok(()) => {
                conn.setting = setting.map(|s| s.to_string());
                Ok(conn)
            }
            Err(err) => {
                debug!(error = %err, "connection rejected setting change; discarding");
                self.discard(conn);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    struct TestConnector {
        connects: AtomicU64,
        fail_settings: bool,
    }

    impl TestConnector {
        fn new() -> Self {
            Self {
                connects: AtomicU64::new(0),
                fail_settings: false,
            }
        }
    }

    #[derive(Debug)]
    struct TestConn {
        #[allow(dead_code)]
        id: u64,
        setting: Option<String>,
    }

    #[async_trait]
    impl Connector for Arc<TestConnector> {
        type Conn = TestConn;

        async fn connect(&self) -> Result<TestConn> {
            let id = self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(TestConn { id, setting: None })
        }

        async fn apply_setting(
            &self,
            conn: &mut TestConn,
            setting: Option<&str>,
        ) -> Result<()> {
            if self.fail_settings {
                return Err(Error::unsupported("settings not supported"));
            }
            conn.setting = setting.map(|s| s.to_string());
            Ok(())
        }
    }

    fn pool(capacity: usize) -> Arc<ConnPool<Arc<TestConnector>>> {
        Arc::new(ConnPool::new(
            Arc::new(TestConnector::new()),
            capacity,
            Duration::from_secs(600),
        ))
    }

    #[tokio::test]
    async fn test_get_and_put_round_trip() {
        let pool = pool(2);
        let ctx = ExecContext::background();
        let conn = pool.get(&ctx, None).await.unwrap();
        assert_eq!(pool.stats().open, 1);
        pool.put(Some(conn));
        assert_eq!(pool.stats().idle, 1);
        // Reuse, not reconnect.
        let _conn = pool.get(&ctx, None).await.unwrap();
        assert_eq!(pool.connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_capacity_is_never_exceeded() {
        let pool = pool(2);
        let ctx = ExecContext::background();
        let c1 = pool.get(&ctx, None).await.unwrap();
        let c2 = pool.get(&ctx, None).await.unwrap();

        let p = pool.clone();
        let waiter = tokio::spawn(async move {
            let ctx = ExecContext::background();
            p.get(&ctx, None).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.stats().open, 2);
        assert_eq!(pool.stats().waiters, 1);

        pool.put(Some(c1));
        let c3 = waiter.await.unwrap().unwrap();
        assert_eq!(pool.stats().open, 2);
        pool.put(Some(c2));
        pool.put(Some(c3));
    }

    #[tokio::test]
    async fn test_waitlist_is_fifo() {
        let pool = pool(1);
        let ctx = ExecContext::background();
        let held = pool.get(&ctx, None).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let p = pool.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let ctx = ExecContext::background();
                let conn = p.get(&ctx, None).await.unwrap();
                order.lock().push(i);
                p.put(Some(conn));
            }));
            // Ensure deterministic queue order.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        pool.put(Some(held));
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_waiters_time_out_and_leave_no_leaks() {
        // Capacity zero: every get parks, every waiter must observe its own
        // deadline.
        let pool = pool(0);
        let mut handles = Vec::new();
        for _ in 0..2 {
            let p = pool.clone();
            handles.push(tokio::spawn(async move {
                let ctx = ExecContext::background().with_timeout(Duration::from_millis(10));
                p.get(&ctx, None).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
        for h in handles {
            let err = h.await.unwrap().unwrap_err();
            assert!(matches!(err, Error::DeadlineExceeded(_)));
        }
        let stats = pool.stats();
        assert_eq!(stats.waiters, 0);
        assert_eq!(stats.open, 0);
    }

    #[tokio::test]
    async fn test_put_none_lets_waiter_open_fresh() {
        let pool = pool(1);
        let ctx = ExecContext::background();
        let dead = pool.get(&ctx, None).await.unwrap();

        let p = pool.clone();
        let waiter = tokio::spawn(async move {
            let ctx = ExecContext::background();
            p.get(&ctx, None).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The connection died; vacate its slot.
        drop(dead.conn);
        pool.put(None);

        let fresh = waiter.await.unwrap().unwrap();
        assert_eq!(pool.connector.connects.load(Ordering::SeqCst), 2);
        pool.put(Some(fresh));
        assert_eq!(pool.stats().open, 1);
    }

    #[tokio::test]
    async fn test_expired_connection_discarded_on_put() {
        let connector = Arc::new(TestConnector::new());
        let pool = ConnPool::new(connector, 1, Duration::from_millis(0));
        let ctx = ExecContext::background();
        let conn = pool.get(&ctx, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        pool.put(Some(conn));
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().open, 0);
        assert_eq!(pool.expired_conns.get(), 1);
    }

    #[tokio::test]
    async fn test_setting_reapplied_on_checkout() {
        let pool = pool(1);
        let ctx = ExecContext::background();
        let conn = pool.get(&ctx, Some("charset=utf8")).await.unwrap();
        assert_eq!(conn.setting(), Some("charset=utf8"));
        pool.put(Some(conn));

        let conn = pool.get(&ctx, Some("charset=latin1")).await.unwrap();
        assert_eq!(conn.setting(), Some("charset=latin1"));
        assert_eq!(conn.conn.setting.as_deref(), Some("charset=latin1"));
        pool.put(Some(conn));

        // Only one physical connection was ever opened.
        assert_eq!(pool.connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_setting_rejection_discards_conn() {
        let connector = Arc::new(TestConnector {
            connects: AtomicU64::new(0),
            fail_settings: true,
        });
        let pool = ConnPool::new(connector, 1, Duration::from_secs(600));
        let ctx = ExecContext::background();
        let err = pool.get(&ctx, Some("charset=utf8")).await.unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
        assert_eq!(pool.stats().open, 0);
    }

    #[tokio::test]
    async fn test_close_fails_waiters_and_new_gets() {
        let pool = pool(0);
        let p = pool.clone();
        let waiter = tokio::spawn(async move {
            let ctx = ExecContext::background();
            p.get(&ctx, None).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.close();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));

        let ctx = ExecContext::background();
        let err = pool.get(&ctx, None).await.unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_expire_waiters() {
        let pool = pool(0);
        let p = pool.clone();
        // A waiter without a deadline survives expire(false) but not
        // expire(true).
        let waiter = tokio::spawn(async move {
            let ctx = ExecContext::background();
            p.get(&ctx, None).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.expire_waiters(false);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.stats().waiters, 1);

        pool.expire_waiters(true);
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded(_)));
        assert_eq!(pool.stats().waiters, 0);
    }
}
