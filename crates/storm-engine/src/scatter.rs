//! Scatter-gather runtime.
//!
//! Dispatches per-shard query fragments in parallel, bounded by the
//! configured concurrency, and merges the partial results: concatenation in
//! shard-resolution order, or a k-way ordered merge when the route pushed
//! an ORDER BY down. Fragment failures cancel in-flight siblings under the
//! fail-fast policy; IGNORE DMLs accumulate per-shard errors instead.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use storm_common::metrics::Counter;
use storm_common::prelude::*;
use storm_pools::{ConnPool, Connector, Throttler};
use storm_sql::Statement;
use storm_vschema::ResolvedShard;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// One column of a merge comparator: output offset plus direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderSpec {
    pub col: usize,
    pub desc: bool,
}

impl OrderSpec {
    pub fn asc(col: usize) -> Self {
        Self { col, desc: false }
    }

    pub fn desc(col: usize) -> Self {
        Self { col, desc: true }
    }
}

/// Compare two rows under an ordering spec.
pub fn cmp_rows(a: &Row, b: &Row, ordering: &[OrderSpec]) -> Ordering {
    for spec in ordering {
        let lhs = a.get(spec.col);
        let rhs = b.get(spec.col);
        let ord = match (lhs, rhs) {
            (Some(l), Some(r)) => l.sort_cmp(r),
            _ => Ordering::Equal,
        };
        let ord = if spec.desc { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// The per-tablet query interface. Everything below this trait (connection
/// handling, MySQL execution) belongs to the tablet, not the middleware.
#[async_trait]
pub trait QueryService: Send + Sync {
    async fn execute(
        &self,
        ctx: &ExecContext,
        shard: &ResolvedShard,
        stmt: &Statement,
        bindvars: &BindVars,
    ) -> Result<QueryResult>;
}

/// Connector for tablet execution leases. A lease models one pooled
/// connection slot on the tablet; holding it bounds per-backend
/// concurrency.
pub struct LeaseConnector;

#[async_trait]
impl Connector for LeaseConnector {
    type Conn = ();

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn apply_setting(&self, _conn: &mut (), _setting: Option<&str>) -> Result<()> {
        Ok(())
    }
}

struct TabletHandle {
    service: Arc<dyn QueryService>,
    pool: Arc<ConnPool<LeaseConnector>>,
}

/// Maps resolved shards to their serving tablets.
pub struct TabletDirectory {
    tablets: DashMap<ResolvedShard, Arc<TabletHandle>>,
    pool_capacity: usize,
    pool_lifetime: Duration,
}

impl TabletDirectory {
    pub fn new(pool: &PoolConfig) -> Self {
        Self {
            tablets: DashMap::new(),
            pool_capacity: pool.capacity,
            pool_lifetime: pool.max_lifetime,
        }
    }

    /// Register the tablet serving a shard.
    pub fn register(&self, shard: ResolvedShard, service: Arc<dyn QueryService>) {
        let handle = TabletHandle {
            service,
            pool: Arc::new(ConnPool::new(
                LeaseConnector,
                self.pool_capacity,
                self.pool_lifetime,
            )),
        };
        self.tablets.insert(shard, Arc::new(handle));
    }

    fn lookup(&self, shard: &ResolvedShard) -> Result<Arc<TabletHandle>> {
        self.tablets
            .get(shard)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| Error::unavailable(format!("no tablet serving {}", shard)))
    }
}

/// A fragment bound for one shard.
#[derive(Debug, Clone)]
pub struct ShardQuery {
    pub shard: ResolvedShard,
    pub stmt: Statement,
    pub bindvars: BindVars,
}

/// How per-shard failures are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// The first failure cancels in-flight siblings and fails the query.
    FailFast,
    /// Failures are collected; successful shards still contribute.
    Accumulate,
}

/// The outcome of a scatter: merged result plus any per-shard failures
/// (only non-empty under [`ErrorPolicy::Accumulate`]).
#[derive(Debug)]
pub struct ScatterOutcome {
    pub result: QueryResult,
    pub failures: Vec<(ResolvedShard, Error)>,
}

pub struct ScatterExecutor {
    directory: Arc<TabletDirectory>,
    concurrency: usize,
    throttler: Option<Arc<Throttler>>,
    pub shard_queries: Counter,
    pub scatter_queries: Counter,
}

impl ScatterExecutor {
    pub fn new(directory: Arc<TabletDirectory>, concurrency: usize) -> Self {
        Self {
            directory,
            concurrency: concurrency.max(1),
            throttler: None,
            shard_queries: Counter::new(),
            scatter_queries: Counter::new(),
        }
    }

    /// Attach an admission throttler; fragment dispatch then waits out the
    /// backoff the throttler demands.
    pub fn with_throttler(mut self, throttler: Arc<Throttler>) -> Self {
        self.throttler = Some(throttler);
        self
    }

    /// Execute all fragments and merge. With `ordering` non-empty, every
    /// shard's stream is assumed sorted by that comparator and the merge
    /// preserves the order; otherwise results concatenate in the order the
    /// shards were resolved.
    pub async fn execute(
        &self,
        ctx: &ExecContext,
        queries: Vec<ShardQuery>,
        ordering: &[OrderSpec],
        policy: ErrorPolicy,
    ) -> Result<ScatterOutcome> {
        ctx.checked()?;
        if queries.is_empty() {
            return Ok(ScatterOutcome {
                result: QueryResult::default(),
                failures: Vec::new(),
            });
        }
        if queries.len() > 1 {
            self.scatter_queries.inc();
        }

        let child = ctx.child();
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<(usize, ResolvedShard, Result<QueryResult>)> = JoinSet::new();

        for (idx, query) in queries.into_iter().enumerate() {
            self.shard_queries.inc();
            let child = child.clone();
            let semaphore = semaphore.clone();
            let handle = self.directory.lookup(&query.shard);
            let throttler = self.throttler.clone();
            tasks.spawn(async move {
                let result = async {
                    let handle = handle?;
                    let _permit = semaphore
                        .acquire()
                        .await
                        .map_err(|_| Error::Canceled("scatter aborted".into()))?;
                    if let Some(throttler) = &throttler {
                        admit(throttler, idx, &child).await?;
                    }
                    child.checked()?;
                    // A lease from the tablet's pool bounds per-backend load
                    // and observes the caller's deadline while parked.
                    let lease = handle.pool.get(&child, None).await?;
                    let out = handle
                        .service
                        .execute(&child, &query.shard, &query.stmt, &query.bindvars)
                        .await;
                    handle.pool.put(Some(lease));
                    out
                }
                .await;
                (idx, query.shard, result)
            });
        }

        let mut slots: Vec<Option<QueryResult>> = Vec::new();
        let mut failures: Vec<(ResolvedShard, Error)> = Vec::new();
        let mut fatal: Option<Error> = None;

        while let Some(joined) = tasks.join_next().await {
            let (idx, shard, result) = match joined {
                Ok(v) => v,
                Err(join_err) => {
                    fatal.get_or_insert_with(|| {
                        Error::internal(format!("scatter worker panicked: {}", join_err))
                    });
                    child.cancel();
                    continue;
                }
            };
            match result {
                Ok(result) => {
                    if slots.len() <= idx {
                        slots.resize_with(idx + 1, || None);
                    }
                    slots[idx] = Some(result);
                }
                Err(err) => match policy {
                    ErrorPolicy::FailFast => {
                        if fatal.is_none() {
                            warn!(shard = %shard, error = %err, "shard fragment failed; cancelling siblings");
                            child.cancel();
                            fatal = Some(err);
                        }
                    }
                    ErrorPolicy::Accumulate => {
                        debug!(shard = %shard, error = %err, "shard fragment failed; accumulating");
                        failures.push((shard, err));
                    }
                },
            }
        }

        if let Some(err) = fatal {
            return Err(err);
        }

        let partials: Vec<QueryResult> = slots.into_iter().flatten().collect();
        let result = if ordering.is_empty() {
            let mut merged = QueryResult::default();
            for partial in partials {
                merged.append(partial);
            }
            merged
        } else {
            ordered_merge(partials, ordering)
        };

        Ok(ScatterOutcome { result, failures })
    }
}

/// Wait until the throttler admits this worker, observing cancellation.
async fn admit(throttler: &Throttler, worker: usize, ctx: &ExecContext) -> Result<()> {
    let thread = worker % throttler.thread_count();
    loop {
        match throttler.throttle_now(thread) {
            None => return Ok(()),
            Some(backoff) => {
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    err = ctx.done() => return Err(err),
                }
            }
        }
    }
}

/// K-way merge of per-shard sorted results.
fn ordered_merge(partials: Vec<QueryResult>, ordering: &[OrderSpec]) -> QueryResult {
    struct HeapEntry<'a> {
        row: Row,
        source: usize,
        ordering: &'a [OrderSpec],
    }

    impl PartialEq for HeapEntry<'_> {
        fn eq(&self, other: &Self) -> bool {
            self.cmp(other) == Ordering::Equal
        }
    }
    impl Eq for HeapEntry<'_> {}
    impl PartialOrd for HeapEntry<'_> {
        fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
            Some(self.cmp(other))
        }
    }
    impl Ord for HeapEntry<'_> {
        fn cmp(&self, other: &Self) -> Ordering {
            // BinaryHeap is a max-heap; reverse for ascending pops, with the
            // source index as a stable tiebreak.
            cmp_rows(&self.row, &other.row, self.ordering)
                .then(self.source.cmp(&other.source))
                .reverse()
        }
    }

    let mut merged = QueryResult::default();
    let mut sources: Vec<std::vec::IntoIter<Row>> = Vec::new();
    let mut rows_affected = 0;
    for partial in partials {
        if merged.fields.is_empty() {
            merged.fields = partial.fields;
        }
        rows_affected += partial.rows_affected;
        sources.push(partial.rows.into_iter());
    }
    merged.rows_affected = rows_affected;

    let mut heap = BinaryHeap::new();
    for (source, iter) in sources.iter_mut().enumerate() {
        if let Some(row) = iter.next() {
            heap.push(HeapEntry {
                row,
                source,
                ordering,
            });
        }
    }
    while let Some(entry) = heap.pop() {
        let source = entry.source;
        merged.rows.push(entry.row);
        if let Some(row) = sources[source].next() {
            heap.push(HeapEntry {
                row,
                source,
                ordering,
            });
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_of(values: &[i64]) -> QueryResult {
        QueryResult::with_rows(
            vec![Field::new("x", "INT64")],
            values.iter().map(|v| Row::new(vec![Value::Int64(*v)])).collect(),
        )
    }

    #[test]
    fn test_ordered_merge_equals_global_sort() {
        let partials = vec![
            result_of(&[1, 4, 9]),
            result_of(&[2, 3, 10]),
            result_of(&[5]),
            result_of(&[]),
        ];
        let merged = ordered_merge(partials, &[OrderSpec::asc(0)]);
        let got: Vec<i64> = merged.rows.iter().map(|r| r.get_i64(0).unwrap()).collect();
        assert_eq!(got, vec![1, 2, 3, 4, 5, 9, 10]);
    }

    #[test]
    fn test_ordered_merge_desc() {
        let partials = vec![result_of(&[9, 4, 1]), result_of(&[10, 3, 2])];
        let merged = ordered_merge(partials, &[OrderSpec::desc(0)]);
        let got: Vec<i64> = merged.rows.iter().map(|r| r.get_i64(0).unwrap()).collect();
        assert_eq!(got, vec![10, 9, 4, 3, 2, 1]);
    }

    #[test]
    fn test_cmp_rows_multi_column() {
        let a = Row::new(vec![Value::Int64(1), Value::Int64(5)]);
        let b = Row::new(vec![Value::Int64(1), Value::Int64(3)]);
        let ordering = [OrderSpec::asc(0), OrderSpec::desc(1)];
        assert_eq!(cmp_rows(&a, &b, &ordering), Ordering::Less);
    }
}
