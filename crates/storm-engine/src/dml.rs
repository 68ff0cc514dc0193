//! Sharded DML primitives.
//!
//! `InsertRoute` computes per-row placement through the table's primary
//! vindex, keeps owned lookup vindexes in sync (lookup rows are written
//! before owner rows), and scatters per-shard INSERT fragments.
//! `DmlRoute` handles UPDATE/DELETE with routing discovered from the WHERE
//! clause, including lookup-row cleanup for deletes.

use std::collections::HashMap;
use std::sync::Arc;

use storm_common::prelude::*;
use storm_sql::{Expr, Insert, Select, Statement};
use storm_vindex::{Vindex, VindexCursor, VindexResult};
use storm_vschema::{Destination, ResolvedShard, Table};
use tracing::{debug, warn};

use crate::route::{eval_row, RoutePlan};
use crate::scatter::{ErrorPolicy, ShardQuery};
use crate::vcursor::VCursor;

pub struct InsertRoute {
    pub keyspace: String,
    pub table: Arc<Table>,
    pub query: Insert,
}

impl InsertRoute {
    pub async fn execute(
        &self,
        ctx: &ExecContext,
        vcursor: &VCursor,
        bindvars: &BindVars,
    ) -> Result<QueryResult> {
        ctx.checked()?;
        let vschema = vcursor.resolver().vschema();
        let sharded = vschema.keyspace(&self.keyspace)?.sharded;
        if !sharded {
            let outcome = vcursor
                .execute_routed(
                    ctx,
                    &self.keyspace,
                    &[Destination::AnyShard],
                    &Statement::Insert(self.query.clone()),
                    bindvars,
                    &[],
                    ErrorPolicy::FailFast,
                )
                .await?;
            return Ok(outcome.result);
        }

        let mut columns = self.query.columns.clone();
        let mut rows: Vec<Vec<Value>> = self
            .query
            .rows
            .iter()
            .map(|row| eval_row(row, bindvars))
            .collect::<Result<_>>()?;

        let generated = self.fill_autoincrement(ctx, vcursor, &mut columns, &mut rows).await?;

        let keyspace_ids = self.row_keyspace_ids(ctx, vcursor, &columns, &rows).await?;

        // Owned lookup rows are created before the owner rows so a reader
        // that finds the owner also finds the mapping.
        let created = self
            .create_owned_lookup_rows(ctx, vcursor, &columns, &rows, &keyspace_ids)
            .await?;

        let ignore = self.query.ignore;
        let queries = self.per_shard_inserts(vcursor, &columns, &rows, &keyspace_ids)?;
        let policy = if ignore {
            ErrorPolicy::Accumulate
        } else {
            ErrorPolicy::FailFast
        };

        let outcome = match vcursor.execute_batch(ctx, queries, policy).await {
            Ok(outcome) => outcome,
            Err(err) => {
                // Owner insert failed: take the lookup rows back out.
                self.rollback_lookup_rows(ctx, vcursor, &created).await;
                return Err(err);
            }
        };
        for (shard, err) in &outcome.failures {
            debug!(shard = %shard, error = %err, "insert ignore skipped shard error");
        }

        let mut result = outcome.result;
        if let Some(first_generated) = generated {
            result.last_insert_id = first_generated;
            vcursor.session().last_insert_id = first_generated;
        }
        Ok(result)
    }

    /// Fill missing/NULL autoincrement values from the sequence table.
    /// Returns the first generated value, if any.
    async fn fill_autoincrement(
        &self,
        ctx: &ExecContext,
        vcursor: &VCursor,
        columns: &mut Vec<String>,
        rows: &mut [Vec<Value>],
    ) -> Result<Option<u64>> {
        let Some(ai) = &self.table.auto_increment else {
            return Ok(None);
        };
        let col = match columns.iter().position(|c| c == &ai.column) {
            Some(col) => col,
            None => {
                columns.push(ai.column.clone());
                for row in rows.iter_mut() {
                    row.push(Value::Null);
                }
                columns.len() - 1
            }
        };
        let missing = rows.iter().filter(|row| row[col].is_null()).count();
        if missing == 0 {
            return Ok(None);
        }
        let values = vcursor
            .next_sequence_values(ctx, &ai.sequence, missing as u64)
            .await?;
        let mut next = values.into_iter();
        let mut first = None;
        for row in rows.iter_mut() {
            if row[col].is_null() {
                let v = next
                    .next()
                    .ok_or_else(|| Error::internal("sequence returned too few values"))?;
                first.get_or_insert(v);
                row[col] = Value::Int64(v as i64);
            }
        }
        Ok(first)
    }

    async fn row_keyspace_ids(
        &self,
        ctx: &ExecContext,
        vcursor: &VCursor,
        columns: &[String],
        rows: &[Vec<Value>],
    ) -> Result<Vec<Vec<u8>>> {
        if let Some(pin) = &self.table.pinned {
            return Ok(vec![pin.clone(); rows.len()]);
        }
        let primary = self.table.primary_vindex().ok_or_else(|| {
            Error::internal(format!("table {} has no primary vindex", self.table.name))
        })?;
        let col = column_offset(columns, &primary.columns[0], &self.table.name)?;
        let values: Vec<Value> = rows.iter().map(|row| row[col].clone()).collect();
        let cursor = primary
            .vindex
            .needs_cursor()
            .then_some(vcursor as &dyn VindexCursor);
        let mapped = primary.vindex.map(ctx, cursor, &values).await?;

        mapped
            .into_iter()
            .zip(values.iter())
            .map(|(m, value)| match m {
                VindexResult::Id(id) => Ok(id),
                _ => Err(Error::invalid_argument(format!(
                    "could not map {} to a keyspace id",
                    value
                ))),
            })
            .collect()
    }

    async fn create_owned_lookup_rows(
        &self,
        ctx: &ExecContext,
        vcursor: &VCursor,
        columns: &[String],
        rows: &[Vec<Value>],
        keyspace_ids: &[Vec<u8>],
    ) -> Result<Vec<(Arc<dyn Vindex>, Vec<(Value, Vec<u8>)>)>> {
        let primary_name = self.table.primary_vindex().map(|cv| cv.name.clone());
        let mut created = Vec::new();
        for cv in self.table.owned_vindexes() {
            if Some(&cv.name) == primary_name.as_ref() {
                continue;
            }
            let col = column_offset(columns, &cv.columns[0], &self.table.name)?;
            let lookup_rows: Vec<(Value, Vec<u8>)> = rows
                .iter()
                .zip(keyspace_ids.iter())
                .map(|(row, ksid)| (row[col].clone(), ksid.clone()))
                .collect();
            let lookup = cv
                .vindex
                .as_lookup()
                .ok_or_else(|| Error::internal("owned vindex is not a lookup"))?;
            lookup
                .create(ctx, vcursor, &lookup_rows, self.query.ignore)
                .await?;
            created.push((cv.vindex.clone(), lookup_rows));
        }
        Ok(created)
    }

    async fn rollback_lookup_rows(
        &self,
        ctx: &ExecContext,
        vcursor: &VCursor,
        created: &[(Arc<dyn Vindex>, Vec<(Value, Vec<u8>)>)],
    ) {
        for (vindex, rows) in created {
            let Some(lookup) = vindex.as_lookup() else {
                continue;
            };
            for (value, ksid) in rows {
                if let Err(err) = lookup
                    .delete(ctx, vcursor, std::slice::from_ref(value), ksid)
                    .await
                {
                    warn!(
                        vindex = vindex.name(),
                        error = %err,
                        "failed to roll back lookup row after owner insert failure"
                    );
                }
            }
        }
    }

    fn per_shard_inserts(
        &self,
        vcursor: &VCursor,
        columns: &[String],
        rows: &[Vec<Value>],
        keyspace_ids: &[Vec<u8>],
    ) -> Result<Vec<ShardQuery>> {
        let mut by_shard: HashMap<ResolvedShard, Vec<usize>> = HashMap::new();
        let mut shard_order: Vec<ResolvedShard> = Vec::new();
        for (idx, ksid) in keyspace_ids.iter().enumerate() {
            let shard = vcursor.shard_for_keyspace_id(&self.keyspace, ksid)?;
            if !by_shard.contains_key(&shard) {
                shard_order.push(shard.clone());
            }
            by_shard.entry(shard).or_default().push(idx);
        }

        Ok(shard_order
            .into_iter()
            .map(|shard| {
                let indexes = &by_shard[&shard];
                let insert = Insert {
                    table: self.query.table.clone(),
                    columns: columns.to_vec(),
                    rows: indexes
                        .iter()
                        .map(|&i| {
                            rows[i]
                                .iter()
                                .map(|v| Expr::Literal(v.clone()))
                                .collect()
                        })
                        .collect(),
                    ignore: self.query.ignore,
                };
                ShardQuery {
                    shard,
                    stmt: Statement::Insert(insert),
                    bindvars: BindVars::new(),
                }
            })
            .collect())
    }
}

impl std::fmt::Debug for InsertRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InsertRoute")
            .field("keyspace", &self.keyspace)
            .field("table", &self.table.name)
            .finish()
    }
}

fn column_offset(columns: &[String], name: &str, table: &str) -> Result<usize> {
    columns.iter().position(|c| c == name).ok_or_else(|| {
        Error::invalid_argument(format!(
            "insert into {} must supply vindex column {}",
            table, name
        ))
    })
}

/// Lookup-row cleanup plan for deletes on tables with owned lookups.
pub struct LookupCleanup {
    /// Pre-read of the affected rows: owned lookup columns plus the primary
    /// vindex column, under the DML's WHERE clause.
    pub prefetch: Select,
    pub primary_vindex: Arc<dyn Vindex>,
    pub primary_col: usize,
    /// (column offset in prefetch output, owned lookup vindex).
    pub owned: Vec<(usize, Arc<dyn Vindex>)>,
}

impl std::fmt::Debug for LookupCleanup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookupCleanup")
            .field("owned", &self.owned.len())
            .finish()
    }
}

/// Routed UPDATE/DELETE.
#[derive(Debug)]
pub struct DmlRoute {
    pub keyspace: String,
    pub plan: RoutePlan,
    pub query: Statement,
    pub cleanup: Option<LookupCleanup>,
}

impl DmlRoute {
    pub async fn execute(
        &self,
        ctx: &ExecContext,
        vcursor: &VCursor,
        bindvars: &BindVars,
    ) -> Result<QueryResult> {
        ctx.checked()?;
        let destinations = self.plan.destinations(ctx, vcursor, bindvars).await?;

        if let Some(cleanup) = &self.cleanup {
            self.delete_lookup_rows(ctx, vcursor, bindvars, &destinations, cleanup)
                .await?;
        }

        let outcome = vcursor
            .execute_routed(
                ctx,
                &self.keyspace,
                &destinations,
                &self.query,
                bindvars,
                &[],
                ErrorPolicy::FailFast,
            )
            .await?;
        Ok(outcome.result)
    }

    async fn delete_lookup_rows(
        &self,
        ctx: &ExecContext,
        vcursor: &VCursor,
        bindvars: &BindVars,
        destinations: &[Destination],
        cleanup: &LookupCleanup,
    ) -> Result<()> {
        let outcome = vcursor
            .execute_routed(
                ctx,
                &self.keyspace,
                destinations,
                &Statement::Select(cleanup.prefetch.clone()),
                bindvars,
                &[],
                ErrorPolicy::FailFast,
            )
            .await?;

        for row in &outcome.result.rows {
            let pv_value = row
                .get(cleanup.primary_col)
                .cloned()
                .ok_or_else(|| Error::internal("prefetch row missing primary column"))?;
            let cursor = cleanup
                .primary_vindex
                .needs_cursor()
                .then_some(vcursor as &dyn VindexCursor);
            let mapped = cleanup
                .primary_vindex
                .map(ctx, cursor, std::slice::from_ref(&pv_value))
                .await?;
            let Some(VindexResult::Id(ksid)) = mapped.into_iter().next() else {
                continue;
            };
            for (col, vindex) in &cleanup.owned {
                let value = row
                    .get(*col)
                    .cloned()
                    .ok_or_else(|| Error::internal("prefetch row missing lookup column"))?;
                let lookup = vindex
                    .as_lookup()
                    .ok_or_else(|| Error::internal("owned vindex is not a lookup"))?;
                lookup
                    .delete(ctx, vcursor, std::slice::from_ref(&value), &ksid)
                    .await?;
            }
        }
        Ok(())
    }
}
