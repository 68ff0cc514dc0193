//! The VCursor: the execution-side view primitives run against.
//!
//! Bundles the session, the resolver snapshot, and the scatter runtime. It
//! also implements the vindex cursor seam, so lookup vindexes read and
//! write their backing tables through the same routed execution path as
//! everything else — including caller-id propagation.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use storm_common::prelude::*;
use storm_sql::{
    Delete, Expr, Insert, Select, SelectExpr, Statement, TableName, TableRef, Update,
};
use storm_vindex::{LookupTableDef, VindexCursor};
use storm_vschema::{Destination, ResolvedShard, Resolver, Table, TableType};

use crate::scatter::{ErrorPolicy, OrderSpec, ScatterExecutor, ScatterOutcome, ShardQuery};

/// Per-connection session state.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub default_keyspace: Option<String>,
    /// Explicit shard targeting (`USE ks/-80` style); overrides route
    /// destination computation.
    pub target: Option<(String, Destination)>,
    pub autocommit: bool,
    pub in_transaction: bool,
    pub last_insert_id: u64,
}

pub struct VCursor {
    resolver: Arc<Resolver>,
    executor: Arc<ScatterExecutor>,
    session: Mutex<Session>,
    config: ExecutionConfig,
}

impl VCursor {
    pub fn new(
        resolver: Arc<Resolver>,
        executor: Arc<ScatterExecutor>,
        session: Session,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            resolver,
            executor,
            session: Mutex::new(session),
            config,
        }
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    pub fn executor(&self) -> &Arc<ScatterExecutor> {
        &self.executor
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock()
    }

    /// The session's target override, if any.
    pub fn target_destination(&self) -> Option<(String, Destination)> {
        self.session.lock().target.clone()
    }

    /// Resolve destinations and execute the fragment on every target shard.
    pub async fn execute_routed(
        &self,
        ctx: &ExecContext,
        keyspace: &str,
        destinations: &[Destination],
        stmt: &Statement,
        bindvars: &BindVars,
        ordering: &[OrderSpec],
        policy: ErrorPolicy,
    ) -> Result<ScatterOutcome> {
        let shards = self.resolver.resolve(keyspace, destinations)?;
        self.execute_shards(ctx, &shards, stmt, bindvars, ordering, policy)
            .await
    }

    /// Execute the same fragment on an explicit shard list.
    pub async fn execute_shards(
        &self,
        ctx: &ExecContext,
        shards: &[ResolvedShard],
        stmt: &Statement,
        bindvars: &BindVars,
        ordering: &[OrderSpec],
        policy: ErrorPolicy,
    ) -> Result<ScatterOutcome> {
        let queries: Vec<ShardQuery> = shards
            .iter()
            .map(|shard| ShardQuery {
                shard: shard.clone(),
                stmt: stmt.clone(),
                bindvars: bindvars.clone(),
            })
            .collect();
        self.executor.execute(ctx, queries, ordering, policy).await
    }

    /// Execute per-shard fragments that differ per target (sharded DML).
    pub async fn execute_batch(
        &self,
        ctx: &ExecContext,
        queries: Vec<ShardQuery>,
        policy: ErrorPolicy,
    ) -> Result<ScatterOutcome> {
        self.executor.execute(ctx, queries, &[], policy).await
    }

    /// The shard owning a keyspace id.
    pub fn shard_for_keyspace_id(
        &self,
        keyspace: &str,
        keyspace_id: &[u8],
    ) -> Result<ResolvedShard> {
        let resolved = self
            .resolver
            .resolve(keyspace, &[Destination::KeyspaceId(keyspace_id.to_vec())])?;
        resolved
            .into_iter()
            .next()
            .ok_or_else(|| Error::unavailable("no shard in keyspace"))
    }

    /// Reserve `count` values from a sequence table.
    pub async fn next_sequence_values(
        &self,
        ctx: &ExecContext,
        sequence: &str,
        count: u64,
    ) -> Result<Vec<u64>> {
        let (keyspace_hint, name) = split_table(sequence);
        let table = self
            .resolver
            .vschema()
            .find_table(keyspace_hint.as_deref(), &name)?;
        if table.table_type != TableType::Sequence {
            return Err(Error::invalid_argument(format!(
                "{} is not a sequence table",
                sequence
            )));
        }
        let select = Select {
            exprs: vec![SelectExpr::expr(Expr::FuncCall {
                name: "next_value".into(),
                args: vec![Expr::lit(count as i64)],
            })],
            from: vec![TableRef::Named {
                table: TableName::new(table.name.clone()),
                alias: None,
            }],
            ..Default::default()
        };
        let outcome = self
            .execute_routed(
                ctx,
                &table.keyspace,
                &[Destination::AnyShard],
                &Statement::Select(select),
                &BindVars::new(),
                &[],
                ErrorPolicy::FailFast,
            )
            .await?;
        let start = outcome
            .result
            .rows
            .first()
            .and_then(|row| row.get_i64(0))
            .ok_or_else(|| Error::internal(format!("sequence {} returned no value", sequence)))?;
        Ok((0..count).map(|i| start as u64 + i).collect())
    }

    fn lookup_table(&self, def: &LookupTableDef) -> Result<Arc<Table>> {
        let (keyspace_hint, name) = split_table(&def.table);
        self.resolver
            .vschema()
            .find_table(keyspace_hint.as_deref(), &name)
    }

    fn lookup_read_destination(sharded: bool) -> Destination {
        if sharded {
            Destination::AllShards
        } else {
            Destination::AnyShard
        }
    }

    fn lookup_write_destination(&self, table: &Table) -> Result<Destination> {
        let vschema = self.resolver.vschema();
        let ks = vschema.keyspace(&table.keyspace)?;
        if ks.sharded {
            return Err(Error::unsupported(
                "lookup backing tables in sharded keyspaces",
            ));
        }
        Ok(Destination::AnyShard)
    }
}

fn split_table(qualified: &str) -> (Option<String>, String) {
    match qualified.split_once('.') {
        Some((ks, name)) => (Some(ks.to_string()), name.to_string()),
        None => (None, qualified.to_string()),
    }
}

fn from_clause(table: &Table) -> Vec<TableRef> {
    vec![TableRef::Named {
        table: TableName::new(table.name.clone()),
        alias: None,
    }]
}

#[async_trait]
impl VindexCursor for VCursor {
    async fn lookup(
        &self,
        ctx: &ExecContext,
        def: &LookupTableDef,
        values: &[Value],
    ) -> Result<Vec<Vec<Vec<u8>>>> {
        let table = self.lookup_table(def)?;
        let vschema = self.resolver.vschema();
        let sharded = vschema.keyspace(&table.keyspace)?.sharded;

        let mut bindvars = BindVars::new();
        bindvars.insert("__lookup_vals".into(), Value::Tuple(values.to_vec()));
        let select = Select {
            exprs: vec![
                SelectExpr::expr(Expr::col(def.from_column.clone())),
                SelectExpr::expr(Expr::col(def.to_column.clone())),
            ],
            from: from_clause(&table),
            where_clause: Some(Expr::InList {
                expr: Box::new(Expr::col(def.from_column.clone())),
                list: vec![Expr::bindvar("__lookup_vals")],
                negated: false,
            }),
            ..Default::default()
        };
        let outcome = self
            .execute_routed(
                ctx,
                &table.keyspace,
                &[Self::lookup_read_destination(sharded)],
                &Statement::Select(select),
                &bindvars,
                &[],
                ErrorPolicy::FailFast,
            )
            .await?;

        let mut out: Vec<Vec<Vec<u8>>> = vec![Vec::new(); values.len()];
        for row in &outcome.result.rows {
            let Some(from) = row.get(0) else { continue };
            let ksid = match row.get(1) {
                Some(Value::Bytes(b)) => b.clone(),
                Some(Value::Text(s)) => hex::decode(s)
                    .map_err(|_| Error::internal("lookup keyspace_id is not hex"))?,
                _ => continue,
            };
            for (i, value) in values.iter().enumerate() {
                if value == from {
                    out[i].push(ksid.clone());
                }
            }
        }
        Ok(out)
    }

    async fn lookup_create(
        &self,
        ctx: &ExecContext,
        def: &LookupTableDef,
        rows: &[(Value, Vec<u8>)],
        ignore: bool,
    ) -> Result<()> {
        let table = self.lookup_table(def)?;
        let destination = self.lookup_write_destination(&table)?;
        let insert = Insert {
            table: TableName::new(table.name.clone()),
            columns: vec![def.from_column.clone(), def.to_column.clone()],
            rows: rows
                .iter()
                .map(|(from, ksid)| {
                    vec![
                        Expr::Literal(from.clone()),
                        Expr::Literal(Value::Bytes(ksid.clone())),
                    ]
                })
                .collect(),
            ignore,
        };
        self.execute_routed(
            ctx,
            &table.keyspace,
            &[destination],
            &Statement::Insert(insert),
            &BindVars::new(),
            &[],
            ErrorPolicy::FailFast,
        )
        .await?;
        Ok(())
    }

    async fn lookup_update(
        &self,
        ctx: &ExecContext,
        def: &LookupTableDef,
        from: &Value,
        keyspace_id: &[u8],
    ) -> Result<()> {
        let table = self.lookup_table(def)?;
        let destination = self.lookup_write_destination(&table)?;
        let update = Update {
            table: TableName::new(table.name.clone()),
            assignments: vec![(
                def.to_column.clone(),
                Expr::Literal(Value::Bytes(keyspace_id.to_vec())),
            )],
            where_clause: Some(Expr::eq(
                Expr::col(def.from_column.clone()),
                Expr::Literal(from.clone()),
            )),
        };
        self.execute_routed(
            ctx,
            &table.keyspace,
            &[destination],
            &Statement::Update(update),
            &BindVars::new(),
            &[],
            ErrorPolicy::FailFast,
        )
        .await?;
        Ok(())
    }

    async fn lookup_delete(
        &self,
        ctx: &ExecContext,
        def: &LookupTableDef,
        rows: &[(Value, Vec<u8>)],
    ) -> Result<()> {
        let table = self.lookup_table(def)?;
        let destination = self.lookup_write_destination(&table)?;
        for (from, ksid) in rows {
            let delete = Delete {
                table: TableName::new(table.name.clone()),
                where_clause: Some(Expr::and(
                    Expr::eq(
                        Expr::col(def.from_column.clone()),
                        Expr::Literal(from.clone()),
                    ),
                    Expr::eq(
                        Expr::col(def.to_column.clone()),
                        Expr::Literal(Value::Bytes(ksid.clone())),
                    ),
                )),
            };
            self.execute_routed(
                ctx,
                &table.keyspace,
                std::slice::from_ref(&destination),
                &Statement::Delete(delete),
                &BindVars::new(),
                &[],
                ErrorPolicy::FailFast,
            )
            .await?;
        }
        Ok(())
    }

    async fn owner_row_exists(
        &self,
        ctx: &ExecContext,
        owner_table: &str,
        column: &str,
        value: &Value,
        keyspace_id: &[u8],
    ) -> Result<bool> {
        let table = self.resolver.vschema().find_table(None, owner_table)?;
        let select = Select {
            exprs: vec![SelectExpr::expr(Expr::col(column.to_string()))],
            from: from_clause(&table),
            where_clause: Some(Expr::eq(
                Expr::col(column.to_string()),
                Expr::Literal(value.clone()),
            )),
            ..Default::default()
        };
        let outcome = self
            .execute_routed(
                ctx,
                &table.keyspace,
                &[Destination::KeyspaceId(keyspace_id.to_vec())],
                &Statement::Select(select),
                &BindVars::new(),
                &[],
                ErrorPolicy::FailFast,
            )
            .await?;
        Ok(!outcome.result.rows.is_empty())
    }
}
