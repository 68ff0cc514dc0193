//! DML planning: INSERT, UPDATE, DELETE.
//!
//! Inserts compute row placement through the primary vindex and carry the
//! owned-lookup maintenance contract. Updates and deletes route by the
//! WHERE clause like selects; deletes on tables with owned lookup vindexes
//! plan a pre-read so the lookup rows can be removed too.

use storm_common::prelude::*;
use storm_engine::{DmlRoute, InsertRoute, LookupCleanup, Primitive};
use storm_sql::{Delete, Expr, Insert, Select, SelectExpr, Statement, TableRef, Update};
use storm_vschema::TableType;

use crate::routing::discover_route;
use crate::PlannerContext;

pub(crate) fn plan_insert(insert: &Insert, ctx: &mut PlannerContext<'_>) -> Result<Primitive> {
    let keyspace = insert.table.keyspace.as_deref().or(ctx.default_keyspace);
    let table = ctx.vschema.find_table(keyspace, &insert.table.name)?;
    match table.table_type {
        TableType::Reference => {
            return Err(Error::unsupported("INSERT into a reference table"))
        }
        TableType::Sequence => {
            return Err(Error::unsupported("INSERT into a sequence table"))
        }
        TableType::Normal => {}
    }
    let sharded = ctx.vschema.keyspace(&table.keyspace)?.sharded;
    if sharded && table.primary_vindex().is_none() && table.pinned.is_none() {
        return Err(Error::unsupported(format!(
            "INSERT into sharded table {} without a primary vindex",
            table.name
        )));
    }
    for row in &insert.rows {
        if row.len() != insert.columns.len() {
            return Err(Error::invalid_argument(format!(
                "column count does not match value count for {}",
                table.name
            )));
        }
    }

    Ok(Primitive::Insert(InsertRoute {
        keyspace: table.keyspace.clone(),
        table,
        query: insert.clone(),
    }))
}

pub(crate) fn plan_update(update: &Update, ctx: &mut PlannerContext<'_>) -> Result<Primitive> {
    let keyspace = update.table.keyspace.as_deref().or(ctx.default_keyspace);
    let table = ctx.vschema.find_table(keyspace, &update.table.name)?;
    let sharded = ctx.vschema.keyspace(&table.keyspace)?.sharded;

    // Changing a vindex column moves the row; that path needs the full
    // owned-lookup update protocol and is not planned here.
    if sharded {
        for (col, _) in &update.assignments {
            if table
                .column_vindexes
                .iter()
                .any(|cv| cv.columns.iter().any(|c| c == col))
            {
                return Err(Error::unsupported(format!(
                    "UPDATE of vindex column {}",
                    col
                )));
            }
        }
    }

    let conjuncts: Vec<&Expr> = update
        .where_clause
        .as_ref()
        .map(|w| w.split_and())
        .unwrap_or_default();
    let plan = discover_route(&table, sharded, &table.name, &conjuncts);

    Ok(Primitive::Dml(DmlRoute {
        keyspace: table.keyspace.clone(),
        plan,
        query: Statement::Update(update.clone()),
        cleanup: None,
    }))
}

pub(crate) fn plan_delete(delete: &Delete, ctx: &mut PlannerContext<'_>) -> Result<Primitive> {
    let keyspace = delete.table.keyspace.as_deref().or(ctx.default_keyspace);
    let table = ctx.vschema.find_table(keyspace, &delete.table.name)?;
    let sharded = ctx.vschema.keyspace(&table.keyspace)?.sharded;

    let conjuncts: Vec<&Expr> = delete
        .where_clause
        .as_ref()
        .map(|w| w.split_and())
        .unwrap_or_default();
    let plan = discover_route(&table, sharded, &table.name, &conjuncts);

    // Deleting owner rows must also delete their lookup mappings: pre-read
    // the owned columns plus the primary vindex column.
    let mut cleanup = None;
    if sharded {
        let primary = table.primary_vindex();
        let owned: Vec<_> = table
            .owned_vindexes()
            .filter(|cv| primary.map_or(true, |p| p.name != cv.name))
            .collect();
        if !owned.is_empty() {
            let primary = primary.ok_or_else(|| {
                Error::internal(format!("table {} has no primary vindex", table.name))
            })?;
            let mut exprs: Vec<SelectExpr> = owned
                .iter()
                .map(|cv| SelectExpr::expr(Expr::col(cv.columns[0].clone())))
                .collect();
            let primary_col = exprs.len();
            exprs.push(SelectExpr::expr(Expr::col(primary.columns[0].clone())));

            cleanup = Some(LookupCleanup {
                prefetch: Select {
                    exprs,
                    from: vec![TableRef::named(table.name.clone())],
                    where_clause: delete.where_clause.clone(),
                    ..Default::default()
                },
                primary_vindex: primary.vindex.clone(),
                primary_col,
                owned: owned
                    .iter()
                    .enumerate()
                    .map(|(i, cv)| (i, cv.vindex.clone()))
                    .collect(),
            });
        }
    }

    Ok(Primitive::Dml(DmlRoute {
        keyspace: table.keyspace.clone(),
        plan,
        query: Statement::Delete(delete.clone()),
        cleanup,
    }))
}
