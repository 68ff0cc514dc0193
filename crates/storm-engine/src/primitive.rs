//! The execution-primitive tree.
//!
//! Primitives form a closed sum: the planner emits exactly these nodes and
//! the runtime walks them. Every primitive supports materialized execution
//! and a streaming form driven by a callback; residual primitives
//! materialize their child and run a pure transformation.

use futures::future::BoxFuture;
use storm_common::prelude::*;
use storm_sql::Expr;

use crate::aggregate::{OrderedAggregate, ScalarAggregate};
use crate::dml::{DmlRoute, InsertRoute};
use crate::join::{ApplyJoin, HashJoin};
use crate::relational::{DistinctFilter, FilterEval, LimitClip, MemorySort, ProjectionEval};
use crate::route::Route;
use crate::subquery::UncorrelatedSubquery;
use crate::vcursor::VCursor;

/// A primitive wrapping an input with a residual operation.
#[derive(Debug)]
pub struct Wrapped<Op> {
    pub input: Box<Primitive>,
    pub op: Op,
}

impl<Op> Wrapped<Op> {
    pub fn new(input: Primitive, op: Op) -> Self {
        Self {
            input: Box::new(input),
            op,
        }
    }
}

/// UNION ALL of several inputs.
#[derive(Debug)]
pub struct Concatenate {
    pub inputs: Vec<Primitive>,
}

/// The closed set of execution primitives.
#[derive(Debug)]
pub enum Primitive {
    Route(Route),
    Insert(InsertRoute),
    Dml(DmlRoute),
    ApplyJoin(ApplyJoin),
    HashJoin(HashJoin),
    OrderedAggregate(Wrapped<OrderedAggregate>),
    ScalarAggregate(Wrapped<ScalarAggregate>),
    MemorySort(Wrapped<MemorySort>),
    Limit(Wrapped<LimitClip>),
    Distinct(Wrapped<DistinctFilter>),
    Projection(Wrapped<ProjectionEval>),
    Filter(Wrapped<FilterEval>),
    Subquery(UncorrelatedSubquery),
    Concatenate(Concatenate),
}

impl Primitive {
    /// Convenience constructors keeping planner code readable.
    pub fn sorted(input: Primitive, op: MemorySort) -> Primitive {
        Primitive::MemorySort(Wrapped::new(input, op))
    }

    pub fn limited(input: Primitive, count: u64, offset: u64) -> Primitive {
        Primitive::Limit(Wrapped::new(input, LimitClip { count, offset }))
    }

    pub fn distinct(input: Primitive) -> Primitive {
        Primitive::Distinct(Wrapped::new(input, DistinctFilter))
    }

    pub fn filtered(input: Primitive, predicate: Expr) -> Primitive {
        Primitive::Filter(Wrapped::new(input, FilterEval { predicate }))
    }

    pub fn projected(input: Primitive, exprs: Vec<Expr>, names: Vec<String>) -> Primitive {
        Primitive::Projection(Wrapped::new(input, ProjectionEval { exprs, names }))
    }

    /// Execute to a materialized result.
    pub fn execute<'a>(
        &'a self,
        ctx: &'a ExecContext,
        vcursor: &'a VCursor,
        bindvars: &'a BindVars,
        want_fields: bool,
    ) -> BoxFuture<'a, Result<QueryResult>> {
        Box::pin(async move {
            ctx.checked()?;
            match self {
                Primitive::Route(route) => {
                    route.execute(ctx, vcursor, bindvars, want_fields).await
                }
                Primitive::Insert(insert) => insert.execute(ctx, vcursor, bindvars).await,
                Primitive::Dml(dml) => dml.execute(ctx, vcursor, bindvars).await,
                Primitive::ApplyJoin(join) => {
                    join.execute(ctx, vcursor, bindvars, want_fields).await
                }
                Primitive::HashJoin(join) => {
                    join.execute(ctx, vcursor, bindvars, want_fields).await
                }
                Primitive::OrderedAggregate(w) => {
                    let input = w.input.execute(ctx, vcursor, bindvars, want_fields).await?;
                    w.op.merge(input)
                }
                Primitive::ScalarAggregate(w) => {
                    let input = w.input.execute(ctx, vcursor, bindvars, want_fields).await?;
                    w.op.merge(input)
                }
                Primitive::MemorySort(w) => {
                    let input = w.input.execute(ctx, vcursor, bindvars, want_fields).await?;
                    // The plan-time bound is clamped by the runtime config.
                    let mut op = w.op.clone();
                    op.max_rows = op.max_rows.min(vcursor.config().memory_sort_rows);
                    op.sort(input)
                }
                Primitive::Limit(w) => {
                    let input = w.input.execute(ctx, vcursor, bindvars, want_fields).await?;
                    Ok(w.op.clip(input))
                }
                Primitive::Distinct(w) => {
                    let input = w.input.execute(ctx, vcursor, bindvars, want_fields).await?;
                    Ok(w.op.dedup(input))
                }
                Primitive::Projection(w) => {
                    let input = w.input.execute(ctx, vcursor, bindvars, want_fields).await?;
                    w.op.project(input, bindvars)
                }
                Primitive::Filter(w) => {
                    let input = w.input.execute(ctx, vcursor, bindvars, want_fields).await?;
                    w.op.filter(input, bindvars)
                }
                Primitive::Subquery(subquery) => {
                    subquery.execute(ctx, vcursor, bindvars, want_fields).await
                }
                Primitive::Concatenate(concat) => {
                    let mut out = QueryResult::default();
                    for input in &concat.inputs {
                        let partial =
                            input.execute(ctx, vcursor, bindvars, want_fields).await?;
                        out.append(partial);
                    }
                    Ok(out)
                }
            }
        })
    }

    /// Streaming execution. Routes may deliver several callbacks (one per
    /// shard) when no ordering must be preserved; residual primitives
    /// deliver one.
    pub fn stream_execute<'a>(
        &'a self,
        ctx: &'a ExecContext,
        vcursor: &'a VCursor,
        bindvars: &'a BindVars,
        want_fields: bool,
        callback: &'a mut (dyn FnMut(QueryResult) -> Result<()> + Send),
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match self {
                Primitive::Route(route) => {
                    route
                        .stream_execute(ctx, vcursor, bindvars, want_fields, callback)
                        .await
                }
                other => {
                    let result = other.execute(ctx, vcursor, bindvars, want_fields).await?;
                    callback(result)
                }
            }
        })
    }

    /// Node name for plan display.
    pub fn name(&self) -> &'static str {
        match self {
            Primitive::Route(_) => "Route",
            Primitive::Insert(_) => "Insert",
            Primitive::Dml(_) => "Dml",
            Primitive::ApplyJoin(_) => "ApplyJoin",
            Primitive::HashJoin(_) => "HashJoin",
            Primitive::OrderedAggregate(_) => "OrderedAggregate",
            Primitive::ScalarAggregate(_) => "ScalarAggregate",
            Primitive::MemorySort(_) => "MemorySort",
            Primitive::Limit(_) => "Limit",
            Primitive::Distinct(_) => "Distinct",
            Primitive::Projection(_) => "Projection",
            Primitive::Filter(_) => "Filter",
            Primitive::Subquery(_) => "Subquery",
            Primitive::Concatenate(_) => "Concatenate",
        }
    }

    fn children(&self) -> Vec<&Primitive> {
        match self {
            Primitive::Route(_) | Primitive::Insert(_) | Primitive::Dml(_) => vec![],
            Primitive::ApplyJoin(j) => vec![j.left.as_ref(), j.right.as_ref()],
            Primitive::HashJoin(j) => vec![j.left.as_ref(), j.right.as_ref()],
            Primitive::OrderedAggregate(w) => vec![w.input.as_ref()],
            Primitive::ScalarAggregate(w) => vec![w.input.as_ref()],
            Primitive::MemorySort(w) => vec![w.input.as_ref()],
            Primitive::Limit(w) => vec![w.input.as_ref()],
            Primitive::Distinct(w) => vec![w.input.as_ref()],
            Primitive::Projection(w) => vec![w.input.as_ref()],
            Primitive::Filter(w) => vec![w.input.as_ref()],
            Primitive::Subquery(s) => vec![s.subquery.as_ref(), s.outer.as_ref()],
            Primitive::Concatenate(c) => c.inputs.iter().collect(),
        }
    }

    /// Indented tree rendering for EXPLAIN-style output and tests.
    pub fn describe(&self) -> String {
        fn walk(node: &Primitive, indent: usize, out: &mut String) {
            out.push_str(&"  ".repeat(indent));
            match node {
                Primitive::Route(route) => {
                    out.push_str(&format!(
                        "Route({:?}, keyspace={})",
                        route.plan, route.keyspace
                    ));
                }
                other => out.push_str(other.name()),
            }
            out.push('\n');
            for child in node.children() {
                walk(child, indent + 1, out);
            }
        }
        let mut out = String::new();
        walk(self, 0, &mut out);
        out
    }
}
