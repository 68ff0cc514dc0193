//! SELECT planning.
//!
//! Single-shard routes swallow the whole query; everything else goes
//! through horizon planning: aggregation pushdown with a merging aggregator
//! on top, ordered merges for pushed-down ORDER BY, and residual
//! sort/filter/projection/distinct/limit primitives above the route.

use storm_common::prelude::*;
use storm_engine::{
    AggregateParam, ApplyJoin, Concatenate, HashJoin, JoinCol, MemorySort, OrderSpec,
    OrderedAggregate, Primitive, Route, RoutePlan, ScalarAggregate, SubqueryMode,
    UncorrelatedSubquery, Wrapped,
};
use storm_sql::{
    AggrFunc, AggregateOpcode, BinaryOperator, Expr, Join, JoinKind, Limit, OrderExpr,
    QueryProjection, Select, SelectExpr, TableRef, Union,
};
use tracing::debug;

use crate::semantics::{BoundTable, Scope};
use crate::routing::discover_route;
use crate::PlannerContext;

pub(crate) fn plan_select(
    select: &Select,
    ctx: &mut PlannerContext<'_>,
) -> Result<Primitive> {
    // Pull top-level subqueries out of the WHERE clause first; the outer
    // query is planned against their placeholder bind variables.
    let (select, subqueries) = extract_subqueries(select.clone(), ctx)?;

    let mut primitive = match select.from.first() {
        // Table-less SELECT (`select 1`, `select :v`): any shard will do.
        None => {
            let keyspace = ctx.default_keyspace.ok_or_else(|| {
                Error::unsupported("table-less SELECT without a default keyspace")
            })?;
            Primitive::Route(Route::new(
                keyspace,
                RoutePlan::ByDestination(storm_vschema::Destination::AnyShard),
                select.clone(),
            ))
        }
        Some(TableRef::Join(_)) => {
            let scope = Scope::bind(&select, ctx.default_keyspace, ctx.vschema)?;
            plan_join_select(&select, &scope, ctx)?
        }
        Some(_) => {
            let scope = Scope::bind(&select, ctx.default_keyspace, ctx.vschema)?;
            plan_single_table(&select, &scope, ctx)?
        }
    };

    // Innermost subquery executes first.
    for spec in subqueries.into_iter().rev() {
        let inner = plan_select(&spec.inner, ctx)?;
        primitive = Primitive::Subquery(UncorrelatedSubquery {
            mode: spec.mode,
            subquery: Box::new(inner),
            outer: Box::new(primitive),
            bindvar: spec.bindvar,
            has_values_bindvar: spec.has_values_bindvar,
        });
    }
    Ok(primitive)
}

struct SubquerySpec {
    mode: SubqueryMode,
    inner: Select,
    bindvar: String,
    has_values_bindvar: String,
}

/// Replace top-level WHERE subqueries with `__sq_N` placeholders.
fn extract_subqueries(
    mut select: Select,
    ctx: &mut PlannerContext<'_>,
) -> Result<(Select, Vec<SubquerySpec>)> {
    let Some(where_clause) = select.where_clause.take() else {
        return Ok((select, Vec::new()));
    };

    let mut specs = Vec::new();
    let conjuncts: Vec<Expr> = where_clause.split_and().into_iter().cloned().collect();
    let mut rewritten = Vec::with_capacity(conjuncts.len());

    for conjunct in conjuncts {
        let replaced = match conjunct {
            Expr::InList {
                expr,
                mut list,
                negated,
            } if list.len() == 1 && matches!(list[0], Expr::Subquery(_)) => {
                let Expr::Subquery(inner) = list.remove(0) else {
                    unreachable!()
                };
                let n = ctx.next_subquery_id();
                let bindvar = format!("__sq_{}", n);
                specs.push(SubquerySpec {
                    mode: if negated {
                        SubqueryMode::NotIn
                    } else {
                        SubqueryMode::In
                    },
                    inner: *inner,
                    bindvar: bindvar.clone(),
                    has_values_bindvar: format!("__sq_has_values_{}", n),
                });
                Expr::InList {
                    expr,
                    list: vec![Expr::bindvar(bindvar)],
                    negated,
                }
            }
            Expr::BinaryOp { left, op, right }
                if matches!(*right, Expr::Subquery(_)) && op == BinaryOperator::Eq =>
            {
                let Expr::Subquery(inner) = *right else {
                    unreachable!()
                };
                let n = ctx.next_subquery_id();
                let bindvar = format!("__sq_{}", n);
                specs.push(SubquerySpec {
                    mode: SubqueryMode::Value,
                    inner: *inner,
                    bindvar: bindvar.clone(),
                    has_values_bindvar: format!("__sq_has_values_{}", n),
                });
                Expr::BinaryOp {
                    left,
                    op,
                    right: Box::new(Expr::bindvar(bindvar)),
                }
            }
            Expr::Exists(inner) => {
                let n = ctx.next_subquery_id();
                let has_values = format!("__sq_has_values_{}", n);
                specs.push(SubquerySpec {
                    mode: SubqueryMode::Exists,
                    inner: *inner,
                    bindvar: format!("__sq_{}", n),
                    has_values_bindvar: has_values.clone(),
                });
                Expr::eq(Expr::bindvar(has_values), Expr::lit(1))
            }
            other => {
                if other.contains_subquery() && !has_placeholder_only(&other) {
                    return Err(Error::unsupported(format!(
                        "subquery in expression: {}",
                        other
                    )));
                }
                other
            }
        };
        rewritten.push(replaced);
    }

    select.where_clause = rewritten.into_iter().reduce(Expr::and);
    Ok((select, specs))
}

fn has_placeholder_only(expr: &Expr) -> bool {
    let mut nested = false;
    expr.walk(&mut |e| {
        if matches!(e, Expr::Subquery(_) | Expr::Exists(_)) {
            nested = true;
            return false;
        }
        true
    });
    !nested
}

fn plan_single_table(
    select: &Select,
    scope: &Scope,
    ctx: &mut PlannerContext<'_>,
) -> Result<Primitive> {
    let bt = &scope.tables[0];
    let keyspace = bt.table.keyspace.clone();
    let sharded = ctx.vschema.keyspace(&keyspace)?.sharded;

    let conjuncts: Vec<&Expr> = select
        .where_clause
        .as_ref()
        .map(|w| w.split_and())
        .unwrap_or_default();
    let plan = discover_route(&bt.table, sharded, &bt.binding, &conjuncts);
    debug!(table = %bt.table.name, plan = ?plan, "route discovered");

    if plan.is_single_shard() {
        // The whole query runs on one shard; push everything down.
        return Ok(Primitive::Route(Route::new(keyspace, plan, select.clone())));
    }

    let select = rewrite_avg_select(select.clone());
    let qp = QueryProjection::from_select(&select)?;
    if qp.needs_aggregation() {
        plan_scatter_aggregate(&select, qp, keyspace, plan, ctx)
    } else {
        plan_scatter_simple(&select, qp, keyspace, plan)
    }
}

/// Multi-shard SELECT without aggregation: push ORDER BY/LIMIT/DISTINCT
/// down, merge ordered streams, and clip on top.
fn plan_scatter_simple(
    select: &Select,
    qp: QueryProjection,
    keyspace: String,
    plan: RoutePlan,
) -> Result<Primitive> {
    let mut fragment = select.clone();
    let user_columns = fragment.exprs.len();
    let mut hoisted = 0;

    // HAVING without aggregation is just a filter; fold it into the
    // fragment's WHERE (aliases resolved to their expressions).
    if let Some(having) = fragment.having.take() {
        let simplified = qp.simplified_expr(&having);
        fragment.where_clause = Some(match fragment.where_clause.take() {
            Some(existing) => Expr::and(existing, simplified),
            None => simplified,
        });
    }

    // The merge comparator needs every ordering column in the output.
    let mut ordering = Vec::with_capacity(qp.orderings.len());
    for o in &qp.orderings {
        let offset = match qp.find_select_index(&o.simplified) {
            Some(offset) => offset,
            None => {
                if qp.has_star {
                    return Err(Error::unsupported(
                        "ORDER BY in a cross-shard '*' query",
                    ));
                }
                fragment
                    .exprs
                    .push(SelectExpr::expr(o.simplified.clone()));
                hoisted += 1;
                fragment.exprs.len() - 1
            }
        };
        ordering.push(OrderSpec {
            col: offset,
            desc: o.inner.desc,
        });
    }

    // LIMIT pushes down as count+offset; the gateway clips precisely.
    let limit = fragment.limit.take();
    if let Some(l) = limit {
        fragment.limit = Some(Limit {
            count: l.count + l.offset,
            offset: 0,
        });
    }

    let mut route = Route::new(keyspace, plan, fragment);
    route.ordering = ordering;
    if hoisted > 0 {
        // Hoisted ordering columns are stripped after the merge.
        route.truncate_columns = Some(user_columns);
    }
    let mut primitive = Primitive::Route(route);

    if select.distinct {
        primitive = Primitive::distinct(primitive);
    }
    if let Some(l) = limit {
        primitive = Primitive::limited(primitive, l.count, l.offset);
    }
    Ok(primitive)
}

/// Multi-shard SELECT with aggregation: shards produce partial aggregates
/// sorted by the grouping key; a merging aggregator combines them, with
/// residual HAVING/sort/projection/limit above.
fn plan_scatter_aggregate(
    select: &Select,
    mut qp: QueryProjection,
    keyspace: String,
    plan: RoutePlan,
    _ctx: &mut PlannerContext<'_>,
) -> Result<Primitive> {
    if qp.has_star {
        return Err(Error::unsupported("'*' expression in cross-shard query"));
    }

    qp.align_group_by_and_order_by();
    qp.rewrite_aggregates_to_offsets()?;

    // HAVING runs above the aggregator; rewrite it to offsets (hoisting
    // aggregates it mentions that are not already selected).
    let having = match &select.having {
        Some(having) => {
            let aggr_rewritten = qp.rewrite_aggregate_expr(having)?;
            Some(rewrite_columns_to_offsets(&mut qp, &aggr_rewritten)?)
        }
        None => None,
    };

    let aggrs = qp.aggregation_expressions()?;
    let has_distinct = aggrs.iter().any(|a| a.opcode.is_distinct());
    let has_plain = aggrs.iter().any(|a| {
        !a.opcode.is_distinct() && a.opcode != AggregateOpcode::AnyValue
    });
    if has_distinct && has_plain {
        return Err(Error::unsupported(
            "mixing distinct and non-distinct aggregations in a scatter query",
        ));
    }

    // Every grouping key needs a column in the output.
    let groupings = qp.groupings().to_vec();
    let mut group_offsets = Vec::with_capacity(groupings.len());
    for grouping in &groupings {
        let offset = match qp.find_select_index(&grouping.simplified) {
            Some(offset) => offset,
            None => {
                qp.select_exprs.push(storm_sql::SelectColumn {
                    col: SelectExpr::expr(grouping.simplified.clone()),
                    aggr: false,
                });
                qp.added_columns += 1;
                qp.select_exprs.len() - 1
            }
        };
        group_offsets.push(offset);
    }

    // Build the per-shard fragment.
    let mut fragment = Select {
        from: select.from.clone(),
        where_clause: select.where_clause.clone(),
        ..Default::default()
    };
    for sel in &qp.select_exprs {
        let SelectExpr::Aliased { expr, alias } = &sel.col else {
            return Err(Error::unsupported("'*' expression in cross-shard query"));
        };
        let pushed = if expr.contains_offset() {
            // Compound expressions are computed above the aggregator; the
            // fragment keeps the slot with a NULL placeholder.
            Expr::Literal(Value::Null)
        } else if let Expr::Aggregate {
            arg: Some(arg),
            distinct: true,
            ..
        } = expr
        {
            // Distinct aggregates need raw values; shards dedup per group.
            (**arg).clone()
        } else {
            expr.clone()
        };
        fragment.exprs.push(SelectExpr::Aliased {
            expr: pushed,
            alias: alias.clone(),
        });
    }
    fragment.group_by = groupings.iter().map(|g| g.simplified.clone()).collect();
    if has_distinct {
        for aggr in &aggrs {
            if let Expr::Aggregate { arg: Some(arg), .. } = &aggr.original {
                fragment.group_by.push((**arg).clone());
            }
        }
    }

    // Shard streams arrive sorted by the grouping key so the aggregator can
    // merge in one pass. With pushdown-friendly user ordering, the shard
    // order already is the user order.
    let mut route_ordering = Vec::new();
    if qp.can_push_down_sorting && !qp.orderings.is_empty() {
        for o in &qp.orderings {
            let offset = qp.find_select_index(&o.simplified).ok_or_else(|| {
                Error::internal("ordering column missing after hoisting")
            })?;
            fragment.order_by.push(OrderExpr {
                expr: o.simplified.clone(),
                desc: o.inner.desc,
            });
            route_ordering.push(OrderSpec {
                col: offset,
                desc: o.inner.desc,
            });
        }
    } else {
        for (grouping, &offset) in groupings.iter().zip(&group_offsets) {
            fragment.order_by.push(OrderExpr::asc(grouping.simplified.clone()));
            route_ordering.push(OrderSpec::asc(offset));
        }
    }

    let mut route = Route::new(keyspace, plan, fragment);
    route.ordering = route_ordering;
    let mut primitive = Primitive::Route(route);

    let params: Vec<AggregateParam> = aggrs
        .iter()
        .map(|a| {
            let col = a
                .index
                .ok_or_else(|| Error::internal("aggregate without a column index"))?;
            Ok(AggregateParam {
                opcode: a.opcode,
                col,
                alias: a.alias.clone(),
            })
        })
        .collect::<Result<_>>()?;

    primitive = if group_offsets.is_empty() {
        Primitive::ScalarAggregate(Wrapped::new(
            primitive,
            ScalarAggregate { aggregates: params },
        ))
    } else {
        Primitive::OrderedAggregate(Wrapped::new(
            primitive,
            OrderedAggregate {
                group_cols: group_offsets,
                aggregates: params,
            },
        ))
    };

    if let Some(having) = having {
        primitive = Primitive::filtered(primitive, having);
    }

    if !qp.can_push_down_sorting && !qp.orderings.is_empty() {
        let ordering = qp
            .orderings
            .iter()
            .map(|o| {
                let col = qp.find_select_index(&o.simplified).ok_or_else(|| {
                    Error::internal("ordering column missing after hoisting")
                })?;
                Ok(OrderSpec {
                    col,
                    desc: o.inner.desc,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        primitive = Primitive::sorted(
            primitive,
            MemorySort {
                ordering,
                max_rows: usize::MAX,
            },
        );
    }

    // Evaluate compound expressions and strip hoisted columns.
    let needs_projection = qp.added_columns > 0
        || qp
            .select_exprs
            .iter()
            .take(qp.user_column_count())
            .any(|se| matches!(&se.col, SelectExpr::Aliased { expr, .. } if expr.contains_offset()));
    if needs_projection {
        let mut exprs = Vec::new();
        let mut names = Vec::new();
        for (i, sel) in qp
            .select_exprs
            .iter()
            .take(qp.user_column_count())
            .enumerate()
        {
            let SelectExpr::Aliased { expr, .. } = &sel.col else {
                return Err(Error::unsupported("'*' expression in cross-shard query"));
            };
            names.push(sel.col.column_name());
            if expr.contains_offset() {
                exprs.push(expr.clone());
            } else {
                exprs.push(Expr::Offset {
                    offset: i,
                    original: Box::new(expr.clone()),
                });
            }
        }
        primitive = Primitive::projected(primitive, exprs, names);
    }

    if qp.needs_distinct() {
        primitive = Primitive::distinct(primitive);
    }
    if let Some(limit) = select.limit {
        primitive = Primitive::limited(primitive, limit.count, limit.offset);
    }
    Ok(primitive)
}

/// Rewrite plain column references into offsets over the select list,
/// hoisting missing columns.
fn rewrite_columns_to_offsets(qp: &mut QueryProjection, expr: &Expr) -> Result<Expr> {
    Ok(match expr {
        Expr::Column { .. } => {
            let simplified = qp.simplified_expr(expr);
            let offset = match qp.find_select_index(&simplified) {
                Some(offset) => offset,
                None => {
                    qp.select_exprs.push(storm_sql::SelectColumn {
                        col: SelectExpr::expr(simplified.clone()),
                        aggr: false,
                    });
                    qp.added_columns += 1;
                    qp.select_exprs.len() - 1
                }
            };
            Expr::Offset {
                offset,
                original: Box::new(expr.clone()),
            }
        }
        Expr::BinaryOp { left, op, right } => Expr::BinaryOp {
            left: Box::new(rewrite_columns_to_offsets(qp, left)?),
            op: *op,
            right: Box::new(rewrite_columns_to_offsets(qp, right)?),
        },
        Expr::UnaryOp { op, expr } => Expr::UnaryOp {
            op: *op,
            expr: Box::new(rewrite_columns_to_offsets(qp, expr)?),
        },
        Expr::InList {
            expr,
            list,
            negated,
        } => Expr::InList {
            expr: Box::new(rewrite_columns_to_offsets(qp, expr)?),
            list: list
                .iter()
                .map(|e| rewrite_columns_to_offsets(qp, e))
                .collect::<Result<_>>()?,
            negated: *negated,
        },
        Expr::IsNull { expr, negated } => Expr::IsNull {
            expr: Box::new(rewrite_columns_to_offsets(qp, expr)?),
            negated: *negated,
        },
        other => other.clone(),
    })
}

/// AVG cannot be merged across shards directly; plan it as SUM/COUNT and
/// divide above the aggregator.
fn rewrite_avg_select(mut select: Select) -> Select {
    for se in &mut select.exprs {
        if let SelectExpr::Aliased { expr, .. } = se {
            *expr = rewrite_avg_expr(expr);
        }
    }
    if let Some(having) = &select.having {
        select.having = Some(rewrite_avg_expr(having));
    }
    select
}

fn rewrite_avg_expr(expr: &Expr) -> Expr {
    match expr {
        Expr::Aggregate {
            func: AggrFunc::Avg,
            arg: Some(arg),
            distinct: false,
        } => Expr::BinaryOp {
            left: Box::new(Expr::Aggregate {
                func: AggrFunc::Sum,
                arg: Some(arg.clone()),
                distinct: false,
            }),
            op: BinaryOperator::Div,
            right: Box::new(Expr::Aggregate {
                func: AggrFunc::Count,
                arg: Some(arg.clone()),
                distinct: false,
            }),
        },
        Expr::BinaryOp { left, op, right } => Expr::BinaryOp {
            left: Box::new(rewrite_avg_expr(left)),
            op: *op,
            right: Box::new(rewrite_avg_expr(right)),
        },
        Expr::UnaryOp { op, expr } => Expr::UnaryOp {
            op: *op,
            expr: Box::new(rewrite_avg_expr(expr)),
        },
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// Joins
// ---------------------------------------------------------------------------

fn plan_join_select(
    select: &Select,
    scope: &Scope,
    ctx: &mut PlannerContext<'_>,
) -> Result<Primitive> {
    let Some(TableRef::Join(join)) = select.from.first() else {
        return Err(Error::internal("join planner called without a join"));
    };
    let Join {
        left: _,
        right: _,
        kind,
        on,
    } = join.as_ref();
    if scope.tables.len() != 2 {
        return Err(Error::unsupported("joins over more than two tables"));
    }
    let has_aggregation = !select.group_by.is_empty()
        || select
            .exprs
            .iter()
            .any(|se| matches!(se, SelectExpr::Aliased { expr, .. } if expr.contains_aggregation()));
    if has_aggregation {
        return Err(Error::unsupported("aggregation over a cross-shard join"));
    }

    // Classify predicates by which side they touch. ON-clause predicates
    // apply below the join; WHERE predicates apply above it, so under a
    // LEFT JOIN a right-side WHERE predicate cannot be pushed down without
    // turning padded rows into dropped rows.
    let mut side_preds: [Vec<Expr>; 2] = [Vec::new(), Vec::new()];
    let mut join_preds: Vec<(Expr, Expr)> = Vec::new(); // (left col, right col)
    let mut all_conjuncts: Vec<(Expr, bool)> = Vec::new(); // (conjunct, from WHERE)
    if let Some(on) = on {
        all_conjuncts.extend(on.split_and().into_iter().cloned().map(|c| (c, false)));
    }
    if let Some(where_clause) = &select.where_clause {
        all_conjuncts.extend(
            where_clause
                .split_and()
                .into_iter()
                .cloned()
                .map(|c| (c, true)),
        );
    }
    for (conjunct, from_where) in all_conjuncts {
        match scope.single_dependency(&conjunct)? {
            Some(side) => {
                if side == 1 && from_where && *kind == JoinKind::Left {
                    return Err(Error::unsupported(format!(
                        "WHERE predicate on the outer side of a LEFT JOIN: {}",
                        conjunct
                    )));
                }
                side_preds[side].push(conjunct)
            }
            None => {
                let Expr::BinaryOp {
                    left,
                    op: BinaryOperator::Eq,
                    right,
                } = &conjunct
                else {
                    return Err(Error::unsupported(format!(
                        "cross-shard join predicate: {}",
                        conjunct
                    )));
                };
                let l_side = scope.single_dependency(left)?;
                let r_side = scope.single_dependency(right)?;
                match (l_side, r_side) {
                    (Some(0), Some(1)) => {
                        join_preds.push(((**left).clone(), (**right).clone()))
                    }
                    (Some(1), Some(0)) => {
                        join_preds.push(((**right).clone(), (**left).clone()))
                    }
                    _ => {
                        return Err(Error::unsupported(format!(
                            "cross-shard join predicate: {}",
                            conjunct
                        )))
                    }
                }
            }
        }
    }

    let left_bt = &scope.tables[0];
    let right_bt = &scope.tables[1];
    let keyspace = left_bt.table.keyspace.clone();
    let sharded = ctx.vschema.keyspace(&keyspace)?.sharded;

    let left_plan = discover_route(
        &left_bt.table,
        sharded,
        &left_bt.binding,
        &side_preds[0].iter().collect::<Vec<_>>(),
    );
    let right_sharded = ctx
        .vschema
        .keyspace(&right_bt.table.keyspace)?
        .sharded;
    let right_plan = discover_route(
        &right_bt.table,
        right_sharded,
        &right_bt.binding,
        &side_preds[1].iter().collect::<Vec<_>>(),
    );

    // Route merging: both sides provably live on the same shard set.
    if right_bt.table.keyspace == keyspace {
        let mergeable = match (&left_plan, &right_plan) {
            (RoutePlan::Unsharded, RoutePlan::Unsharded) => true,
            (RoutePlan::Reference, RoutePlan::Reference) => true,
            (
                RoutePlan::EqualUnique {
                    vindex: lv,
                    value: lval,
                },
                RoutePlan::EqualUnique {
                    vindex: rv,
                    value: rval,
                },
            ) => lv.name() == rv.name() && lval == rval,
            _ => false,
        };
        if mergeable {
            debug!("merging join into a single route");
            return Ok(Primitive::Route(Route::new(
                keyspace,
                left_plan,
                select.clone(),
            )));
        }
    }

    // Cross-shard join: outer joins keep left rows, and equality pushdown
    // to the right never eliminates them.
    plan_cross_shard_join(
        select,
        scope,
        ctx,
        JoinSides {
            left_bt,
            right_bt,
            left_plan,
            side_preds,
            join_preds,
            left_join: *kind == JoinKind::Left,
        },
    )
}

struct JoinSides<'a> {
    left_bt: &'a BoundTable,
    right_bt: &'a BoundTable,
    left_plan: RoutePlan,
    side_preds: [Vec<Expr>; 2],
    join_preds: Vec<(Expr, Expr)>,
    left_join: bool,
}

fn plan_cross_shard_join(
    select: &Select,
    scope: &Scope,
    ctx: &mut PlannerContext<'_>,
    sides: JoinSides<'_>,
) -> Result<Primitive> {
    // Output columns must be plain column references.
    let mut cols: Vec<JoinCol> = Vec::new();
    let mut left_exprs: Vec<Expr> = Vec::new();
    let mut right_exprs: Vec<Expr> = Vec::new();
    for se in &select.exprs {
        let SelectExpr::Aliased { expr, .. } = se else {
            return Err(Error::unsupported("'*' expression in cross-shard query"));
        };
        let Expr::Column { .. } = expr else {
            return Err(Error::unsupported(format!(
                "expression {} in cross-shard join select list",
                expr
            )));
        };
        match scope.single_dependency(expr)? {
            Some(0) => {
                left_exprs.push(expr.clone());
                cols.push(JoinCol::Left(left_exprs.len() - 1));
            }
            Some(1) => {
                right_exprs.push(expr.clone());
                cols.push(JoinCol::Right(right_exprs.len() - 1));
            }
            _ => {
                return Err(Error::unsupported(format!(
                    "unresolvable join column: {}",
                    expr
                )))
            }
        }
    }

    if sides.join_preds.is_empty() {
        return Err(Error::unsupported("cross-shard join without a join predicate"));
    }
    let (left_key_col, right_key_col) = &sides.join_preds[0];
    if sides.join_preds.len() > 1 {
        return Err(Error::unsupported("multi-column cross-shard join keys"));
    }

    // Hoist the join key into each side's output if missing.
    let left_key = position_or_push(&mut left_exprs, left_key_col);
    let right_key_offset = position_or_push(&mut right_exprs, right_key_col);

    let left_fragment = side_fragment(
        &sides.left_bt.table.name,
        &sides.side_preds[0],
        left_exprs.clone(),
    );
    let left_route = Primitive::Route(Route::new(
        sides.left_bt.table.keyspace.clone(),
        sides.left_plan,
        left_fragment,
    ));

    // ApplyJoin when the join key hits a vindex on the right table;
    // HashJoin otherwise.
    let join_var = format!("__join{}", ctx.next_join_id());
    let vindex_conjunct = Expr::eq(right_key_col.clone(), Expr::bindvar(join_var.clone()));
    let mut right_conjuncts: Vec<&Expr> = sides.side_preds[1].iter().collect();
    right_conjuncts.push(&vindex_conjunct);
    let right_sharded = ctx.vschema.keyspace(&sides.right_bt.table.keyspace)?.sharded;
    let right_plan_with_key = discover_route(
        &sides.right_bt.table,
        right_sharded,
        &sides.right_bt.binding,
        &right_conjuncts,
    );

    let primitive = if !matches!(right_plan_with_key, RoutePlan::Scatter) {
        let mut right_fragment = side_fragment(
            &sides.right_bt.table.name,
            &sides.side_preds[1],
            right_exprs.clone(),
        );
        right_fragment.where_clause = Some(match right_fragment.where_clause.take() {
            Some(existing) => Expr::and(existing, vindex_conjunct.clone()),
            None => vindex_conjunct.clone(),
        });
        let right_route = Primitive::Route(Route::new(
            sides.right_bt.table.keyspace.clone(),
            right_plan_with_key,
            right_fragment,
        ));
        Primitive::ApplyJoin(ApplyJoin {
            left: Box::new(left_route),
            right: Box::new(right_route),
            vars: vec![(join_var, left_key)],
            cols,
            left_join: sides.left_join,
        })
    } else {
        let right_fragment = side_fragment(
            &sides.right_bt.table.name,
            &sides.side_preds[1],
            right_exprs.clone(),
        );
        let right_plan = discover_route(
            &sides.right_bt.table,
            right_sharded,
            &sides.right_bt.binding,
            &sides.side_preds[1].iter().collect::<Vec<_>>(),
        );
        let right_route = Primitive::Route(Route::new(
            sides.right_bt.table.keyspace.clone(),
            right_plan,
            right_fragment,
        ));
        Primitive::HashJoin(HashJoin {
            left: Box::new(left_route),
            right: Box::new(right_route),
            left_key,
            right_key: right_key_offset,
            cols,
            left_join: sides.left_join,
        })
    };

    finish_join(select, primitive)
}

fn position_or_push(exprs: &mut Vec<Expr>, needle: &Expr) -> usize {
    match exprs.iter().position(|e| e == needle) {
        Some(pos) => pos,
        None => {
            exprs.push(needle.clone());
            exprs.len() - 1
        }
    }
}

fn side_fragment(table_name: &str, preds: &[Expr], exprs: Vec<Expr>) -> Select {
    Select {
        exprs: exprs.into_iter().map(SelectExpr::expr).collect(),
        from: vec![TableRef::named(table_name)],
        where_clause: preds.iter().cloned().reduce(Expr::and),
        ..Default::default()
    }
}

fn finish_join(select: &Select, mut primitive: Primitive) -> Result<Primitive> {
    if !select.order_by.is_empty() {
        let mut ordering = Vec::new();
        for order in &select.order_by {
            let offset = select
                .exprs
                .iter()
                .position(|se| matches!(se, SelectExpr::Aliased { expr, .. } if expr == &order.expr))
                .ok_or_else(|| {
                    Error::unsupported("ORDER BY column missing from join select list")
                })?;
            ordering.push(OrderSpec {
                col: offset,
                desc: order.desc,
            });
        }
        primitive = Primitive::sorted(
            primitive,
            MemorySort {
                ordering,
                max_rows: usize::MAX,
            },
        );
    }
    if select.distinct {
        primitive = Primitive::distinct(primitive);
    }
    if let Some(limit) = select.limit {
        primitive = Primitive::limited(primitive, limit.count, limit.offset);
    }
    Ok(primitive)
}

// ---------------------------------------------------------------------------
// Unions
// ---------------------------------------------------------------------------

pub(crate) fn plan_union(union: &Union, ctx: &mut PlannerContext<'_>) -> Result<Primitive> {
    if union.inputs.is_empty() {
        return Err(Error::internal("union with no inputs"));
    }
    let qp = QueryProjection::from_union(union)?;

    let mut inputs = Vec::with_capacity(union.inputs.len());
    for input in &union.inputs {
        inputs.push(plan_select(input, ctx)?);
    }
    let mut primitive = Primitive::Concatenate(Concatenate { inputs });

    if !union.all {
        primitive = Primitive::distinct(primitive);
    }
    if !qp.orderings.is_empty() {
        let ordering = qp
            .orderings
            .iter()
            .map(|o| {
                let col = qp.find_select_index(&o.simplified).ok_or_else(|| {
                    Error::unsupported("ORDER BY column missing from union select list")
                })?;
                Ok(OrderSpec {
                    col,
                    desc: o.inner.desc,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        primitive = Primitive::sorted(
            primitive,
            MemorySort {
                ordering,
                max_rows: usize::MAX,
            },
        );
    }
    if let Some(limit) = union.limit {
        primitive = Primitive::limited(primitive, limit.count, limit.offset);
    }
    Ok(primitive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan;
    use storm_sql::{Statement, TableName};
    use storm_vschema::{RawVSchema, VSchema};
    use std::sync::Arc;

    fn vschema() -> Arc<VSchema> {
        let raw: RawVSchema = serde_json::from_str(
            r#"{
            "keyspaces": {
                "ks": {
                    "sharded": true,
                    "vindexes": { "hash": { "type": "hash" } },
                    "tables": {
                        "users": {
                            "column_vindexes": [ { "column": "id", "name": "hash" } ],
                            "columns": [ { "name": "id" }, { "name": "name" } ],
                            "column_list_authoritative": true
                        },
                        "orders": {
                            "column_vindexes": [ { "column": "user_id", "name": "hash" } ],
                            "columns": [ { "name": "oid" }, { "name": "user_id" }, { "name": "total" } ],
                            "column_list_authoritative": true
                        }
                    }
                },
                "uks": {
                    "sharded": false,
                    "tables": {
                        "a": { "columns": [ { "name": "x" } ], "column_list_authoritative": true },
                        "b": { "columns": [ { "name": "y" } ], "column_list_authoritative": true }
                    }
                }
            }
        }"#,
        )
        .unwrap();
        VSchema::build(&raw).unwrap()
    }

    fn join_select(kind: JoinKind, on: Expr, where_clause: Option<Expr>) -> Select {
        Select {
            exprs: vec![
                SelectExpr::expr(Expr::qual_col("users", "name")),
                SelectExpr::expr(Expr::qual_col("orders", "total")),
            ],
            from: vec![TableRef::Join(Box::new(Join {
                left: TableRef::named("users"),
                right: TableRef::named("orders"),
                kind,
                on: Some(on),
            }))],
            where_clause,
            ..Default::default()
        }
    }

    #[test]
    fn test_unsharded_join_merges_into_one_route() {
        let vschema = vschema();
        let select = Select {
            exprs: vec![
                SelectExpr::expr(Expr::qual_col("a", "x")),
                SelectExpr::expr(Expr::qual_col("b", "y")),
            ],
            from: vec![TableRef::Join(Box::new(Join {
                left: TableRef::named("a"),
                right: TableRef::named("b"),
                kind: JoinKind::Inner,
                on: Some(Expr::eq(Expr::qual_col("a", "x"), Expr::qual_col("b", "y"))),
            }))],
            ..Default::default()
        };
        let planned = plan(&Statement::Select(select), Some("uks"), &vschema).unwrap();
        let tree = planned.describe();
        assert!(tree.starts_with("Route(Unsharded"), "{}", tree);
        assert_eq!(tree.lines().count(), 1);
    }

    #[test]
    fn test_join_on_vindex_key_plans_apply_join() {
        let vschema = vschema();
        let select = join_select(
            JoinKind::Inner,
            Expr::eq(
                Expr::qual_col("users", "id"),
                Expr::qual_col("orders", "user_id"),
            ),
            None,
        );
        let planned = plan(&Statement::Select(select), Some("ks"), &vschema).unwrap();
        let tree = planned.describe();
        assert!(tree.starts_with("ApplyJoin"), "{}", tree);
        // The right side routes by the join variable through its vindex.
        assert!(tree.contains("Route(EqualUnique(hash)"), "{}", tree);
    }

    #[test]
    fn test_join_without_vindex_key_plans_hash_join() {
        let vschema = vschema();
        let select = join_select(
            JoinKind::Inner,
            Expr::eq(
                Expr::qual_col("users", "name"),
                Expr::qual_col("orders", "total"),
            ),
            None,
        );
        let planned = plan(&Statement::Select(select), Some("ks"), &vschema).unwrap();
        let tree = planned.describe();
        assert!(tree.starts_with("HashJoin"), "{}", tree);
    }

    #[test]
    fn test_left_join_where_on_outer_side_rejected() {
        let vschema = vschema();
        let select = join_select(
            JoinKind::Left,
            Expr::eq(
                Expr::qual_col("users", "id"),
                Expr::qual_col("orders", "user_id"),
            ),
            Some(Expr::eq(Expr::qual_col("orders", "total"), Expr::lit(5))),
        );
        let err = plan(&Statement::Select(select), Some("ks"), &vschema).unwrap_err();
        assert_eq!(err.code(), Some("VT12001"));

        // The same predicate in the ON clause plans fine.
        let select = join_select(
            JoinKind::Left,
            Expr::and(
                Expr::eq(
                    Expr::qual_col("users", "id"),
                    Expr::qual_col("orders", "user_id"),
                ),
                Expr::eq(Expr::qual_col("orders", "total"), Expr::lit(5)),
            ),
            None,
        );
        assert!(plan(&Statement::Select(select), Some("ks"), &vschema).is_ok());
    }

    #[test]
    fn test_exists_subquery_extraction() {
        let vschema = vschema();
        let inner = Select {
            exprs: vec![SelectExpr::expr(Expr::col("oid"))],
            from: vec![TableRef::named("orders")],
            ..Default::default()
        };
        let select = Select {
            exprs: vec![SelectExpr::expr(Expr::col("id"))],
            from: vec![TableRef::named("users")],
            where_clause: Some(Expr::Exists(Box::new(inner))),
            ..Default::default()
        };
        let planned = plan(&Statement::Select(select), Some("ks"), &vschema).unwrap();
        let tree = planned.describe();
        assert!(tree.starts_with("Subquery"), "{}", tree);
    }

    #[test]
    fn test_union_plans_concatenate_distinct() {
        let vschema = vschema();
        let input = |table: &str| Select {
            exprs: vec![SelectExpr::expr(Expr::col("id"))],
            from: vec![TableRef::named(table)],
            ..Default::default()
        };
        let union = Union {
            inputs: vec![input("users"), input("users")],
            all: false,
            order_by: vec![],
            limit: None,
        };
        let planned = plan(&Statement::Union(union), Some("ks"), &vschema).unwrap();
        let tree = planned.describe();
        assert!(tree.starts_with("Distinct"), "{}", tree);
        assert!(tree.contains("Concatenate"), "{}", tree);
    }

    #[test]
    fn test_avg_planned_as_sum_over_count() {
        let vschema = vschema();
        let select = Select {
            exprs: vec![SelectExpr::aliased(
                Expr::Aggregate {
                    func: AggrFunc::Avg,
                    arg: Some(Box::new(Expr::col("total"))),
                    distinct: false,
                },
                "avg_total",
            )],
            from: vec![TableRef::named("orders")],
            ..Default::default()
        };
        let planned = plan(&Statement::Select(select), Some("ks"), &vschema).unwrap();
        let tree = planned.describe();
        // sum+count merge below, division in a projection above.
        assert!(tree.contains("Projection"), "{}", tree);
        assert!(tree.contains("ScalarAggregate"), "{}", tree);
    }

    #[test]
    fn test_count_distinct_plan() {
        let vschema = vschema();
        let select = Select {
            exprs: vec![
                SelectExpr::expr(Expr::col("user_id")),
                SelectExpr::expr(Expr::Aggregate {
                    func: AggrFunc::Count,
                    arg: Some(Box::new(Expr::col("total"))),
                    distinct: true,
                }),
            ],
            from: vec![TableRef::named("orders")],
            group_by: vec![Expr::col("user_id")],
            ..Default::default()
        };
        let planned = plan(&Statement::Select(select), Some("ks"), &vschema).unwrap();
        assert!(planned.describe().contains("OrderedAggregate"));
    }

    #[test]
    fn test_scatter_order_by_hoists_and_truncates() {
        let vschema = vschema();
        let select = Select {
            exprs: vec![SelectExpr::expr(Expr::col("name"))],
            from: vec![TableRef::named("users")],
            order_by: vec![OrderExpr::asc(Expr::col("id"))],
            ..Default::default()
        };
        let planned = plan(&Statement::Select(select), Some("ks"), &vschema).unwrap();
        let Primitive::Route(route) = &planned.primitive else {
            panic!("expected a bare route: {}", planned.describe());
        };
        // id was hoisted for the merge and is stripped afterwards.
        assert_eq!(route.query.exprs.len(), 2);
        assert_eq!(route.truncate_columns, Some(1));
        assert_eq!(route.ordering, vec![OrderSpec::asc(1)]);
    }
}
