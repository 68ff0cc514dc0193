//! Query-projection analysis for horizon planning.
//!
//! A [`QueryProjection`] captures the SELECT/GROUP BY/ORDER BY/DISTINCT shape
//! of a query in a form the planner can push down and merge: which select
//! expressions are aggregations, what the simplified (alias-resolved) forms
//! of ordering and grouping expressions are, and which columns were added on
//! behalf of HAVING/ORDER BY without being asked for by the user.

use storm_common::{Error, Result};

use crate::ast::{
    AggrFunc, AggregateOpcode, Expr, OrderExpr, Select, SelectExpr, Union,
};

/// A select-list column with its aggregation bit.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectColumn {
    pub col: SelectExpr,
    pub aggr: bool,
}

impl SelectColumn {
    /// The underlying expression; stars have none.
    pub fn expr(&self) -> Result<&Expr> {
        match &self.col {
            SelectExpr::Aliased { expr, .. } => Ok(expr),
            SelectExpr::Star => Err(Error::unsupported(
                "'*' expression in cross-shard query",
            )),
        }
    }

    pub fn alias(&self) -> Option<&str> {
        match &self.col {
            SelectExpr::Aliased { alias, .. } => alias.as_deref(),
            SelectExpr::Star => None,
        }
    }
}

/// A grouping key: the user's expression plus its simplified form and, when
/// the user also selects it, the select-list index.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupingExpr {
    pub inner: Expr,
    pub simplified: Expr,
    pub select_index: Option<usize>,
}

impl GroupingExpr {
    /// Grouping keys double as ordering keys when the planner aligns
    /// GROUP BY with ORDER BY.
    pub fn as_ordering(&self) -> OrderingExpr {
        OrderingExpr {
            inner: OrderExpr::asc(self.inner.clone()),
            simplified: self.simplified.clone(),
        }
    }
}

/// An ordering key with its simplified form (aliases resolved to the
/// underlying expression).
#[derive(Debug, Clone, PartialEq)]
pub struct OrderingExpr {
    pub inner: OrderExpr,
    pub simplified: Expr,
}

/// An aggregation the engine must merge, bound to its select-list index.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggr {
    pub original: Expr,
    pub opcode: AggregateOpcode,
    pub alias: String,
    pub index: Option<usize>,
    pub distinct: bool,
}

/// The analyzed projection shape of a SELECT or UNION.
#[derive(Debug, Clone, Default)]
pub struct QueryProjection {
    pub select_exprs: Vec<SelectColumn>,
    pub has_aggr: bool,
    pub distinct: bool,
    pub has_star: bool,
    groupings: Vec<GroupingExpr>,
    pub orderings: Vec<OrderingExpr>,
    pub can_push_down_sorting: bool,
    /// Count of columns added to serve HAVING/ORDER BY that the user did not
    /// select; they are stripped from the final projection.
    pub added_columns: usize,
}

impl QueryProjection {
    /// Analyze a SELECT.
    pub fn from_select(sel: &Select) -> Result<QueryProjection> {
        let mut qp = QueryProjection {
            distinct: sel.distinct,
            can_push_down_sorting: true,
            ..Default::default()
        };

        qp.add_select_expressions(&sel.exprs)?;

        for group in &sel.group_by {
            let select_index = qp.find_select_index(group);
            let simplified = qp.simplified_expr(group);
            check_grouping_expr(&simplified)?;
            qp.groupings.push(GroupingExpr {
                inner: group.clone(),
                simplified,
                select_index,
            });
        }

        qp.add_order_by(&sel.order_by);

        // A DISTINCT query without aggregation dedups whole rows; grouping
        // keys are redundant.
        if qp.distinct && !qp.has_aggr {
            qp.groupings.clear();
        }

        Ok(qp)
    }

    /// Analyze a UNION: the projection comes from the first input, ordering
    /// from the union itself.
    pub fn from_union(union: &Union) -> Result<QueryProjection> {
        let mut qp = QueryProjection {
            can_push_down_sorting: true,
            ..Default::default()
        };
        let first = union
            .inputs
            .first()
            .ok_or_else(|| Error::internal("union with no inputs"))?;
        qp.add_select_expressions(&first.exprs)?;
        qp.add_order_by(&union.order_by);
        Ok(qp)
    }

    fn add_select_expressions(&mut self, exprs: &[SelectExpr]) -> Result<()> {
        for sel_expr in exprs {
            match sel_expr {
                SelectExpr::Aliased { expr, .. } => {
                    check_aggregation_arity(expr)?;
                    let aggr = expr.contains_aggregation();
                    if aggr {
                        self.has_aggr = true;
                    }
                    self.select_exprs.push(SelectColumn {
                        col: sel_expr.clone(),
                        aggr,
                    });
                }
                SelectExpr::Star => {
                    self.has_star = true;
                    self.select_exprs.push(SelectColumn {
                        col: SelectExpr::Star,
                        aggr: false,
                    });
                }
            }
        }
        Ok(())
    }

    fn add_order_by(&mut self, order_by: &[OrderExpr]) {
        for order in order_by {
            let simplified = self.simplified_expr(&order.expr);
            // ORDER BY null is a no-op.
            if simplified.is_null_literal() {
                continue;
            }
            self.can_push_down_sorting =
                self.can_push_down_sorting && !simplified.contains_aggregation();
            self.orderings.push(OrderingExpr {
                inner: order.clone(),
                simplified,
            });
        }
    }

    /// Resolve an unqualified column name through select-list aliases: in
    /// `SELECT a+b AS total ... ORDER BY total`, the ordering runs over
    /// `a+b`, not over a column named `total`.
    pub fn simplified_expr(&self, expr: &Expr) -> Expr {
        let Expr::Column { table: None, name } = expr else {
            return expr.clone();
        };

        for sel in &self.select_exprs {
            let SelectExpr::Aliased { expr: sel_expr, alias } = &sel.col else {
                continue;
            };
            match alias {
                Some(alias) if alias == name => return sel_expr.clone(),
                Some(_) => {}
                None => {
                    if let Expr::Column { name: sel_name, .. } = sel_expr {
                        if sel_name == name {
                            return sel_expr.clone();
                        }
                    }
                }
            }
        }
        expr.clone()
    }

    /// The select-list index of an expression, resolving aliases.
    pub fn find_select_index(&self, expr: &Expr) -> Option<usize> {
        let col_name = match expr {
            Expr::Column { table: None, name } => Some(name.as_str()),
            _ => None,
        };
        for (idx, sel) in self.select_exprs.iter().enumerate() {
            let SelectExpr::Aliased { expr: sel_expr, alias } = &sel.col else {
                continue;
            };
            if let (Some(name), Some(alias)) = (col_name, alias.as_deref()) {
                if alias == name {
                    return Some(idx);
                }
            }
            if sel_expr == expr {
                return Some(idx);
            }
        }
        None
    }

    pub fn groupings(&self) -> &[GroupingExpr] {
        &self.groupings
    }

    pub fn add_grouping(&mut self, grouping: GroupingExpr) {
        self.groupings.push(grouping);
    }

    /// True if the query has aggregate functions or grouping.
    pub fn needs_aggregation(&self) -> bool {
        self.has_aggr || !self.groupings.is_empty()
    }

    fn only_aggr(&self) -> bool {
        self.has_aggr && self.select_exprs.iter().all(|se| se.aggr)
    }

    /// True if an explicit distinct step is still required after
    /// aggregation planning.
    pub fn needs_distinct(&self) -> bool {
        if !self.distinct {
            return false;
        }
        // Pure aggregates without grouping produce a single row.
        !(self.only_aggr() && self.groupings.is_empty())
    }

    /// The number of columns the user asked for (excluding ones added for
    /// HAVING/ORDER BY).
    pub fn user_column_count(&self) -> usize {
        self.select_exprs.len() - self.added_columns
    }

    /// Compute the aggregations a merging aggregator must perform, one per
    /// select column. ORDER BY expressions not present in the select list
    /// are hoisted in first so the sort has something to sort on.
    pub fn aggregation_expressions(&mut self) -> Result<Vec<Aggr>> {
        let orderings: Vec<Expr> = self
            .orderings
            .iter()
            .map(|o| o.simplified.clone())
            .collect();
        'order: for order_expr in orderings {
            for sel in &self.select_exprs {
                if let SelectExpr::Aliased { expr, .. } = &sel.col {
                    if *expr == order_expr {
                        continue 'order;
                    }
                }
            }
            let aggr = order_expr.contains_aggregation();
            if aggr {
                self.has_aggr = true;
            }
            self.select_exprs.push(SelectColumn {
                col: SelectExpr::expr(order_expr),
                aggr,
            });
            self.added_columns += 1;
        }

        let mut out = Vec::new();
        for idx in 0..self.select_exprs.len() {
            let sel = &self.select_exprs[idx];
            let expr = sel.expr()?.clone();
            let alias = sel
                .alias()
                .map(|a| a.to_string())
                .unwrap_or_else(|| sel.col.column_name());

            // Offset-rewritten compound expressions are evaluated by a
            // projection above the aggregate; they need no merge opcode.
            if expr.contains_offset() {
                continue;
            }

            if !expr.contains_aggregation() {
                if !self.is_grouping_expr(&expr) {
                    out.push(Aggr {
                        original: expr,
                        opcode: AggregateOpcode::AnyValue,
                        alias,
                        index: Some(idx),
                        distinct: false,
                    });
                }
                continue;
            }

            let Expr::Aggregate {
                func,
                arg,
                distinct,
            } = &expr
            else {
                return Err(Error::unsupported(
                    "in scatter query: complex aggregate expression",
                ));
            };

            let opcode = match (func, arg.is_none(), *distinct) {
                (AggrFunc::Count, true, _) => AggregateOpcode::CountStar,
                (AggrFunc::Count, false, true) => AggregateOpcode::CountDistinct,
                (AggrFunc::Count, false, false) => AggregateOpcode::Count,
                (AggrFunc::Sum, _, true) => AggregateOpcode::SumDistinct,
                (AggrFunc::Sum, _, false) => AggregateOpcode::Sum,
                (AggrFunc::Min, _, _) => AggregateOpcode::Min,
                (AggrFunc::Max, _, _) => AggregateOpcode::Max,
                (AggrFunc::Avg, _, _) => {
                    return Err(Error::unsupported(
                        "in scatter query: aggregation function 'avg'",
                    ))
                }
            };

            out.push(Aggr {
                original: expr.clone(),
                opcode,
                alias,
                index: Some(idx),
                distinct: *distinct,
            });
        }
        Ok(out)
    }

    fn is_grouping_expr(&self, expr: &Expr) -> bool {
        self.groupings.iter().any(|g| &g.simplified == expr)
    }

    /// Make GROUP BY and ORDER BY agree on column order, so a single sorted
    /// stream serves both. Without user ordering we are free to order by the
    /// grouping keys; with user ordering the grouping keys are rearranged to
    /// match, and missing keys are appended to both lists.
    pub fn align_group_by_and_order_by(&mut self) {
        if self.orderings.is_empty() {
            self.groupings
                .sort_by_key(|g| g.select_index.map_or(usize::MAX, |i| i));
            for grouping in &self.groupings {
                self.orderings.push(grouping.as_ordering());
            }
            return;
        }

        let mut new_groupings = Vec::new();
        let mut used = vec![false; self.groupings.len()];
        for ordering in &self.orderings {
            for (i, grouping) in self.groupings.iter().enumerate() {
                if !used[i] && grouping.simplified == ordering.simplified {
                    new_groupings.push(grouping.clone());
                    used[i] = true;
                }
            }
        }
        if new_groupings.len() != self.groupings.len() {
            for (i, was_used) in used.iter().enumerate() {
                if !*was_used {
                    let grouping = self.groupings[i].clone();
                    self.orderings.push(grouping.as_ordering());
                    new_groupings.push(grouping);
                }
            }
        }
        self.groupings = new_groupings;
    }

    /// Rewrite aggregate nodes inside compound select expressions into
    /// offset references, hoisting each aggregate into its own select
    /// column. `sum(a) + count(*)` becomes `[0] + [1]` over a child that
    /// returns the two aggregates.
    pub fn rewrite_aggregates_to_offsets(&mut self) -> Result<()> {
        for idx in 0..self.select_exprs.len() {
            let sel = &self.select_exprs[idx];
            let SelectExpr::Aliased { expr, alias } = &sel.col else {
                continue;
            };
            // Bare aggregates stay as-is; only compound expressions over
            // aggregates are rewritten.
            if !expr.contains_aggregation() || matches!(expr, Expr::Aggregate { .. }) {
                continue;
            }
            let alias = alias.clone();
            let expr = expr.clone();
            let rewritten = self.rewrite_expr(&expr)?;
            self.select_exprs[idx] = SelectColumn {
                col: SelectExpr::Aliased {
                    expr: rewritten,
                    alias,
                },
                aggr: true,
            };
        }
        Ok(())
    }

    /// Rewrite an arbitrary expression's aggregate nodes into offset
    /// references (hoisting them into the select list as needed). Used for
    /// HAVING predicates evaluated above the merging aggregator.
    pub fn rewrite_aggregate_expr(&mut self, expr: &Expr) -> Result<Expr> {
        self.rewrite_expr(expr)
    }

    fn rewrite_expr(&mut self, expr: &Expr) -> Result<Expr> {
        if let Expr::Aggregate { .. } = expr {
            // Reuse an existing select column when the same aggregate is
            // already computed.
            for (offset, sel) in self.select_exprs.iter().enumerate() {
                if let SelectExpr::Aliased { expr: sel_expr, .. } = &sel.col {
                    if sel_expr == expr {
                        return Ok(Expr::Offset {
                            offset,
                            original: Box::new(expr.clone()),
                        });
                    }
                }
            }
            let offset = self.select_exprs.len();
            self.select_exprs.push(SelectColumn {
                col: SelectExpr::expr(expr.clone()),
                aggr: true,
            });
            self.has_aggr = true;
            self.added_columns += 1;
            return Ok(Expr::Offset {
                offset,
                original: Box::new(expr.clone()),
            });
        }

        Ok(match expr {
            Expr::BinaryOp { left, op, right } => Expr::BinaryOp {
                left: Box::new(self.rewrite_expr(left)?),
                op: *op,
                right: Box::new(self.rewrite_expr(right)?),
            },
            Expr::UnaryOp { op, expr } => Expr::UnaryOp {
                op: *op,
                expr: Box::new(self.rewrite_expr(expr)?),
            },
            Expr::FuncCall { name, args } => Expr::FuncCall {
                name: name.clone(),
                args: args
                    .iter()
                    .map(|a| self.rewrite_expr(a))
                    .collect::<Result<_>>()?,
            },
            other => other.clone(),
        })
    }
}

/// Aggregate functions take exactly one argument. The structural
/// `Expr::Aggregate` form enforces this; the check guards function-call
/// spellings like `sum(a, b)` that a permissive parser lets through.
fn check_aggregation_arity(expr: &Expr) -> Result<()> {
    let mut err = None;
    expr.walk(&mut |e| {
        if let Expr::FuncCall { name, args } = e {
            if AggrFunc::parse(name).is_some() && args.len() != 1 {
                err = Some(Error::InvalidAggregation(e.to_string()));
                return false;
            }
        }
        true
    });
    match err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn check_grouping_expr(expr: &Expr) -> Result<()> {
    if expr.contains_aggregation() {
        return Err(Error::AggrInGroupBy(expr.to_string()));
    }
    if expr.contains_subquery() {
        return Err(Error::unsupported("subqueries in GROUP BY"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinaryOperator, TableRef};

    fn select(exprs: Vec<SelectExpr>) -> Select {
        Select {
            exprs,
            from: vec![TableRef::named("t")],
            ..Default::default()
        }
    }

    #[test]
    fn test_aggregation_bits() {
        let sel = select(vec![
            SelectExpr::expr(Expr::col("y")),
            SelectExpr::expr(Expr::aggregate(AggrFunc::Sum, Expr::col("x"))),
        ]);
        let qp = QueryProjection::from_select(&sel).unwrap();
        assert!(qp.has_aggr);
        assert!(!qp.select_exprs[0].aggr);
        assert!(qp.select_exprs[1].aggr);
        assert!(qp.needs_aggregation());
    }

    #[test]
    fn test_invalid_aggregate_arity() {
        let sel = select(vec![SelectExpr::expr(Expr::FuncCall {
            name: "sum".into(),
            args: vec![Expr::col("a"), Expr::col("b")],
        })]);
        let err = QueryProjection::from_select(&sel).unwrap_err();
        assert_eq!(err.code(), Some("VT03001"));
    }

    #[test]
    fn test_aggregate_in_group_by() {
        let mut sel = select(vec![SelectExpr::expr(Expr::col("a"))]);
        sel.group_by = vec![Expr::aggregate(AggrFunc::Sum, Expr::col("a"))];
        let err = QueryProjection::from_select(&sel).unwrap_err();
        assert_eq!(err.code(), Some("VT03005"));
    }

    #[test]
    fn test_subquery_in_group_by() {
        let mut sel = select(vec![SelectExpr::expr(Expr::col("a"))]);
        sel.group_by = vec![Expr::bindvar("__sq_1")];
        let err = QueryProjection::from_select(&sel).unwrap_err();
        assert_eq!(err.code(), Some("VT12001"));
    }

    #[test]
    fn test_order_by_alias_simplification() {
        let mut sel = select(vec![SelectExpr::aliased(
            Expr::BinaryOp {
                left: Box::new(Expr::col("a")),
                op: BinaryOperator::Add,
                right: Box::new(Expr::col("b")),
            },
            "total",
        )]);
        sel.order_by = vec![OrderExpr::asc(Expr::col("total"))];
        let qp = QueryProjection::from_select(&sel).unwrap();
        assert_eq!(qp.orderings.len(), 1);
        assert!(matches!(
            &qp.orderings[0].simplified,
            Expr::BinaryOp { .. }
        ));
        assert!(qp.can_push_down_sorting);
    }

    #[test]
    fn test_order_by_aggregate_blocks_pushdown() {
        let mut sel = select(vec![
            SelectExpr::expr(Expr::col("y")),
            SelectExpr::aliased(Expr::aggregate(AggrFunc::Sum, Expr::col("x")), "s"),
        ]);
        sel.group_by = vec![Expr::col("y")];
        sel.order_by = vec![OrderExpr::desc(Expr::col("s"))];
        let qp = QueryProjection::from_select(&sel).unwrap();
        assert!(!qp.can_push_down_sorting);
    }

    #[test]
    fn test_order_by_null_ignored() {
        let mut sel = select(vec![SelectExpr::expr(Expr::col("a"))]);
        sel.order_by = vec![OrderExpr::asc(Expr::Literal(storm_common::Value::Null))];
        let qp = QueryProjection::from_select(&sel).unwrap();
        assert!(qp.orderings.is_empty());
    }

    #[test]
    fn test_distinct_without_aggr_drops_groupings() {
        let mut sel = select(vec![SelectExpr::expr(Expr::col("a"))]);
        sel.distinct = true;
        sel.group_by = vec![Expr::col("a")];
        let qp = QueryProjection::from_select(&sel).unwrap();
        assert!(qp.groupings().is_empty());
        assert!(qp.needs_distinct());
    }

    #[test]
    fn test_distinct_pure_aggregate_needs_no_distinct() {
        let mut sel = select(vec![SelectExpr::expr(Expr::count_star())]);
        sel.distinct = true;
        let qp = QueryProjection::from_select(&sel).unwrap();
        assert!(!qp.needs_distinct());
    }

    #[test]
    fn test_aggregation_expressions_opcodes() {
        let mut sel = select(vec![
            SelectExpr::expr(Expr::col("y")),
            SelectExpr::expr(Expr::aggregate(AggrFunc::Sum, Expr::col("x"))),
            SelectExpr::expr(Expr::count_star()),
        ]);
        sel.group_by = vec![Expr::col("y")];
        let mut qp = QueryProjection::from_select(&sel).unwrap();
        let aggrs = qp.aggregation_expressions().unwrap();
        // y is a grouping column, so only the two aggregates come back.
        assert_eq!(aggrs.len(), 2);
        assert_eq!(aggrs[0].opcode, AggregateOpcode::Sum);
        assert_eq!(aggrs[0].index, Some(1));
        assert_eq!(aggrs[1].opcode, AggregateOpcode::CountStar);
    }

    #[test]
    fn test_non_grouping_column_becomes_any_value() {
        let sel = select(vec![
            SelectExpr::expr(Expr::col("y")),
            SelectExpr::expr(Expr::count_star()),
        ]);
        let mut qp = QueryProjection::from_select(&sel).unwrap();
        let aggrs = qp.aggregation_expressions().unwrap();
        assert_eq!(aggrs[0].opcode, AggregateOpcode::AnyValue);
    }

    #[test]
    fn test_order_by_hoists_missing_column() {
        let mut sel = select(vec![SelectExpr::expr(Expr::aggregate(
            AggrFunc::Sum,
            Expr::col("x"),
        ))]);
        sel.order_by = vec![OrderExpr::asc(Expr::col("y"))];
        let mut qp = QueryProjection::from_select(&sel).unwrap();
        let before = qp.select_exprs.len();
        qp.aggregation_expressions().unwrap();
        assert_eq!(qp.select_exprs.len(), before + 1);
        assert_eq!(qp.added_columns, 1);
        assert_eq!(qp.user_column_count(), 1);
    }

    #[test]
    fn test_complex_aggregate_expression_rejected() {
        let sel = select(vec![SelectExpr::expr(Expr::BinaryOp {
            left: Box::new(Expr::aggregate(AggrFunc::Sum, Expr::col("x"))),
            op: BinaryOperator::Add,
            right: Box::new(Expr::lit(1)),
        })]);
        let mut qp = QueryProjection::from_select(&sel).unwrap();
        let err = qp.aggregation_expressions().unwrap_err();
        assert_eq!(err.code(), Some("VT12001"));
    }

    #[test]
    fn test_rewrite_aggregates_to_offsets() {
        let sel = select(vec![
            SelectExpr::expr(Expr::aggregate(AggrFunc::Sum, Expr::col("x"))),
            SelectExpr::aliased(
                Expr::BinaryOp {
                    left: Box::new(Expr::aggregate(AggrFunc::Sum, Expr::col("x"))),
                    op: BinaryOperator::Div,
                    right: Box::new(Expr::count_star()),
                },
                "average",
            ),
        ]);
        let mut qp = QueryProjection::from_select(&sel).unwrap();
        qp.rewrite_aggregates_to_offsets().unwrap();

        // sum(x) reuses offset 0; count(*) was hoisted to a new column.
        assert_eq!(qp.select_exprs.len(), 3);
        assert_eq!(qp.added_columns, 1);
        let SelectExpr::Aliased { expr, .. } = &qp.select_exprs[1].col else {
            panic!("expected aliased expr");
        };
        let Expr::BinaryOp { left, right, .. } = expr else {
            panic!("expected binary op, got {}", expr);
        };
        assert!(matches!(**left, Expr::Offset { offset: 0, .. }));
        assert!(matches!(**right, Expr::Offset { offset: 2, .. }));
    }

    #[test]
    fn test_align_group_by_without_user_order() {
        let mut sel = select(vec![
            SelectExpr::expr(Expr::col("b")),
            SelectExpr::expr(Expr::col("a")),
            SelectExpr::expr(Expr::count_star()),
        ]);
        sel.group_by = vec![Expr::col("a"), Expr::col("b")];
        let mut qp = QueryProjection::from_select(&sel).unwrap();
        qp.align_group_by_and_order_by();
        // Groupings reordered to select order; orderings mirror them.
        assert_eq!(qp.groupings()[0].inner, Expr::col("b"));
        assert_eq!(qp.orderings.len(), 2);
        assert_eq!(qp.orderings[0].simplified, Expr::col("b"));
    }

    #[test]
    fn test_align_group_by_with_user_order() {
        let mut sel = select(vec![
            SelectExpr::expr(Expr::col("a")),
            SelectExpr::expr(Expr::col("b")),
            SelectExpr::expr(Expr::count_star()),
        ]);
        sel.group_by = vec![Expr::col("a"), Expr::col("b")];
        sel.order_by = vec![OrderExpr::asc(Expr::col("b"))];
        let mut qp = QueryProjection::from_select(&sel).unwrap();
        qp.align_group_by_and_order_by();
        // b leads (matches user order), a is appended to both lists.
        assert_eq!(qp.groupings()[0].inner, Expr::col("b"));
        assert_eq!(qp.groupings()[1].inner, Expr::col("a"));
        assert_eq!(qp.orderings.len(), 2);
    }

    #[test]
    fn test_star_blocks_cross_shard_expr_access() {
        let sel = select(vec![SelectExpr::Star]);
        let qp = QueryProjection::from_select(&sel).unwrap();
        assert!(qp.has_star);
        let err = qp.select_exprs[0].expr().unwrap_err();
        assert_eq!(err.code(), Some("VT12001"));
    }
}
