//! Route discovery: match WHERE predicates against a table's column
//! vindexes and pick the cheapest route.
//!
//! Predicates are indexed by column; each column vindex is checked for an
//! equality, an IN list, or a tuple-IN covering its column. Among the
//! matches the planner prefers single-shard plans, then unique multi-value
//! plans, breaking ties by vindex cost.

use std::sync::Arc;

use storm_engine::{PlannedValue, RoutePlan};
use storm_sql::{BinaryOperator, Expr};
use storm_vschema::{Destination, Table, TableType};

/// How selective a candidate plan is; lower ranks win.
fn rank(plan: &RoutePlan) -> u32 {
    match plan {
        RoutePlan::None => 0,
        RoutePlan::EqualUnique { .. } => 1,
        RoutePlan::In { .. } => 2,
        RoutePlan::MultiEqual { .. } => 3,
        RoutePlan::Equal { .. } => 4,
        _ => u32::MAX,
    }
}

fn plan_cost(plan: &RoutePlan) -> u32 {
    match plan {
        RoutePlan::EqualUnique { vindex, .. }
        | RoutePlan::Equal { vindex, .. }
        | RoutePlan::In { vindex, .. }
        | RoutePlan::MultiEqual { vindex, .. } => vindex.cost(),
        _ => 0,
    }
}

/// Convert a routable expression into a planned value.
fn planned_value(expr: &Expr) -> Option<PlannedValue> {
    match expr {
        Expr::Literal(v) => Some(PlannedValue::Literal(v.clone())),
        Expr::BindVar(name) => Some(PlannedValue::BindVar(name.clone())),
        Expr::Tuple(items) => Some(PlannedValue::List(
            items.iter().map(planned_value).collect::<Option<Vec<_>>>()?,
        )),
        _ => None,
    }
}

fn is_column(expr: &Expr, binding: &str, column: &str) -> bool {
    matches!(
        expr,
        Expr::Column { table, name }
            if name == column && table.as_deref().map_or(true, |t| t == binding)
    )
}

/// Discover the route for one table given the usable predicate conjuncts.
pub fn discover_route(
    table: &Arc<Table>,
    sharded: bool,
    binding: &str,
    conjuncts: &[&Expr],
) -> RoutePlan {
    if !sharded {
        return RoutePlan::Unsharded;
    }
    if table.table_type == TableType::Reference || table.source.is_some() {
        return RoutePlan::Reference;
    }
    if let Some(pin) = &table.pinned {
        return RoutePlan::ByDestination(Destination::KeyspaceId(pin.clone()));
    }

    let mut best: Option<RoutePlan> = None;
    for cv in &table.column_vindexes {
        // Multi-column vindexes route on their leading column.
        let column = &cv.columns[0];
        for conjunct in conjuncts {
            let Some(candidate) = match_conjunct(cv.vindex.clone(), binding, column, conjunct)
            else {
                continue;
            };
            let better = match &best {
                None => true,
                Some(current) => {
                    (rank(&candidate), plan_cost(&candidate))
                        < (rank(current), plan_cost(current))
                }
            };
            if better {
                best = Some(candidate);
            }
        }
    }
    best.unwrap_or(RoutePlan::Scatter)
}

fn match_conjunct(
    vindex: Arc<dyn storm_vindex::Vindex>,
    binding: &str,
    column: &str,
    conjunct: &Expr,
) -> Option<RoutePlan> {
    match conjunct {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => {
            let value = if is_column(left, binding, column) {
                right
            } else if is_column(right, binding, column) {
                left
            } else {
                return None;
            };
            // Equality with NULL matches no rows at all.
            if value.is_null_literal() {
                return Some(RoutePlan::None);
            }
            let value = planned_value(value)?;
            if vindex.is_unique() {
                Some(RoutePlan::EqualUnique { vindex, value })
            } else {
                Some(RoutePlan::Equal { vindex, value })
            }
        }
        Expr::InList {
            expr,
            list,
            negated: false,
        } => {
            if is_column(expr, binding, column) {
                let values = if list.len() == 1 {
                    planned_value(&list[0])?
                } else {
                    PlannedValue::List(
                        list.iter().map(planned_value).collect::<Option<Vec<_>>>()?,
                    )
                };
                return Some(RoutePlan::In { vindex, values });
            }
            // Tuple-IN: (a, b) IN ((1, 2), (3, 4)) routes on the vindex
            // column's position within the tuple.
            if let Expr::Tuple(cols) = expr.as_ref() {
                let pos = cols.iter().position(|c| is_column(c, binding, column))?;
                let mut values = Vec::with_capacity(list.len());
                for item in list {
                    let Expr::Tuple(items) = item else { return None };
                    values.push(planned_value(items.get(pos)?)?);
                }
                return Some(RoutePlan::MultiEqual { vindex, values });
            }
            None
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storm_vschema::{RawVSchema, VSchema};

    fn table() -> Arc<Table> {
        let raw: RawVSchema = serde_json::from_str(
            r#"{
            "keyspaces": {
                "ks": {
                    "sharded": true,
                    "vindexes": {
                        "hash": { "type": "hash" },
                        "name_idx": {
                            "type": "lookup",
                            "params": { "table": "lk.t_name", "from": "name", "to": "keyspace_id" }
                        }
                    },
                    "tables": {
                        "t": {
                            "column_vindexes": [
                                { "column": "id", "name": "hash" },
                                { "column": "name", "name": "name_idx" }
                            ]
                        }
                    }
                },
                "lk": { "sharded": false, "tables": { "t_name": {} } }
            }
        }"#,
        )
        .unwrap();
        let vschema = VSchema::build(&raw).unwrap();
        vschema.find_table(Some("ks"), "t").unwrap()
    }

    #[test]
    fn test_equality_on_unique_vindex() {
        let t = table();
        let conjunct = Expr::eq(Expr::col("id"), Expr::bindvar("v1"));
        let plan = discover_route(&t, true, "t", &[&conjunct]);
        assert!(matches!(plan, RoutePlan::EqualUnique { .. }));
    }

    #[test]
    fn test_reversed_equality() {
        let t = table();
        let conjunct = Expr::eq(Expr::lit(5), Expr::qual_col("t", "id"));
        let plan = discover_route(&t, true, "t", &[&conjunct]);
        assert!(matches!(plan, RoutePlan::EqualUnique { .. }));
    }

    #[test]
    fn test_in_list() {
        let t = table();
        let conjunct = Expr::InList {
            expr: Box::new(Expr::col("id")),
            list: vec![Expr::lit(1), Expr::lit(2)],
            negated: false,
        };
        let plan = discover_route(&t, true, "t", &[&conjunct]);
        assert!(matches!(plan, RoutePlan::In { .. }));
    }

    #[test]
    fn test_tuple_in_multi_equal() {
        let t = table();
        let conjunct = Expr::InList {
            expr: Box::new(Expr::Tuple(vec![Expr::col("id"), Expr::col("x")])),
            list: vec![
                Expr::Tuple(vec![Expr::lit(1), Expr::lit(10)]),
                Expr::Tuple(vec![Expr::lit(2), Expr::lit(20)]),
            ],
            negated: false,
        };
        let plan = discover_route(&t, true, "t", &[&conjunct]);
        let RoutePlan::MultiEqual { values, .. } = plan else {
            panic!("expected MultiEqual");
        };
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn test_null_equality_routes_nowhere() {
        let t = table();
        let conjunct = Expr::eq(Expr::col("id"), Expr::Literal(storm_common::Value::Null));
        let plan = discover_route(&t, true, "t", &[&conjunct]);
        assert!(matches!(plan, RoutePlan::None));
    }

    #[test]
    fn test_cheaper_vindex_preferred() {
        let t = table();
        // Both columns have equality predicates; hash (cost 1) beats the
        // lookup (cost 20).
        let by_id = Expr::eq(Expr::col("id"), Expr::lit(1));
        let by_name = Expr::eq(Expr::col("name"), Expr::lit("x"));
        let plan = discover_route(&t, true, "t", &[&by_name, &by_id]);
        let RoutePlan::EqualUnique { vindex, .. } = plan else {
            panic!("expected EqualUnique");
        };
        assert_eq!(vindex.name(), "hash");
    }

    #[test]
    fn test_no_match_scatters() {
        let t = table();
        let conjunct = Expr::eq(Expr::col("other"), Expr::lit(1));
        let plan = discover_route(&t, true, "t", &[&conjunct]);
        assert!(matches!(plan, RoutePlan::Scatter));

        let plan = discover_route(&t, true, "t", &[]);
        assert!(matches!(plan, RoutePlan::Scatter));
    }

    #[test]
    fn test_unsharded() {
        let t = table();
        let plan = discover_route(&t, false, "t", &[]);
        assert!(matches!(plan, RoutePlan::Unsharded));
    }
}
