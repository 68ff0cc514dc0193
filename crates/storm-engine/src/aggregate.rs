//! Merging aggregators.
//!
//! Shards compute partial aggregates; these primitives merge them. The
//! ordered variant assumes its input arrives sorted by the grouping key
//! (the planner aligns GROUP BY with the pushed-down ORDER BY), so groups
//! are contiguous and merging is a single pass. Distinct aggregates receive
//! raw values from the shards and dedup across the whole group before
//! merging.

use std::cmp::Ordering;
use std::collections::HashSet;

use storm_common::prelude::*;
use storm_sql::AggregateOpcode;

/// One aggregation applied at a column of the input.
#[derive(Debug, Clone)]
pub struct AggregateParam {
    pub opcode: AggregateOpcode,
    pub col: usize,
    pub alias: String,
}

/// State for one aggregate column within one group.
enum AggrState {
    Acc(Value),
    Distinct(HashSet<String>),
}

fn distinct_key(value: &Value) -> String {
    format!("{:?}", value)
}

fn numeric_add(acc: &Value, v: &Value) -> Result<Value> {
    match (acc, v) {
        (Value::Null, v) => Ok(v.clone()),
        (acc, Value::Null) => Ok(acc.clone()),
        (a, b) => {
            if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
                match x.checked_add(y) {
                    Some(sum) => Ok(Value::Int64(sum)),
                    None => Ok(Value::Float64(x as f64 + y as f64)),
                }
            } else if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
                Ok(Value::Float64(x + y))
            } else {
                Err(Error::invalid_argument(format!(
                    "cannot sum {} and {}",
                    a, b
                )))
            }
        }
    }
}

impl AggrState {
    fn new(opcode: AggregateOpcode) -> Self {
        if opcode.is_distinct() {
            AggrState::Distinct(HashSet::new())
        } else {
            AggrState::Acc(Value::Null)
        }
    }

    fn add(&mut self, opcode: AggregateOpcode, value: &Value) -> Result<()> {
        match self {
            AggrState::Distinct(seen) => {
                if !value.is_null() {
                    seen.insert(distinct_key(value));
                }
                Ok(())
            }
            AggrState::Acc(acc) => {
                match opcode {
                    AggregateOpcode::Sum
                    | AggregateOpcode::Count
                    | AggregateOpcode::CountStar => {
                        *acc = numeric_add(acc, value)?;
                    }
                    AggregateOpcode::Min => {
                        if acc.is_null()
                            || (!value.is_null() && value.sort_cmp(acc) == Ordering::Less)
                        {
                            *acc = value.clone();
                        }
                    }
                    AggregateOpcode::Max => {
                        if acc.is_null()
                            || (!value.is_null() && value.sort_cmp(acc) == Ordering::Greater)
                        {
                            *acc = value.clone();
                        }
                    }
                    AggregateOpcode::AnyValue => {
                        if acc.is_null() {
                            *acc = value.clone();
                        }
                    }
                    AggregateOpcode::SumDistinct | AggregateOpcode::CountDistinct => {
                        unreachable!("distinct opcodes use Distinct state")
                    }
                }
                Ok(())
            }
        }
    }

    fn finish(self, opcode: AggregateOpcode, empty_input: bool) -> Value {
        match self {
            AggrState::Distinct(seen) => match opcode {
                AggregateOpcode::CountDistinct => Value::Int64(seen.len() as i64),
                AggregateOpcode::SumDistinct => {
                    // Keys are Debug forms of scalar values; recover the
                    // numeric ones for the sum.
                    let mut acc = Value::Null;
                    for key in seen {
                        if let Some(v) = parse_distinct_numeric(&key) {
                            acc = numeric_add(&acc, &v).unwrap_or(acc);
                        }
                    }
                    acc
                }
                _ => unreachable!(),
            },
            AggrState::Acc(acc) => {
                if acc.is_null()
                    && empty_input
                    && matches!(
                        opcode,
                        AggregateOpcode::Count | AggregateOpcode::CountStar
                    )
                {
                    return Value::Int64(0);
                }
                acc
            }
        }
    }
}

fn parse_distinct_numeric(key: &str) -> Option<Value> {
    let inner = key
        .strip_prefix("Int64(")
        .or_else(|| key.strip_prefix("UInt64("))
        .or_else(|| key.strip_prefix("Float64("))?
        .strip_suffix(')')?;
    if key.starts_with("Float64") {
        inner.parse::<f64>().ok().map(Value::Float64)
    } else {
        inner.parse::<i64>().ok().map(Value::Int64)
    }
}

/// Merge a run of rows belonging to one group into the output row.
fn merge_group(
    rows: &[Row],
    aggregates: &[AggregateParam],
) -> Result<Row> {
    let mut out = rows[0].clone();
    for param in aggregates {
        let mut state = AggrState::new(param.opcode);
        for row in rows {
            let value = row
                .get(param.col)
                .ok_or_else(|| Error::internal("aggregate column out of bounds"))?;
            state.add(param.opcode, value)?;
        }
        out.values[param.col] = state.finish(param.opcode, rows.is_empty());
    }
    Ok(out)
}

/// Streaming merge aggregator over an input sorted by the grouping key.
#[derive(Debug, Clone)]
pub struct OrderedAggregate {
    pub group_cols: Vec<usize>,
    pub aggregates: Vec<AggregateParam>,
}

impl OrderedAggregate {
    pub fn merge(&self, input: QueryResult) -> Result<QueryResult> {
        let mut out = QueryResult::new(input.fields.clone());
        let mut group: Vec<Row> = Vec::new();
        for row in input.rows {
            let same = group.first().is_some_and(|head| {
                self.group_cols.iter().all(|&col| {
                    match (head.get(col), row.get(col)) {
                        (Some(a), Some(b)) => a.sort_cmp(b) == Ordering::Equal,
                        _ => false,
                    }
                })
            });
            if same || group.is_empty() {
                group.push(row);
            } else {
                out.rows.push(merge_group(&group, &self.aggregates)?);
                group = vec![row];
            }
        }
        if !group.is_empty() {
            out.rows.push(merge_group(&group, &self.aggregates)?);
        }
        Ok(out)
    }
}

/// Aggregator without grouping: the whole input merges to one row.
#[derive(Debug, Clone)]
pub struct ScalarAggregate {
    pub aggregates: Vec<AggregateParam>,
}

impl ScalarAggregate {
    pub fn merge(&self, input: QueryResult) -> Result<QueryResult> {
        let mut out = QueryResult::new(input.fields.clone());
        if input.rows.is_empty() {
            // Aggregates over empty input produce one row: zero counts,
            // NULL everything else.
            let width = input.fields.len().max(
                self.aggregates
                    .iter()
                    .map(|a| a.col + 1)
                    .max()
                    .unwrap_or(0),
            );
            let mut row = Row::new(vec![Value::Null; width]);
            for param in &self.aggregates {
                if matches!(
                    param.opcode,
                    AggregateOpcode::Count
                        | AggregateOpcode::CountStar
                        | AggregateOpcode::CountDistinct
                ) {
                    row.values[param.col] = Value::Int64(0);
                }
            }
            out.rows.push(row);
            return Ok(out);
        }
        out.rows.push(merge_group(&input.rows, &self.aggregates)?);
        Ok(out)
    }
}
