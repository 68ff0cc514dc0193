//! In-memory tablet.
//!
//! A [`QueryService`] implementation executing fragment ASTs against
//! in-memory tables: filtered scans, per-shard partial aggregation, ORDER
//! BY, LIMIT, and DML with duplicate-key detection. It stands in for a real
//! MySQL tablet in tests and exposes instrumentation counters so tests can
//! assert how many fragments a plan actually dispatched.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use storm_common::metrics::Counter;
use storm_common::prelude::*;
use storm_sql::{
    AggrFunc, Delete, Expr, Insert, OrderExpr, Select, SelectExpr, Statement, TableRef, Update,
};
use storm_vschema::ResolvedShard;

use crate::eval::{evaluate, is_truthy, EvalEnv};
use crate::scatter::QueryService;

struct TableData {
    columns: Vec<String>,
    unique: Vec<usize>,
    rows: Vec<Row>,
    /// Sequence tables track the next value instead of rows.
    sequence: Option<u64>,
}

pub struct MemoryTablet {
    shard: String,
    tables: Mutex<HashMap<String, TableData>>,
    /// Fragments executed against this tablet.
    pub queries: Counter,
    /// Fragments that performed grouped partial aggregation.
    pub partial_aggregations: Counter,
}

impl MemoryTablet {
    pub fn new(shard: impl Into<String>) -> Self {
        Self {
            shard: shard.into(),
            tables: Mutex::new(HashMap::new()),
            queries: Counter::new(),
            partial_aggregations: Counter::new(),
        }
    }

    pub fn shard(&self) -> &str {
        &self.shard
    }

    pub fn create_table(&self, name: &str, columns: &[&str], unique: &[&str]) {
        let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        let unique = unique
            .iter()
            .filter_map(|u| columns.iter().position(|c| c == u))
            .collect();
        self.tables.lock().insert(
            name.to_string(),
            TableData {
                columns,
                unique,
                rows: Vec::new(),
                sequence: None,
            },
        );
    }

    pub fn create_sequence(&self, name: &str, start: u64) {
        self.tables.lock().insert(
            name.to_string(),
            TableData {
                columns: vec!["next_id".to_string()],
                unique: vec![],
                rows: Vec::new(),
                sequence: Some(start),
            },
        );
    }

    /// Direct row injection for test setup, bypassing vindex routing.
    pub fn seed_row(&self, table: &str, values: Vec<Value>) {
        let mut tables = self.tables.lock();
        if let Some(td) = tables.get_mut(table) {
            td.rows.push(Row::new(values));
        }
    }

    /// Current rows of a table, for assertions.
    pub fn table_rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .lock()
            .get(table)
            .map(|td| td.rows.clone())
            .unwrap_or_default()
    }

    fn exec_select(&self, select: &Select, bindvars: &BindVars) -> Result<QueryResult> {
        // Table-less SELECT evaluates its expressions over a single row.
        if select.from.is_empty() {
            let env = EvalEnv::new(&[], bindvars);
            let mut values = Vec::new();
            let mut fields = Vec::new();
            for se in &select.exprs {
                let SelectExpr::Aliased { expr, .. } = se else {
                    return Err(Error::unsupported("'*' in a table-less SELECT"));
                };
                fields.push(Field::new(se.column_name(), ""));
                values.push(evaluate(env, expr)?);
            }
            return Ok(QueryResult::with_rows(fields, vec![Row::new(values)]));
        }

        let table_name = from_table(select)?;
        let mut tables = self.tables.lock();
        let td = tables
            .get_mut(&table_name)
            .ok_or_else(|| Error::not_found("table", &table_name))?;

        // Sequence fetch: select next_value(n) from seq_table.
        if let Some(next) = td.sequence {
            if let Some(count) = sequence_fetch_count(select) {
                td.sequence = Some(next + count);
                return Ok(QueryResult::with_rows(
                    vec![Field::new("nextval", "INT64")],
                    vec![Row::new(vec![Value::Int64(next as i64)])],
                ));
            }
        }

        let mut matching: Vec<&Row> = Vec::new();
        for row in &td.rows {
            let keep = match &select.where_clause {
                Some(predicate) => {
                    let env = EvalEnv::with_columns(bindvars, &td.columns, &row.values);
                    is_truthy(&evaluate(env, predicate)?)
                }
                None => true,
            };
            if keep {
                matching.push(row);
            }
        }

        let has_aggr = select.exprs.iter().any(|se| match se {
            SelectExpr::Aliased { expr, .. } => expr.contains_aggregation(),
            SelectExpr::Star => false,
        });

        let mut output: Vec<(Vec<Value>, Row)>;
        let fields = self.output_fields(select, &td.columns);

        if has_aggr || !select.group_by.is_empty() {
            self.partial_aggregations.inc();
            output = aggregate_groups(select, bindvars, &td.columns, &matching)?;
        } else {
            output = Vec::with_capacity(matching.len());
            for row in &matching {
                let env = EvalEnv::with_columns(bindvars, &td.columns, &row.values);
                let sort_keys = eval_order_keys(&select.order_by, env)?;
                let out_row = project_row(select, env)?;
                output.push((sort_keys, out_row));
            }
        }

        sort_output(&mut output, &select.order_by);
        let mut rows: Vec<Row> = output.into_iter().map(|(_, row)| row).collect();

        if select.distinct {
            let mut seen = HashSet::new();
            rows.retain(|row| seen.insert(format!("{:?}", row.values)));
        }
        if let Some(limit) = &select.limit {
            let offset = limit.offset as usize;
            if offset >= rows.len() {
                rows.clear();
            } else {
                rows.drain(..offset);
                rows.truncate(limit.count as usize);
            }
        }

        Ok(QueryResult::with_rows(fields, rows))
    }

    fn output_fields(&self, select: &Select, columns: &[String]) -> Vec<Field> {
        let mut fields = Vec::new();
        for se in &select.exprs {
            match se {
                SelectExpr::Star => {
                    fields.extend(columns.iter().map(|c| Field::new(c.clone(), "")));
                }
                other => fields.push(Field::new(other.column_name(), "")),
            }
        }
        fields
    }

    fn exec_insert(&self, insert: &Insert, bindvars: &BindVars) -> Result<QueryResult> {
        let mut tables = self.tables.lock();
        let td = tables
            .get_mut(&insert.table.name)
            .ok_or_else(|| Error::not_found("table", &insert.table.name))?;

        let positions: Vec<Option<usize>> = td
            .columns
            .iter()
            .map(|col| insert.columns.iter().position(|c| c == col))
            .collect();

        let mut affected = 0;
        'rows: for row_exprs in &insert.rows {
            let values: Vec<Value> = row_exprs
                .iter()
                .map(|e| evaluate(EvalEnv::new(&[], bindvars), e))
                .collect::<Result<_>>()?;
            let full_row: Vec<Value> = positions
                .iter()
                .map(|pos| pos.and_then(|p| values.get(p).cloned()).unwrap_or(Value::Null))
                .collect();

            for &ucol in &td.unique {
                let new = &full_row[ucol];
                if new.is_null() {
                    continue;
                }
                let conflict = td.rows.iter().any(|existing| {
                    existing
                        .get(ucol)
                        .is_some_and(|v| v.sort_cmp(new) == std::cmp::Ordering::Equal)
                });
                if conflict {
                    if insert.ignore {
                        continue 'rows;
                    }
                    return Err(Error::already_exists(
                        "row",
                        format!("Duplicate entry {} for key '{}'", new, td.columns[ucol]),
                    ));
                }
            }

            td.rows.push(Row::new(full_row));
            affected += 1;
        }

        Ok(QueryResult {
            rows_affected: affected,
            ..Default::default()
        })
    }

    fn exec_update(&self, update: &Update, bindvars: &BindVars) -> Result<QueryResult> {
        let mut tables = self.tables.lock();
        let td = tables
            .get_mut(&update.table.name)
            .ok_or_else(|| Error::not_found("table", &update.table.name))?;

        let mut affected = 0;
        let columns = td.columns.clone();
        for row in &mut td.rows {
            let env = EvalEnv::with_columns(bindvars, &columns, &row.values);
            let keep = match &update.where_clause {
                Some(predicate) => is_truthy(&evaluate(env, predicate)?),
                None => true,
            };
            if !keep {
                continue;
            }
            let mut updates = Vec::new();
            for (col, expr) in &update.assignments {
                let idx = columns
                    .iter()
                    .position(|c| c == col)
                    .ok_or_else(|| Error::not_found("column", col))?;
                updates.push((idx, evaluate(env, expr)?));
            }
            for (idx, value) in updates {
                row.values[idx] = value;
            }
            affected += 1;
        }
        Ok(QueryResult {
            rows_affected: affected,
            ..Default::default()
        })
    }

    fn exec_delete(&self, delete: &Delete, bindvars: &BindVars) -> Result<QueryResult> {
        let mut tables = self.tables.lock();
        let td = tables
            .get_mut(&delete.table.name)
            .ok_or_else(|| Error::not_found("table", &delete.table.name))?;

        let columns = td.columns.clone();
        let before = td.rows.len();
        let mut err = None;
        td.rows.retain(|row| {
            if err.is_some() {
                return true;
            }
            match &delete.where_clause {
                Some(predicate) => {
                    let env = EvalEnv::with_columns(bindvars, &columns, &row.values);
                    match evaluate(env, predicate) {
                        Ok(v) => !is_truthy(&v),
                        Err(e) => {
                            err = Some(e);
                            true
                        }
                    }
                }
                None => false,
            }
        });
        if let Some(err) = err {
            return Err(err);
        }
        Ok(QueryResult {
            rows_affected: (before - td.rows.len()) as u64,
            ..Default::default()
        })
    }
}

#[async_trait]
impl QueryService for MemoryTablet {
    async fn execute(
        &self,
        ctx: &ExecContext,
        _shard: &ResolvedShard,
        stmt: &Statement,
        bindvars: &BindVars,
    ) -> Result<QueryResult> {
        ctx.checked()?;
        self.queries.inc();
        match stmt {
            Statement::Select(select) => self.exec_select(select, bindvars),
            Statement::Insert(insert) => self.exec_insert(insert, bindvars),
            Statement::Update(update) => self.exec_update(update, bindvars),
            Statement::Delete(delete) => self.exec_delete(delete, bindvars),
            Statement::Union(_) => Err(Error::unsupported("union fragments on tablets")),
        }
    }
}

fn from_table(select: &Select) -> Result<String> {
    match select.from.first() {
        Some(TableRef::Named { table, .. }) => Ok(table.name.clone()),
        _ => Err(Error::unsupported("fragment without a named table")),
    }
}

fn sequence_fetch_count(select: &Select) -> Option<u64> {
    match select.exprs.first() {
        Some(SelectExpr::Aliased { expr, .. }) => match expr {
            Expr::FuncCall { name, args } if name == "next_value" => match args.first() {
                Some(Expr::Literal(Value::Int64(n))) => Some(*n as u64),
                _ => Some(1),
            },
            _ => None,
        },
        _ => None,
    }
}

fn eval_order_keys(order_by: &[OrderExpr], env: EvalEnv<'_>) -> Result<Vec<Value>> {
    order_by.iter().map(|o| evaluate(env, &o.expr)).collect()
}

fn sort_output(output: &mut [(Vec<Value>, Row)], order_by: &[OrderExpr]) {
    if order_by.is_empty() {
        return;
    }
    output.sort_by(|(a, _), (b, _)| {
        for (i, order) in order_by.iter().enumerate() {
            let ord = match (a.get(i), b.get(i)) {
                (Some(x), Some(y)) => x.sort_cmp(y),
                _ => std::cmp::Ordering::Equal,
            };
            let ord = if order.desc { ord.reverse() } else { ord };
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        std::cmp::Ordering::Equal
    });
}

fn project_row(select: &Select, env: EvalEnv<'_>) -> Result<Row> {
    let mut values = Vec::new();
    for se in &select.exprs {
        match se {
            SelectExpr::Star => {
                let (_, row_values) = env
                    .columns
                    .ok_or_else(|| Error::internal("star projection without columns"))?;
                values.extend(row_values.iter().cloned());
            }
            SelectExpr::Aliased { expr, .. } => values.push(evaluate(env, expr)?),
        }
    }
    Ok(Row::new(values))
}

/// Grouped partial aggregation over the matching rows.
fn aggregate_groups(
    select: &Select,
    bindvars: &BindVars,
    columns: &[String],
    matching: &[&Row],
) -> Result<Vec<(Vec<Value>, Row)>> {
    // Group rows by the GROUP BY key, preserving first-seen order.
    let mut group_order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<&Row>> = HashMap::new();
    for row in matching {
        let env = EvalEnv::with_columns(bindvars, columns, &row.values);
        let key_values: Vec<Value> = select
            .group_by
            .iter()
            .map(|e| evaluate(env, e))
            .collect::<Result<_>>()?;
        let key = format!("{:?}", key_values);
        if !groups.contains_key(&key) {
            group_order.push(key.clone());
        }
        groups.entry(key).or_default().push(row);
    }
    // A pure aggregate over no groups still produces one output row.
    if select.group_by.is_empty() && groups.is_empty() {
        group_order.push(String::new());
        groups.insert(String::new(), Vec::new());
    }

    let mut output = Vec::with_capacity(group_order.len());
    for key in group_order {
        let rows = &groups[&key];
        let head_env = rows.first().map(|row| {
            EvalEnv::with_columns(bindvars, columns, &row.values)
        });

        let mut values = Vec::new();
        for se in &select.exprs {
            let SelectExpr::Aliased { expr, .. } = se else {
                return Err(Error::unsupported("star in aggregation fragment"));
            };
            values.push(eval_aggregate_expr(expr, bindvars, columns, rows, head_env)?);
        }

        let sort_keys = match head_env {
            Some(env) => eval_order_keys(&select.order_by, env)?,
            None => vec![Value::Null; select.order_by.len()],
        };
        output.push((sort_keys, Row::new(values)));
    }
    Ok(output)
}

fn eval_aggregate_expr(
    expr: &Expr,
    bindvars: &BindVars,
    columns: &[String],
    rows: &[&Row],
    head_env: Option<EvalEnv<'_>>,
) -> Result<Value> {
    if let Expr::Aggregate {
        func,
        arg,
        distinct,
    } = expr
    {
        let mut acc = Value::Null;
        let mut count: i64 = 0;
        let mut seen = HashSet::new();
        for row in rows {
            let env = EvalEnv::with_columns(bindvars, columns, &row.values);
            let value = match arg {
                Some(arg) => evaluate(env, arg)?,
                None => Value::Int64(1),
            };
            if value.is_null() {
                continue;
            }
            if *distinct && !seen.insert(format!("{:?}", value)) {
                continue;
            }
            count += 1;
            match func {
                AggrFunc::Count => {}
                AggrFunc::Sum | AggrFunc::Avg => {
                    acc = match (&acc, &value) {
                        (Value::Null, v) => (*v).clone(),
                        (a, b) => match (a.as_i64(), b.as_i64()) {
                            (Some(x), Some(y)) => Value::Int64(x + y),
                            _ => Value::Float64(
                                a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0),
                            ),
                        },
                    };
                }
                AggrFunc::Min => {
                    if acc.is_null() || value.sort_cmp(&acc) == std::cmp::Ordering::Less {
                        acc = value;
                    }
                }
                AggrFunc::Max => {
                    if acc.is_null() || value.sort_cmp(&acc) == std::cmp::Ordering::Greater {
                        acc = value;
                    }
                }
            }
        }
        return Ok(match func {
            AggrFunc::Count => Value::Int64(count),
            AggrFunc::Avg => match (acc.as_f64(), count) {
                (Some(total), n) if n > 0 => Value::Float64(total / n as f64),
                _ => Value::Null,
            },
            _ => acc,
        });
    }

    match head_env {
        Some(env) => evaluate(env, expr),
        None => Ok(Value::Null),
    }
}
