//! Residual relational primitives: sort, limit, distinct, projection,
//! filter, and UNION concatenation.
//!
//! These run above routes on the gateway itself, so they operate on
//! materialized results and evaluate offset-rewritten expressions only.

use std::collections::HashSet;

use storm_common::prelude::*;
use storm_sql::Expr;

use crate::eval::{evaluate, is_truthy, EvalEnv};
use crate::scatter::{cmp_rows, OrderSpec};

/// Bounded in-memory sort.
#[derive(Debug, Clone)]
pub struct MemorySort {
    pub ordering: Vec<OrderSpec>,
    /// Rows beyond this fail the query: spill is not supported.
    pub max_rows: usize,
}

impl MemorySort {
    pub fn sort(&self, mut input: QueryResult) -> Result<QueryResult> {
        if input.rows.len() > self.max_rows {
            return Err(Error::ResourceExhausted(format!(
                "in-memory sort limit exceeded: {} rows (max {})",
                input.rows.len(),
                self.max_rows
            )));
        }
        input
            .rows
            .sort_by(|a, b| cmp_rows(a, b, &self.ordering));
        Ok(input)
    }
}

/// Row-count limit with offset.
#[derive(Debug, Clone)]
pub struct LimitClip {
    pub count: u64,
    pub offset: u64,
}

impl LimitClip {
    pub fn clip(&self, mut input: QueryResult) -> QueryResult {
        let offset = self.offset as usize;
        let count = self.count as usize;
        if offset >= input.rows.len() {
            input.rows.clear();
        } else {
            input.rows.drain(..offset);
            input.rows.truncate(count);
        }
        input
    }
}

fn row_key(row: &Row) -> String {
    let mut key = String::new();
    for value in &row.values {
        key.push_str(&format!("{:?}", value));
        key.push('\u{0}');
    }
    key
}

/// Whole-row deduplication.
#[derive(Debug, Clone, Default)]
pub struct DistinctFilter;

impl DistinctFilter {
    pub fn dedup(&self, mut input: QueryResult) -> QueryResult {
        let mut seen = HashSet::new();
        input.rows.retain(|row| seen.insert(row_key(row)));
        input
    }
}

/// Evaluate output expressions over input rows.
#[derive(Debug, Clone)]
pub struct ProjectionEval {
    pub exprs: Vec<Expr>,
    pub names: Vec<String>,
}

impl ProjectionEval {
    pub fn project(&self, input: QueryResult, bindvars: &BindVars) -> Result<QueryResult> {
        let fields = self
            .names
            .iter()
            .map(|name| Field::new(name.clone(), ""))
            .collect();
        let mut out = QueryResult::new(fields);
        for row in &input.rows {
            let env = EvalEnv::new(&row.values, bindvars);
            let values = self
                .exprs
                .iter()
                .map(|e| evaluate(env, e))
                .collect::<Result<Vec<_>>>()?;
            out.rows.push(Row::new(values));
        }
        Ok(out)
    }
}

/// Residual predicate over input rows.
#[derive(Debug, Clone)]
pub struct FilterEval {
    pub predicate: Expr,
}

impl FilterEval {
    pub fn filter(&self, mut input: QueryResult, bindvars: &BindVars) -> Result<QueryResult> {
        let mut kept = Vec::with_capacity(input.rows.len());
        for row in input.rows {
            let env = EvalEnv::new(&row.values, bindvars);
            if is_truthy(&evaluate(env, &self.predicate)?) {
                kept.push(row);
            }
        }
        input.rows = kept;
        Ok(input)
    }
}
