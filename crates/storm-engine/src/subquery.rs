//! Uncorrelated subquery execution.
//!
//! The inner plan runs once; its result materializes into `__sq_N` bind
//! variables consumed by the outer plan. IN-subqueries short-circuit to an
//! empty result when the inner side produces no rows.

use storm_common::prelude::*;

use crate::primitive::Primitive;
use crate::vcursor::VCursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubqueryMode {
    /// Scalar value: `x = (select ...)`.
    Value,
    /// `x IN (select ...)`.
    In,
    /// `x NOT IN (select ...)`.
    NotIn,
    /// `EXISTS (select ...)`.
    Exists,
}

#[derive(Debug)]
pub struct UncorrelatedSubquery {
    pub mode: SubqueryMode,
    pub subquery: Box<Primitive>,
    pub outer: Box<Primitive>,
    /// Name of the materialized bind variable, e.g. `__sq_1`.
    pub bindvar: String,
    /// Companion boolean, e.g. `__sq_has_values_1`.
    pub has_values_bindvar: String,
}

impl UncorrelatedSubquery {
    pub async fn execute(
        &self,
        ctx: &ExecContext,
        vcursor: &VCursor,
        bindvars: &BindVars,
        want_fields: bool,
    ) -> Result<QueryResult> {
        let inner = self
            .subquery
            .execute(ctx, vcursor, bindvars, false)
            .await?;

        let mut outer_bindvars = bindvars.clone();
        let has_values = !inner.rows.is_empty();
        outer_bindvars.insert(
            self.has_values_bindvar.clone(),
            Value::Int64(if has_values { 1 } else { 0 }),
        );

        match self.mode {
            SubqueryMode::Value => {
                let value = match inner.rows.len() {
                    0 => Value::Null,
                    1 => inner.rows[0]
                        .get(0)
                        .cloned()
                        .ok_or_else(|| Error::internal("subquery row has no columns"))?,
                    _ => {
                        return Err(Error::invalid_argument(
                            "subquery returned more than one row",
                        ))
                    }
                };
                outer_bindvars.insert(self.bindvar.clone(), value);
            }
            SubqueryMode::In => {
                if !has_values {
                    // IN over an empty set selects nothing; skip the outer
                    // query entirely.
                    return Ok(QueryResult::default());
                }
                outer_bindvars.insert(self.bindvar.clone(), first_column(&inner)?);
            }
            SubqueryMode::NotIn => {
                outer_bindvars.insert(self.bindvar.clone(), first_column(&inner)?);
            }
            SubqueryMode::Exists => {
                outer_bindvars.insert(
                    self.bindvar.clone(),
                    Value::Int64(if has_values { 1 } else { 0 }),
                );
            }
        }

        self.outer
            .execute(ctx, vcursor, &outer_bindvars, want_fields)
            .await
    }
}

fn first_column(result: &QueryResult) -> Result<Value> {
    let values = result
        .rows
        .iter()
        .map(|row| {
            row.get(0)
                .cloned()
                .ok_or_else(|| Error::internal("subquery row has no columns"))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Value::Tuple(values))
}
