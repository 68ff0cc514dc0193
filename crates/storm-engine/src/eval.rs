//! Runtime expression evaluation.
//!
//! Residual expressions above routes are evaluated against result rows
//! (offset references) and bind variables. The in-memory tablet reuses the
//! same evaluator with a column environment so fragment WHERE clauses can
//! reference columns by name.

use std::cmp::Ordering;

use storm_common::prelude::*;
use storm_sql::{BinaryOperator, Expr, UnaryOperator};

/// Evaluation environment: an input row (for offset references), bind
/// variables, and optionally named columns for fragment evaluation.
#[derive(Clone, Copy)]
pub struct EvalEnv<'a> {
    pub row: &'a [Value],
    pub bindvars: &'a BindVars,
    pub columns: Option<(&'a [String], &'a [Value])>,
}

impl<'a> EvalEnv<'a> {
    pub fn new(row: &'a [Value], bindvars: &'a BindVars) -> Self {
        Self {
            row,
            bindvars,
            columns: None,
        }
    }

    pub fn with_columns(
        bindvars: &'a BindVars,
        names: &'a [String],
        values: &'a [Value],
    ) -> Self {
        Self {
            row: &[],
            bindvars,
            columns: Some((names, values)),
        }
    }

    fn column(&self, name: &str) -> Result<Value> {
        let Some((names, values)) = self.columns else {
            return Err(Error::internal(format!(
                "unresolved column {} in residual expression",
                name
            )));
        };
        names
            .iter()
            .position(|n| n == name)
            .and_then(|i| values.get(i).cloned())
            .ok_or_else(|| Error::not_found("column", name))
    }
}

/// MySQL-style truthiness: non-zero numbers are true, NULL is false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Int64(v) => *v != 0,
        Value::UInt64(v) => *v != 0,
        Value::Float64(v) => *v != 0.0,
        Value::Text(s) => !s.is_empty() && s != "0",
        Value::Bytes(b) => !b.is_empty(),
        Value::Tuple(_) => false,
    }
}

fn bool_value(b: bool) -> Value {
    Value::Int64(if b { 1 } else { 0 })
}

/// Evaluate an expression in the given environment.
pub fn evaluate(env: EvalEnv<'_>, expr: &Expr) -> Result<Value> {
    match expr {
        Expr::Offset { offset, original } => env.row.get(*offset).cloned().ok_or_else(|| {
            Error::internal(format!(
                "offset {} ({}) out of bounds for row of {} columns",
                offset,
                original,
                env.row.len()
            ))
        }),
        Expr::Column { name, .. } => env.column(name),
        Expr::Literal(v) => Ok(v.clone()),
        Expr::BindVar(name) => env
            .bindvars
            .get(name)
            .cloned()
            .ok_or_else(|| Error::invalid_argument(format!("missing bind variable {:?}", name))),
        Expr::Tuple(items) => Ok(Value::Tuple(
            items
                .iter()
                .map(|e| evaluate(env, e))
                .collect::<Result<Vec<_>>>()?,
        )),
        Expr::BinaryOp { left, op, right } => {
            let lhs = evaluate(env, left)?;
            let rhs = evaluate(env, right)?;
            eval_binary(&lhs, *op, &rhs)
        }
        Expr::UnaryOp { op, expr } => {
            let v = evaluate(env, expr)?;
            match op {
                UnaryOperator::Not => {
                    if v.is_null() {
                        Ok(Value::Null)
                    } else {
                        Ok(bool_value(!is_truthy(&v)))
                    }
                }
                UnaryOperator::Neg => match v {
                    Value::Null => Ok(Value::Null),
                    Value::Int64(n) => Ok(Value::Int64(-n)),
                    Value::Float64(n) => Ok(Value::Float64(-n)),
                    other => Err(Error::invalid_argument(format!("cannot negate {}", other))),
                },
            }
        }
        Expr::IsNull { expr, negated } => {
            let v = evaluate(env, expr)?;
            Ok(bool_value(v.is_null() != *negated))
        }
        Expr::InList {
            expr,
            list,
            negated,
        } => {
            let needle = evaluate(env, expr)?;
            if needle.is_null() {
                return Ok(Value::Null);
            }
            let mut found = false;
            for item in list {
                let candidate = evaluate(env, item)?;
                // A tuple bind variable contributes each of its members.
                let members: Vec<Value> = match candidate {
                    Value::Tuple(vs) => vs,
                    other => vec![other],
                };
                if members
                    .iter()
                    .any(|v| needle.sort_cmp(v) == Ordering::Equal && !v.is_null())
                {
                    found = true;
                    break;
                }
            }
            Ok(bool_value(found != *negated))
        }
        Expr::Aggregate { .. } => Err(Error::internal(
            "aggregate must be planned before evaluation",
        )),
        Expr::FuncCall { name, .. } => Err(Error::unsupported(format!(
            "function {} in residual expression",
            name
        ))),
        Expr::Exists(_) | Expr::Subquery(_) => Err(Error::internal(
            "subquery must be planned before evaluation",
        )),
    }
}

fn eval_binary(lhs: &Value, op: BinaryOperator, rhs: &Value) -> Result<Value> {
    use BinaryOperator::*;

    match op {
        And => {
            // Three-valued logic with the short-circuits that matter.
            if (!lhs.is_null() && !is_truthy(lhs)) || (!rhs.is_null() && !is_truthy(rhs)) {
                return Ok(bool_value(false));
            }
            if lhs.is_null() || rhs.is_null() {
                return Ok(Value::Null);
            }
            return Ok(bool_value(true));
        }
        Or => {
            if (!lhs.is_null() && is_truthy(lhs)) || (!rhs.is_null() && is_truthy(rhs)) {
                return Ok(bool_value(true));
            }
            if lhs.is_null() || rhs.is_null() {
                return Ok(Value::Null);
            }
            return Ok(bool_value(false));
        }
        _ => {}
    }

    if lhs.is_null() || rhs.is_null() {
        return Ok(Value::Null);
    }

    match op {
        Add | Sub | Mul | Div => eval_arith(lhs, op, rhs),
        Eq => Ok(bool_value(lhs.sort_cmp(rhs) == Ordering::Equal)),
        NotEq => Ok(bool_value(lhs.sort_cmp(rhs) != Ordering::Equal)),
        Lt => Ok(bool_value(lhs.sort_cmp(rhs) == Ordering::Less)),
        LtEq => Ok(bool_value(lhs.sort_cmp(rhs) != Ordering::Greater)),
        Gt => Ok(bool_value(lhs.sort_cmp(rhs) == Ordering::Greater)),
        GtEq => Ok(bool_value(lhs.sort_cmp(rhs) != Ordering::Less)),
        Like => {
            let text = lhs.as_str().unwrap_or_default();
            let pattern = rhs.as_str().unwrap_or_default();
            Ok(bool_value(like_match(text, pattern)))
        }
        And | Or => unreachable!("handled above"),
    }
}

fn eval_arith(lhs: &Value, op: BinaryOperator, rhs: &Value) -> Result<Value> {
    use BinaryOperator::*;

    if let (Some(a), Some(b)) = (lhs.as_i64(), rhs.as_i64()) {
        let out = match op {
            Add => a.checked_add(b),
            Sub => a.checked_sub(b),
            Mul => a.checked_mul(b),
            Div => {
                if b == 0 {
                    return Ok(Value::Null);
                }
                // Integer division that loses precision falls through to
                // floats, matching how merged AVG projections are computed.
                if a % b == 0 {
                    Some(a / b)
                } else {
                    None
                }
            }
            _ => None,
        };
        if let Some(v) = out {
            return Ok(Value::Int64(v));
        }
    }

    let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) else {
        return Err(Error::invalid_argument(format!(
            "cannot apply {} to {} and {}",
            op, lhs, rhs
        )));
    };
    match op {
        Add => Ok(Value::Float64(a + b)),
        Sub => Ok(Value::Float64(a - b)),
        Mul => Ok(Value::Float64(a * b)),
        Div => {
            if b == 0.0 {
                Ok(Value::Null)
            } else {
                Ok(Value::Float64(a / b))
            }
        }
        _ => unreachable!(),
    }
}

/// Minimal SQL LIKE: `%` matches any run, `_` matches one character.
fn like_match(text: &str, pattern: &str) -> bool {
    fn inner(text: &[char], pattern: &[char]) -> bool {
        match pattern.split_first() {
            None => text.is_empty(),
            Some(('%', rest)) => {
                (0..=text.len()).any(|skip| inner(&text[skip..], rest))
            }
            Some(('_', rest)) => match text.split_first() {
                Some((_, text_rest)) => inner(text_rest, rest),
                None => false,
            },
            Some((c, rest)) => match text.split_first() {
                Some((t, text_rest)) => {
                    t.eq_ignore_ascii_case(c) && inner(text_rest, rest)
                }
                None => false,
            },
        }
    }
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    inner(&text, &pattern)
}
