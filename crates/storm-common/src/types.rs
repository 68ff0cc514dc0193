//! Core types for StormGate
//!
//! The value model is the subset of MySQL's that the routing layer actually
//! inspects. Tablets own full MySQL semantics; the middleware only needs
//! enough to hash vindex columns, evaluate residual expressions, and merge
//! result streams.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

// ============================================================================
// Values
// ============================================================================

/// A scalar (or tuple) value flowing through the middleware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int64(i64),
    UInt64(u64),
    Float64(f64),
    Text(String),
    Bytes(Vec<u8>),
    /// Multi-value bind variable, used for IN lists and multi-column vindexes.
    Tuple(Vec<Value>),
}

impl Value {
    /// Returns true if this value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Try to get as i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            Value::UInt64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Try to get as f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float64(v) => Some(*v),
            Value::Int64(v) => Some(*v as f64),
            Value::UInt64(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Try to get as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// The canonical byte form used as vindex hashing input: numeric values
    /// are the 8-byte big-endian encoding, strings and blobs are raw bytes.
    pub fn vindex_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Value::Int64(v) => Some((*v as u64).to_be_bytes().to_vec()),
            Value::UInt64(v) => Some(v.to_be_bytes().to_vec()),
            Value::Text(s) => Some(s.as_bytes().to_vec()),
            Value::Bytes(b) => Some(b.clone()),
            Value::Null | Value::Float64(_) | Value::Tuple(_) => None,
        }
    }

    /// Total ordering used by merge-sort and memory-sort: NULL sorts first,
    /// numbers before text, mixed numeric kinds compare as f64.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        use Value::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,
            (Int64(a), Int64(b)) => a.cmp(b),
            (UInt64(a), UInt64(b)) => a.cmp(b),
            (Text(a), Text(b)) => a.cmp(b),
            (Bytes(a), Bytes(b)) => a.cmp(b),
            (Tuple(a), Tuple(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.sort_cmp(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
                _ => self.type_rank().cmp(&other.type_rank()),
            },
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Int64(_) | Value::UInt64(_) | Value::Float64(_) => 1,
            Value::Text(_) => 2,
            Value::Bytes(_) => 3,
            Value::Tuple(_) => 4,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int64(v) => write!(f, "{}", v),
            Value::UInt64(v) => write!(f, "{}", v),
            Value::Float64(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "'{}'", v),
            Value::Bytes(v) => write!(f, "x'{}'", hex::encode(v)),
            Value::Tuple(vs) => {
                write!(f, "(")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

/// Bind variables attached to a query: name -> value.
pub type BindVars = HashMap<String, Value>;

// ============================================================================
// Rows and results
// ============================================================================

/// A row of values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn get_i64(&self, index: usize) -> Option<i64> {
        self.values.get(index).and_then(|v| v.as_i64())
    }

    pub fn get_str(&self, index: usize) -> Option<&str> {
        self.values.get(index).and_then(|v| v.as_str())
    }
}

/// A result-set column descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub column_type: String,
}

impl Field {
    pub fn new(name: impl Into<String>, column_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column_type: column_type.into(),
        }
    }
}

/// A materialized query result: fields, rows, and DML bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub fields: Vec<Field>,
    pub rows: Vec<Row>,
    pub rows_affected: u64,
    pub last_insert_id: u64,
}

impl QueryResult {
    pub fn new(fields: Vec<Field>) -> Self {
        Self {
            fields,
            ..Default::default()
        }
    }

    pub fn with_rows(fields: Vec<Field>, rows: Vec<Row>) -> Self {
        Self {
            fields,
            rows,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Merge another shard's result into this one: rows concatenate,
    /// rows-affected sum, fields are taken from the first non-empty set.
    pub fn append(&mut self, other: QueryResult) {
        if self.fields.is_empty() {
            self.fields = other.fields;
        }
        self.rows.extend(other.rows);
        self.rows_affected += other.rows_affected;
        if other.last_insert_id != 0 {
            self.last_insert_id = other.last_insert_id;
        }
    }
}
