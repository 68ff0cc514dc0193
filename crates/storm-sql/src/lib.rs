//! # Storm SQL
//!
//! The SQL layer of StormGate: the statement/expression tree the planner
//! consumes (parsing is the wire frontend's job) and the query-projection
//! analysis used for horizon planning.

pub mod ast;
pub mod projection;

pub use ast::{
    AggrFunc, AggregateOpcode, BinaryOperator, Delete, Expr, Insert, Join, JoinKind, Limit,
    OrderExpr, Select, SelectExpr, Statement, TableName, TableRef, UnaryOperator, Union, Update,
};
pub use projection::{Aggr, GroupingExpr, OrderingExpr, QueryProjection, SelectColumn};
