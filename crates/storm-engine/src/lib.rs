//! # Storm Engine
//!
//! The execution layer: a closed set of primitives (routes, joins, merging
//! aggregators, residual sort/limit/distinct/projection/filter, subquery
//! materialization, sharded DML) plus the scatter-gather runtime that
//! dispatches fragments to tablets through bounded per-backend pools.

pub mod aggregate;
pub mod dml;
pub mod eval;
pub mod join;
pub mod primitive;
pub mod relational;
pub mod route;
pub mod scatter;
pub mod subquery;
pub mod tablet;
pub mod vcursor;

pub use aggregate::{AggregateParam, OrderedAggregate, ScalarAggregate};
pub use dml::{DmlRoute, InsertRoute, LookupCleanup};
pub use join::{ApplyJoin, HashJoin, JoinCol};
pub use primitive::{Concatenate, Primitive, Wrapped};
pub use relational::{DistinctFilter, FilterEval, LimitClip, MemorySort, ProjectionEval};
pub use route::{PlannedValue, Route, RoutePlan};
pub use scatter::{
    cmp_rows, ErrorPolicy, OrderSpec, QueryService, ScatterExecutor, ScatterOutcome,
    ShardQuery, TabletDirectory,
};
pub use subquery::{SubqueryMode, UncorrelatedSubquery};
pub use tablet::MemoryTablet;
pub use vcursor::{Session, VCursor};
