//! # Storm Planner
//!
//! Compiles statement ASTs plus a VSchema snapshot into execution
//! primitives. Planning is pure: deterministic for a given (statement,
//! vschema) pair, with no side effects, and total — every statement either
//! produces a plan or a typed error naming the unsupported construct.

pub mod dml;
pub mod routing;
pub mod select;
pub mod semantics;

use storm_common::prelude::*;
use storm_engine::Primitive;
use storm_sql::Statement;
use storm_vschema::VSchema;

pub use routing::discover_route;
pub use semantics::{BoundTable, Scope};

/// State threaded through one planning run.
pub struct PlannerContext<'a> {
    pub vschema: &'a VSchema,
    pub default_keyspace: Option<&'a str>,
    subquery_counter: usize,
    join_counter: usize,
}

impl<'a> PlannerContext<'a> {
    pub fn new(vschema: &'a VSchema, default_keyspace: Option<&'a str>) -> Self {
        Self {
            vschema,
            default_keyspace,
            subquery_counter: 0,
            join_counter: 0,
        }
    }

    pub(crate) fn next_subquery_id(&mut self) -> usize {
        self.subquery_counter += 1;
        self.subquery_counter
    }

    pub(crate) fn next_join_id(&mut self) -> usize {
        self.join_counter += 1;
        self.join_counter
    }
}

/// A compiled plan.
#[derive(Debug)]
pub struct Plan {
    pub primitive: Primitive,
}

impl Plan {
    /// Indented tree rendering, for EXPLAIN output and plan tests.
    pub fn describe(&self) -> String {
        self.primitive.describe()
    }
}

/// Plan a statement against a VSchema snapshot.
pub fn plan(
    stmt: &Statement,
    default_keyspace: Option<&str>,
    vschema: &VSchema,
) -> Result<Plan> {
    let mut ctx = PlannerContext::new(vschema, default_keyspace);
    let primitive = match stmt {
        Statement::Select(select) => select::plan_select(select, &mut ctx)?,
        Statement::Union(union) => select::plan_union(union, &mut ctx)?,
        Statement::Insert(insert) => dml::plan_insert(insert, &mut ctx)?,
        Statement::Update(update) => dml::plan_update(update, &mut ctx)?,
        Statement::Delete(delete) => dml::plan_delete(delete, &mut ctx)?,
    };
    Ok(Plan { primitive })
}
