//! The Route primitive: dispatch a query fragment to the shards that can
//! answer it.
//!
//! A route carries the fragment AST, a destination recipe (how to turn bind
//! variables into shards, usually through a vindex), and an optional merge
//! ordering. Destination computation happens at execute time because it can
//! depend on bind-variable values.

use std::sync::Arc;

use storm_common::prelude::*;
use storm_sql::{Select, Statement};
use storm_vindex::{Vindex, VindexCursor, VindexResult};
use storm_vschema::Destination;
use tracing::debug;

use crate::eval::{evaluate, EvalEnv};
use crate::scatter::{ErrorPolicy, OrderSpec};
use crate::vcursor::VCursor;

/// A value whose concrete form is only known at execute time.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedValue {
    Literal(Value),
    BindVar(String),
    List(Vec<PlannedValue>),
}

impl PlannedValue {
    /// Resolve against the bind variables. Lists resolve to tuples.
    pub fn resolve(&self, bindvars: &BindVars) -> Result<Value> {
        match self {
            PlannedValue::Literal(v) => Ok(v.clone()),
            PlannedValue::BindVar(name) => bindvars.get(name).cloned().ok_or_else(|| {
                Error::invalid_argument(format!("missing bind variable {:?}", name))
            }),
            PlannedValue::List(items) => Ok(Value::Tuple(
                items
                    .iter()
                    .map(|v| v.resolve(bindvars))
                    .collect::<Result<Vec<_>>>()?,
            )),
        }
    }

    /// Resolve to a flat list of values (tuples flatten one level).
    pub fn resolve_list(&self, bindvars: &BindVars) -> Result<Vec<Value>> {
        match self.resolve(bindvars)? {
            Value::Tuple(vs) => Ok(vs),
            single => Ok(vec![single]),
        }
    }
}

/// How a route's destination set is computed.
#[derive(Clone)]
pub enum RoutePlan {
    /// The single shard of an unsharded keyspace.
    Unsharded,
    /// A reference table: readable on any shard.
    Reference,
    /// Every shard.
    Scatter,
    /// Single shard via a unique vindex on an equality predicate.
    EqualUnique {
        vindex: Arc<dyn Vindex>,
        value: PlannedValue,
    },
    /// Equality on a non-unique vindex: possibly several shards.
    Equal {
        vindex: Arc<dyn Vindex>,
        value: PlannedValue,
    },
    /// IN list over a vindex column.
    In {
        vindex: Arc<dyn Vindex>,
        values: PlannedValue,
    },
    /// Tuple-IN over a vindex column.
    MultiEqual {
        vindex: Arc<dyn Vindex>,
        values: Vec<PlannedValue>,
    },
    /// A fixed destination (pinned tables, session targeting, DDL).
    ByDestination(Destination),
    /// Provably empty (`WHERE vindex_col = NULL`).
    None,
}

impl std::fmt::Debug for RoutePlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutePlan::Unsharded => write!(f, "Unsharded"),
            RoutePlan::Reference => write!(f, "Reference"),
            RoutePlan::Scatter => write!(f, "Scatter"),
            RoutePlan::EqualUnique { vindex, .. } => {
                write!(f, "EqualUnique({})", vindex.name())
            }
            RoutePlan::Equal { vindex, .. } => write!(f, "Equal({})", vindex.name()),
            RoutePlan::In { vindex, .. } => write!(f, "In({})", vindex.name()),
            RoutePlan::MultiEqual { vindex, .. } => {
                write!(f, "MultiEqual({})", vindex.name())
            }
            RoutePlan::ByDestination(d) => write!(f, "ByDestination({})", d),
            RoutePlan::None => write!(f, "None"),
        }
    }
}

impl RoutePlan {
    /// Whether this plan targets at most one shard by construction.
    pub fn is_single_shard(&self) -> bool {
        match self {
            RoutePlan::Unsharded | RoutePlan::Reference | RoutePlan::None => true,
            RoutePlan::EqualUnique { .. } => true,
            RoutePlan::ByDestination(d) => d.is_unique(),
            _ => false,
        }
    }

    /// Compute the destinations for this execution's bind variables.
    pub async fn destinations(
        &self,
        ctx: &ExecContext,
        vcursor: &VCursor,
        bindvars: &BindVars,
    ) -> Result<Vec<Destination>> {
        match self {
            RoutePlan::Unsharded | RoutePlan::Reference => Ok(vec![Destination::AnyShard]),
            RoutePlan::Scatter => Ok(vec![Destination::AllShards]),
            RoutePlan::ByDestination(d) => Ok(vec![d.clone()]),
            RoutePlan::None => Ok(vec![Destination::None]),
            RoutePlan::EqualUnique { vindex, value } | RoutePlan::Equal { vindex, value } => {
                let v = value.resolve(bindvars)?;
                if v.is_null() {
                    return Ok(vec![Destination::None]);
                }
                Ok(vec![map_to_destination(ctx, vcursor, vindex, &v).await?])
            }
            RoutePlan::In { vindex, values } => {
                let values = values.resolve_list(bindvars)?;
                let mut dests = Vec::with_capacity(values.len());
                for v in &values {
                    if v.is_null() {
                        continue;
                    }
                    dests.push(map_to_destination(ctx, vcursor, vindex, v).await?);
                }
                if dests.is_empty() {
                    dests.push(Destination::None);
                }
                Ok(dests)
            }
            RoutePlan::MultiEqual { vindex, values } => {
                let mut dests = Vec::with_capacity(values.len());
                for planned in values {
                    let v = planned.resolve(bindvars)?;
                    if v.is_null() {
                        continue;
                    }
                    dests.push(map_to_destination(ctx, vcursor, vindex, &v).await?);
                }
                if dests.is_empty() {
                    dests.push(Destination::None);
                }
                Ok(dests)
            }
        }
    }
}

/// The Route primitive.
#[derive(Debug, Clone)]
pub struct Route {
    pub keyspace: String,
    pub plan: RoutePlan,
    pub query: Select,
    /// Merge comparator for pushed-down ORDER BY; empty means concatenate.
    pub ordering: Vec<OrderSpec>,
    /// Drop trailing columns (hoisted for ordering) after the merge.
    pub truncate_columns: Option<usize>,
}

impl Route {
    pub fn new(keyspace: impl Into<String>, plan: RoutePlan, query: Select) -> Self {
        Self {
            keyspace: keyspace.into(),
            plan,
            query,
            ordering: Vec::new(),
            truncate_columns: None,
        }
    }

    /// Compute the destinations for this execution's bind variables.
    pub async fn destinations(
        &self,
        ctx: &ExecContext,
        vcursor: &VCursor,
        bindvars: &BindVars,
    ) -> Result<Vec<Destination>> {
        self.plan.destinations(ctx, vcursor, bindvars).await
    }

    pub async fn execute(
        &self,
        ctx: &ExecContext,
        vcursor: &VCursor,
        bindvars: &BindVars,
        _want_fields: bool,
    ) -> Result<QueryResult> {
        ctx.checked()?;
        let (keyspace, destinations) = match vcursor.target_destination() {
            Some((keyspace, destination)) => (keyspace, vec![destination]),
            None => (
                self.keyspace.clone(),
                self.destinations(ctx, vcursor, bindvars).await?,
            ),
        };
        debug!(keyspace = %keyspace, plan = ?self.plan, "route resolved destinations");

        let outcome = vcursor
            .execute_routed(
                ctx,
                &keyspace,
                &destinations,
                &Statement::Select(self.query.clone()),
                bindvars,
                &self.ordering,
                ErrorPolicy::FailFast,
            )
            .await?;
        let mut result = outcome.result;
        if let Some(keep) = self.truncate_columns {
            truncate_result(&mut result, keep);
        }
        Ok(result)
    }

    /// Streaming execution: per-shard callbacks when unordered, a single
    /// merged callback when an ordering must be preserved.
    pub async fn stream_execute(
        &self,
        ctx: &ExecContext,
        vcursor: &VCursor,
        bindvars: &BindVars,
        want_fields: bool,
        callback: &mut (dyn FnMut(QueryResult) -> Result<()> + Send),
    ) -> Result<()> {
        let result = self.execute(ctx, vcursor, bindvars, want_fields).await?;
        callback(result)
    }
}

/// Drop columns beyond `keep` from fields and rows.
pub fn truncate_result(result: &mut QueryResult, keep: usize) {
    result.fields.truncate(keep);
    for row in &mut result.rows {
        row.values.truncate(keep);
    }
}

async fn map_to_destination(
    ctx: &ExecContext,
    vcursor: &VCursor,
    vindex: &Arc<dyn Vindex>,
    value: &Value,
) -> Result<Destination> {
    let cursor = vindex.needs_cursor().then_some(vcursor as &dyn VindexCursor);
    let mapped = vindex
        .map(ctx, cursor, std::slice::from_ref(value))
        .await?;
    match mapped.into_iter().next() {
        Some(VindexResult::Id(id)) => Ok(Destination::KeyspaceId(id)),
        Some(VindexResult::Ids(ids)) => Ok(Destination::KeyspaceIds(ids)),
        Some(VindexResult::None) | None => Ok(Destination::None),
    }
}

/// Evaluate planned values in DML rows (insert values are expressions over
/// bind variables only).
pub fn eval_row(exprs: &[storm_sql::Expr], bindvars: &BindVars) -> Result<Vec<Value>> {
    exprs
        .iter()
        .map(|e| evaluate(EvalEnv::new(&[], bindvars), e))
        .collect()
}
