//! Semantic analysis: bind FROM-clause tables and column references.
//!
//! Every column reference is resolved to a table instance before routing.
//! Qualified references resolve against bindings (alias or table name);
//! unqualified references resolve structurally: a single table binds
//! everything, multiple tables require either a qualifier or an
//! authoritative column list that names the column in exactly one table.

use std::sync::Arc;

use storm_common::prelude::*;
use storm_sql::{Expr, Join, Select, TableRef};
use storm_vschema::{Table, VSchema};

/// A table bound into the query's scope.
#[derive(Debug, Clone)]
pub struct BoundTable {
    /// The name columns may qualify with: the alias, or the table name.
    pub binding: String,
    pub table: Arc<Table>,
}

/// The scope of a SELECT: its FROM-clause tables in order.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub tables: Vec<BoundTable>,
}

impl Scope {
    pub fn bind(
        select: &Select,
        default_keyspace: Option<&str>,
        vschema: &VSchema,
    ) -> Result<Scope> {
        let mut scope = Scope::default();
        for table_ref in &select.from {
            scope.bind_ref(table_ref, default_keyspace, vschema)?;
        }
        if scope.tables.is_empty() {
            return Err(Error::unsupported("SELECT without a FROM table"));
        }
        Ok(scope)
    }

    fn bind_ref(
        &mut self,
        table_ref: &TableRef,
        default_keyspace: Option<&str>,
        vschema: &VSchema,
    ) -> Result<()> {
        match table_ref {
            TableRef::Named { table, alias } => {
                let keyspace = table.keyspace.as_deref().or(default_keyspace);
                let bound = vschema.find_table(keyspace, &table.name)?;
                self.tables.push(BoundTable {
                    binding: alias.clone().unwrap_or_else(|| table.name.clone()),
                    table: bound,
                });
                Ok(())
            }
            TableRef::Join(join) => {
                let Join { left, right, .. } = join.as_ref();
                self.bind_ref(left, default_keyspace, vschema)?;
                self.bind_ref(right, default_keyspace, vschema)
            }
        }
    }

    /// The scope index a column reference binds to.
    pub fn resolve_column(&self, table: Option<&str>, name: &str) -> Result<usize> {
        if let Some(qualifier) = table {
            return self
                .tables
                .iter()
                .position(|bt| bt.binding == qualifier)
                .ok_or_else(|| Error::not_found("table", qualifier));
        }
        if self.tables.len() == 1 {
            return Ok(0);
        }

        let candidates: Vec<usize> = self
            .tables
            .iter()
            .enumerate()
            .filter(|(_, bt)| {
                bt.table.column_list_authoritative
                    && bt.table.columns.iter().any(|(col, _)| col == name)
            })
            .map(|(i, _)| i)
            .collect();
        match candidates.len() {
            1 => Ok(candidates[0]),
            0 => Err(Error::AmbiguousColumn(format!(
                "{} (no authoritative table claims it)",
                name
            ))),
            _ => Err(Error::AmbiguousColumn(name.to_string())),
        }
    }

    /// Which single table an expression depends on, if exactly one.
    pub fn single_dependency(&self, expr: &Expr) -> Result<Option<usize>> {
        let mut deps: Vec<usize> = Vec::new();
        let mut err = None;
        expr.walk(&mut |e| {
            if let Expr::Column { table, name } = e {
                match self.resolve_column(table.as_deref(), name) {
                    Ok(idx) => {
                        if !deps.contains(&idx) {
                            deps.push(idx);
                        }
                    }
                    Err(e) => {
                        err = Some(e);
                        return false;
                    }
                }
            }
            true
        });
        if let Some(err) = err {
            return Err(err);
        }
        Ok(match deps.len() {
            1 => Some(deps[0]),
            _ => None,
        })
    }
}
