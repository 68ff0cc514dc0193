//! In-memory [`VindexCursor`] used by this crate's tests.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use storm_common::prelude::*;

use crate::{LookupTableDef, VindexCursor};

/// A fake cursor backed by in-memory lookup and owner tables.
pub(crate) struct MemoryCursor {
    /// table name -> (from value, keyspace id) rows
    lookups: Mutex<HashMap<String, Vec<(Value, Vec<u8>)>>>,
    /// owner table name -> (column, value, keyspace id) rows
    owners: Mutex<HashMap<String, Vec<(String, Value, Vec<u8>)>>>,
    /// When set, every operation fails unless the context carries a caller.
    require_caller: bool,
}

impl MemoryCursor {
    pub fn new() -> Self {
        Self {
            lookups: Mutex::new(HashMap::new()),
            owners: Mutex::new(HashMap::new()),
            require_caller: false,
        }
    }

    /// A cursor that enforces caller-id ACLs, like a production tablet.
    pub fn with_caller_acl() -> Self {
        Self {
            require_caller: true,
            ..Self::new()
        }
    }

    fn check_acl(&self, ctx: &ExecContext) -> Result<()> {
        if self.require_caller {
            ctx.require_caller()?;
        }
        Ok(())
    }

    pub fn insert_owner(&self, table: &str, column: &str, value: Value, ksid: Vec<u8>) {
        self.owners
            .lock()
            .entry(table.to_string())
            .or_default()
            .push((column.to_string(), value, ksid));
    }

    pub fn remove_owner(&self, table: &str, value: &Value) {
        if let Some(rows) = self.owners.lock().get_mut(table) {
            rows.retain(|(_, v, _)| v != value);
        }
    }

    pub fn lookup_rows(&self, table: &str) -> Vec<(Value, Vec<u8>)> {
        self.lookups.lock().get(table).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl VindexCursor for MemoryCursor {
    async fn lookup(
        &self,
        ctx: &ExecContext,
        def: &LookupTableDef,
        values: &[Value],
    ) -> Result<Vec<Vec<Vec<u8>>>> {
        self.check_acl(ctx)?;
        let tables = self.lookups.lock();
        let rows = tables.get(&def.table);
        Ok(values
            .iter()
            .map(|v| {
                rows.map(|rows| {
                    rows.iter()
                        .filter(|(from, _)| from == v)
                        .map(|(_, ksid)| ksid.clone())
                        .collect()
                })
                .unwrap_or_default()
            })
            .collect())
    }

    async fn lookup_create(
        &self,
        ctx: &ExecContext,
        def: &LookupTableDef,
        rows: &[(Value, Vec<u8>)],
        ignore: bool,
    ) -> Result<()> {
        self.check_acl(ctx)?;
        let mut tables = self.lookups.lock();
        let table = tables.entry(def.table.clone()).or_default();
        for (from, ksid) in rows {
            if table.iter().any(|(v, _)| v == from) {
                if ignore {
                    continue;
                }
                return Err(Error::already_exists("lookup row", from.to_string()));
            }
            table.push((from.clone(), ksid.clone()));
        }
        Ok(())
    }

    async fn lookup_update(
        &self,
        ctx: &ExecContext,
        def: &LookupTableDef,
        from: &Value,
        keyspace_id: &[u8],
    ) -> Result<()> {
        self.check_acl(ctx)?;
        let mut tables = self.lookups.lock();
        let table = tables.entry(def.table.clone()).or_default();
        for (v, ksid) in table.iter_mut() {
            if v == from {
                *ksid = keyspace_id.to_vec();
                return Ok(());
            }
        }
        Err(Error::not_found("lookup row", from.to_string()))
    }

    async fn lookup_delete(
        &self,
        ctx: &ExecContext,
        def: &LookupTableDef,
        rows: &[(Value, Vec<u8>)],
    ) -> Result<()> {
        self.check_acl(ctx)?;
        let mut tables = self.lookups.lock();
        if let Some(table) = tables.get_mut(&def.table) {
            for (from, ksid) in rows {
                table.retain(|(v, id)| !(v == from && id == ksid));
            }
        }
        Ok(())
    }

    async fn owner_row_exists(
        &self,
        ctx: &ExecContext,
        owner_table: &str,
        column: &str,
        value: &Value,
        keyspace_id: &[u8],
    ) -> Result<bool> {
        self.check_acl(ctx)?;
        let owners = self.owners.lock();
        Ok(owners
            .get(owner_table)
            .map(|rows| {
                rows.iter()
                    .any(|(c, v, k)| c == column && v == value && k == keyspace_id)
            })
            .unwrap_or(false))
    }
}
