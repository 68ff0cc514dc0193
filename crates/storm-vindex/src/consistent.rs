//! `consistent_lookup_unique`: lookup vindex kept consistent with its owner
//! table through a two-phase insert protocol.
//!
//! Ordering invariant: the lookup row is written *before* the owner row, so
//! a committed owner row always has a mapping. The reverse window (a lookup
//! row without an owner) can survive a crashed transaction; the duplicate
//! path reaps it on the next insert of the same value.
//!
//! The owner-liveness check runs under the original caller's context. A
//! detached context would strip the caller id and fail against backends that
//! enforce identity ACLs.

use async_trait::async_trait;
use storm_common::prelude::*;
use tracing::debug;

use crate::lookup::table_def_from_params;
use crate::{LookupTableDef, LookupVindex, Vindex, VindexCursor, VindexParams, VindexResult};

#[derive(Debug)]
pub struct ConsistentLookupUniqueVindex {
    name: String,
    def: LookupTableDef,
    owner: String,
    /// The owner table column this vindex indexes. Defaults to the `from`
    /// column name; override with the `owner_column` param when they differ.
    owner_column: String,
}

impl ConsistentLookupUniqueVindex {
    pub fn from_params(name: impl Into<String>, params: &VindexParams) -> Result<Self> {
        let name = name.into();
        let def = table_def_from_params(&name, params)?;
        let owner = params.owner.clone().ok_or_else(|| {
            Error::invalid_argument(format!(
                "consistent_lookup_unique vindex {} requires an owner table",
                name
            ))
        })?;
        let owner_column = params
            .get("owner_column")
            .unwrap_or(&def.from_column)
            .to_string();
        Ok(Self {
            name,
            def,
            owner,
            owner_column,
        })
    }

    /// The duplicate path: decide whether an existing mapping is live or a
    /// leftover from a failed transaction.
    async fn handle_dup(
        &self,
        ctx: &ExecContext,
        cursor: &dyn VindexCursor,
        value: &Value,
        new_ksid: &[u8],
    ) -> Result<()> {
        let existing = cursor.lookup(ctx, &self.def, std::slice::from_ref(value)).await?;
        let existing_ksid = match existing.first().and_then(|ids| ids.first()) {
            Some(ksid) => ksid.clone(),
            // The conflicting row vanished between the failed insert and our
            // read; retry the insert.
            None => {
                return cursor
                    .lookup_create(
                        ctx,
                        &self.def,
                        &[(value.clone(), new_ksid.to_vec())],
                        false,
                    )
                    .await;
            }
        };

        // Liveness check under the caller's own context.
        let live = cursor
            .owner_row_exists(ctx, &self.owner, &self.owner_column, value, &existing_ksid)
            .await?;
        if live {
            return Err(Error::already_exists("lookup entry", value.to_string()));
        }

        debug!(
            vindex = %self.name,
            value = %value,
            "reaping stale lookup entry from a failed transaction"
        );
        cursor
            .lookup_update(ctx, &self.def, value, new_ksid)
            .await
    }
}

#[async_trait]
impl Vindex for ConsistentLookupUniqueVindex {
    fn name(&self) -> &str {
        &self.name
    }

    fn cost(&self) -> u32 {
        10
    }

    fn is_unique(&self) -> bool {
        true
    }

    fn is_functional(&self) -> bool {
        false
    }

    async fn map(
        &self,
        ctx: &ExecContext,
        cursor: Option<&dyn VindexCursor>,
        values: &[Value],
    ) -> Result<Vec<VindexResult>> {
        let cursor = cursor.ok_or_else(|| {
            Error::internal(format!("lookup vindex {} called without a cursor", self.name))
        })?;
        let rows = cursor.lookup(ctx, &self.def, values).await?;
        rows.into_iter()
            .zip(values.iter())
            .map(|(mut ids, value)| match ids.len() {
                0 => Ok(VindexResult::None),
                1 => Ok(VindexResult::Id(ids.remove(0))),
                n => Err(Error::internal(format!(
                    "consistent_lookup_unique vindex {}: {} entries for value {}",
                    self.name, n, value
                ))),
            })
            .collect()
    }

    async fn verify(
        &self,
        ctx: &ExecContext,
        cursor: Option<&dyn VindexCursor>,
        values: &[Value],
        keyspace_ids: &[Vec<u8>],
    ) -> Result<Vec<bool>> {
        let cursor = cursor.ok_or_else(|| {
            Error::internal(format!("lookup vindex {} called without a cursor", self.name))
        })?;
        let rows = cursor.lookup(ctx, &self.def, values).await?;
        Ok(rows
            .iter()
            .zip(keyspace_ids.iter())
            .map(|(ids, ksid)| ids.iter().any(|id| id == ksid))
            .collect())
    }

    fn as_lookup(&self) -> Option<&dyn LookupVindex> {
        Some(self)
    }
}

#[async_trait]
impl LookupVindex for ConsistentLookupUniqueVindex {
    fn owner(&self) -> Option<&str> {
        Some(&self.owner)
    }

    fn table_def(&self) -> &LookupTableDef {
        &self.def
    }

    async fn create(
        &self,
        ctx: &ExecContext,
        cursor: &dyn VindexCursor,
        rows: &[(Value, Vec<u8>)],
        ignore_mode: bool,
    ) -> Result<()> {
        match cursor.lookup_create(ctx, &self.def, rows, ignore_mode).await {
            Ok(()) => Ok(()),
            Err(Error::AlreadyExists(_, _)) => {
                // Fall back to per-row handling so one conflicting value
                // doesn't mask clean inserts in the same batch.
                for (value, ksid) in rows {
                    match cursor
                        .lookup_create(ctx, &self.def, &[(value.clone(), ksid.clone())], false)
                        .await
                    {
                        Ok(()) => {}
                        Err(Error::AlreadyExists(_, _)) => {
                            self.handle_dup(ctx, cursor, value, ksid).await?;
                        }
                        Err(err) => return Err(err),
                    }
                }
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn update(
        &self,
        ctx: &ExecContext,
        cursor: &dyn VindexCursor,
        old_value: &Value,
        new_value: &Value,
        keyspace_id: &[u8],
    ) -> Result<()> {
        if old_value == new_value {
            return Ok(());
        }
        cursor
            .lookup_delete(ctx, &self.def, &[(old_value.clone(), keyspace_id.to_vec())])
            .await?;
        self.create(
            ctx,
            cursor,
            &[(new_value.clone(), keyspace_id.to_vec())],
            false,
        )
        .await
    }

    async fn delete(
        &self,
        ctx: &ExecContext,
        cursor: &dyn VindexCursor,
        values: &[Value],
        keyspace_id: &[u8],
    ) -> Result<()> {
        let rows: Vec<_> = values
            .iter()
            .map(|v| (v.clone(), keyspace_id.to_vec()))
            .collect();
        cursor.lookup_delete(ctx, &self.def, &rows).await
    }
}
