//! Table-backed lookup vindexes.
//!
//! A lookup vindex maintains a `(from, to)` table mapping column values to
//! keyspace ids. `lookup` allows several owner rows per value; `lookup_unique`
//! requires at most one. When the vindex is owned, the owner table's DML
//! plans call [`LookupVindex::create`]/[`LookupVindex::delete`] to keep the
//! backing table in sync.

use async_trait::async_trait;
use storm_common::prelude::*;

use crate::{LookupTableDef, LookupVindex, Vindex, VindexCursor, VindexParams, VindexResult};

pub(crate) fn table_def_from_params(name: &str, params: &VindexParams) -> Result<LookupTableDef> {
    Ok(LookupTableDef {
        table: params.require(name, "table")?.to_string(),
        from_column: params.require(name, "from")?.to_string(),
        to_column: params.require(name, "to")?.to_string(),
    })
}

fn require_cursor<'a>(
    name: &str,
    cursor: Option<&'a dyn VindexCursor>,
) -> Result<&'a dyn VindexCursor> {
    cursor.ok_or_else(|| {
        Error::internal(format!("lookup vindex {} called without a cursor", name))
    })
}

/// `lookup`: non-unique, table-backed vindex.
#[derive(Debug)]
pub struct LookupNonUniqueVindex {
    name: String,
    def: LookupTableDef,
    owner: Option<String>,
}

impl LookupNonUniqueVindex {
    pub fn from_params(name: impl Into<String>, params: &VindexParams) -> Result<Self> {
        let name = name.into();
        let def = table_def_from_params(&name, params)?;
        Ok(Self {
            name,
            def,
            owner: params.owner.clone(),
        })
    }
}

#[async_trait]
impl Vindex for LookupNonUniqueVindex {
    fn name(&self) -> &str {
        &self.name
    }

    fn cost(&self) -> u32 {
        20
    }

    fn is_unique(&self) -> bool {
        false
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
        let cursor = require_cursor(&self.name, cursor)?;
        let rows = cursor.lookup(ctx, &self.def, values).await?;
        Ok(rows
            .into_iter()
            .map(|ids| {
                if ids.is_empty() {
                    VindexResult::None
                } else {
                    VindexResult::Ids(ids)
                }
            })
            .collect())
    }

    async fn verify(
        &self,
        ctx: &ExecContext,
        cursor: Option<&dyn VindexCursor>,
        values: &[Value],
        keyspace_ids: &[Vec<u8>],
    ) -> Result<Vec<bool>> {
        let cursor = require_cursor(&self.name, cursor)?;
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
impl LookupVindex for LookupNonUniqueVindex {
    fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
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
        cursor.lookup_create(ctx, &self.def, rows, ignore_mode).await
    }

    async fn update(
        &self,
        ctx: &ExecContext,
        cursor: &dyn VindexCursor,
        old_value: &Value,
        new_value: &Value,
        keyspace_id: &[u8],
    ) -> Result<()> {
        cursor
            .lookup_delete(ctx, &self.def, &[(old_value.clone(), keyspace_id.to_vec())])
            .await?;
        cursor
            .lookup_create(
                ctx,
                &self.def,
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

/// `lookup_unique`: unique, table-backed vindex.
#[derive(Debug)]
pub struct LookupUniqueVindex {
    name: String,
    def: LookupTableDef,
    owner: Option<String>,
}

impl LookupUniqueVindex {
    pub fn from_params(name: impl Into<String>, params: &VindexParams) -> Result<Self> {
        let name = name.into();
        let def = table_def_from_params(&name, params)?;
        Ok(Self {
            name,
            def,
            owner: params.owner.clone(),
        })
    }
}

#[async_trait]
impl Vindex for LookupUniqueVindex {
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
        let cursor = require_cursor(&self.name, cursor)?;
        let rows = cursor.lookup(ctx, &self.def, values).await?;
        rows.into_iter()
            .zip(values.iter())
            .map(|(mut ids, value)| match ids.len() {
                0 => Ok(VindexResult::None),
                1 => Ok(VindexResult::Id(ids.remove(0))),
                n => Err(Error::internal(format!(
                    "lookup_unique vindex {}: {} entries for value {}",
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
        let cursor = require_cursor(&self.name, cursor)?;
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
impl LookupVindex for LookupUniqueVindex {
    fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
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
        cursor.lookup_create(ctx, &self.def, rows, ignore_mode).await
    }

    async fn update(
        &self,
        ctx: &ExecContext,
        cursor: &dyn VindexCursor,
        old_value: &Value,
        new_value: &Value,
        keyspace_id: &[u8],
    ) -> Result<()> {
        cursor
            .lookup_delete(ctx, &self.def, &[(old_value.clone(), keyspace_id.to_vec())])
            .await?;
        cursor
            .lookup_create(
                ctx,
                &self.def,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemoryCursor;
    use std::collections::HashMap;

    fn params(owner: Option<&str>) -> VindexParams {
        let mut p = HashMap::new();
        p.insert("table".to_string(), "lk.t_idx".to_string());
        p.insert("from".to_string(), "name".to_string());
        p.insert("to".to_string(), "keyspace_id".to_string());
        VindexParams {
            params: p,
            owner: owner.map(|s| s.to_string()),
        }
    }

    #[tokio::test]
    async fn test_map_unique() {
        let v = LookupUniqueVindex::from_params("t_idx", &params(Some("t"))).unwrap();
        let cursor = MemoryCursor::new();
        let ctx = ExecContext::background();

        v.create(&ctx, &cursor, &[(Value::from("foo"), vec![0x10])], false)
            .await
            .unwrap();

        let out = v
            .map(&ctx, Some(&cursor), &[Value::from("foo"), Value::from("bar")])
            .await
            .unwrap();
        assert_eq!(
            out,
            vec![VindexResult::Id(vec![0x10]), VindexResult::None]
        );
    }

    #[tokio::test]
    async fn test_create_duplicate_fails_without_ignore() {
        let v = LookupUniqueVindex::from_params("t_idx", &params(Some("t"))).unwrap();
        let cursor = MemoryCursor::new();
        let ctx = ExecContext::background();

        v.create(&ctx, &cursor, &[(Value::from("foo"), vec![0x10])], false)
            .await
            .unwrap();
        let err = v
            .create(&ctx, &cursor, &[(Value::from("foo"), vec![0x20])], false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_, _)));

        // ignore mode silently skips the duplicate
        v.create(&ctx, &cursor, &[(Value::from("foo"), vec![0x20])], true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_update_moves_mapping() {
        let v = LookupUniqueVindex::from_params("t_idx", &params(Some("t"))).unwrap();
        let cursor = MemoryCursor::new();
        let ctx = ExecContext::background();

        v.create(&ctx, &cursor, &[(Value::from("old"), vec![0x10])], false)
            .await
            .unwrap();
        v.update(&ctx, &cursor, &Value::from("old"), &Value::from("new"), &[0x10])
            .await
            .unwrap();

        let out = v
            .map(&ctx, Some(&cursor), &[Value::from("old"), Value::from("new")])
            .await
            .unwrap();
        assert_eq!(out, vec![VindexResult::None, VindexResult::Id(vec![0x10])]);
    }

    #[tokio::test]
    async fn test_delete_then_miss() {
        let v = LookupNonUniqueVindex::from_params("t_idx", &params(Some("t"))).unwrap();
        let cursor = MemoryCursor::new();
        let ctx = ExecContext::background();

        v.create(&ctx, &cursor, &[(Value::from("x"), vec![0x30])], false)
            .await
            .unwrap();
        v.delete(&ctx, &cursor, &[Value::from("x")], &[0x30])
            .await
            .unwrap();
        let out = v.map(&ctx, Some(&cursor), &[Value::from("x")]).await.unwrap();
        assert_eq!(out, vec![VindexResult::None]);
    }

    #[tokio::test]
    async fn test_non_unique_returns_all_ids() {
        let v = LookupNonUniqueVindex::from_params("t_idx", &params(None)).unwrap();
        let cursor = MemoryCursor::new();
        let ctx = ExecContext::background();

        cursor
            .lookup_create(
                &ctx,
                v.table_def(),
                &[
                    (Value::from("x"), vec![0x11]),
                    (Value::from("x"), vec![0x22]),
                ],
                false,
            )
            .await
            .unwrap();

        let out = v.map(&ctx, Some(&cursor), &[Value::from("x")]).await.unwrap();
        assert_eq!(out, vec![VindexResult::Ids(vec![vec![0x11], vec![0x22]])]);
    }

    #[tokio::test]
    async fn test_map_without_cursor_is_internal_error() {
        let v = LookupUniqueVindex::from_params("t_idx", &params(None)).unwrap();
        let err = v
            .map(&ExecContext::background(), None, &[Value::from("x")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
