//! Functional hash vindexes.
//!
//! `hash` operates on the canonical 8-byte big-endian numeric form, so the
//! same logical number always lands on the same shard regardless of its SQL
//! type. `xxhash` hashes the raw byte form and accepts any value with a byte
//! representation.

use async_trait::async_trait;
use std::hash::Hasher;
use storm_common::prelude::*;
use twox_hash::XxHash64;

use crate::{Vindex, VindexCursor, VindexResult};

const HASH_SEED: u64 = 0;

fn xxhash64(bytes: &[u8]) -> [u8; 8] {
    let mut h = XxHash64::with_seed(HASH_SEED);
    h.write(bytes);
    h.finish().to_be_bytes()
}

/// `hash`: unique, functional vindex over numeric columns.
#[derive(Debug)]
pub struct HashVindex {
    name: String,
}

impl HashVindex {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn hash_one(&self, value: &Value) -> Result<VindexResult> {
        if value.is_null() {
            return Ok(VindexResult::None);
        }
        match value {
            Value::Int64(_) | Value::UInt64(_) => {
                let bytes = value
                    .vindex_bytes()
                    .ok_or_else(|| Error::internal("numeric value without byte form"))?;
                Ok(VindexResult::Id(xxhash64(&bytes).to_vec()))
            }
            other => Err(Error::invalid_argument(format!(
                "hash vindex {} requires a numeric value, got {}",
                self.name, other
            ))),
        }
    }
}

#[async_trait]
impl Vindex for HashVindex {
    fn name(&self) -> &str {
        &self.name
    }

    fn cost(&self) -> u32 {
        1
    }

    fn is_unique(&self) -> bool {
        true
    }

    fn is_functional(&self) -> bool {
        true
    }

    async fn map(
        &self,
        _ctx: &ExecContext,
        _cursor: Option<&dyn VindexCursor>,
        values: &[Value],
    ) -> Result<Vec<VindexResult>> {
        values.iter().map(|v| self.hash_one(v)).collect()
    }

    async fn verify(
        &self,
        ctx: &ExecContext,
        cursor: Option<&dyn VindexCursor>,
        values: &[Value],
        keyspace_ids: &[Vec<u8>],
    ) -> Result<Vec<bool>> {
        let mapped = self.map(ctx, cursor, values).await?;
        Ok(mapped
            .iter()
            .zip(keyspace_ids.iter())
            .map(|(m, ksid)| matches!(m, VindexResult::Id(id) if id == ksid))
            .collect())
    }
}

/// `xxhash`: unique, functional vindex over arbitrary byte values.
#[derive(Debug)]
pub struct XxHashVindex {
    name: String,
}

impl XxHashVindex {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Vindex for XxHashVindex {
    fn name(&self) -> &str {
        &self.name
    }

    fn cost(&self) -> u32 {
        1
    }

    fn is_unique(&self) -> bool {
        true
    }

    fn is_functional(&self) -> bool {
        true
    }

    async fn map(
        &self,
        _ctx: &ExecContext,
        _cursor: Option<&dyn VindexCursor>,
        values: &[Value],
    ) -> Result<Vec<VindexResult>> {
        values
            .iter()
            .map(|v| {
                if v.is_null() {
                    return Ok(VindexResult::None);
                }
                let bytes = v.vindex_bytes().ok_or_else(|| {
                    Error::invalid_argument(format!(
                        "xxhash vindex {} cannot hash {}",
                        self.name, v
                    ))
                })?;
                Ok(VindexResult::Id(xxhash64(&bytes).to_vec()))
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
        let mapped = self.map(ctx, cursor, values).await?;
        Ok(mapped
            .iter()
            .zip(keyspace_ids.iter())
            .map(|(m, ksid)| matches!(m, VindexResult::Id(id) if id == ksid))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ExecContext {
        ExecContext::background()
    }

    #[tokio::test]
    async fn test_hash_is_deterministic() {
        let v = HashVindex::new("hash");
        let a = v.map(&ctx(), None, &[Value::Int64(1)]).await.unwrap();
        let b = v.map(&ctx(), None, &[Value::Int64(1)]).await.unwrap();
        assert_eq!(a, b);
        let id = match &a[0] {
            VindexResult::Id(id) => id.clone(),
            other => panic!("expected unique id, got {:?}", other),
        };
        assert_eq!(id.len(), 8);
    }

    #[tokio::test]
    async fn test_hash_same_number_different_types() {
        let v = HashVindex::new("hash");
        let a = v.map(&ctx(), None, &[Value::Int64(42)]).await.unwrap();
        let b = v.map(&ctx(), None, &[Value::UInt64(42)]).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_hash_rejects_text() {
        let v = HashVindex::new("hash");
        assert!(v.map(&ctx(), None, &[Value::Text("a".into())]).await.is_err());
    }

    #[tokio::test]
    async fn test_hash_null_maps_to_none() {
        let v = HashVindex::new("hash");
        let out = v.map(&ctx(), None, &[Value::Null]).await.unwrap();
        assert_eq!(out, vec![VindexResult::None]);
    }

    #[tokio::test]
    async fn test_xxhash_accepts_text_and_bytes() {
        let v = XxHashVindex::new("xx");
        let a = v.map(&ctx(), None, &[Value::Text("foo".into())]).await.unwrap();
        let b = v
            .map(&ctx(), None, &[Value::Bytes(b"foo".to_vec())])
            .await
            .unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_verify() {
        let v = HashVindex::new("hash");
        let mapped = v.map(&ctx(), None, &[Value::Int64(7)]).await.unwrap();
        let ksid = match &mapped[0] {
            VindexResult::Id(id) => id.clone(),
            _ => unreachable!(),
        };
        let ok = v
            .verify(&ctx(), None, &[Value::Int64(7)], &[ksid.clone()])
            .await
            .unwrap();
        assert_eq!(ok, vec![true]);
        let bad = v
            .verify(&ctx(), None, &[Value::Int64(8)], &[ksid])
            .await
            .unwrap();
        assert_eq!(bad, vec![false]);
    }
}
