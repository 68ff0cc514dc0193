//! `numeric`: the identity vindex.
//!
//! The keyspace id is the number itself in big-endian form, which makes this
//! the only reversible built-in: range queries and resharding tooling can
//! recover the column value from a keyspace id.

use async_trait::async_trait;
use storm_common::prelude::*;

use crate::{Vindex, VindexCursor, VindexResult};

#[derive(Debug)]
pub struct NumericVindex {
    name: String,
}

impl NumericVindex {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Vindex for NumericVindex {
    fn name(&self) -> &str {
        &self.name
    }

    fn cost(&self) -> u32 {
        0
    }

    fn is_unique(&self) -> bool {
        true
    }

    fn is_functional(&self) -> bool {
        true
    }

    fn is_reversible(&self) -> bool {
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
                match v {
                    Value::Int64(_) | Value::UInt64(_) => Ok(VindexResult::Id(
                        v.vindex_bytes()
                            .ok_or_else(|| Error::internal("numeric value without byte form"))?,
                    )),
                    other => Err(Error::invalid_argument(format!(
                        "numeric vindex {} requires a numeric value, got {}",
                        self.name, other
                    ))),
                }
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

    fn reverse(&self, keyspace_id: &[u8]) -> Result<Value> {
        if keyspace_id.len() != 8 {
            return Err(Error::invalid_argument(format!(
                "numeric vindex {}: keyspace id must be 8 bytes, got {}",
                self.name,
                keyspace_id.len()
            )));
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(keyspace_id);
        Ok(Value::UInt64(u64::from_be_bytes(buf)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_numeric_identity() {
        let v = NumericVindex::new("num");
        let out = v
            .map(&ExecContext::background(), None, &[Value::Int64(0x0102)])
            .await
            .unwrap();
        assert_eq!(
            out,
            vec![VindexResult::Id(vec![0, 0, 0, 0, 0, 0, 1, 2])]
        );
    }

    #[tokio::test]
    async fn test_numeric_reverse_round_trip() {
        let v = NumericVindex::new("num");
        let out = v
            .map(&ExecContext::background(), None, &[Value::UInt64(99)])
            .await
            .unwrap();
        let ksid = match &out[0] {
            VindexResult::Id(id) => id.clone(),
            _ => unreachable!(),
        };
        assert_eq!(v.reverse(&ksid).unwrap(), Value::UInt64(99));
    }

    #[test]
    fn test_numeric_reverse_bad_length() {
        let v = NumericVindex::new("num");
        assert!(v.reverse(&[1, 2, 3]).is_err());
    }
}
