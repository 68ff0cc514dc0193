//! `unicode_loose_md5`: a Unicode-normalizing string hash.
//!
//! Unicode-equivalent inputs (precomposed vs. decomposed accents, case
//! variants, trailing padding) must produce identical keyspace ids, matching
//! MySQL's loose CHAR comparison rules. Normalization runs NFC, casefolds,
//! and strips trailing spaces before hashing with MD5.
//!
//! Normalization scratch buffers are recycled through a mutex-guarded pool.
//! The pool bounds retained memory under concurrent load; a single shared
//! buffer without a lock is not safe here and per-call allocation churns.

use async_trait::async_trait;
use md5::{Digest, Md5};
use parking_lot::Mutex;
use storm_common::prelude::*;
use unicode_normalization::UnicodeNormalization;

use crate::{Vindex, VindexCursor, VindexResult};

const POOL_LIMIT: usize = 16;
const BUFFER_CAP_LIMIT: usize = 1 << 16;

/// Pool of reusable normalization buffers.
#[derive(Debug)]
struct BufferPool {
    buffers: Mutex<Vec<String>>,
}

impl BufferPool {
    fn new() -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
        }
    }

    fn take(&self) -> String {
        self.buffers.lock().pop().unwrap_or_default()
    }

    fn put(&self, mut buf: String) {
        buf.clear();
        // Oversized buffers are dropped instead of retained.
        if buf.capacity() > BUFFER_CAP_LIMIT {
            return;
        }
        let mut pool = self.buffers.lock();
        if pool.len() < POOL_LIMIT {
            pool.push(buf);
        }
    }
}

/// `unicode_loose_md5`: unique, functional vindex over string values.
#[derive(Debug)]
pub struct UnicodeLooseMd5Vindex {
    name: String,
    pool: BufferPool,
}

impl UnicodeLooseMd5Vindex {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pool: BufferPool::new(),
        }
    }

    fn normalize_hash(&self, input: &str) -> [u8; 16] {
        let mut buf = self.pool.take();
        for c in input.nfc() {
            for lower in c.to_lowercase() {
                buf.push(lower);
            }
        }
        let trimmed = buf.trim_end_matches(' ');
        let mut hasher = Md5::new();
        hasher.update(trimmed.as_bytes());
        let digest: [u8; 16] = hasher.finalize().into();
        self.pool.put(buf);
        digest
    }

    fn map_one(&self, value: &Value) -> Result<VindexResult> {
        match value {
            Value::Null => Ok(VindexResult::None),
            Value::Text(s) => Ok(VindexResult::Id(self.normalize_hash(s).to_vec())),
            Value::Bytes(b) => {
                let s = std::str::from_utf8(b).map_err(|_| {
                    Error::invalid_argument(format!(
                        "unicode_loose_md5 vindex {}: value is not valid utf-8",
                        self.name
                    ))
                })?;
                Ok(VindexResult::Id(self.normalize_hash(s).to_vec()))
            }
            other => Err(Error::invalid_argument(format!(
                "unicode_loose_md5 vindex {} requires a string value, got {}",
                self.name, other
            ))),
        }
    }
}

#[async_trait]
impl Vindex for UnicodeLooseMd5Vindex {
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
        values.iter().map(|v| self.map_one(v)).collect()
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
    use std::sync::Arc;

    fn ctx() -> ExecContext {
        ExecContext::background()
    }

    #[tokio::test]
    async fn test_unicode_equivalent_inputs_hash_equal() {
        let v = UnicodeLooseMd5Vindex::new("u");
        // "é" precomposed vs "e" + combining acute
        let a = v
            .map(&ctx(), None, &[Value::Text("caf\u{00e9}".into())])
            .await
            .unwrap();
        let b = v
            .map(&ctx(), None, &[Value::Text("cafe\u{0301}".into())])
            .await
            .unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_case_and_padding_insensitive() {
        let v = UnicodeLooseMd5Vindex::new("u");
        let a = v.map(&ctx(), None, &[Value::Text("Foo".into())]).await.unwrap();
        let b = v.map(&ctx(), None, &[Value::Text("foo  ".into())]).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_distinct_strings_differ() {
        let v = UnicodeLooseMd5Vindex::new("u");
        let a = v.map(&ctx(), None, &[Value::Text("foo".into())]).await.unwrap();
        let b = v.map(&ctx(), None, &[Value::Text("bar".into())]).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_concurrent_use_is_deterministic() {
        let v = Arc::new(UnicodeLooseMd5Vindex::new("u"));
        let expected = v
            .map(&ctx(), None, &[Value::Text("stable".into())])
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let v = v.clone();
            let expected = expected.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..200 {
                    let got = v
                        .map(&ExecContext::background(), None, &[Value::Text("stable".into())])
                        .await
                        .unwrap();
                    assert_eq!(got, expected);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_buffer_pool_bounded() {
        let v = UnicodeLooseMd5Vindex::new("u");
        for _ in 0..100 {
            let _ = v.map(&ctx(), None, &[Value::Text("x".repeat(64))]).await;
        }
        assert!(v.pool.buffers.lock().len() <= POOL_LIMIT);
    }
}
