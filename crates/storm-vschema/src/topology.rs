//! Serving topology: which shards exist per keyspace.
//!
//! Shard sets come from the topology service, not from the VSchema itself.
//! The middleware consumes them read-only and revalidates the partition
//! invariant on every snapshot.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use storm_common::prelude::*;

use crate::keyrange::{partition_complete, KeyRange};

/// One serving shard: its name and the key range it owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRef {
    pub name: String,
    pub range: KeyRange,
}

impl ShardRef {
    pub fn new(name: impl Into<String>, range: KeyRange) -> Self {
        Self {
            name: name.into(),
            range,
        }
    }
}

/// The shard sets of all serving keyspaces.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    shards: HashMap<String, Vec<ShardRef>>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a keyspace's shard set from shard names (`"-80"`, `"80-"`, or
    /// `"0"` for the single unsharded shard). Shards are kept sorted by
    /// range start, and must partition the key space exactly.
    pub fn add_keyspace(&mut self, keyspace: &str, shard_names: &[&str]) -> Result<()> {
        let mut shards = Vec::with_capacity(shard_names.len());
        for name in shard_names {
            shards.push(ShardRef::new(*name, KeyRange::parse(name)?));
        }
        shards.sort_by(|a, b| a.range.start.cmp(&b.range.start));

        let ranges: Vec<KeyRange> = shards.iter().map(|s| s.range.clone()).collect();
        if !partition_complete(&ranges) {
            return Err(Error::invalid_argument(format!(
                "shards of keyspace {} do not partition the key space: {:?}",
                keyspace,
                shard_names
            )));
        }
        self.shards.insert(keyspace.to_string(), shards);
        Ok(())
    }

    /// All shards of a keyspace, sorted by range start.
    pub fn shards(&self, keyspace: &str) -> Result<&[ShardRef]> {
        self.shards
            .get(keyspace)
            .map(|s| s.as_slice())
            .ok_or_else(|| Error::not_found("keyspace", keyspace))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_sort() {
        let mut topo = Topology::new();
        topo.add_keyspace("ks", &["80-", "-80"]).unwrap();
        let shards = topo.shards("ks").unwrap();
        assert_eq!(shards[0].name, "-80");
        assert_eq!(shards[1].name, "80-");
    }

    #[test]
    fn test_unsharded_single_shard() {
        let mut topo = Topology::new();
        topo.add_keyspace("u", &["0"]).unwrap();
        let shards = topo.shards("u").unwrap();
        assert_eq!(shards.len(), 1);
        assert!(shards[0].range.is_full());
    }

    #[test]
    fn test_rejects_gaps_and_overlaps() {
        let mut topo = Topology::new();
        assert!(topo.add_keyspace("gap", &["-40", "80-"]).is_err());
        assert!(topo.add_keyspace("overlap", &["-80", "40-"]).is_err());
        assert!(topo.add_keyspace("empty", &[]).is_err());
    }

    #[test]
    fn test_unknown_keyspace() {
        let topo = Topology::new();
        assert!(matches!(topo.shards("nope"), Err(Error::NotFound(_, _))));
    }
}
