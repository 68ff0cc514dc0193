//! Destination resolution against the published snapshot.
//!
//! The resolver owns the current VSchema and topology snapshots. Updates
//! swap the whole `Arc`; in-flight queries keep planning against the
//! snapshot they started with.

use std::sync::Arc;

use parking_lot::RwLock;
use storm_common::prelude::*;
use tracing::info;

use crate::destination::{Destination, RandomShardPicker, ShardPicker};
use crate::topology::{ShardRef, Topology};
use crate::vschema::VSchema;

/// A concrete execution target after resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedShard {
    pub keyspace: String,
    pub shard: String,
}

impl ResolvedShard {
    pub fn new(keyspace: impl Into<String>, shard: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            shard: shard.into(),
        }
    }
}

impl std::fmt::Display for ResolvedShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.keyspace, self.shard)
    }
}

pub struct Resolver {
    vschema: RwLock<Arc<VSchema>>,
    topology: RwLock<Arc<Topology>>,
    picker: Box<dyn ShardPicker>,
}

impl Resolver {
    pub fn new(vschema: Arc<VSchema>, topology: Topology) -> Self {
        Self {
            vschema: RwLock::new(vschema),
            topology: RwLock::new(Arc::new(topology)),
            picker: Box::new(RandomShardPicker),
        }
    }

    /// Replace the any-shard pick policy. For tests.
    pub fn with_picker(mut self, picker: Box<dyn ShardPicker>) -> Self {
        self.picker = picker;
        self
    }

    /// The current VSchema snapshot.
    pub fn vschema(&self) -> Arc<VSchema> {
        self.vschema.read().clone()
    }

    /// Publish a new VSchema snapshot.
    pub fn update_vschema(&self, vschema: Arc<VSchema>) {
        info!(keyspaces = vschema.keyspace_names().len(), "publishing new vschema snapshot");
        *self.vschema.write() = vschema;
    }

    /// Publish a new topology snapshot.
    pub fn update_topology(&self, topology: Topology) {
        *self.topology.write() = Arc::new(topology);
    }

    /// The sorted shard set of a keyspace.
    pub fn shards(&self, keyspace: &str) -> Result<Vec<ShardRef>> {
        Ok(self.topology.read().shards(keyspace)?.to_vec())
    }

    /// Resolve destinations to concrete shards. Duplicates collapse while
    /// preserving first-seen order, so fanout is stable for a fixed snapshot.
    /// Shard routing rules may redirect an individual shard's traffic to
    /// another keyspace.
    pub fn resolve(
        &self,
        keyspace: &str,
        destinations: &[Destination],
    ) -> Result<Vec<ResolvedShard>> {
        let vschema = self.vschema();
        let topology = self.topology.read().clone();
        let all_shards = topology.shards(keyspace)?;

        let mut out: Vec<ResolvedShard> = Vec::new();
        for destination in destinations {
            destination.resolve(all_shards, self.picker.as_ref(), &mut |shard| {
                let target_ks = vschema.route_shard(keyspace, shard);
                let resolved = ResolvedShard::new(target_ks, shard);
                if !out.contains(&resolved) {
                    out.push(resolved);
                }
                Ok(())
            })?;
        }
        Ok(out)
    }
}
