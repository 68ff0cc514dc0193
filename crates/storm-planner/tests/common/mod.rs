//! Shared cluster fixture for end-to-end planner/engine tests.

use std::collections::HashMap;
use std::sync::Arc;

use storm_common::prelude::*;
use storm_engine::{
    MemoryTablet, Primitive, ScatterExecutor, Session, TabletDirectory, VCursor,
};
use storm_planner::plan;
use storm_sql::Statement;
use storm_vschema::{FixedShardPicker, RawVSchema, ResolvedShard, Resolver, Topology, VSchema};

/// A gateway plus one in-memory tablet per shard.
pub struct TestCluster {
    pub vschema: Arc<VSchema>,
    pub resolver: Arc<Resolver>,
    pub directory: Arc<TabletDirectory>,
    pub executor: Arc<ScatterExecutor>,
    pub tablets: HashMap<ResolvedShard, Arc<MemoryTablet>>,
}

impl TestCluster {
    pub fn new(vschema_json: &str, keyspaces: &[(&str, &[&str])]) -> Self {
        let raw: RawVSchema = serde_json::from_str(vschema_json).expect("vschema json");
        let vschema = VSchema::build(&raw).expect("vschema build");

        let mut topology = Topology::new();
        for (keyspace, shards) in keyspaces {
            topology.add_keyspace(keyspace, shards).expect("topology");
        }

        let resolver = Arc::new(
            Resolver::new(vschema.clone(), topology)
                .with_picker(Box::new(FixedShardPicker(0))),
        );

        let directory = Arc::new(TabletDirectory::new(&PoolConfig::default()));
        let mut tablets = HashMap::new();
        for (keyspace, shards) in keyspaces {
            for shard in *shards {
                let target = ResolvedShard::new(*keyspace, *shard);
                let tablet = Arc::new(MemoryTablet::new(format!("{}/{}", keyspace, shard)));
                directory.register(target.clone(), tablet.clone());
                tablets.insert(target, tablet);
            }
        }

        let executor = Arc::new(ScatterExecutor::new(
            directory.clone(),
            ExecutionConfig::default().scatter_concurrency,
        ));
        Self {
            vschema,
            resolver,
            directory,
            executor,
            tablets,
        }
    }

    pub fn tablet(&self, keyspace: &str, shard: &str) -> &Arc<MemoryTablet> {
        self.tablets
            .get(&ResolvedShard::new(keyspace, shard))
            .expect("tablet")
    }

    /// Run a closure over every tablet of a keyspace.
    pub fn each_tablet(&self, keyspace: &str, mut f: impl FnMut(&MemoryTablet)) {
        for (target, tablet) in &self.tablets {
            if target.keyspace == keyspace {
                f(tablet);
            }
        }
    }

    pub fn vcursor(&self, default_keyspace: Option<&str>) -> VCursor {
        let session = Session {
            default_keyspace: default_keyspace.map(|s| s.to_string()),
            autocommit: true,
            ..Default::default()
        };
        VCursor::new(
            self.resolver.clone(),
            self.executor.clone(),
            session,
            ExecutionConfig::default(),
        )
    }

    pub fn plan(&self, stmt: &Statement, default_keyspace: Option<&str>) -> Primitive {
        plan(stmt, default_keyspace, &self.vschema)
            .expect("plan")
            .primitive
    }

    /// Plan and execute a statement with a caller identity attached.
    pub async fn exec(
        &self,
        stmt: &Statement,
        default_keyspace: Option<&str>,
        bindvars: &BindVars,
    ) -> Result<QueryResult> {
        let primitive = plan(stmt, default_keyspace, &self.vschema)?.primitive;
        let vcursor = self.vcursor(default_keyspace);
        let ctx = ExecContext::background().with_caller(CallerId::new("tester", "gateway"));
        primitive.execute(&ctx, &vcursor, bindvars, true).await
    }
}

/// The standard two-keyspace fixture: a sharded keyspace `ks` and an
/// unsharded side keyspace `lk` holding lookups and sequences.
pub const VSCHEMA: &str = r#"{
    "keyspaces": {
        "ks": {
            "sharded": true,
            "vindexes": {
                "hash": { "type": "hash" },
                "things_name_lookup": {
                    "type": "consistent_lookup_unique",
                    "params": {
                        "table": "lk.things_name_lookup",
                        "from": "name",
                        "to": "keyspace_id"
                    },
                    "owner": "things"
                }
            },
            "tables": {
                "t": {
                    "column_vindexes": [ { "column": "id", "name": "hash" } ]
                },
                "things": {
                    "column_vindexes": [
                        { "column": "id", "name": "hash" },
                        { "column": "name", "name": "things_name_lookup" }
                    ],
                    "auto_increment": { "column": "id", "sequence": "lk.things_seq" }
                }
            }
        },
        "lk": {
            "sharded": false,
            "tables": {
                "things_name_lookup": {},
                "things_seq": { "type": "sequence" }
            }
        }
    }
}"#;

/// Build the standard cluster with the given `ks` shard split and create
/// the backing tables on every tablet.
pub fn standard_cluster(shards: &[&str]) -> TestCluster {
    let cluster = TestCluster::new(VSCHEMA, &[("ks", shards), ("lk", &["0"])]);
    cluster.each_tablet("ks", |tablet| {
        tablet.create_table("t", &["id", "x", "y"], &["id"]);
        tablet.create_table("things", &["id", "name"], &["id", "name"]);
    });
    let lk = cluster.tablet("lk", "0");
    lk.create_table("things_name_lookup", &["name", "keyspace_id"], &["name"]);
    lk.create_sequence("things_seq", 1);
    cluster
}
