//! Serde model of the VSchema wire format.
//!
//! This mirrors the serving snapshot published by the topology service. The
//! raw structs are pure data; [`crate::vschema::VSchema::build`] turns them
//! into the validated, vindex-instantiated model.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The full serving snapshot: keyspaces plus routing rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawVSchema {
    #[serde(default)]
    pub keyspaces: BTreeMap<String, RawKeyspace>,
    #[serde(default)]
    pub routing_rules: Vec<RawRoutingRule>,
    #[serde(default)]
    pub shard_routing_rules: Vec<RawShardRoutingRule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawKeyspace {
    #[serde(default)]
    pub sharded: bool,
    #[serde(default)]
    pub require_explicit_routing: bool,
    #[serde(default)]
    pub vindexes: BTreeMap<String, RawVindex>,
    #[serde(default)]
    pub tables: BTreeMap<String, RawTable>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawVindex {
    #[serde(rename = "type")]
    pub vindex_type: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawTable {
    /// Empty for ordinary tables; `"sequence"` or `"reference"` otherwise.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub table_type: Option<String>,
    #[serde(default)]
    pub column_vindexes: Vec<RawColumnVindex>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_increment: Option<RawAutoIncrement>,
    #[serde(default)]
    pub columns: Vec<RawColumn>,
    /// Hex keyspace id pinning every row of this table to one shard.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned: Option<String>,
    #[serde(default)]
    pub column_list_authoritative: bool,
    /// For reference tables: the qualified source table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawColumnVindex {
    /// Single-column form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    /// Multi-column form; wins over `column` when both are present.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
    /// The vindex name within the keyspace.
    pub name: String,
}

impl RawColumnVindex {
    pub fn column_list(&self) -> Vec<String> {
        if !self.columns.is_empty() {
            self.columns.clone()
        } else {
            self.column.iter().cloned().collect()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawAutoIncrement {
    pub column: String,
    /// Sequence table, optionally qualified as `keyspace.table`.
    pub sequence: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawColumn {
    pub name: String,
    #[serde(rename = "type", default)]
    pub column_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRoutingRule {
    pub from_table: String,
    pub to_tables: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawShardRoutingRule {
    pub from_keyspace: String,
    pub to_keyspace: String,
    pub shard: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_snapshot() {
        let json = r#"{
            "keyspaces": {
                "ks": {
                    "sharded": true,
                    "vindexes": {
                        "hash": { "type": "hash" }
                    },
                    "tables": {
                        "t": {
                            "column_vindexes": [ { "column": "id", "name": "hash" } ],
                            "auto_increment": { "column": "id", "sequence": "t_seq" }
                        },
                        "t_seq": { "type": "sequence" }
                    }
                }
            },
            "routing_rules": [
                { "from_table": "old_t", "to_tables": ["ks.t"] }
            ],
            "shard_routing_rules": [
                { "from_keyspace": "ks", "to_keyspace": "ks2", "shard": "-80" }
            ]
        }"#;
        let raw: RawVSchema = serde_json::from_str(json).unwrap();
        let ks = &raw.keyspaces["ks"];
        assert!(ks.sharded);
        assert_eq!(ks.vindexes["hash"].vindex_type, "hash");
        assert_eq!(
            ks.tables["t"].column_vindexes[0].column_list(),
            vec!["id".to_string()]
        );
        assert_eq!(ks.tables["t_seq"].table_type.as_deref(), Some("sequence"));
        assert_eq!(raw.routing_rules[0].to_tables, vec!["ks.t".to_string()]);
        assert_eq!(raw.shard_routing_rules[0].shard, "-80");
    }

    #[test]
    fn test_multi_column_vindex_wins() {
        let cv = RawColumnVindex {
            column: Some("a".into()),
            columns: vec!["a".into(), "b".into()],
            name: "v".into(),
        };
        assert_eq!(cv.column_list(), vec!["a".to_string(), "b".to_string()]);
    }
}
