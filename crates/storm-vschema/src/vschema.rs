//! The validated VSchema model.
//!
//! Built once from the raw snapshot, then shared immutably: every query
//! plans against one `Arc<VSchema>` and never observes a partial update.
//! Tables and vindexes are kept in per-keyspace maps indexed by name;
//! references between them (lookup backing tables, sequences) stay by-name
//! and resolve lazily, so the natural cycles in the model need no
//! back-pointers.

use std::collections::HashMap;
use std::sync::Arc;

use storm_common::prelude::*;
use storm_vindex::{build_vindex, Vindex, VindexParams};
use tracing::warn;

use crate::raw::{RawTable, RawVSchema};

/// Table classification from the VSchema `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TableType {
    #[default]
    Normal,
    Sequence,
    Reference,
}

/// A column-to-vindex association. The first ColumnVindex of a table is the
/// primary vindex and determines row placement.
#[derive(Clone)]
pub struct ColumnVindex {
    pub columns: Vec<String>,
    pub name: String,
    pub vindex: Arc<dyn Vindex>,
}

impl std::fmt::Debug for ColumnVindex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnVindex")
            .field("columns", &self.columns)
            .field("name", &self.name)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct AutoIncrement {
    pub column: String,
    /// Qualified or bare sequence table name.
    pub sequence: String,
}

/// A table within a keyspace.
#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
    pub keyspace: String,
    pub table_type: TableType,
    pub column_vindexes: Vec<ColumnVindex>,
    pub auto_increment: Option<AutoIncrement>,
    /// Fixed keyspace id for unsharded-style tables inside a sharded keyspace.
    pub pinned: Option<Vec<u8>>,
    /// For reference tables: the qualified source table.
    pub source: Option<String>,
    pub columns: Vec<(String, String)>,
    pub column_list_authoritative: bool,
}

impl Table {
    /// The primary vindex, if the table has one.
    pub fn primary_vindex(&self) -> Option<&ColumnVindex> {
        self.column_vindexes.first()
    }

    /// Column vindexes that own a lookup table.
    pub fn owned_vindexes(&self) -> impl Iterator<Item = &ColumnVindex> {
        self.column_vindexes.iter().filter(|cv| {
            cv.vindex
                .as_lookup()
                .and_then(|l| l.owner())
                .is_some_and(|owner| owner == self.name)
        })
    }
}

/// A keyspace: vindexes plus tables.
pub struct KeyspaceSchema {
    pub name: String,
    pub sharded: bool,
    pub require_explicit_routing: bool,
    pub vindexes: HashMap<String, Arc<dyn Vindex>>,
    pub tables: HashMap<String, Arc<Table>>,
}

impl std::fmt::Debug for KeyspaceSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyspaceSchema")
            .field("name", &self.name)
            .field("sharded", &self.sharded)
            .field("vindexes", &self.vindexes.keys().collect::<Vec<_>>())
            .field("tables", &self.tables.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// The immutable, validated schema snapshot.
#[derive(Debug, Default)]
pub struct VSchema {
    keyspaces: HashMap<String, Arc<KeyspaceSchema>>,
    /// from_table -> to_tables (qualified), applied at name-resolution time.
    routing_rules: HashMap<String, Vec<String>>,
    /// (from_keyspace, shard) -> to_keyspace, applied at shard resolution.
    shard_routing_rules: HashMap<(String, String), String>,
    /// Unqualified table name -> owning keyspace; None marks ambiguity.
    global_tables: HashMap<String, Option<String>>,
}

impl VSchema {
    /// Build and validate a snapshot from the raw serving form.
    pub fn build(raw: &RawVSchema) -> Result<Arc<VSchema>> {
        let mut keyspaces = HashMap::new();
        for (ks_name, raw_ks) in &raw.keyspaces {
            let mut vindexes: HashMap<String, Arc<dyn Vindex>> = HashMap::new();
            if raw_ks.sharded {
                for (vname, rv) in &raw_ks.vindexes {
                    let params = VindexParams {
                        params: rv.params.clone().into_iter().collect(),
                        owner: rv.owner.clone(),
                    };
                    vindexes.insert(vname.clone(), build_vindex(&rv.vindex_type, vname, &params)?);
                }
            }
            // Vindexes and column vindexes are ignored for unsharded keyspaces.

            let mut tables = HashMap::new();
            for (t_name, raw_t) in &raw_ks.tables {
                let table = build_table(ks_name, t_name, raw_t, raw_ks.sharded, &vindexes)?;
                tables.insert(t_name.clone(), Arc::new(table));
            }

            let ks = KeyspaceSchema {
                name: ks_name.clone(),
                sharded: raw_ks.sharded,
                require_explicit_routing: raw_ks.require_explicit_routing,
                vindexes,
                tables,
            };
            validate_keyspace(&ks)?;
            keyspaces.insert(ks_name.clone(), Arc::new(ks));
        }

        let mut vschema = VSchema {
            keyspaces,
            routing_rules: raw
                .routing_rules
                .iter()
                .map(|r| (r.from_table.clone(), r.to_tables.clone()))
                .collect(),
            shard_routing_rules: raw
                .shard_routing_rules
                .iter()
                .map(|r| {
                    (
                        (r.from_keyspace.clone(), r.shard.clone()),
                        r.to_keyspace.clone(),
                    )
                })
                .collect(),
            global_tables: HashMap::new(),
        };
        vschema.index_global_tables();
        vschema.validate_sequences()?;
        Ok(Arc::new(vschema))
    }

    fn index_global_tables(&mut self) {
        for (ks_name, ks) in &self.keyspaces {
            if ks.require_explicit_routing {
                continue;
            }
            for t_name in ks.tables.keys() {
                self.global_tables
                    .entry(t_name.clone())
                    .and_modify(|owner| *owner = None)
                    .or_insert_with(|| Some(ks_name.clone()));
            }
        }
    }

    fn validate_sequences(&self) -> Result<()> {
        for ks in self.keyspaces.values() {
            for table in ks.tables.values() {
                if let Some(ai) = &table.auto_increment {
                    let seq = self.find_table(Some(&ks.name), &ai.sequence)?;
                    if seq.table_type != TableType::Sequence {
                        return Err(Error::invalid_argument(format!(
                            "auto_increment on {}.{} references {} which is not a sequence table",
                            ks.name, table.name, ai.sequence
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn keyspace(&self, name: &str) -> Result<&Arc<KeyspaceSchema>> {
        self.keyspaces
            .get(name)
            .ok_or_else(|| Error::not_found("keyspace", name))
    }

    pub fn keyspace_names(&self) -> Vec<&str> {
        self.keyspaces.keys().map(|s| s.as_str()).collect()
    }

    /// Resolve a (possibly qualified) table name. Routing rules are applied
    /// first; unqualified names fall back to global resolution across
    /// keyspaces that allow it.
    pub fn find_table(&self, keyspace: Option<&str>, name: &str) -> Result<Arc<Table>> {
        // Routing rules: most specific key first.
        let qualified = keyspace.map(|ks| format!("{}.{}", ks, name));
        let rule = qualified
            .as_deref()
            .and_then(|q| self.routing_rules.get(q))
            .or_else(|| self.routing_rules.get(name));
        if let Some(targets) = rule {
            let target = targets.first().ok_or_else(|| {
                Error::invalid_argument(format!("routing rule for {} has no targets", name))
            })?;
            let (ks, t) = target.split_once('.').ok_or_else(|| {
                Error::invalid_argument(format!("routing rule target {:?} is not qualified", target))
            })?;
            return self.find_table_direct(ks, t);
        }

        match keyspace {
            Some(ks) => self.find_table_direct(ks, name),
            None => {
                let owner = self
                    .global_tables
                    .get(name)
                    .ok_or_else(|| Error::not_found("table", name))?;
                match owner {
                    Some(ks) => self.find_table_direct(ks, name),
                    None => Err(Error::invalid_argument(format!(
                        "ambiguous table name {}: resolves to multiple keyspaces",
                        name
                    ))),
                }
            }
        }
    }

    fn find_table_direct(&self, keyspace: &str, name: &str) -> Result<Arc<Table>> {
        let ks = self.keyspace(keyspace)?;
        ks.tables
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("table", format!("{}.{}", keyspace, name)))
    }

    /// Apply shard routing rules: traffic for `(keyspace, shard)` may be
    /// redirected to another keyspace during a migration.
    pub fn route_shard<'a>(&'a self, keyspace: &'a str, shard: &str) -> &'a str {
        self.shard_routing_rules
            .get(&(keyspace.to_string(), shard.to_string()))
            .map(|s| s.as_str())
            .unwrap_or(keyspace)
    }
}

fn build_table(
    ks_name: &str,
    t_name: &str,
    raw: &RawTable,
    sharded: bool,
    vindexes: &HashMap<String, Arc<dyn Vindex>>,
) -> Result<Table> {
    let table_type = match raw.table_type.as_deref() {
        None | Some("") => TableType::Normal,
        Some("sequence") => TableType::Sequence,
        Some("reference") => TableType::Reference,
        Some(other) => {
            return Err(Error::invalid_argument(format!(
                "table {}.{}: unknown table type {:?}",
                ks_name, t_name, other
            )))
        }
    };

    let mut column_vindexes = Vec::new();
    if sharded {
        for cv in &raw.column_vindexes {
            let vindex = vindexes.get(&cv.name).cloned().ok_or_else(|| {
                Error::invalid_argument(format!(
                    "table {}.{}: column vindex references unknown vindex {:?}",
                    ks_name, t_name, cv.name
                ))
            })?;
            let columns = cv.column_list();
            if columns.is_empty() {
                return Err(Error::invalid_argument(format!(
                    "table {}.{}: column vindex {:?} names no columns",
                    ks_name, t_name, cv.name
                )));
            }
            column_vindexes.push(ColumnVindex {
                columns,
                name: cv.name.clone(),
                vindex,
            });
        }
    }

    let pinned = raw
        .pinned
        .as_deref()
        .map(|p| {
            hex::decode(p).map_err(|_| {
                Error::invalid_argument(format!(
                    "table {}.{}: pinned value is not hex: {:?}",
                    ks_name, t_name, p
                ))
            })
        })
        .transpose()?;

    Ok(Table {
        name: t_name.to_string(),
        keyspace: ks_name.to_string(),
        table_type,
        column_vindexes,
        auto_increment: raw.auto_increment.as_ref().map(|ai| AutoIncrement {
            column: ai.column.clone(),
            sequence: ai.sequence.clone(),
        }),
        pinned,
        source: raw.source.clone(),
        columns: raw
            .columns
            .iter()
            .map(|c| (c.name.clone(), c.column_type.clone()))
            .collect(),
        column_list_authoritative: raw.column_list_authoritative,
    })
}

fn validate_keyspace(ks: &KeyspaceSchema) -> Result<()> {
    if !ks.sharded {
        return Ok(());
    }
    for table in ks.tables.values() {
        if let Some(primary) = table.primary_vindex() {
            if !primary.vindex.is_unique() {
                return Err(Error::invalid_argument(format!(
                    "table {}.{}: primary vindex {} must be unique",
                    ks.name, table.name, primary.name
                )));
            }
            if !primary.vindex.is_functional() {
                warn!(
                    keyspace = %ks.name,
                    table = %table.name,
                    vindex = %primary.name,
                    "primary vindex is lookup-backed; functional vindexes are preferred"
                );
            }
        } else if table.table_type == TableType::Normal && table.pinned.is_none() {
            return Err(Error::invalid_argument(format!(
                "table {}.{}: sharded table needs a primary vindex or a pin",
                ks.name, table.name
            )));
        }
    }
    // An owned lookup vindex's owner must be a table in this keyspace that
    // declares the vindex.
    for (vname, vindex) in &ks.vindexes {
        if let Some(owner) = vindex.as_lookup().and_then(|l| l.owner()) {
            let owner_table = ks.tables.get(owner).ok_or_else(|| {
                Error::invalid_argument(format!(
                    "vindex {}.{}: owner table {:?} does not exist",
                    ks.name, vname, owner
                ))
            })?;
            if !owner_table.column_vindexes.iter().any(|cv| &cv.name == vname) {
                return Err(Error::invalid_argument(format!(
                    "vindex {}.{}: owner table {} does not declare it as a column vindex",
                    ks.name, vname, owner
                )));
            }
        }
    }
    Ok(())
}
