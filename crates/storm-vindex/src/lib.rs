//! # Storm Vindex
//!
//! Vindexes map column values to keyspace ids. A keyspace id is an opaque
//! byte sequence; the resolver locates the shard whose key range contains it.
//!
//! Vindexes come in two families:
//! - **functional** vindexes compute the mapping purely from the input value
//!   (hash, xxhash, numeric, unicode_loose_md5);
//! - **lookup** vindexes read a backing table through a [`VindexCursor`]
//!   (lookup, lookup_unique, consistent_lookup_unique).
//!
//! New vindex types are registered in [`registry`]; the VSchema loader
//! constructs instances by type name, never by hardcoding concrete types.

pub mod charset;
pub mod consistent;
pub mod hash;
pub mod lookup;
pub mod numeric;
pub mod registry;

#[cfg(test)]
pub(crate) mod testutil;

use std::collections::HashMap;

use async_trait::async_trait;
use storm_common::prelude::*;

pub use registry::build_vindex;

/// The outcome of mapping one input value.
#[derive(Debug, Clone, PartialEq)]
pub enum VindexResult {
    /// No mapping exists for this value.
    None,
    /// Exactly one keyspace id (unique vindexes).
    Id(Vec<u8>),
    /// Several candidate keyspace ids (non-unique vindexes).
    Ids(Vec<Vec<u8>>),
}

/// Identifies a lookup vindex's backing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupTableDef {
    /// Qualified backing table name, e.g. `lookup_ks.things_name_lookup`.
    pub table: String,
    /// The column holding the indexed value.
    pub from_column: String,
    /// The column holding the hex keyspace id.
    pub to_column: String,
}

/// The executor-side seam lookup vindexes run their reads and writes through.
///
/// Implemented by the engine's VCursor. Every method takes the caller's
/// [`ExecContext`]; implementations must propagate it so backend ACLs see the
/// original identity.
#[async_trait]
pub trait VindexCursor: Send + Sync {
    /// `SELECT to, from FROM table WHERE from IN (values)` against the
    /// backing table. Returns, per input value, the keyspace ids currently
    /// mapped to it.
    async fn lookup(
        &self,
        ctx: &ExecContext,
        def: &LookupTableDef,
        values: &[Value],
    ) -> Result<Vec<Vec<Vec<u8>>>>;

    /// Insert `(from, to)` rows into the backing table. With `ignore` set,
    /// duplicate rows are skipped; otherwise a duplicate fails with
    /// `AlreadyExists`.
    async fn lookup_create(
        &self,
        ctx: &ExecContext,
        def: &LookupTableDef,
        rows: &[(Value, Vec<u8>)],
        ignore: bool,
    ) -> Result<()>;

    /// Point-update the keyspace id mapped to `from`.
    async fn lookup_update(
        &self,
        ctx: &ExecContext,
        def: &LookupTableDef,
        from: &Value,
        keyspace_id: &[u8],
    ) -> Result<()>;

    /// Delete `(from, to)` rows from the backing table.
    async fn lookup_delete(
        &self,
        ctx: &ExecContext,
        def: &LookupTableDef,
        rows: &[(Value, Vec<u8>)],
    ) -> Result<()>;

    /// Whether the owner table currently holds a row with `column = value`
    /// on the shard owning `keyspace_id`. Used by the consistent-lookup
    /// duplicate path to distinguish live mappings from stale ones.
    async fn owner_row_exists(
        &self,
        ctx: &ExecContext,
        owner_table: &str,
        column: &str,
        value: &Value,
        keyspace_id: &[u8],
    ) -> Result<bool>;
}

/// A vindex: a named, typed function from column values to keyspace ids.
#[async_trait]
pub trait Vindex: Send + Sync + std::fmt::Debug {
    /// The instance name from the VSchema (not the type name).
    fn name(&self) -> &str;

    /// Relative cost; the planner prefers the cheapest vindex that covers a
    /// predicate. Functional vindexes are 1, lookups are 10-20.
    fn cost(&self) -> u32;

    /// One keyspace id per input value?
    fn is_unique(&self) -> bool;

    /// Pure mapping, no backing-table reads?
    fn is_functional(&self) -> bool;

    /// Does `map` need a live cursor? True exactly for lookup vindexes.
    fn needs_cursor(&self) -> bool {
        !self.is_functional()
    }

    /// Can `reverse` recover input values from keyspace ids?
    fn is_reversible(&self) -> bool {
        false
    }

    /// Map each input value to its keyspace id(s).
    async fn map(
        &self,
        ctx: &ExecContext,
        cursor: Option<&dyn VindexCursor>,
        values: &[Value],
    ) -> Result<Vec<VindexResult>>;

    /// For each (value, keyspace id) pair, whether the current placement
    /// matches the vindex.
    async fn verify(
        &self,
        ctx: &ExecContext,
        cursor: Option<&dyn VindexCursor>,
        values: &[Value],
        keyspace_ids: &[Vec<u8>],
    ) -> Result<Vec<bool>>;

    /// Recover the input value for a keyspace id. Only valid when
    /// `is_reversible()`.
    fn reverse(&self, _keyspace_id: &[u8]) -> Result<Value> {
        Err(Error::unsupported(format!(
            "vindex {} is not reversible",
            self.name()
        )))
    }

    /// Downcast hook for lookup maintenance operations.
    fn as_lookup(&self) -> Option<&dyn LookupVindex> {
        None
    }
}

/// Maintenance surface of table-backed vindexes. Only owned lookup vindexes
/// (those with an `owner` table) receive create/update/delete calls.
#[async_trait]
pub trait LookupVindex: Vindex {
    /// The owner table name, if this vindex is owned.
    fn owner(&self) -> Option<&str>;

    /// The backing-table definition.
    fn table_def(&self) -> &LookupTableDef;

    /// Record new `(value, keyspace id)` mappings. Runs before the owner row
    /// insert so a concurrent reader never finds an owner without a mapping.
    async fn create(
        &self,
        ctx: &ExecContext,
        cursor: &dyn VindexCursor,
        rows: &[(Value, Vec<u8>)],
        ignore_mode: bool,
    ) -> Result<()>;

    /// Move a mapping when the indexed column changes.
    async fn update(
        &self,
        ctx: &ExecContext,
        cursor: &dyn VindexCursor,
        old_value: &Value,
        new_value: &Value,
        keyspace_id: &[u8],
    ) -> Result<()>;

    /// Remove mappings for deleted owner rows.
    async fn delete(
        &self,
        ctx: &ExecContext,
        cursor: &dyn VindexCursor,
        values: &[Value],
        keyspace_id: &[u8],
    ) -> Result<()>;
}

/// Vindex construction parameters from the VSchema (`params` map plus the
/// optional `owner` table).
#[derive(Debug, Clone, Default)]
pub struct VindexParams {
    pub params: HashMap<String, String>,
    pub owner: Option<String>,
}

impl VindexParams {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(|s| s.as_str())
    }

    pub fn require(&self, vindex: &str, key: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| {
            Error::invalid_argument(format!("vindex {}: missing param {:?}", vindex, key))
        })
    }
}
