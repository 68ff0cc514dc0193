//! Data-driven vindex construction.
//!
//! The VSchema loader builds concrete vindex objects by type name. Adding a
//! vindex type means adding a row to the table below; callers never name
//! concrete types.

use std::sync::Arc;

use storm_common::prelude::*;

use crate::charset::UnicodeLooseMd5Vindex;
use crate::consistent::ConsistentLookupUniqueVindex;
use crate::hash::{HashVindex, XxHashVindex};
use crate::lookup::{LookupNonUniqueVindex, LookupUniqueVindex};
use crate::numeric::NumericVindex;
use crate::{Vindex, VindexParams};

type Factory = fn(&str, &VindexParams) -> Result<Arc<dyn Vindex>>;

const REGISTRY: &[(&str, Factory)] = &[
    ("hash", |name, _| Ok(Arc::new(HashVindex::new(name)))),
    ("xxhash", |name, _| Ok(Arc::new(XxHashVindex::new(name)))),
    ("numeric", |name, _| Ok(Arc::new(NumericVindex::new(name)))),
    ("unicode_loose_md5", |name, _| {
        Ok(Arc::new(UnicodeLooseMd5Vindex::new(name)))
    }),
    ("lookup", |name, params| {
        Ok(Arc::new(LookupNonUniqueVindex::from_params(name, params)?))
    }),
    ("lookup_unique", |name, params| {
        Ok(Arc::new(LookupUniqueVindex::from_params(name, params)?))
    }),
    ("consistent_lookup_unique", |name, params| {
        Ok(Arc::new(ConsistentLookupUniqueVindex::from_params(
            name, params,
        )?))
    }),
];

/// Construct a vindex instance from its VSchema declaration.
pub fn build_vindex(
    vindex_type: &str,
    name: &str,
    params: &VindexParams,
) -> Result<Arc<dyn Vindex>> {
    for (tname, factory) in REGISTRY {
        if *tname == vindex_type {
            return factory(name, params);
        }
    }
    Err(Error::not_found("vindex type", vindex_type))
}

/// All registered type names, mainly for diagnostics.
pub fn known_types() -> Vec<&'static str> {
    REGISTRY.iter().map(|(name, _)| *name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_build_functional_vindexes() {
        for vtype in ["hash", "xxhash", "numeric", "unicode_loose_md5"] {
            let v = build_vindex(vtype, "v1", &VindexParams::default()).unwrap();
            assert!(v.is_functional(), "{} should be functional", vtype);
            assert!(v.is_unique(), "{} should be unique", vtype);
            assert!(!v.needs_cursor());
        }
    }

    #[test]
    fn test_build_lookup_vindexes() {
        let mut params = HashMap::new();
        params.insert("table".to_string(), "lk.idx".to_string());
        params.insert("from".to_string(), "c".to_string());
        params.insert("to".to_string(), "keyspace_id".to_string());
        let params = VindexParams {
            params,
            owner: Some("t".to_string()),
        };

        let v = build_vindex("lookup", "v1", &params).unwrap();
        assert!(!v.is_unique());
        assert!(v.needs_cursor());

        let v = build_vindex("lookup_unique", "v1", &params).unwrap();
        assert!(v.is_unique());

        let v = build_vindex("consistent_lookup_unique", "v1", &params).unwrap();
        assert!(v.is_unique());
        assert_eq!(v.as_lookup().unwrap().owner(), Some("t"));
    }

    #[test]
    fn test_unknown_type() {
        let err = build_vindex("no_such_type", "v1", &VindexParams::default()).unwrap_err();
        assert_eq!(err.code(), Some("VT05000"));
    }

    #[test]
    fn test_lookup_missing_params() {
        let err = build_vindex("lookup", "v1", &VindexParams::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_known_types_stable() {
        let types = known_types();
        assert!(types.contains(&"hash"));
        assert!(types.contains(&"consistent_lookup_unique"));
    }
}
