//! Distributed transaction identifiers.
//!
//! A dtid names the metadata-manager transaction record:
//! `<keyspace>:<shard>:<id>`. The keyspace/shard locate the shard holding
//! the transaction record; the id is unique within it.

use std::fmt;

use storm_common::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dtid {
    pub keyspace: String,
    pub shard: String,
    pub id: u64,
}

impl Dtid {
    pub fn new(keyspace: impl Into<String>, shard: impl Into<String>, id: u64) -> Self {
        Self {
            keyspace: keyspace.into(),
            shard: shard.into(),
            id,
        }
    }

    pub fn parse(s: &str) -> Result<Dtid> {
        let mut parts = s.splitn(3, ':');
        let (Some(keyspace), Some(shard), Some(id)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::invalid_argument(format!("invalid dtid: {:?}", s)));
        };
        if keyspace.is_empty() || shard.is_empty() {
            return Err(Error::invalid_argument(format!("invalid dtid: {:?}", s)));
        }
        let id = id
            .parse::<u64>()
            .map_err(|_| Error::invalid_argument(format!("invalid dtid: {:?}", s)))?;
        Ok(Dtid::new(keyspace, shard, id))
    }
}

impl fmt::Display for Dtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.keyspace, self.shard, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let dtid = Dtid::new("ks", "-80", 42);
        assert_eq!(dtid.to_string(), "ks:-80:42");
        assert_eq!(Dtid::parse("ks:-80:42").unwrap(), dtid);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Dtid::parse("ks:-80").is_err());
        assert!(Dtid::parse("ks:-80:abc").is_err());
        assert!(Dtid::parse("::1").is_err());
    }
}
