//! Query destinations.
//!
//! A destination says where a query fragment must run, in terms of shards,
//! keyspace ids, or key ranges. `resolve` turns it into concrete shard names
//! against a keyspace's serving shard set.

use std::fmt;

use storm_common::prelude::*;

use crate::keyrange::KeyRange;
use crate::topology::ShardRef;

/// Picks a shard index when any shard will do. Injectable so tests are
/// deterministic.
pub trait ShardPicker: Send + Sync {
    fn pick(&self, shard_count: usize) -> usize;
}

/// Default picker: uniform random.
#[derive(Debug, Default)]
pub struct RandomShardPicker;

impl ShardPicker for RandomShardPicker {
    fn pick(&self, shard_count: usize) -> usize {
        rand::random::<usize>() % shard_count
    }
}

/// Picker that always chooses a fixed index. For tests.
#[derive(Debug)]
pub struct FixedShardPicker(pub usize);

impl ShardPicker for FixedShardPicker {
    fn pick(&self, shard_count: usize) -> usize {
        self.0.min(shard_count.saturating_sub(1))
    }
}

/// Where a query fragment must run.
#[derive(Debug, Clone, PartialEq)]
pub enum Destination {
    /// Any single shard of the keyspace.
    AnyShard,
    /// Every shard of the keyspace.
    AllShards,
    /// One shard by name.
    Shard(String),
    /// Several shards by name.
    Shards(Vec<String>),
    /// The shard containing one keyspace id.
    KeyspaceId(Vec<u8>),
    /// The shards containing several keyspace ids.
    KeyspaceIds(Vec<Vec<u8>>),
    /// Every shard intersecting a key range.
    KeyRange(KeyRange),
    /// Every shard intersecting any of several key ranges.
    KeyRanges(Vec<KeyRange>),
    /// A key range that must align exactly to shard boundaries.
    ExactKeyRange(KeyRange),
    /// Several exactly-aligned key ranges.
    ExactKeyRanges(Vec<KeyRange>),
    /// No shard at all; a legal no-op.
    None,
}

impl Destination {
    /// Emit the name of every shard this destination resolves to.
    pub fn resolve(
        &self,
        all_shards: &[ShardRef],
        picker: &dyn ShardPicker,
        emit: &mut dyn FnMut(&str) -> Result<()>,
    ) -> Result<()> {
        match self {
            Destination::AnyShard => {
                if all_shards.is_empty() {
                    return Err(Error::unavailable("no shard in keyspace"));
                }
                emit(&all_shards[picker.pick(all_shards.len())].name)
            }
            Destination::AllShards => {
                for shard in all_shards {
                    emit(&shard.name)?;
                }
                Ok(())
            }
            Destination::Shard(name) => emit(name),
            Destination::Shards(names) => {
                for name in names {
                    emit(name)?;
                }
                Ok(())
            }
            Destination::KeyspaceId(ksid) => {
                emit(shard_for_keyspace_id(all_shards, ksid)?)
            }
            Destination::KeyspaceIds(ksids) => {
                for ksid in ksids {
                    emit(shard_for_keyspace_id(all_shards, ksid)?)?;
                }
                Ok(())
            }
            Destination::KeyRange(kr) => process_key_range(all_shards, kr, emit),
            Destination::KeyRanges(krs) => {
                for kr in krs {
                    process_key_range(all_shards, kr, emit)?;
                }
                Ok(())
            }
            Destination::ExactKeyRange(kr) => process_exact_key_range(all_shards, kr, emit),
            Destination::ExactKeyRanges(krs) => {
                for kr in krs {
                    process_exact_key_range(all_shards, kr, emit)?;
                }
                Ok(())
            }
            Destination::None => Ok(()),
        }
    }

    /// Convenience wrapper collecting the resolved shard names.
    pub fn resolve_to_vec(
        &self,
        all_shards: &[ShardRef],
        picker: &dyn ShardPicker,
    ) -> Result<Vec<String>> {
        let mut out = Vec::new();
        self.resolve(all_shards, picker, &mut |shard| {
            out.push(shard.to_string());
            Ok(())
        })?;
        Ok(out)
    }

    /// Whether this destination targets at most one shard by construction.
    pub fn is_unique(&self) -> bool {
        matches!(
            self,
            Destination::AnyShard
                | Destination::Shard(_)
                | Destination::KeyspaceId(_)
                | Destination::None
        )
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::AnyShard => write!(f, "DestinationAnyShard()"),
            Destination::AllShards => write!(f, "DestinationAllShards()"),
            Destination::Shard(s) => write!(f, "DestinationShard({})", s),
            Destination::Shards(s) => write!(f, "DestinationShards({})", s.join(",")),
            Destination::KeyspaceId(id) => {
                write!(f, "DestinationKeyspaceID({})", hex::encode(id))
            }
            Destination::KeyspaceIds(ids) => {
                write!(f, "DestinationKeyspaceIDs(")?;
                for (i, id) in ids.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", hex::encode(id))?;
                }
                write!(f, ")")
            }
            Destination::KeyRange(kr) => write!(f, "DestinationKeyRange({})", kr),
            Destination::KeyRanges(krs) => {
                write!(f, "DestinationKeyRanges(")?;
                for (i, kr) in krs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", kr)?;
                }
                write!(f, ")")
            }
            Destination::ExactKeyRange(kr) => write!(f, "DestinationExactKeyRange({})", kr),
            Destination::ExactKeyRanges(krs) => {
                write!(f, "DestinationExactKeyRanges(")?;
                for (i, kr) in krs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", kr)?;
                }
                write!(f, ")")
            }
            Destination::None => write!(f, "DestinationNone()"),
        }
    }
}

/// The single shard whose range contains `keyspace_id`.
pub fn shard_for_keyspace_id<'a>(
    all_shards: &'a [ShardRef],
    keyspace_id: &[u8],
) -> Result<&'a str> {
    if all_shards.is_empty() {
        return Err(Error::unavailable("no shard in keyspace"));
    }
    for shard in all_shards {
        if shard.range.contains(keyspace_id) {
            return Ok(&shard.name);
        }
    }
    Err(Error::invalid_argument(format!(
        "keyspace id {} did not match any shard",
        hex::encode(keyspace_id)
    )))
}

fn process_key_range(
    all_shards: &[ShardRef],
    kr: &KeyRange,
    emit: &mut dyn FnMut(&str) -> Result<()>,
) -> Result<()> {
    for shard in all_shards {
        if kr.intersects(&shard.range) {
            emit(&shard.name)?;
        }
    }
    Ok(())
}

/// Walk shards from the one whose start equals the range's start, emitting
/// until a shard's end equals the range's end. Any misalignment fails.
fn process_exact_key_range(
    all_shards: &[ShardRef],
    kr: &KeyRange,
    emit: &mut dyn FnMut(&str) -> Result<()>,
) -> Result<()> {
    let mut sorted: Vec<&ShardRef> = all_shards.iter().collect();
    sorted.sort_by(|a, b| a.range.start.cmp(&b.range.start));

    let mut idx = 0;
    while idx < sorted.len() {
        if kr.start_equal(&sorted[idx].range) {
            break;
        }
        idx += 1;
    }
    while idx < sorted.len() {
        if !kr.intersects(&sorted[idx].range) {
            break;
        }
        emit(&sorted[idx].name)?;
        if kr.end_equal(&sorted[idx].range) {
            return Ok(());
        }
        idx += 1;
    }
    Err(Error::invalid_argument(format!(
        "keyrange {} does not exactly match shards",
        kr
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Topology;

    fn shards() -> Vec<ShardRef> {
        let mut topo = Topology::new();
        topo.add_keyspace("ks", &["-40", "40-80", "80-c0", "c0-"]).unwrap();
        topo.shards("ks").unwrap().to_vec()
    }

    #[test]
    fn test_all_and_any() {
        let shards = shards();
        let all = Destination::AllShards
            .resolve_to_vec(&shards, &RandomShardPicker)
            .unwrap();
        assert_eq!(all, vec!["-40", "40-80", "80-c0", "c0-"]);

        let any = Destination::AnyShard
            .resolve_to_vec(&shards, &FixedShardPicker(2))
            .unwrap();
        assert_eq!(any, vec!["80-c0"]);
    }

    #[test]
    fn test_any_shard_empty_keyspace() {
        let err = Destination::AnyShard
            .resolve_to_vec(&[], &RandomShardPicker)
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
    }

    #[test]
    fn test_keyspace_id_resolution() {
        let shards = shards();
        let one = Destination::KeyspaceId(vec![0x55])
            .resolve_to_vec(&shards, &RandomShardPicker)
            .unwrap();
        assert_eq!(one, vec!["40-80"]);

        let many = Destination::KeyspaceIds(vec![vec![0x00], vec![0xff]])
            .resolve_to_vec(&shards, &RandomShardPicker)
            .unwrap();
        assert_eq!(many, vec!["-40", "c0-"]);
    }

    #[test]
    fn test_key_range_intersection() {
        let shards = shards();
        let hit = Destination::KeyRange(KeyRange::parse("50-90").unwrap())
            .resolve_to_vec(&shards, &RandomShardPicker)
            .unwrap();
        assert_eq!(hit, vec!["40-80", "80-c0"]);
    }

    #[test]
    fn test_exact_key_range_aligned() {
        let shards = shards();
        let hit = Destination::ExactKeyRange(KeyRange::parse("40-c0").unwrap())
            .resolve_to_vec(&shards, &RandomShardPicker)
            .unwrap();
        assert_eq!(hit, vec!["40-80", "80-c0"]);

        let full = Destination::ExactKeyRange(KeyRange::full())
            .resolve_to_vec(&shards, &RandomShardPicker)
            .unwrap();
        assert_eq!(full.len(), 4);
    }

    #[test]
    fn test_exact_key_range_misaligned() {
        let shards = shards();
        for spec in ["50-c0", "40-b0"] {
            let err = Destination::ExactKeyRange(KeyRange::parse(spec).unwrap())
                .resolve_to_vec(&shards, &RandomShardPicker)
                .unwrap_err();
            assert!(
                matches!(&err, Error::InvalidArgument(msg) if msg.contains("does not exactly match")),
                "spec {} gave {:?}",
                spec,
                err
            );
        }
        // Aligned at start and running to the unbounded tail is exact.
        let ok = Destination::ExactKeyRange(KeyRange::parse("40-").unwrap())
            .resolve_to_vec(&shards, &RandomShardPicker)
            .unwrap();
        assert_eq!(ok, vec!["40-80", "80-c0", "c0-"]);
    }

    #[test]
    fn test_none_is_noop() {
        let shards = shards();
        let out = Destination::None
            .resolve_to_vec(&shards, &RandomShardPicker)
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Destination::KeyspaceId(vec![0xab]).to_string(),
            "DestinationKeyspaceID(ab)"
        );
        assert_eq!(Destination::None.to_string(), "DestinationNone()");
    }
}
