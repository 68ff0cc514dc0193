//! Key-range arithmetic.
//!
//! A shard owns a half-open interval `[start, end)` over the 8-byte
//! big-endian key space. The empty byte string denotes unbounded on either
//! side, so the full range is `["", "")`. Comparisons treat a keyspace id as
//! an infinite-precision fraction: `[0x80]` sorts the same as
//! `[0x80, 0x00, ...]`, which byte-prefix comparison gives us for free.

use serde::{Deserialize, Serialize};
use std::fmt;

use storm_common::prelude::*;

/// Half-open interval `[start, end)`; empty bytes mean unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    #[serde(with = "hex_bytes", default, skip_serializing_if = "Vec::is_empty")]
    pub start: Vec<u8>,
    #[serde(with = "hex_bytes", default, skip_serializing_if = "Vec::is_empty")]
    pub end: Vec<u8>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

impl KeyRange {
    /// The full, unbounded range.
    pub fn full() -> Self {
        Self::default()
    }

    pub fn new(start: Vec<u8>, end: Vec<u8>) -> Self {
        Self { start, end }
    }

    pub fn is_full(&self) -> bool {
        self.start.is_empty() && self.end.is_empty()
    }

    /// Parse the `start-end` shard syntax: lowercase hex halves, empty for
    /// unbounded. `"0"` (the conventional unsharded shard name) parses as
    /// the full range.
    pub fn parse(spec: &str) -> Result<Self> {
        if spec == "0" {
            return Ok(Self::full());
        }
        let (start, end) = spec.split_once('-').ok_or_else(|| {
            Error::invalid_argument(format!("malformed key range: {:?}", spec))
        })?;
        let decode = |part: &str| -> Result<Vec<u8>> {
            hex::decode(part)
                .map_err(|_| Error::invalid_argument(format!("malformed key range: {:?}", spec)))
        };
        Ok(Self {
            start: decode(start)?,
            end: decode(end)?,
        })
    }

    /// The `start-end` shard string for this range.
    pub fn to_shard_string(&self) -> String {
        format!("{}-{}", hex::encode(&self.start), hex::encode(&self.end))
    }

    /// Whether `keyspace_id` falls inside `[start, end)`.
    pub fn contains(&self, keyspace_id: &[u8]) -> bool {
        keyspace_id >= &self.start[..] && (self.end.is_empty() || keyspace_id < &self.end[..])
    }

    /// Whether two ranges overlap.
    pub fn intersects(&self, other: &KeyRange) -> bool {
        let self_starts_before_other_ends =
            other.end.is_empty() || self.start[..] < other.end[..];
        let other_starts_before_self_ends =
            self.end.is_empty() || other.start[..] < self.end[..];
        self_starts_before_other_ends && other_starts_before_self_ends
    }

    pub fn start_equal(&self, other: &KeyRange) -> bool {
        self.start == other.start
    }

    pub fn end_equal(&self, other: &KeyRange) -> bool {
        self.end == other.end
    }

    /// Sort key: by start, empty first.
    pub fn less(&self, other: &KeyRange) -> bool {
        self.start < other.start
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_shard_string())
    }
}

/// Verify that `ranges` partition the full key space: sorted by start, the
/// first starts unbounded, each end meets the next start, the last ends
/// unbounded.
pub fn partition_complete(ranges: &[KeyRange]) -> bool {
    if ranges.is_empty() {
        return false;
    }
    let mut sorted: Vec<&KeyRange> = ranges.iter().collect();
    sorted.sort_by(|a, b| a.start.cmp(&b.start));

    if !sorted[0].start.is_empty() {
        return false;
    }
    for pair in sorted.windows(2) {
        if pair[0].end.is_empty() || pair[0].end != pair[1].start {
            return false;
        }
    }
    sorted[sorted.len() - 1].end.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_print() {
        let kr = KeyRange::parse("-80").unwrap();
        assert_eq!(kr.start, Vec::<u8>::new());
        assert_eq!(kr.end, vec![0x80]);
        assert_eq!(kr.to_shard_string(), "-80");

        let kr = KeyRange::parse("80-c0").unwrap();
        assert_eq!(kr.start, vec![0x80]);
        assert_eq!(kr.end, vec![0xc0]);

        let kr = KeyRange::parse("c0-").unwrap();
        assert_eq!(kr.end, Vec::<u8>::new());

        assert!(KeyRange::parse("0").unwrap().is_full());
        assert!(KeyRange::parse("junk").is_err());
        assert!(KeyRange::parse("zz-").is_err());
    }

    #[test]
    fn test_contains_half_open() {
        let kr = KeyRange::parse("40-80").unwrap();
        assert!(kr.contains(&[0x40]));
        assert!(kr.contains(&[0x7f, 0xff]));
        assert!(!kr.contains(&[0x80]));
        assert!(!kr.contains(&[0x3f, 0xff]));

        let full = KeyRange::full();
        assert!(full.contains(&[]));
        assert!(full.contains(&[0xff; 8]));
    }

    #[test]
    fn test_contains_prefix_semantics() {
        // [0x80] and [0x80, 0x00...] are the same point in the key space.
        let kr = KeyRange::parse("80-").unwrap();
        assert!(kr.contains(&[0x80]));
        assert!(kr.contains(&[0x80, 0, 0, 0, 0, 0, 0, 0]));
        let left = KeyRange::parse("-80").unwrap();
        assert!(!left.contains(&[0x80, 0, 0, 0, 0, 0, 0, 0]));
    }

    #[test]
    fn test_intersects() {
        let a = KeyRange::parse("-80").unwrap();
        let b = KeyRange::parse("80-").unwrap();
        let c = KeyRange::parse("40-c0").unwrap();
        assert!(!a.intersects(&b));
        assert!(a.intersects(&c));
        assert!(b.intersects(&c));
        assert!(KeyRange::full().intersects(&a));
    }

    #[test]
    fn test_partition_complete() {
        let good = vec![
            KeyRange::parse("80-c0").unwrap(),
            KeyRange::parse("-80").unwrap(),
            KeyRange::parse("c0-").unwrap(),
        ];
        assert!(partition_complete(&good));

        assert!(partition_complete(&[KeyRange::full()]));

        // Gap between 0x80 and 0xc0.
        let gap = vec![KeyRange::parse("-80").unwrap(), KeyRange::parse("c0-").unwrap()];
        assert!(!partition_complete(&gap));

        // Missing unbounded tail.
        let short = vec![KeyRange::parse("-80").unwrap(), KeyRange::parse("80-c0").unwrap()];
        assert!(!partition_complete(&short));

        assert!(!partition_complete(&[]));
    }

    #[test]
    fn test_serde_hex_form() {
        let kr = KeyRange::parse("80-c0").unwrap();
        let json = serde_json::to_string(&kr).unwrap();
        assert_eq!(json, r#"{"start":"80","end":"c0"}"#);
        let back: KeyRange = serde_json::from_str(&json).unwrap();
        assert_eq!(back, kr);
    }
}
