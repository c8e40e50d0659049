//! Shard routing: partition start-key lists and key/bound helpers.
//!
//! The engine never talks to cluster metadata directly; it consumes a
//! [`ShardRouter`] that answers three questions: how many shards exist, which
//! shard owns a key, and what key range a shard covers. [`StaticShardMap`] is
//! the in-process implementation used by embedding layers and tests, covering
//! both hash partitioning (two-byte big-endian hash-code boundaries) and
//! range partitioning (arbitrary byte-string boundaries).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use bytes::Bytes;

use crate::error::{ExecError, ExecResult};

/// Partition-to-key routing consumed by logical operations.
///
/// Invariant: `partition_keys()` is strictly increasing and its first entry is
/// the empty key, so shard `i` owns `[key[i], key[i+1])` with the last upper
/// bound open.
pub trait ShardRouter: Send + Sync {
    /// Ordered list of shard start keys.
    fn partition_keys(&self) -> &[Bytes];

    /// Number of shards.
    fn shard_count(&self) -> usize {
        self.partition_keys().len()
    }

    /// Number of storage nodes backing the table, used to derive a default
    /// parallelism level.
    fn node_count(&self) -> usize;

    /// Routes a key (row identifier or encoded partition key) to the shard
    /// owning it.
    fn shard_index_for_key(&self, key: &[u8]) -> ExecResult<usize> {
        let keys = self.partition_keys();
        if keys.is_empty() {
            return Err(ExecError::invalid_argument("router has no shards"));
        }
        // First start key is empty, so partition_point is always >= 1.
        Ok(keys.partition_point(|start| start.as_ref() <= key) - 1)
    }

    /// Key range `[lower, upper)` owned by a shard; an empty upper bound is
    /// open.
    fn shard_key_range(&self, index: usize) -> ExecResult<(Bytes, Bytes)> {
        let keys = self.partition_keys();
        if index >= keys.len() {
            return Err(ExecError::invalid_argument(format!(
                "shard index {index} out of range ({} shards)",
                keys.len()
            )));
        }
        let upper = keys.get(index + 1).cloned().unwrap_or_else(Bytes::new);
        Ok((keys[index].clone(), upper))
    }

    /// Whether `key` is a hash-partition boundary marker. Such markers are
    /// hash-code prefixes, not row identifiers, and must not be compared
    /// against row ids.
    fn is_hash_key_bound(&self, key: &[u8]) -> bool;

    /// Stable 16-bit hash code for a tuple of encoded hash-column values.
    fn hash_code_for_values(&self, values: &[Bytes]) -> u16 {
        let mut hasher = DefaultHasher::new();
        for value in values {
            value.as_ref().hash(&mut hasher);
        }
        (hasher.finish() & 0xffff) as u16
    }
}

/// Key space used by a [`StaticShardMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardKeySpace {
    /// Start keys are two-byte big-endian hash codes; the first is empty.
    Hash,
    /// Start keys are arbitrary byte strings; the first is empty.
    Range,
}

/// Immutable in-process shard map.
#[derive(Debug, Clone)]
pub struct StaticShardMap {
    keys: Vec<Bytes>,
    space: ShardKeySpace,
    node_count: usize,
}

impl StaticShardMap {
    /// Builds a hash-partitioned map with `shard_count` evenly split
    /// hash-code ranges.
    pub fn hash(shard_count: usize, node_count: usize) -> ExecResult<Self> {
        if shard_count == 0 {
            return Err(ExecError::invalid_argument("shard count must be positive"));
        }
        let mut keys = Vec::with_capacity(shard_count);
        keys.push(Bytes::new());
        for index in 1..shard_count {
            let code = ((index as u64 * 0x10000) / shard_count as u64) as u16;
            keys.push(Bytes::copy_from_slice(&code.to_be_bytes()));
        }
        Ok(Self {
            keys,
            space: ShardKeySpace::Hash,
            node_count: node_count.max(1),
        })
    }

    /// Builds a range-partitioned map from explicit split keys. The first key
    /// must be empty and keys must be strictly increasing.
    pub fn range(keys: Vec<Bytes>, node_count: usize) -> ExecResult<Self> {
        if keys.is_empty() || !keys[0].is_empty() {
            return Err(ExecError::invalid_argument(
                "range map requires a leading empty start key",
            ));
        }
        if keys.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(ExecError::invalid_argument(
                "shard start keys must be strictly increasing",
            ));
        }
        Ok(Self {
            keys,
            space: ShardKeySpace::Range,
            node_count: node_count.max(1),
        })
    }
}

impl ShardRouter for StaticShardMap {
    fn partition_keys(&self) -> &[Bytes] {
        &self.keys
    }

    fn node_count(&self) -> usize {
        self.node_count
    }

    fn is_hash_key_bound(&self, key: &[u8]) -> bool {
        self.space == ShardKeySpace::Hash && (key.is_empty() || key.len() == 2)
    }
}

/// Returns the lexicographically larger of two start bounds, treating an
/// empty bound as unbounded below.
pub fn max_start_bound<'a>(left: &'a [u8], right: &'a [u8]) -> &'a [u8] {
    if right.is_empty() || (!left.is_empty() && left >= right) {
        left
    } else {
        right
    }
}

/// Returns the tighter of two exclusive end bounds, treating an empty bound
/// as unbounded above.
pub fn min_end_bound<'a>(left: &'a [u8], right: &'a [u8]) -> &'a [u8] {
    match (left.is_empty(), right.is_empty()) {
        (true, _) => right,
        (_, true) => left,
        _ if left <= right => left,
        _ => right,
    }
}

/// Checks whether `key` falls in `[start, end)` where empty bounds are open.
pub fn key_in_range(key: &[u8], start: &[u8], end: &[u8]) -> bool {
    (start.is_empty() || key >= start) && (end.is_empty() || key < end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_map_routes_by_code_prefix() {
        let map = StaticShardMap::hash(4, 3).unwrap();
        assert_eq!(map.shard_count(), 4);
        // Shard boundaries at 0x4000, 0x8000, 0xc000.
        assert_eq!(map.shard_index_for_key(&[0x00, 0x01, b'x']).unwrap(), 0);
        assert_eq!(map.shard_index_for_key(&[0x40, 0x00]).unwrap(), 1);
        assert_eq!(map.shard_index_for_key(&[0x7f, 0xff, b'y']).unwrap(), 1);
        assert_eq!(map.shard_index_for_key(&[0xff, 0xff]).unwrap(), 3);
        assert!(map.is_hash_key_bound(&[0x40, 0x00]));
        assert!(!map.is_hash_key_bound(b"row-id"));
    }

    #[test]
    fn range_map_validates_and_routes() {
        let keys = vec![
            Bytes::new(),
            Bytes::from_static(b"g"),
            Bytes::from_static(b"p"),
        ];
        let map = StaticShardMap::range(keys, 2).unwrap();
        assert_eq!(map.shard_index_for_key(b"a").unwrap(), 0);
        assert_eq!(map.shard_index_for_key(b"g").unwrap(), 1);
        assert_eq!(map.shard_index_for_key(b"z").unwrap(), 2);
        let (lower, upper) = map.shard_key_range(1).unwrap();
        assert_eq!(lower.as_ref(), b"g");
        assert_eq!(upper.as_ref(), b"p");
        let (_, last_upper) = map.shard_key_range(2).unwrap();
        assert!(last_upper.is_empty());
        assert!(!map.is_hash_key_bound(b"g"));

        let bad = StaticShardMap::range(
            vec![Bytes::new(), Bytes::from_static(b"m"), Bytes::from_static(b"m")],
            1,
        );
        assert!(matches!(bad, Err(ExecError::InvalidArgument(_))));
    }

    #[test]
    fn bound_helpers_treat_empty_as_open() {
        assert_eq!(max_start_bound(b"", b"c"), b"c");
        assert_eq!(max_start_bound(b"d", b""), b"d");
        assert_eq!(max_start_bound(b"b", b"c"), b"c");
        assert_eq!(min_end_bound(b"", b"c"), b"c");
        assert_eq!(min_end_bound(b"d", b""), b"d");
        assert_eq!(min_end_bound(b"d", b"c"), b"c");
        assert!(key_in_range(b"c", b"", b""));
        assert!(key_in_range(b"c", b"c", b"d"));
        assert!(!key_in_range(b"d", b"c", b"d"));
    }
}
