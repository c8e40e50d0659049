//! Cross-product expansion of multi-column hash/range IN predicates.
//!
//! Given per-hash-column candidate lists (scalar or tuple-valued), the
//! expander enumerates every combination in a stable mixed-radix order.
//! Tuple candidates spanning hash and range columns are split: the hash
//! sub-columns participate in the cross product while covered range columns
//! only constrain it. In batching mode, generated permutations accumulate
//! into a per-shard arena of hash tuples so the physical operation count is
//! bounded by the shard count regardless of the permutation count.

use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use crate::error::{ExecError, ExecResult};
use crate::operation::{ColumnBind, HashTuple};

/// One candidate expression of one hash column.
#[derive(Debug, Clone)]
pub enum Candidate {
    /// Scalar candidate constraining only the anchored column.
    Scalar(Bytes),
    /// Tuple candidate; values align with `columns` (hash columns first).
    Tuple {
        /// Covered column indexes shared by every candidate of the list.
        columns: Arc<[usize]>,
        /// Encoded values, one per covered column.
        values: Vec<Bytes>,
    },
}

/// One fully chosen permutation, split into per-column values.
#[derive(Debug, Default, Clone)]
pub struct Permutation {
    /// Encoded value per hash column, indexed by hash column position.
    pub hash_values: Vec<Bytes>,
    /// `(range column index, encoded value)` pairs sorted by column.
    pub range_values: Vec<(usize, Bytes)>,
}

/// Mixed-radix cross-product generator over per-column candidate lists.
#[derive(Debug)]
pub struct PermutationExpander {
    /// Candidate list per hash column; empty when the column is covered by a
    /// tuple anchored earlier.
    partition_exprs: Vec<Vec<Candidate>>,
    /// Ordered indexes of range columns nested in tuple candidates.
    range_column_indexes: Vec<usize>,
    total_permutations: usize,
    next_permutation: usize,
    num_hash_columns: usize,
}

impl PermutationExpander {
    /// Builds the expander from a request's partition predicate slots.
    pub fn from_binds(binds: &[ColumnBind], num_hash_columns: usize) -> ExecResult<Self> {
        if binds.len() != num_hash_columns {
            return Err(ExecError::invalid_argument(format!(
                "expected {} partition predicate slots, got {}",
                num_hash_columns,
                binds.len()
            )));
        }
        let mut partition_exprs: Vec<Vec<Candidate>> = vec![Vec::new(); num_hash_columns];
        let mut range_column_indexes = Vec::new();
        for (column, bind) in binds.iter().enumerate() {
            match bind {
                ColumnBind::Fixed(value) => {
                    partition_exprs[column].push(Candidate::Scalar(value.clone()));
                }
                ColumnBind::Covered => {}
                ColumnBind::InList(list) => {
                    if list.columns.is_empty() || list.columns[0] != column {
                        return Err(ExecError::invalid_argument(
                            "IN-list must be anchored at its first covered column",
                        ));
                    }
                    for covered in &list.columns {
                        if *covered >= num_hash_columns {
                            range_column_indexes.push(*covered);
                        }
                    }
                    let columns: Arc<[usize]> = Arc::from(list.columns.as_slice());
                    for candidate in &list.candidates {
                        if candidate.len() != list.columns.len() {
                            return Err(ExecError::invalid_argument(
                                "IN-list candidate arity does not match covered columns",
                            ));
                        }
                        partition_exprs[column].push(if list.columns.len() == 1 {
                            Candidate::Scalar(candidate[0].clone())
                        } else {
                            Candidate::Tuple {
                                columns: Arc::clone(&columns),
                                values: candidate.clone(),
                            }
                        });
                    }
                }
            }
        }
        range_column_indexes.sort_unstable();
        range_column_indexes.dedup();

        // Columns without own candidates contribute a factor of one.
        let total_permutations = partition_exprs
            .iter()
            .filter(|exprs| !exprs.is_empty())
            .map(Vec::len)
            .product::<usize>();

        Ok(Self {
            partition_exprs,
            range_column_indexes,
            total_permutations,
            next_permutation: 0,
            num_hash_columns,
        })
    }

    /// Total number of permutations the cross product yields.
    pub fn total_permutations(&self) -> usize {
        self.total_permutations
    }

    /// Ordered range column indexes carried by tuple candidates.
    pub fn range_column_indexes(&self) -> &[usize] {
        &self.range_column_indexes
    }

    /// Whether enumeration has not been exhausted.
    pub fn has_next(&self) -> bool {
        self.next_permutation < self.total_permutations
    }

    /// Produces the next permutation in mixed-radix order, already split
    /// into hash and range values.
    pub fn next_permutation(&mut self) -> ExecResult<Option<Permutation>> {
        if !self.has_next() {
            return Ok(None);
        }
        let mut pos = self.next_permutation;
        self.next_permutation += 1;

        let mut permutation = Permutation {
            hash_values: vec![Bytes::new(); self.num_hash_columns],
            range_values: Vec::new(),
        };
        for (column, exprs) in self.partition_exprs.iter().enumerate() {
            if exprs.is_empty() {
                continue;
            }
            let selected = &exprs[pos % exprs.len()];
            pos /= exprs.len();
            match selected {
                Candidate::Scalar(value) => {
                    permutation.hash_values[column] = value.clone();
                }
                Candidate::Tuple { columns, values } => {
                    for (covered, value) in columns.iter().zip(values) {
                        if *covered < self.num_hash_columns {
                            permutation.hash_values[*covered] = value.clone();
                        } else {
                            permutation.range_values.push((*covered, value.clone()));
                        }
                    }
                }
            }
        }
        permutation.range_values.sort_by_key(|(column, _)| *column);
        trace!(
            index = self.next_permutation - 1,
            total = self.total_permutations,
            "generated hash permutation"
        );
        Ok(Some(permutation))
    }
}

/// Per-shard accumulator of batched hash tuples.
///
/// Backed by a resettable arena: flushing binds the accumulated tuples to
/// physical operations and clearing keeps the allocations for the next
/// enumeration round. Exists only while batching mode is on.
#[derive(Debug)]
pub struct HashBatchArena {
    per_shard: Vec<Vec<HashTuple>>,
    used_bytes: usize,
    next_batch_shard: usize,
}

impl HashBatchArena {
    /// Creates an empty arena with one slot per shard.
    pub fn new(shard_count: usize) -> Self {
        Self {
            per_shard: (0..shard_count).map(|_| Vec::new()).collect(),
            used_bytes: 0,
            next_batch_shard: 0,
        }
    }

    /// Accumulates one tuple for a shard.
    pub fn push(&mut self, shard: usize, tuple: HashTuple) -> ExecResult<()> {
        let slot = self.per_shard.get_mut(shard).ok_or_else(|| {
            ExecError::invalid_argument(format!("shard {shard} outside arena"))
        })?;
        self.used_bytes += tuple.encoded_len();
        slot.push(tuple);
        Ok(())
    }

    /// Approximate bytes held by accumulated tuples.
    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    /// Whether any shard has accumulated tuples.
    pub fn has_batches(&self) -> bool {
        self.per_shard.iter().any(|tuples| !tuples.is_empty())
    }

    /// Next shard with a pending batch, advancing the flush position.
    pub fn next_batch_shard(&mut self) -> Option<usize> {
        while self.next_batch_shard < self.per_shard.len() {
            if !self.per_shard[self.next_batch_shard].is_empty() {
                return Some(self.next_batch_shard);
            }
            self.next_batch_shard += 1;
        }
        None
    }

    /// Takes the accumulated tuples of a shard for binding.
    pub fn take_batch(&mut self, shard: usize) -> Vec<HashTuple> {
        let tuples = std::mem::take(&mut self.per_shard[shard]);
        self.used_bytes = self
            .used_bytes
            .saturating_sub(tuples.iter().map(HashTuple::encoded_len).sum());
        self.next_batch_shard = shard + 1;
        tuples
    }

    /// Resets accumulation state, keeping per-shard allocations.
    pub fn reset(&mut self) {
        for tuples in &mut self.per_shard {
            tuples.clear();
        }
        self.used_bytes = 0;
        self.next_batch_shard = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::InListBind;

    fn b(value: &str) -> Bytes {
        Bytes::copy_from_slice(value.as_bytes())
    }

    fn in_list(column: usize, values: &[&str]) -> ColumnBind {
        ColumnBind::InList(InListBind {
            columns: vec![column],
            candidates: values.iter().map(|value| vec![b(value)]).collect(),
        })
    }

    #[test]
    fn mixed_radix_enumeration_order() {
        // Candidate counts [2, 3] must yield six permutations enumerated
        // with the first column cycling fastest.
        let binds = vec![in_list(0, &["a0", "a1"]), in_list(1, &["b0", "b1", "b2"])];
        let mut expander = PermutationExpander::from_binds(&binds, 2).unwrap();
        assert_eq!(expander.total_permutations(), 6);

        let mut seen = Vec::new();
        while let Some(permutation) = expander.next_permutation().unwrap() {
            seen.push((
                permutation.hash_values[0].clone(),
                permutation.hash_values[1].clone(),
            ));
        }
        let expected = [
            ("a0", "b0"),
            ("a1", "b0"),
            ("a0", "b1"),
            ("a1", "b1"),
            ("a0", "b2"),
            ("a1", "b2"),
        ];
        assert_eq!(seen.len(), expected.len());
        for (got, want) in seen.iter().zip(expected) {
            assert_eq!(got.0, b(want.0));
            assert_eq!(got.1, b(want.1));
        }
    }

    #[test]
    fn permutation_count_is_candidate_product() {
        // A fixed column contributes a factor of one.
        let binds = vec![
            in_list(0, &["x", "y", "z"]),
            ColumnBind::Fixed(b("k")),
            in_list(2, &["p", "q"]),
        ];
        let mut expander = PermutationExpander::from_binds(&binds, 3).unwrap();
        assert_eq!(expander.total_permutations(), 6);
        let mut all = Vec::new();
        while let Some(permutation) = expander.next_permutation().unwrap() {
            all.push(permutation.hash_values.clone());
        }
        assert_eq!(all.len(), 6);
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 6, "permutations must be distinct");
    }

    #[test]
    fn tuple_candidates_split_hash_and_range() {
        // Tuple spans hash column 1 and range column 2; the tuple list
        // multiplies once, the range column only constrains.
        let tuple = ColumnBind::InList(InListBind {
            columns: vec![1, 2],
            candidates: vec![vec![b("h0"), b("r0")], vec![b("h1"), b("r1")]],
        });
        let binds = vec![in_list(0, &["a", "b"]), tuple];
        let mut expander = PermutationExpander::from_binds(&binds, 2).unwrap();
        assert_eq!(expander.total_permutations(), 4);
        assert_eq!(expander.range_column_indexes(), &[2]);

        let first = expander.next_permutation().unwrap().unwrap();
        assert_eq!(first.hash_values[0], b("a"));
        assert_eq!(first.hash_values[1], b("h0"));
        assert_eq!(first.range_values, vec![(2, b("r0"))]);
    }

    #[test]
    fn arena_accounts_and_resets() {
        let mut arena = HashBatchArena::new(3);
        arena
            .push(1, HashTuple { hash_code: 7, values: vec![b("v")] })
            .unwrap();
        arena
            .push(2, HashTuple { hash_code: 9, values: vec![b("w")] })
            .unwrap();
        assert!(arena.used_bytes() > 0);
        assert_eq!(arena.next_batch_shard(), Some(1));
        let batch = arena.take_batch(1);
        assert_eq!(batch.len(), 1);
        assert_eq!(arena.next_batch_shard(), Some(2));
        arena.take_batch(2);
        assert_eq!(arena.next_batch_shard(), None);
        assert_eq!(arena.used_bytes(), 0);
        arena.reset();
        assert!(!arena.has_batches());
    }
}
