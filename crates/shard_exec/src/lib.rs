//! Shard-level operation execution engine.
//!
//! Sits between a SQL-layer executor and a partitioned storage backend:
//! expands one logical read or write into per-shard physical operations,
//! dispatches them with bounded parallelism and byte budgets, consumes
//! paginated responses, and presents a single ordered or unordered row
//! stream. Pagination, batched row-id continuation, and index-backfill
//! continuation are re-issued transparently until exhausted.
//!
//! The crate is orchestration only. Connections, request encoding, and
//! cluster metadata live behind the [`transport::OpTransport`] and
//! [`router::ShardRouter`] seams.

pub mod decoder;
pub mod doc_op;
pub mod error;
pub mod expander;
pub mod metrics;
pub mod operation;
pub mod response;
pub mod result;
pub mod router;
pub mod stream;
pub mod transport;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use doc_op::{CachedReadOp, ShardedReadOp, ShardedWriteOp};
pub use error::{ExecError, ExecResult};
pub use metrics::ExecMetrics;
pub use result::RowIdBatch;
pub use router::{ShardRouter, StaticShardMap};
pub use stream::{ResultMux, StreamPick};
pub use transport::{OpSubmitRequest, OpTransport};

/// Broad table category, used to keep metrics separated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableKind {
    /// Regular user table.
    User,
    /// Secondary index.
    Index,
    /// System catalog table.
    System,
}

/// Row-level lock requested by the statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowMark {
    /// `FOR UPDATE`.
    Exclusive,
    /// `FOR NO KEY UPDATE`.
    NoKeyExclusive,
    /// `FOR SHARE`.
    Share,
    /// `FOR KEY SHARE`.
    KeyShare,
}

/// Behavior on row-lock conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitPolicy {
    /// Block until the lock is available.
    Wait,
    /// Fail the statement immediately.
    Error,
    /// Skip conflicting rows.
    Skip,
}

/// Shape of the target table as far as execution is concerned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableShape {
    /// Table name, for logs only.
    pub name: String,
    /// Metrics category.
    pub kind: TableKind,
    /// Number of leading hash-partition key columns; zero for
    /// range-partitioned tables.
    pub num_hash_columns: usize,
    /// Total number of primary-key columns.
    pub num_key_columns: usize,
}

impl TableShape {
    /// Whether the table is range partitioned (no hash columns).
    pub fn is_range_partitioned(&self) -> bool {
        self.num_hash_columns == 0
    }
}

/// Engine configuration, resolved once per logical operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Upper bound on one transport message, in bytes.
    pub max_message_bytes: u64,
    /// Fraction of `max_message_bytes` usable for row payload; the rest is
    /// headroom for envelope overhead.
    pub message_payload_ratio: f64,
    /// Hard cap on physical operations created by one expansion.
    pub request_limit: usize,
    /// Parallel send width for unordered reads; derived from the node count
    /// when unset.
    pub select_parallelism: Option<usize>,
    /// Enables hash-tuple batching of permutation expansion.
    pub enable_hash_batching: bool,
    /// Default per-request row fetch limit; zero means unlimited.
    pub prefetch_row_limit: u64,
    /// Default per-request byte fetch limit; zero means unlimited.
    pub fetch_size_limit: u64,
    /// Memory budget for accumulated hash-batch tuples before a forced
    /// flush.
    pub batch_work_mem_bytes: usize,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: 255 * 1024 * 1024,
            message_payload_ratio: 0.95,
            request_limit: 1024,
            select_parallelism: None,
            enable_hash_batching: true,
            prefetch_row_limit: 1024,
            fetch_size_limit: 0,
            batch_work_mem_bytes: 4 * 1024 * 1024,
        }
    }
}

impl ExecConfig {
    /// Parallel send width for unordered reads. Unless overridden, twice the
    /// node count clamped to `[1, 16]`.
    pub fn resolve_parallelism(&self, node_count: usize) -> usize {
        match self.select_parallelism {
            Some(parallelism) => parallelism.max(1),
            None => (node_count * 2).clamp(1, 16),
        }
    }

    /// Payload byte budget for one submission round, split across
    /// `send_count` requests.
    pub fn per_request_size_budget(&self, send_count: usize) -> u64 {
        let budget = (self.max_message_bytes as f64 * self.message_payload_ratio) as u64;
        budget / send_count.max(1) as u64
    }
}

/// Per-statement execution parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecParams {
    /// Statement-level `LIMIT`+`OFFSET` row bound; `None` keeps the
    /// configured default prefetch limit.
    pub limit: Option<u64>,
    /// Restricts a single-select read to the shard owning this partition
    /// key.
    pub partition_key: Option<Bytes>,
    /// Row-level lock to take on fetched rows.
    pub row_mark: Option<RowMark>,
    /// Conflict behavior for the row-level lock.
    pub wait_policy: Option<WaitPolicy>,
    /// Index-backfill instruction, opaque to the engine.
    pub backfill_spec: Option<Bytes>,
    /// Snapshot read time pinned by the statement.
    pub read_time: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parallelism_derivation_clamps() {
        let config = ExecConfig::default();
        assert_eq!(config.resolve_parallelism(1), 2);
        assert_eq!(config.resolve_parallelism(3), 6);
        assert_eq!(config.resolve_parallelism(100), 16);
        assert_eq!(config.resolve_parallelism(0), 1);

        let fixed = ExecConfig {
            select_parallelism: Some(3),
            ..ExecConfig::default()
        };
        assert_eq!(fixed.resolve_parallelism(100), 3);
    }

    #[test]
    fn size_budget_splits_across_sends() {
        let config = ExecConfig {
            max_message_bytes: 1000,
            message_payload_ratio: 0.5,
            ..ExecConfig::default()
        };
        assert_eq!(config.per_request_size_budget(1), 500);
        assert_eq!(config.per_request_size_budget(5), 100);
        assert_eq!(config.per_request_size_budget(0), 500);
    }
}
