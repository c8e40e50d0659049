//! Transport seam between logical operations and the storage fabric.
//!
//! The engine never opens connections itself. It hands the transport a
//! snapshot of the active physical operations and receives one response per
//! operation, in submission order. Buffering, session management, and the
//! physical wire encoding all live behind this trait.

use async_trait::async_trait;

use crate::error::ExecResult;
use crate::operation::{OpRequest, ShardOpResponse};
use crate::TableShape;

/// One submitted physical operation: the request snapshot plus its shard
/// assignment, when fan-out pinned one.
#[derive(Debug, Clone)]
pub struct OpSubmitEntry {
    /// Cloned request state at submission time.
    pub request: OpRequest,
    /// Shard the operation is pinned to.
    pub shard: Option<usize>,
}

/// A batch of physical operations submitted in one round.
#[derive(Debug, Clone)]
pub struct OpSubmitRequest {
    /// Operations in send order; responses must come back in the same order.
    pub ops: Vec<OpSubmitEntry>,
    /// Shape of the table the operations target.
    pub table: TableShape,
    /// Snapshot read time, when the statement pinned one.
    pub read_time: Option<u64>,
    /// Bypass transport-side write buffering for this round.
    pub force_non_bufferable: bool,
    /// Whether the round carries write operations.
    pub is_write: bool,
}

/// Submission interface implemented by the session layer (and by scripted
/// test doubles).
#[async_trait]
pub trait OpTransport: Send + Sync {
    /// Submits one round and resolves to exactly one response per submitted
    /// operation, in order. A failed round fails the whole logical
    /// operation; the engine does not retry.
    async fn submit(&self, request: OpSubmitRequest) -> ExecResult<Vec<ShardOpResponse>>;
}
