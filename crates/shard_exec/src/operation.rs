//! Physical operation model: per-shard requests, responses, and the pool
//! that owns them.
//!
//! A logical operation owns a pool of physical operations that are reset and
//! reused across successive row-id batches instead of being reallocated.
//! Active operations are kept stably at the front of the pool; result streams
//! reference operations through stable [`OpId`] handles so pool reordering
//! can never dangle.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::error::{ExecError, ExecResult};
use crate::router::{max_start_bound, min_end_bound};
use crate::{RowMark, WaitPolicy};

/// Stable handle of a physical operation, valid across pool reordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId(pub(crate) u64);

/// One scan bound with inclusivity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundKey {
    /// Encoded partition-key-space bound.
    pub key: Bytes,
    /// Whether the bound itself is part of the range.
    pub inclusive: bool,
}

/// Target of a read request, forwarded to the storage layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetRef {
    /// Regular table column by index.
    Column(usize),
    /// System column of unknown width.
    System,
}

/// One argument of a batched row-id read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchArgument {
    /// Order tag, present only when the caller asked to keep row order.
    pub order: Option<i64>,
    /// Row identifier fetched by this argument.
    pub row_id: Option<Bytes>,
    /// Hash code of the argument's partition tuple, batching mode only.
    pub hash_code: Option<u16>,
    /// Upper hash code, batching mode only.
    pub max_hash_code: Option<u16>,
    /// Encoded partition column values, batching mode only.
    pub partition_values: Vec<Bytes>,
}

/// One `(hash_code, hash values…, range values…)` tuple of a batched
/// hash IN condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashTuple {
    /// Hash code routing the tuple, always the first tuple element on the
    /// wire.
    pub hash_code: u16,
    /// Encoded column values, hash columns first, then covered range
    /// columns.
    pub values: Vec<Bytes>,
}

impl HashTuple {
    /// Approximate memory footprint, used for arena budgeting.
    pub fn encoded_len(&self) -> usize {
        2 + self
            .values
            .iter()
            .map(|value| value.len() + 8)
            .sum::<usize>()
    }
}

/// One conjunct of a read request's pushed-down condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// Column equals an encoded value.
    Eq {
        /// Table column index.
        column: usize,
        /// Encoded comparison value.
        value: Bytes,
    },
    /// Tuple IN-list over hash-key columns, produced by hash batching.
    HashIn {
        /// Covered column indexes, hash columns then range columns.
        columns: Vec<usize>,
        /// Accepted tuples.
        tuples: Vec<HashTuple>,
    },
}

/// Candidate list of one multi-column IN predicate entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InListBind {
    /// Column indexes (table order) this IN-list constrains; may span hash
    /// and range columns when tuple-valued.
    pub columns: Vec<usize>,
    /// Candidate tuples, one encoded value per covered column.
    pub candidates: Vec<Vec<Bytes>>,
}

/// Per-hash-column partition predicate slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnBind {
    /// Single fixed value.
    Fixed(Bytes),
    /// IN-list anchored at this column.
    InList(InListBind),
    /// Column is covered by a tuple IN-list anchored at an earlier column.
    Covered,
}

/// Read request targeted at one shard (or globally before fan-out).
#[derive(Debug, Clone, Default)]
pub struct ReadRequest {
    /// Fetched targets, opaque to the engine.
    pub targets: Vec<TargetRef>,
    /// Partition predicate, one slot per hash column; empty when the
    /// statement has no hash-column constraints.
    pub partition_column_values: Vec<ColumnBind>,
    /// Pushed-down condition conjuncts.
    pub conditions: Vec<Condition>,
    /// Batched row-id arguments, consumed from the front as the storage
    /// layer reports completion.
    pub batch_arguments: VecDeque<BatchArgument>,
    /// Legacy singular row-id field, kept equal to the smallest batched id
    /// so order-unaware servers stay correctly routable.
    pub row_id_value: Option<Bytes>,
    /// Legacy hash-code range mirror of the front batch argument.
    pub hash_code: Option<u16>,
    /// See `hash_code`.
    pub max_hash_code: Option<u16>,
    /// Scan lower bound.
    pub lower_bound: Option<BoundKey>,
    /// Scan upper bound.
    pub upper_bound: Option<BoundKey>,
    /// Continuation token copied back from the previous response.
    pub paging_state: Option<Bytes>,
    /// Row-count fetch limit, zero means unlimited.
    pub limit: u64,
    /// Byte-size fetch limit, zero means unlimited.
    pub size_limit: u64,
    /// Ask the storage layer to return a paging state.
    pub return_paging_state: bool,
    /// Ordered scan marker: a forward scan must run sequentially.
    pub is_forward_scan: bool,
    /// Vector-index scans are parallelized by the transport, not here.
    pub is_vector_index_scan: bool,
    /// Row-level lock to take, if any.
    pub row_mark: Option<RowMark>,
    /// Conflict behavior for row-level locks.
    pub wait_policy: Option<WaitPolicy>,
    /// Backfill instruction forwarded to the storage layer.
    pub backfill_spec: Option<Bytes>,
    /// Marks an index-backfill read.
    pub is_for_backfill: bool,
    /// Marks a request serving a secondary-index lookup.
    pub is_index_request: bool,
}

impl ReadRequest {
    /// Intersects the request's scan range with `[lower, upper)`-style
    /// bounds; empty keys are open. Returns `false` when the intersection is
    /// empty and the request can produce no rows.
    pub fn set_scan_boundary(
        &mut self,
        lower: &[u8],
        lower_inclusive: bool,
        upper: &[u8],
        upper_inclusive: bool,
    ) -> bool {
        if !lower.is_empty() {
            let stricter = match &self.lower_bound {
                Some(existing) => {
                    let merged = max_start_bound(existing.key.as_ref(), lower);
                    if merged == existing.key.as_ref() && existing.key.as_ref() != lower {
                        existing.clone()
                    } else if existing.key.as_ref() == lower {
                        BoundKey {
                            key: existing.key.clone(),
                            inclusive: existing.inclusive && lower_inclusive,
                        }
                    } else {
                        BoundKey {
                            key: Bytes::copy_from_slice(lower),
                            inclusive: lower_inclusive,
                        }
                    }
                }
                None => BoundKey {
                    key: Bytes::copy_from_slice(lower),
                    inclusive: lower_inclusive,
                },
            };
            self.lower_bound = Some(stricter);
        }
        if !upper.is_empty() {
            let stricter = match &self.upper_bound {
                Some(existing) => {
                    let merged = min_end_bound(existing.key.as_ref(), upper);
                    if merged == existing.key.as_ref() && existing.key.as_ref() != upper {
                        existing.clone()
                    } else if existing.key.as_ref() == upper {
                        BoundKey {
                            key: existing.key.clone(),
                            inclusive: existing.inclusive && upper_inclusive,
                        }
                    } else {
                        BoundKey {
                            key: Bytes::copy_from_slice(upper),
                            inclusive: upper_inclusive,
                        }
                    }
                }
                None => BoundKey {
                    key: Bytes::copy_from_slice(upper),
                    inclusive: upper_inclusive,
                },
            };
            self.upper_bound = Some(stricter);
        }
        self.bounds_nonempty()
    }

    /// Whether the current scan range can contain at least one key.
    pub fn bounds_nonempty(&self) -> bool {
        match (&self.lower_bound, &self.upper_bound) {
            (Some(lower), Some(upper)) => {
                if lower.key < upper.key {
                    true
                } else if lower.key == upper.key {
                    lower.inclusive && upper.inclusive
                } else {
                    false
                }
            }
            _ => true,
        }
    }

    /// Appends one batch argument, keeping the legacy singular row-id field
    /// equal to the smallest id assigned to this request.
    pub fn append_batch_argument(&mut self, argument: BatchArgument) {
        if let Some(id) = &argument.row_id {
            let keep_existing = self
                .row_id_value
                .as_ref()
                .is_some_and(|current| current <= id);
            if !keep_existing {
                self.row_id_value = Some(id.clone());
            }
        }
        self.batch_arguments.push_back(argument);
    }

    /// Re-derives the legacy singular fields from the front batch argument
    /// after consumed arguments were trimmed, so order-unaware servers keep
    /// routing the continuation correctly.
    pub fn formulate_for_rolling_upgrade(&mut self) {
        let Some(front) = self.batch_arguments.front() else {
            return;
        };
        if let Some(id) = &front.row_id {
            self.row_id_value = Some(id.clone());
        }
        if !front.partition_values.is_empty() {
            self.hash_code = front.hash_code;
            self.max_hash_code = front.max_hash_code;
            self.partition_column_values = front
                .partition_values
                .iter()
                .cloned()
                .map(ColumnBind::Fixed)
                .collect();
        }
    }

    /// Clears per-batch state so a pooled request can be reused for the next
    /// row-id batch or permutation round.
    pub fn reset_for_reuse(&mut self) {
        self.row_id_value = None;
        self.batch_arguments.clear();
        self.hash_code = None;
        self.max_hash_code = None;
        self.paging_state = None;
        self.lower_bound = None;
        self.upper_bound = None;
    }
}

/// Write request; the payload encoding belongs to the storage layer.
#[derive(Debug, Clone, Default)]
pub struct WriteRequest {
    /// Opaque encoded mutation.
    pub payload: Bytes,
    /// Marks a request maintaining a secondary index.
    pub is_index_request: bool,
}

/// Request carried by one physical operation.
#[derive(Debug, Clone)]
pub enum OpRequest {
    /// Read operation.
    Read(ReadRequest),
    /// Write operation.
    Write(WriteRequest),
}

/// Raw response of one physical operation for one round trip.
#[derive(Debug, Clone, Default)]
pub struct ShardOpResponse {
    /// Encoded row payload, absent when the round returned no rows.
    pub rows_data: Option<Bytes>,
    /// Per-row order tags for batched keep-order reads.
    pub batch_orders: Vec<i64>,
    /// Continuation token when more pages exist for this request.
    pub paging_state: Option<Bytes>,
    /// Number of batch arguments the storage layer consumed this round.
    pub batch_arg_count: i64,
    /// Rows affected by a write.
    pub rows_affected: i64,
    /// Partition-list version observed by the storage layer, signalling
    /// splits.
    pub partition_list_version: Option<u64>,
    /// Set when a backfill batch completed; `backfill_spec` carries the
    /// continuation.
    pub is_backfill_batch_done: bool,
    /// Backfill continuation token.
    pub backfill_spec: Option<Bytes>,
    /// Storage rows scanned to produce this response.
    pub scanned_rows: u64,
}

/// One pooled physical operation.
#[derive(Debug)]
pub struct PhysicalOp {
    id: OpId,
    /// Shard this operation is pinned to, when fan-out assigned one.
    pub shard: Option<usize>,
    active: bool,
    /// Request mutated across pagination rounds.
    pub request: OpRequest,
    /// Last response observed for this operation.
    pub response: Option<ShardOpResponse>,
}

impl PhysicalOp {
    /// Stable handle.
    pub fn id(&self) -> OpId {
        self.id
    }

    /// Whether this operation participates in the next send round.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Activates or deactivates the operation.
    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    /// Whether the operation is a read.
    pub fn is_read(&self) -> bool {
        matches!(self.request, OpRequest::Read(_))
    }

    /// Read request accessor; `IllegalState` on a write operation.
    pub fn read_request(&self) -> ExecResult<&ReadRequest> {
        match &self.request {
            OpRequest::Read(request) => Ok(request),
            OpRequest::Write(_) => Err(ExecError::illegal_state(
                "write operation has no read request",
            )),
        }
    }

    /// Mutable read request accessor; `IllegalState` on a write operation.
    pub fn read_request_mut(&mut self) -> ExecResult<&mut ReadRequest> {
        match &mut self.request {
            OpRequest::Read(request) => Ok(request),
            OpRequest::Write(_) => Err(ExecError::illegal_state(
                "write operation has no read request",
            )),
        }
    }
}

/// Pool of physical operations owned by one logical operation.
///
/// Operations are reset and reused across batches; handles stay stable while
/// `move_inactive_outside` stably partitions active operations to the front.
#[derive(Debug, Default)]
pub struct OpPool {
    ops: Vec<PhysicalOp>,
    active_count: usize,
    next_id: u64,
}

impl OpPool {
    /// Number of pooled operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the pool holds no operations.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of active operations, all at the front of the pool.
    pub fn active_count(&self) -> usize {
        self.active_count
    }

    /// All pooled operations, active first.
    pub fn ops(&self) -> &[PhysicalOp] {
        &self.ops
    }

    /// Mutable view of the pooled operations.
    pub fn ops_mut(&mut self) -> &mut [PhysicalOp] {
        &mut self.ops
    }

    /// Appends a new inactive operation, assigning a fresh handle.
    pub fn push(&mut self, request: OpRequest, shard: Option<usize>) -> OpId {
        let id = OpId(self.next_id);
        self.next_id += 1;
        self.ops.push(PhysicalOp {
            id,
            shard,
            active: false,
            request,
            response: None,
        });
        id
    }

    /// Looks an operation up by handle.
    pub fn get(&self, id: OpId) -> Option<&PhysicalOp> {
        self.ops.iter().find(|op| op.id == id)
    }

    /// Whether the operation behind `id` is still active. Unknown handles
    /// (e.g. detached split streams) are not active.
    pub fn is_active(&self, id: OpId) -> bool {
        self.get(id).is_some_and(PhysicalOp::is_active)
    }

    /// Finds the pooled operation assigned to a shard.
    pub fn op_for_shard_mut(&mut self, shard: usize) -> Option<&mut PhysicalOp> {
        self.ops.iter_mut().find(|op| op.shard == Some(shard))
    }

    /// Recounts active operations and stably moves inactive ones to the
    /// back, preserving the relative send order of active operations.
    pub fn move_inactive_outside(&mut self) {
        self.ops.sort_by_key(|op| !op.active);
        self.active_count = self.ops.iter().filter(|op| op.active).count();
    }

    /// Marks every operation inactive without dropping pooled requests.
    pub fn deactivate_all(&mut self) {
        for op in &mut self.ops {
            op.active = false;
        }
        self.active_count = 0;
    }

    /// Drops every pooled operation. Handles of dropped operations become
    /// unknown, which downstream streams treat as done.
    pub fn clear(&mut self) {
        self.ops.clear();
        self.active_count = 0;
    }
}
