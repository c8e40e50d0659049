//! Per-operation result streams and the multiplexers that merge them.
//!
//! Each physical operation feeds a FIFO of decoded result batches. A
//! multiplexer turns the collection of streams into a single logical row
//! source with one of three strategies: unordered first-available, k-way
//! merge by row-order key, or replay of pre-materialized batches. The
//! multiplexers never perform I/O themselves: `pick` reports `NeedsFetch`
//! and the owning logical operation runs the fetch round, which keeps the
//! suspension point in exactly one place.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};

use tracing::{debug, trace};

use crate::error::{ExecError, ExecResult};
use crate::operation::{OpId, OpPool};
use crate::result::OpResult;

/// Tri-state fetch status of one per-operation stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    /// At least one queued batch still has unconsumed rows.
    HasLocalData,
    /// No local rows, but the producing operation is still active.
    NeedsFetch,
    /// No local rows and no producing operation left.
    Done,
}

/// Outcome of asking a multiplexer for the next stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPick {
    /// Stream at this registry index has a consumable batch.
    Stream(usize),
    /// Every candidate stream is waiting on a network round.
    NeedsFetch,
    /// All streams are exhausted.
    Done,
}

/// Drops fully consumed batches from the front of a stream queue.
///
/// Shared by every multiplexer so eviction semantics cannot drift between
/// strategies.
fn evict_consumed_results(queue: &mut VecDeque<OpResult>) {
    while queue.front().is_some_and(OpResult::is_eof) {
        queue.pop_front();
    }
}

/// FIFO of result batches belonging to one physical operation.
#[derive(Debug, Default)]
pub struct OpResultStream {
    op: Option<OpId>,
    queue: VecDeque<OpResult>,
}

impl OpResultStream {
    /// Stream fed by a pooled physical operation.
    pub fn new(op: OpId) -> Self {
        Self {
            op: Some(op),
            queue: VecDeque::new(),
        }
    }

    /// Stream with no producing operation, serving only already queued
    /// batches (continuation pages split off mid-merge, cached replays).
    pub fn detached(results: impl IntoIterator<Item = OpResult>) -> Self {
        let mut stream = Self {
            op: None,
            queue: results.into_iter().collect(),
        };
        evict_consumed_results(&mut stream.queue);
        stream
    }

    /// Producing operation handle, if any.
    pub fn op(&self) -> Option<OpId> {
        self.op
    }

    /// Queues one decoded batch, discarding it immediately when empty.
    pub fn push_result(&mut self, result: OpResult) {
        if result.is_eof() {
            trace!(op = ?self.op, "discarding empty response batch");
            return;
        }
        trace!(
            op = ?self.op,
            rows = result.row_count(),
            queued = self.queue.len() + 1,
            "queued response batch"
        );
        self.queue.push_back(result);
    }

    /// Fetch status as a pure function of queue contents and operation
    /// liveness.
    pub fn fetch_status(&self, pool: &OpPool) -> FetchStatus {
        if self.queue.iter().any(|result| !result.is_eof()) {
            return FetchStatus::HasLocalData;
        }
        match self.op {
            Some(op) if pool.is_active(op) => FetchStatus::NeedsFetch,
            _ => FetchStatus::Done,
        }
    }

    /// Next consumable batch, evicting consumed ones lazily. Returns `None`
    /// only when the stream is exhausted; asking while the operation still
    /// owes a fetch is a protocol error.
    pub fn next_result(&mut self, pool: &OpPool) -> ExecResult<Option<&mut OpResult>> {
        evict_consumed_results(&mut self.queue);
        if !self.queue.is_empty() {
            return Ok(self.queue.front_mut());
        }
        if self.op.is_some_and(|op| pool.is_active(op)) {
            return Err(ExecError::illegal_state(
                "read from a stream requiring fetch",
            ));
        }
        Ok(None)
    }

    /// Order key of the next unconsumed row.
    pub fn next_row_order(&self) -> ExecResult<i64> {
        self.queue
            .iter()
            .find(|result| !result.is_eof())
            .ok_or_else(|| ExecError::illegal_state("ordered stream has no buffered rows"))?
            .next_row_order()
    }
}

/// Unordered multiplexer: serves whichever stream has buffered data.
#[derive(Debug, Default)]
pub struct ParallelMux {
    streams: Vec<OpResultStream>,
}

/// K-way merging multiplexer, generic over the row-order key.
#[derive(Debug)]
pub struct MergingMux<K: Ord + Copy> {
    streams: Vec<OpResultStream>,
    heap: BinaryHeap<Reverse<(K, usize)>>,
    current: Option<usize>,
    started: bool,
    order_fn: fn(&OpResultStream) -> ExecResult<K>,
}

/// Replay multiplexer over one pre-materialized stream; never fetches.
#[derive(Debug)]
pub struct CachedMux {
    stream: OpResultStream,
}

/// Closed set of result-stream strategies.
#[derive(Debug)]
pub enum ResultMux {
    /// Unordered first-available.
    Parallel(ParallelMux),
    /// K-way merge by `i64` row-order tags.
    Merging(MergingMux<i64>),
    /// Pre-materialized replay.
    Cached(CachedMux),
}

/// Rebuilds per-operation streams for a repopulated pool. Streams still
/// holding undrained batches are carried over as detached participants so a
/// new population round cannot discard rows the caller has not read yet.
fn rebuild_streams(streams: &mut Vec<OpResultStream>, pool: &OpPool) {
    streams.retain(|stream| stream.queue.iter().any(|result| !result.is_eof()));
    for stream in streams.iter_mut() {
        stream.op = None;
    }
    streams.extend(pool.ops().iter().map(|op| OpResultStream::new(op.id())));
}

impl ParallelMux {
    fn reset_ops(&mut self, pool: &OpPool) {
        rebuild_streams(&mut self.streams, pool);
    }

    fn pick(&mut self, pool: &OpPool) -> StreamPick {
        // Evict exhausted streams lazily, then serve the first with data.
        self.streams
            .retain(|stream| stream.fetch_status(pool) != FetchStatus::Done);
        for (index, stream) in self.streams.iter().enumerate() {
            if stream.fetch_status(pool) == FetchStatus::HasLocalData {
                return StreamPick::Stream(index);
            }
        }
        if self.streams.is_empty() {
            StreamPick::Done
        } else {
            StreamPick::NeedsFetch
        }
    }
}

impl<K: Ord + Copy> MergingMux<K> {
    fn new(order_fn: fn(&OpResultStream) -> ExecResult<K>) -> Self {
        Self {
            streams: Vec::new(),
            heap: BinaryHeap::new(),
            current: None,
            started: false,
            order_fn,
        }
    }

    fn reset_ops(&mut self, pool: &OpPool) {
        rebuild_streams(&mut self.streams, pool);
        self.heap.clear();
        self.current = None;
        self.started = false;
    }

    fn pick(&mut self, pool: &OpPool) -> ExecResult<StreamPick> {
        if !self.started {
            // Startup: every stream must either have data or be exhausted
            // before the merge can begin.
            let waiting = self
                .streams
                .iter()
                .filter(|stream| stream.fetch_status(pool) == FetchStatus::NeedsFetch)
                .count();
            if waiting > 0 {
                trace!(waiting, "merge startup still fetching");
                return Ok(StreamPick::NeedsFetch);
            }
            for (index, stream) in self.streams.iter().enumerate() {
                if stream.fetch_status(pool) == FetchStatus::HasLocalData {
                    self.heap.push(Reverse(((self.order_fn)(stream)?, index)));
                }
            }
            self.started = true;
            debug!(streams = self.heap.len(), "starting merge sort");
        } else if let Some(current) = self.current {
            // Re-admit the stream picked last time; it may have consumed a
            // row and changed priority, or may owe a fetch first.
            match self.streams[current].fetch_status(pool) {
                FetchStatus::NeedsFetch => return Ok(StreamPick::NeedsFetch),
                FetchStatus::HasLocalData => {
                    let key = (self.order_fn)(&self.streams[current])?;
                    self.heap.push(Reverse((key, current)));
                }
                FetchStatus::Done => {}
            }
            self.current = None;
        }

        let Some(Reverse((_, index))) = self.heap.pop() else {
            trace!("merge complete");
            return Ok(StreamPick::Done);
        };
        self.current = Some(index);
        Ok(StreamPick::Stream(index))
    }

    /// Registers a brand-new stream for a continuation page whose order is
    /// not guaranteed to chain after the original operation's consumed rows.
    /// Once the merge has started, the stream enters the heap immediately;
    /// before that, startup seeding picks it up.
    fn push_split_stream(&mut self, result: OpResult) -> ExecResult<usize> {
        let index = self.streams.len();
        let mut stream = OpResultStream::detached([]);
        stream.push_result(result);
        if self.started && !stream.queue.is_empty() {
            self.heap.push(Reverse(((self.order_fn)(&stream)?, index)));
        }
        self.streams.push(stream);
        Ok(index)
    }
}

impl CachedMux {
    fn pick(&mut self, pool: &OpPool) -> StreamPick {
        match self.stream.fetch_status(pool) {
            FetchStatus::Done => StreamPick::Done,
            _ => StreamPick::Stream(0),
        }
    }
}

impl ResultMux {
    /// Unordered multiplexer over the pool's operations.
    pub fn parallel(pool: &OpPool) -> Self {
        let mut mux = ParallelMux::default();
        mux.reset_ops(pool);
        Self::Parallel(mux)
    }

    /// Merging multiplexer keyed by batched row-order tags.
    pub fn merging(pool: &OpPool) -> Self {
        let mut mux = MergingMux::new(OpResultStream::next_row_order);
        mux.reset_ops(pool);
        Self::Merging(mux)
    }

    /// Replay multiplexer over pre-materialized batches.
    pub fn cached(results: impl IntoIterator<Item = OpResult>) -> Self {
        Self::Cached(CachedMux {
            stream: OpResultStream::detached(results),
        })
    }

    /// Rebuilds per-operation streams after the pool was repopulated.
    /// Undrained batches stay readable through detached streams. Resetting a
    /// cached multiplexer is misuse.
    pub fn reset_ops(&mut self, pool: &OpPool) -> ExecResult<()> {
        match self {
            Self::Parallel(mux) => mux.reset_ops(pool),
            Self::Merging(mux) => mux.reset_ops(pool),
            Self::Cached(_) => {
                return Err(ExecError::illegal_state(
                    "cached result stream cannot be reset",
                ))
            }
        }
        Ok(())
    }

    /// Chooses the next stream to consume from.
    pub fn pick(&mut self, pool: &OpPool) -> ExecResult<StreamPick> {
        match self {
            Self::Parallel(mux) => Ok(mux.pick(pool)),
            Self::Merging(mux) => mux.pick(pool),
            Self::Cached(mux) => Ok(mux.pick(pool)),
        }
    }

    /// Stream at a registry index handed out by [`ResultMux::pick`].
    pub fn stream_mut(&mut self, index: usize) -> ExecResult<&mut OpResultStream> {
        let stream = match self {
            Self::Parallel(mux) => mux.streams.get_mut(index),
            Self::Merging(mux) => mux.streams.get_mut(index),
            Self::Cached(mux) => (index == 0).then_some(&mut mux.stream),
        };
        stream.ok_or_else(|| ExecError::not_found(format!("stream index {index}")))
    }

    /// Routes one decoded response batch to the stream of its producing
    /// operation.
    ///
    /// A response with a continuation page handed to the merging multiplexer
    /// is registered as a new independent stream: rows within the page are
    /// ordered, but the page is not guaranteed to chain after the rows this
    /// operation already served, e.g. when the target tablet split
    /// mid-flight.
    pub fn accept_response(
        &mut self,
        op: OpId,
        result: OpResult,
        has_paging_state: bool,
    ) -> ExecResult<()> {
        match self {
            Self::Cached(_) => Err(ExecError::unimplemented(
                "cached result stream does not fetch",
            )),
            Self::Parallel(mux) => {
                let stream = mux
                    .streams
                    .iter_mut()
                    .find(|stream| stream.op() == Some(op))
                    .ok_or_else(|| {
                        ExecError::not_found(format!("operation {op:?} not found in stream registry"))
                    })?;
                stream.push_result(result);
                Ok(())
            }
            Self::Merging(mux) => {
                if has_paging_state {
                    let index = mux.push_split_stream(result)?;
                    debug!(op = ?op, stream = index, "registered split continuation stream");
                    return Ok(());
                }
                let stream = mux
                    .streams
                    .iter_mut()
                    .find(|stream| stream.op() == Some(op))
                    .ok_or_else(|| {
                        ExecError::not_found(format!("operation {op:?} not found in stream registry"))
                    })?;
                stream.push_result(result);
                Ok(())
            }
        }
    }

    /// Number of registered streams, split continuations included.
    pub fn stream_count(&self) -> usize {
        match self {
            Self::Parallel(mux) => mux.streams.len(),
            Self::Merging(mux) => mux.streams.len(),
            Self::Cached(_) => 1,
        }
    }
}
