//! Logical operations: fan-out, dispatch, and continuation.
//!
//! A logical operation owns a pool of physical operations, a result
//! multiplexer, and at most one in-flight response round. Reads expand into
//! per-shard or per-permutation requests and keep re-issuing follow-ups for
//! pagination, batched row-id continuation, and backfill until exhausted.
//! Writes dispatch pre-encoded payloads and accumulate affected-row counts.
//!
//! One task drives one logical operation. The only suspension point is
//! resolving the stored response round; everything else is synchronous
//! bookkeeping, which keeps request mutation free of interior locking.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::FutureExt;
use tracing::{debug, trace, warn};

use crate::error::{ExecError, ExecResult};
use crate::expander::{HashBatchArena, PermutationExpander};
use crate::metrics::ExecMetrics;
use crate::operation::{
    BatchArgument, ColumnBind, Condition, OpPool, OpRequest, ReadRequest, ShardOpResponse,
    WriteRequest,
};
use crate::response::DocResponse;
use crate::result::{OpResult, RowIdBatch};
use crate::router::ShardRouter;
use crate::stream::{ResultMux, StreamPick};
use crate::transport::{OpSubmitEntry, OpSubmitRequest, OpTransport};
use crate::{ExecConfig, ExecParams, TableShape};

/// State shared by every logical operation kind.
struct OpDriver {
    transport: Arc<dyn OpTransport>,
    router: Arc<dyn ShardRouter>,
    metrics: Arc<ExecMetrics>,
    table: TableShape,
    config: ExecConfig,
    params: ExecParams,
    pool: OpPool,
    mux: ResultMux,
    response: Option<DocResponse>,
    sent_count: usize,
    parallelism: usize,
    end_of_data: bool,
    status: Option<ExecError>,
    rows_affected: i64,
    suppress_next_prefetch: bool,
    partition_list_version: Option<u64>,
}

impl OpDriver {
    fn new(
        transport: Arc<dyn OpTransport>,
        router: Arc<dyn ShardRouter>,
        metrics: Arc<ExecMetrics>,
        table: TableShape,
        config: ExecConfig,
    ) -> Self {
        let parallelism = config.resolve_parallelism(router.node_count());
        Self {
            transport,
            router,
            metrics,
            table,
            config,
            params: ExecParams::default(),
            pool: OpPool::default(),
            // Placeholder until the first population installs real streams.
            mux: ResultMux::cached([]),
            response: None,
            sent_count: 0,
            parallelism,
            end_of_data: false,
            status: None,
            rows_affected: 0,
            suppress_next_prefetch: false,
            partition_list_version: None,
        }
    }

    fn check_status(&self) -> ExecResult<()> {
        match &self.status {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Installs (or rebuilds) per-operation streams after (re)population.
    fn install_streams(&mut self, ordered: bool) -> ExecResult<()> {
        let reuse = matches!(
            (&self.mux, ordered),
            (ResultMux::Parallel(_), false) | (ResultMux::Merging(_), true)
        );
        if reuse {
            self.mux.reset_ops(&self.pool)
        } else {
            self.mux = if ordered {
                ResultMux::merging(&self.pool)
            } else {
                ResultMux::parallel(&self.pool)
            };
            Ok(())
        }
    }

    /// Reuses the first inactive pooled operation or appends a new one,
    /// returning its pool position activated.
    fn acquire_op(&mut self, request: OpRequest, shard: Option<usize>) {
        if let Some(op) = self.pool.ops_mut().iter_mut().find(|op| !op.is_active()) {
            op.request = request;
            op.shard = shard;
            op.response = None;
            op.set_active(true);
            return;
        }
        self.pool.push(request, shard);
        if let Some(op) = self.pool.ops_mut().last_mut() {
            op.set_active(true);
        }
    }

    /// Sends up to `limit` active operations in pool order. Returns whether
    /// a round was submitted.
    fn send_active_ops(
        &mut self,
        limit: usize,
        is_read: bool,
        force_non_bufferable: bool,
    ) -> ExecResult<bool> {
        if self.response.is_some() {
            return Ok(false);
        }
        self.pool.move_inactive_outside();
        let send_count = limit.min(self.pool.active_count());
        if send_count == 0 {
            return Ok(false);
        }

        if is_read {
            let budget = self.config.per_request_size_budget(send_count);
            for op in &mut self.pool.ops_mut()[..send_count] {
                let request = op.read_request_mut()?;
                request.size_limit = match request.size_limit {
                    0 => budget,
                    existing => existing.min(budget),
                };
                request.return_paging_state = true;
            }
        }

        let ops = self.pool.ops()[..send_count]
            .iter()
            .map(|op| OpSubmitEntry {
                request: op.request.clone(),
                shard: op.shard,
            })
            .collect();
        let submit = OpSubmitRequest {
            ops,
            table: self.table.clone(),
            read_time: self.params.read_time,
            force_non_bufferable,
            is_write: !is_read,
        };
        debug!(
            table = %self.table.name,
            send_count,
            active = self.pool.active_count(),
            is_read,
            "submitting operation round"
        );
        let transport = Arc::clone(&self.transport);
        let future = async move { transport.submit(submit).await }.boxed();
        self.response = Some(DocResponse::pending(
            future,
            Arc::clone(&self.metrics),
            self.table.kind,
            is_read,
        ));
        self.sent_count = send_count;
        Ok(true)
    }

    /// Resolves the in-flight round, if any.
    async fn resolve_response(&mut self) -> ExecResult<Option<Vec<ShardOpResponse>>> {
        let Some(mut response) = self.response.take() else {
            return Ok(None);
        };
        let responses = response.get().await?;
        if responses.len() != self.sent_count {
            return Err(ExecError::illegal_state(format!(
                "transport returned {} responses for {} operations",
                responses.len(),
                self.sent_count
            )));
        }
        Ok(Some(responses))
    }

    fn note_partition_list_version(&mut self, version: Option<u64>) {
        let Some(version) = version else { return };
        if self
            .partition_list_version
            .is_some_and(|known| known != version)
        {
            warn!(
                table = %self.table.name,
                version,
                "partition list version changed mid-operation"
            );
        }
        self.partition_list_version = Some(version);
    }
}

/// How a read populates its physical operations.
enum ReadPopulation {
    /// Strategy not chosen yet; decided on first execute.
    Undecided,
    /// Hash-permutation expansion, possibly spanning several rounds.
    Permutations {
        expander: PermutationExpander,
        arena: Option<HashBatchArena>,
    },
    /// All requests created (parallel, single, or row-id batches).
    Complete,
}

/// Read operation fanning out over shards and streaming rows back.
pub struct ShardedReadOp {
    driver: OpDriver,
    template: ReadRequest,
    population: ReadPopulation,
    keep_order: bool,
    next_batch_order: i64,
    backfill_continuation: Option<Bytes>,
}

impl ShardedReadOp {
    /// Creates a read over `template`, not yet populated or sent.
    pub fn new(
        transport: Arc<dyn OpTransport>,
        router: Arc<dyn ShardRouter>,
        metrics: Arc<ExecMetrics>,
        table: TableShape,
        config: ExecConfig,
        template: ReadRequest,
    ) -> Self {
        Self {
            driver: OpDriver::new(transport, router, metrics, table, config),
            template,
            population: ReadPopulation::Undecided,
            keep_order: false,
            next_batch_order: 0,
            backfill_continuation: None,
        }
    }

    /// Applies per-statement parameters and validates scan bounds.
    ///
    /// Returns `false` when the scan range is provably empty and no request
    /// needs to be sent. Supplying parameters after physical operations
    /// exist is a protocol error.
    pub fn execute_init(&mut self, params: &ExecParams) -> ExecResult<bool> {
        if !self.driver.pool.is_empty() {
            return Err(ExecError::illegal_state(
                "execution parameters supplied after request population",
            ));
        }
        self.driver.params = params.clone();

        if self.driver.table.is_range_partitioned() && !self.template.bounds_nonempty() {
            debug!(table = %self.driver.table.name, "scan bounds empty, no results possible");
            self.driver.end_of_data = true;
            return Ok(false);
        }

        // Statement-level LIMIT below the prefetch default shrinks the first
        // page and disables prefetching; one round trip usually suffices.
        let default_limit = self.driver.config.prefetch_row_limit;
        match params.limit {
            Some(limit) if default_limit == 0 || limit < default_limit => {
                self.template.limit = limit;
                self.driver.suppress_next_prefetch = true;
            }
            _ => self.template.limit = default_limit,
        }
        self.template.size_limit = self.driver.config.fetch_size_limit;
        self.template.row_mark = params.row_mark;
        self.template.wait_policy = params.wait_policy;
        if let Some(spec) = &params.backfill_spec {
            self.template.backfill_spec = Some(spec.clone());
            self.template.is_for_backfill = true;
        }
        Ok(true)
    }

    /// Populates requests if needed and submits up to the parallelism limit.
    /// Returns whether a round was submitted.
    pub fn execute(&mut self, force_non_bufferable: bool) -> ExecResult<bool> {
        self.driver.check_status()?;
        if self.driver.end_of_data {
            return Ok(false);
        }
        if self.driver.pool.active_count() == 0 {
            self.populate_requests()?;
        }
        let limit = self.driver.parallelism;
        self.driver.send_active_ops(limit, true, force_non_bufferable)
    }

    /// Resolves the pending round, feeds decoded batches into the result
    /// streams, runs pagination and batch continuation, and prefetches the
    /// next round unless suppressed. Fails sticky: a failed operation keeps
    /// returning the same error.
    pub async fn fetch_more_results(&mut self) -> ExecResult<()> {
        self.driver.check_status()?;
        match self.fetch_inner().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.driver.status = Some(err.clone());
                Err(err)
            }
        }
    }

    async fn fetch_inner(&mut self) -> ExecResult<()> {
        if self.driver.end_of_data {
            return Ok(());
        }
        if self.driver.response.is_none() {
            // Prefetch was suppressed, or a new population round is due.
            if !self.execute(false)? {
                self.driver.end_of_data = true;
                return Ok(());
            }
        }
        let Some(responses) = self.driver.resolve_response().await? else {
            return Ok(());
        };
        self.process_read_responses(responses)?;
        self.complete_continuation()?;
        if !self.driver.end_of_data && !self.driver.suppress_next_prefetch {
            let limit = self.driver.parallelism;
            self.driver.send_active_ops(limit, true, false)?;
        }
        Ok(())
    }

    fn process_read_responses(&mut self, responses: Vec<ShardOpResponse>) -> ExecResult<()> {
        let driver = &mut self.driver;
        for (index, response) in responses.into_iter().enumerate() {
            driver.note_partition_list_version(response.partition_list_version);
            let op = &mut driver.pool.ops_mut()[index];
            let op_id = op.id();
            let request = op.read_request_mut()?;
            request.paging_state = response.paging_state.clone();

            if response.is_backfill_batch_done {
                // Continuation belongs to the caller; the operation is done.
                self.backfill_continuation = response.backfill_spec.clone();
                op.set_active(false);
            } else {
                // Consumed batch arguments are trimmed even when a paging
                // state is present; a continuation must never resend them.
                let consumed = (response.batch_arg_count.max(0) as usize)
                    .min(request.batch_arguments.len());
                if consumed > 0 {
                    request.batch_arguments.drain(..consumed);
                    request.formulate_for_rolling_upgrade();
                    trace!(
                        op = ?op_id,
                        consumed,
                        remaining = request.batch_arguments.len(),
                        "trimmed consumed batch arguments"
                    );
                }
                if response.paging_state.is_none() && request.batch_arguments.is_empty() {
                    op.set_active(false);
                }
            }

            driver.rows_affected += response.rows_affected;
            if let Some(data) = response.rows_data {
                let result = OpResult::with_orders(data, &response.batch_orders)?;
                driver
                    .mux
                    .accept_response(op_id, result, response.paging_state.is_some())?;
            }
        }
        Ok(())
    }

    /// After a round: declare end-of-data only when no operation has more
    /// pages and request population is complete. An incomplete population
    /// (remaining permutation rounds) is picked up by the next execute;
    /// stream rebuilding carries undrained batches over.
    fn complete_continuation(&mut self) -> ExecResult<()> {
        self.driver.pool.move_inactive_outside();
        if self.driver.pool.active_count() == 0 && self.population_complete() {
            debug!(table = %self.driver.table.name, "read reached end of data");
            self.driver.end_of_data = true;
        }
        Ok(())
    }

    fn population_complete(&self) -> bool {
        match &self.population {
            ReadPopulation::Complete => true,
            ReadPopulation::Undecided => false,
            ReadPopulation::Permutations { expander, arena } => {
                !expander.has_next() && !arena.as_ref().is_some_and(HashBatchArena::has_batches)
            }
        }
    }

    /// Chooses and runs the population strategy: permutation expansion when
    /// hash predicates are bound, parallel fan-out for unordered scans,
    /// single select otherwise.
    fn populate_requests(&mut self) -> ExecResult<()> {
        if matches!(self.population, ReadPopulation::Undecided) {
            if !self.template.partition_column_values.is_empty() {
                let expander = PermutationExpander::from_binds(
                    &self.template.partition_column_values,
                    self.driver.table.num_hash_columns,
                )?;
                let batched = self.driver.config.enable_hash_batching
                    && expander.total_permutations() > 1;
                let arena = batched
                    .then(|| HashBatchArena::new(self.driver.router.shard_count()));
                debug!(
                    table = %self.driver.table.name,
                    permutations = expander.total_permutations(),
                    batched,
                    "expanding hash permutations"
                );
                self.population = ReadPopulation::Permutations { expander, arena };
            } else if self.parallelizable() {
                self.populate_parallel_select_ops()?;
                self.population = ReadPopulation::Complete;
            } else {
                self.populate_single_op()?;
                self.population = ReadPopulation::Complete;
            }
        }
        if matches!(self.population, ReadPopulation::Permutations { .. }) {
            self.populate_next_permutation_ops()?;
        }
        self.driver.pool.move_inactive_outside();
        self.driver.install_streams(self.keep_order)
    }

    fn parallelizable(&self) -> bool {
        !self.template.is_forward_scan
            && !self.template.is_vector_index_scan
            && self.template.row_id_value.is_none()
            && self.driver.parallelism > 1
            && self.driver.router.shard_count() > 1
    }

    /// One operation per shard, clipped to the shard's key range. Shards
    /// whose range does not intersect the scan restriction get no active
    /// operation, so the active boundaries tile the restriction exactly.
    fn populate_parallel_select_ops(&mut self) -> ExecResult<()> {
        let shard_count = self.driver.router.shard_count();
        for shard in 0..shard_count {
            let mut request = self.template.clone();
            let (lower, upper) = self.driver.router.shard_key_range(shard)?;
            if request.set_scan_boundary(&lower, true, &upper, false) {
                self.driver.acquire_op(OpRequest::Read(request), Some(shard));
            }
        }
        debug!(
            table = %self.driver.table.name,
            shards = shard_count,
            active = self.driver.pool.ops().iter().filter(|op| op.is_active()).count(),
            "populated parallel select"
        );
        Ok(())
    }

    /// One operation, pinned to a shard when the statement names a target
    /// partition or the request carries a single row id.
    fn populate_single_op(&mut self) -> ExecResult<()> {
        let mut request = self.template.clone();
        let shard = if let Some(key) = &self.driver.params.partition_key {
            let shard = self.driver.router.shard_index_for_key(key)?;
            let (lower, upper) = self.driver.router.shard_key_range(shard)?;
            if !request.set_scan_boundary(&lower, true, &upper, false) {
                debug!(shard, "target partition outside scan bounds");
                return Ok(());
            }
            Some(shard)
        } else {
            match &request.row_id_value {
                Some(id) => Some(self.driver.router.shard_index_for_key(id)?),
                None => None,
            }
        };
        self.driver.acquire_op(OpRequest::Read(request), shard);
        Ok(())
    }

    /// One population round of permutation expansion.
    ///
    /// Unbatched: one permutation per operation, up to the request limit;
    /// remaining permutations wait for the pool to drain. Batched:
    /// permutations accumulate as hash tuples per owning shard until the
    /// enumeration ends or the arena exceeds its memory budget, then flush
    /// as one IN condition per shard.
    fn populate_next_permutation_ops(&mut self) -> ExecResult<()> {
        let ReadPopulation::Permutations { expander, arena } = &mut self.population else {
            return Ok(());
        };
        match arena {
            None => {
                let limit = self.driver.config.request_limit.max(1);
                let mut created = 0;
                while created < limit {
                    let Some(permutation) = expander.next_permutation()? else {
                        break;
                    };
                    let code = self
                        .driver
                        .router
                        .hash_code_for_values(&permutation.hash_values);
                    let shard = self
                        .driver
                        .router
                        .shard_index_for_key(&code.to_be_bytes())?;
                    let mut request = self.template.clone();
                    request.partition_column_values = permutation
                        .hash_values
                        .iter()
                        .cloned()
                        .map(ColumnBind::Fixed)
                        .collect();
                    for (column, value) in &permutation.range_values {
                        request.conditions.push(Condition::Eq {
                            column: *column,
                            value: value.clone(),
                        });
                    }
                    request.hash_code = Some(code);
                    request.max_hash_code = Some(code);
                    self.driver.acquire_op(OpRequest::Read(request), Some(shard));
                    created += 1;
                }
                trace!(created, remaining = expander.has_next(), "bound permutations");
            }
            Some(arena) => {
                let budget = self.driver.config.batch_work_mem_bytes;
                while expander.has_next() {
                    // Forced flush keeps memory bounded; enumeration resumes
                    // next round.
                    if arena.used_bytes() > budget {
                        debug!(
                            used = arena.used_bytes(),
                            budget, "hash batch arena over budget, flushing early"
                        );
                        break;
                    }
                    let Some(permutation) = expander.next_permutation()? else {
                        break;
                    };
                    let code = self
                        .driver
                        .router
                        .hash_code_for_values(&permutation.hash_values);
                    let shard = self
                        .driver
                        .router
                        .shard_index_for_key(&code.to_be_bytes())?;
                    let mut values = permutation.hash_values.clone();
                    values.extend(permutation.range_values.iter().map(|(_, v)| v.clone()));
                    arena.push(
                        shard,
                        crate::operation::HashTuple {
                            hash_code: code,
                            values,
                        },
                    )?;
                }
                let columns: Vec<usize> = (0..self.driver.table.num_hash_columns)
                    .chain(expander.range_column_indexes().iter().copied())
                    .collect();
                while let Some(shard) = arena.next_batch_shard() {
                    let tuples = arena.take_batch(shard);
                    let mut request = self.template.clone();
                    request.partition_column_values.clear();
                    request.conditions.push(Condition::HashIn {
                        columns: columns.clone(),
                        tuples,
                    });
                    let (lower, upper) = self.driver.router.shard_key_range(shard)?;
                    request.set_scan_boundary(&lower, true, &upper, false);
                    self.driver.acquire_op(OpRequest::Read(request), Some(shard));
                }
                arena.reset();
            }
        }
        Ok(())
    }

    /// Routes a batch of row identifiers onto per-shard operations.
    ///
    /// Identifiers outside the template's scan bounds are skipped; bound
    /// keys that are hash-partition markers are not comparable to row ids
    /// and never filter. With `keep_order`, every appended argument gets a
    /// monotonically increasing order tag and results merge by tag.
    /// Returns whether any operation was activated.
    pub fn populate_by_row_ids(&mut self, batch: &RowIdBatch) -> ExecResult<bool> {
        self.driver.check_status()?;
        self.keep_order = batch.keep_order;
        let range_partitioned = self.driver.table.is_range_partitioned();

        for id in &batch.ids {
            if !self.row_id_within_bounds(id) {
                trace!("row id outside scan bounds, skipped");
                continue;
            }
            let shard = self.driver.router.shard_index_for_key(id)?;
            if self.driver.pool.op_for_shard_mut(shard).is_none() {
                let mut request = self.template.clone();
                request.reset_for_reuse();
                self.driver.pool.push(OpRequest::Read(request), Some(shard));
            }
            let router = Arc::clone(&self.driver.router);
            let op = self
                .driver
                .pool
                .op_for_shard_mut(shard)
                .ok_or_else(|| ExecError::not_found(format!("operation for shard {shard}")))?;
            if !op.is_active() {
                let request = op.read_request_mut()?;
                request.reset_for_reuse();
                if range_partitioned {
                    let (lower, upper) = router.shard_key_range(shard)?;
                    request.set_scan_boundary(&lower, true, &upper, false);
                }
                op.set_active(true);
            }
            let order = batch.keep_order.then(|| {
                let order = self.next_batch_order;
                self.next_batch_order += 1;
                order
            });
            op.read_request_mut()?.append_batch_argument(BatchArgument {
                order,
                row_id: Some(id.clone()),
                ..Default::default()
            });
        }

        self.driver.pool.move_inactive_outside();
        let activated = self.driver.pool.active_count() > 0;
        if activated {
            self.population = ReadPopulation::Complete;
            self.driver.end_of_data = false;
            self.driver.install_streams(self.keep_order)?;
        }
        debug!(
            table = %self.driver.table.name,
            ids = batch.ids.len(),
            active = self.driver.pool.active_count(),
            keep_order = batch.keep_order,
            "populated row-id batch"
        );
        Ok(activated)
    }

    fn row_id_within_bounds(&self, id: &Bytes) -> bool {
        let lower_ok = match &self.template.lower_bound {
            Some(bound) if !self.driver.router.is_hash_key_bound(&bound.key) => {
                if bound.inclusive {
                    id >= &bound.key
                } else {
                    id > &bound.key
                }
            }
            _ => true,
        };
        let upper_ok = match &self.template.upper_bound {
            Some(bound) if !self.driver.router.is_hash_key_bound(&bound.key) => {
                if bound.inclusive {
                    id <= &bound.key
                } else {
                    id < &bound.key
                }
            }
            _ => true,
        };
        lower_ok && upper_ok
    }

    /// Next row as `column_count` optional values, fetching as needed.
    /// `None` at end of data.
    pub async fn next_row(
        &mut self,
        column_count: usize,
    ) -> ExecResult<Option<Vec<Option<Bytes>>>> {
        loop {
            match self.driver.mux.pick(&self.driver.pool)? {
                StreamPick::Stream(index) => {
                    let stream = self.driver.mux.stream_mut(index)?;
                    let Some(result) = stream.next_result(&self.driver.pool)? else {
                        continue;
                    };
                    return Ok(Some(result.read_row(column_count)?));
                }
                StreamPick::NeedsFetch => self.fetch_more_results().await?,
                StreamPick::Done => {
                    if self.driver.end_of_data {
                        return Ok(None);
                    }
                    self.fetch_more_results().await?;
                }
            }
        }
    }

    /// Next batch of row identifiers from an index scan, consumed whole.
    /// `None` at end of data.
    pub async fn next_row_id_batch(&mut self) -> ExecResult<Option<RowIdBatch>> {
        loop {
            match self.driver.mux.pick(&self.driver.pool)? {
                StreamPick::Stream(index) => {
                    let stream = self.driver.mux.stream_mut(index)?;
                    let Some(result) = stream.next_result(&self.driver.pool)? else {
                        continue;
                    };
                    let ids = result.extract_row_ids()?.to_vec();
                    return Ok(Some(RowIdBatch {
                        ids,
                        keep_order: self.keep_order,
                    }));
                }
                StreamPick::NeedsFetch => self.fetch_more_results().await?,
                StreamPick::Done => {
                    if self.driver.end_of_data {
                        return Ok(None);
                    }
                    self.fetch_more_results().await?;
                }
            }
        }
    }

    /// Active result multiplexer. Before the first population this is an
    /// empty cached stream; population replaces it.
    pub fn result_stream(&mut self) -> &mut ResultMux {
        &mut self.driver.mux
    }

    /// Whether every response has been received and consumed.
    pub fn end_of_data(&self) -> bool {
        self.driver.end_of_data
    }

    /// Backfill continuation captured from a `backfill batch done` response.
    pub fn backfill_continuation(&self) -> Option<&Bytes> {
        self.backfill_continuation.as_ref()
    }
}

/// Write operation dispatching pre-encoded payloads.
pub struct ShardedWriteOp {
    driver: OpDriver,
}

impl ShardedWriteOp {
    /// Creates an empty write; payloads are added with [`Self::add_write`].
    pub fn new(
        transport: Arc<dyn OpTransport>,
        router: Arc<dyn ShardRouter>,
        metrics: Arc<ExecMetrics>,
        table: TableShape,
        config: ExecConfig,
    ) -> Self {
        Self {
            driver: OpDriver::new(transport, router, metrics, table, config),
        }
    }

    /// Applies per-statement parameters.
    pub fn execute_init(&mut self, params: &ExecParams) -> ExecResult<()> {
        if !self.driver.pool.is_empty() {
            return Err(ExecError::illegal_state(
                "execution parameters supplied after request population",
            ));
        }
        self.driver.params = params.clone();
        Ok(())
    }

    /// Adds one write payload routed to the shard owning `partition_key`.
    pub fn add_write(&mut self, write: WriteRequest, partition_key: &[u8]) -> ExecResult<()> {
        let shard = self.driver.router.shard_index_for_key(partition_key)?;
        self.driver.acquire_op(OpRequest::Write(write), Some(shard));
        Ok(())
    }

    /// Submits every pending write in one round. Returns whether a round was
    /// submitted.
    pub fn execute(&mut self, force_non_bufferable: bool) -> ExecResult<bool> {
        self.driver.check_status()?;
        let limit = self.driver.pool.len();
        self.driver.send_active_ops(limit, false, force_non_bufferable)
    }

    /// Resolves the pending round and accumulates affected-row counts.
    /// Fetching before the write was executed is a protocol error. Fails
    /// sticky like the read path.
    pub async fn fetch_more_results(&mut self) -> ExecResult<()> {
        self.driver.check_status()?;
        match self.fetch_inner().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.driver.status = Some(err.clone());
                Err(err)
            }
        }
    }

    async fn fetch_inner(&mut self) -> ExecResult<()> {
        if self.driver.end_of_data {
            return Ok(());
        }
        let Some(responses) = self.driver.resolve_response().await? else {
            // No round in flight: pending payloads would be dropped silently.
            return Err(ExecError::illegal_state(
                "write results fetched before execution",
            ));
        };
        for (index, response) in responses.into_iter().enumerate() {
            self.driver
                .note_partition_list_version(response.partition_list_version);
            let op = &mut self.driver.pool.ops_mut()[index];
            let op_id = op.id();
            op.set_active(false);
            self.driver.rows_affected += response.rows_affected;
            // RETURNING-style payloads come back on the write response.
            if let Some(data) = response.rows_data {
                let result = OpResult::with_orders(data, &response.batch_orders)?;
                if matches!(self.driver.mux, ResultMux::Cached(_)) {
                    self.driver.install_streams(false)?;
                }
                self.driver.mux.accept_response(op_id, result, false)?;
            }
        }
        self.driver.pool.move_inactive_outside();
        if self.driver.pool.active_count() == 0 {
            self.driver.end_of_data = true;
        }
        Ok(())
    }

    /// Total rows affected across every response. Calling before the write
    /// completed is a protocol error.
    pub fn rows_affected(&self) -> ExecResult<i64> {
        if !self.driver.end_of_data {
            return Err(ExecError::illegal_state(
                "rows affected requested before the write completed",
            ));
        }
        Ok(self.driver.rows_affected)
    }

    /// Active result multiplexer for RETURNING-style payloads.
    pub fn result_stream(&mut self) -> &mut ResultMux {
        &mut self.driver.mux
    }

    /// Next row of RETURNING-style payloads, if the storage layer produced
    /// any.
    pub async fn next_row(
        &mut self,
        column_count: usize,
    ) -> ExecResult<Option<Vec<Option<Bytes>>>> {
        loop {
            match self.driver.mux.pick(&self.driver.pool)? {
                StreamPick::Stream(index) => {
                    let stream = self.driver.mux.stream_mut(index)?;
                    let Some(result) = stream.next_result(&self.driver.pool)? else {
                        continue;
                    };
                    return Ok(Some(result.read_row(column_count)?));
                }
                StreamPick::NeedsFetch => self.fetch_more_results().await?,
                StreamPick::Done => return Ok(None),
            }
        }
    }
}

/// Read operation serving pre-materialized batches, e.g. catalog caches.
/// Never touches the transport.
pub struct CachedReadOp {
    mux: ResultMux,
    pool: OpPool,
}

impl CachedReadOp {
    /// Wraps already decoded result batches.
    pub fn new(results: impl IntoIterator<Item = OpResult>) -> Self {
        Self {
            mux: ResultMux::cached(results),
            pool: OpPool::default(),
        }
    }

    /// Next row from the cached batches. `None` at end of data.
    pub fn next_row(&mut self, column_count: usize) -> ExecResult<Option<Vec<Option<Bytes>>>> {
        loop {
            match self.mux.pick(&self.pool)? {
                StreamPick::Stream(index) => {
                    let stream = self.mux.stream_mut(index)?;
                    let Some(result) = stream.next_result(&self.pool)? else {
                        continue;
                    };
                    return Ok(Some(result.read_row(column_count)?));
                }
                StreamPick::NeedsFetch => {
                    return Err(ExecError::unimplemented(
                        "cached result stream does not fetch",
                    ))
                }
                StreamPick::Done => return Ok(None),
            }
        }
    }
}
