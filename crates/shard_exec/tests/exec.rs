//! End-to-end execution flows against a scripted in-process transport.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

use shard_exec::decoder::ResultBuilder;
use shard_exec::operation::{
    ColumnBind, InListBind, OpRequest, ReadRequest, ShardOpResponse, WriteRequest,
};
use shard_exec::result::RowIdBatch;
use shard_exec::{
    ExecConfig, ExecError, ExecMetrics, ExecParams, ExecResult, OpSubmitRequest, OpTransport,
    ShardedReadOp, ShardedWriteOp, StaticShardMap, TableKind, TableShape,
};

type Responder =
    Box<dyn FnOnce(&OpSubmitRequest) -> ExecResult<Vec<ShardOpResponse>> + Send + 'static>;

/// Transport double answering each submission round from a script and
/// recording every submitted request for later assertions.
struct ScriptedTransport {
    script: Mutex<VecDeque<Responder>>,
    captured: Mutex<Vec<OpSubmitRequest>>,
}

impl ScriptedTransport {
    fn new(script: Vec<Responder>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            captured: Mutex::new(Vec::new()),
        })
    }

    fn captured(&self) -> Vec<OpSubmitRequest> {
        self.captured.lock().unwrap().clone()
    }
}

#[async_trait]
impl OpTransport for ScriptedTransport {
    async fn submit(&self, request: OpSubmitRequest) -> ExecResult<Vec<ShardOpResponse>> {
        self.captured.lock().unwrap().push(request.clone());
        let responder = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ExecError::illegal_state("unscripted submission round"))?;
        responder(&request)
    }
}

fn rows(values: &[&str]) -> Bytes {
    let mut builder = ResultBuilder::new();
    for value in values {
        builder.push_row([Some(value.as_bytes())]);
    }
    builder.finish()
}

fn range_table(split_keys: &[&str], node_count: usize) -> (Arc<StaticShardMap>, TableShape) {
    let mut keys = vec![Bytes::new()];
    keys.extend(split_keys.iter().map(|key| Bytes::copy_from_slice(key.as_bytes())));
    let router = Arc::new(StaticShardMap::range(keys, node_count).unwrap());
    let table = TableShape {
        name: "events".to_string(),
        kind: TableKind::User,
        num_hash_columns: 0,
        num_key_columns: 1,
    };
    (router, table)
}

fn read_op(
    transport: Arc<ScriptedTransport>,
    router: Arc<StaticShardMap>,
    table: TableShape,
    config: ExecConfig,
    template: ReadRequest,
) -> ShardedReadOp {
    ShardedReadOp::new(
        transport,
        router,
        Arc::new(ExecMetrics::default()),
        table,
        config,
        template,
    )
}

async fn drain_single_column(op: &mut ShardedReadOp) -> ExecResult<Vec<Bytes>> {
    let mut drained = Vec::new();
    while let Some(row) = op.next_row(1).await? {
        drained.push(row[0].clone().expect("non-null test column"));
    }
    Ok(drained)
}

fn request_read(request: &OpRequest) -> &ReadRequest {
    match request {
        OpRequest::Read(read) => read,
        OpRequest::Write(_) => panic!("expected a read request"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn parallel_scan_pages_through_all_shards() -> Result<()> {
    let (router, table) = range_table(&["g"], 1);
    let transport = ScriptedTransport::new(vec![
        Box::new(|request| {
            assert_eq!(request.ops.len(), 2);
            Ok(vec![
                ShardOpResponse {
                    rows_data: Some(rows(&["a", "b"])),
                    paging_state: Some(Bytes::from_static(b"p0")),
                    ..Default::default()
                },
                ShardOpResponse {
                    rows_data: Some(rows(&["x"])),
                    ..Default::default()
                },
            ])
        }),
        Box::new(|request| {
            assert_eq!(request.ops.len(), 1);
            Ok(vec![ShardOpResponse {
                rows_data: Some(rows(&["c"])),
                ..Default::default()
            }])
        }),
    ]);

    let mut op = read_op(
        Arc::clone(&transport),
        router,
        table,
        ExecConfig::default(),
        ReadRequest::default(),
    );
    assert!(op.execute_init(&ExecParams::default())?);
    assert!(op.execute(false)?);

    let mut drained = drain_single_column(&mut op).await?;
    drained.sort();
    assert_eq!(drained, vec!["a", "b", "c", "x"]);
    assert!(op.end_of_data());

    // The continuation round carries the paging token back to the shard.
    let captured = transport.captured();
    assert_eq!(captured.len(), 2);
    let continuation = request_read(&captured[1].ops[0].request);
    assert_eq!(
        continuation.paging_state.as_deref(),
        Some(b"p0".as_slice())
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_read_is_idempotent() -> Result<()> {
    let (router, table) = range_table(&[], 1);
    let transport = ScriptedTransport::new(vec![Box::new(|_| {
        Ok(vec![ShardOpResponse {
            rows_data: Some(rows(&["only"])),
            ..Default::default()
        }])
    })]);

    let mut op = read_op(
        Arc::clone(&transport),
        router,
        table,
        ExecConfig::default(),
        ReadRequest::default(),
    );
    op.execute_init(&ExecParams::default())?;
    op.execute(false)?;
    assert_eq!(drain_single_column(&mut op).await?.len(), 1);
    assert!(op.end_of_data());

    // Further fetches are no-ops and submit nothing.
    op.fetch_more_results().await?;
    op.fetch_more_results().await?;
    assert!(op.next_row(1).await?.is_none());
    assert_eq!(transport.captured().len(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn ordered_row_id_batch_merges_by_order_tag() -> Result<()> {
    // Shards [,c) [c,e) [e,): a,b -> 0; c,d -> 1; e -> 2.
    let (router, table) = range_table(&["c", "e"], 1);
    let transport = ScriptedTransport::new(vec![Box::new(|request| {
        // Answer each operation with one row per batch argument, tagged
        // with the argument's order, rows named v<order>.
        Ok(request
            .ops
            .iter()
            .map(|entry| {
                let read = request_read(&entry.request);
                let orders: Vec<i64> = read
                    .batch_arguments
                    .iter()
                    .map(|arg| arg.order.unwrap())
                    .collect();
                let mut builder = ResultBuilder::new();
                for order in &orders {
                    builder.push_row([Some(format!("v{order}").as_bytes())]);
                }
                ShardOpResponse {
                    rows_data: Some(builder.finish()),
                    batch_orders: orders,
                    batch_arg_count: read.batch_arguments.len() as i64,
                    ..Default::default()
                }
            })
            .collect())
    })]);

    let config = ExecConfig {
        select_parallelism: Some(3),
        ..ExecConfig::default()
    };
    let mut op = read_op(
        Arc::clone(&transport),
        router,
        table,
        config,
        ReadRequest::default(),
    );
    op.execute_init(&ExecParams::default())?;
    let batch = RowIdBatch {
        ids: ["a", "c", "b", "e", "d"]
            .iter()
            .map(|id| Bytes::copy_from_slice(id.as_bytes()))
            .collect(),
        keep_order: true,
    };
    assert!(op.populate_by_row_ids(&batch)?);
    op.execute(false)?;

    let drained = drain_single_column(&mut op).await?;
    assert_eq!(drained, vec!["v0", "v1", "v2", "v3", "v4"]);
    assert_eq!(transport.captured()[0].ops.len(), 3);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn partial_batch_completion_trims_and_resends() -> Result<()> {
    let (router, table) = range_table(&[], 1);
    let transport = ScriptedTransport::new(vec![
        Box::new(|request| {
            assert_eq!(request_read(&request.ops[0].request).batch_arguments.len(), 3);
            Ok(vec![ShardOpResponse {
                rows_data: Some(rows(&["va"])),
                batch_arg_count: 1,
                ..Default::default()
            }])
        }),
        Box::new(|request| {
            let read = request_read(&request.ops[0].request);
            // The consumed front argument is gone and the legacy singular
            // row id tracks the new front.
            assert_eq!(read.batch_arguments.len(), 2);
            assert_eq!(
                read.batch_arguments[0].row_id.as_deref(),
                Some(b"b".as_slice())
            );
            assert_eq!(read.row_id_value.as_deref(), Some(b"b".as_slice()));
            Ok(vec![ShardOpResponse {
                rows_data: Some(rows(&["vb", "vc"])),
                batch_arg_count: 2,
                ..Default::default()
            }])
        }),
    ]);

    let mut op = read_op(
        Arc::clone(&transport),
        router,
        table,
        ExecConfig::default(),
        ReadRequest::default(),
    );
    op.execute_init(&ExecParams::default())?;
    let batch = RowIdBatch {
        ids: ["a", "b", "c"]
            .iter()
            .map(|id| Bytes::copy_from_slice(id.as_bytes()))
            .collect(),
        keep_order: false,
    };
    assert!(op.populate_by_row_ids(&batch)?);
    op.execute(false)?;

    let drained = drain_single_column(&mut op).await?;
    assert_eq!(drained, vec!["va", "vb", "vc"]);
    assert_eq!(transport.captured().len(), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn transport_failure_is_sticky() -> Result<()> {
    let (router, table) = range_table(&[], 1);
    let transport =
        ScriptedTransport::new(vec![Box::new(|_| Err(ExecError::transport("shard down")))]);

    let mut op = read_op(
        Arc::clone(&transport),
        router,
        table,
        ExecConfig::default(),
        ReadRequest::default(),
    );
    op.execute_init(&ExecParams::default())?;
    op.execute(false)?;

    let first = op.fetch_more_results().await.unwrap_err();
    assert!(matches!(first, ExecError::Transport(_)));
    // Every subsequent call re-returns the same status without touching the
    // transport again.
    let second = op.fetch_more_results().await.unwrap_err();
    assert_eq!(first, second);
    assert!(matches!(
        op.next_row(1).await,
        Err(ExecError::Transport(_))
    ));
    assert_eq!(transport.captured().len(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn permutation_rounds_reuse_the_pool_until_exhausted() -> Result<()> {
    let router = Arc::new(StaticShardMap::hash(2, 1).unwrap());
    let table = TableShape {
        name: "points".to_string(),
        kind: TableKind::User,
        num_hash_columns: 1,
        num_key_columns: 2,
    };
    let respond_one_row_each = |tag: &'static str| -> Responder {
        Box::new(move |request: &OpSubmitRequest| {
            Ok(request
                .ops
                .iter()
                .enumerate()
                .map(|(index, entry)| {
                    assert!(request_read(&entry.request).hash_code.is_some());
                    ShardOpResponse {
                        rows_data: Some(rows(&[&format!("{tag}{index}")])),
                        ..Default::default()
                    }
                })
                .collect())
        })
    };
    let transport = ScriptedTransport::new(vec![
        respond_one_row_each("r"),
        respond_one_row_each("s"),
    ]);

    let mut template = ReadRequest::default();
    template.partition_column_values = vec![ColumnBind::InList(InListBind {
        columns: vec![0],
        candidates: (0..4u8).map(|i| vec![Bytes::copy_from_slice(&[i])]).collect(),
    })];
    let config = ExecConfig {
        request_limit: 2,
        enable_hash_batching: false,
        select_parallelism: Some(4),
        ..ExecConfig::default()
    };
    let mut op = read_op(Arc::clone(&transport), router, table, config, template);
    op.execute_init(&ExecParams::default())?;
    op.execute(false)?;

    let mut drained = drain_single_column(&mut op).await?;
    drained.sort();
    assert_eq!(drained, vec!["r0", "r1", "s0", "s1"]);

    // Four permutations served through two rounds of two pooled requests.
    let captured = transport.captured();
    assert_eq!(captured.len(), 2);
    assert_eq!(captured[0].ops.len(), 2);
    assert_eq!(captured[1].ops.len(), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_fetch_keeps_buffered_permutation_rows() -> Result<()> {
    let router = Arc::new(StaticShardMap::hash(2, 1).unwrap());
    let table = TableShape {
        name: "points".to_string(),
        kind: TableKind::User,
        num_hash_columns: 1,
        num_key_columns: 2,
    };
    let respond_one_row_each = |tag: &'static str| -> Responder {
        Box::new(move |request: &OpSubmitRequest| {
            Ok(request
                .ops
                .iter()
                .enumerate()
                .map(|(index, _)| ShardOpResponse {
                    rows_data: Some(rows(&[&format!("{tag}{index}")])),
                    ..Default::default()
                })
                .collect())
        })
    };
    let transport = ScriptedTransport::new(vec![
        respond_one_row_each("r"),
        respond_one_row_each("s"),
    ]);

    let mut template = ReadRequest::default();
    template.partition_column_values = vec![ColumnBind::InList(InListBind {
        columns: vec![0],
        candidates: (0..4u8).map(|i| vec![Bytes::copy_from_slice(&[i])]).collect(),
    })];
    let config = ExecConfig {
        request_limit: 2,
        enable_hash_batching: false,
        select_parallelism: Some(4),
        ..ExecConfig::default()
    };
    let mut op = read_op(Arc::clone(&transport), router, table, config, template);
    op.execute_init(&ExecParams::default())?;
    op.execute(false)?;

    // Fetch twice before reading anything: the second fetch triggers the
    // next population round while round-1 rows are still buffered.
    op.fetch_more_results().await?;
    op.fetch_more_results().await?;

    let mut drained = drain_single_column(&mut op).await?;
    drained.sort();
    assert_eq!(drained, vec!["r0", "r1", "s0", "s1"]);
    assert_eq!(transport.captured().len(), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn paging_with_partial_batch_trims_consumed_arguments() -> Result<()> {
    let (router, table) = range_table(&[], 1);
    let transport = ScriptedTransport::new(vec![
        Box::new(|request| {
            assert_eq!(request_read(&request.ops[0].request).batch_arguments.len(), 3);
            Ok(vec![ShardOpResponse {
                rows_data: Some(rows(&["va"])),
                batch_arg_count: 1,
                paging_state: Some(Bytes::from_static(b"p")),
                ..Default::default()
            }])
        }),
        Box::new(|request| {
            let read = request_read(&request.ops[0].request);
            // The continuation carries the paging token but not the
            // consumed front argument.
            assert_eq!(read.paging_state.as_deref(), Some(b"p".as_slice()));
            assert_eq!(read.batch_arguments.len(), 2);
            assert_eq!(
                read.batch_arguments[0].row_id.as_deref(),
                Some(b"b".as_slice())
            );
            assert_eq!(read.row_id_value.as_deref(), Some(b"b".as_slice()));
            Ok(vec![ShardOpResponse {
                rows_data: Some(rows(&["vb", "vc"])),
                batch_arg_count: 2,
                ..Default::default()
            }])
        }),
    ]);

    let mut op = read_op(
        Arc::clone(&transport),
        router,
        table,
        ExecConfig::default(),
        ReadRequest::default(),
    );
    op.execute_init(&ExecParams::default())?;
    let batch = RowIdBatch {
        ids: ["a", "b", "c"]
            .iter()
            .map(|id| Bytes::copy_from_slice(id.as_bytes()))
            .collect(),
        keep_order: false,
    };
    assert!(op.populate_by_row_ids(&batch)?);
    op.execute(false)?;

    let drained = drain_single_column(&mut op).await?;
    assert_eq!(drained, vec!["va", "vb", "vc"]);
    assert_eq!(transport.captured().len(), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn backfill_batch_done_captures_continuation() -> Result<()> {
    let (router, table) = range_table(&[], 1);
    let transport = ScriptedTransport::new(vec![Box::new(|request| {
        let read = request_read(&request.ops[0].request);
        assert!(read.is_for_backfill);
        assert_eq!(read.backfill_spec.as_deref(), Some(b"spec0".as_slice()));
        assert_eq!(request.read_time, Some(42));
        Ok(vec![ShardOpResponse {
            is_backfill_batch_done: true,
            backfill_spec: Some(Bytes::from_static(b"spec1")),
            ..Default::default()
        }])
    })]);

    let mut op = read_op(
        Arc::clone(&transport),
        router,
        table,
        ExecConfig::default(),
        ReadRequest::default(),
    );
    let params = ExecParams {
        backfill_spec: Some(Bytes::from_static(b"spec0")),
        read_time: Some(42),
        ..ExecParams::default()
    };
    op.execute_init(&params)?;
    op.execute(false)?;
    op.fetch_more_results().await?;

    assert!(op.end_of_data());
    assert_eq!(
        op.backfill_continuation().map(|spec| spec.as_ref()),
        Some(b"spec1".as_slice())
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn write_accumulates_rows_affected() -> Result<()> {
    let (router, table) = range_table(&["g"], 1);
    let transport = ScriptedTransport::new(vec![Box::new(|request| {
        assert!(request.is_write);
        assert_eq!(request.ops.len(), 2);
        Ok(vec![
            ShardOpResponse {
                rows_affected: 2,
                ..Default::default()
            },
            ShardOpResponse {
                rows_affected: 3,
                ..Default::default()
            },
        ])
    })]);

    let mut op = ShardedWriteOp::new(
        Arc::clone(&transport) as Arc<dyn OpTransport>,
        router,
        Arc::new(ExecMetrics::default()),
        table,
        ExecConfig::default(),
    );
    op.execute_init(&ExecParams::default())?;
    op.add_write(
        WriteRequest {
            payload: Bytes::from_static(b"w1"),
            is_index_request: false,
        },
        b"a",
    )?;
    op.add_write(
        WriteRequest {
            payload: Bytes::from_static(b"w2"),
            is_index_request: false,
        },
        b"z",
    )?;
    assert!(op.execute(false)?);
    assert!(matches!(
        op.rows_affected(),
        Err(ExecError::IllegalState(_))
    ));

    op.fetch_more_results().await?;
    assert_eq!(op.rows_affected()?, 5);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn write_fetch_before_execute_is_rejected() -> Result<()> {
    let (router, table) = range_table(&[], 1);
    let transport = ScriptedTransport::new(vec![]);

    let mut op = ShardedWriteOp::new(
        Arc::clone(&transport) as Arc<dyn OpTransport>,
        router,
        Arc::new(ExecMetrics::default()),
        table,
        ExecConfig::default(),
    );
    op.execute_init(&ExecParams::default())?;
    op.add_write(
        WriteRequest {
            payload: Bytes::from_static(b"w"),
            is_index_request: false,
        },
        b"k",
    )?;

    // The pending payload was never executed; fetching must not swallow it.
    assert!(matches!(
        op.fetch_more_results().await,
        Err(ExecError::IllegalState(_))
    ));
    assert!(matches!(
        op.rows_affected(),
        Err(ExecError::IllegalState(_))
    ));
    assert!(transport.captured().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn small_limit_suppresses_prefetch_until_fetched_again() -> Result<()> {
    let (router, table) = range_table(&[], 1);
    let transport = ScriptedTransport::new(vec![
        Box::new(|request| {
            assert_eq!(request_read(&request.ops[0].request).limit, 2);
            Ok(vec![ShardOpResponse {
                rows_data: Some(rows(&["a", "b"])),
                paging_state: Some(Bytes::from_static(b"p")),
                ..Default::default()
            }])
        }),
        Box::new(|_| {
            Ok(vec![ShardOpResponse {
                rows_data: Some(rows(&["c"])),
                ..Default::default()
            }])
        }),
    ]);

    let params = ExecParams {
        limit: Some(2),
        ..ExecParams::default()
    };
    let mut op = read_op(
        Arc::clone(&transport),
        router,
        table,
        ExecConfig::default(),
        ReadRequest::default(),
    );
    op.execute_init(&params)?;
    op.execute(false)?;
    op.fetch_more_results().await?;
    // The follow-up page was not prefetched behind the small LIMIT.
    assert_eq!(transport.captured().len(), 1);

    let drained = drain_single_column(&mut op).await?;
    assert_eq!(drained, vec!["a", "b", "c"]);
    assert_eq!(transport.captured().len(), 2);
    Ok(())
}
