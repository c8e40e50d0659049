//! Single-consumption handle over one in-flight response round.
//!
//! A logical operation keeps at most one of these: either a future produced
//! by the transport (the prefetch pipeline) or a precomputed response vector
//! (population paths that already know the answer). The handle resolves
//! exactly once; read wait-time metrics are recorded at that moment so a
//! round is never double counted.

use std::sync::Arc;
use std::time::Instant;

use futures_util::future::BoxFuture;
use tracing::trace;

use crate::error::{ExecError, ExecResult};
use crate::metrics::ExecMetrics;
use crate::operation::ShardOpResponse;
use crate::TableKind;

enum ResponseState {
    Pending {
        future: BoxFuture<'static, ExecResult<Vec<ShardOpResponse>>>,
        submitted_at: Instant,
    },
    Ready(Vec<ShardOpResponse>),
    Consumed,
}

/// Pending or precomputed result of one submission round.
pub struct DocResponse {
    state: ResponseState,
    metrics: Arc<ExecMetrics>,
    kind: TableKind,
    is_read: bool,
}

impl DocResponse {
    /// Wraps a transport future. Write rounds are counted here, at
    /// submission; read rounds are counted on resolution, when the wait time
    /// is known.
    pub fn pending(
        future: BoxFuture<'static, ExecResult<Vec<ShardOpResponse>>>,
        metrics: Arc<ExecMetrics>,
        kind: TableKind,
        is_read: bool,
    ) -> Self {
        if !is_read {
            metrics.record_write(kind);
        }
        Self {
            state: ResponseState::Pending {
                future,
                submitted_at: Instant::now(),
            },
            metrics,
            kind,
            is_read,
        }
    }

    /// Wraps responses produced without a network round; no metrics are
    /// recorded.
    pub fn precomputed(responses: Vec<ShardOpResponse>, metrics: Arc<ExecMetrics>) -> Self {
        Self {
            state: ResponseState::Ready(responses),
            metrics,
            kind: TableKind::User,
            is_read: false,
        }
    }

    /// Resolves the round. Consuming a handle twice is a protocol error.
    pub async fn get(&mut self) -> ExecResult<Vec<ShardOpResponse>> {
        match std::mem::replace(&mut self.state, ResponseState::Consumed) {
            ResponseState::Consumed => Err(ExecError::illegal_state(
                "response round consumed more than once",
            )),
            ResponseState::Ready(responses) => Ok(responses),
            ResponseState::Pending {
                future,
                submitted_at,
            } => {
                let responses = future.await?;
                if self.is_read {
                    let scanned: u64 = responses.iter().map(|r| r.scanned_rows).sum();
                    self.metrics
                        .record_read(self.kind, submitted_at.elapsed(), scanned);
                }
                trace!(responses = responses.len(), "resolved response round");
                Ok(responses)
            }
        }
    }
}

impl std::fmt::Debug for DocResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            ResponseState::Pending { .. } => "pending",
            ResponseState::Ready(_) => "ready",
            ResponseState::Consumed => "consumed",
        };
        f.debug_struct("DocResponse")
            .field("state", &state)
            .field("kind", &self.kind)
            .field("is_read", &self.is_read)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    #[tokio::test]
    async fn pending_round_records_read_metrics_once() {
        let metrics = Arc::new(ExecMetrics::default());
        let responses = vec![ShardOpResponse {
            scanned_rows: 42,
            ..Default::default()
        }];
        let mut handle = DocResponse::pending(
            async move { Ok(responses) }.boxed(),
            Arc::clone(&metrics),
            TableKind::Index,
            true,
        );
        let resolved = handle.get().await.unwrap();
        assert_eq!(resolved.len(), 1);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.index.read_requests, 1);
        assert_eq!(snapshot.index.read_rows_scanned, 42);
    }

    #[tokio::test]
    async fn double_consumption_is_rejected() {
        let metrics = Arc::new(ExecMetrics::default());
        let mut handle = DocResponse::precomputed(vec![ShardOpResponse::default()], metrics);
        handle.get().await.unwrap();
        assert!(matches!(
            handle.get().await,
            Err(ExecError::IllegalState(_))
        ));
    }

    #[tokio::test]
    async fn write_round_counts_at_submission() {
        let metrics = Arc::new(ExecMetrics::default());
        let _handle = DocResponse::pending(
            async { Ok(Vec::new()) }.boxed(),
            Arc::clone(&metrics),
            TableKind::User,
            false,
        );
        // Counted even though the round is never resolved.
        assert_eq!(metrics.snapshot().user.write_requests, 1);
    }
}
