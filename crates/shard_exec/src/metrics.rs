//! In-process counters for shard operation execution.
//!
//! Plain relaxed atomics, bumped on the read and write hot paths with no
//! locking and no allocation. Each table kind gets its own counter set so
//! catalog churn does not drown out user-table numbers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::TableKind;

/// Counters for one table kind.
#[derive(Debug, Default)]
struct KindCounters {
    /// Number of read request rounds resolved.
    read_requests: AtomicU64,
    /// Sum of read round-trip wait time in nanoseconds.
    read_wait_ns_total: AtomicU64,
    /// Storage rows scanned to serve resolved reads.
    read_rows_scanned: AtomicU64,
    /// Number of write request rounds submitted.
    write_requests: AtomicU64,
}

impl KindCounters {
    fn snapshot(&self) -> KindSnapshot {
        KindSnapshot {
            read_requests: self.read_requests.load(Ordering::Relaxed),
            read_wait_ns_total: self.read_wait_ns_total.load(Ordering::Relaxed),
            read_rows_scanned: self.read_rows_scanned.load(Ordering::Relaxed),
            write_requests: self.write_requests.load(Ordering::Relaxed),
        }
    }
}

/// Aggregated execution counters, one set per table kind.
#[derive(Debug, Default)]
pub struct ExecMetrics {
    user: KindCounters,
    index: KindCounters,
    system: KindCounters,
}

/// Point-in-time copy of one table kind's counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct KindSnapshot {
    /// Read request rounds resolved.
    pub read_requests: u64,
    /// Sum of read wait time in nanoseconds.
    pub read_wait_ns_total: u64,
    /// Storage rows scanned for reads.
    pub read_rows_scanned: u64,
    /// Write request rounds submitted.
    pub write_requests: u64,
}

/// Immutable snapshot view of [`ExecMetrics`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecMetricsSnapshot {
    /// User-table counters.
    pub user: KindSnapshot,
    /// Secondary-index counters.
    pub index: KindSnapshot,
    /// System-catalog counters.
    pub system: KindSnapshot,
}

impl ExecMetrics {
    fn counters(&self, kind: TableKind) -> &KindCounters {
        match kind {
            TableKind::User => &self.user,
            TableKind::Index => &self.index,
            TableKind::System => &self.system,
        }
    }

    /// Records one resolved read round: wall wait time plus the storage rows
    /// scanned across every response in the round.
    pub fn record_read(&self, kind: TableKind, wait: Duration, rows_scanned: u64) {
        let counters = self.counters(kind);
        counters.read_requests.fetch_add(1, Ordering::Relaxed);
        counters
            .read_wait_ns_total
            .fetch_add(wait.as_nanos() as u64, Ordering::Relaxed);
        counters
            .read_rows_scanned
            .fetch_add(rows_scanned, Ordering::Relaxed);
    }

    /// Records one submitted write round.
    pub fn record_write(&self, kind: TableKind) {
        self.counters(kind)
            .write_requests
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Captures a point-in-time copy of all counters.
    pub fn snapshot(&self) -> ExecMetricsSnapshot {
        ExecMetricsSnapshot {
            user: self.user.snapshot(),
            index: self.index.snapshot(),
            system: self.system.snapshot(),
        }
    }

    /// Renders counters as `key=value` lines for a text metrics endpoint.
    pub fn render_text(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();
        for (kind, snap) in [
            ("user", s.user),
            ("index", s.index),
            ("system", s.system),
        ] {
            out.push_str(&format!(
                "exec_{kind}_read_requests={}\nexec_{kind}_read_wait_ns_total={}\nexec_{kind}_read_rows_scanned={}\nexec_{kind}_write_requests={}\n",
                snap.read_requests,
                snap.read_wait_ns_total,
                snap.read_rows_scanned,
                snap.write_requests,
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_isolated() {
        let metrics = ExecMetrics::default();
        metrics.record_read(TableKind::User, Duration::from_nanos(500), 12);
        metrics.record_read(TableKind::User, Duration::from_nanos(250), 3);
        metrics.record_write(TableKind::Index);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.user.read_requests, 2);
        assert_eq!(snapshot.user.read_wait_ns_total, 750);
        assert_eq!(snapshot.user.read_rows_scanned, 15);
        assert_eq!(snapshot.user.write_requests, 0);
        assert_eq!(snapshot.index.write_requests, 1);
        assert_eq!(snapshot.system.read_requests, 0);
    }

    #[test]
    fn render_text_lists_every_kind() {
        let metrics = ExecMetrics::default();
        metrics.record_write(TableKind::System);
        let text = metrics.render_text();
        assert!(text.contains("exec_user_read_requests=0"));
        assert!(text.contains("exec_system_write_requests=1"));
    }
}
