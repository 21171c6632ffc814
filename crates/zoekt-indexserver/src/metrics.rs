//! Counters for the admin surface, rendered as Prometheus text.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;

use crate::IndexState;

pub struct MetricsSnapshot {
    pub index_fail: u64,
    pub index_success: u64,
    pub index_success_meta: u64,
    pub index_noop: u64,
    pub index_empty: u64,
    pub sync_failed: u64,
    pub queue_len: u64,
    pub compound_shards: u64,
    pub last_sync_unix: u64,
}

struct Metrics {
    index_fail: AtomicU64,
    index_success: AtomicU64,
    index_success_meta: AtomicU64,
    index_noop: AtomicU64,
    index_empty: AtomicU64,
    sync_failed: AtomicU64,
    queue_len: AtomicU64,
    compound_shards: AtomicU64,
    last_sync_unix: AtomicU64,
}

impl Metrics {
    const fn new() -> Self {
        Self {
            index_fail: AtomicU64::new(0),
            index_success: AtomicU64::new(0),
            index_success_meta: AtomicU64::new(0),
            index_noop: AtomicU64::new(0),
            index_empty: AtomicU64::new(0),
            sync_failed: AtomicU64::new(0),
            queue_len: AtomicU64::new(0),
            compound_shards: AtomicU64::new(0),
            last_sync_unix: AtomicU64::new(0),
        }
    }
}

static METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

pub fn record_index(state: IndexState) {
    let counter = match state {
        IndexState::Fail => &METRICS.index_fail,
        IndexState::Success => &METRICS.index_success,
        IndexState::SuccessMeta => &METRICS.index_success_meta,
        IndexState::Noop => &METRICS.index_noop,
        IndexState::Empty => &METRICS.index_empty,
    };
    counter.fetch_add(1, Ordering::SeqCst);
}

pub fn inc_sync_failed() {
    METRICS.sync_failed.fetch_add(1, Ordering::SeqCst);
}

pub fn set_queue_len(n: usize) {
    METRICS.queue_len.store(n as u64, Ordering::SeqCst);
}

pub fn set_compound_shards(n: usize) {
    METRICS.compound_shards.store(n as u64, Ordering::SeqCst);
}

pub fn set_last_sync_now() {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    METRICS.last_sync_unix.store(now, Ordering::SeqCst);
}

pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        index_fail: METRICS.index_fail.load(Ordering::SeqCst),
        index_success: METRICS.index_success.load(Ordering::SeqCst),
        index_success_meta: METRICS.index_success_meta.load(Ordering::SeqCst),
        index_noop: METRICS.index_noop.load(Ordering::SeqCst),
        index_empty: METRICS.index_empty.load(Ordering::SeqCst),
        sync_failed: METRICS.sync_failed.load(Ordering::SeqCst),
        queue_len: METRICS.queue_len.load(Ordering::SeqCst),
        compound_shards: METRICS.compound_shards.load(Ordering::SeqCst),
        last_sync_unix: METRICS.last_sync_unix.load(Ordering::SeqCst),
    }
}

/// Hostname for the metrics node label: `NODE_NAME` wins, then `HOSTNAME`,
/// then a static fallback.
pub fn hostname_best_effort() -> String {
    for var in ["NODE_NAME", "HOSTNAME"] {
        if let Ok(h) = std::env::var(var) {
            if !h.is_empty() {
                return h;
            }
        }
    }
    "unknown".into()
}

pub fn render_prometheus() -> String {
    let s = snapshot();
    let node = hostname_best_effort();
    let mut out = String::new();
    out.push_str("# HELP index_total Index runs by final state\n# TYPE index_total counter\n");
    for (state, v) in [
        ("fail", s.index_fail),
        ("success", s.index_success),
        ("success_meta", s.index_success_meta),
        ("noop", s.index_noop),
        ("empty", s.index_empty),
    ] {
        out.push_str(&format!(
            "index_total{{state=\"{state}\",node=\"{node}\"}} {v}\n"
        ));
    }
    out.push_str(&format!(
        "# HELP index_sync_failed_total Sync ticks that failed\n# TYPE index_sync_failed_total counter\nindex_sync_failed_total{{node=\"{node}\"}} {}\n",
        s.sync_failed
    ));
    out.push_str(&format!(
        "# HELP index_queue_len Runnable entries in the queue\n# TYPE index_queue_len gauge\nindex_queue_len{{node=\"{node}\"}} {}\n",
        s.queue_len
    ));
    out.push_str(&format!(
        "# HELP index_compound_shards Compound shards on disk\n# TYPE index_compound_shards gauge\nindex_compound_shards{{node=\"{node}\"}} {}\n",
        s.compound_shards
    ));
    out.push_str(&format!(
        "# HELP index_last_sync_unix_seconds Last successful sync tick\n# TYPE index_last_sync_unix_seconds gauge\nindex_last_sync_unix_seconds{{node=\"{node}\"}} {}\n",
        s.last_sync_unix
    ));
    out
}
