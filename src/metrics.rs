//! Abstract metrics sink, decoupling the core from any particular exporter.
//!
//! A metrics *exporter* (Prometheus endpoint, etc.) is out of scope for this
//! core, but the seam it would plug into is not: every hot path reports
//! through [`MetricsSink`], which defaults to a no-op.

use once_cell::sync::OnceCell;

/// A no-op sink used when no backend has been installed, and in tests.
#[derive(Debug, Clone, Copy)]
pub struct NopSink;

/// The process-wide sink. Installed once via [`set_sink`]; reads default to
/// [`NopSink`] when absent.
static SINK: OnceCell<&'static dyn MetricsSink> = OnceCell::new();
static NOP_SINK: NopSink = NopSink;

/// Installs the global metrics sink. Returns `false` if a sink was already
/// installed (the sink is set-once, like the rest of this crate's statics).
pub fn set_sink(sink: &'static dyn MetricsSink) -> bool {
    SINK.set(sink).is_ok()
}

/// Returns the installed sink, or a no-op sink if none was installed.
pub fn metrics() -> &'static dyn MetricsSink {
    SINK.get().copied().unwrap_or(&NOP_SINK)
}

/// Metrics the buffer pool, WAL, and checkpointer report through.
pub trait MetricsSink: Send + Sync + std::fmt::Debug {
    /// A node frame was obtained from the free list or by eviction.
    fn inc_pool_get(&self) {}
    /// A frame was returned to the free list.
    fn inc_pool_return(&self) {}
    /// The clock evictor cleared a `use` bit and kept scanning.
    fn inc_pool_evict_miss(&self) {}
    /// The clock evictor reclaimed a frame.
    fn inc_pool_evict(&self) {}
    /// An overflow node was allocated because the dirty fraction crossed the threshold.
    fn inc_pool_overflow(&self) {}
    /// A WAL record of `bytes` length was appended.
    fn observe_wal_append(&self, _bytes: u64) {}
    /// A checkpoint drained `puts` node writes and `deletes` node deletions.
    fn observe_checkpoint(&self, _puts: u64, _deletes: u64, _duration_secs: f64) {}
}

impl MetricsSink for NopSink {}
