use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters owned by a running pipeline.
#[derive(Debug, Default)]
pub(crate) struct PipelineMetricsStorage {
    pub(crate) items_submitted: AtomicU64,
    pub(crate) items_completed: AtomicU64,
    pub(crate) items_failed: AtomicU64,
    pub(crate) items_cancelled: AtomicU64,
    pub(crate) stages_executed: AtomicU64,
    pub(crate) stage_failures: AtomicU64,
}

impl PipelineMetricsStorage {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, processes_spawned: u64) -> PipelineMetrics {
        PipelineMetrics {
            items_submitted: self.items_submitted.load(Ordering::Relaxed),
            items_completed: self.items_completed.load(Ordering::Relaxed),
            items_failed: self.items_failed.load(Ordering::Relaxed),
            items_cancelled: self.items_cancelled.load(Ordering::Relaxed),
            stages_executed: self.stages_executed.load(Ordering::Relaxed),
            stage_failures: self.stage_failures.load(Ordering::Relaxed),
            processes_spawned,
        }
    }
}

/// Point-in-time copy of the pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineMetrics {
    pub items_submitted: u64,
    /// Items resolved after running to the end, failed or not.
    pub items_completed: u64,
    /// Subset of `items_completed` carrying at least one failure.
    pub items_failed: u64,
    pub items_cancelled: u64,
    pub stages_executed: u64,
    pub stage_failures: u64,
    pub processes_spawned: u64,
}

impl PipelineMetrics {
    /// Submitted items not yet resolved.
    pub fn items_in_flight(&self) -> u64 {
        self.items_submitted
            .saturating_sub(self.items_completed + self.items_cancelled)
    }
}
