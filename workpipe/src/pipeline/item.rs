//! Work item envelope: payload plus per-stage bookkeeping.

use super::stage::{ExecutionMode, panic_message};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bounds every payload must satisfy.
///
/// `Serialize + DeserializeOwned` lets the payload cross into worker
/// processes; `Clone` is used to hand a producer stage a snapshot while the
/// consumer of a piped pair owns the original.
pub trait Payload: Clone + Send + Serialize + DeserializeOwned + 'static {}

impl<T> Payload for T where T: Clone + Send + Serialize + DeserializeOwned + 'static {}

/// Process-unique work item id.
pub type ItemId = u64;

static NEXT_ITEM_ID: AtomicU64 = AtomicU64::new(1);

/// Callback invoked by the dispatcher after each stage outcome is recorded.
pub type StageHook = Arc<dyn Fn(&StageRecord) + Send + Sync>;

/// Why a stage failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The worker returned an error.
    Worker,
    /// The worker panicked.
    Panic,
    /// The worker process could not be started.
    Spawn,
    /// The payload could not cross the process boundary.
    Serialization,
    /// No execution slot could be acquired.
    Slot,
    /// The stage's byte channel could not be set up.
    Channel,
}

/// A failure captured on a work item, tagged with the stage that raised it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage_index: usize,
    pub stage_name: String,
    pub kind: FailureKind,
    pub message: String,
}

impl std::fmt::Display for StageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "stage {} ({}) failed [{:?}]: {}",
            self.stage_index, self.stage_name, self.kind, self.message
        )
    }
}

/// One executed stage, in execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub index: usize,
    pub name: String,
    pub mode: ExecutionMode,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u128,
    /// Value the worker recorded through `StageContext::set_output`.
    pub output: Option<serde_json::Value>,
    pub failed: bool,
}

/// Everything on a work item except the payload.
///
/// Split out so the payload can travel to a worker by value while the
/// bookkeeping stays with the dispatcher.
pub(crate) struct ItemMeta {
    id: ItemId,
    failed: bool,
    failures: Vec<StageFailure>,
    records: Vec<StageRecord>,
    current_stage: Option<usize>,
    cancelled: bool,
    stage_hook: Option<StageHook>,
}

/// Unit of work routed through a pipeline.
///
/// The caller owns the item until `submit`; the pipeline owns it until the
/// returned handle resolves, at which point the same item (same [`ItemId`])
/// comes back with its stage records and failures filled in.
pub struct WorkItem<P> {
    payload: P,
    meta: ItemMeta,
}

impl<P> WorkItem<P> {
    pub fn new(payload: P) -> Self {
        Self {
            payload,
            meta: ItemMeta {
                id: NEXT_ITEM_ID.fetch_add(1, Ordering::Relaxed),
                failed: false,
                failures: Vec::new(),
                records: Vec::new(),
                current_stage: None,
                cancelled: false,
                stage_hook: None,
            },
        }
    }

    /// Attach a callback run after every stage this item passes through.
    pub fn with_stage_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&StageRecord) + Send + Sync + 'static,
    {
        self.meta.stage_hook = Some(Arc::new(hook));
        self
    }

    pub fn id(&self) -> ItemId {
        self.meta.id
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut P {
        &mut self.payload
    }

    pub fn into_payload(self) -> P {
        self.payload
    }

    /// True once any stage has failed. Never reset.
    pub fn is_failed(&self) -> bool {
        self.meta.failed
    }

    pub fn failures(&self) -> &[StageFailure] {
        &self.meta.failures
    }

    pub fn records(&self) -> &[StageRecord] {
        &self.meta.records
    }

    /// Indices of the stages that ran, in order.
    pub fn executed_stages(&self) -> Vec<usize> {
        self.meta.records.iter().map(|r| r.index).collect()
    }

    /// Output recorded by the given stage, if it ran and set one.
    pub fn stage_output(&self, stage_index: usize) -> Option<&serde_json::Value> {
        self.meta
            .records
            .iter()
            .rev()
            .find(|r| r.index == stage_index)
            .and_then(|r| r.output.as_ref())
    }

    /// Stage most recently dispatched, if any.
    pub fn current_stage(&self) -> Option<usize> {
        self.meta.current_stage
    }

    pub fn is_cancelled(&self) -> bool {
        self.meta.cancelled
    }

    /// Mark the stage about to process this item.
    pub fn submit_for_stage(&mut self, stage_index: usize) {
        self.meta.current_stage = Some(stage_index);
    }

    /// Record the result of a stage. A failure sets `is_failed` permanently.
    pub fn record_stage_outcome(&mut self, stage_index: usize, failure: Option<StageFailure>) {
        if let Some(mut failure) = failure {
            failure.stage_index = stage_index;
            self.meta.failures.push(failure);
            self.meta.failed = true;
        }
    }

    /// Append `record` and run the stage hook on it. A panicking hook is
    /// recorded as a `Panic` failure of that stage; returns false then.
    pub(crate) fn push_record(&mut self, record: StageRecord) -> bool {
        let hook_failure = self.meta.stage_hook.as_ref().and_then(|hook| {
            catch_unwind(AssertUnwindSafe(|| hook(&record)))
                .err()
                .map(|panic| format!("stage hook panicked: {}", panic_message(panic.as_ref())))
        });

        let ok = match hook_failure {
            Some(message) => {
                tracing::warn!(
                    item_id = self.meta.id,
                    stage_index = record.index,
                    error = %message,
                    "Stage hook failed"
                );
                let failure = StageFailure {
                    stage_index: record.index,
                    stage_name: record.name.clone(),
                    kind: FailureKind::Panic,
                    message,
                };
                self.record_stage_outcome(record.index, Some(failure));
                false
            }
            None => true,
        };
        self.meta.records.push(record);
        ok
    }

    pub(crate) fn mark_cancelled(&mut self) {
        self.meta.cancelled = true;
    }

    pub(crate) fn into_parts(self) -> (P, ItemMeta) {
        (self.payload, self.meta)
    }

    pub(crate) fn from_parts(payload: P, meta: ItemMeta) -> Self {
        Self { payload, meta }
    }
}

impl<P: std::fmt::Debug> std::fmt::Debug for WorkItem<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("id", &self.meta.id)
            .field("payload", &self.payload)
            .field("failed", &self.meta.failed)
            .field("failures", &self.meta.failures)
            .field("executed_stages", &self.executed_stages())
            .field("cancelled", &self.meta.cancelled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn failure(kind: FailureKind) -> StageFailure {
        StageFailure {
            stage_index: 0,
            stage_name: "s".into(),
            kind,
            message: "boom".into(),
        }
    }

    fn record(index: usize, output: Option<serde_json::Value>) -> StageRecord {
        StageRecord {
            index,
            name: format!("stage{}", index),
            mode: ExecutionMode::Inline,
            started_at: Utc::now(),
            duration_ms: 0,
            output,
            failed: false,
        }
    }

    #[test]
    fn test_ids_are_unique() {
        let a = WorkItem::new(1u32);
        let b = WorkItem::new(1u32);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_failure_is_sticky() {
        let mut item = WorkItem::new(());
        item.record_stage_outcome(2, Some(failure(FailureKind::Worker)));
        assert!(item.is_failed());

        item.record_stage_outcome(3, None);
        assert!(item.is_failed());
        assert_eq!(item.failures().len(), 1);
        assert_eq!(item.failures()[0].stage_index, 2);
    }

    #[test]
    fn test_failures_keep_order() {
        let mut item = WorkItem::new(());
        item.record_stage_outcome(1, Some(failure(FailureKind::Worker)));
        item.record_stage_outcome(4, Some(failure(FailureKind::Panic)));
        let indices: Vec<_> = item.failures().iter().map(|f| f.stage_index).collect();
        assert_eq!(indices, vec![1, 4]);
    }

    #[test]
    fn test_stage_hook_sees_records() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut item = WorkItem::new(()).with_stage_hook(move |r| sink.lock().unwrap().push(r.index));

        item.push_record(record(0, None));
        item.push_record(record(2, Some(serde_json::json!(7))));

        assert_eq!(*seen.lock().unwrap(), vec![0, 2]);
        assert_eq!(item.executed_stages(), vec![0, 2]);
        assert_eq!(item.stage_output(2), Some(&serde_json::json!(7)));
        assert_eq!(item.stage_output(0), None);
    }

    #[test]
    fn test_panicking_hook_fails_only_that_stage() {
        let mut item = WorkItem::new(()).with_stage_hook(|r| {
            if r.index == 1 {
                panic!("hook cannot handle stage 1");
            }
        });

        assert!(item.push_record(record(0, None)));
        assert!(!item.is_failed());

        assert!(!item.push_record(record(1, None)));
        assert!(item.is_failed());
        assert_eq!(item.executed_stages(), vec![0, 1]);
        let failure = &item.failures()[0];
        assert_eq!((failure.stage_index, failure.kind), (1, FailureKind::Panic));
        assert_eq!(failure.stage_name, "stage1");
        assert!(failure.message.contains("hook cannot handle stage 1"));
    }

    #[test]
    fn test_parts_round_trip_keeps_identity() {
        let mut item = WorkItem::new(String::from("x"));
        item.submit_for_stage(5);
        let id = item.id();
        let (payload, meta) = item.into_parts();
        let item = WorkItem::from_parts(payload + "y", meta);
        assert_eq!(item.id(), id);
        assert_eq!(item.payload(), "xy");
        assert_eq!(item.current_stage(), Some(5));
    }
}
