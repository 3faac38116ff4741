//! Pipeline construction, submission and shutdown.

use super::dispatcher::{Command, Dispatcher};
use super::handle::WorkHandle;
use super::item::{Payload, WorkItem};
use super::metrics::{PipelineMetrics, PipelineMetricsStorage};
use super::stage::{ExecutionMode, Stage};
use crate::executor::{ExecutorPool, ProcessLauncher, SharedExecutorPool, SlotKind};
use crate::options::PipelineOptions;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::oneshot;
use workpipe_shared::errors::{WorkpipeError, WorkpipeResult};

/// State shared between the pipeline front-end and its dispatcher.
#[derive(Debug)]
pub(crate) struct PipelineShared {
    pub(crate) accepting: AtomicBool,
    pub(crate) graceful: Mutex<Option<bool>>,
    pub(crate) metrics: PipelineMetricsStorage,
}

/// Result of [`Pipeline::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// False if the pipeline was stopped before every item drained.
    pub graceful: bool,
    /// Items that ran to the end so far.
    pub completed: u64,
    /// Items resolved as cancelled so far.
    pub cancelled: u64,
}

/// Collects stages and options, then starts a [`Pipeline`].
pub struct PipelineBuilder<P: Payload> {
    options: PipelineOptions,
    stages: Vec<Stage<P>>,
}

impl<P: Payload> PipelineBuilder<P> {
    pub fn new(options: PipelineOptions) -> Self {
        Self {
            options,
            stages: Vec::new(),
        }
    }

    /// Append a stage. Stage order is the routing order.
    pub fn add_stage(mut self, stage: Stage<P>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Validate the stage list and start the dispatcher.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// `Config` when:
    /// * the options have a zero limit
    /// * the last stage pipes into nothing
    /// * a piped pair has an inline end, or a consumer pipes onward
    /// * a piped pair needs more slots of one kind than configured
    /// * a process stage exists but no worker program can be found
    /// * there is no current tokio runtime
    pub fn build(self) -> WorkpipeResult<Pipeline<P>> {
        self.options.sanitize()?;
        validate_stages(&self.stages, &self.options)?;

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            WorkpipeError::Config(format!("Pipeline must be built inside a tokio runtime: {}", e))
        })?;

        let launcher = if self.stages.iter().any(|s| s.is_subprocess()) {
            let program = self.options.resolve_worker_program()?;
            tracing::debug!(program = %program.display(), "Resolved worker program");
            Some(ProcessLauncher::new(program, self.options.forward_env.clone()))
        } else {
            None
        };
        let pool = ExecutorPool::new(&self.options, launcher)?;

        let shared = Arc::new(PipelineShared {
            accepting: AtomicBool::new(true),
            graceful: Mutex::new(None),
            metrics: PipelineMetricsStorage::new(),
        });
        let stages: Arc<[Stage<P>]> = self.stages.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(
            Arc::clone(&stages),
            Arc::clone(&pool),
            Arc::clone(&shared),
            &tx,
            rx,
            self.options.max_in_flight,
        );
        runtime.spawn(dispatcher.run());

        tracing::info!(
            stages = stages.len(),
            max_process_slots = self.options.max_process_slots,
            max_thread_slots = self.options.max_thread_slots,
            max_in_flight = self.options.max_in_flight,
            "Pipeline started"
        );

        Ok(Pipeline {
            stages,
            pool,
            shared,
            tx,
        })
    }
}

fn validate_stages<P: Payload>(stages: &[Stage<P>], options: &PipelineOptions) -> WorkpipeResult<()> {
    for (index, stage) in stages.iter().enumerate() {
        if !stage.is_pipe_with_next_stage() {
            continue;
        }
        let Some(consumer) = stages.get(index + 1) else {
            return Err(WorkpipeError::Config(format!(
                "stage {} ('{}') pipes into the next stage but is the last stage",
                index,
                stage.name()
            )));
        };
        if stage.mode() == ExecutionMode::Inline || consumer.mode() == ExecutionMode::Inline {
            return Err(WorkpipeError::Config(format!(
                "piped stages {} and {} must both run in a thread or process",
                index,
                index + 1
            )));
        }
        if consumer.is_pipe_with_next_stage() {
            return Err(WorkpipeError::Config(format!(
                "stage {} ('{}') consumes a pipe and cannot pipe onward",
                index + 1,
                consumer.name()
            )));
        }

        let kinds = [stage.mode().slot_kind(), consumer.mode().slot_kind()];
        for (kind, capacity) in [
            (SlotKind::Process, options.max_process_slots),
            (SlotKind::Thread, options.max_thread_slots),
        ] {
            let wanted = kinds.iter().filter(|k| **k == Some(kind)).count();
            if wanted > capacity {
                return Err(WorkpipeError::Config(format!(
                    "piped stages {} and {} need {} {:?} slots but only {} are configured",
                    index,
                    index + 1,
                    wanted,
                    kind,
                    capacity
                )));
            }
        }
    }
    Ok(())
}

/// A running pipeline.
///
/// Dropping it without [`Pipeline::shutdown`] stops it as a forced shutdown.
pub struct Pipeline<P: Payload> {
    stages: Arc<[Stage<P>]>,
    pool: SharedExecutorPool,
    shared: Arc<PipelineShared>,
    tx: UnboundedSender<Command<P>>,
}

impl<P: Payload> Pipeline<P> {
    pub fn builder(options: PipelineOptions) -> PipelineBuilder<P> {
        PipelineBuilder::new(options)
    }

    /// Hand `item` to the pipeline.
    ///
    /// Fails with `Shutdown` once shutdown has begun. Stage failures never
    /// surface here; they are recorded on the resolved item.
    pub fn submit(&self, item: WorkItem<P>) -> WorkpipeResult<WorkHandle<P>> {
        if !self.shared.accepting.load(Ordering::SeqCst) {
            return Err(WorkpipeError::Shutdown);
        }

        let id = item.id();
        let cancelled = Arc::new(AtomicBool::new(false));
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Submit {
                item,
                cancelled: Arc::clone(&cancelled),
                reply,
            })
            .map_err(|_| WorkpipeError::Shutdown)?;

        PipelineMetricsStorage::incr(&self.shared.metrics.items_submitted);
        tracing::trace!(item_id = id, "Submitted work item");
        Ok(WorkHandle::new(id, cancelled, rx))
    }

    /// Stop accepting work.
    ///
    /// Graceful: returns once every submitted item has resolved. Forced:
    /// queued items resolve as cancelled right away, running stages finish in
    /// the background and their items resolve as cancelled.
    pub async fn shutdown(&self, graceful: bool) -> WorkpipeResult<ShutdownReport> {
        self.shared.accepting.store(false, Ordering::SeqCst);
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Shutdown { graceful, reply })
            .map_err(|_| WorkpipeError::Shutdown)?;
        let report = rx.await.map_err(|_| WorkpipeError::Shutdown)?;
        tracing::info!(
            graceful = report.graceful,
            completed = report.completed,
            cancelled = report.cancelled,
            "Pipeline shut down"
        );
        Ok(report)
    }

    /// `None` until a shutdown finished, then whether it drained everything.
    pub fn was_graceful(&self) -> Option<bool> {
        *self.shared.graceful.lock()
    }

    pub fn metrics(&self) -> PipelineMetrics {
        self.shared.metrics.snapshot(self.pool.processes_spawned())
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn stage(&self, index: usize) -> Option<&Stage<P>> {
        self.stages.get(index)
    }

    /// Executor pool backing this pipeline (slot occupancy, peaks).
    pub fn pool(&self) -> &SharedExecutorPool {
        &self.pool
    }
}

impl<P: Payload> Drop for Pipeline<P> {
    fn drop(&mut self) {
        if self.shared.accepting.swap(false, Ordering::SeqCst) {
            let (reply, _) = oneshot::channel();
            let _ = self.tx.send(Command::Shutdown {
                graceful: false,
                reply,
            });
        }
    }
}

impl<P: Payload> std::fmt::Debug for Pipeline<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stages.len())
            .field("pool", &self.pool)
            .field("accepting", &self.shared.accepting.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> PipelineOptions {
        PipelineOptions::default().with_slots(2, 2)
    }

    fn noop_thread(name: &str) -> Stage<u32> {
        Stage::thread(name, |_| true, |_, _| Ok(()))
    }

    fn build_err(builder: PipelineBuilder<u32>) -> WorkpipeError {
        match builder.build() {
            Ok(_) => panic!("expected a configuration error"),
            Err(e) => e,
        }
    }

    #[tokio::test]
    async fn test_last_stage_cannot_pipe() {
        let builder = Pipeline::builder(options())
            .add_stage(noop_thread("a"))
            .add_stage(noop_thread("b").pipe_with_next());
        assert!(matches!(build_err(builder), WorkpipeError::Config(_)));
    }

    #[tokio::test]
    async fn test_inline_pipe_rejected() {
        let builder = Pipeline::builder(options())
            .add_stage(noop_thread("a").pipe_with_next())
            .add_stage(Stage::inline("b", |_| true, |_, _| Ok(())));
        assert!(matches!(build_err(builder), WorkpipeError::Config(_)));
    }

    #[tokio::test]
    async fn test_pipe_chain_rejected() {
        let builder = Pipeline::builder(options())
            .add_stage(noop_thread("a").pipe_with_next())
            .add_stage(noop_thread("b").pipe_with_next())
            .add_stage(noop_thread("c"));
        assert!(matches!(build_err(builder), WorkpipeError::Config(_)));
    }

    #[tokio::test]
    async fn test_pair_needs_enough_slots() {
        let builder = Pipeline::builder(PipelineOptions::default().with_slots(1, 1))
            .add_stage(noop_thread("a").pipe_with_next())
            .add_stage(noop_thread("b"));
        match build_err(builder) {
            WorkpipeError::Config(msg) => assert!(msg.contains("Thread")),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_zero_in_flight_rejected() {
        let builder = Pipeline::builder(options().with_max_in_flight(0)).add_stage(noop_thread("a"));
        assert!(matches!(build_err(builder), WorkpipeError::Config(_)));
    }

    #[test]
    fn test_build_outside_runtime_rejected() {
        let builder = Pipeline::builder(options()).add_stage(noop_thread("a"));
        assert!(matches!(build_err(builder), WorkpipeError::Config(_)));
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_refused() {
        let pipeline = Pipeline::builder(options())
            .add_stage(noop_thread("a"))
            .build()
            .unwrap();
        let report = pipeline.shutdown(true).await.unwrap();
        assert!(report.graceful);
        assert_eq!(pipeline.was_graceful(), Some(true));
        assert!(matches!(
            pipeline.submit(WorkItem::new(1)),
            Err(WorkpipeError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_empty_pipeline_returns_item_untouched() {
        let pipeline: Pipeline<u32> = Pipeline::builder(options()).build().unwrap();
        let item = WorkItem::new(9);
        let id = item.id();
        let done = pipeline.submit(item).unwrap().await.unwrap();
        assert_eq!(done.id(), id);
        assert_eq!(*done.payload(), 9);
        assert!(done.records().is_empty());
        assert_eq!(pipeline.was_graceful(), None);
    }
}
