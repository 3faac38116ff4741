//! Stage definition and per-mode execution.

use super::context::StageContext;
use super::item::{FailureKind, Payload, StageFailure, StageRecord, WorkItem};
use crate::channel::ChannelEndpoint;
use crate::executor::{SharedExecutorPool, SlotGuard, SlotKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;
use workpipe_shared::errors::{WorkpipeError, WorkpipeResult};
use workpipe_shared::wire::WorkerRequest;

/// Where a stage's worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// On the dispatcher task. Must be quick and non-blocking.
    Inline,
    /// On the executor pool's worker threads.
    Thread,
    /// In a `workpipe-shim` child process.
    Process,
}

impl ExecutionMode {
    /// Slot kind the mode occupies; inline stages need none.
    pub fn slot_kind(&self) -> Option<SlotKind> {
        match self {
            ExecutionMode::Inline => None,
            ExecutionMode::Thread => Some(SlotKind::Thread),
            ExecutionMode::Process => Some(SlotKind::Process),
        }
    }
}

/// Eligibility test evaluated by the dispatcher. Must be pure and non-blocking.
pub type Predicate<P> = Arc<dyn Fn(&WorkItem<P>) -> bool + Send + Sync>;

/// Closure worker for inline and thread stages.
pub type WorkerFn<P> =
    Arc<dyn Fn(&mut P, &mut StageContext) -> anyhow::Result<()> + Send + Sync>;

/// The closed set of execution strategies.
pub enum StageWork<P> {
    Inline(WorkerFn<P>),
    Thread(WorkerFn<P>),
    /// Registered worker name run by the shim.
    Process { worker: String },
}

/// One processing step: a predicate, a worker and how to schedule it.
///
/// Immutable once handed to a [`super::PipelineBuilder`].
pub struct Stage<P> {
    name: String,
    predicate: Predicate<P>,
    work: StageWork<P>,
    args: serde_json::Value,
    pipe_with_next: bool,
}

impl<P: Payload> std::fmt::Debug for Stage<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("mode", &self.mode())
            .field("pipe_with_next", &self.pipe_with_next)
            .finish()
    }
}

impl<P: Payload> Stage<P> {
    /// Stage whose worker runs on the dispatcher itself.
    pub fn inline<F, W>(name: impl Into<String>, predicate: F, worker: W) -> Self
    where
        F: Fn(&WorkItem<P>) -> bool + Send + Sync + 'static,
        W: Fn(&mut P, &mut StageContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::with_work(name, predicate, StageWork::Inline(Arc::new(worker)))
    }

    /// Stage whose worker runs on a pool thread.
    pub fn thread<F, W>(name: impl Into<String>, predicate: F, worker: W) -> Self
    where
        F: Fn(&WorkItem<P>) -> bool + Send + Sync + 'static,
        W: Fn(&mut P, &mut StageContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::with_work(name, predicate, StageWork::Thread(Arc::new(worker)))
    }

    /// Stage run by the registered shim worker `worker`.
    pub fn process<F>(name: impl Into<String>, predicate: F, worker: impl Into<String>) -> Self
    where
        F: Fn(&WorkItem<P>) -> bool + Send + Sync + 'static,
    {
        Self::with_work(
            name,
            predicate,
            StageWork::Process {
                worker: worker.into(),
            },
        )
    }

    fn with_work<F>(name: impl Into<String>, predicate: F, work: StageWork<P>) -> Self
    where
        F: Fn(&WorkItem<P>) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
            work,
            args: serde_json::Value::Null,
            pipe_with_next: false,
        }
    }

    /// Static arguments exposed to the worker through `StageContext::args`.
    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }

    /// Run concurrently with the next stage, streaming bytes into it.
    pub fn pipe_with_next(mut self) -> Self {
        self.pipe_with_next = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &serde_json::Value {
        &self.args
    }

    pub fn mode(&self) -> ExecutionMode {
        match self.work {
            StageWork::Inline(_) => ExecutionMode::Inline,
            StageWork::Thread(_) => ExecutionMode::Thread,
            StageWork::Process { .. } => ExecutionMode::Process,
        }
    }

    pub fn is_for_stage(&self, item: &WorkItem<P>) -> bool {
        (self.predicate)(item)
    }

    /// [`Stage::is_for_stage`] for the dispatcher: a panicking predicate
    /// becomes a `Panic` failure for this item instead of unwinding the
    /// routing loop.
    pub(crate) fn check_predicate(
        &self,
        index: usize,
        item: &WorkItem<P>,
    ) -> Result<bool, StageFailure> {
        catch_unwind(AssertUnwindSafe(|| self.is_for_stage(item))).map_err(|panic| {
            let message = format!("predicate panicked: {}", panic_message(panic.as_ref()));
            tracing::warn!(
                stage = %self.name,
                stage_index = index,
                item_id = item.id(),
                error = %message,
                "Stage predicate failed"
            );
            StageFailure {
                stage_index: index,
                stage_name: self.name.clone(),
                kind: FailureKind::Panic,
                message,
            }
        })
    }

    pub fn is_subprocess(&self) -> bool {
        self.mode() == ExecutionMode::Process
    }

    pub fn is_pipe_with_next_stage(&self) -> bool {
        self.pipe_with_next
    }

    /// Execute this stage on `payload`.
    ///
    /// Worker errors, panics, spawn and serialization problems are reported
    /// in the returned [`StageRun`], never as `Err`. `Err` means the payload
    /// itself was lost (the thread pool dropped the job).
    ///
    /// `slot` lets a caller pass a pre-acquired slot (piped pairs acquire
    /// both at once); otherwise one is acquired here.
    pub(crate) async fn perform_stage_work(
        &self,
        index: usize,
        payload: P,
        endpoint: Option<ChannelEndpoint>,
        pool: &SharedExecutorPool,
        slot: Option<SlotGuard>,
        cancelled: Arc<AtomicBool>,
    ) -> WorkpipeResult<(P, StageRun)> {
        let started_at = Utc::now();
        let start = Instant::now();
        let ctx = StageContext::new(index, self.name.clone(), self.args.clone())
            .with_endpoint(endpoint)
            .with_cancel_flag(cancelled);

        let (payload, result, output) = match &self.work {
            StageWork::Inline(worker) => {
                let mut payload = payload;
                let mut ctx = ctx;
                let result = run_closure(worker, &mut payload, &mut ctx);
                (payload, result, ctx.take_output())
            }
            StageWork::Thread(worker) => {
                match acquire(pool, slot, SlotKind::Thread).await {
                    Ok(_slot) => {
                        let worker = Arc::clone(worker);
                        // The context (and its channel endpoint) drops on the
                        // worker thread as soon as the closure returns.
                        pool.run_on_thread(move || {
                            let mut payload = payload;
                            let mut ctx = ctx;
                            let result = run_closure(&worker, &mut payload, &mut ctx);
                            let output = ctx.take_output();
                            (payload, result, output)
                        })
                        .await?
                    }
                    Err(failure) => (payload, Err(failure), None),
                }
            }
            StageWork::Process { worker } => {
                match acquire(pool, slot, SlotKind::Process).await {
                    Ok(_slot) => self.run_in_process(index, worker, payload, ctx, pool).await,
                    Err(failure) => (payload, Err(failure), None),
                }
            }
        };

        Ok((payload, self.finish(index, started_at, start, result, output)))
    }

    /// Run an inline stage to completion on the caller's thread.
    ///
    /// Thread and process stages are rejected with a `Worker` failure; they
    /// have to go through [`Stage::perform_stage_work`].
    pub(crate) fn run_inline(
        &self,
        index: usize,
        payload: &mut P,
        cancelled: Arc<AtomicBool>,
    ) -> StageRun {
        let started_at = Utc::now();
        let start = Instant::now();
        let mut ctx = StageContext::new(index, self.name.clone(), self.args.clone())
            .with_cancel_flag(cancelled);

        let result = match &self.work {
            StageWork::Inline(worker) => run_closure(worker, payload, &mut ctx),
            _ => Err((
                FailureKind::Worker,
                format!("stage '{}' is not an inline stage", self.name),
            )),
        };
        let output = ctx.take_output();
        self.finish(index, started_at, start, result, output)
    }

    /// A run that never reached the worker, e.g. because its channel could
    /// not be created.
    pub(crate) fn failed_run(&self, index: usize, kind: FailureKind, message: String) -> StageRun {
        self.finish(index, Utc::now(), Instant::now(), Err((kind, message)), None)
    }

    fn finish(
        &self,
        index: usize,
        started_at: DateTime<Utc>,
        start: Instant,
        result: Result<(), Failure>,
        output: Option<serde_json::Value>,
    ) -> StageRun {
        if let Err((kind, message)) = &result {
            tracing::warn!(
                stage = %self.name,
                stage_index = index,
                kind = ?kind,
                error = %message,
                "Stage failed"
            );
        }

        StageRun {
            index,
            name: self.name.clone(),
            mode: self.mode(),
            started_at,
            duration_ms: start.elapsed().as_millis(),
            output,
            failure: result.err(),
        }
    }
}

impl<P: Payload> Stage<P> {
    async fn run_in_process(
        &self,
        index: usize,
        worker: &str,
        payload: P,
        mut ctx: StageContext,
        pool: &SharedExecutorPool,
    ) -> (P, Result<(), Failure>, Option<serde_json::Value>) {
        let endpoint = ctx.take_endpoint();

        let value = match serde_json::to_value(&payload) {
            Ok(value) => value,
            Err(e) => {
                let message = format!("Failed to encode payload: {}", e);
                return (payload, Err((FailureKind::Serialization, message)), None);
            }
        };

        let launcher = match pool.launcher() {
            Ok(launcher) => launcher,
            Err(e) => return (payload, Err((FailureKind::Spawn, e.to_string())), None),
        };

        let request = WorkerRequest {
            worker: worker.to_string(),
            stage_index: index,
            stage_name: self.name.clone(),
            args: self.args.clone(),
            payload: value,
        };

        match launcher.run(&request, endpoint).await {
            Ok(response) => {
                let mut failure = response.error.map(|message| (FailureKind::Worker, message));
                // A failed worker still hands back its payload; keep whatever
                // state it reached, like closure workers do.
                let payload = match serde_json::from_value::<P>(response.payload) {
                    Ok(returned) => returned,
                    Err(e) => {
                        failure.get_or_insert((
                            FailureKind::Serialization,
                            format!("Failed to decode worker payload: {}", e),
                        ));
                        payload
                    }
                };
                (payload, failure.map_or(Ok(()), Err), response.output)
            }
            Err(e) => (payload, Err((failure_kind_for(&e), e.to_string())), None),
        }
    }
}

async fn acquire(
    pool: &SharedExecutorPool,
    slot: Option<SlotGuard>,
    kind: SlotKind,
) -> Result<SlotGuard, Failure> {
    match slot {
        Some(slot) => Ok(slot),
        None => pool
            .acquire_slot(kind)
            .await
            .map_err(|e| (FailureKind::Slot, e.to_string())),
    }
}

/// Outcome of one stage invocation, turned into a [`StageRecord`] and
/// optional [`StageFailure`] by the dispatcher.
#[derive(Debug, Clone)]
pub(crate) struct StageRun {
    pub index: usize,
    pub name: String,
    pub mode: ExecutionMode,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u128,
    pub output: Option<serde_json::Value>,
    pub failure: Option<(FailureKind, String)>,
}

impl StageRun {
    pub(crate) fn into_parts(self) -> (StageRecord, Option<StageFailure>) {
        let failure = self.failure.map(|(kind, message)| StageFailure {
            stage_index: self.index,
            stage_name: self.name.clone(),
            kind,
            message,
        });
        let record = StageRecord {
            index: self.index,
            name: self.name,
            mode: self.mode,
            started_at: self.started_at,
            duration_ms: self.duration_ms,
            output: self.output,
            failed: failure.is_some(),
        };
        (record, failure)
    }
}

type Failure = (FailureKind, String);

fn run_closure<P>(worker: &WorkerFn<P>, payload: &mut P, ctx: &mut StageContext) -> Result<(), Failure> {
    match catch_unwind(AssertUnwindSafe(|| worker(payload, ctx))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err((FailureKind::Worker, format!("{:#}", e))),
        Err(panic) => Err((FailureKind::Panic, panic_message(panic.as_ref()))),
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

fn failure_kind_for(err: &WorkpipeError) -> FailureKind {
    match err {
        WorkpipeError::Spawn(_) | WorkpipeError::Config(_) => FailureKind::Spawn,
        WorkpipeError::Serialization(_) => FailureKind::Serialization,
        WorkpipeError::Channel(_) | WorkpipeError::AlreadyAtEof => FailureKind::Channel,
        WorkpipeError::Shutdown => FailureKind::Slot,
        _ => FailureKind::Worker,
    }
}
