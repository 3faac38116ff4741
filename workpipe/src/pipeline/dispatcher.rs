//! The routing loop.
//!
//! One tokio task owns every tracked item. Callers and execution tasks talk to
//! it only through [`Command`] messages, so routing state is never shared and
//! never touched re-entrantly from a worker's completion path.

use super::handle::ItemReply;
use super::item::{FailureKind, ItemId, ItemMeta, Payload, WorkItem};
use super::metrics::PipelineMetricsStorage;
use super::pipeline::{PipelineShared, ShutdownReport};
use super::stage::{Stage, StageRun};
use crate::channel::{ChannelEndpoint, ChannelReader, create_reader_writer_pair};
use crate::executor::{SharedExecutorPool, SlotKind};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::oneshot;
use workpipe_shared::errors::WorkpipeResult;

pub(crate) enum Command<P> {
    Submit {
        item: WorkItem<P>,
        cancelled: Arc<AtomicBool>,
        reply: ItemReply<P>,
    },
    /// An execution task finished. `runs` are in stage order.
    StageDone {
        id: ItemId,
        payload: WorkpipeResult<P>,
        runs: Vec<StageRun>,
        next_stage: usize,
    },
    Shutdown {
        graceful: bool,
        reply: oneshot::Sender<ShutdownReport>,
    },
}

struct Tracked<P> {
    cancelled: Arc<AtomicBool>,
    reply: ItemReply<P>,
    /// Bookkeeping parked here while an execution task owns the payload.
    running: Option<ItemMeta>,
}

struct Waiting<P> {
    item: WorkItem<P>,
    cancelled: Arc<AtomicBool>,
    reply: ItemReply<P>,
}

pub(crate) struct Dispatcher<P: Payload> {
    stages: Arc<[Stage<P>]>,
    pool: SharedExecutorPool,
    shared: Arc<PipelineShared>,
    tx: WeakUnboundedSender<Command<P>>,
    rx: UnboundedReceiver<Command<P>>,
    tracked: HashMap<ItemId, Tracked<P>>,
    waiting: VecDeque<Waiting<P>>,
    max_in_flight: usize,
    drain_waiters: Vec<oneshot::Sender<ShutdownReport>>,
    forced: bool,
}

impl<P: Payload> Dispatcher<P> {
    pub(crate) fn new(
        stages: Arc<[Stage<P>]>,
        pool: SharedExecutorPool,
        shared: Arc<PipelineShared>,
        tx: &UnboundedSender<Command<P>>,
        rx: UnboundedReceiver<Command<P>>,
        max_in_flight: usize,
    ) -> Self {
        Self {
            stages,
            pool,
            shared,
            tx: tx.downgrade(),
            rx,
            tracked: HashMap::new(),
            waiting: VecDeque::new(),
            max_in_flight,
            drain_waiters: Vec::new(),
            forced: false,
        }
    }

    /// Runs until the pipeline and every execution task have dropped their
    /// senders.
    pub(crate) async fn run(mut self) {
        tracing::debug!(stages = self.stages.len(), "Dispatcher started");

        while let Some(command) = self.rx.recv().await {
            match command {
                Command::Submit {
                    item,
                    cancelled,
                    reply,
                } => self.on_submit(item, cancelled, reply),
                Command::StageDone {
                    id,
                    payload,
                    runs,
                    next_stage,
                } => self.on_stage_done(id, payload, runs, next_stage),
                Command::Shutdown { graceful, reply } => self.on_shutdown(graceful, reply),
            }
            self.admit_waiting();
            self.finish_drain_if_idle();
        }

        tracing::debug!("Dispatcher stopped");
    }

    fn on_submit(&mut self, item: WorkItem<P>, cancelled: Arc<AtomicBool>, reply: ItemReply<P>) {
        let waiting = Waiting {
            item,
            cancelled,
            reply,
        };
        if self.forced {
            self.resolve_cancelled(waiting);
        } else {
            self.waiting.push_back(waiting);
        }
    }

    fn admit_waiting(&mut self) {
        while self.tracked.len() < self.max_in_flight {
            let Some(waiting) = self.waiting.pop_front() else {
                break;
            };
            let id = waiting.item.id();
            tracing::debug!(item_id = id, in_flight = self.tracked.len() + 1, "Admitted item");
            self.tracked.insert(
                id,
                Tracked {
                    cancelled: waiting.cancelled,
                    reply: waiting.reply,
                    running: None,
                },
            );
            self.advance(waiting.item, 0);
        }
    }

    fn on_stage_done(
        &mut self,
        id: ItemId,
        payload: WorkpipeResult<P>,
        runs: Vec<StageRun>,
        next_stage: usize,
    ) {
        let Some(meta) = self.tracked.get_mut(&id).and_then(|t| t.running.take()) else {
            tracing::warn!(item_id = id, "Stage result for untracked item");
            return;
        };

        match payload {
            Ok(payload) => {
                let mut item = WorkItem::from_parts(payload, meta);
                for run in runs {
                    self.apply_run(&mut item, run);
                }
                self.advance(item, next_stage);
            }
            Err(e) => {
                tracing::error!(item_id = id, error = %e, "Stage lost the item payload");
                if let Some(tracked) = self.tracked.remove(&id) {
                    PipelineMetricsStorage::incr(&self.shared.metrics.items_completed);
                    PipelineMetricsStorage::incr(&self.shared.metrics.items_failed);
                    let _ = tracked.reply.send(Err(e));
                }
            }
        }
    }

    fn on_shutdown(&mut self, graceful: bool, reply: oneshot::Sender<ShutdownReport>) {
        self.shared.accepting.store(false, Ordering::SeqCst);

        if graceful && !self.forced {
            tracing::info!(
                in_flight = self.tracked.len(),
                queued = self.waiting.len(),
                "Graceful shutdown requested, draining"
            );
            self.drain_waiters.push(reply);
            return;
        }

        tracing::info!(
            in_flight = self.tracked.len(),
            queued = self.waiting.len(),
            "Forced shutdown requested"
        );
        self.forced = true;
        self.pool.close();
        for tracked in self.tracked.values() {
            tracked.cancelled.store(true, Ordering::SeqCst);
        }
        while let Some(waiting) = self.waiting.pop_front() {
            self.resolve_cancelled(waiting);
        }

        *self.shared.graceful.lock() = Some(false);
        let report = self.report(false);
        for waiter in self.drain_waiters.drain(..) {
            let _ = waiter.send(report);
        }
        let _ = reply.send(report);
    }

    fn finish_drain_if_idle(&mut self) {
        if self.drain_waiters.is_empty() || !self.tracked.is_empty() || !self.waiting.is_empty() {
            return;
        }
        let mut graceful = self.shared.graceful.lock();
        let was_graceful = *graceful.get_or_insert(true);
        drop(graceful);

        let report = self.report(was_graceful);
        tracing::info!(
            completed = report.completed,
            cancelled = report.cancelled,
            "Pipeline drained"
        );
        for waiter in self.drain_waiters.drain(..) {
            let _ = waiter.send(report);
        }
    }

    fn report(&self, graceful: bool) -> ShutdownReport {
        let metrics = self.shared.metrics.snapshot(self.pool.processes_spawned());
        ShutdownReport {
            graceful,
            completed: metrics.items_completed,
            cancelled: metrics.items_cancelled,
        }
    }

    /// Route `item` starting at stage `next` until it is handed to an
    /// execution task or completes.
    fn advance(&mut self, mut item: WorkItem<P>, mut next: usize) {
        let id = item.id();
        let stages = Arc::clone(&self.stages);

        loop {
            let cancelled = match self.tracked.get(&id) {
                Some(tracked) => Arc::clone(&tracked.cancelled),
                None => return,
            };
            if self.forced || cancelled.load(Ordering::SeqCst) {
                self.complete(item, true);
                return;
            }
            let Some(stage) = stages.get(next) else {
                self.complete(item, false);
                return;
            };

            if stage.is_pipe_with_next_stage() {
                let consumer = &stages[next + 1];
                let run_producer = self.claims(stage, next, &mut item);
                let run_consumer = self.claims(consumer, next + 1, &mut item);
                if !run_producer && !run_consumer {
                    tracing::debug!(item_id = id, stage_index = next, "Skipping piped pair");
                    next += 2;
                    continue;
                }
                item.submit_for_stage(if run_producer { next } else { next + 1 });
                tracing::debug!(
                    item_id = id,
                    producer = %stage.name(),
                    consumer = %consumer.name(),
                    run_producer,
                    run_consumer,
                    "Dispatching piped pair"
                );
                self.launch_pair(item, next, run_producer, run_consumer, cancelled);
                return;
            }

            if !self.claims(stage, next, &mut item) {
                next += 1;
                continue;
            }

            item.submit_for_stage(next);
            tracing::debug!(
                item_id = id,
                stage = %stage.name(),
                stage_index = next,
                mode = ?stage.mode(),
                "Dispatching stage"
            );

            if stage.mode().slot_kind().is_none() {
                let run = stage.run_inline(next, item.payload_mut(), cancelled);
                self.apply_run(&mut item, run);
                next += 1;
                continue;
            }

            self.launch_single(item, next, cancelled);
            return;
        }
    }

    /// Evaluate `stage`'s predicate. A panic is recorded on `item` and counts
    /// as "not for this stage".
    fn claims(&self, stage: &Stage<P>, index: usize, item: &mut WorkItem<P>) -> bool {
        match stage.check_predicate(index, item) {
            Ok(claimed) => claimed,
            Err(failure) => {
                PipelineMetricsStorage::incr(&self.shared.metrics.stage_failures);
                item.record_stage_outcome(index, Some(failure));
                false
            }
        }
    }

    fn apply_run(&self, item: &mut WorkItem<P>, run: StageRun) {
        let (record, failure) = run.into_parts();
        PipelineMetricsStorage::incr(&self.shared.metrics.stages_executed);
        if failure.is_some() {
            PipelineMetricsStorage::incr(&self.shared.metrics.stage_failures);
        }
        item.record_stage_outcome(record.index, failure);
        if !item.push_record(record) {
            PipelineMetricsStorage::incr(&self.shared.metrics.stage_failures);
        }
    }

    fn complete(&mut self, mut item: WorkItem<P>, cancelled: bool) {
        let Some(tracked) = self.tracked.remove(&item.id()) else {
            return;
        };
        let metrics = &self.shared.metrics;
        if cancelled {
            item.mark_cancelled();
            PipelineMetricsStorage::incr(&metrics.items_cancelled);
            tracing::warn!(item_id = item.id(), "Work item cancelled");
        } else {
            PipelineMetricsStorage::incr(&metrics.items_completed);
            if item.is_failed() {
                PipelineMetricsStorage::incr(&metrics.items_failed);
            }
            tracing::debug!(
                item_id = item.id(),
                failed = item.is_failed(),
                stages = item.records().len(),
                "Work item completed"
            );
        }
        let _ = tracked.reply.send(Ok(item));
    }

    fn resolve_cancelled(&self, waiting: Waiting<P>) {
        let mut item = waiting.item;
        item.mark_cancelled();
        PipelineMetricsStorage::incr(&self.shared.metrics.items_cancelled);
        tracing::warn!(item_id = item.id(), "Queued work item cancelled");
        let _ = waiting.reply.send(Ok(item));
    }

    /// Park the item's bookkeeping and return its payload plus a sender for
    /// the execution task. `None` when the pipeline is already gone.
    fn hand_off(&mut self, item: WorkItem<P>) -> Option<(P, UnboundedSender<Command<P>>)> {
        let Some(tx) = self.tx.upgrade() else {
            self.complete(item, true);
            return None;
        };
        let id = item.id();
        let (payload, meta) = item.into_parts();
        if let Some(tracked) = self.tracked.get_mut(&id) {
            tracked.running = Some(meta);
        }
        Some((payload, tx))
    }

    fn launch_single(&mut self, item: WorkItem<P>, index: usize, cancelled: Arc<AtomicBool>) {
        let id = item.id();
        let Some((payload, tx)) = self.hand_off(item) else {
            return;
        };
        let stages = Arc::clone(&self.stages);
        let pool = Arc::clone(&self.pool);

        tokio::spawn(async move {
            let stage = &stages[index];
            let (payload, runs) = match stage
                .perform_stage_work(index, payload, None, &pool, None, cancelled)
                .await
            {
                Ok((payload, run)) => (Ok(payload), vec![run]),
                Err(e) => (Err(e), Vec::new()),
            };
            let _ = tx.send(Command::StageDone {
                id,
                payload,
                runs,
                next_stage: index + 1,
            });
        });
    }

    fn launch_pair(
        &mut self,
        item: WorkItem<P>,
        index: usize,
        run_producer: bool,
        run_consumer: bool,
        cancelled: Arc<AtomicBool>,
    ) {
        let id = item.id();
        let Some((payload, tx)) = self.hand_off(item) else {
            return;
        };
        let stages = Arc::clone(&self.stages);
        let pool = Arc::clone(&self.pool);

        tokio::spawn(async move {
            let (payload, runs) = match (run_producer, run_consumer) {
                (true, true) => run_both(&stages, index, payload, &pool, cancelled).await,
                (true, false) => run_producer_only(&stages, index, payload, &pool, cancelled).await,
                _ => run_consumer_only(&stages, index + 1, payload, &pool, cancelled).await,
            };
            let _ = tx.send(Command::StageDone {
                id,
                payload,
                runs,
                next_stage: index + 2,
            });
        });
    }
}

type PairOutcome<P> = (WorkpipeResult<P>, Vec<StageRun>);

/// Producer and consumer run concurrently. The producer works on a copy of
/// the payload; the consumer's payload is the one that continues.
async fn run_both<P: Payload>(
    stages: &[Stage<P>],
    index: usize,
    payload: P,
    pool: &SharedExecutorPool,
    cancelled: Arc<AtomicBool>,
) -> PairOutcome<P> {
    let (producer, consumer) = (&stages[index], &stages[index + 1]);

    let (reader, writer) = match create_reader_writer_pair() {
        Ok(pair) => pair,
        Err(e) => {
            let message = e.to_string();
            let runs = vec![
                producer.failed_run(index, FailureKind::Channel, message.clone()),
                consumer.failed_run(index + 1, FailureKind::Channel, message),
            ];
            return (Ok(payload), runs);
        }
    };

    let kinds: Vec<SlotKind> = [producer.mode(), consumer.mode()]
        .iter()
        .filter_map(|mode| mode.slot_kind())
        .collect();
    let mut slots = match pool.acquire_slots(&kinds).await {
        Ok(slots) => slots,
        Err(e) => {
            let message = e.to_string();
            let runs = vec![
                producer.failed_run(index, FailureKind::Slot, message.clone()),
                consumer.failed_run(index + 1, FailureKind::Slot, message),
            ];
            return (Ok(payload), runs);
        }
    };
    let consumer_slot = slots.pop();
    let producer_slot = slots.pop();

    let producer_run = producer.perform_stage_work(
        index,
        payload.clone(),
        Some(ChannelEndpoint::Writer(writer)),
        pool,
        producer_slot,
        Arc::clone(&cancelled),
    );
    let consumer_run = consumer.perform_stage_work(
        index + 1,
        payload,
        Some(ChannelEndpoint::Reader(reader)),
        pool,
        consumer_slot,
        cancelled,
    );
    let (produced, consumed) = futures::join!(producer_run, consumer_run);

    let mut runs = Vec::with_capacity(2);
    match produced {
        Ok((_, run)) => runs.push(run),
        Err(e) => runs.push(producer.failed_run(index, FailureKind::Worker, e.to_string())),
    }
    match consumed {
        Ok((payload, run)) => {
            runs.push(run);
            (Ok(payload), runs)
        }
        Err(e) => (Err(e), runs),
    }
}

/// The consumer declined the item: run the producer and throw its bytes away.
async fn run_producer_only<P: Payload>(
    stages: &[Stage<P>],
    index: usize,
    payload: P,
    pool: &SharedExecutorPool,
    cancelled: Arc<AtomicBool>,
) -> PairOutcome<P> {
    let producer = &stages[index];
    let (reader, writer) = match create_reader_writer_pair() {
        Ok(pair) => pair,
        Err(e) => {
            let run = producer.failed_run(index, FailureKind::Channel, e.to_string());
            return (Ok(payload), vec![run]);
        }
    };

    let drain = tokio::task::spawn_blocking(move || discard(reader));
    let run = match producer
        .perform_stage_work(
            index,
            payload.clone(),
            Some(ChannelEndpoint::Writer(writer)),
            pool,
            None,
            cancelled,
        )
        .await
    {
        Ok((_, run)) => run,
        Err(e) => producer.failed_run(index, FailureKind::Worker, e.to_string()),
    };

    match drain.await {
        Ok(Ok(discarded)) => {
            tracing::debug!(stage = %producer.name(), discarded, "Drained unconsumed output");
        }
        Ok(Err(e)) => {
            tracing::debug!(stage = %producer.name(), error = %e, "Drain ended early");
        }
        Err(e) => {
            tracing::warn!(stage = %producer.name(), error = %e, "Drain task failed");
        }
    }

    (Ok(payload), vec![run])
}

/// The producer declined the item: the consumer reads an empty stream.
async fn run_consumer_only<P: Payload>(
    stages: &[Stage<P>],
    index: usize,
    payload: P,
    pool: &SharedExecutorPool,
    cancelled: Arc<AtomicBool>,
) -> PairOutcome<P> {
    let consumer = &stages[index];
    let reader = match create_reader_writer_pair().and_then(|(reader, mut writer)| {
        writer.write_eof(&[])?;
        Ok(reader)
    }) {
        Ok(reader) => reader,
        Err(e) => {
            let run = consumer.failed_run(index, FailureKind::Channel, e.to_string());
            return (Ok(payload), vec![run]);
        }
    };

    match consumer
        .perform_stage_work(
            index,
            payload,
            Some(ChannelEndpoint::Reader(reader)),
            pool,
            None,
            cancelled,
        )
        .await
    {
        Ok((payload, run)) => (Ok(payload), vec![run]),
        Err(e) => (Err(e), Vec::new()),
    }
}

fn discard(mut reader: ChannelReader) -> WorkpipeResult<u64> {
    loop {
        if reader.read()?.is_empty() {
            return Ok(reader.bytes_read());
        }
    }
}
