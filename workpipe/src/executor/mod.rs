//! Executor pool: bounded process and thread slots.
//!
//! ## Architecture
//!
//! ```text
//! ExecutorPool
//!   ├── SlotArena (parking_lot::Mutex)   occupancy per SlotKind, generation handles
//!   ├── Notify                           wakes waiters when a slot frees up
//!   ├── rayon::ThreadPool                runs thread-mode stages (one thread per slot)
//!   └── ProcessLauncher (optional)       spawns workpipe-shim for process-mode stages
//! ```
//!
//! Slots are held through [`SlotGuard`], which releases on drop. A worker that
//! fails or panics therefore always gives its slot back.

mod process;
mod slots;

pub use process::ProcessLauncher;
pub use slots::{SlotHandle, SlotKind};

use crate::options::PipelineOptions;
use parking_lot::Mutex;
use slots::SlotArena;
use std::sync::Arc;
use tokio::sync::{Notify, oneshot};
use workpipe_shared::errors::{WorkpipeError, WorkpipeResult};

pub type SharedExecutorPool = Arc<ExecutorPool>;

pub struct ExecutorPool {
    arena: Mutex<SlotArena>,
    slot_freed: Notify,
    threads: rayon::ThreadPool,
    launcher: Option<ProcessLauncher>,
}

impl std::fmt::Debug for ExecutorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let arena = self.arena.lock();
        f.debug_struct("ExecutorPool")
            .field("process_slots", &arena.capacity(SlotKind::Process))
            .field("thread_slots", &arena.capacity(SlotKind::Thread))
            .field("closed", &arena.closed)
            .finish()
    }
}

impl ExecutorPool {
    /// Create a pool sized from `options`.
    ///
    /// `launcher` is only needed when the pipeline has process-mode stages.
    pub fn new(
        options: &PipelineOptions,
        launcher: Option<ProcessLauncher>,
    ) -> WorkpipeResult<SharedExecutorPool> {
        let threads = rayon::ThreadPoolBuilder::new()
            .num_threads(options.max_thread_slots)
            .thread_name(|i| format!("workpipe-worker-{}", i))
            .build()
            .map_err(|e| WorkpipeError::Internal(format!("Failed to build thread pool: {}", e)))?;

        Ok(Arc::new(Self {
            arena: Mutex::new(SlotArena::new(
                options.max_process_slots,
                options.max_thread_slots,
            )),
            slot_freed: Notify::new(),
            threads,
            launcher,
        }))
    }

    /// Acquire one slot of `kind`, waiting until one is free.
    pub async fn acquire_slot(self: &Arc<Self>, kind: SlotKind) -> WorkpipeResult<SlotGuard> {
        let mut guards = self.acquire_slots(&[kind]).await?;
        guards
            .pop()
            .ok_or_else(|| WorkpipeError::Internal("slot acquisition returned nothing".into()))
    }

    /// Acquire one slot per entry of `kinds`, all at once.
    ///
    /// Never holds a partial set while waiting, so two piped stages cannot
    /// deadlock against each other or against another pair.
    ///
    /// # Errors
    ///
    /// * `Config` - more slots of a kind than the pool has
    /// * `Shutdown` - the pool was closed before or while waiting
    pub async fn acquire_slots(
        self: &Arc<Self>,
        kinds: &[SlotKind],
    ) -> WorkpipeResult<Vec<SlotGuard>> {
        self.check_satisfiable(kinds)?;

        loop {
            let notified = self.slot_freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut arena = self.arena.lock();
                if arena.closed {
                    return Err(WorkpipeError::Shutdown);
                }
                if let Some(handles) = arena.try_acquire_all(kinds) {
                    for handle in &handles {
                        tracing::trace!(
                            kind = ?handle.kind(),
                            slot = handle.index(),
                            generation = handle.generation(),
                            "Acquired slot"
                        );
                    }
                    return Ok(handles
                        .into_iter()
                        .map(|handle| SlotGuard::new(Arc::clone(self), handle))
                        .collect());
                }
            }

            notified.await;
        }
    }

    /// Acquire a slot without waiting.
    pub fn try_acquire(self: &Arc<Self>, kind: SlotKind) -> Option<SlotGuard> {
        let mut arena = self.arena.lock();
        if arena.closed {
            return None;
        }
        arena
            .try_acquire(kind)
            .map(|handle| SlotGuard::new(Arc::clone(self), handle))
    }

    /// Return a slot to the pool and wake waiters.
    ///
    /// Returns `false` (and changes nothing) for a stale or unknown handle.
    pub fn release_slot(&self, handle: SlotHandle) -> bool {
        let released = self.arena.lock().release(handle);
        if released {
            tracing::trace!(kind = ?handle.kind(), slot = handle.index(), "Released slot");
            self.slot_freed.notify_waiters();
        } else {
            tracing::warn!(
                kind = ?handle.kind(),
                slot = handle.index(),
                generation = handle.generation(),
                "Ignoring release of stale slot handle"
            );
        }
        released
    }

    pub fn occupied(&self, kind: SlotKind) -> usize {
        self.arena.lock().occupied(kind)
    }

    pub fn capacity(&self, kind: SlotKind) -> usize {
        self.arena.lock().capacity(kind)
    }

    /// Highest number of simultaneously occupied slots of `kind` seen so far.
    pub fn peak_occupied(&self, kind: SlotKind) -> usize {
        self.arena.lock().peak(kind)
    }

    /// Refuse further acquisitions. Waiters are woken and fail with `Shutdown`.
    /// Slots already held stay valid until their guards drop.
    pub fn close(&self) {
        self.arena.lock().closed = true;
        self.slot_freed.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.arena.lock().closed
    }

    pub fn launcher(&self) -> WorkpipeResult<&ProcessLauncher> {
        self.launcher
            .as_ref()
            .ok_or_else(|| WorkpipeError::Config("no worker program configured".into()))
    }

    pub fn processes_spawned(&self) -> u64 {
        self.launcher.as_ref().map_or(0, |l| l.spawned())
    }

    /// Run a blocking closure on the pool's worker threads.
    ///
    /// The caller is expected to hold a thread slot, which keeps the number of
    /// queued closures within the number of pool threads.
    pub async fn run_on_thread<F, R>(&self, f: F) -> WorkpipeResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.threads.spawn(move || {
            let _ = tx.send(f());
        });
        rx.await
            .map_err(|_| WorkpipeError::Internal("thread worker dropped its result".into()))
    }

    fn check_satisfiable(&self, kinds: &[SlotKind]) -> WorkpipeResult<()> {
        let arena = self.arena.lock();
        for kind in [SlotKind::Process, SlotKind::Thread] {
            let wanted = kinds.iter().filter(|k| **k == kind).count();
            if wanted > arena.capacity(kind) {
                return Err(WorkpipeError::Config(format!(
                    "{} {:?} slots requested but pool only has {}",
                    wanted,
                    kind,
                    arena.capacity(kind)
                )));
            }
        }
        Ok(())
    }
}

/// RAII owner of an occupied slot.
#[derive(Debug)]
pub struct SlotGuard {
    pool: SharedExecutorPool,
    handle: Option<SlotHandle>,
}

impl SlotGuard {
    fn new(pool: SharedExecutorPool, handle: SlotHandle) -> Self {
        Self {
            pool,
            handle: Some(handle),
        }
    }

    pub fn handle(&self) -> Option<SlotHandle> {
        self.handle
    }

    pub fn kind(&self) -> Option<SlotKind> {
        self.handle.map(|h| h.kind())
    }

    /// Give up ownership without releasing; the caller must call `release_slot`.
    pub fn into_handle(mut self) -> Option<SlotHandle> {
        self.handle.take()
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release_slot(handle);
        }
    }
}
