//! Staged work pipeline.
//!
//! Work items are routed through an ordered list of stages. Each stage has a
//! predicate deciding whether it claims the item and a worker that runs
//! inline, on a pool thread, or in a `workpipe-shim` child process. Two
//! adjacent stages may be piped: they then run concurrently, connected by a
//! [`crate::channel`] byte stream.
//!
//! ## Architecture
//!
//! ```text
//! Pipeline::submit ──Command::Submit──▶ Dispatcher (one tokio task)
//!                                          │  owns HashMap<ItemId, Tracked> + FIFO
//!                                          │  inline stages run here
//!                                          ▼
//!                              execution task per thread/process stage
//!                                          │  acquires slots from ExecutorPool
//!                                          └──Command::StageDone──▶ Dispatcher
//! ```
//!
//! Within one item stages run strictly in registration order, skipping those
//! whose predicate is false. Across items there is no ordering.
//!
//! ## Example
//!
//! ```ignore
//! use workpipe::{Pipeline, PipelineOptions, Stage, WorkItem};
//!
//! let pipeline = Pipeline::builder(PipelineOptions::default())
//!     .add_stage(Stage::thread("double", |_| true, |n: &mut u64, _| {
//!         *n *= 2;
//!         Ok(())
//!     }))
//!     .build()?;
//!
//! let item = pipeline.submit(WorkItem::new(21u64))?.await?;
//! assert_eq!(*item.payload(), 42);
//! pipeline.shutdown(true).await?;
//! ```

mod context;
mod dispatcher;
mod handle;
mod item;
mod metrics;
#[allow(clippy::module_inception)]
mod pipeline;
mod stage;

pub use context::StageContext;
pub use handle::WorkHandle;
pub use item::{FailureKind, ItemId, Payload, StageFailure, StageHook, StageRecord, WorkItem};
pub use metrics::PipelineMetrics;
pub use pipeline::{Pipeline, PipelineBuilder, ShutdownReport};
pub use stage::{ExecutionMode, Predicate, Stage, StageWork, WorkerFn};

pub(crate) use stage::panic_message;
