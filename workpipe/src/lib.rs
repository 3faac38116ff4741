//! workpipe: a staged work pipeline.
//!
//! Work items flow through an ordered list of stages. Each stage decides with
//! a predicate whether it wants the item and runs its worker inline, on a
//! bounded thread pool, or in a `workpipe-shim` child process. Adjacent stages
//! can stream bytes to each other over an EOF-aware [`channel`].
//!
//! ```ignore
//! use workpipe::{Pipeline, PipelineOptions, Stage, WorkItem};
//! use serde_json::json;
//!
//! let pipeline = Pipeline::builder(PipelineOptions::default())
//!     .add_stage(Stage::process("double", |_| true, "json.scale")
//!         .with_args(json!({"field": "counter", "factor": 2})))
//!     .add_stage(Stage::inline("label", |_| true, |p: &mut serde_json::Value, _| {
//!         p["label"] = json!("done");
//!         Ok(())
//!     }))
//!     .build()?;
//!
//! let item = pipeline.submit(WorkItem::new(json!({"counter": 100})))?.await?;
//! assert_eq!(item.payload()["counter"], 200);
//! ```

pub mod channel;
pub mod executor;
mod logging;
pub mod options;
pub mod pipeline;
pub mod util;
pub mod worker;

pub use channel::{ChannelEndpoint, ChannelReader, ChannelRole, ChannelWriter, create_reader_writer_pair};
pub use executor::{ExecutorPool, SharedExecutorPool, SlotGuard, SlotHandle, SlotKind};
pub use logging::init_logging;
pub use options::PipelineOptions;
pub use pipeline::{
    ExecutionMode, FailureKind, ItemId, Payload, Pipeline, PipelineBuilder, PipelineMetrics,
    ShutdownReport, Stage, StageContext, StageFailure, StageRecord, WorkHandle, WorkItem,
};
pub use workpipe_shared::{WorkpipeError, WorkpipeResult};

#[doc(hidden)]
pub use inventory;
