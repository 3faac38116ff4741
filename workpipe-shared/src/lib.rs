//! Types shared between the workpipe host library and the `workpipe-shim` worker process.

pub mod errors;
pub mod wire;

pub use errors::{WorkpipeError, WorkpipeResult};
pub use wire::{FrameKind, WorkerRequest, WorkerResponse};
