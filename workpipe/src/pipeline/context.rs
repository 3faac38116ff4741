//! Per-invocation context handed to stage workers.

use crate::channel::{ChannelEndpoint, ChannelReader, ChannelWriter};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use workpipe_shared::errors::WorkpipeResult;

/// What a worker sees besides its payload.
///
/// Used both by closure stages in the host and by registered workers inside
/// `workpipe-shim`.
#[derive(Debug)]
pub struct StageContext {
    stage_index: usize,
    stage_name: String,
    args: serde_json::Value,
    endpoint: Option<ChannelEndpoint>,
    output: Option<serde_json::Value>,
    cancelled: Arc<AtomicBool>,
}

impl StageContext {
    pub fn new(stage_index: usize, stage_name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            stage_index,
            stage_name: stage_name.into(),
            args,
            endpoint: None,
            output: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn with_endpoint(mut self, endpoint: Option<ChannelEndpoint>) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub(crate) fn with_cancel_flag(mut self, cancelled: Arc<AtomicBool>) -> Self {
        self.cancelled = cancelled;
        self
    }

    pub fn stage_index(&self) -> usize {
        self.stage_index
    }

    pub fn stage_name(&self) -> &str {
        &self.stage_name
    }

    /// Static arguments configured on the stage.
    pub fn args(&self) -> &serde_json::Value {
        &self.args
    }

    /// Writer end, when this stage pipes into the next one.
    pub fn writer(&mut self) -> Option<&mut ChannelWriter> {
        match self.endpoint.as_mut() {
            Some(ChannelEndpoint::Writer(writer)) => Some(writer),
            _ => None,
        }
    }

    /// Reader end, when the previous stage pipes into this one.
    pub fn reader(&mut self) -> Option<&mut ChannelReader> {
        match self.endpoint.as_mut() {
            Some(ChannelEndpoint::Reader(reader)) => Some(reader),
            _ => None,
        }
    }

    /// Take ownership of the endpoint (e.g. to move it into a helper thread).
    pub fn take_endpoint(&mut self) -> Option<ChannelEndpoint> {
        self.endpoint.take()
    }

    /// Record a value on the work item's stage record.
    pub fn set_output<T: Serialize>(&mut self, value: T) -> WorkpipeResult<()> {
        self.output = Some(serde_json::to_value(value)?);
        Ok(())
    }

    pub fn output(&self) -> Option<&serde_json::Value> {
        self.output.as_ref()
    }

    pub(crate) fn take_output(&mut self) -> Option<serde_json::Value> {
        self.output.take()
    }

    /// True once the caller cancelled the work item. Long-running workers may
    /// poll this and return early.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
