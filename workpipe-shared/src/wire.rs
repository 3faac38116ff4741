//! Wire formats shared by the host and `workpipe-shim`.
//!
//! ## Channel frames
//!
//! ```text
//! +----------------+---------+----------------------+
//! | len: u32 (LE)  | kind:u8 | body: [u8; len]      |
//! +----------------+---------+----------------------+
//! ```
//!
//! `kind` is `0` for data and `1` for end-of-stream. An EOF frame may carry no
//! body; trailing bytes passed to `write_eof` travel as a data frame first.
//!
//! ## Worker protocol
//!
//! The host writes one JSON [`WorkerRequest`] to the shim's stdin and closes it.
//! The shim answers with one JSON [`WorkerResponse`] on stdout.

use crate::errors::{WorkpipeError, WorkpipeResult};
use serde::{Deserialize, Serialize};

/// Size of a frame header in bytes.
pub const FRAME_HEADER_LEN: usize = 5;

/// Largest body carried by one data frame. Bigger writes are split.
pub const MAX_FRAME_BODY: usize = 256 * 1024;

/// File descriptor number the channel endpoint is placed on inside the shim.
pub const SHIM_CHANNEL_FD: i32 = 3;

/// Shim exit code when the worker returned an error.
pub const EXIT_WORKER_FAILED: i32 = 1;

/// Shim exit code when the request named an unknown worker or was malformed.
pub const EXIT_BAD_REQUEST: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Data = 0,
    Eof = 1,
}

impl FrameKind {
    pub fn from_u8(value: u8) -> WorkpipeResult<Self> {
        match value {
            0 => Ok(FrameKind::Data),
            1 => Ok(FrameKind::Eof),
            other => Err(WorkpipeError::Channel(format!(
                "unknown frame kind {}",
                other
            ))),
        }
    }
}

/// Encode a frame header.
pub fn encode_header(kind: FrameKind, len: usize) -> WorkpipeResult<[u8; FRAME_HEADER_LEN]> {
    if len > MAX_FRAME_BODY {
        return Err(WorkpipeError::Channel(format!(
            "frame body of {} bytes exceeds limit {}",
            len, MAX_FRAME_BODY
        )));
    }
    let mut header = [0u8; FRAME_HEADER_LEN];
    header[..4].copy_from_slice(&(len as u32).to_le_bytes());
    header[4] = kind as u8;
    Ok(header)
}

/// Decode a frame header into its kind and body length.
pub fn decode_header(header: &[u8; FRAME_HEADER_LEN]) -> WorkpipeResult<(FrameKind, usize)> {
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if len > MAX_FRAME_BODY {
        return Err(WorkpipeError::Channel(format!(
            "frame body of {} bytes exceeds limit {}",
            len, MAX_FRAME_BODY
        )));
    }
    Ok((FrameKind::from_u8(header[4])?, len))
}

/// Request sent from the host to a worker subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    /// Registered worker name (e.g. `json.scale`).
    pub worker: String,
    pub stage_index: usize,
    pub stage_name: String,
    /// Static stage arguments configured at pipeline build time.
    #[serde(default)]
    pub args: serde_json::Value,
    /// The work item payload.
    pub payload: serde_json::Value,
}

/// Response written by a worker subprocess.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerResponse {
    /// Payload after the worker ran. Present even on failure.
    pub payload: serde_json::Value,
    /// Optional per-stage output recorded on the work item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Worker error message, if the worker failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
