//! Subprocess spawning for `workpipe-shim`.
//!
//! Each process-mode stage invocation runs in a fresh shim process:
//!
//! ```text
//! host                                   workpipe-shim
//!  │  spawn --worker <name> --stage-index <i> [--channel-fd 3 --channel-role r|w]
//!  │──────────────────────────────────────▶│
//!  │  stdin: WorkerRequest (JSON), EOF      │
//!  │──────────────────────────────────────▶│  run worker
//!  │  stdout: WorkerResponse (JSON)         │
//!  │◀──────────────────────────────────────│
//!  │  exit status                           │
//! ```

use crate::channel::ChannelEndpoint;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use workpipe_shared::errors::{WorkpipeError, WorkpipeResult};
use workpipe_shared::wire::{SHIM_CHANNEL_FD, WorkerRequest, WorkerResponse};

/// Launches worker subprocesses from a resolved shim binary.
#[derive(Debug)]
pub struct ProcessLauncher {
    program: PathBuf,
    forward_env: Vec<String>,
    spawned: AtomicU64,
}

impl ProcessLauncher {
    pub fn new(program: PathBuf, forward_env: Vec<String>) -> Self {
        Self {
            program,
            forward_env,
            spawned: AtomicU64::new(0),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Number of worker processes spawned so far.
    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    /// Run one worker request in a new shim process.
    ///
    /// `endpoint`, if given, is placed on fd 3 in the child. The parent's copy
    /// is closed as soon as the child has been spawned so EOF/peer-closed
    /// detection only depends on the two stages.
    ///
    /// # Errors
    ///
    /// * `Spawn` - the shim could not be started
    /// * `Serialization` - the request could not be encoded
    /// * `Worker` - the shim exited without a readable response
    pub async fn run(
        &self,
        request: &WorkerRequest,
        endpoint: Option<ChannelEndpoint>,
    ) -> WorkpipeResult<WorkerResponse> {
        let body = serde_json::to_vec(request)?;

        let mut cmd = Command::new(&self.program);
        cmd.arg("--worker")
            .arg(&request.worker)
            .arg("--stage-index")
            .arg(request.stage_index.to_string());

        for key in &self.forward_env {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }

        let channel_fd = match endpoint {
            Some(endpoint) => {
                let role = endpoint.role();
                let fd = endpoint.into_owned_fd().ok_or_else(|| {
                    WorkpipeError::Channel("channel endpoint already closed".into())
                })?;
                cmd.arg("--channel-fd")
                    .arg(SHIM_CHANNEL_FD.to_string())
                    .arg("--channel-role")
                    .arg(role.as_str());

                let raw = fd.as_raw_fd();
                // SAFETY: only async-signal-safe libc calls between fork and exec.
                unsafe {
                    cmd.pre_exec(move || place_channel_fd(raw));
                }
                Some(fd)
            }
            None => None,
        };

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());

        let mut child = cmd.spawn().map_err(|e| {
            let err_msg = format!(
                "Failed to spawn worker '{}' at {}: {}",
                request.worker,
                self.program.display(),
                e
            );
            tracing::error!("{}", err_msg);
            WorkpipeError::Spawn(err_msg)
        })?;
        drop(channel_fd);
        self.spawned.fetch_add(1, Ordering::Relaxed);

        let pid = child.id();
        tracing::debug!(
            worker = %request.worker,
            stage_index = request.stage_index,
            pid = ?pid,
            "Spawned worker process"
        );

        // A worker that dies before reading its request surfaces below as a
        // missing response; the write error itself is only logged.
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(&body).await {
                tracing::warn!(pid = ?pid, error = %e, "Failed to send request to worker");
            }
            drop(stdin);
        }

        let output = child.wait_with_output().await.map_err(|e| {
            WorkpipeError::Worker(format!("Failed to wait for worker {:?}: {}", pid, e))
        })?;

        match serde_json::from_slice::<WorkerResponse>(&output.stdout) {
            Ok(response) => {
                tracing::debug!(
                    pid = ?pid,
                    status = %output.status,
                    failed = response.error.is_some(),
                    "Worker process finished"
                );
                Ok(response)
            }
            Err(e) => Err(WorkpipeError::Worker(format!(
                "worker '{}' exited with {} without a valid response: {}",
                request.worker, output.status, e
            ))),
        }
    }
}

/// Runs in the forked child before exec.
fn place_channel_fd(raw: i32) -> std::io::Result<()> {
    unsafe {
        if raw == SHIM_CHANNEL_FD {
            // dup2 onto itself is a no-op and would keep FD_CLOEXEC set.
            let flags = libc::fcntl(raw, libc::F_GETFD);
            if flags < 0 || libc::fcntl(raw, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                return Err(std::io::Error::last_os_error());
            }
        } else if libc::dup2(raw, SHIM_CHANNEL_FD) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}
