//! Named workers for process-mode stages, and the `workpipe-shim` entry point.
//!
//! A process stage names a worker instead of carrying a closure, because the
//! closure cannot cross into a fresh process. The shim looks the name up in
//! the built-in table first, then among workers registered at link time with
//! [`register_worker!`](crate::register_worker).
//!
//! Programs that need their own workers build their own shim:
//!
//! ```ignore
//! fn tag(payload: &mut serde_json::Value, ctx: &mut workpipe::StageContext) -> anyhow::Result<()> {
//!     payload["tag"] = ctx.stage_name().into();
//!     Ok(())
//! }
//! workpipe::register_worker!("my.tag", tag);
//!
//! fn main() {
//!     std::process::exit(workpipe::worker::serve());
//! }
//! ```

mod builtin;

pub use builtin::BUILTIN_WORKERS;

use crate::channel::{ChannelEndpoint, ChannelRole};
use crate::pipeline::StageContext;
use clap::Parser;
use std::io::{Read, Write};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use workpipe_shared::errors::{WorkpipeError, WorkpipeResult};
use workpipe_shared::wire::{EXIT_BAD_REQUEST, EXIT_WORKER_FAILED, WorkerRequest, WorkerResponse};

/// Signature of a worker run inside the shim.
pub type WorkerEntry = fn(&mut serde_json::Value, &mut StageContext) -> anyhow::Result<()>;

/// A named worker.
#[derive(Debug)]
pub struct WorkerRegistration {
    pub name: &'static str,
    pub run: WorkerEntry,
}

inventory::collect!(WorkerRegistration);

/// Register a worker so the shim can find it by name.
#[macro_export]
macro_rules! register_worker {
    ($name:expr, $run:path) => {
        $crate::inventory::submit! {
            $crate::worker::WorkerRegistration {
                name: $name,
                run: $run,
            }
        }
    };
}

/// Look up a worker by name. Built-ins win over registered workers.
pub fn find_worker(name: &str) -> Option<WorkerEntry> {
    BUILTIN_WORKERS
        .iter()
        .chain(inventory::iter::<WorkerRegistration>)
        .find(|w| w.name == name)
        .map(|w| w.run)
}

/// Names of every known worker, built-ins first.
pub fn worker_names() -> Vec<&'static str> {
    BUILTIN_WORKERS
        .iter()
        .chain(inventory::iter::<WorkerRegistration>)
        .map(|w| w.name)
        .collect()
}

/// Command line of `workpipe-shim`.
#[derive(Parser, Debug, Clone)]
#[command(name = "workpipe-shim", version, about = "Runs one workpipe stage worker")]
pub struct ShimArgs {
    /// Registered worker name
    #[arg(long)]
    pub worker: String,

    /// Index of the stage being run
    #[arg(long)]
    pub stage_index: usize,

    /// Inherited channel descriptor
    #[arg(long, requires = "channel_role")]
    pub channel_fd: Option<RawFd>,

    /// Side of the channel this worker holds (reader or writer)
    #[arg(long, requires = "channel_fd")]
    pub channel_role: Option<String>,

    /// Write logs to a daily-rolling file in this directory instead of stderr
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

/// Shim entry point: parse arguments, serve one request from stdin, answer on
/// stdout. Returns the process exit code.
pub fn serve() -> i32 {
    let args = ShimArgs::parse();
    if let Err(e) = crate::logging::init_logging(args.log_dir.as_deref()) {
        eprintln!("workpipe-shim: {}", e);
    }

    let endpoint = match open_endpoint(&args) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            tracing::error!(worker = %args.worker, error = %e, "Invalid channel arguments");
            return EXIT_BAD_REQUEST;
        }
    };

    let stdin = std::io::stdin().lock();
    let stdout = std::io::stdout().lock();
    handle_request(&args, endpoint, stdin, stdout)
}

/// Serve one request. Split from [`serve`] so it can run against in-memory
/// streams.
pub fn handle_request<R: Read, W: Write>(
    args: &ShimArgs,
    endpoint: Option<ChannelEndpoint>,
    input: R,
    mut output: W,
) -> i32 {
    let request: WorkerRequest = match serde_json::from_reader(input) {
        Ok(request) => request,
        Err(e) => {
            let message = format!("Malformed worker request: {}", e);
            tracing::error!(worker = %args.worker, "{}", message);
            return respond(&mut output, failed_response(serde_json::Value::Null, message), EXIT_BAD_REQUEST);
        }
    };

    if request.worker != args.worker {
        let message = format!(
            "request names worker '{}' but shim was started for '{}'",
            request.worker, args.worker
        );
        return respond(&mut output, failed_response(request.payload, message), EXIT_BAD_REQUEST);
    }

    let Some(run) = find_worker(&request.worker) else {
        let message = format!("unknown worker '{}'", request.worker);
        tracing::error!(stage_index = request.stage_index, "{}", message);
        return respond(&mut output, failed_response(request.payload, message), EXIT_BAD_REQUEST);
    };

    tracing::debug!(
        worker = %request.worker,
        stage = %request.stage_name,
        stage_index = request.stage_index,
        "Running worker"
    );

    let mut payload = request.payload;
    let mut ctx = StageContext::new(request.stage_index, request.stage_name, request.args)
        .with_endpoint(endpoint);
    let result = match catch_unwind(AssertUnwindSafe(|| run(&mut payload, &mut ctx))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(panic) => Err(format!(
            "worker panicked: {}",
            crate::pipeline::panic_message(panic.as_ref())
        )),
    };
    let stage_output = ctx.take_output();
    // Close the channel end before answering so the peer stage is not kept
    // waiting on our response write.
    drop(ctx);

    match result {
        Ok(()) => respond(
            &mut output,
            WorkerResponse {
                payload,
                output: stage_output,
                error: None,
            },
            0,
        ),
        Err(message) => {
            tracing::warn!(worker = %args.worker, error = %message, "Worker failed");
            respond(
                &mut output,
                WorkerResponse {
                    payload,
                    output: stage_output,
                    error: Some(message),
                },
                EXIT_WORKER_FAILED,
            )
        }
    }
}

fn failed_response(payload: serde_json::Value, message: String) -> WorkerResponse {
    WorkerResponse {
        payload,
        output: None,
        error: Some(message),
    }
}

fn respond<W: Write>(output: &mut W, response: WorkerResponse, code: i32) -> i32 {
    let written = serde_json::to_writer(&mut *output, &response)
        .map_err(WorkpipeError::from)
        .and_then(|_| output.flush().map_err(WorkpipeError::from));
    match written {
        Ok(()) => code,
        Err(e) => {
            tracing::error!(error = %e, "Failed to write worker response");
            EXIT_BAD_REQUEST
        }
    }
}

fn open_endpoint(args: &ShimArgs) -> WorkpipeResult<Option<ChannelEndpoint>> {
    let (Some(fd), Some(role)) = (args.channel_fd, args.channel_role.as_deref()) else {
        return Ok(None);
    };
    let role = ChannelRole::parse(role)
        .ok_or_else(|| WorkpipeError::Config(format!("invalid channel role '{}'", role)))?;

    // SAFETY: F_GETFD only inspects the descriptor table.
    if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
        return Err(WorkpipeError::Channel(format!(
            "channel fd {} is not open: {}",
            fd,
            std::io::Error::last_os_error()
        )));
    }
    // SAFETY: the host handed this descriptor to us and nothing else in the
    // shim refers to it.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    Ok(Some(ChannelEndpoint::from_owned_fd(role, fd)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::create_reader_writer_pair;
    use serde_json::json;

    fn args(worker: &str) -> ShimArgs {
        ShimArgs {
            worker: worker.into(),
            stage_index: 0,
            channel_fd: None,
            channel_role: None,
            log_dir: None,
        }
    }

    fn request(worker: &str, args: serde_json::Value, payload: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&WorkerRequest {
            worker: worker.into(),
            stage_index: 0,
            stage_name: "test".into(),
            args,
            payload,
        })
        .unwrap()
    }

    fn serve_bytes(
        shim: &ShimArgs,
        endpoint: Option<ChannelEndpoint>,
        input: &[u8],
    ) -> (i32, WorkerResponse) {
        let mut out = Vec::new();
        let code = handle_request(shim, endpoint, input, &mut out);
        (code, serde_json::from_slice(&out).unwrap())
    }

    fn tag(payload: &mut serde_json::Value, _: &mut StageContext) -> anyhow::Result<()> {
        payload["tagged"] = json!(true);
        Ok(())
    }

    crate::register_worker!("test.tag", tag);

    #[test]
    fn test_registered_worker_found() {
        assert!(find_worker("test.tag").is_some());
        assert!(find_worker("json.set").is_some());
        assert!(find_worker("nope").is_none());
        let names = worker_names();
        assert_eq!(names[0], BUILTIN_WORKERS[0].name);
        assert!(names.contains(&"test.tag"));
    }

    #[test]
    fn test_success_response() {
        let input = request("test.tag", json!(null), json!({"a": 1}));
        let (code, response) = serve_bytes(&args("test.tag"), None, &input);
        assert_eq!(code, 0);
        assert_eq!(response.payload, json!({"a": 1, "tagged": true}));
        assert!(response.error.is_none());
    }

    #[test]
    fn test_worker_error_exit_code() {
        let input = request("json.fail", json!({"message": "nope"}), json!({"a": 1}));
        let (code, response) = serve_bytes(&args("json.fail"), None, &input);
        assert_eq!(code, EXIT_WORKER_FAILED);
        assert_eq!(response.error.as_deref(), Some("nope"));
        assert_eq!(response.payload, json!({"a": 1}));
    }

    #[test]
    fn test_unknown_worker_is_bad_request() {
        let input = request("missing.worker", json!(null), json!(5));
        let (code, response) = serve_bytes(&args("missing.worker"), None, &input);
        assert_eq!(code, EXIT_BAD_REQUEST);
        assert!(response.error.unwrap().contains("unknown worker"));
        assert_eq!(response.payload, json!(5));
    }

    #[test]
    fn test_malformed_request_is_bad_request() {
        let (code, response) = serve_bytes(&args("json.set"), None, b"{not json");
        assert_eq!(code, EXIT_BAD_REQUEST);
        assert!(response.error.is_some());
    }

    #[test]
    fn test_worker_mismatch_is_bad_request() {
        let input = request("json.set", json!(null), json!({}));
        let (code, _) = serve_bytes(&args("json.copy"), None, &input);
        assert_eq!(code, EXIT_BAD_REQUEST);
    }

    #[test]
    fn test_channel_endpoint_reaches_worker() {
        let (mut reader, writer) = create_reader_writer_pair().unwrap();
        let input = request("bytes.random", json!({"len": 32, "seed": 7}), json!({}));
        let (code, response) = serve_bytes(
            &args("bytes.random"),
            Some(ChannelEndpoint::Writer(writer)),
            &input,
        );
        assert_eq!(code, 0);
        assert_eq!(reader.read_to_end().unwrap().len(), 32);
        assert_eq!(response.output.unwrap()["bytes_written"], 32);
    }

    #[test]
    fn test_shim_args_parse() {
        let parsed = ShimArgs::try_parse_from([
            "workpipe-shim",
            "--worker",
            "bytes.collect",
            "--stage-index",
            "4",
            "--channel-fd",
            "3",
            "--channel-role",
            "reader",
        ])
        .unwrap();
        assert_eq!(parsed.stage_index, 4);
        assert_eq!(parsed.channel_fd, Some(3));

        let missing_role = ShimArgs::try_parse_from([
            "workpipe-shim",
            "--worker",
            "x",
            "--stage-index",
            "0",
            "--channel-fd",
            "3",
        ]);
        assert!(missing_role.is_err());
    }

    #[test]
    fn test_open_endpoint_rejects_bad_role() {
        let mut shim = args("x");
        shim.channel_fd = Some(0);
        shim.channel_role = Some("sideways".into());
        assert!(matches!(open_endpoint(&shim), Err(WorkpipeError::Config(_))));
    }
}
