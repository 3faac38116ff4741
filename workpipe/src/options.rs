//! Pipeline configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use workpipe_shared::errors::{WorkpipeError, WorkpipeResult};

/// Environment variable overriding the process slot limit.
pub const ENV_MAX_PROCESSES: &str = "WORKPIPE_MAX_PROCESSES";
/// Environment variable overriding the thread slot limit.
pub const ENV_MAX_THREADS: &str = "WORKPIPE_MAX_THREADS";
/// Environment variable overriding the in-flight item limit.
pub const ENV_MAX_IN_FLIGHT: &str = "WORKPIPE_MAX_IN_FLIGHT";
/// Environment variable pointing at the worker shim binary.
pub const ENV_SHIM: &str = "WORKPIPE_SHIM";

/// Name of the shim binary looked up when no program is configured.
pub const SHIM_BINARY: &str = "workpipe-shim";

const DEFAULT_MAX_IN_FLIGHT: usize = 1024;

/// Options controlling pipeline concurrency and worker processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    /// Max concurrently running process-mode stage invocations.
    pub max_process_slots: usize,
    /// Max concurrently running thread-mode stage invocations.
    pub max_thread_slots: usize,
    /// Max work items admitted at once; further submissions queue.
    pub max_in_flight: usize,
    /// Shim binary for process-mode stages. Resolved with
    /// [`crate::util::find_binary`] when unset.
    pub worker_program: Option<PathBuf>,
    /// Environment variables copied into worker processes.
    pub forward_env: Vec<String>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        let cpus = rayon::current_num_threads();
        Self {
            max_process_slots: cpus,
            max_thread_slots: cpus,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            worker_program: None,
            forward_env: vec!["RUST_LOG".to_string()],
        }
    }
}

impl PipelineOptions {
    /// Defaults overridden by `WORKPIPE_*` environment variables.
    pub fn from_env() -> WorkpipeResult<Self> {
        let mut options = Self::default();
        if let Some(value) = env_usize(ENV_MAX_PROCESSES)? {
            options.max_process_slots = value;
        }
        if let Some(value) = env_usize(ENV_MAX_THREADS)? {
            options.max_thread_slots = value;
        }
        if let Some(value) = env_usize(ENV_MAX_IN_FLIGHT)? {
            options.max_in_flight = value;
        }
        if let Some(path) = std::env::var_os(ENV_SHIM) {
            options.worker_program = Some(PathBuf::from(path));
        }
        options.sanitize()?;
        Ok(options)
    }

    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    pub fn with_slots(mut self, processes: usize, threads: usize) -> Self {
        self.max_process_slots = processes;
        self.max_thread_slots = threads;
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    /// Validate limits.
    pub fn sanitize(&self) -> WorkpipeResult<()> {
        if self.max_process_slots == 0 {
            return Err(WorkpipeError::Config(
                "max_process_slots must be at least 1".into(),
            ));
        }
        if self.max_thread_slots == 0 {
            return Err(WorkpipeError::Config(
                "max_thread_slots must be at least 1".into(),
            ));
        }
        if self.max_in_flight == 0 {
            return Err(WorkpipeError::Config("max_in_flight must be at least 1".into()));
        }
        Ok(())
    }

    /// Resolve the shim binary: explicit option first, then lookup.
    pub fn resolve_worker_program(&self) -> WorkpipeResult<PathBuf> {
        match &self.worker_program {
            Some(path) => Ok(path.clone()),
            None => crate::util::find_binary(SHIM_BINARY),
        }
    }
}

fn env_usize(key: &str) -> WorkpipeResult<Option<usize>> {
    match std::env::var(key) {
        Ok(value) => value.trim().parse::<usize>().map(Some).map_err(|e| {
            WorkpipeError::Config(format!("Invalid {}='{}': {}", key, value, e))
        }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let options = PipelineOptions::default();
        options.sanitize().unwrap();
        assert!(options.max_process_slots >= 1);
        assert_eq!(options.max_process_slots, rayon::current_num_threads());
        assert_eq!(options.max_thread_slots, rayon::current_num_threads());
        assert_eq!(options.forward_env, vec!["RUST_LOG".to_string()]);
    }

    #[test]
    fn test_zero_limits_rejected() {
        for options in [
            PipelineOptions::default().with_slots(0, 1),
            PipelineOptions::default().with_slots(1, 0),
            PipelineOptions::default().with_max_in_flight(0),
        ] {
            assert!(matches!(options.sanitize(), Err(WorkpipeError::Config(_))));
        }
    }

    #[test]
    fn test_deserialize_partial() {
        let options: PipelineOptions =
            serde_json::from_str(r#"{"max_thread_slots": 3, "worker_program": "/bin/shim"}"#)
                .unwrap();
        assert_eq!(options.max_thread_slots, 3);
        assert_eq!(options.max_in_flight, DEFAULT_MAX_IN_FLIGHT);
        assert_eq!(
            options.resolve_worker_program().unwrap(),
            PathBuf::from("/bin/shim")
        );
    }
}
