//! Binary lookup helpers.

use crate::options::{ENV_SHIM, SHIM_BINARY};
use std::path::{Path, PathBuf};
use workpipe_shared::errors::{WorkpipeError, WorkpipeResult};

/// Locate a helper binary such as `workpipe-shim`.
///
/// Search order:
/// 1. `$WORKPIPE_SHIM` (only for `workpipe-shim`, if the file exists)
/// 2. Directory of the current executable
/// 3. Parent of that directory (`target/debug/deps` → `target/debug`)
/// 4. `$PATH`
pub fn find_binary(name: &str) -> WorkpipeResult<PathBuf> {
    if name == SHIM_BINARY
        && let Some(path) = std::env::var_os(ENV_SHIM).map(PathBuf::from)
        && path.is_file()
    {
        return Ok(path);
    }

    let mut candidates = Vec::new();
    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        candidates.push(dir.join(name));
        if let Some(parent) = dir.parent() {
            candidates.push(parent.join(name));
        }
    }
    if let Some(paths) = std::env::var_os("PATH") {
        candidates.extend(std::env::split_paths(&paths).map(|dir| dir.join(name)));
    }

    candidates
        .into_iter()
        .find(|path| is_executable(path))
        .ok_or_else(|| {
            WorkpipeError::Config(format!(
                "Could not find '{}' (set {} or worker_program)",
                name, ENV_SHIM
            ))
        })
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
