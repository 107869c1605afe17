//! Utility functions used to reach files through procfs

use nix::unistd::Pid;
use std::{fs, io, path::PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcfsError {
    #[error("reading file failed {path}")]
    ReadFile {
        #[source]
        source: io::Error,
        path: String,
    },
}

/// Returns the path of `path` as seen from the root filesystem of `pid`.
///
/// `path` must be absolute: it's appended verbatim to `/proc/{pid}/root`.
pub fn process_root_path(pid: Pid, path: &str) -> PathBuf {
    PathBuf::from(format!("/proc/{pid}/root{path}"))
}

/// Access `path` through the mount namespace of `pid`.
///
/// Fails if the process has exited or the file doesn't exist in its
/// filesystem view.
pub fn resolve_in_process_root(pid: Pid, path: &str) -> Result<PathBuf, ProcfsError> {
    let resolved = process_root_path(pid, path);
    match fs::metadata(&resolved) {
        Ok(_) => Ok(resolved),
        Err(source) => Err(ProcfsError::ReadFile {
            source,
            path: resolved.to_string_lossy().into_owned(),
        }),
    }
}
