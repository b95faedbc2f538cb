//! Python interpreter process bootstrap.

use std::{ffi::OsStr, process::Stdio};

use tokio::process::{Child, Command};

use super::{ProcessHandle, StderrTail};
use crate::error::KernelError;

/// Interpreter used when no override is configured.
pub fn default_program() -> &'static str {
    if cfg!(windows) {
        "python"
    } else {
        "python3"
    }
}

/// Spawn `program -u -c bootstrap` with piped stdio. The child is killed if
/// the handle is dropped without an explicit shutdown.
pub fn start_python(program: &OsStr, bootstrap: &str) -> Result<ProcessHandle, KernelError> {
    let mut cmd = Command::new(program);
    cmd.arg("-u") // unbuffered
        .arg("-c")
        .arg(bootstrap)
        .env("PYTHONIOENCODING", "utf-8")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child: Child = cmd.spawn().map_err(|source| KernelError::Spawn {
        program: program.to_string_lossy().into_owned(),
        source,
    })?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| KernelError::Protocol("no stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| KernelError::Protocol("no stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| KernelError::Protocol("no stderr".into()))?;

    Ok(ProcessHandle {
        child,
        stdin,
        stdout,
        stderr: StderrTail::follow(stderr),
    })
}
