//! Kernel protocol seam.
//!
//! The engine only talks to kernels through [`KernelLauncher`] and
//! [`KernelSession`]; `python` is the bundled implementation.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::{error::KernelError, execution::capture::CaptureSender};

pub mod python;

pub use python::PythonKernel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Ok,
    Error,
    /// Completed, but raised warning-level conditions.
    Warning,
}

/// The kernel's answer to one execute request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitReply {
    pub status: UnitStatus,
    pub detail: Option<String>,
    pub stdout: String,
    pub stderr: String,
}

impl UnitReply {
    pub fn ok() -> Self {
        Self {
            status: UnitStatus::Ok,
            detail: None,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn error(detail: impl Into<String>) -> Self {
        Self {
            status: UnitStatus::Error,
            detail: Some(detail.into()),
            ..Self::ok()
        }
    }

    pub fn warning(detail: impl Into<String>) -> Self {
        Self {
            status: UnitStatus::Warning,
            detail: Some(detail.into()),
            ..Self::ok()
        }
    }
}

/// One live, isolated kernel. Owned by exactly one engine run.
#[async_trait]
pub trait KernelSession: Send {
    async fn wait_ready(&mut self) -> Result<(), KernelError>;

    /// Run one unit to completion. `index` is the unit's position in the
    /// notebook; captures made while it runs go to the session's sender
    /// before this returns.
    async fn execute(&mut self, index: usize, code: &str) -> Result<UnitReply, KernelError>;

    /// Ask the kernel to exit, then kill it once `grace` has elapsed.
    async fn shutdown(&mut self, grace: Duration);
}

#[async_trait]
pub trait KernelLauncher: Send + Sync {
    async fn launch(
        &self,
        kernel_name: &str,
        capture: CaptureSender,
    ) -> Result<Box<dyn KernelSession>, KernelError>;
}

/// Append `text` to `buf` without letting `buf` exceed `limit` bytes.
pub(crate) fn push_bounded(buf: &mut String, text: &str, limit: usize) {
    let room = limit.saturating_sub(buf.len());
    if text.len() <= room {
        buf.push_str(text);
        return;
    }
    let mut end = room;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    buf.push_str(&text[..end]);
}
