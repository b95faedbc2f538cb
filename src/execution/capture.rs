//! Engine side of the output capture bridge.
//!
//! Kernel drivers forward every `mark_output` call over a [`CaptureSender`];
//! the engine drains the receiver after each unit and feeds a
//! [`CaptureLatch`], which accepts exactly one value per session.

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::ExecutionError;

/// One `mark_output` call as reported by the kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedOutput {
    /// Notebook position of the unit that made the call.
    pub unit: usize,
    pub value: Value,
    /// Size of the value's JSON serialization.
    pub bytes: usize,
}

impl CapturedOutput {
    pub fn new(unit: usize, value: Value) -> Self {
        let bytes = serde_json::to_vec(&value).map(|v| v.len()).unwrap_or(0);
        Self { unit, value, bytes }
    }

    /// A capture whose value stayed in the kernel because it was too large
    /// to send; only its size is known.
    pub fn oversized(unit: usize, bytes: usize) -> Self {
        Self {
            unit,
            value: Value::Null,
            bytes,
        }
    }
}

pub type CaptureSender = mpsc::UnboundedSender<CapturedOutput>;
pub type CaptureReceiver = mpsc::UnboundedReceiver<CapturedOutput>;

pub fn channel() -> (CaptureSender, CaptureReceiver) {
    mpsc::unbounded_channel()
}

#[derive(Debug)]
pub struct CaptureLatch {
    captured: Option<CapturedOutput>,
    limit: usize,
}

impl CaptureLatch {
    pub fn new(limit: usize) -> Self {
        Self {
            captured: None,
            limit,
        }
    }

    /// Latch the first capture. A second one is rejected and never replaces
    /// the first.
    pub fn offer(&mut self, capture: CapturedOutput) -> Result<(), ExecutionError> {
        if let Some(first) = &self.captured {
            return Err(ExecutionError::AmbiguousOutput {
                first_unit: first.unit,
                second_unit: capture.unit,
            });
        }
        if capture.bytes > self.limit {
            return Err(ExecutionError::OutputTooLarge {
                bytes: capture.bytes,
                limit: self.limit,
            });
        }
        tracing::debug!(unit = capture.unit, bytes = capture.bytes, "output captured");
        self.captured = Some(capture);
        Ok(())
    }

    /// Feed every pending capture; stops at the first violation.
    pub fn drain(&mut self, rx: &mut CaptureReceiver) -> Result<(), ExecutionError> {
        while let Ok(capture) = rx.try_recv() {
            self.offer(capture)?;
        }
        Ok(())
    }

    pub fn is_captured(&self) -> bool {
        self.captured.is_some()
    }

    pub fn get(&self) -> Option<&CapturedOutput> {
        self.captured.as_ref()
    }

    pub fn into_inner(self) -> Option<CapturedOutput> {
        self.captured
    }
}
