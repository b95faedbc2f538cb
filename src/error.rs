//! Error taxonomy for every phase of a notebook invocation.

use std::fmt;

use thiserror::Error;

/// Raised while validating inputs or outputs against a [`Contract`](crate::contract::Contract),
/// or while building a contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractError {
    #[error("missing input field `{0}`")]
    MissingField(String),
    #[error("unknown input field `{0}`")]
    UnknownField(String),
    #[error("type mismatch at `{path}`: expected {expected}, found {found}")]
    TypeMismatch {
        path: String,
        expected: String,
        found: String,
    },
    #[error("field `{0}` is declared more than once")]
    DuplicateField(String),
    #[error("field name `{0}` is not a valid identifier")]
    InvalidFieldName(String),
    #[error("invalid type expression `{expr}`: {reason}")]
    InvalidType { expr: String, reason: String },
}

/// Raised by the parameter injector. No kernel exists yet when this happens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InjectionError {
    #[error("expected exactly one unit tagged `parameters`, found {found}")]
    AmbiguousOrMissingTarget { found: usize },
}

/// Raised during or after a kernel session. The session is always torn down first.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("unit {index} failed: {detail}")]
    UnitFailed { index: usize, detail: String },
    #[error("{}", timed_out_message(.unit))]
    TimedOut { unit: Option<usize> },
    #[error("execution cancelled")]
    Cancelled,
    #[error("output marked more than once (first in unit {first_unit}, again in unit {second_unit})")]
    AmbiguousOutput { first_unit: usize, second_unit: usize },
    #[error("notebook completed without marking an output")]
    NoOutputProduced,
    #[error("captured output is {bytes} bytes, limit is {limit}")]
    OutputTooLarge { bytes: usize, limit: usize },
    #[error("kernel failure{}: {detail}", unit_suffix(.unit))]
    Kernel { unit: Option<usize>, detail: String },
}

fn timed_out_message(unit: &Option<usize>) -> String {
    match unit {
        Some(i) => format!("timed out while running unit {}", i),
        None => "timed out before the kernel became ready".to_string(),
    }
}

fn unit_suffix(unit: &Option<usize>) -> String {
    unit.map(|i| format!(" in unit {}", i)).unwrap_or_default()
}

/// Kernel driver failures, below the session state machine.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("unsupported kernel `{0}`")]
    UnsupportedKernel(String),
    #[error("failed to spawn kernel `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("kernel i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("kernel protocol violation: {0}")]
    Protocol(String),
    #[error("kernel exited unexpectedly{}", stderr_tail(.stderr))]
    Exited { stderr: String },
}

fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {}", trimmed)
    }
}

/// The phase an invocation failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    InputValidation,
    Injection,
    Execution,
    Capture,
    OutputValidation,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::InputValidation => "input-validation",
            Phase::Injection => "injection",
            Phase::Execution => "execution",
            Phase::Capture => "capture",
            Phase::OutputValidation => "output-validation",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure half of an [`ExecutionResult`](crate::assemble::ExecutionResult).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    /// Input validation failure (before injection) or output validation failure
    /// (after a completed session), distinguished by `phase`.
    #[error("{phase}: {source}")]
    Contract {
        phase: Phase,
        #[source]
        source: ContractError,
    },
    #[error("injection: {0}")]
    Injection(#[from] InjectionError),
    #[error("{phase}: {0}", phase = execution_phase(.0))]
    Execution(#[from] ExecutionError),
}

fn execution_phase(err: &ExecutionError) -> Phase {
    match err {
        ExecutionError::AmbiguousOutput { .. }
        | ExecutionError::NoOutputProduced
        | ExecutionError::OutputTooLarge { .. } => Phase::Capture,
        _ => Phase::Execution,
    }
}

impl RunError {
    pub fn inputs(source: ContractError) -> Self {
        RunError::Contract {
            phase: Phase::InputValidation,
            source,
        }
    }

    pub fn output(source: ContractError) -> Self {
        RunError::Contract {
            phase: Phase::OutputValidation,
            source,
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            RunError::Contract { phase, .. } => *phase,
            RunError::Injection(_) => Phase::Injection,
            RunError::Execution(e) => execution_phase(e),
        }
    }

    pub fn as_contract(&self) -> Option<&ContractError> {
        match self {
            RunError::Contract { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn as_execution(&self) -> Option<&ExecutionError> {
        match self {
            RunError::Execution(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_follows_execution_error_kind() {
        let e = RunError::from(ExecutionError::NoOutputProduced);
        assert_eq!(e.phase(), Phase::Capture);
        let e = RunError::from(ExecutionError::UnitFailed {
            index: 3,
            detail: "ZeroDivisionError".into(),
        });
        assert_eq!(e.phase(), Phase::Execution);
        assert_eq!(e.to_string(), "execution: unit 3 failed: ZeroDivisionError");
    }

    #[test]
    fn contract_errors_carry_their_phase() {
        let e = RunError::inputs(ContractError::MissingField("baz".into()));
        assert_eq!(e.phase(), Phase::InputValidation);
        assert_eq!(e.to_string(), "input-validation: missing input field `baz`");
        assert_eq!(
            e.as_contract(),
            Some(&ContractError::MissingField("baz".into()))
        );
    }

    #[test]
    fn kernel_exit_message_includes_stderr() {
        let e = KernelError::Exited {
            stderr: "Traceback...\n".into(),
        };
        assert_eq!(e.to_string(), "kernel exited unexpectedly: Traceback...");
        let e = KernelError::Exited { stderr: " ".into() };
        assert_eq!(e.to_string(), "kernel exited unexpectedly");
    }
}
