//! Result assembly and the invocation interface.
//!
//! [`Runner::run`] is the whole pipeline: validate inputs, inject them,
//! execute, then [`assemble`] the session outcome against the contract.

use std::{future::Future, time::Duration};

use serde_json::{Map, Value};

use crate::{
    contract::{validate_inputs, validate_output, Contract, FieldType},
    error::{ContractError, RunError},
    execution::{Engine, SessionOutcome},
    inject::inject,
    notebook::Notebook,
};

/// A validated output value, or the phase and cause of the failure.
pub type ExecutionResult = Result<Value, RunError>;

/// Turn a finished session into a final result. Output validation only runs
/// for completed sessions that captured a value.
pub fn assemble(contract: &Contract, outcome: SessionOutcome) -> ExecutionResult {
    let captured = outcome.into_result()?;
    let value = decode(contract.output(), captured.value).map_err(RunError::output)?;
    let value = contract.output().conform(value);
    validate_output(contract, &value).map_err(RunError::output)
}

/// Notebooks commonly hand over `json.dumps(data)`; unwrap that when the
/// declared output is not itself textual.
fn decode(output: &FieldType, value: Value) -> Result<Value, ContractError> {
    match value {
        Value::String(text) if !output.is_textual() => {
            serde_json::from_str(&text).map_err(|_| ContractError::TypeMismatch {
                path: "$".into(),
                expected: output.to_string(),
                found: "string (not a JSON document)".into(),
            })
        }
        other => Ok(other),
    }
}

#[derive(Debug, Clone)]
pub struct Runner {
    engine: Engine,
}

impl Runner {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub async fn run(
        &self,
        contract: &Contract,
        template: &Notebook,
        raw_inputs: &Map<String, Value>,
        timeout: impl Into<Option<Duration>>,
    ) -> ExecutionResult {
        self.run_with_cancel(contract, template, raw_inputs, timeout, futures::future::pending())
            .await
    }

    pub async fn run_with_cancel<C>(
        &self,
        contract: &Contract,
        template: &Notebook,
        raw_inputs: &Map<String, Value>,
        timeout: impl Into<Option<Duration>>,
        cancel: C,
    ) -> ExecutionResult
    where
        C: Future<Output = ()>,
    {
        let bound = validate_inputs(contract, raw_inputs).map_err(|e| {
            tracing::info!(contract = %contract.id, "input validation failed: {}", e);
            RunError::inputs(e)
        })?;
        let notebook = inject(template, &bound)?;
        tracing::debug!(
            contract = %contract.id,
            parameter_unit = notebook.parameter_index(),
            "parameters injected"
        );

        let mut opts = self.engine.options(timeout.into());
        opts.continue_on_warning |= contract.allow_warnings;
        let outcome = self.engine.run(&notebook, opts, cancel).await;
        assemble(contract, outcome)
    }
}
