//! Run parameterized notebooks as typed, callable units of computation.
//!
//! A [`Contract`] declares the input fields and the single output type of a
//! notebook. [`run`] validates caller inputs against it, injects them into the
//! unit tagged `parameters`, executes the notebook in a fresh kernel, and
//! validates the one value the notebook hands to `mark_output`.
//!
//! ```no_run
//! use std::time::Duration;
//! use nbcall::{Contract, FieldType, Notebook, Unit};
//! use serde_json::json;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let contract = Contract::new(
//!     "double",
//!     [("x", FieldType::Int)],
//!     FieldType::Int,
//! )?;
//! let template = Notebook::new(vec![
//!     Unit::code("x = 0").with_tag("parameters"),
//!     Unit::code("mark_output(x * 2)"),
//! ]);
//! let inputs = json!({"x": 21}).as_object().cloned().unwrap_or_default();
//! let value = nbcall::run(&contract, &template, &inputs, Duration::from_secs(30)).await?;
//! assert_eq!(value, json!(42));
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use serde_json::{Map, Value};

pub mod assemble;
pub mod config;
pub mod contract;
pub mod error;
pub mod execution;
pub mod inject;
pub mod kernel;
pub mod logging;
pub mod notebook;
pub mod process;

pub use assemble::{assemble, ExecutionResult, Runner};
pub use config::{Config, KernelConfig};
pub use contract::{validate_inputs, validate_output, BoundInputs, Contract, FieldType};
pub use error::{ContractError, ExecutionError, InjectionError, KernelError, Phase, RunError};
pub use execution::{Engine, SessionOutcome, SessionState};
pub use inject::{inject, ExecutableNotebook};
pub use notebook::{Notebook, Unit, UnitKind};

/// Run with a python engine configured from [`Config::load`]. A `None`
/// timeout uses `NBCALL_TIMEOUT_SECONDS`. Logging is set up from `NBCALL_LOG`
/// unless the host already installed a subscriber.
pub async fn run(
    contract: &Contract,
    template: &Notebook,
    raw_inputs: &Map<String, Value>,
    timeout: impl Into<Option<Duration>>,
) -> ExecutionResult {
    let settings = Config::load();
    if let Err(e) = logging::init_from_config(&settings) {
        tracing::debug!("logging not initialized: {}", e);
    }
    let config = KernelConfig::from_config(&settings);
    Runner::new(Engine::python(config))
        .run(contract, template, raw_inputs, timeout)
        .await
}

/// Blocking variant of [`run`] for synchronous callers. Must not be called
/// from inside a tokio runtime.
pub fn run_blocking(
    contract: &Contract,
    template: &Notebook,
    raw_inputs: &Map<String, Value>,
    timeout: impl Into<Option<Duration>>,
) -> ExecutionResult {
    let timeout = timeout.into();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| ExecutionError::Kernel {
            unit: None,
            detail: format!("failed to start runtime: {}", e),
        })?;
    runtime.block_on(run(contract, template, raw_inputs, timeout))
}
