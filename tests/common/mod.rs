//! Scripted in-process kernel for engine tests.
//!
//! Each line of a code unit is one directive:
//!
//! ```text
//! name = <json>      bind a variable (what injected parameters look like)
//! mark <json>        call mark_output; `$name` is replaced by the bound value
//! print <text>       write to stdout
//! warn <detail>      finish the unit with a warning
//! fail <detail>      raise
//! sleep <ms>         block for a while
//! hang               never return
//! die <stderr>       the kernel process dies
//! ```
#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use nbcall::{
    error::KernelError,
    execution::capture::{CaptureSender, CapturedOutput},
    kernel::{KernelLauncher, KernelSession, UnitReply},
    Contract, Engine, FieldType, KernelConfig, Notebook, Runner, Unit,
};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default)]
pub struct Tally {
    pub launches: Arc<AtomicUsize>,
    pub shutdowns: Arc<AtomicUsize>,
    pub executed: Arc<Mutex<Vec<usize>>>,
}

impl Tally {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<usize> {
        self.executed.lock().unwrap().clone()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedKernel {
    pub tally: Tally,
    pub never_ready: bool,
}

#[async_trait]
impl KernelLauncher for ScriptedKernel {
    async fn launch(
        &self,
        _kernel_name: &str,
        capture: CaptureSender,
    ) -> Result<Box<dyn KernelSession>, KernelError> {
        self.tally.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            tally: self.tally.clone(),
            never_ready: self.never_ready,
            capture,
            vars: HashMap::new(),
        }))
    }
}

struct ScriptedSession {
    tally: Tally,
    never_ready: bool,
    capture: CaptureSender,
    vars: HashMap<String, Value>,
}

impl ScriptedSession {
    fn substitute(&self, text: &str) -> String {
        let mut names: Vec<&String> = self.vars.keys().collect();
        names.sort_by_key(|n| std::cmp::Reverse(n.len()));
        let mut out = text.to_string();
        for name in names {
            out = out.replace(&format!("${}", name), &self.vars[name].to_string());
        }
        out
    }
}

#[async_trait]
impl KernelSession for ScriptedSession {
    async fn wait_ready(&mut self) -> Result<(), KernelError> {
        if self.never_ready {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn execute(&mut self, index: usize, code: &str) -> Result<UnitReply, KernelError> {
        self.tally.executed.lock().unwrap().push(index);
        let mut reply = UnitReply::ok();
        for line in code.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
            match cmd {
                "mark" => {
                    let value: Value = serde_json::from_str(&self.substitute(rest))
                        .map_err(|e| KernelError::Protocol(e.to_string()))?;
                    let _ = self.capture.send(CapturedOutput::new(index, value));
                }
                "print" => {
                    reply.stdout.push_str(rest);
                    reply.stdout.push('\n');
                }
                "warn" => {
                    let stdout = std::mem::take(&mut reply.stdout);
                    reply = UnitReply {
                        stdout,
                        ..UnitReply::warning(rest)
                    };
                }
                "fail" => return Ok(UnitReply::error(rest)),
                "sleep" => {
                    let ms = rest.parse().unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
                "hang" => futures::future::pending::<()>().await,
                "die" => {
                    return Err(KernelError::Exited {
                        stderr: rest.to_string(),
                    })
                }
                _ => {
                    if let Some((name, literal)) = line.split_once(" = ") {
                        let value = serde_json::from_str(literal.trim()).unwrap_or(Value::Null);
                        self.vars.insert(name.trim().to_string(), value);
                    }
                }
            }
        }
        Ok(reply)
    }

    async fn shutdown(&mut self, _grace: Duration) {
        self.tally.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn scripted_engine(config: KernelConfig) -> (Engine, Tally) {
    let kernel = ScriptedKernel::default();
    let tally = kernel.tally.clone();
    (Engine::new(Arc::new(kernel), config), tally)
}

pub fn scripted_runner() -> (Runner, Tally) {
    let (engine, tally) = scripted_engine(KernelConfig::default());
    (Runner::new(engine), tally)
}

/// `{inputs: {foo: string, bar: int, baz: string}, output: list<map<string,string>>}`
pub fn io_contract() -> Contract {
    Contract::new(
        "io_contract_example",
        [
            ("foo", FieldType::String),
            ("bar", FieldType::Int),
            ("baz", FieldType::String),
        ],
        FieldType::list(FieldType::map(FieldType::String)),
    )
    .unwrap()
}

pub fn inputs(value: Value) -> Map<String, Value> {
    value.as_object().cloned().expect("inputs must be an object")
}

/// Doc unit, parameters, then `body` as individual code units.
pub fn template(body: &[&str]) -> Notebook {
    let mut units = vec![
        Unit::doc("# Example"),
        Unit::code("# defaults\n").with_tag("parameters"),
    ];
    units.extend(body.iter().map(|code| Unit::code(*code)));
    Notebook::new(units)
}
