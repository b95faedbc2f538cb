//! Parameter injection: rewrite the `parameters` unit with bound inputs.
//!
//! Injection is a pure transformation. It never executes code and never
//! touches a kernel, so failures here need no cleanup.

use serde_json::Value;

use crate::{
    contract::BoundInputs,
    error::InjectionError,
    notebook::{Notebook, Unit, UnitKind, INJECTED_TAG, PARAMETERS_TAG},
};

/// A template with its parameter unit materialized, ready for a kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableNotebook {
    units: Vec<Unit>,
    parameter_index: usize,
    kernel_name: Option<String>,
}

impl ExecutableNotebook {
    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn parameter_index(&self) -> usize {
        self.parameter_index
    }

    pub fn kernel_name(&self) -> Option<&str> {
        self.kernel_name.as_deref()
    }

    /// Code units with their positions in the full notebook.
    pub fn code_units(&self) -> impl Iterator<Item = (usize, &Unit)> {
        self.units.iter().enumerate().filter(|(_, u)| u.is_code())
    }

    /// Stable digest of every unit's kind and source.
    pub fn fingerprint(&self) -> String {
        let mut ctx = md5::Context::new();
        for unit in &self.units {
            let kind: &[u8] = match unit.kind {
                UnitKind::Code => b"code",
                UnitKind::Doc => b"doc",
            };
            ctx.consume(kind);
            ctx.consume([0u8]);
            ctx.consume(unit.source.as_bytes());
            ctx.consume([0u8]);
        }
        format!("{:x}", ctx.compute())
    }
}

pub fn inject(template: &Notebook, bound_inputs: &BoundInputs) -> Result<ExecutableNotebook, InjectionError> {
    let tagged = template.tagged(PARAMETERS_TAG);
    let &[parameter_index] = tagged.as_slice() else {
        return Err(InjectionError::AmbiguousOrMissingTarget {
            found: tagged.len(),
        });
    };

    let mut units = template.units.clone();
    let target = &mut units[parameter_index];
    target.kind = UnitKind::Code;
    target.source = render_parameters(bound_inputs);
    target.tags.insert(INJECTED_TAG.to_string());

    Ok(ExecutableNotebook {
        units,
        parameter_index,
        kernel_name: template.kernel_name.clone(),
    })
}

/// One `name = literal` line per input, in contract order.
pub fn render_parameters(bound_inputs: &BoundInputs) -> String {
    let mut out = String::from("# Parameters\n");
    for (name, value) in bound_inputs.iter() {
        out.push_str(name);
        out.push_str(" = ");
        write_literal(&mut out, value);
        out.push('\n');
    }
    out
}

/// Encode a JSON value as an equivalent Python literal.
pub fn python_literal(value: &Value) -> String {
    let mut out = String::new();
    write_literal(&mut out, value);
    out
}

fn write_literal(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("None"),
        Value::Bool(true) => out.push_str("True"),
        Value::Bool(false) => out.push_str("False"),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_literal(out, item);
            }
            out.push(']');
        }
        Value::Object(obj) => {
            out.push('{');
            for (i, (k, v)) in obj.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_string(out, k);
                out.push_str(": ");
                write_literal(out, v);
            }
            out.push('}');
        }
    }
}

fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 || c == '\u{7f}' => {
                out.push_str(&format!("\\x{:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}
