//! Input/output contracts: the only typed boundary around a notebook.

use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ContractError;

pub mod types;

pub use types::FieldType;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputField {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: FieldType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawContract")]
pub struct Contract {
    pub id: String,
    inputs: Vec<InputField>,
    output: FieldType,
    /// Let units that finish with warnings continue instead of halting the run.
    #[serde(default)]
    pub allow_warnings: bool,
}

#[derive(Deserialize)]
struct RawContract {
    id: String,
    #[serde(default)]
    inputs: Vec<InputField>,
    output: FieldType,
    #[serde(default)]
    allow_warnings: bool,
}

impl TryFrom<RawContract> for Contract {
    type Error = ContractError;

    fn try_from(raw: RawContract) -> Result<Self, Self::Error> {
        let mut contract = Contract::new(
            raw.id,
            raw.inputs.into_iter().map(|f| (f.name, f.ty)),
            raw.output,
        )?;
        contract.allow_warnings = raw.allow_warnings;
        Ok(contract)
    }
}

impl Contract {
    pub fn new<I, S>(id: impl Into<String>, inputs: I, output: FieldType) -> Result<Self, ContractError>
    where
        I: IntoIterator<Item = (S, FieldType)>,
        S: Into<String>,
    {
        let mut fields: Vec<InputField> = Vec::new();
        for (name, ty) in inputs {
            let name = name.into();
            if !is_identifier(&name) {
                return Err(ContractError::InvalidFieldName(name));
            }
            if fields.iter().any(|f| f.name == name) {
                return Err(ContractError::DuplicateField(name));
            }
            fields.push(InputField { name, ty });
        }
        Ok(Self {
            id: id.into(),
            inputs: fields,
            output,
            allow_warnings: false,
        })
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let contract: Contract = serde_json::from_str(text).context("parsing contract")?;
        Ok(contract)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading contract file: {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("in {}", path.display()))
    }

    pub fn inputs(&self) -> &[InputField] {
        &self.inputs
    }

    pub fn output(&self) -> &FieldType {
        &self.output
    }

    pub fn input_type(&self, name: &str) -> Option<&FieldType> {
        self.inputs.iter().find(|f| f.name == name).map(|f| &f.ty)
    }
}

/// Checked input values, in contract field order.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundInputs {
    values: Vec<(String, Value)>,
}

impl BoundInputs {
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn to_map(&self) -> Map<String, Value> {
        self.values.iter().cloned().collect()
    }
}

/// Check `raw_inputs` against the contract's declared fields: missing fields
/// first (in contract order), then unknown keys, then each value's type.
pub fn validate_inputs(
    contract: &Contract,
    raw_inputs: &Map<String, Value>,
) -> Result<BoundInputs, ContractError> {
    if let Some(missing) = contract
        .inputs
        .iter()
        .find(|f| !raw_inputs.contains_key(&f.name))
    {
        return Err(ContractError::MissingField(missing.name.clone()));
    }
    if let Some(unknown) = raw_inputs
        .keys()
        .find(|k| contract.input_type(k).is_none())
    {
        return Err(ContractError::UnknownField(unknown.clone()));
    }

    let mut values = Vec::with_capacity(contract.inputs.len());
    for field in &contract.inputs {
        // presence checked above
        let Some(value) = raw_inputs.get(&field.name) else {
            return Err(ContractError::MissingField(field.name.clone()));
        };
        field.ty.check(value, &field.name)?;
        values.push((field.name.clone(), value.clone()));
    }
    Ok(BoundInputs { values })
}

/// Check an already-decoded output value against the declared output type.
pub fn validate_output(contract: &Contract, raw_value: &Value) -> Result<Value, ContractError> {
    contract.output.check(raw_value, "")?;
    Ok(raw_value.clone())
}

/// Python identifier rules, minus keywords the kernel would reject.
fn is_identifier(name: &str) -> bool {
    const KEYWORDS: &[&str] = &[
        "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
        "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
        "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise",
        "return", "try", "while", "with", "yield",
    ];
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_') && !KEYWORDS.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Contract {
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

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn binds_inputs_in_contract_order() {
        let bound = validate_inputs(&sample(), &obj(json!({"baz": "z", "foo": "f", "bar": 1}))).unwrap();
        let names: Vec<&str> = bound.iter().map(|(k, _)| k).collect();
        assert_eq!(names, ["foo", "bar", "baz"]);
    }

    #[test]
    fn missing_is_reported_before_unknown() {
        let err = validate_inputs(&sample(), &obj(json!({"foo": "f", "bar": 1, "qux": 2}))).unwrap_err();
        assert_eq!(err, ContractError::MissingField("baz".into()));
    }

    #[test]
    fn unknown_key_is_rejected() {
        let err = validate_inputs(
            &sample(),
            &obj(json!({"foo": "f", "bar": 1, "baz": "b", "qux": 2})),
        )
        .unwrap_err();
        assert_eq!(err, ContractError::UnknownField("qux".into()));
    }

    #[test]
    fn type_mismatch_names_the_field() {
        let err = validate_inputs(&sample(), &obj(json!({"foo": "f", "bar": "500", "baz": "b"}))).unwrap_err();
        assert_eq!(
            err,
            ContractError::TypeMismatch {
                path: "bar".into(),
                expected: "int".into(),
                found: "string".into(),
            }
        );
    }

    #[test]
    fn rejects_duplicate_and_invalid_names() {
        let err = Contract::new("c", [("a", FieldType::Int), ("a", FieldType::Int)], FieldType::Any).unwrap_err();
        assert_eq!(err, ContractError::DuplicateField("a".into()));
        let err = Contract::new("c", [("class", FieldType::Int)], FieldType::Any).unwrap_err();
        assert_eq!(err, ContractError::InvalidFieldName("class".into()));
        let err = Contract::new("c", [("1x", FieldType::Int)], FieldType::Any).unwrap_err();
        assert_eq!(err, ContractError::InvalidFieldName("1x".into()));
    }

    #[test]
    fn deserializes_from_json() {
        let c = Contract::from_json_str(
            r#"{
                "id": "example",
                "inputs": [
                    {"name": "foo", "type": "string"},
                    {"name": "bar", "type": "int"}
                ],
                "output": "list<map<string,string>>",
                "allow_warnings": true
            }"#,
        )
        .unwrap();
        assert_eq!(c.inputs().len(), 2);
        assert_eq!(c.input_type("bar"), Some(&FieldType::Int));
        assert!(c.allow_warnings);

        let dup = r#"{"id": "x", "inputs": [{"name": "a", "type": "int"}, {"name": "a", "type": "int"}], "output": "any"}"#;
        assert!(Contract::from_json_str(dup).is_err());
        let bad = r#"{"id": "x", "inputs": [{"name": "a", "type": "tuple"}], "output": "any"}"#;
        assert!(Contract::from_json_str(bad).is_err());
    }
}
