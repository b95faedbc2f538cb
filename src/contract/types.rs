//! Declared field types and their text form.
//!
//! Grammar:
//!
//! ```text
//! type   := "string" | "int" | "float" | "bool" | "any"
//!         | "list" "<" type ">"
//!         | "map" "<" "string" "," type ">"
//!         | "optional" "<" type ">"
//!         | "{" [ ident ":" type { "," ident ":" type } ] "}"
//! ```
//!
//! `integer`, `number` and `boolean` are accepted as aliases.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ContractError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Any,
    List(Box<FieldType>),
    /// Object with string keys and homogeneous values.
    Map(Box<FieldType>),
    Optional(Box<FieldType>),
    /// Object with a fixed, ordered set of keys.
    Record(Vec<(String, FieldType)>),
}

impl FieldType {
    pub fn list(inner: FieldType) -> Self {
        FieldType::List(Box::new(inner))
    }

    pub fn map(inner: FieldType) -> Self {
        FieldType::Map(Box::new(inner))
    }

    pub fn optional(inner: FieldType) -> Self {
        FieldType::Optional(Box::new(inner))
    }

    /// Strict structural check. `path` names the value in error messages.
    pub fn check(&self, value: &Value, path: &str) -> Result<(), ContractError> {
        match (self, value) {
            (FieldType::Any, _) => Ok(()),
            (FieldType::String, Value::String(_)) => Ok(()),
            (FieldType::Int, Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(()),
            (FieldType::Float, Value::Number(_)) => Ok(()),
            (FieldType::Bool, Value::Bool(_)) => Ok(()),
            (FieldType::Optional(_), Value::Null) => Ok(()),
            (FieldType::Optional(inner), v) => inner.check(v, path),
            (FieldType::List(inner), Value::Array(items)) => {
                for (i, item) in items.iter().enumerate() {
                    inner.check(item, &format!("{}[{}]", path, i))?;
                }
                Ok(())
            }
            (FieldType::Map(inner), Value::Object(obj)) => {
                for (k, v) in obj {
                    inner.check(v, &join_path(path, k))?;
                }
                Ok(())
            }
            (FieldType::Record(fields), Value::Object(obj)) => {
                for (name, ty) in fields {
                    let child = join_path(path, name);
                    match obj.get(name) {
                        Some(v) => ty.check(v, &child)?,
                        None if matches!(ty, FieldType::Optional(_)) => {}
                        None => return Err(mismatch(&child, ty, None)),
                    }
                }
                if let Some(extra) = obj.keys().find(|k| !fields.iter().any(|(n, _)| n == *k)) {
                    return Err(ContractError::TypeMismatch {
                        path: join_path(path, extra),
                        expected: "no such key".into(),
                        found: "unexpected key".into(),
                    });
                }
                Ok(())
            }
            (ty, v) => Err(mismatch(path, ty, Some(v))),
        }
    }

    /// Lossless widening toward this type: numbers and booleans where a string
    /// is declared become their text form. Everything else is returned as is,
    /// so `check` still has the final word.
    pub fn conform(&self, value: Value) -> Value {
        match (self, value) {
            (FieldType::String, Value::Number(n)) => Value::String(n.to_string()),
            (FieldType::String, Value::Bool(b)) => Value::String(b.to_string()),
            (FieldType::Optional(_), Value::Null) => Value::Null,
            (FieldType::Optional(inner), v) => inner.conform(v),
            (FieldType::List(inner), Value::Array(items)) => {
                Value::Array(items.into_iter().map(|v| inner.conform(v)).collect())
            }
            (FieldType::Map(inner), Value::Object(obj)) => Value::Object(
                obj.into_iter()
                    .map(|(k, v)| (k, inner.conform(v)))
                    .collect(),
            ),
            (FieldType::Record(fields), Value::Object(obj)) => Value::Object(
                obj.into_iter()
                    .map(|(k, v)| {
                        let v = match fields.iter().find(|(n, _)| *n == k) {
                            Some((_, ty)) => ty.conform(v),
                            None => v,
                        };
                        (k, v)
                    })
                    .collect(),
            ),
            (_, v) => v,
        }
    }

    pub fn is_textual(&self) -> bool {
        match self {
            FieldType::String | FieldType::Any => true,
            FieldType::Optional(inner) => inner.is_textual(),
            _ => false,
        }
    }
}

fn join_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", parent, key)
    }
}

fn mismatch(path: &str, expected: &FieldType, found: Option<&Value>) -> ContractError {
    ContractError::TypeMismatch {
        path: if path.is_empty() { "$".into() } else { path.to_string() },
        expected: expected.to_string(),
        found: found.map(describe).unwrap_or("nothing").to_string(),
    }
}

/// Short JSON kind name for error messages.
pub fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::String => f.write_str("string"),
            FieldType::Int => f.write_str("int"),
            FieldType::Float => f.write_str("float"),
            FieldType::Bool => f.write_str("bool"),
            FieldType::Any => f.write_str("any"),
            FieldType::List(inner) => write!(f, "list<{}>", inner),
            FieldType::Map(inner) => write!(f, "map<string,{}>", inner),
            FieldType::Optional(inner) => write!(f, "optional<{}>", inner),
            FieldType::Record(fields) => {
                f.write_str("{")?;
                for (i, (name, ty)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", name, ty)?;
                }
                f.write_str("}")
            }
        }
    }
}

impl FromStr for FieldType {
    type Err = ContractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parser = Parser {
            src: s,
            pos: 0,
            depth: 0,
        };
        let ty = parser.parse_type().map_err(|reason| invalid(s, reason))?;
        parser.skip_ws();
        if parser.pos != s.len() {
            return Err(invalid(
                s,
                format!("unexpected trailing input at offset {}", parser.pos),
            ));
        }
        Ok(ty)
    }
}

impl TryFrom<String> for FieldType {
    type Error = ContractError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FieldType> for String {
    fn from(value: FieldType) -> Self {
        value.to_string()
    }
}

fn invalid(expr: &str, reason: String) -> ContractError {
    ContractError::InvalidType {
        expr: expr.to_string(),
        reason,
    }
}

/// Deepest nesting a type expression may use.
const MAX_TYPE_DEPTH: usize = 64;

struct Parser<'a> {
    src: &'a str,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn skip_ws(&mut self) {
        let rest = &self.src[self.pos..];
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_ws();
        self.src[self.pos..].chars().next()
    }

    fn expect(&mut self, c: char) -> Result<(), String> {
        match self.peek() {
            Some(found) if found == c => {
                self.pos += c.len_utf8();
                Ok(())
            }
            Some(found) => Err(format!(
                "expected `{}` at offset {}, found `{}`",
                c, self.pos, found
            )),
            None => Err(format!("expected `{}`, found end of input", c)),
        }
    }

    fn ident(&mut self) -> Result<&'a str, String> {
        self.skip_ws();
        let src = self.src;
        let rest = &src[self.pos..];
        let len = rest
            .char_indices()
            .find(|(_, c)| !(c.is_alphanumeric() || *c == '_'))
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        if len == 0 {
            return Err(format!("expected a name at offset {}", self.pos));
        }
        self.pos += len;
        Ok(&rest[..len])
    }

    fn parse_type(&mut self) -> Result<FieldType, String> {
        if self.depth == MAX_TYPE_DEPTH {
            return Err(format!("type nested deeper than {} levels", MAX_TYPE_DEPTH));
        }
        self.depth += 1;
        let ty = self.parse_nested();
        self.depth -= 1;
        ty
    }

    fn parse_nested(&mut self) -> Result<FieldType, String> {
        if self.peek() == Some('{') {
            return self.parse_record();
        }
        let name = self.ident()?;
        match name {
            "string" | "str" => Ok(FieldType::String),
            "int" | "integer" => Ok(FieldType::Int),
            "float" | "number" => Ok(FieldType::Float),
            "bool" | "boolean" => Ok(FieldType::Bool),
            "any" => Ok(FieldType::Any),
            "list" => {
                self.expect('<')?;
                let inner = self.parse_type()?;
                self.expect('>')?;
                Ok(FieldType::list(inner))
            }
            "optional" => {
                self.expect('<')?;
                let inner = self.parse_type()?;
                self.expect('>')?;
                Ok(FieldType::optional(inner))
            }
            "map" => {
                self.expect('<')?;
                let key = self.parse_type()?;
                if key != FieldType::String {
                    return Err(format!("map keys must be string, found {}", key));
                }
                self.expect(',')?;
                let inner = self.parse_type()?;
                self.expect('>')?;
                Ok(FieldType::map(inner))
            }
            other => Err(format!("unknown type `{}`", other)),
        }
    }

    fn parse_record(&mut self) -> Result<FieldType, String> {
        self.expect('{')?;
        let mut fields: Vec<(String, FieldType)> = Vec::new();
        if self.peek() == Some('}') {
            self.pos += 1;
            return Ok(FieldType::Record(fields));
        }
        loop {
            let name = self.ident()?.to_string();
            if fields.iter().any(|(n, _)| *n == name) {
                return Err(format!("record key `{}` repeated", name));
            }
            self.expect(':')?;
            let ty = self.parse_type()?;
            fields.push((name, ty));
            match self.peek() {
                Some(',') => self.pos += 1,
                Some('}') => {
                    self.pos += 1;
                    return Ok(FieldType::Record(fields));
                }
                Some(c) => return Err(format!("expected `,` or `}}`, found `{}`", c)),
                None => return Err("unterminated record".to_string()),
            }
        }
    }
}
