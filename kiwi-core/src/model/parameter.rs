use serde::{Deserialize, Serialize};

use crate::atom::{self, Atom};
use crate::model::ModelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterType {
    Int,
    Float,
    String,
}

impl ParameterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterType::Int => "int",
            ParameterType::Float => "float",
            ParameterType::String => "string",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "int" => Some(ParameterType::Int),
            "float" => Some(ParameterType::Float),
            "string" => Some(ParameterType::String),
            _ => None,
        }
    }
}

/// Typed value of an attribute or parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    kind: ParameterType,
    value: Vec<Atom>,
}

impl Parameter {
    /// Validate `value` against `kind`. Numbers are coerced to the declared type.
    pub fn new(kind: ParameterType, value: Vec<Atom>) -> Result<Self, ModelError> {
        let coerced = match (kind, value.as_slice()) {
            (ParameterType::Int, [number]) if number.is_number() => Atom::Int(number.as_int()),
            (ParameterType::Float, [number]) if number.is_number() => {
                Atom::Float(number.as_float())
            }
            (ParameterType::String, [text @ Atom::String(_)]) => text.clone(),
            _ => {
                return Err(ModelError::InvalidParameter(format!(
                    "{} expected, got \"{}\"",
                    kind.as_str(),
                    atom::to_string(&value, true)
                )))
            }
        };
        Ok(Self {
            kind,
            value: vec![coerced],
        })
    }

    pub fn int(value: i64) -> Self {
        Self {
            kind: ParameterType::Int,
            value: vec![Atom::Int(value)],
        }
    }

    pub fn float(value: f64) -> Self {
        Self {
            kind: ParameterType::Float,
            value: vec![Atom::Float(value)],
        }
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self {
            kind: ParameterType::String,
            value: vec![Atom::String(value.into())],
        }
    }

    pub fn kind(&self) -> ParameterType {
        self.kind
    }

    pub fn value(&self) -> &[Atom] {
        &self.value
    }

    pub fn as_int(&self) -> i64 {
        self.value.first().map_or(0, Atom::as_int)
    }

    pub fn as_float(&self) -> f64 {
        self.value.first().map_or(0.0, Atom::as_float)
    }

    pub fn as_str(&self) -> &str {
        self.value.first().and_then(Atom::as_str).unwrap_or("")
    }
}
