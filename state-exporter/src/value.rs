use std::fmt;

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    String,
    Integer,
    Float,
    Boolean,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::String => "STRING",
            ValueType::Integer => "INTEGER",
            ValueType::Float => "FLOAT",
            ValueType::Boolean => "BOOLEAN",
        };
        f.write_str(name)
    }
}

/// Typed state value as written to the destination.
#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
}

impl StateValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            StateValue::String(_) => ValueType::String,
            StateValue::Integer(_) => ValueType::Integer,
            StateValue::Float(_) => ValueType::Float,
            StateValue::Boolean(_) => ValueType::Boolean,
        }
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::String(value) => f.write_str(value),
            StateValue::Integer(value) => write!(f, "{value}"),
            StateValue::Float(value) => write!(f, "{value}"),
            StateValue::Boolean(value) => write!(f, "{value}"),
        }
    }
}

/// Converts raw textual states into typed values, one policy per type.
#[derive(Debug, Clone, Copy, Default)]
pub struct StateValueConverter;

impl StateValueConverter {
    pub fn convert(&self, raw: &str, value_type: ValueType) -> Option<StateValue> {
        match value_type {
            ValueType::String => Some(StateValue::String(raw.to_owned())),
            ValueType::Integer => raw.parse::<i64>().ok().map(StateValue::Integer),
            ValueType::Float => raw
                .parse::<f64>()
                .ok()
                .filter(|value| value.is_finite())
                .map(StateValue::Float),
            ValueType::Boolean => Self::to_boolean(raw).map(StateValue::Boolean),
        }
    }

    fn to_boolean(raw: &str) -> Option<bool> {
        match raw.trim().to_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            other => other.parse::<f64>().ok().map(|number| number > 0.0),
        }
    }
}
