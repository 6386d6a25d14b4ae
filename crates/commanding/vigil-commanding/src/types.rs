//! Values, parameters and command identifiers exchanged with the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Identity of a single command instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandId {
    /// Fully qualified name of the meta-command
    pub command_name: String,
    /// Who released the command
    pub origin: String,
    /// Sequence number within the origin
    pub sequence_number: u32,
    /// Release time
    pub generation_time: DateTime<Utc>,
}

impl CommandId {
    /// Create a new command identifier
    pub fn new(
        command_name: impl Into<String>,
        origin: impl Into<String>,
        sequence_number: u32,
        generation_time: DateTime<Utc>,
    ) -> Self {
        Self {
            command_name: command_name.into(),
            origin: origin.into(),
            sequence_number,
            generation_time,
        }
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            self.command_name, self.origin, self.sequence_number
        )
    }
}

/// Handle returned by subscription services, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Engineering value of a parameter, argument or history attribute.
///
/// Deserializes untagged, so timestamps written in definition files arrive
/// as [`Value::String`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Binary(Vec<u8>),
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// Numeric view of the value, if it has one
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::UInt(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    /// Short type name used in diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::UInt(_) => "unsigned integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Binary(_) => "binary",
            Value::Timestamp(_) => "timestamp",
        }
    }

    /// Order two values. Numbers compare across integer and float types;
    /// anything else only compares with its own type.
    pub fn try_compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Binary(a), Value::Binary(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::UInt(a), Value::UInt(b)) => Some(a.cmp(b)),
            (a, b) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::UInt(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(v) => f.write_str(v),
            Value::Binary(v) => f.write_str(&hex::encode(v)),
            Value::Timestamp(v) => f.write_str(&v.to_rfc3339()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

/// Parameter definition from the mission database
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Parameter {
    /// Fully qualified name, e.g. `/sys/cmdHist/Acknowledge_Sent_Status`
    pub qualified_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Parameter {
    pub fn new(qualified_name: impl Into<String>) -> Self {
        Self {
            qualified_name: qualified_name.into(),
            description: None,
        }
    }

    /// Last path segment of the qualified name
    pub fn name(&self) -> &str {
        self.qualified_name
            .rsplit('/')
            .next()
            .unwrap_or(&self.qualified_name)
    }
}

/// Timestamped value of a parameter
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterValue {
    pub parameter: Arc<Parameter>,
    pub eng_value: Value,
    pub generation_time: DateTime<Utc>,
}

impl ParameterValue {
    pub fn new(parameter: Arc<Parameter>, eng_value: Value, generation_time: DateTime<Utc>) -> Self {
        Self {
            parameter,
            eng_value,
            generation_time,
        }
    }

    pub fn qualified_name(&self) -> &str {
        &self.parameter.qualified_name
    }
}

/// Attribute attached to a command at preparation time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandHistoryAttribute {
    pub name: String,
    pub value: Value,
}

impl CommandHistoryAttribute {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Argument name to value, as assigned when the command was prepared
pub type ArgumentAssignment = BTreeMap<String, Value>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_comparison_across_types() {
        assert_eq!(
            Value::Int(5).try_compare(&Value::Float(5.0)),
            Some(Ordering::Equal)
        );
        assert_eq!(
            Value::UInt(7).try_compare(&Value::Int(-1)),
            Some(Ordering::Greater)
        );
        assert_eq!(Value::Float(f64::NAN).try_compare(&Value::Int(1)), None);
    }

    #[test]
    fn test_incompatible_types_do_not_compare() {
        assert_eq!(Value::from("ON").try_compare(&Value::Int(1)), None);
        assert_eq!(Value::Bool(true).try_compare(&Value::Int(1)), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Binary(vec![0xca, 0xfe]).to_string(), "cafe");
        assert_eq!(Value::from("NOMINAL").to_string(), "NOMINAL");
        assert_eq!(Value::Bool(false).to_string(), "false");
    }

    #[test]
    fn test_untagged_deserialization() {
        let values: Vec<Value> = serde_json::from_str(r#"[true, -3, 2.5, "SAFE"]"#).unwrap();
        assert_eq!(
            values,
            vec![
                Value::Bool(true),
                Value::Int(-3),
                Value::Float(2.5),
                Value::from("SAFE")
            ]
        );
    }

    #[test]
    fn test_parameter_name() {
        let p = Parameter::new("/sys/cmdHist/Acknowledge_Sent_Status");
        assert_eq!(p.name(), "Acknowledge_Sent_Status");
    }

    #[test]
    fn test_command_id_display() {
        let id = CommandId::new("/sc/PING", "ops", 3, Utc::now());
        assert_eq!(id.to_string(), "/sc/PING-ops-3");
    }
}
