//! Match criteria: comparison trees over parameter and argument values.

use crate::types::{ArgumentAssignment, Value};
use crate::{Result, VerifyError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOperator {
    #[serde(rename = "==")]
    Equality,
    #[serde(rename = "!=")]
    Inequality,
    #[serde(rename = ">")]
    LargerThan,
    #[serde(rename = ">=")]
    LargerOrEqualThan,
    #[serde(rename = "<")]
    SmallerThan,
    #[serde(rename = "<=")]
    SmallerOrEqualThan,
}

impl ComparisonOperator {
    fn accepts(self, ordering: Ordering) -> bool {
        match self {
            Self::Equality => ordering == Ordering::Equal,
            Self::Inequality => ordering != Ordering::Equal,
            Self::LargerThan => ordering == Ordering::Greater,
            Self::LargerOrEqualThan => ordering != Ordering::Less,
            Self::SmallerThan => ordering == Ordering::Less,
            Self::SmallerOrEqualThan => ordering != Ordering::Greater,
        }
    }
}

impl fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Self::Equality => "==",
            Self::Inequality => "!=",
            Self::LargerThan => ">",
            Self::LargerOrEqualThan => ">=",
            Self::SmallerThan => "<",
            Self::SmallerOrEqualThan => "<=",
        };
        f.write_str(symbol)
    }
}

/// Left-hand side of a comparison
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    /// Fully qualified parameter name, including command pseudo-parameters
    Parameter(String),
    /// Name of a command argument
    Argument(String),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Parameter(name) => f.write_str(name),
            Operand::Argument(name) => write!(f, "argument {name}"),
        }
    }
}

/// A single `operand <op> value` test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    #[serde(flatten)]
    pub operand: Operand,
    pub operator: ComparisonOperator,
    pub value: Value,
}

impl Comparison {
    pub fn parameter(name: impl Into<String>, operator: ComparisonOperator, value: impl Into<Value>) -> Self {
        Self {
            operand: Operand::Parameter(name.into()),
            operator,
            value: value.into(),
        }
    }

    pub fn argument(name: impl Into<String>, operator: ComparisonOperator, value: impl Into<Value>) -> Self {
        Self {
            operand: Operand::Argument(name.into()),
            operator,
            value: value.into(),
        }
    }

    fn evaluate(&self, parameters: &HashMap<String, Value>, arguments: &ArgumentAssignment) -> Result<bool> {
        let current = match &self.operand {
            Operand::Parameter(name) => parameters.get(name),
            Operand::Argument(name) => arguments.get(name),
        };
        // an operand without a value yet cannot match
        let Some(current) = current else {
            return Ok(false);
        };
        let ordering = current.try_compare(&self.value).ok_or_else(|| {
            VerifyError::Evaluation(format!(
                "Cannot compare {} value {} with {} {}",
                self.operand,
                current.type_name(),
                self.value.type_name(),
                self.value
            ))
        })?;
        Ok(self.operator.accepts(ordering))
    }
}

/// Boolean tree of comparisons
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchCriteria {
    Comparison(Comparison),
    And(Vec<MatchCriteria>),
    Or(Vec<MatchCriteria>),
}

impl MatchCriteria {
    /// Evaluate against the latest known values.
    ///
    /// Missing operands make their comparison false. Operands of incompatible
    /// types are an error.
    pub fn evaluate(&self, parameters: &HashMap<String, Value>, arguments: &ArgumentAssignment) -> Result<bool> {
        match self {
            MatchCriteria::Comparison(comparison) => comparison.evaluate(parameters, arguments),
            MatchCriteria::And(items) => {
                for item in items {
                    if !item.evaluate(parameters, arguments)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            MatchCriteria::Or(items) => {
                for item in items {
                    if item.evaluate(parameters, arguments)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    /// Every parameter named anywhere in the tree
    pub fn referenced_parameters(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.collect_parameters(&mut names);
        names
    }

    fn collect_parameters(&self, names: &mut BTreeSet<String>) {
        match self {
            MatchCriteria::Comparison(Comparison {
                operand: Operand::Parameter(name),
                ..
            }) => {
                names.insert(name.clone());
            }
            MatchCriteria::Comparison(_) => {}
            MatchCriteria::And(items) | MatchCriteria::Or(items) => {
                items.iter().for_each(|item| item.collect_parameters(names))
            }
        }
    }
}

impl From<Comparison> for MatchCriteria {
    fn from(comparison: Comparison) -> Self {
        MatchCriteria::Comparison(comparison)
    }
}
