//! Rule evaluation
//!
//! A rule is one attribute comparison: an attribute code, an operator and an
//! expected value. Expected values are coerced and regex patterns compiled
//! once, when the catalog is loaded. Evaluation never fails: any problem makes
//! the rule non-matching and is reported as a diagnostic.

use crate::error::AbacError;
use crate::types::{AttributeCode, AttributeMap, AttributeType, AttributeValue, PolicyId, ValueKind};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
    NotContains,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::In => "in",
            Self::NotIn => "not_in",
            Self::Contains => "contains",
            Self::StartsWith => "starts_with",
            Self::EndsWith => "ends_with",
            Self::Regex => "regex",
            Self::NotContains => "not_contains",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = AbacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "eq" | "equals" | "==" => Ok(Self::Eq),
            "neq" | "ne" | "not_equals" | "!=" => Ok(Self::Neq),
            "gt" | ">" => Ok(Self::Gt),
            "gte" | ">=" => Ok(Self::Gte),
            "lt" | "<" => Ok(Self::Lt),
            "lte" | "<=" => Ok(Self::Lte),
            "in" => Ok(Self::In),
            "not_in" => Ok(Self::NotIn),
            "contains" => Ok(Self::Contains),
            "starts_with" => Ok(Self::StartsWith),
            "ends_with" => Ok(Self::EndsWith),
            "regex" | "matches" => Ok(Self::Regex),
            "not_contains" => Ok(Self::NotContains),
            other => Err(AbacError::InvalidInput(format!("unknown operator '{}'", other))),
        }
    }
}

/// Expected value, prepared for its operator
#[derive(Debug, Clone)]
pub enum Expected {
    /// Single value coerced to the attribute's kind
    Scalar(AttributeValue),

    /// Membership set for `in` / `not_in`
    Set(Vec<AttributeValue>),

    /// Substring needle for the string operators
    Text(String),

    /// Compiled pattern for `regex`
    Pattern(Regex),

    /// Pattern that failed to compile; the rule always evaluates `false`
    InvalidPattern { pattern: String, error: String },
}

/// A compiled rule inside a policy
#[derive(Debug, Clone)]
pub struct PolicyRule {
    /// Rule identifier
    pub id: String,

    /// Owning policy
    pub policy_id: PolicyId,

    /// Attribute the rule compares
    pub attribute_code: AttributeCode,

    /// Comparison operator
    pub operator: Operator,

    /// Prepared expected value
    pub expected: Expected,

    /// Invert the operator result
    pub negate: bool,
}

/// Result of evaluating one rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleOutcome {
    pub rule_id: String,
    pub attribute_code: AttributeCode,
    pub operator: Operator,
    pub matched: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

impl PolicyRule {
    /// Compile a rule against the attribute type it references
    ///
    /// Fails with a configuration error when the expected value cannot be
    /// prepared for the operator. An uncompilable regex is *not* an error
    /// here: it yields [`Expected::InvalidPattern`] and the catalog decides
    /// what to do with the owning policy.
    pub fn compile(
        id: impl Into<String>,
        policy_id: impl Into<PolicyId>,
        attribute: &AttributeType,
        operator: Operator,
        expected: &Value,
        negate: bool,
    ) -> crate::error::Result<Self> {
        let id = id.into();
        let expected = prepare_expected(attribute, operator, expected)
            .map_err(|message| AbacError::configuration(format!("rule '{}'", id), message))?;

        Ok(Self {
            id,
            policy_id: policy_id.into(),
            attribute_code: attribute.code.clone(),
            operator,
            expected,
            negate,
        })
    }

    /// Whether the rule can never match because its pattern is invalid
    pub fn invalid_pattern(&self) -> Option<&str> {
        match &self.expected {
            Expected::InvalidPattern { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Evaluate the rule against resolved attributes
    ///
    /// A missing attribute makes the rule `false` whatever the operator and
    /// `negate` flag are.
    pub fn evaluate(&self, attributes: &AttributeMap) -> RuleOutcome {
        let Some(actual) = attributes.get(&self.attribute_code) else {
            return self.outcome(
                false,
                Some(format!("attribute '{}' not resolved", self.attribute_code)),
            );
        };

        match self.apply(actual) {
            Ok(result) => self.outcome(result != self.negate, None),
            Err(diagnostic) => {
                debug!(
                    "Rule {} ({} {}) failed closed: {}",
                    self.id, self.attribute_code, self.operator, diagnostic
                );
                self.outcome(false, Some(diagnostic))
            }
        }
    }

    fn outcome(&self, matched: bool, diagnostic: Option<String>) -> RuleOutcome {
        RuleOutcome {
            rule_id: self.id.clone(),
            attribute_code: self.attribute_code.clone(),
            operator: self.operator,
            matched,
            diagnostic,
        }
    }

    fn apply(&self, actual: &AttributeValue) -> Result<bool, String> {
        match (self.operator, &self.expected) {
            (Operator::Eq, Expected::Scalar(expected)) => Ok(actual == expected),
            (Operator::Neq, Expected::Scalar(expected)) => Ok(actual != expected),
            (
                Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte,
                Expected::Scalar(expected),
            ) => {
                let (Some(lhs), Some(rhs)) = (actual.as_number(), expected.as_number()) else {
                    return Err(format!(
                        "operator {} needs numeric operands, got {} and {}",
                        self.operator, actual, expected
                    ));
                };
                Ok(match self.operator {
                    Operator::Gt => lhs > rhs,
                    Operator::Gte => lhs >= rhs,
                    Operator::Lt => lhs < rhs,
                    _ => lhs <= rhs,
                })
            }
            (Operator::In, Expected::Set(members)) => Ok(is_member(actual, members)),
            (Operator::NotIn, Expected::Set(members)) => Ok(!is_member(actual, members)),
            (Operator::Contains, Expected::Text(needle)) => contains(actual, needle),
            (Operator::NotContains, Expected::Text(needle)) => {
                contains(actual, needle).map(|found| !found)
            }
            (Operator::StartsWith, Expected::Text(prefix)) => {
                text_operand(actual, self.operator).map(|s| s.starts_with(prefix.as_str()))
            }
            (Operator::EndsWith, Expected::Text(suffix)) => {
                text_operand(actual, self.operator).map(|s| s.ends_with(suffix.as_str()))
            }
            (Operator::Regex, Expected::Pattern(pattern)) => {
                text_operand(actual, self.operator).map(|s| pattern.is_match(s))
            }
            (Operator::Regex, Expected::InvalidPattern { pattern, error }) => {
                Err(format!("invalid pattern '{}': {}", pattern, error))
            }
            (operator, _) => Err(format!(
                "operator {} has an incompatible expected value",
                operator
            )),
        }
    }
}

fn is_member(actual: &AttributeValue, members: &[AttributeValue]) -> bool {
    match actual {
        AttributeValue::Set(items) => items
            .iter()
            .any(|item| members.contains(&AttributeValue::String(item.clone()))),
        scalar => members.contains(scalar),
    }
}

fn contains(actual: &AttributeValue, needle: &str) -> Result<bool, String> {
    match actual {
        AttributeValue::String(s) => Ok(s.contains(needle)),
        AttributeValue::Set(items) => Ok(items.contains(needle)),
        other => Err(format!("contains needs a string or set operand, got {}", other)),
    }
}

fn text_operand(actual: &AttributeValue, operator: Operator) -> Result<&str, String> {
    actual
        .as_str()
        .ok_or_else(|| format!("operator {} needs a string operand, got {}", operator, actual))
}

fn prepare_expected(
    attribute: &AttributeType,
    operator: Operator,
    raw: &Value,
) -> Result<Expected, String> {
    match operator {
        Operator::Eq | Operator::Neq => {
            AttributeValue::coerce(raw, attribute.value_kind).map(Expected::Scalar)
        }
        Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
            // Non-numeric expectations are kept and fail closed at evaluation time
            let value = AttributeValue::coerce(raw, ValueKind::Number)
                .or_else(|_| AttributeValue::coerce(raw, ValueKind::String))?;
            Ok(Expected::Scalar(value))
        }
        Operator::In | Operator::NotIn => {
            let element_kind = match attribute.value_kind {
                ValueKind::Set => ValueKind::String,
                scalar => scalar,
            };
            let items: Vec<Value> = match raw {
                Value::Array(items) => items.clone(),
                Value::String(s) => s
                    .split(',')
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
                other => return Err(format!("operator {} needs a set, got {}", operator, other)),
            };
            items
                .iter()
                .map(|item| AttributeValue::coerce(item, element_kind))
                .collect::<Result<Vec<_>, _>>()
                .map(Expected::Set)
        }
        Operator::Contains | Operator::NotContains | Operator::StartsWith | Operator::EndsWith => {
            match AttributeValue::coerce(raw, ValueKind::String)? {
                AttributeValue::String(text) => Ok(Expected::Text(text)),
                other => Err(format!("operator {} needs text, got {}", operator, other)),
            }
        }
        Operator::Regex => {
            let pattern = raw
                .as_str()
                .ok_or_else(|| format!("regex pattern must be a string, got {}", raw))?;
            Ok(match Regex::new(pattern) {
                Ok(compiled) => Expected::Pattern(compiled),
                Err(err) => Expected::InvalidPattern {
                    pattern: pattern.to_string(),
                    error: err.to_string(),
                },
            })
        }
    }
}
