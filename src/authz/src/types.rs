//! Core ABAC types

use crate::error::AbacError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Unique policy identifier
pub type PolicyId = String;

/// Attribute type code, the key rules refer to
pub type AttributeCode = String;

/// Resolved, typed attribute values keyed by attribute code
pub type AttributeMap = BTreeMap<AttributeCode, AttributeValue>;

/// Raw request context for one category
pub type RawAttributes = BTreeMap<String, Value>;

/// Raw action key carrying the action name
pub const ACTION_KEY: &str = "action";

/// Raw resource key carrying the resource type
pub const RESOURCE_TYPE_KEY: &str = "resource_type";

/// Raw resource key carrying the resource identifier
pub const RESOURCE_ID_KEY: &str = "resource_id";

/// Attribute category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeCategory {
    Subject,
    Resource,
    Action,
    Environment,
}

impl AttributeCategory {
    /// All categories, in resolution order
    pub const ALL: [AttributeCategory; 4] = [
        AttributeCategory::Subject,
        AttributeCategory::Resource,
        AttributeCategory::Action,
        AttributeCategory::Environment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subject => "subject",
            Self::Resource => "resource",
            Self::Action => "action",
            Self::Environment => "environment",
        }
    }
}

impl fmt::Display for AttributeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttributeCategory {
    type Err = AbacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "subject" | "user" => Ok(Self::Subject),
            "resource" => Ok(Self::Resource),
            "action" => Ok(Self::Action),
            "environment" | "env" => Ok(Self::Environment),
            other => Err(AbacError::InvalidInput(format!(
                "unknown attribute category '{}'",
                other
            ))),
        }
    }
}

/// Declared value kind of an attribute type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    String,
    Number,
    Boolean,
    Set,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Set => "set",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValueKind {
    type Err = AbacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "string" | "str" | "text" => Ok(Self::String),
            "number" | "integer" | "float" | "decimal" => Ok(Self::Number),
            "boolean" | "bool" => Ok(Self::Boolean),
            "set" | "list" | "array" => Ok(Self::Set),
            other => Err(AbacError::InvalidInput(format!(
                "unknown value kind '{}'",
                other
            ))),
        }
    }
}

/// Typed attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Boolean(bool),
    Number(f64),
    String(String),
    Set(BTreeSet<String>),
}

impl AttributeValue {
    /// Coerce a raw JSON value to the given kind
    ///
    /// Returns a human-readable diagnostic on failure.
    pub fn coerce(raw: &Value, kind: ValueKind) -> Result<Self, String> {
        match kind {
            ValueKind::String => match raw {
                Value::String(s) => Ok(Self::String(s.clone())),
                Value::Number(n) => Ok(Self::String(n.to_string())),
                Value::Bool(b) => Ok(Self::String(b.to_string())),
                other => Err(format!("expected string, got {}", json_type(other))),
            },
            ValueKind::Number => {
                let number = match raw {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.trim().parse::<f64>().ok(),
                    other => {
                        return Err(format!("expected number, got {}", json_type(other)));
                    }
                };
                number
                    .filter(|n| n.is_finite())
                    .map(Self::Number)
                    .ok_or_else(|| format!("'{}' is not a finite number", raw))
            }
            ValueKind::Boolean => match raw {
                Value::Bool(b) => Ok(Self::Boolean(*b)),
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" | "yes" => Ok(Self::Boolean(true)),
                    "false" | "0" | "no" => Ok(Self::Boolean(false)),
                    _ => Err(format!("'{}' is not a boolean", s)),
                },
                Value::Number(n) => match n.as_f64() {
                    Some(v) if v == 1.0 => Ok(Self::Boolean(true)),
                    Some(v) if v == 0.0 => Ok(Self::Boolean(false)),
                    _ => Err(format!("'{}' is not a boolean", n)),
                },
                other => Err(format!("expected boolean, got {}", json_type(other))),
            },
            ValueKind::Set => match raw {
                Value::Array(items) => items
                    .iter()
                    .map(scalar_to_string)
                    .collect::<Result<BTreeSet<_>, _>>()
                    .map(Self::Set),
                Value::String(s) => Ok(Self::Set(
                    s.split(',')
                        .map(str::trim)
                        .filter(|part| !part.is_empty())
                        .map(String::from)
                        .collect(),
                )),
                other => Err(format!("expected set, got {}", json_type(other))),
            },
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Boolean(_) => ValueKind::Boolean,
            Self::Number(_) => ValueKind::Number,
            Self::String(_) => ValueKind::String,
            Self::Set(_) => ValueKind::Set,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&BTreeSet<String>> {
        match self {
            Self::Set(items) => Some(items),
            _ => None,
        }
    }

    /// Convert back to JSON for audit snapshots and API responses
    pub fn to_json(&self) -> Value {
        match self {
            Self::Boolean(b) => Value::Bool(*b),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::String(s) => Value::String(s.clone()),
            Self::Set(items) => Value::Array(items.iter().cloned().map(Value::String).collect()),
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean(b) => write!(f, "{}", b),
            Self::Number(n) => write!(f, "{}", n),
            Self::String(s) => write!(f, "\"{}\"", s),
            Self::Set(items) => {
                let joined: Vec<&str> = items.iter().map(String::as_str).collect();
                write!(f, "[{}]", joined.join(", "))
            }
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

fn scalar_to_string(value: &Value) -> Result<String, String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(format!("set elements must be scalars, got {}", json_type(other))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A named, typed dimension usable in rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeType {
    /// Catalog identifier
    pub id: String,

    /// Immutable code referenced by rules (e.g., "department")
    pub code: AttributeCode,

    /// Category the value is resolved from
    pub category: AttributeCategory,

    /// Display name
    pub name: String,

    /// Declared value kind; resolved values are coerced to it
    pub value_kind: ValueKind,

    /// Optional whitelist of permitted values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_values: Option<Vec<AttributeValue>>,

    /// Inactive types keep their history but cannot be referenced
    pub is_active: bool,

    /// Raw context key the value is read from (defaults to `code`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_key: Option<String>,

    /// Redact the value in audit snapshots
    #[serde(default)]
    pub sensitive: bool,
}

impl AttributeType {
    /// Raw context key for this attribute
    pub fn source_key(&self) -> &str {
        self.source_key.as_deref().unwrap_or(&self.code)
    }

    /// Whether a resolved value is permitted by `allowed_values`
    pub fn permits(&self, value: &AttributeValue) -> bool {
        match &self.allowed_values {
            None => true,
            Some(allowed) => match value {
                AttributeValue::Set(items) => items
                    .iter()
                    .all(|item| allowed.contains(&AttributeValue::String(item.clone()))),
                scalar => allowed.contains(scalar),
            },
        }
    }
}

/// Raw access request, as supplied by the caller before attribute mapping
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessRequest {
    /// Subject attributes (who)
    #[serde(default)]
    pub subject: RawAttributes,

    /// Resource attributes (what)
    #[serde(default)]
    pub resource: RawAttributes,

    /// Action attributes (how)
    #[serde(default)]
    pub action: RawAttributes,

    /// Environment attributes (when / where)
    #[serde(default)]
    pub environment: RawAttributes,
}

impl AccessRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subject attribute
    pub fn with_subject(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.subject.insert(key.into(), value.into());
        self
    }

    /// Add a resource attribute
    pub fn with_resource(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.resource.insert(key.into(), value.into());
        self
    }

    /// Set the action name
    pub fn with_action(mut self, name: impl Into<String>) -> Self {
        self.action
            .insert(ACTION_KEY.to_string(), Value::String(name.into()));
        self
    }

    /// Add an action attribute
    pub fn with_action_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.action.insert(key.into(), value.into());
        self
    }

    /// Add an environment attribute
    pub fn with_environment(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Raw attributes of one category
    pub fn category(&self, category: AttributeCategory) -> &RawAttributes {
        match category {
            AttributeCategory::Subject => &self.subject,
            AttributeCategory::Resource => &self.resource,
            AttributeCategory::Action => &self.action,
            AttributeCategory::Environment => &self.environment,
        }
    }

    /// Action name, if supplied
    pub fn action_name(&self) -> Option<&str> {
        self.action.get(ACTION_KEY).and_then(Value::as_str)
    }

    /// Resource type, if supplied
    pub fn resource_type(&self) -> Option<&str> {
        self.resource.get(RESOURCE_TYPE_KEY).and_then(Value::as_str)
    }

    /// Resource identifier, if supplied
    pub fn resource_id(&self) -> Option<String> {
        self.resource.get(RESOURCE_ID_KEY).and_then(scalar_id)
    }

    /// Subject identifier (`id`, falling back to `user_id`)
    pub fn subject_id(&self) -> Option<String> {
        self.subject
            .get("id")
            .or_else(|| self.subject.get("user_id"))
            .and_then(scalar_id)
    }

    /// Stable fingerprint of the request (BLAKE3 over canonical JSON)
    ///
    /// All maps are `BTreeMap`s, so the serialized form is key-sorted and two
    /// equal requests always produce the same fingerprint.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        blake3::hash(&canonical).to_hex().to_string()
    }
}

fn scalar_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
