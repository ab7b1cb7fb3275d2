//! Policy definition and evaluation

use crate::error::{AbacError, Result};
use crate::rule::{PolicyRule, RuleOutcome};
use crate::types::{AccessRequest, AttributeCode, AttributeMap, AttributeValue, PolicyId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Policy effect
///
/// Serialized uppercase; deserialized with the same leniency as `FromStr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Effect {
    /// Allow the action
    Allow,
    /// Deny the action
    Deny,
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Allow => "ALLOW",
            Self::Deny => "DENY",
        })
    }
}

impl FromStr for Effect {
    type Err = AbacError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ALLOW" | "PERMIT" => Ok(Self::Allow),
            "DENY" => Ok(Self::Deny),
            other => Err(AbacError::InvalidInput(format!("unknown effect '{}'", other))),
        }
    }
}

impl<'de> Deserialize<'de> for Effect {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// How a policy combines its rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Combinator {
    /// Every rule must match
    And,
    /// At least one rule must match
    Or,
}

impl FromStr for Combinator {
    type Err = AbacError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AND" | "ALL" => Ok(Self::And),
            "OR" | "ANY" => Ok(Self::Or),
            other => Err(AbacError::InvalidInput(format!("unknown condition '{}'", other))),
        }
    }
}

/// Which requests a policy applies to
///
/// Empty fields match everything. A targeted field the request does not
/// carry makes the policy not applicable, except `resource_id`, which is only
/// compared when both sides have one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
}

impl PolicyTarget {
    /// Why the target excludes the request, or `None` when it applies
    pub fn mismatch(&self, request: &AccessRequest) -> Option<String> {
        if let Some(expected) = &self.resource_type {
            if request.resource_type() != Some(expected.as_str()) {
                return Some(format!("resource type is not '{}'", expected));
            }
        }

        if !self.actions.is_empty() {
            let applies = request
                .action_name()
                .is_some_and(|name| self.actions.iter().any(|a| a == name));
            if !applies {
                return Some(format!("action not in [{}]", self.actions.join(", ")));
            }
        }

        if let (Some(expected), Some(actual)) = (&self.resource_id, request.resource_id()) {
            if *expected != actual {
                return Some(format!("resource id is not '{}'", expected));
            }
        }

        None
    }
}

/// A direct grant of a policy to one subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectAssignment {
    pub subject_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
}

impl SubjectAssignment {
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.valid_from.map_or(true, |from| at >= from)
            && self.valid_until.map_or(true, |until| at <= until)
    }
}

/// A grant of a policy to every subject whose attribute equals `value`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupAssignment {
    /// Subject attribute defining the group (department, location, ...)
    pub attribute_code: AttributeCode,

    pub value: AttributeValue,
}

/// Subjects a policy is assigned to
///
/// An empty assignment leaves the policy open to every subject, with the
/// rules alone deciding. Otherwise the subject must hold a direct assignment
/// valid at evaluation time, or belong to one of the groups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyAssignment {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subjects: Vec<SubjectAssignment>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<GroupAssignment>,
}

impl PolicyAssignment {
    pub fn is_open(&self) -> bool {
        self.subjects.is_empty() && self.groups.is_empty()
    }

    /// Attribute codes needed to decide group membership
    pub fn group_attributes(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|group| group.attribute_code.as_str())
    }

    fn assigned_directly(&self, request: &AccessRequest, at: DateTime<Utc>) -> bool {
        let Some(subject_id) = request.subject_id() else {
            return false;
        };
        self.subjects
            .iter()
            .any(|a| a.subject_id == subject_id && a.is_valid_at(at))
    }

    fn assigned_by_group(&self, attributes: &AttributeMap) -> bool {
        self.groups
            .iter()
            .any(|group| attributes.get(&group.attribute_code) == Some(&group.value))
    }

    /// Why the subject is not assigned, or `None` when it is
    pub fn mismatch(
        &self,
        request: &AccessRequest,
        attributes: &AttributeMap,
        at: DateTime<Utc>,
    ) -> Option<String> {
        if self.is_open()
            || self.assigned_directly(request, at)
            || self.assigned_by_group(attributes)
        {
            return None;
        }
        Some("subject is not assigned to this policy".to_string())
    }
}

/// A compiled, validated policy
#[derive(Debug, Clone)]
pub struct Policy {
    /// Unique policy identifier
    pub id: PolicyId,

    /// Stable policy code
    pub code: String,

    /// Display name
    pub name: String,

    /// Lower value = higher priority
    pub priority: i32,

    /// Effect asserted when the policy matches
    pub effect: Effect,

    /// Rule combinator
    pub condition: Combinator,

    /// Flat rule list
    pub rules: Vec<PolicyRule>,

    /// Inactive policies never take part in decisions
    pub is_active: bool,

    /// Request applicability
    pub target: PolicyTarget,

    /// Subjects the policy is granted to
    pub assignment: PolicyAssignment,

    /// Start of the validity window
    pub valid_from: Option<DateTime<Utc>>,

    /// End of the validity window
    pub valid_until: Option<DateTime<Utc>>,
}

/// Outcome of evaluating one policy
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyEvaluation {
    pub matched: bool,
    pub rule_results: Vec<RuleOutcome>,
}

impl Policy {
    /// Why the policy does not apply to this request at this time
    ///
    /// Decidable before attribute resolution. Group assignments need
    /// resolved subject attributes and are checked by [`Policy::unassigned`].
    pub fn not_applicable(&self, request: &AccessRequest, at: DateTime<Utc>) -> Option<String> {
        if let Some(from) = self.valid_from {
            if at < from {
                return Some(format!("not valid before {}", from.to_rfc3339()));
            }
        }
        if let Some(until) = self.valid_until {
            if at > until {
                return Some(format!("expired at {}", until.to_rfc3339()));
            }
        }
        if let Some(reason) = self.target.mismatch(request) {
            return Some(reason);
        }
        if self.assignment.groups.is_empty() {
            return self.assignment.mismatch(request, &AttributeMap::new(), at);
        }
        None
    }

    /// Why the subject is not assigned to the policy, given its attributes
    pub fn unassigned(
        &self,
        request: &AccessRequest,
        attributes: &AttributeMap,
        at: DateTime<Utc>,
    ) -> Option<String> {
        self.assignment.mismatch(request, attributes, at)
    }

    /// Evaluate the policy's rules
    ///
    /// Every rule is evaluated, so the trace is complete for both
    /// combinators. A policy without rules is a configuration error and never
    /// matches.
    pub fn evaluate(&self, attributes: &AttributeMap) -> Result<PolicyEvaluation> {
        if self.rules.is_empty() {
            return Err(AbacError::configuration(
                format!("policy '{}'", self.id),
                "policy has no rules",
            ));
        }

        let rule_results: Vec<RuleOutcome> = self
            .rules
            .iter()
            .map(|rule| rule.evaluate(attributes))
            .collect();

        let matched = match self.condition {
            Combinator::And => rule_results.iter().all(|r| r.matched),
            Combinator::Or => rule_results.iter().any(|r| r.matched),
        };

        Ok(PolicyEvaluation {
            matched,
            rule_results,
        })
    }
}
