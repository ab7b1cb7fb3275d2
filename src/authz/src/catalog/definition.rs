//! Catalog definitions as handed over by the policy administration layer
//!
//! Fields that are loosely typed strings here (category, value kind, effect,
//! condition, operator) are parsed into closed enums exactly once, when a
//! definition is compiled into a snapshot.

use crate::error::{AbacError, Result};
use crate::policy::{
    Combinator, Effect, GroupAssignment, Policy, PolicyAssignment, PolicyTarget, SubjectAssignment,
};
use crate::rule::{Operator, PolicyRule};
use crate::types::{AttributeCategory, AttributeCode, AttributeType, AttributeValue, ValueKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

fn default_true() -> bool {
    true
}

fn default_condition() -> String {
    "AND".to_string()
}

/// Full catalog: attribute types plus policies
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogDefinition {
    #[serde(default)]
    pub attribute_types: Vec<AttributeTypeDefinition>,

    #[serde(default)]
    pub policies: Vec<PolicyDefinition>,
}

impl CatalogDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attribute(mut self, attribute: AttributeTypeDefinition) -> Self {
        self.attribute_types.push(attribute);
        self
    }

    pub fn with_policy(mut self, policy: PolicyDefinition) -> Self {
        self.policies.push(policy);
        self
    }
}

/// Attribute type definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeTypeDefinition {
    #[serde(default)]
    pub id: Option<String>,

    pub code: AttributeCode,

    pub category: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(alias = "data_type")]
    pub value_kind: String,

    #[serde(default)]
    pub allowed_values: Option<Vec<Value>>,

    #[serde(default = "default_true")]
    pub is_active: bool,

    #[serde(default)]
    pub source_key: Option<String>,

    #[serde(default)]
    pub sensitive: bool,
}

impl AttributeTypeDefinition {
    pub fn new(code: impl Into<String>, category: &str, value_kind: &str) -> Self {
        Self {
            id: None,
            code: code.into(),
            category: category.to_string(),
            name: None,
            value_kind: value_kind.to_string(),
            allowed_values: None,
            is_active: true,
            source_key: None,
            sensitive: false,
        }
    }

    pub fn with_allowed_values(mut self, values: Vec<Value>) -> Self {
        self.allowed_values = Some(values);
        self
    }

    pub fn with_source_key(mut self, key: impl Into<String>) -> Self {
        self.source_key = Some(key.into());
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Validate and convert to a typed [`AttributeType`]
    pub fn compile(&self) -> Result<AttributeType> {
        let item = format!("attribute type '{}'", self.code);
        if self.code.trim().is_empty() {
            return Err(AbacError::configuration(item, "code must not be empty"));
        }

        let category: AttributeCategory = self
            .category
            .parse()
            .map_err(|e: AbacError| AbacError::configuration(&item, e.to_string()))?;
        let value_kind: ValueKind = self
            .value_kind
            .parse()
            .map_err(|e: AbacError| AbacError::configuration(&item, e.to_string()))?;

        let allowed_values = self
            .allowed_values
            .as_ref()
            .map(|values| {
                let element_kind = match value_kind {
                    ValueKind::Set => ValueKind::String,
                    scalar => scalar,
                };
                values
                    .iter()
                    .map(|v| AttributeValue::coerce(v, element_kind))
                    .collect::<std::result::Result<Vec<_>, _>>()
            })
            .transpose()
            .map_err(|message| AbacError::configuration(&item, message))?;

        Ok(AttributeType {
            id: self.id.clone().unwrap_or_else(|| self.code.clone()),
            code: self.code.clone(),
            category,
            name: self.name.clone().unwrap_or_else(|| self.code.clone()),
            value_kind,
            allowed_values,
            is_active: self.is_active,
            source_key: self.source_key.clone(),
            sensitive: self.sensitive,
        })
    }
}

/// Rule definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDefinition {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(alias = "attribute", alias = "attribute_path")]
    pub attribute_code: AttributeCode,

    /// Optional category the referenced attribute must belong to
    #[serde(default)]
    pub category: Option<String>,

    pub operator: String,

    #[serde(alias = "value")]
    pub expected_value: Value,

    #[serde(default)]
    pub negate: bool,
}

/// Group a policy is assigned to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupAssignmentDefinition {
    /// Subject attribute code defining the group
    #[serde(alias = "group_type")]
    pub attribute_code: AttributeCode,

    #[serde(alias = "group_value")]
    pub value: Value,
}

/// Policy definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDefinition {
    pub id: String,

    #[serde(default)]
    pub code: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub priority: i32,

    pub effect: String,

    #[serde(default = "default_condition")]
    pub condition: String,

    #[serde(default)]
    pub rules: Vec<RuleDefinition>,

    #[serde(default = "default_true")]
    pub is_active: bool,

    #[serde(default)]
    pub resource_type: Option<String>,

    #[serde(default)]
    pub actions: Vec<String>,

    #[serde(default)]
    pub resource_id: Option<String>,

    #[serde(default)]
    pub valid_from: Option<DateTime<Utc>>,

    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,

    /// Direct subject grants; empty together with `groups` means open
    #[serde(default, alias = "user_policies")]
    pub assigned_subjects: Vec<SubjectAssignment>,

    #[serde(default, alias = "group_policies")]
    pub groups: Vec<GroupAssignmentDefinition>,
}

impl PolicyDefinition {
    pub fn new(id: impl Into<String>, effect: &str) -> Self {
        Self {
            id: id.into(),
            code: None,
            name: None,
            priority: 0,
            effect: effect.to_string(),
            condition: default_condition(),
            rules: Vec::new(),
            is_active: true,
            resource_type: None,
            actions: Vec::new(),
            resource_id: None,
            valid_from: None,
            valid_until: None,
            assigned_subjects: Vec::new(),
            groups: Vec::new(),
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn condition(mut self, condition: &str) -> Self {
        self.condition = condition.to_string();
        self
    }

    pub fn rule(mut self, attribute_code: &str, operator: &str, expected: Value) -> Self {
        self.rules.push(RuleDefinition {
            id: None,
            attribute_code: attribute_code.to_string(),
            category: None,
            operator: operator.to_string(),
            expected_value: expected,
            negate: false,
        });
        self
    }

    pub fn negated_rule(mut self, attribute_code: &str, operator: &str, expected: Value) -> Self {
        self = self.rule(attribute_code, operator, expected);
        if let Some(last) = self.rules.last_mut() {
            last.negate = true;
        }
        self
    }

    pub fn for_resource_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self
    }

    pub fn for_actions(mut self, actions: &[&str]) -> Self {
        self.actions = actions.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn valid_between(
        mut self,
        from: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Self {
        self.valid_from = from;
        self.valid_until = until;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    pub fn assign_subject(self, subject_id: impl Into<String>) -> Self {
        self.assign_subject_between(subject_id, None, None)
    }

    pub fn assign_subject_between(
        mut self,
        subject_id: impl Into<String>,
        from: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Self {
        self.assigned_subjects.push(SubjectAssignment {
            subject_id: subject_id.into(),
            valid_from: from,
            valid_until: until,
        });
        self
    }

    pub fn assign_group(mut self, attribute_code: &str, value: Value) -> Self {
        self.groups.push(GroupAssignmentDefinition {
            attribute_code: attribute_code.to_string(),
            value,
        });
        self
    }

    fn compile_assignment(
        &self,
        item: &str,
        attributes: &HashMap<AttributeCode, AttributeType>,
    ) -> Result<PolicyAssignment> {
        for assignment in &self.assigned_subjects {
            if assignment.subject_id.trim().is_empty() {
                return Err(AbacError::configuration(item, "assigned subject id is empty"));
            }
            if let (Some(from), Some(until)) = (assignment.valid_from, assignment.valid_until) {
                if from > until {
                    return Err(AbacError::configuration(
                        item,
                        format!(
                            "assignment to '{}' ends before it starts",
                            assignment.subject_id
                        ),
                    ));
                }
            }
        }

        let mut groups = Vec::with_capacity(self.groups.len());
        for group in &self.groups {
            let attribute = attributes
                .get(&group.attribute_code)
                .filter(|a| a.is_active && a.category == AttributeCategory::Subject)
                .ok_or_else(|| {
                    AbacError::configuration(
                        item,
                        format!(
                            "group attribute '{}' is not an active subject attribute",
                            group.attribute_code
                        ),
                    )
                })?;
            let value = AttributeValue::coerce(&group.value, attribute.value_kind).map_err(|e| {
                AbacError::configuration(
                    item,
                    format!("group value for '{}': {}", attribute.code, e),
                )
            })?;
            groups.push(GroupAssignment {
                attribute_code: attribute.code.clone(),
                value,
            });
        }

        Ok(PolicyAssignment {
            subjects: self.assigned_subjects.clone(),
            groups,
        })
    }

    pub fn code(&self) -> &str {
        self.code.as_deref().unwrap_or(&self.id)
    }

    /// Validate and compile against the catalog's attribute types
    pub fn compile(&self, attributes: &HashMap<AttributeCode, AttributeType>) -> Result<Policy> {
        let item = format!("policy '{}'", self.id);
        let effect: Effect = self
            .effect
            .parse()
            .map_err(|e: AbacError| AbacError::configuration(&item, e.to_string()))?;
        let condition: Combinator = self
            .condition
            .parse()
            .map_err(|e: AbacError| AbacError::configuration(&item, e.to_string()))?;

        if self.rules.is_empty() {
            return Err(AbacError::configuration(item, "policy has no rules"));
        }

        if let (Some(from), Some(until)) = (self.valid_from, self.valid_until) {
            if from > until {
                return Err(AbacError::configuration(
                    item,
                    "validity window ends before it starts",
                ));
            }
        }

        let mut rules = Vec::with_capacity(self.rules.len());
        for (index, definition) in self.rules.iter().enumerate() {
            let rule_id = definition
                .id
                .clone()
                .unwrap_or_else(|| format!("{}#{}", self.id, index));

            let attribute = attributes
                .get(&definition.attribute_code)
                .filter(|a| a.is_active)
                .ok_or_else(|| {
                    AbacError::configuration(
                        &item,
                        format!(
                            "rule '{}' references unknown or inactive attribute '{}'",
                            rule_id, definition.attribute_code
                        ),
                    )
                })?;

            if let Some(category) = &definition.category {
                let category: AttributeCategory = category
                    .parse()
                    .map_err(|e: AbacError| AbacError::configuration(&item, e.to_string()))?;
                if category != attribute.category {
                    return Err(AbacError::configuration(
                        &item,
                        format!(
                            "rule '{}' expects a {} attribute but '{}' is a {} attribute",
                            rule_id, category, attribute.code, attribute.category
                        ),
                    ));
                }
            }

            let operator: Operator = definition
                .operator
                .parse()
                .map_err(|e: AbacError| AbacError::configuration(&item, e.to_string()))?;

            let rule = PolicyRule::compile(
                rule_id,
                self.id.clone(),
                attribute,
                operator,
                &definition.expected_value,
                definition.negate,
            )?;

            if let Some(error) = rule.invalid_pattern() {
                return Err(AbacError::configuration(
                    &item,
                    format!("rule '{}' has an invalid regex: {}", rule.id, error),
                ));
            }

            rules.push(rule);
        }

        let assignment = self.compile_assignment(&item, attributes)?;

        Ok(Policy {
            id: self.id.clone(),
            code: self.code().to_string(),
            name: self.name.clone().unwrap_or_else(|| self.code().to_string()),
            priority: self.priority,
            effect,
            condition,
            rules,
            is_active: self.is_active,
            target: PolicyTarget {
                resource_type: self.resource_type.clone(),
                actions: self.actions.clone(),
                resource_id: self.resource_id.clone(),
            },
            assignment,
            valid_from: self.valid_from,
            valid_until: self.valid_until,
        })
    }
}
