//! Access decision types and conflict resolution

use crate::policy::Effect;
use crate::rule::RuleOutcome;
use crate::types::PolicyId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A policy whose rules matched the request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedPolicy {
    pub policy_id: PolicyId,
    pub code: String,
    pub effect: Effect,
    pub priority: i32,
}

/// What happened to one catalog entry during evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TraceOutcome {
    Matched,
    NotMatched,
    /// Target or validity window excluded the policy
    NotApplicable { reason: String },
    /// Misconfigured policy, excluded from matching
    Errored { error: String },
}

/// Trace entry for one policy, in snapshot order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub policy_id: PolicyId,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<Effect>,
    pub priority: i32,
    #[serde(flatten)]
    pub outcome: TraceOutcome,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<RuleOutcome>,
}

/// Ordered record of how a decision was reached
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionTrace {
    /// One entry per catalog entry considered
    pub policies: Vec<TraceEntry>,

    /// Request-level failures (resolution, timeout)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,

    /// Non-fatal problems (attribute coercion, rule diagnostics)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,
}

impl DecisionTrace {
    /// Number of policies excluded as misconfigured
    pub fn errored_policies(&self) -> usize {
        self.policies
            .iter()
            .filter(|entry| matches!(entry.outcome, TraceOutcome::Errored { .. }))
            .count()
    }
}

/// Why the final effect was chosen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecisionReason {
    /// A matched policy decided the outcome
    PolicyMatch { policy_id: PolicyId },

    /// No policy matched
    DefaultDeny,

    /// Resolution failed or the deadline expired
    EvaluationError { error: String },
}

/// Final access decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub effect: Effect,

    /// Matched policies in snapshot order
    pub matched_policies: Vec<MatchedPolicy>,

    /// Policy cited for the effect; `None` for default-deny and failures
    pub reason_policy_id: Option<PolicyId>,

    pub reason: DecisionReason,

    pub evaluated_at: DateTime<Utc>,

    pub request_fingerprint: String,

    /// Version of the catalog snapshot used
    pub catalog_version: u64,

    pub trace: DecisionTrace,
}

impl Decision {
    /// Build a decision from matched policies using deny-overrides
    pub fn from_matches(
        matched_policies: Vec<MatchedPolicy>,
        trace: DecisionTrace,
        evaluated_at: DateTime<Utc>,
        request_fingerprint: String,
        catalog_version: u64,
    ) -> Self {
        let (effect, reason_policy_id) = match resolve_conflicts(&matched_policies) {
            (effect, Some(reason)) => (effect, Some(reason.policy_id.clone())),
            (effect, None) => (effect, None),
        };

        let reason = match &reason_policy_id {
            Some(policy_id) => DecisionReason::PolicyMatch {
                policy_id: policy_id.clone(),
            },
            None => DecisionReason::DefaultDeny,
        };

        Self {
            effect,
            matched_policies,
            reason_policy_id,
            reason,
            evaluated_at,
            request_fingerprint,
            catalog_version,
            trace,
        }
    }

    /// DENY produced by a request-level failure
    pub fn fail_closed(
        error: String,
        trace: DecisionTrace,
        evaluated_at: DateTime<Utc>,
        request_fingerprint: String,
        catalog_version: u64,
    ) -> Self {
        let mut trace = trace;
        trace.errors.push(error.clone());

        Self {
            effect: Effect::Deny,
            matched_policies: Vec::new(),
            reason_policy_id: None,
            reason: DecisionReason::EvaluationError { error },
            evaluated_at,
            request_fingerprint,
            catalog_version,
            trace,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.effect == Effect::Allow
    }

    /// Whether the decision came from a failure rather than the catalog
    pub fn is_error(&self) -> bool {
        matches!(self.reason, DecisionReason::EvaluationError { .. })
    }
}

/// Deny-overrides with default-deny
///
/// Any matched DENY wins; otherwise any matched ALLOW; otherwise DENY with no
/// reason policy. Within the winning effect the lowest `priority` value is
/// cited, ties broken by policy id.
pub fn resolve_conflicts(matched: &[MatchedPolicy]) -> (Effect, Option<&MatchedPolicy>) {
    let best = |effect: Effect| {
        matched
            .iter()
            .filter(|m| m.effect == effect)
            .min_by(|a, b| (a.priority, &a.policy_id).cmp(&(b.priority, &b.policy_id)))
    };

    if let Some(deny) = best(Effect::Deny) {
        return (Effect::Deny, Some(deny));
    }
    if let Some(allow) = best(Effect::Allow) {
        return (Effect::Allow, Some(allow));
    }
    (Effect::Deny, None)
}
