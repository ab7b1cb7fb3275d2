//! Decision engine tests
//!
//! End-to-end behavior of `PolicyEngine`: conflict resolution, default-deny,
//! fail-closed handling of resolution errors and deadlines, and snapshot
//! isolation across catalog reloads.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hrms_authz::{
    engine::{DecisionReason, TraceOutcome},
    types::RawAttributes,
    AbacError, AccessRequest, AttributeCategory, AttributeResolver, AttributeSource,
    AttributeTypeDefinition, CatalogDefinition, CatalogStore, ClockEnvironmentSource,
    DirectorySource, Effect, EngineConfig, PolicyDefinition, PolicyEngine, Result, RetryPolicy,
};
use proptest::prelude::*;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::{sleep, Duration};

fn hr_attributes() -> CatalogDefinition {
    CatalogDefinition::new()
        .with_attribute(AttributeTypeDefinition::new("department", "subject", "string"))
        .with_attribute(AttributeTypeDefinition::new("role", "subject", "string"))
        .with_attribute(AttributeTypeDefinition::new("job_level", "subject", "number"))
        .with_attribute(AttributeTypeDefinition::new("action", "action", "string"))
        .with_attribute(AttributeTypeDefinition::new("resource_type", "resource", "string"))
        .with_attribute(AttributeTypeDefinition::new("is_weekend", "environment", "boolean"))
}

/// Scenario catalog: P1 allows HR, P2 denies delete for non-admins
fn hr_catalog() -> CatalogDefinition {
    hr_attributes()
        .with_policy(
            PolicyDefinition::new("P1", "ALLOW")
                .priority(10)
                .rule("department", "eq", json!("HR")),
        )
        .with_policy(
            PolicyDefinition::new("P2", "DENY")
                .priority(1)
                .rule("action", "eq", json!("delete"))
                .rule("role", "neq", json!("admin")),
        )
}

fn engine_for(definition: &CatalogDefinition) -> PolicyEngine {
    PolicyEngine::new(
        EngineConfig::default(),
        Arc::new(CatalogStore::from_definition(definition)),
        AttributeResolver::without_sources(),
    )
}

/// Subject source that takes longer than any test deadline
struct SlowSource(Duration);

#[async_trait]
impl AttributeSource for SlowSource {
    async fn fetch(
        &self,
        _category: AttributeCategory,
        _request: &AccessRequest,
        keys: &[String],
    ) -> Result<RawAttributes> {
        sleep(self.0).await;
        Ok(keys.iter().map(|k| (k.clone(), json!("HR"))).collect())
    }
}

/// Source that is always down
struct DownSource {
    calls: AtomicU32,
}

#[async_trait]
impl AttributeSource for DownSource {
    async fn fetch(
        &self,
        _category: AttributeCategory,
        _request: &AccessRequest,
        _keys: &[String],
    ) -> Result<RawAttributes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AbacError::SourceUnavailable("employee directory unreachable".into()))
    }
}

/// Source that parks until released
struct GatedSource {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl AttributeSource for GatedSource {
    async fn fetch(
        &self,
        _category: AttributeCategory,
        _request: &AccessRequest,
        keys: &[String],
    ) -> Result<RawAttributes> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(keys.iter().map(|k| (k.clone(), json!("HR"))).collect())
    }
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[tokio::test]
async fn test_single_allow_policy_grants() {
    let engine = engine_for(&hr_catalog());
    let request = AccessRequest::new()
        .with_subject("department", "HR")
        .with_action("read");

    let decision = engine.authorize(&request).await;

    assert_eq!(decision.effect, Effect::Allow);
    assert_eq!(decision.reason_policy_id.as_deref(), Some("P1"));
    assert_eq!(decision.matched_policies.len(), 1);
    assert_eq!(decision.catalog_version, 1);
    assert_eq!(decision.request_fingerprint, request.fingerprint());
}

#[tokio::test]
async fn test_deny_overrides_matching_allow() {
    let engine = engine_for(&hr_catalog());
    let request = AccessRequest::new()
        .with_subject("department", "HR")
        .with_subject("role", "manager")
        .with_action("delete");

    let decision = engine.authorize(&request).await;

    assert_eq!(decision.effect, Effect::Deny);
    assert_eq!(decision.reason_policy_id.as_deref(), Some("P2"));
    let matched: Vec<&str> = decision
        .matched_policies
        .iter()
        .map(|m| m.policy_id.as_str())
        .collect();
    // Snapshot order: priority ascending
    assert_eq!(matched, vec!["P2", "P1"]);
}

#[tokio::test]
async fn test_admin_delete_is_allowed() {
    let engine = engine_for(&hr_catalog());
    let request = AccessRequest::new()
        .with_subject("department", "HR")
        .with_subject("role", "admin")
        .with_action("delete");

    let decision = engine.authorize(&request).await;
    assert_eq!(decision.effect, Effect::Allow);
    assert_eq!(decision.reason_policy_id.as_deref(), Some("P1"));
}

#[tokio::test]
async fn test_deleted_attribute_type_excludes_only_that_policy() {
    let definition = hr_catalog().with_policy(
        PolicyDefinition::new("P3", "DENY")
            .priority(0)
            .rule("clearance", "eq", json!("none")),
    );
    let engine = engine_for(&definition);

    let decision = engine
        .authorize(&AccessRequest::new().with_subject("department", "HR"))
        .await;

    assert_eq!(decision.effect, Effect::Allow);
    assert_eq!(decision.trace.errored_policies(), 1);

    let p3 = &decision.trace.policies[0];
    assert_eq!(p3.policy_id, "P3");
    assert!(matches!(&p3.outcome, TraceOutcome::Errored { error } if error.contains("clearance")));

    let metrics = engine.get_metrics().await.unwrap();
    assert_eq!(metrics.configuration_errors, 1);
}

#[tokio::test]
async fn test_empty_catalog_denies() {
    let engine = engine_for(&CatalogDefinition::new());

    let decision = engine
        .authorize(&AccessRequest::new().with_subject("department", "HR"))
        .await;

    assert_eq!(decision.effect, Effect::Deny);
    assert_eq!(decision.reason, DecisionReason::DefaultDeny);
    assert!(decision.reason_policy_id.is_none());
    assert!(decision.trace.policies.is_empty());
}

// ============================================================================
// CONFLICT RESOLUTION
// ============================================================================

#[tokio::test]
async fn test_no_match_is_default_deny() {
    let engine = engine_for(&hr_catalog());

    let decision = engine
        .authorize(&AccessRequest::new().with_subject("department", "Finance"))
        .await;

    assert_eq!(decision.effect, Effect::Deny);
    assert_eq!(decision.reason, DecisionReason::DefaultDeny);
    assert!(decision.matched_policies.is_empty());
    assert!(decision
        .trace
        .policies
        .iter()
        .all(|entry| entry.outcome == TraceOutcome::NotMatched));
}

#[tokio::test]
async fn test_allow_only_cites_highest_priority() {
    let definition = hr_attributes()
        .with_policy(
            PolicyDefinition::new("senior", "ALLOW")
                .priority(20)
                .rule("job_level", "gte", json!(5)),
        )
        .with_policy(
            PolicyDefinition::new("hr", "ALLOW")
                .priority(5)
                .rule("department", "eq", json!("HR")),
        );
    let engine = engine_for(&definition);

    let decision = engine
        .authorize(
            &AccessRequest::new()
                .with_subject("department", "HR")
                .with_subject("job_level", 7),
        )
        .await;

    assert_eq!(decision.effect, Effect::Allow);
    assert_eq!(decision.reason_policy_id.as_deref(), Some("hr"));
    assert_eq!(decision.matched_policies.len(), 2);
}

#[tokio::test]
async fn test_or_policy_and_negated_rule() {
    let definition = hr_attributes().with_policy(
        PolicyDefinition::new("any", "ALLOW")
            .condition("OR")
            .rule("department", "in", json!(["HR", "Payroll"]))
            .negated_rule("role", "eq", json!("contractor")),
    );
    let engine = engine_for(&definition);

    let by_role = engine
        .authorize(
            &AccessRequest::new()
                .with_subject("department", "Sales")
                .with_subject("role", "employee"),
        )
        .await;
    assert_eq!(by_role.effect, Effect::Allow);

    let neither = engine
        .authorize(
            &AccessRequest::new()
                .with_subject("department", "Sales")
                .with_subject("role", "contractor"),
        )
        .await;
    assert_eq!(neither.effect, Effect::Deny);
}

#[tokio::test]
async fn test_missing_attribute_never_matches_negated_rule() {
    let definition = hr_attributes().with_policy(
        PolicyDefinition::new("not-contractor", "ALLOW").negated_rule(
            "role",
            "eq",
            json!("contractor"),
        ),
    );
    let engine = engine_for(&definition);

    let decision = engine.authorize(&AccessRequest::new()).await;
    assert_eq!(decision.effect, Effect::Deny);
    assert!(decision.trace.policies[0].rules[0].diagnostic.is_some());
}

#[tokio::test]
async fn test_decisions_are_deterministic() {
    let engine = engine_for(&hr_catalog());
    let request = AccessRequest::new()
        .with_subject("department", "HR")
        .with_subject("role", "manager")
        .with_action("delete");

    let first = engine.authorize(&request).await;
    let second = engine.authorize(&request).await;

    assert_eq!(first.effect, second.effect);
    assert_eq!(first.matched_policies, second.matched_policies);
    assert_eq!(first.reason, second.reason);
    assert_eq!(first.request_fingerprint, second.request_fingerprint);
    assert_eq!(first.trace.policies, second.trace.policies);
}

// ============================================================================
// APPLICABILITY
// ============================================================================

#[tokio::test]
async fn test_targeted_policy_is_not_applicable() {
    let definition = hr_attributes().with_policy(
        PolicyDefinition::new("payroll-read", "ALLOW")
            .for_resource_type("payroll")
            .for_actions(&["read"])
            .rule("department", "eq", json!("HR")),
    );
    let engine = engine_for(&definition);

    let wrong_type = engine
        .authorize(
            &AccessRequest::new()
                .with_subject("department", "HR")
                .with_resource("resource_type", "leave")
                .with_action("read"),
        )
        .await;
    assert_eq!(wrong_type.effect, Effect::Deny);
    assert!(matches!(
        wrong_type.trace.policies[0].outcome,
        TraceOutcome::NotApplicable { .. }
    ));

    let targeted = engine
        .authorize(
            &AccessRequest::new()
                .with_subject("department", "HR")
                .with_resource("resource_type", "payroll")
                .with_action("read"),
        )
        .await;
    assert_eq!(targeted.effect, Effect::Allow);
}

#[tokio::test]
async fn test_expired_policy_is_not_applicable() {
    let from = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
    let until = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
    let definition = hr_attributes().with_policy(
        PolicyDefinition::new("legacy", "ALLOW")
            .valid_between(Some(from), Some(until))
            .rule("department", "eq", json!("HR")),
    );
    let engine = engine_for(&definition);

    let decision = engine
        .authorize(&AccessRequest::new().with_subject("department", "HR"))
        .await;
    assert_eq!(decision.effect, Effect::Deny);
    assert!(matches!(
        &decision.trace.policies[0].outcome,
        TraceOutcome::NotApplicable { reason } if reason.contains("expired")
    ));
}

#[tokio::test]
async fn test_unassigned_subject_is_not_applicable() {
    let definition = hr_attributes()
        .with_attribute(AttributeTypeDefinition::new("location", "subject", "string"))
        .with_policy(
            PolicyDefinition::new("pune-leave", "ALLOW")
                .rule("action", "eq", json!("read"))
                .assign_group("location", json!("Pune"))
                .assign_subject_between(
                    "emp-3",
                    None,
                    Some(Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap()),
                ),
        )
        .with_policy(
            PolicyDefinition::new("auditor", "ALLOW")
                .rule("action", "eq", json!("read"))
                .assign_subject("emp-2"),
        );

    let record = |location: &str| -> RawAttributes {
        [("location".to_string(), json!(location))].into_iter().collect()
    };
    let directory = DirectorySource::new("id")
        .with_record("emp-1", record("Pune"))
        .with_record("emp-2", record("Delhi"))
        .with_record("emp-3", record("Delhi"));
    let engine = PolicyEngine::new(
        EngineConfig::default(),
        Arc::new(CatalogStore::from_definition(&definition)),
        AttributeResolver::without_sources()
            .with_source(AttributeCategory::Subject, Arc::new(directory)),
    );
    let read_as = |id: &str| AccessRequest::new().with_subject("id", id).with_action("read");

    // Group member through a directory-resolved attribute
    let member = engine.authorize(&read_as("emp-1")).await;
    assert_eq!(member.effect, Effect::Allow);
    assert_eq!(member.reason_policy_id.as_deref(), Some("pune-leave"));

    // Direct grant only
    let auditor = engine.authorize(&read_as("emp-2")).await;
    assert_eq!(auditor.effect, Effect::Allow);
    assert_eq!(auditor.reason_policy_id.as_deref(), Some("auditor"));

    // Lapsed direct grant, outside the group
    let lapsed = engine.authorize(&read_as("emp-3")).await;
    assert_eq!(lapsed.effect, Effect::Deny);
    assert_eq!(lapsed.reason, DecisionReason::DefaultDeny);
    assert!(lapsed.trace.policies.iter().all(|entry| matches!(
        &entry.outcome,
        TraceOutcome::NotApplicable { reason } if reason.contains("not assigned")
    )));
}

#[tokio::test]
async fn test_environment_from_clock() {
    let definition = hr_attributes().with_policy(
        PolicyDefinition::new("no-weekend-payroll", "DENY")
            .priority(1)
            .rule("is_weekend", "eq", json!(true)),
    )
    .with_policy(
        PolicyDefinition::new("hr", "ALLOW")
            .priority(10)
            .rule("department", "eq", json!("HR")),
    );

    // 2024-03-16 is a Saturday
    let saturday = Utc.with_ymd_and_hms(2024, 3, 16, 10, 0, 0).unwrap();
    let resolver = AttributeResolver::without_sources().with_source(
        AttributeCategory::Environment,
        Arc::new(ClockEnvironmentSource::fixed(saturday)),
    );
    let engine = PolicyEngine::new(
        EngineConfig::default(),
        Arc::new(CatalogStore::from_definition(&definition)),
        resolver,
    );

    let decision = engine
        .authorize(&AccessRequest::new().with_subject("department", "HR"))
        .await;
    assert_eq!(decision.effect, Effect::Deny);
    assert_eq!(decision.reason_policy_id.as_deref(), Some("no-weekend-payroll"));

    // Caller-supplied environment wins over the clock
    let weekday = engine
        .authorize(
            &AccessRequest::new()
                .with_subject("department", "HR")
                .with_environment("is_weekend", false),
        )
        .await;
    assert_eq!(weekday.effect, Effect::Allow);
}

// ============================================================================
// FAIL-CLOSED
// ============================================================================

#[tokio::test]
async fn test_deadline_expiry_denies() {
    let resolver = AttributeResolver::without_sources().with_source(
        AttributeCategory::Subject,
        Arc::new(SlowSource(Duration::from_secs(5))),
    );
    let engine = PolicyEngine::new(
        EngineConfig::default(),
        Arc::new(CatalogStore::from_definition(&hr_catalog())),
        resolver,
    );

    let started = std::time::Instant::now();
    let decision = engine
        .authorize_with_deadline(&AccessRequest::new(), Duration::from_millis(20))
        .await;

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(decision.effect, Effect::Deny);
    assert!(decision.is_error());
    assert!(decision.trace.errors[0].contains("timed out"));
    assert_eq!(engine.get_metrics().await.unwrap().timeouts, 1);
}

#[tokio::test]
async fn test_unavailable_source_denies_after_bounded_retries() {
    let down = Arc::new(DownSource {
        calls: AtomicU32::new(0),
    });
    let config = EngineConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            multiplier: 2,
        },
        ..EngineConfig::default()
    };
    let engine = PolicyEngine::new(
        config,
        Arc::new(CatalogStore::from_definition(&hr_catalog())),
        AttributeResolver::without_sources().with_source(AttributeCategory::Subject, down.clone()),
    );

    let decision = engine.authorize(&AccessRequest::new()).await;

    assert_eq!(decision.effect, Effect::Deny);
    assert!(matches!(decision.reason, DecisionReason::EvaluationError { .. }));
    assert_eq!(down.calls.load(Ordering::SeqCst), 3);
    assert_eq!(engine.get_metrics().await.unwrap().resolution_errors, 1);
}

#[tokio::test]
async fn test_resolution_error_only_affects_its_request() {
    let directory = DirectorySource::new("id").with_record(
        "emp-1",
        [("department".to_string(), json!("HR"))].into_iter().collect(),
    );
    let engine = Arc::new(PolicyEngine::new(
        EngineConfig::default(),
        Arc::new(CatalogStore::from_definition(&hr_catalog())),
        AttributeResolver::without_sources()
            .with_source(AttributeCategory::Subject, Arc::new(directory)),
    ));

    let known = AccessRequest::new().with_subject("id", "emp-1");
    let unknown = AccessRequest::new().with_subject("id", "emp-404");

    let (a, b) = tokio::join!(engine.authorize(&known), engine.authorize(&unknown));

    assert_eq!(a.effect, Effect::Allow);
    assert_eq!(b.effect, Effect::Deny);
    assert!(b.trace.errors[0].contains("emp-404"));
}

// ============================================================================
// SNAPSHOTS
// ============================================================================

#[tokio::test]
async fn test_in_flight_evaluation_keeps_its_snapshot() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let gated = GatedSource {
        entered: entered.clone(),
        release: release.clone(),
    };

    let store = Arc::new(CatalogStore::from_definition(&hr_catalog()));
    let engine = Arc::new(PolicyEngine::new(
        EngineConfig {
            default_deadline: Duration::from_secs(5),
            ..EngineConfig::default()
        },
        store.clone(),
        AttributeResolver::without_sources()
            .with_source(AttributeCategory::Subject, Arc::new(gated)),
    ));

    let in_flight = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.authorize(&AccessRequest::new()).await })
    };

    entered.notified().await;

    // Replace the catalog with one that denies everyone in HR
    store.publish(&hr_attributes().with_policy(
        PolicyDefinition::new("lockdown", "DENY").rule("department", "eq", json!("HR")),
    ));
    release.notify_one();

    let decision = in_flight.await.unwrap();
    assert_eq!(decision.catalog_version, 1);
    assert_eq!(decision.effect, Effect::Allow);
    assert_eq!(decision.reason_policy_id.as_deref(), Some("P1"));

    let after = engine
        .authorize(&AccessRequest::new().with_subject("department", "HR"))
        .await;
    assert_eq!(after.catalog_version, 2);
    assert_eq!(after.effect, Effect::Deny);
}

#[tokio::test]
async fn test_concurrent_requests() {
    let engine = Arc::new(engine_for(&hr_catalog()));

    let handles: Vec<_> = (0..32)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move {
                let department = if i % 2 == 0 { "HR" } else { "Sales" };
                engine
                    .authorize(&AccessRequest::new().with_subject("department", department))
                    .await
            })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let decision = handle.await.unwrap();
        let expected = if i % 2 == 0 { Effect::Allow } else { Effect::Deny };
        assert_eq!(decision.effect, expected);
    }

    assert_eq!(engine.get_metrics().await.unwrap().total_requests, 32);
}

// ============================================================================
// PROPERTY-BASED TESTS (PROPTEST)
// ============================================================================

proptest! {
    #[test]
    fn prop_full_path_is_deterministic(
        department in "(HR|Sales|Finance)",
        role in "(admin|manager|employee)",
        action in "(read|update|delete)",
    ) {
        tokio_test::block_on(async {
            let engine = engine_for(&hr_catalog());
            let request = AccessRequest::new()
                .with_subject("department", department.as_str())
                .with_subject("role", role.as_str())
                .with_action(action.as_str());

            let first = engine.authorize(&request).await;
            let second = engine.authorize(&request).await;

            assert_eq!(first.effect, second.effect);
            assert_eq!(first.reason, second.reason);
            assert_eq!(first.matched_policies, second.matched_policies);

            let expected = if action == "delete" && role != "admin" {
                Effect::Deny
            } else if department == "HR" {
                Effect::Allow
            } else {
                Effect::Deny
            };
            assert_eq!(first.effect, expected);
        });
    }
}
