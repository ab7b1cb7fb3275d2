//! Decision engine benchmarks
//!
//! Pure evaluation against catalogs of increasing size, plus the full async
//! path (snapshot, resolution, evaluation, metrics) without audit.

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hrms_authz::{
    resolver::ResolvedAttributes, AccessRequest, AttributeResolver, AttributeTypeDefinition,
    AttributeValue, CatalogDefinition, CatalogSnapshot, CatalogStore, EngineConfig,
    PolicyDefinition, PolicyEngine,
};
use serde_json::json;
use std::sync::Arc;
use tokio::runtime::Runtime;

fn create_catalog(count: usize) -> CatalogDefinition {
    let mut definition = CatalogDefinition::new()
        .with_attribute(AttributeTypeDefinition::new("department", "subject", "string"))
        .with_attribute(AttributeTypeDefinition::new("job_level", "subject", "number"))
        .with_attribute(AttributeTypeDefinition::new("action", "action", "string"));

    for i in 0..count {
        let effect = if i % 5 == 0 { "DENY" } else { "ALLOW" };
        definition = definition.with_policy(
            PolicyDefinition::new(format!("policy-{}", i), effect)
                .priority(i as i32)
                .rule("department", "eq", json!(format!("dept-{}", i % 20)))
                .rule("job_level", "gte", json!(i % 7))
                .rule("action", "in", json!(["read", "update"])),
        );
    }
    definition
}

fn request() -> AccessRequest {
    AccessRequest::new()
        .with_subject("department", "dept-3")
        .with_subject("job_level", 4)
        .with_action("read")
}

fn bench_evaluate(c: &mut Criterion) {
    let mut group = c.benchmark_group("evaluate");

    for policy_count in [10, 100, 1000].iter() {
        let snapshot = CatalogSnapshot::compile(&create_catalog(*policy_count), 1);
        let request = request();
        let mut attributes = ResolvedAttributes::default();
        attributes
            .values
            .insert("department".to_string(), AttributeValue::from("dept-3"));
        attributes
            .values
            .insert("job_level".to_string(), AttributeValue::Number(4.0));
        attributes
            .values
            .insert("action".to_string(), AttributeValue::from("read"));

        group.bench_with_input(
            BenchmarkId::new("policies", policy_count),
            policy_count,
            |b, _| {
                b.iter(|| {
                    PolicyEngine::evaluate(
                        black_box(&snapshot),
                        black_box(&request),
                        black_box(&attributes),
                        Utc::now(),
                    )
                })
            },
        );
    }

    group.finish();
}

fn bench_authorize(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("authorize");

    for policy_count in [10, 100, 1000].iter() {
        let engine = PolicyEngine::new(
            EngineConfig {
                enable_audit: false,
                ..EngineConfig::default()
            },
            Arc::new(CatalogStore::from_definition(&create_catalog(*policy_count))),
            AttributeResolver::without_sources(),
        );
        let request = request();

        group.bench_with_input(
            BenchmarkId::new("policies", policy_count),
            policy_count,
            |b, _| b.iter(|| rt.block_on(engine.authorize(black_box(&request)))),
        );
    }

    group.finish();
}

fn bench_fingerprint(c: &mut Criterion) {
    let request = request();
    c.bench_function("request_fingerprint", |b| b.iter(|| black_box(&request).fingerprint()));
}

criterion_group!(benches, bench_evaluate, bench_authorize, bench_fingerprint);
criterion_main!(benches);
