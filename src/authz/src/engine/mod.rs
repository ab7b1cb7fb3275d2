//! Decision engine
//!
//! Orchestrates attribute resolution, policy evaluation and deny-overrides
//! conflict resolution against one immutable catalog snapshot, then hands
//! the decision to the audit trail and metrics.

pub mod decision;
pub mod metrics;

pub use decision::{
    resolve_conflicts, Decision, DecisionReason, DecisionTrace, MatchedPolicy, TraceEntry,
    TraceOutcome,
};
pub use metrics::{EngineMetrics, MetricsCollector};

use crate::audit::{AuditLogger, AuditRecord, AuditSink};
use crate::catalog::{CatalogEntry, CatalogSnapshot, CatalogStore};
use crate::error::AbacError;
use crate::resolver::{AttributeResolver, ResolvedAttributes, RetryPolicy};
use crate::types::AccessRequest;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Decision engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deadline applied when the caller does not supply one
    pub default_deadline: Duration,

    /// Retry policy for attribute source I/O
    pub retry: RetryPolicy,

    /// Enable audit logging
    pub enable_audit: bool,

    /// Enable metrics collection
    pub enable_metrics: bool,

    /// Capacity of the audit queue
    pub audit_buffer: usize,

    /// Attribute codes redacted in audit records, on top of `sensitive` types
    pub redacted_attributes: HashSet<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_deadline: Duration::from_millis(250),
            retry: RetryPolicy::default(),
            enable_audit: true,
            enable_metrics: true,
            audit_buffer: 1024,
            redacted_attributes: HashSet::new(),
        }
    }
}

/// ABAC decision engine
///
/// # Architecture
///
/// ```text
/// Request → CatalogStore::snapshot → AttributeResolver → Policy::evaluate × N
///                                           ↓ (deadline)          ↓
///                                        DENY on failure   resolve_conflicts → Decision
///                                                                  ↓           ↓
///                                                            [Audit Log]   [Metrics]
/// ```
pub struct PolicyEngine {
    catalog: Arc<CatalogStore>,
    resolver: AttributeResolver,
    audit: Option<AuditLogger>,
    metrics: Option<Arc<MetricsCollector>>,
    config: EngineConfig,
}

impl PolicyEngine {
    /// Create an engine without an audit sink
    ///
    /// The resolver's retry policy is replaced by `config.retry`.
    pub fn new(config: EngineConfig, catalog: Arc<CatalogStore>, resolver: AttributeResolver) -> Self {
        let resolver = resolver.with_retry(config.retry.clone());

        let metrics = if config.enable_metrics {
            Some(Arc::new(MetricsCollector::new()))
        } else {
            None
        };

        info!(
            "PolicyEngine initialized with deadline={:?}, audit={}, metrics={}",
            config.default_deadline, config.enable_audit, config.enable_metrics
        );

        Self {
            catalog,
            resolver,
            audit: None,
            metrics,
            config,
        }
    }

    /// Attach an audit sink (ignored when audit is disabled)
    ///
    /// Spawns the audit writer, so it must be called inside a Tokio runtime.
    /// Records the sink fails to persist count toward `audit_failures`.
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        if self.config.enable_audit {
            self.audit = Some(AuditLogger::spawn_with_metrics(
                sink,
                self.config.audit_buffer,
                self.metrics.clone(),
            ));
        }
        self
    }

    /// Decide a request under the default deadline
    pub async fn authorize(&self, request: &AccessRequest) -> Decision {
        self.authorize_with_deadline(request, self.config.default_deadline)
            .await
    }

    /// Decide a request under the given deadline
    ///
    /// Always returns a definite decision. Resolution failures and deadline
    /// expiry both produce DENY.
    pub async fn authorize_with_deadline(
        &self,
        request: &AccessRequest,
        deadline: Duration,
    ) -> Decision {
        let start = Instant::now();
        let snapshot = self.catalog.snapshot();
        let at = Utc::now();

        debug!(
            "Access check: subject={:?}, action={:?}, resource_type={:?}, catalog v{}",
            request.subject_id(),
            request.action_name(),
            request.resource_type(),
            snapshot.version()
        );

        let outcome =
            tokio::time::timeout(deadline, self.resolver.resolve(request, &snapshot, at)).await;

        let (decision, resolved) = match outcome {
            Ok(Ok(resolved)) => (Self::evaluate(&snapshot, request, &resolved, at), resolved),
            Ok(Err(e)) => {
                warn!("Attribute resolution failed, denying: {}", e);
                if let Some(metrics) = &self.metrics {
                    metrics.record_resolution_error().await;
                }
                (self.fail_closed(&snapshot, request, &e, at), ResolvedAttributes::default())
            }
            Err(_) => {
                // Dropping the resolve future cancels outstanding fetches
                let e = AbacError::EvaluationTimeout(deadline);
                warn!("Access check timed out, denying: {}", e);
                if let Some(metrics) = &self.metrics {
                    metrics.record_timeout().await;
                }
                (self.fail_closed(&snapshot, request, &e, at), ResolvedAttributes::default())
            }
        };

        info!(
            "Decision: {} (reason={}, matched={}, catalog v{})",
            decision.effect,
            decision.reason_policy_id.as_deref().unwrap_or("none"),
            decision.matched_policies.len(),
            decision.catalog_version
        );

        self.finalize(request, &snapshot, &resolved, &decision, start).await;
        decision
    }

    /// Evaluate every catalog entry and apply deny-overrides
    ///
    /// Pure: the result depends only on the arguments.
    pub fn evaluate(
        snapshot: &CatalogSnapshot,
        request: &AccessRequest,
        attributes: &ResolvedAttributes,
        at: DateTime<Utc>,
    ) -> Decision {
        let mut trace = DecisionTrace {
            diagnostics: attributes.diagnostics.clone(),
            ..DecisionTrace::default()
        };
        let mut matched = Vec::new();

        for entry in snapshot.entries() {
            let policy = match entry {
                CatalogEntry::Rejected(rejected) => {
                    trace.policies.push(TraceEntry {
                        policy_id: rejected.policy_id.clone(),
                        code: rejected.code.clone(),
                        effect: rejected.effect,
                        priority: rejected.priority,
                        outcome: TraceOutcome::Errored {
                            error: rejected.error.clone(),
                        },
                        rules: Vec::new(),
                    });
                    continue;
                }
                CatalogEntry::Ready(policy) => policy,
            };

            let mut trace_entry = TraceEntry {
                policy_id: policy.id.clone(),
                code: policy.code.clone(),
                effect: Some(policy.effect),
                priority: policy.priority,
                outcome: TraceOutcome::NotMatched,
                rules: Vec::new(),
            };

            if let Some(reason) = policy
                .not_applicable(request, at)
                .or_else(|| policy.unassigned(request, &attributes.values, at))
            {
                trace_entry.outcome = TraceOutcome::NotApplicable { reason };
                trace.policies.push(trace_entry);
                continue;
            }

            match policy.evaluate(&attributes.values) {
                Ok(evaluation) => {
                    if evaluation.matched {
                        debug!("Policy {} matched ({})", policy.id, policy.effect);
                        trace_entry.outcome = TraceOutcome::Matched;
                        matched.push(MatchedPolicy {
                            policy_id: policy.id.clone(),
                            code: policy.code.clone(),
                            effect: policy.effect,
                            priority: policy.priority,
                        });
                    }
                    trace_entry.rules = evaluation.rule_results;
                }
                Err(e) => {
                    warn!("Policy {} excluded: {}", policy.id, e);
                    trace_entry.outcome = TraceOutcome::Errored {
                        error: e.to_string(),
                    };
                }
            }
            trace.policies.push(trace_entry);
        }

        Decision::from_matches(
            matched,
            trace,
            at,
            request.fingerprint(),
            snapshot.version(),
        )
    }

    fn fail_closed(
        &self,
        snapshot: &CatalogSnapshot,
        request: &AccessRequest,
        error: &AbacError,
        at: DateTime<Utc>,
    ) -> Decision {
        Decision::fail_closed(
            error.to_string(),
            DecisionTrace::default(),
            at,
            request.fingerprint(),
            snapshot.version(),
        )
    }

    async fn finalize(
        &self,
        request: &AccessRequest,
        snapshot: &CatalogSnapshot,
        resolved: &ResolvedAttributes,
        decision: &Decision,
        start: Instant,
    ) {
        let mut audit_failed = false;

        if let Some(audit) = &self.audit {
            let attributes: BTreeMap<_, _> =
                resolved.redacted(snapshot, &self.config.redacted_attributes);
            let record = AuditRecord::new(decision, request.subject_id(), attributes);
            // Best-effort: never affects the decision
            audit_failed = audit.submit(record).is_err();
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_latency(start.elapsed()).await;
            metrics.record_decision(decision.is_allowed()).await;
            metrics
                .record_configuration_errors(decision.trace.errored_policies())
                .await;
            if audit_failed {
                metrics.record_audit_failure().await;
            }
        }
    }

    pub fn catalog(&self) -> &Arc<CatalogStore> {
        &self.catalog
    }

    pub fn audit(&self) -> Option<&AuditLogger> {
        self.audit.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> Option<&Arc<MetricsCollector>> {
        self.metrics.as_ref()
    }

    /// Get engine metrics
    pub async fn get_metrics(&self) -> Option<EngineMetrics> {
        if let Some(metrics) = &self.metrics {
            Some(metrics.get_metrics().await)
        } else {
            None
        }
    }
}
