//! Append-only audit trail for access decisions
//!
//! Every decision is handed to an [`AuditLogger`], which queues it on a
//! bounded channel and returns immediately. A background worker appends the
//! records to an [`AuditSink`] in submission order. A full queue or a failed
//! write is counted and logged but never reaches the caller of the access
//! check.

pub mod jsonl;
pub mod memory;

pub use jsonl::JsonlAuditLog;
pub use memory::InMemoryAuditLog;

use crate::engine::decision::Decision;
use crate::engine::metrics::MetricsCollector;
use crate::error::{AbacError, Result};
use crate::policy::Effect;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// One persisted decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Unique record ID
    pub id: String,

    pub request_fingerprint: String,

    /// Subject identifier from the request, when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,

    pub decision: Decision,

    /// Resolved attributes with sensitive values redacted
    pub resolved_attributes: BTreeMap<String, Value>,

    pub timestamp: DateTime<Utc>,

    /// Errors raised while producing the decision
    #[serde(default)]
    pub errors: Vec<String>,
}

impl AuditRecord {
    pub fn new(
        decision: &Decision,
        subject_id: Option<String>,
        resolved_attributes: BTreeMap<String, Value>,
    ) -> Self {
        let mut errors = decision.trace.errors.clone();
        errors.extend(decision.trace.policies.iter().filter_map(|entry| {
            match &entry.outcome {
                crate::engine::decision::TraceOutcome::Errored { error } => {
                    Some(format!("policy {}: {}", entry.policy_id, error))
                }
                _ => None,
            }
        }));

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            request_fingerprint: decision.request_fingerprint.clone(),
            subject_id,
            decision: decision.clone(),
            resolved_attributes,
            timestamp: decision.evaluated_at,
            errors,
        }
    }
}

/// Audit query filter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditQuery {
    /// Subject identifier
    #[serde(default)]
    pub subject: Option<String>,

    /// Inclusive lower bound on the decision timestamp
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,

    /// Inclusive upper bound on the decision timestamp
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,

    #[serde(default)]
    pub effect: Option<Effect>,

    /// Maximum records returned (newest first)
    #[serde(default)]
    pub limit: Option<usize>,
}

impl AuditQuery {
    pub fn for_subject(subject: impl Into<String>) -> Self {
        Self {
            subject: Some(subject.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &AuditRecord) -> bool {
        if let Some(subject) = &self.subject {
            if record.subject_id.as_deref() != Some(subject.as_str()) {
                return false;
            }
        }
        if self.from.is_some_and(|from| record.timestamp < from) {
            return false;
        }
        if self.to.is_some_and(|to| record.timestamp > to) {
            return false;
        }
        if self.effect.is_some_and(|effect| record.decision.effect != effect) {
            return false;
        }
        true
    }

    /// Filter records, newest first, honoring `limit`
    pub fn apply<'a>(&self, records: impl DoubleEndedIterator<Item = &'a AuditRecord>) -> Vec<AuditRecord> {
        records
            .rev()
            .filter(|record| self.matches(record))
            .take(self.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }
}

/// Audit storage backend
#[async_trait]
pub trait AuditSink: Send + Sync {
    fn name(&self) -> &str;

    /// Append one record; records are never updated or removed
    async fn append(&self, record: &AuditRecord) -> Result<()>;

    /// Records matching the query, newest first
    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>>;
}

/// Audit statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditStats {
    pub total_records: usize,
    pub allowed: usize,
    pub denied: usize,

    /// Decisions produced by a resolution failure or timeout
    pub errored: usize,

    /// Records the sink failed to persist
    pub write_failures: u64,

    /// Records dropped because the queue was full or closed
    pub dropped: u64,
}

enum AuditCommand {
    Record(Box<AuditRecord>),
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct AuditCounters {
    written: AtomicU64,
    write_failures: AtomicU64,
    dropped: AtomicU64,
}

/// Non-blocking front end over an [`AuditSink`]
#[derive(Clone)]
pub struct AuditLogger {
    tx: mpsc::Sender<AuditCommand>,
    sink: Arc<dyn AuditSink>,
    counters: Arc<AuditCounters>,
}

impl AuditLogger {
    /// Start the background writer. Must be called inside a Tokio runtime.
    pub fn spawn(sink: Arc<dyn AuditSink>, capacity: usize) -> Self {
        Self::spawn_with_metrics(sink, capacity, None)
    }

    /// Start the background writer, reporting sink failures to `metrics`
    pub fn spawn_with_metrics(
        sink: Arc<dyn AuditSink>,
        capacity: usize,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let counters = Arc::new(AuditCounters::default());

        tokio::spawn(Self::background_task(
            rx,
            Arc::clone(&sink),
            Arc::clone(&counters),
            metrics,
        ));

        Self { tx, sink, counters }
    }

    async fn background_task(
        mut rx: mpsc::Receiver<AuditCommand>,
        sink: Arc<dyn AuditSink>,
        counters: Arc<AuditCounters>,
        metrics: Option<Arc<MetricsCollector>>,
    ) {
        while let Some(command) = rx.recv().await {
            match command {
                AuditCommand::Record(record) => match sink.append(&record).await {
                    Ok(()) => {
                        counters.written.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        counters.write_failures.fetch_add(1, Ordering::Relaxed);
                        error!(
                            "Audit sink {} failed to persist record {} ({}): {}",
                            sink.name(),
                            record.id,
                            record.request_fingerprint,
                            e
                        );
                        if let Some(metrics) = &metrics {
                            metrics.record_audit_failure().await;
                        }
                    }
                },
                AuditCommand::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("Audit writer for {} stopped", sink.name());
    }

    /// Queue a record without waiting
    pub fn submit(&self, record: AuditRecord) -> Result<()> {
        self.tx
            .try_send(AuditCommand::Record(Box::new(record)))
            .map_err(|e| {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "audit queue full",
                    mpsc::error::TrySendError::Closed(_) => "audit writer stopped",
                };
                warn!("Dropping audit record: {}", reason);
                AbacError::AuditWrite(reason.to_string())
            })
    }

    /// Wait until every record queued so far has been handled
    pub async fn flush(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.tx
            .send(AuditCommand::Flush(done))
            .await
            .map_err(|_| AbacError::AuditWrite("audit writer stopped".to_string()))?;
        wait.await
            .map_err(|_| AbacError::AuditWrite("audit writer stopped".to_string()))
    }

    pub async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>> {
        self.sink.query(query).await
    }

    pub fn write_failures(&self) -> u64 {
        self.counters.write_failures.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    pub fn written(&self) -> u64 {
        self.counters.written.load(Ordering::Relaxed)
    }

    /// Totals over every persisted record
    pub async fn stats(&self) -> Result<AuditStats> {
        let records = self.sink.query(&AuditQuery::default()).await?;

        let mut stats = AuditStats {
            total_records: records.len(),
            write_failures: self.write_failures(),
            dropped: self.dropped(),
            ..AuditStats::default()
        };
        for record in &records {
            match record.decision.effect {
                Effect::Allow => stats.allowed += 1,
                Effect::Deny => stats.denied += 1,
            }
            if record.decision.is_error() {
                stats.errored += 1;
            }
        }

        Ok(stats)
    }
}
