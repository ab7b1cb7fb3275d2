//! Prometheus metrics collection for decision engine observability

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Engine performance metrics
#[derive(Debug, Clone, Default)]
pub struct EngineMetrics {
    /// Total number of access checks
    pub total_requests: u64,

    /// Number of ALLOW decisions
    pub allowed_decisions: u64,

    /// Number of DENY decisions
    pub denied_decisions: u64,

    /// Decisions denied because attribute resolution failed
    pub resolution_errors: u64,

    /// Decisions denied because the deadline expired
    pub timeouts: u64,

    /// Misconfigured policies encountered during evaluation
    pub configuration_errors: u64,

    /// Audit records that could not be queued or written
    pub audit_failures: u64,

    /// Latency percentiles
    pub latency_p50_ms: f64,
    pub latency_p90_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub latency_p999_ms: f64,

    /// Average latency
    pub avg_latency_ms: f64,
}

impl EngineMetrics {
    /// Calculate allow rate
    pub fn allow_rate(&self) -> f64 {
        let total = self.allowed_decisions + self.denied_decisions;
        if total == 0 {
            0.0
        } else {
            self.allowed_decisions as f64 / total as f64
        }
    }

    /// Share of decisions that failed closed
    pub fn fail_closed_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            (self.resolution_errors + self.timeouts) as f64 / self.total_requests as f64
        }
    }
}

/// Metrics collector with Prometheus-compatible storage
pub struct MetricsCollector {
    metrics: Arc<RwLock<EngineMetrics>>,

    /// Recent latency samples for percentile calculation
    latency_samples: Arc<RwLock<Vec<f64>>>,

    max_samples: usize,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(RwLock::new(EngineMetrics::default())),
            latency_samples: Arc::new(RwLock::new(Vec::with_capacity(10_000))),
            max_samples: 10_000,
        }
    }

    /// Record a final decision
    pub async fn record_decision(&self, allowed: bool) {
        let mut metrics = self.metrics.write().await;
        metrics.total_requests += 1;

        if allowed {
            metrics.allowed_decisions += 1;
        } else {
            metrics.denied_decisions += 1;
        }
    }

    pub async fn record_resolution_error(&self) {
        self.metrics.write().await.resolution_errors += 1;
    }

    pub async fn record_timeout(&self) {
        self.metrics.write().await.timeouts += 1;
    }

    pub async fn record_configuration_errors(&self, count: usize) {
        if count > 0 {
            self.metrics.write().await.configuration_errors += count as u64;
        }
    }

    pub async fn record_audit_failure(&self) {
        self.metrics.write().await.audit_failures += 1;
    }

    /// Record decision latency
    pub async fn record_latency(&self, latency: Duration) {
        let latency_ms = latency.as_secs_f64() * 1000.0;

        let mut samples = self.latency_samples.write().await;
        samples.push(latency_ms);

        // Keep only recent samples
        if samples.len() > self.max_samples {
            samples.drain(0..1_000);
        }

        let mut metrics = self.metrics.write().await;

        let sum: f64 = samples.iter().sum();
        metrics.avg_latency_ms = sum / samples.len() as f64;

        let mut sorted = samples.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));

        metrics.latency_p50_ms = Self::percentile(&sorted, 0.50);
        metrics.latency_p90_ms = Self::percentile(&sorted, 0.90);
        metrics.latency_p95_ms = Self::percentile(&sorted, 0.95);
        metrics.latency_p99_ms = Self::percentile(&sorted, 0.99);
        metrics.latency_p999_ms = Self::percentile(&sorted, 0.999);
    }

    /// Get current metrics snapshot
    pub async fn get_metrics(&self) -> EngineMetrics {
        self.metrics.read().await.clone()
    }

    /// Reset all metrics
    pub async fn reset(&self) {
        let mut metrics = self.metrics.write().await;
        *metrics = EngineMetrics::default();

        let mut samples = self.latency_samples.write().await;
        samples.clear();
    }

    /// Export metrics in Prometheus text format
    pub async fn export_prometheus(&self) -> String {
        let metrics = self.metrics.read().await;

        format!(
            r#"# HELP abac_requests_total Total number of access checks
# TYPE abac_requests_total counter
abac_requests_total {}

# HELP abac_allowed_total Number of ALLOW decisions
# TYPE abac_allowed_total counter
abac_allowed_total {}

# HELP abac_denied_total Number of DENY decisions
# TYPE abac_denied_total counter
abac_denied_total {}

# HELP abac_resolution_errors_total Decisions denied on attribute resolution failure
# TYPE abac_resolution_errors_total counter
abac_resolution_errors_total {}

# HELP abac_timeouts_total Decisions denied on deadline expiry
# TYPE abac_timeouts_total counter
abac_timeouts_total {}

# HELP abac_configuration_errors_total Misconfigured policies seen during evaluation
# TYPE abac_configuration_errors_total counter
abac_configuration_errors_total {}

# HELP abac_audit_failures_total Audit records dropped or failed
# TYPE abac_audit_failures_total counter
abac_audit_failures_total {}

# HELP abac_latency_seconds Decision latency percentiles
# TYPE abac_latency_seconds summary
abac_latency_seconds{{quantile="0.5"}} {}
abac_latency_seconds{{quantile="0.9"}} {}
abac_latency_seconds{{quantile="0.95"}} {}
abac_latency_seconds{{quantile="0.99"}} {}
abac_latency_seconds{{quantile="0.999"}} {}
"#,
            metrics.total_requests,
            metrics.allowed_decisions,
            metrics.denied_decisions,
            metrics.resolution_errors,
            metrics.timeouts,
            metrics.configuration_errors,
            metrics.audit_failures,
            metrics.latency_p50_ms / 1000.0,
            metrics.latency_p90_ms / 1000.0,
            metrics.latency_p95_ms / 1000.0,
            metrics.latency_p99_ms / 1000.0,
            metrics.latency_p999_ms / 1000.0,
        )
    }

    /// Calculate percentile from sorted data
    fn percentile(sorted: &[f64], p: f64) -> f64 {
        if sorted.is_empty() {
            return 0.0;
        }

        let idx = ((sorted.len() as f64) * p) as usize;
        let idx = idx.min(sorted.len() - 1);
        sorted[idx]
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
