//! # ABAC Decision Server
//!
//! HTTP front end for the HRMS attribute-based access control engine.
//!
//! ## Endpoints
//!
//! - `POST /check-access` - Access check, always answers ALLOW or DENY
//! - `GET /audit` - Query the audit trail (`subject`, `from`, `to`, `effect`, `limit`)
//! - `GET /audit/stats` - Audit totals and write failures
//! - `POST /catalog/reload` - Re-read the catalog file and publish a new snapshot
//! - `GET /health` - Health check
//! - `GET /metrics` - Prometheus metrics (served on `METRICS_PORT`)
//!
//! ## Configuration
//!
//! See [`hrms_authz::config`] for the environment variables. `RUST_LOG`
//! controls the log level (default: info).

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    serve, Router,
};
use hrms_authz::{
    types::RawAttributes, AbacError, AccessRequest, AttributeResolver, AuditQuery, AuditRecord,
    AuditSink, AuditStats, CatalogSource, CatalogStore, Decision, InMemoryAuditLog,
    JsonFileCatalogSource, JsonlAuditLog, PolicyEngine, ServerConfig,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Shared application state
#[derive(Clone)]
struct AppState {
    engine: Arc<PolicyEngine>,
    catalog_source: Option<Arc<dyn CatalogSource>>,
    start_time: std::time::Instant,
}

/// Error response body
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

/// Application error type
#[derive(Debug)]
enum AppError {
    Engine(String),
    BadRequest(String),
    Unavailable(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg),
            AppError::Engine(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "engine_error", msg),
        };

        let body = Json(ErrorResponse {
            error: error.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

impl From<AbacError> for AppError {
    fn from(err: AbacError) -> Self {
        match err {
            AbacError::InvalidInput(msg) => AppError::BadRequest(msg),
            AbacError::Serialization(e) => AppError::BadRequest(e.to_string()),
            other => AppError::Engine(other.to_string()),
        }
    }
}

/// `action` may be a bare name or a full attribute map
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ActionField {
    Name(String),
    Attributes(RawAttributes),
}

impl Default for ActionField {
    fn default() -> Self {
        Self::Attributes(RawAttributes::new())
    }
}

/// Access check request
#[derive(Debug, Deserialize)]
struct CheckRequest {
    #[serde(default)]
    subject: RawAttributes,
    #[serde(default)]
    resource: RawAttributes,
    #[serde(default)]
    action: ActionField,
    #[serde(default)]
    environment: RawAttributes,
    /// Overrides the default deadline
    #[serde(default)]
    deadline_ms: Option<u64>,
}

impl CheckRequest {
    fn into_access_request(self) -> (AccessRequest, Option<Duration>) {
        let mut request = AccessRequest {
            subject: self.subject,
            resource: self.resource,
            action: RawAttributes::new(),
            environment: self.environment,
        };
        match self.action {
            ActionField::Name(name) => request = request.with_action(name),
            ActionField::Attributes(attributes) => request.action = attributes,
        }
        (request, self.deadline_ms.map(Duration::from_millis))
    }
}

/// Catalog reload response
#[derive(Debug, Serialize)]
struct ReloadResponse {
    version: u64,
    policies: usize,
    rejected: usize,
    attribute_errors: Vec<String>,
}

/// Health check response
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    uptime_seconds: u64,
    version: String,
    catalog_version: u64,
}

/// Metrics response (Prometheus format)
struct MetricsResponse {
    metrics: String,
}

impl IntoResponse for MetricsResponse {
    fn into_response(self) -> Response {
        (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            self.metrics,
        )
            .into_response()
    }
}

/// POST /check-access - Decide an access request
async fn check_access(
    State(state): State<AppState>,
    Json(req): Json<CheckRequest>,
) -> Json<Decision> {
    let (request, deadline) = req.into_access_request();

    let decision = match deadline {
        Some(deadline) => state.engine.authorize_with_deadline(&request, deadline).await,
        None => state.engine.authorize(&request).await,
    };

    Json(decision)
}

/// GET /audit - Query audit records, newest first
async fn query_audit(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditRecord>>, AppError> {
    let audit = state
        .engine
        .audit()
        .ok_or_else(|| AppError::Unavailable("audit logging is disabled".to_string()))?;

    Ok(Json(audit.query(&query).await?))
}

/// GET /audit/stats - Audit totals
async fn audit_stats(State(state): State<AppState>) -> Result<Json<AuditStats>, AppError> {
    let audit = state
        .engine
        .audit()
        .ok_or_else(|| AppError::Unavailable("audit logging is disabled".to_string()))?;

    Ok(Json(audit.stats().await?))
}

/// POST /catalog/reload - Publish a fresh catalog snapshot
async fn reload_catalog(State(state): State<AppState>) -> Result<Json<ReloadResponse>, AppError> {
    let source = state
        .catalog_source
        .as_ref()
        .ok_or_else(|| AppError::BadRequest("no catalog file configured".to_string()))?;

    let snapshot = state.engine.catalog().reload_from(source.as_ref()).await?;

    Ok(Json(ReloadResponse {
        version: snapshot.version(),
        policies: snapshot.policies().count(),
        rejected: snapshot.rejected().count(),
        attribute_errors: snapshot.attribute_errors().to_vec(),
    }))
}

/// GET /health - Health check endpoint
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        version: hrms_authz::VERSION.to_string(),
        catalog_version: state.engine.catalog().version(),
    })
}

/// GET /metrics - Prometheus metrics endpoint
async fn metrics(State(state): State<AppState>) -> MetricsResponse {
    let mut metrics = match state.engine.metrics() {
        Some(collector) => collector.export_prometheus().await,
        None => String::new(),
    };

    metrics.push_str(&format!(
        "\n# HELP abac_uptime_seconds Server uptime in seconds\n\
         # TYPE abac_uptime_seconds gauge\n\
         abac_uptime_seconds {}\n\
         \n\
         # HELP abac_catalog_version Published catalog snapshot version\n\
         # TYPE abac_catalog_version gauge\n\
         abac_catalog_version {}\n",
        state.start_time.elapsed().as_secs(),
        state.engine.catalog().version()
    ));

    MetricsResponse { metrics }
}

/// Create the HTTP router with all endpoints
fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let trace = TraceLayer::new_for_http().on_response(DefaultOnResponse::new().level(Level::INFO));

    Router::new()
        .route("/check-access", post(check_access))
        .route("/audit", get(query_audit))
        .route("/audit/stats", get(audit_stats))
        .route("/catalog/reload", post(reload_catalog))
        .route("/health", get(health_check))
        .layer(ServiceBuilder::new().layer(trace).layer(cors))
        .with_state(state)
}

/// Create the metrics router
fn create_metrics_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }

    info!("Starting graceful shutdown");
}

/// Main server entrypoint
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting HRMS ABAC Server v{}", hrms_authz::VERSION);

    let config = ServerConfig::from_env().context("invalid server configuration")?;

    info!("Configuration:");
    info!("  Port: {}", config.port);
    info!("  Metrics Port: {}", config.metrics_port);
    info!("  Deadline: {:?}", config.deadline);
    info!("  Catalog: {:?}", config.catalog_path);
    info!("  Audit log: {:?}", config.audit_path);

    let catalog = Arc::new(CatalogStore::new());
    let catalog_source: Option<Arc<dyn CatalogSource>> = config
        .catalog_path
        .as_ref()
        .map(|path| Arc::new(JsonFileCatalogSource::new(path)) as Arc<dyn CatalogSource>);

    match &catalog_source {
        Some(source) => {
            let snapshot = catalog
                .reload_from(source.as_ref())
                .await
                .context("failed to load policy catalog")?;
            if snapshot.rejected().count() > 0 {
                warn!(
                    "{} policies rejected at load; they will never match",
                    snapshot.rejected().count()
                );
            }
        }
        None => warn!("No ABAC_CATALOG_PATH set; every request will be denied"),
    }

    let audit_sink: Arc<dyn AuditSink> = match &config.audit_path {
        Some(path) => Arc::new(JsonlAuditLog::new(path)),
        None => Arc::new(InMemoryAuditLog::new()),
    };

    let engine = PolicyEngine::new(config.engine_config(), catalog, AttributeResolver::new())
        .with_audit_sink(audit_sink);

    info!("Decision engine initialized successfully");

    let state = AppState {
        engine: Arc::new(engine),
        catalog_source,
        start_time: std::time::Instant::now(),
    };

    let app = create_router(state.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    let metrics_app = create_metrics_router(state.clone());
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));

    info!("Starting HTTP server on {}", addr);
    info!("Starting metrics server on {}", metrics_addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind HTTP server on {}", addr))?;

    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics server on {}", metrics_addr))?;

    let server = serve(listener, app.into_make_service()).with_graceful_shutdown(shutdown_signal());

    let metrics_server = serve(metrics_listener, metrics_app.into_make_service())
        .with_graceful_shutdown(shutdown_signal());

    tokio::try_join!(
        async {
            server.await.map_err(|e| {
                error!("HTTP server error: {}", e);
                e
            })
        },
        async {
            metrics_server.await.map_err(|e| {
                error!("Metrics server error: {}", e);
                e
            })
        }
    )?;

    if let Some(audit) = state.engine.audit() {
        if let Err(e) = audit.flush().await {
            warn!("Audit flush on shutdown failed: {}", e);
        }
    }

    info!("Servers shut down gracefully");
    Ok(())
}
