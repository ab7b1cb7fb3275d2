//! # HRMS ABAC Decision Engine
//!
//! Attribute-based access control for the HRMS suite: given a subject, a
//! resource, an action and an environment, decide ALLOW or DENY by
//! evaluating a catalog of prioritized policies built from attribute
//! comparisons.
//!
//! ## Features
//!
//! - **Deny-overrides** conflict resolution with **default-deny**
//! - **Fail-closed**: resolution errors and deadline expiry yield DENY
//! - **Immutable catalog snapshots** published atomically
//! - **Lazy attribute resolution** with concurrent per-category fetches
//! - **Append-only audit trail** written off the decision path
//!
//! ## Example
//!
//! ```rust
//! use hrms_authz::{
//!     AccessRequest, AttributeResolver, AttributeTypeDefinition, CatalogDefinition,
//!     CatalogStore, EngineConfig, PolicyDefinition, PolicyEngine,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let catalog = CatalogDefinition::new()
//!         .with_attribute(AttributeTypeDefinition::new("department", "subject", "string"))
//!         .with_policy(
//!             PolicyDefinition::new("hr-read", "ALLOW").rule("department", "eq", json!("HR")),
//!         );
//!
//!     let engine = PolicyEngine::new(
//!         EngineConfig::default(),
//!         Arc::new(CatalogStore::from_definition(&catalog)),
//!         AttributeResolver::new(),
//!     );
//!
//!     let request = AccessRequest::new()
//!         .with_subject("department", "HR")
//!         .with_action("read");
//!
//!     let decision = engine.authorize(&request).await;
//!     assert!(decision.is_allowed());
//! }
//! ```

pub mod audit;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod policy;
pub mod resolver;
pub mod rule;
pub mod types;

// Re-export commonly used types
pub use audit::{AuditLogger, AuditQuery, AuditRecord, AuditSink, AuditStats, InMemoryAuditLog, JsonlAuditLog};
pub use catalog::{
    AttributeTypeDefinition, CatalogDefinition, CatalogSnapshot, CatalogSource, CatalogStore,
    InMemoryCatalogSource, JsonFileCatalogSource, PolicyDefinition, RuleDefinition,
};
pub use config::ServerConfig;
pub use engine::{Decision, DecisionReason, EngineConfig, MatchedPolicy, PolicyEngine};
pub use error::{AbacError, Result};
pub use policy::{Combinator, Effect, Policy, PolicyAssignment};
pub use resolver::{
    AttributeResolver, AttributeSource, ClockEnvironmentSource, DirectorySource, RetryPolicy,
};
pub use rule::{Operator, PolicyRule};
pub use types::{AccessRequest, AttributeCategory, AttributeType, AttributeValue, ValueKind};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
