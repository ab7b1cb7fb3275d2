//! Policy catalog snapshots
//!
//! The catalog is compiled from a [`CatalogDefinition`] into an immutable,
//! versioned [`CatalogSnapshot`]. [`CatalogStore`] publishes new snapshots by
//! swapping an `Arc`; evaluations that already hold the previous snapshot keep
//! using it until they finish.
//!
//! ```text
//! CatalogSource ──load──► CatalogDefinition ──compile──► CatalogSnapshot(vN)
//!                                                             │
//!                              CatalogStore::publish ─────────┘ (atomic swap)
//! ```

pub mod definition;
pub mod source;

pub use definition::{
    AttributeTypeDefinition, CatalogDefinition, GroupAssignmentDefinition, PolicyDefinition,
    RuleDefinition,
};
pub use source::{CatalogSource, InMemoryCatalogSource, JsonFileCatalogSource};

use crate::error::Result;
use crate::policy::{Effect, Policy};
use crate::types::{AccessRequest, AttributeCode, AttributeType, PolicyId};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// A policy excluded from the snapshot because it failed validation
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedPolicy {
    pub policy_id: PolicyId,
    pub code: String,
    pub priority: i32,
    pub effect: Option<Effect>,
    pub error: String,
}

/// One catalog slot, in evaluation order
#[derive(Debug, Clone)]
pub enum CatalogEntry {
    /// Compiled and eligible for matching
    Ready(Policy),
    /// Misconfigured; reported in every trace, never matched
    Rejected(RejectedPolicy),
}

impl CatalogEntry {
    pub fn policy_id(&self) -> &str {
        match self {
            Self::Ready(policy) => &policy.id,
            Self::Rejected(rejected) => &rejected.policy_id,
        }
    }

    pub fn priority(&self) -> i32 {
        match self {
            Self::Ready(policy) => policy.priority,
            Self::Rejected(rejected) => rejected.priority,
        }
    }

    fn sort_key(&self) -> (i32, String) {
        (self.priority(), self.policy_id().to_string())
    }
}

/// Immutable, versioned view of the active catalog
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    version: u64,
    loaded_at: DateTime<Utc>,
    attribute_types: HashMap<AttributeCode, AttributeType>,
    entries: Vec<CatalogEntry>,
    attribute_errors: Vec<String>,
}

impl CatalogSnapshot {
    /// Snapshot with no attribute types and no policies
    pub fn empty() -> Self {
        Self::compile(&CatalogDefinition::default(), 0)
    }

    /// Compile a definition into a snapshot
    ///
    /// Never fails: malformed attribute types are dropped and malformed
    /// policies become [`CatalogEntry::Rejected`]. Inactive policies are left
    /// out entirely.
    pub fn compile(definition: &CatalogDefinition, version: u64) -> Self {
        let mut attribute_types = HashMap::new();
        let mut attribute_errors = Vec::new();

        for attr_def in &definition.attribute_types {
            match attr_def.compile() {
                Ok(attr) if attribute_types.contains_key(&attr.code) => {
                    let message = format!("duplicate attribute type code '{}'", attr.code);
                    warn!("Catalog v{}: {}", version, message);
                    attribute_errors.push(message);
                }
                Ok(attr) => {
                    attribute_types.insert(attr.code.clone(), attr);
                }
                Err(e) => {
                    warn!("Catalog v{}: {}", version, e);
                    attribute_errors.push(e.to_string());
                }
            }
        }

        let mut entries = Vec::new();
        let mut seen_ids = HashSet::new();

        for policy_def in definition.policies.iter().filter(|p| p.is_active) {
            let result = if seen_ids.insert(policy_def.id.clone()) {
                policy_def.compile(&attribute_types)
            } else {
                Err(crate::error::AbacError::configuration(
                    format!("policy '{}'", policy_def.id),
                    "duplicate policy id",
                ))
            };

            match result {
                Ok(policy) => entries.push(CatalogEntry::Ready(policy)),
                Err(e) => {
                    warn!("Catalog v{}: excluding policy {}: {}", version, policy_def.id, e);
                    entries.push(CatalogEntry::Rejected(RejectedPolicy {
                        policy_id: policy_def.id.clone(),
                        code: policy_def.code().to_string(),
                        priority: policy_def.priority,
                        effect: policy_def.effect.parse().ok(),
                        error: e.to_string(),
                    }));
                }
            }
        }

        entries.sort_by_key(CatalogEntry::sort_key);

        Self {
            version,
            loaded_at: Utc::now(),
            attribute_types,
            entries,
            attribute_errors,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// All entries, ordered by priority then policy id
    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    /// Compiled policies, in evaluation order
    pub fn policies(&self) -> impl Iterator<Item = &Policy> {
        self.entries.iter().filter_map(|entry| match entry {
            CatalogEntry::Ready(policy) => Some(policy),
            CatalogEntry::Rejected(_) => None,
        })
    }

    /// Policies excluded for configuration errors
    pub fn rejected(&self) -> impl Iterator<Item = &RejectedPolicy> {
        self.entries.iter().filter_map(|entry| match entry {
            CatalogEntry::Rejected(rejected) => Some(rejected),
            CatalogEntry::Ready(_) => None,
        })
    }

    pub fn attribute_type(&self, code: &str) -> Option<&AttributeType> {
        self.attribute_types.get(code)
    }

    pub fn attribute_types(&self) -> impl Iterator<Item = &AttributeType> {
        self.attribute_types.values()
    }

    /// Attribute type definitions that were dropped at load time
    pub fn attribute_errors(&self) -> &[String] {
        &self.attribute_errors
    }

    /// Attribute types referenced by policies applicable to this request,
    /// including those defining group assignments
    pub fn referenced_attributes(
        &self,
        request: &AccessRequest,
        at: DateTime<Utc>,
    ) -> Vec<&AttributeType> {
        let codes: BTreeSet<&str> = self
            .policies()
            .filter(|policy| policy.not_applicable(request, at).is_none())
            .flat_map(|policy| {
                policy
                    .rules
                    .iter()
                    .map(|rule| rule.attribute_code.as_str())
                    .chain(policy.assignment.group_attributes())
            })
            .collect();

        codes
            .into_iter()
            .filter_map(|code| self.attribute_types.get(code))
            .collect()
    }
}

/// Holder of the current snapshot
///
/// Readers take the read lock only long enough to clone the `Arc`. Writers
/// serialize on a separate mutex so compilation never blocks readers.
pub struct CatalogStore {
    current: RwLock<Arc<CatalogSnapshot>>,
    generation: AtomicU64,
    writer: Mutex<()>,
}

impl CatalogStore {
    /// Create a store holding an empty catalog (version 0)
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(CatalogSnapshot::empty())),
            generation: AtomicU64::new(0),
            writer: Mutex::new(()),
        }
    }

    /// Create a store and publish `definition` as version 1
    pub fn from_definition(definition: &CatalogDefinition) -> Self {
        let store = Self::new();
        store.publish(definition);
        store
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Latest published version
    pub fn version(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Compile and atomically publish a new snapshot
    pub fn publish(&self, definition: &CatalogDefinition) -> Arc<CatalogSnapshot> {
        let _writer = self.writer.lock();

        let version = self.generation.load(Ordering::Acquire) + 1;
        let snapshot = Arc::new(CatalogSnapshot::compile(definition, version));

        *self.current.write() = Arc::clone(&snapshot);
        self.generation.store(version, Ordering::Release);

        info!(
            "Published catalog v{}: {} policies, {} rejected, {} attribute types",
            version,
            snapshot.policies().count(),
            snapshot.rejected().count(),
            snapshot.attribute_types.len()
        );

        snapshot
    }

    /// Load from a catalog source and publish
    pub async fn reload_from(&self, source: &dyn CatalogSource) -> Result<Arc<CatalogSnapshot>> {
        let definition = source.load().await?;
        Ok(self.publish(&definition))
    }
}

impl Default for CatalogStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition() -> CatalogDefinition {
        CatalogDefinition::new()
            .with_attribute(AttributeTypeDefinition::new("department", "subject", "string"))
            .with_attribute(AttributeTypeDefinition::new("action", "action", "string"))
            .with_policy(
                PolicyDefinition::new("p-allow-hr", "ALLOW")
                    .priority(10)
                    .rule("department", "eq", json!("HR")),
            )
            .with_policy(
                PolicyDefinition::new("p-deny-delete", "DENY")
                    .priority(1)
                    .rule("action", "eq", json!("delete")),
            )
            .with_policy(PolicyDefinition::new("p-empty", "ALLOW").priority(5))
            .with_policy(
                PolicyDefinition::new("p-off", "ALLOW")
                    .rule("department", "eq", json!("HR"))
                    .inactive(),
            )
    }

    #[test]
    fn test_snapshot_orders_and_rejects() {
        let snapshot = CatalogSnapshot::compile(&definition(), 1);

        let order: Vec<&str> = snapshot.entries().iter().map(|e| e.policy_id()).collect();
        assert_eq!(order, vec!["p-deny-delete", "p-empty", "p-allow-hr"]);

        let rejected: Vec<_> = snapshot.rejected().collect();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].policy_id, "p-empty");
        assert_eq!(rejected[0].effect, Some(Effect::Allow));
        assert_eq!(snapshot.policies().count(), 2);
    }

    #[test]
    fn test_duplicates_are_rejected() {
        let definition = definition()
            .with_attribute(AttributeTypeDefinition::new("department", "resource", "string"))
            .with_policy(
                PolicyDefinition::new("p-allow-hr", "DENY").rule("department", "eq", json!("x")),
            );
        let snapshot = CatalogSnapshot::compile(&definition, 1);

        assert_eq!(snapshot.attribute_errors().len(), 1);
        assert_eq!(
            snapshot.attribute_type("department").unwrap().category,
            crate::types::AttributeCategory::Subject
        );
        assert!(snapshot.rejected().any(|r| r.error.contains("duplicate policy id")));
    }

    #[test]
    fn test_referenced_attributes_are_lazy() {
        let definition = definition()
            .with_attribute(AttributeTypeDefinition::new("salary_band", "subject", "string"))
            .with_policy(
                PolicyDefinition::new("p-payroll", "ALLOW")
                    .for_resource_type("payroll")
                    .rule("salary_band", "eq", json!("B")),
            );
        let snapshot = CatalogSnapshot::compile(&definition, 1);
        let request = AccessRequest::new().with_resource("resource_type", "leave");

        let codes: Vec<&str> = snapshot
            .referenced_attributes(&request, Utc::now())
            .iter()
            .map(|a| a.code.as_str())
            .collect();
        assert_eq!(codes, vec!["action", "department"]);
    }

    #[test]
    fn test_group_attributes_are_referenced() {
        let definition = definition()
            .with_attribute(AttributeTypeDefinition::new("location", "subject", "string"))
            .with_attribute(AttributeTypeDefinition::new("salary_band", "subject", "string"))
            .with_policy(
                PolicyDefinition::new("p-pune", "ALLOW")
                    .rule("department", "eq", json!("HR"))
                    .assign_group("location", json!("Pune")),
            )
            .with_policy(
                PolicyDefinition::new("p-direct", "ALLOW")
                    .rule("salary_band", "eq", json!("B"))
                    .assign_subject("emp-1"),
            );
        let snapshot = CatalogSnapshot::compile(&definition, 1);
        let request = AccessRequest::new().with_subject("id", "emp-2");

        let codes: Vec<&str> = snapshot
            .referenced_attributes(&request, Utc::now())
            .iter()
            .map(|a| a.code.as_str())
            .collect();
        assert!(codes.contains(&"location"));
        // Directly assigned to someone else
        assert!(!codes.contains(&"salary_band"));
    }

    #[test]
    fn test_publish_swaps_snapshot_atomically() {
        let store = CatalogStore::new();
        assert_eq!(store.version(), 0);

        let before = store.snapshot();
        store.publish(&definition());
        let after = store.snapshot();

        assert_eq!(before.version(), 0);
        assert_eq!(before.entries().len(), 0);
        assert_eq!(after.version(), 1);
        assert_eq!(store.version(), 1);
        assert_eq!(after.entries().len(), 3);

        store.publish(&CatalogDefinition::new());
        assert_eq!(store.snapshot().version(), 2);
        assert_eq!(after.entries().len(), 3);
    }
}
