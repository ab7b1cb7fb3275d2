//! Catalog read interface
//!
//! The catalog is authored elsewhere (policy administration). The engine only
//! ever reads a complete definition from a [`CatalogSource`].

use super::definition::CatalogDefinition;
use crate::error::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Catalog source trait
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Load the complete current catalog definition
    async fn load(&self) -> Result<CatalogDefinition>;
}

/// In-memory catalog source
pub struct InMemoryCatalogSource {
    definition: Arc<RwLock<CatalogDefinition>>,
}

impl InMemoryCatalogSource {
    /// Create a new in-memory source
    pub fn new(definition: CatalogDefinition) -> Self {
        Self {
            definition: Arc::new(RwLock::new(definition)),
        }
    }

    /// Replace the stored definition
    pub async fn replace(&self, definition: CatalogDefinition) {
        *self.definition.write().await = definition;
    }
}

impl Default for InMemoryCatalogSource {
    fn default() -> Self {
        Self::new(CatalogDefinition::default())
    }
}

#[async_trait]
impl CatalogSource for InMemoryCatalogSource {
    async fn load(&self) -> Result<CatalogDefinition> {
        Ok(self.definition.read().await.clone())
    }
}

/// Catalog exported as a single JSON document
pub struct JsonFileCatalogSource {
    path: PathBuf,
}

impl JsonFileCatalogSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CatalogSource for JsonFileCatalogSource {
    async fn load(&self) -> Result<CatalogDefinition> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let definition: CatalogDefinition = serde_json::from_str(&raw)?;
        debug!(
            "Loaded catalog from {}: {} attribute types, {} policies",
            self.path.display(),
            definition.attribute_types.len(),
            definition.policies.len()
        );
        Ok(definition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{AttributeTypeDefinition, CatalogStore};
    use std::io::Write;

    #[tokio::test]
    async fn test_in_memory_source_replace() {
        let source = InMemoryCatalogSource::default();
        assert!(source.load().await.unwrap().policies.is_empty());

        source
            .replace(
                CatalogDefinition::new()
                    .with_attribute(AttributeTypeDefinition::new("department", "subject", "string")),
            )
            .await;
        assert_eq!(source.load().await.unwrap().attribute_types.len(), 1);
    }

    #[tokio::test]
    async fn test_json_file_source() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "attribute_types": [{{"code": "department", "category": "subject", "value_kind": "string"}}],
                "policies": [{{
                    "id": "p1", "effect": "ALLOW",
                    "rules": [{{"attribute": "department", "operator": "eq", "value": "HR"}}]
                }}]
            }}"#
        )
        .unwrap();

        let source = JsonFileCatalogSource::new(file.path());
        let store = CatalogStore::new();
        let snapshot = store.reload_from(&source).await.unwrap();

        assert_eq!(snapshot.version(), 1);
        assert_eq!(snapshot.policies().count(), 1);
    }

    #[tokio::test]
    async fn test_missing_file_is_error() {
        let source = JsonFileCatalogSource::new("/nonexistent/catalog.json");
        assert!(source.load().await.is_err());
    }
}
