//! In-memory audit log

use super::{AuditQuery, AuditRecord, AuditSink};
use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

/// Append-only audit log held in memory
///
/// Nothing is ever evicted; suited to tests and single-process deployments
/// that ship records elsewhere.
#[derive(Default)]
pub struct InMemoryAuditLog {
    records: RwLock<Vec<AuditRecord>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditLog {
    fn name(&self) -> &str {
        "memory"
    }

    async fn append(&self, record: &AuditRecord) -> Result<()> {
        self.records.write().await.push(record.clone());
        Ok(())
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>> {
        let records = self.records.read().await;
        Ok(query.apply(records.iter()))
    }
}
