//! JSON Lines audit log

use super::{AuditQuery, AuditRecord, AuditSink};
use crate::error::{AbacError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Append-only file with one JSON record per line
pub struct JsonlAuditLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl JsonlAuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for JsonlAuditLog {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn append(&self, record: &AuditRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| {
                    AbacError::AuditWrite(format!("failed to open {}: {}", self.path.display(), e))
                })?;
            debug!("Opened audit log {}", self.path.display());
            *guard = Some(file);
        }

        let Some(file) = guard.as_mut() else {
            return Err(AbacError::Internal("audit file handle missing".to_string()));
        };

        let written = async {
            file.write_all(&line).await?;
            file.flush().await
        }
        .await;

        if let Err(e) = written {
            // Reopen on the next append
            *guard = None;
            return Err(AbacError::AuditWrite(format!(
                "failed to write {}: {}",
                self.path.display(),
                e
            )));
        }

        Ok(())
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let records: Vec<AuditRecord> = raw
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .filter_map(|(index, line)| match serde_json::from_str(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(
                        "Skipping malformed audit line {} in {}: {}",
                        index + 1,
                        self.path.display(),
                        e
                    );
                    None
                }
            })
            .collect();

        Ok(query.apply(records.iter()))
    }
}
