//! Server configuration from environment variables
//!
//! | Variable            | Default | Meaning                                   |
//! |---------------------|---------|-------------------------------------------|
//! | `PORT`              | 8080    | HTTP port                                 |
//! | `METRICS_PORT`      | 9090    | Prometheus port                           |
//! | `ABAC_CATALOG_PATH` | unset   | JSON catalog file (empty catalog if unset)|
//! | `ABAC_AUDIT_PATH`   | unset   | JSONL audit file (in-memory if unset)     |
//! | `ABAC_DEADLINE_MS`  | 250     | Default per-request deadline              |
//! | `ABAC_AUDIT_BUFFER` | 1024    | Audit queue capacity                      |
//! | `ABAC_REDACT`       | unset   | Comma-separated attribute codes to redact |

use crate::engine::EngineConfig;
use crate::error::{AbacError, Result};
use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub port: u16,
    pub metrics_port: u16,
    pub catalog_path: Option<PathBuf>,
    pub audit_path: Option<PathBuf>,
    pub deadline: Duration,
    pub audit_buffer: usize,
    pub redacted_attributes: HashSet<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            metrics_port: 9090,
            catalog_path: None,
            audit_path: None,
            deadline: Duration::from_millis(250),
            audit_buffer: 1024,
            redacted_attributes: HashSet::new(),
        }
    }
}

impl ServerConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary variable lookup
    ///
    /// Unset or empty variables take their defaults; unparsable values are
    /// configuration errors rather than silent fallbacks.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Ok(Self {
            port: parse_or(&get, "PORT", defaults.port)?,
            metrics_port: parse_or(&get, "METRICS_PORT", defaults.metrics_port)?,
            catalog_path: get("ABAC_CATALOG_PATH").map(PathBuf::from),
            audit_path: get("ABAC_AUDIT_PATH").map(PathBuf::from),
            deadline: Duration::from_millis(parse_or(
                &get,
                "ABAC_DEADLINE_MS",
                defaults.deadline.as_millis() as u64,
            )?),
            audit_buffer: parse_or(&get, "ABAC_AUDIT_BUFFER", defaults.audit_buffer)?,
            redacted_attributes: get("ABAC_REDACT")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|code| !code.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
        })
    }

    /// Engine configuration derived from this server configuration
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            default_deadline: self.deadline,
            audit_buffer: self.audit_buffer,
            redacted_attributes: self.redacted_attributes.clone(),
            ..EngineConfig::default()
        }
    }
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| AbacError::configuration(key, format!("invalid value '{}': {}", raw, e))),
        None => Ok(default),
    }
}
