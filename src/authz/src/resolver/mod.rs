//! Attribute resolution
//!
//! Turns a raw [`AccessRequest`] into a typed [`AttributeMap`] holding only
//! the attributes referenced by policies that apply to the request. Values
//! the caller did not supply are fetched from the [`AttributeSource`]
//! registered for their category; categories are fetched concurrently and
//! each key at most once per request. Nothing is cached across requests.

pub mod source;

pub use source::{AttributeSource, ClockEnvironmentSource, DirectorySource};

use crate::catalog::CatalogSnapshot;
use crate::error::Result;
use crate::types::{AccessRequest, AttributeCategory, AttributeMap, AttributeValue, RawAttributes};
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Placeholder stored in audit snapshots for sensitive values
pub const REDACTED: &str = "[REDACTED]";

/// Bounded exponential backoff for attribute source I/O
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_backoff: Duration,

    /// Backoff growth factor
    pub multiplier: u32,
}

impl RetryPolicy {
    /// Single attempt, no retry
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            multiplier: 1,
        }
    }

    /// Delay before the retry after one that waited `current`; saturates
    pub fn next_backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(self.multiplier)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            multiplier: 2,
        }
    }
}

/// Resolved attributes for one request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedAttributes {
    /// Typed values keyed by attribute code
    pub values: AttributeMap,

    /// Coercion and validation problems (the attribute is treated as absent)
    pub diagnostics: Vec<String>,
}

impl ResolvedAttributes {
    /// JSON snapshot of the values with sensitive attributes redacted
    pub fn redacted(
        &self,
        catalog: &CatalogSnapshot,
        redact: &HashSet<String>,
    ) -> BTreeMap<String, Value> {
        self.values
            .iter()
            .map(|(code, value)| {
                let sensitive = redact.contains(code)
                    || catalog.attribute_type(code).is_some_and(|a| a.sensitive);
                let json = if sensitive {
                    Value::String(REDACTED.to_string())
                } else {
                    value.to_json()
                };
                (code.clone(), json)
            })
            .collect()
    }
}

/// Attribute resolver
pub struct AttributeResolver {
    sources: HashMap<AttributeCategory, Arc<dyn AttributeSource>>,
    retry: RetryPolicy,
}

impl AttributeResolver {
    /// Resolver with the system-clock environment source
    pub fn new() -> Self {
        Self::without_sources().with_source(
            AttributeCategory::Environment,
            Arc::new(ClockEnvironmentSource::system()),
        )
    }

    /// Resolver that only reads the request itself
    pub fn without_sources() -> Self {
        Self {
            sources: HashMap::new(),
            retry: RetryPolicy::default(),
        }
    }

    /// Register (or replace) the source for a category
    pub fn with_source(
        mut self,
        category: AttributeCategory,
        source: Arc<dyn AttributeSource>,
    ) -> Self {
        self.sources.insert(category, source);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Resolve the attributes referenced by applicable policies
    pub async fn resolve(
        &self,
        request: &AccessRequest,
        catalog: &CatalogSnapshot,
        at: DateTime<Utc>,
    ) -> Result<ResolvedAttributes> {
        let referenced = catalog.referenced_attributes(request, at);
        if referenced.is_empty() {
            return Ok(ResolvedAttributes::default());
        }

        // Keys the request lacks, deduplicated per category
        let mut missing: BTreeMap<AttributeCategory, BTreeSet<String>> = BTreeMap::new();
        for attr in &referenced {
            let key = attr.source_key();
            if !request.category(attr.category).contains_key(key)
                && self.sources.contains_key(&attr.category)
            {
                missing.entry(attr.category).or_default().insert(key.to_string());
            }
        }

        let fetches = missing.into_iter().filter_map(|(category, keys)| {
            let source = self.sources.get(&category).cloned()?;
            Some(async move {
                let keys: Vec<String> = keys.into_iter().collect();
                let values = self
                    .fetch_with_retry(source.as_ref(), category, request, &keys)
                    .await?;
                Ok::<_, crate::error::AbacError>((category, values))
            })
        });

        let fetched: HashMap<AttributeCategory, RawAttributes> =
            try_join_all(fetches).await?.into_iter().collect();

        let mut resolved = ResolvedAttributes::default();
        for attr in referenced {
            let key = attr.source_key();
            let raw = request
                .category(attr.category)
                .get(key)
                .or_else(|| fetched.get(&attr.category).and_then(|values| values.get(key)));

            let Some(raw) = raw.filter(|v| !v.is_null()) else {
                continue;
            };

            match AttributeValue::coerce(raw, attr.value_kind) {
                Ok(value) if attr.permits(&value) => {
                    resolved.values.insert(attr.code.clone(), value);
                }
                Ok(value) => resolved.diagnostics.push(format!(
                    "attribute '{}': {} is not an allowed value",
                    attr.code, value
                )),
                Err(reason) => resolved.diagnostics.push(format!(
                    "attribute '{}' is not a valid {}: {}",
                    attr.code, attr.value_kind, reason
                )),
            }
        }

        debug!(
            "Resolved {} attributes ({} diagnostics)",
            resolved.values.len(),
            resolved.diagnostics.len()
        );

        Ok(resolved)
    }

    async fn fetch_with_retry(
        &self,
        source: &dyn AttributeSource,
        category: AttributeCategory,
        request: &AccessRequest,
        keys: &[String],
    ) -> Result<RawAttributes> {
        let mut attempt = 1;
        let mut backoff = self.retry.initial_backoff;

        loop {
            match source.fetch(category, request, keys).await {
                Ok(values) => return Ok(values),
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    warn!(
                        "{} attribute source failed (attempt {}/{}): {}; retrying in {:?}",
                        category, attempt, self.retry.max_attempts, e, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = self.retry.next_backoff(backoff);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for AttributeResolver {
    fn default() -> Self {
        Self::new()
    }
}
