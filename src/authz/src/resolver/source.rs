//! Attribute sources: upstream lookups that fill in request context

use crate::error::{AbacError, Result};
use crate::types::{AccessRequest, AttributeCategory, RawAttributes};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;

/// Read-only upstream attribute lookup
///
/// Implementations return values for the `keys` they know and omit the rest.
/// A missing upstream record is [`AbacError::AttributeResolution`]; a
/// transient outage is [`AbacError::SourceUnavailable`] and will be retried.
#[async_trait]
pub trait AttributeSource: Send + Sync {
    async fn fetch(
        &self,
        category: AttributeCategory,
        request: &AccessRequest,
        keys: &[String],
    ) -> Result<RawAttributes>;
}

/// Records keyed by entity id (employee directory, org units, documents)
///
/// The entity id is read from the request's own category map at `id_key`.
pub struct DirectorySource {
    id_key: String,
    records: RwLock<HashMap<String, RawAttributes>>,
    require_record: bool,
}

impl DirectorySource {
    /// Directory where a missing record fails resolution
    pub fn new(id_key: impl Into<String>) -> Self {
        Self {
            id_key: id_key.into(),
            records: RwLock::new(HashMap::new()),
            require_record: true,
        }
    }

    /// Treat unknown ids as "nothing to add" instead of an error
    pub fn optional(mut self) -> Self {
        self.require_record = false;
        self
    }

    pub fn with_record(self, id: impl Into<String>, attributes: RawAttributes) -> Self {
        self.insert(id, attributes);
        self
    }

    pub fn insert(&self, id: impl Into<String>, attributes: RawAttributes) {
        self.records.write().insert(id.into(), attributes);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl AttributeSource for DirectorySource {
    async fn fetch(
        &self,
        category: AttributeCategory,
        request: &AccessRequest,
        keys: &[String],
    ) -> Result<RawAttributes> {
        let id = match request.category(category).get(&self.id_key) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };

        let Some(id) = id else {
            if self.require_record {
                return Err(AbacError::AttributeResolution(format!(
                    "{} context has no '{}' to look up",
                    category, self.id_key
                )));
            }
            return Ok(RawAttributes::new());
        };

        let records = self.records.read();
        match records.get(&id) {
            Some(record) => Ok(keys
                .iter()
                .filter_map(|key| record.get(key).map(|v| (key.clone(), v.clone())))
                .collect()),
            None if self.require_record => Err(AbacError::AttributeResolution(format!(
                "{} record '{}' not found",
                category, id
            ))),
            None => Ok(RawAttributes::new()),
        }
    }
}

/// Environment attributes derived from the evaluation clock (UTC)
///
/// Provides `current_time`, `current_date`, `current_datetime`,
/// `day_of_week`, `is_weekend` and `hour`.
#[derive(Debug, Clone, Default)]
pub struct ClockEnvironmentSource {
    fixed: Option<DateTime<Utc>>,
}

impl ClockEnvironmentSource {
    /// Use the system clock
    pub fn system() -> Self {
        Self { fixed: None }
    }

    /// Always report the given instant
    pub fn fixed(at: DateTime<Utc>) -> Self {
        Self { fixed: Some(at) }
    }

    /// Every environment attribute for the given instant
    pub fn attributes_at(at: DateTime<Utc>) -> RawAttributes {
        let weekday = at.weekday();
        let mut attrs = RawAttributes::new();
        attrs.insert("current_time".into(), Value::from(at.format("%H:%M:%S").to_string()));
        attrs.insert("current_date".into(), Value::from(at.format("%Y-%m-%d").to_string()));
        attrs.insert("current_datetime".into(), Value::from(at.to_rfc3339()));
        attrs.insert("day_of_week".into(), Value::from(at.format("%A").to_string()));
        attrs.insert(
            "is_weekend".into(),
            Value::from(matches!(weekday, Weekday::Sat | Weekday::Sun)),
        );
        attrs.insert("hour".into(), Value::from(at.hour()));
        attrs
    }
}

#[async_trait]
impl AttributeSource for ClockEnvironmentSource {
    async fn fetch(
        &self,
        _category: AttributeCategory,
        _request: &AccessRequest,
        keys: &[String],
    ) -> Result<RawAttributes> {
        let at = self.fixed.unwrap_or_else(Utc::now);
        let mut all = Self::attributes_at(at);
        Ok(keys
            .iter()
            .filter_map(|key| all.remove(key).map(|v| (key.clone(), v)))
            .collect())
    }
}
