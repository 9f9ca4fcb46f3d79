//! Filter types for similarity search
//!
//! The namespace condition is pushed down to the vector store as a SQL
//! predicate. Metadata and creation-time conditions are checked on the
//! decoded entries; metadata is stored as an opaque JSON column.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::types::{MemoryEntry, Metadata};

/// Filter criteria for `search`.
///
/// All fields are optional and combined with AND logic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilter {
    /// Restrict to one namespace
    #[serde(default)]
    pub namespace: Option<String>,
    /// Every tag listed here must be present with the same value
    #[serde(default)]
    pub metadata: Metadata,
    /// Only entries created at or after this instant
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    /// Drop hits farther than this distance
    #[serde(default)]
    pub max_distance: Option<f32>,
}

impl SearchFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn with_max_distance(mut self, max_distance: f32) -> Self {
        self.max_distance = Some(max_distance);
        self
    }

    /// SQL predicate for the conditions the vector store can evaluate.
    /// Returns `None` if there are none.
    pub fn to_sql_clause(&self) -> Option<String> {
        let mut conditions = Vec::new();

        if let Some(ref namespace) = self.namespace {
            conditions.push(format!("namespace = '{}'", escape_sql(namespace)));
        }

        if conditions.is_empty() {
            None
        } else {
            Some(conditions.join(" AND "))
        }
    }

    /// Metadata, creation-time and distance conditions, evaluated after decoding
    pub fn matches(&self, entry: &MemoryEntry, distance: f32) -> bool {
        if self.max_distance.is_some_and(|max| distance > max) {
            return false;
        }
        if self.since.is_some_and(|since| entry.created_at < since) {
            return false;
        }
        self.metadata
            .iter()
            .all(|(k, v)| entry.metadata.get(k) == Some(v))
    }

    pub fn has_post_filters(&self) -> bool {
        !self.metadata.is_empty() || self.max_distance.is_some() || self.since.is_some()
    }
}

/// Escape a string literal for a SQL predicate
pub(crate) fn escape_sql(value: &str) -> String {
    value.replace('\'', "''")
}
