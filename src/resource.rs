//! Resource descriptors and request types
//!
//! A `ResourceFile` names the logical file to materialize; its mirrors are the
//! candidate sources. Requests pair a resource with storage options and the
//! mirror chosen at admission time.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::downloader::downloadable::Downloadable;

/// One source URI for a resource.
///
/// The `info` map carries host-provided scalar metadata; `"weight"` drives the
/// mirror ordering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Mirror {
    /// Unique mirror id
    pub id: String,

    /// URI-like location; the scheme selects the processor
    pub location: String,

    /// Scalar metadata (weight, region, labels...)
    #[serde(default)]
    pub info: HashMap<String, serde_json::Value>,
}

impl Mirror {
    pub fn new(id: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            location: location.into(),
            info: HashMap::new(),
        }
    }

    /// Builder-style weight assignment.
    pub fn with_weight(mut self, weight: i64) -> Self {
        self.info
            .insert("weight".to_string(), serde_json::Value::from(weight));
        self
    }

    /// Ordering weight, read from `info["weight"]`. Missing or non-numeric
    /// values count as 0.
    pub fn weight(&self) -> i64 {
        self.info
            .get("weight")
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
    }
}

/// Immutable descriptor of a logical file identified by a stable id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceFile {
    /// Primary key of the resource everywhere in the engine
    pub id: String,

    /// Final-fallback mirror
    pub main: Mirror,

    /// Alternative mirrors, tried in descending weight order
    #[serde(default)]
    pub alternatives: Vec<Mirror>,

    /// Publication timestamp used for freshness comparison against records
    pub created_at: Option<DateTime<Utc>>,
}

impl ResourceFile {
    pub fn new(id: impl Into<String>, main: Mirror) -> Self {
        Self {
            id: id.into(),
            main,
            alternatives: Vec::new(),
            created_at: None,
        }
    }

    pub fn with_alternatives(mut self, alternatives: Vec<Mirror>) -> Self {
        self.alternatives = alternatives;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Mirrors in selection order: alternatives sorted by descending weight
    /// (stable, so ties keep insertion order) with `main` appended as the
    /// final fallback.
    pub fn mirrors(&self) -> Vec<Mirror> {
        let mut sorted = self.alternatives.clone();
        sorted.sort_by_key(|m| std::cmp::Reverse(m.weight()));
        sorted.push(self.main.clone());
        sorted
    }

    /// Look up a mirror by id across main and alternatives.
    pub fn mirror(&self, mirror_id: &str) -> Option<&Mirror> {
        if self.main.id == mirror_id {
            return Some(&self.main);
        }
        self.alternatives.iter().find(|m| m.id == mirror_id)
    }

    /// Whether any of this resource's mirrors carries the given id.
    pub fn has_mirror(&self, mirror_id: &str) -> bool {
        self.mirror(mirror_id).is_some()
    }
}

/// Where a stored file lives on disk.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoragePriority {
    /// Space-reclaimable cache location
    Cached,
    /// Durable support location
    Permanent,
}

impl Default for StoragePriority {
    fn default() -> Self {
        Self::Cached
    }
}

impl StoragePriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cached => "CACHED",
            Self::Permanent => "PERMANENT",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "PERMANENT" => Self::Permanent,
            _ => Self::Cached,
        }
    }
}

/// Scheduling hint given to the manager at enqueue time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadPriority {
    Normal,
    High,
    Urgent,
}

impl Default for DownloadPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl DownloadPriority {
    /// Numeric priority applied to the downloadable; higher dequeues first.
    pub fn value(&self) -> i32 {
        match self {
            Self::Normal => 0,
            Self::High => 100,
            Self::Urgent => 200,
        }
    }
}

/// Per-request options.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadOptions {
    pub storage_priority: StoragePriority,
}

impl DownloadOptions {
    pub fn permanent() -> Self {
        Self {
            storage_priority: StoragePriority::Permanent,
        }
    }

    pub fn cached() -> Self {
        Self {
            storage_priority: StoragePriority::Cached,
        }
    }
}

/// User-level download intent produced by the cache at admission time.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub resource: Arc<ResourceFile>,
    pub options: DownloadOptions,
    /// Mirror selected when the request was admitted; the task's first
    /// dispatch consumes this selection
    pub initial_mirror: Mirror,
}

impl DownloadRequest {
    pub fn resource_id(&self) -> &str {
        &self.resource.id
    }
}

/// A mirror choice paired with the downloadable materialized from it.
#[derive(Debug, Clone)]
pub struct MirrorSelection {
    pub resource_id: String,
    pub mirror: Mirror,
    pub downloadable: Downloadable,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource_with_weights() -> ResourceFile {
        ResourceFile::new("r1", Mirror::new("main", "http://main/a")).with_alternatives(vec![
            Mirror::new("m-low", "http://low/a").with_weight(1),
            Mirror::new("m-high", "http://high/a").with_weight(10),
            Mirror::new("m-mid", "http://mid/a").with_weight(5),
        ])
    }

    #[test]
    fn test_mirror_weight_default_zero() {
        let mirror = Mirror::new("m1", "http://example/a");
        assert_eq!(mirror.weight(), 0);
        assert_eq!(mirror.clone().with_weight(7).weight(), 7);
    }

    #[test]
    fn test_mirrors_sorted_descending_with_main_last() {
        let resource = resource_with_weights();
        let order: Vec<String> = resource.mirrors().into_iter().map(|m| m.id).collect();
        assert_eq!(order, vec!["m-high", "m-mid", "m-low", "main"]);
    }

    #[test]
    fn test_mirrors_stable_on_ties() {
        let resource = ResourceFile::new("r1", Mirror::new("main", "http://main/a"))
            .with_alternatives(vec![
                Mirror::new("a", "http://a").with_weight(3),
                Mirror::new("b", "http://b").with_weight(3),
            ]);
        let ids: Vec<String> = resource.mirrors().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["a", "b", "main"]);
    }

    #[test]
    fn test_mirror_lookup_spans_main_and_alternatives() {
        let resource = resource_with_weights();
        assert!(resource.has_mirror("main"));
        assert!(resource.has_mirror("m-mid"));
        assert!(!resource.has_mirror("nope"));
    }

    #[test]
    fn test_priority_values_order() {
        assert!(DownloadPriority::Urgent.value() > DownloadPriority::High.value());
        assert!(DownloadPriority::High.value() > DownloadPriority::Normal.value());
    }
}
