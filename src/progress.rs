//! Progress Tracking and Aggregation
//!
//! Per-transfer progress with speed/ETA estimation, plus hierarchical
//! progress nodes that combine a group of downloads into one figure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::FetchError;

/// Unit-based progress of one download.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Progress {
    pub total_units: u64,
    pub completed_units: u64,
}

impl Progress {
    pub fn new(total_units: u64) -> Self {
        Self {
            total_units,
            completed_units: 0,
        }
    }

    pub fn fraction_completed(&self) -> f64 {
        if self.total_units == 0 {
            0.0
        } else {
            (self.completed_units as f64 / self.total_units as f64).min(1.0)
        }
    }

    pub fn is_finished(&self) -> bool {
        self.total_units > 0 && self.completed_units >= self.total_units
    }
}

/// Byte-level progress of one live transfer with speed estimation.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TransferProgress {
    /// Bytes transferred so far
    pub transferred_bytes: u64,

    /// Expected total size in bytes (0 when unknown)
    pub total_bytes: u64,

    /// Current transfer speed in bytes/sec
    pub speed_bytes_per_sec: f64,

    /// Estimated time remaining in seconds
    pub eta_seconds: f64,
}

impl TransferProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the transfer figures.
    pub fn update(&mut self, transferred: u64, total: u64, elapsed_seconds: f64) {
        self.transferred_bytes = if total > 0 {
            transferred.min(total)
        } else {
            transferred
        };
        self.total_bytes = total;

        if elapsed_seconds > 0.0 {
            self.speed_bytes_per_sec = (self.transferred_bytes as f64 / elapsed_seconds).max(0.0);

            if self.speed_bytes_per_sec > 0.0 && total > 0 {
                let remaining = total.saturating_sub(self.transferred_bytes);
                self.eta_seconds = (remaining as f64 / self.speed_bytes_per_sec).max(0.0);
            } else {
                self.eta_seconds = 0.0;
            }
        }
    }

    /// Mark the transfer complete.
    pub fn complete(&mut self) {
        self.transferred_bytes = self.total_bytes;
        self.speed_bytes_per_sec = 0.0;
        self.eta_seconds = 0.0;
    }

    /// Reset for a retry against a different mirror.
    pub fn reset(&mut self) {
        self.transferred_bytes = 0;
        self.speed_bytes_per_sec = 0.0;
        self.eta_seconds = 0.0;
    }

    /// Unit view of this transfer. In byte units one extra unit is reserved
    /// for the post-transfer move into the cache.
    pub fn as_progress(&self) -> Progress {
        Progress {
            total_units: self.total_bytes,
            completed_units: self.transferred_bytes.min(self.total_bytes),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ProgressItem {
    progress: Progress,
    stored: bool,
    error: Option<FetchError>,
}

#[derive(Debug, Default)]
struct NodeState {
    items: HashMap<String, ProgressItem>,
    byte_units: bool,
}

/// Combined progress of a group of downloads.
///
/// Cloning shares state; all handles observe the same totals.
#[derive(Debug, Clone, Default)]
pub struct ProgressNode {
    state: Arc<Mutex<NodeState>>,
}

impl ProgressNode {
    /// Build a node over `ids`, seeding per-download progress from `initial`.
    /// With `byte_units` set, one extra unit per item is reserved for the
    /// post-transfer move.
    pub fn new(ids: &[String], initial: &HashMap<String, Progress>, byte_units: bool) -> Self {
        let mut items = HashMap::new();
        for id in ids {
            items.insert(
                id.clone(),
                ProgressItem {
                    progress: initial.get(id).copied().unwrap_or_default(),
                    stored: false,
                    error: None,
                },
            );
        }
        Self {
            state: Arc::new(Mutex::new(NodeState { items, byte_units })),
        }
    }

    /// Insert or replace the inner progress for one download.
    pub fn add(&self, progress: Progress, id: &str) {
        let mut state = self.state.lock().unwrap();
        let item = state.items.entry(id.to_string()).or_default();
        item.progress = progress;
    }

    /// Replace one download's inner progress after a retry; its completed
    /// contribution drops back to zero.
    pub fn retry(&self, id: &str, progress: Progress) {
        let mut state = self.state.lock().unwrap();
        if let Some(item) = state.items.get_mut(id) {
            item.progress = Progress {
                total_units: progress.total_units,
                completed_units: 0,
            };
            item.stored = false;
            item.error = None;
        }
    }

    /// Mark one download terminal: filled to its total on success, or tagged
    /// with the error on failure.
    pub fn complete(&self, id: &str, error: Option<FetchError>) {
        let mut state = self.state.lock().unwrap();
        if let Some(item) = state.items.get_mut(id) {
            match error {
                None => {
                    item.progress.completed_units = item.progress.total_units;
                    item.stored = true;
                    item.error = None;
                }
                Some(err) => {
                    item.error = Some(err);
                }
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.lock().unwrap().items.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.state.lock().unwrap().items.keys().cloned().collect()
    }

    /// Sum of per-download totals (+1 per item in byte units).
    pub fn total_units(&self) -> u64 {
        let state = self.state.lock().unwrap();
        let reserve = if state.byte_units { 1 } else { 0 };
        state
            .items
            .values()
            .map(|i| i.progress.total_units + reserve)
            .sum()
    }

    /// Sum of per-download completed units (+1 per stored item in byte units).
    pub fn completed_units(&self) -> u64 {
        let state = self.state.lock().unwrap();
        state
            .items
            .values()
            .map(|i| {
                let reserve = if state.byte_units && i.stored { 1 } else { 0 };
                i.progress.completed_units + reserve
            })
            .sum()
    }

    pub fn fraction_completed(&self) -> f64 {
        let total = self.total_units();
        if total == 0 {
            0.0
        } else {
            (self.completed_units() as f64 / total as f64).min(1.0)
        }
    }

    pub fn error(&self, id: &str) -> Option<FetchError> {
        self.state
            .lock()
            .unwrap()
            .items
            .get(id)
            .and_then(|i| i.error.clone())
    }

    /// Absorb `other` into this node: union of downloads, and for shared ids
    /// this node's per-item state wins.
    fn absorb(&self, other: &ProgressNode) {
        let other_items: Vec<(String, ProgressItem)> = {
            let state = other.state.lock().unwrap();
            state
                .items
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        let mut state = self.state.lock().unwrap();
        for (id, item) in other_items {
            state.items.entry(id).or_insert(item);
        }
    }
}

/// Memoizing registry of progress nodes keyed by group.
#[derive(Debug, Default)]
pub struct ProgressAggregator {
    nodes: Mutex<HashMap<String, ProgressNode>>,
}

impl ProgressAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Node for `group_key` over `ids`. Repeated calls return the memoized
    /// node; a node whose id set overlaps an existing node under another key
    /// merges that node in (union of downloads, newest state winning for
    /// shared ids).
    pub fn progress_node(&self, group_key: &str, ids: &[String]) -> ProgressNode {
        let mut nodes = self.nodes.lock().unwrap();

        if let Some(existing) = nodes.get(group_key) {
            let existing = existing.clone();
            for id in ids {
                if !existing.contains(id) {
                    existing.add(Progress::default(), id);
                }
            }
            return existing;
        }

        let node = ProgressNode::new(ids, &HashMap::new(), true);
        let overlapping: Vec<String> = nodes
            .iter()
            .filter(|(_, n)| ids.iter().any(|id| n.contains(id)))
            .map(|(k, _)| k.clone())
            .collect();
        for key in overlapping {
            if let Some(other) = nodes.get(&key) {
                node.absorb(other);
            }
        }

        nodes.insert(group_key.to_string(), node.clone());
        node
    }

    /// Apply a progress update to every node tracking `id`.
    pub fn update(&self, id: &str, progress: Progress) {
        let nodes = self.nodes.lock().unwrap();
        for node in nodes.values() {
            if node.contains(id) {
                node.add(progress, id);
            }
        }
    }

    /// Reset `id` in every node tracking it after a retry.
    pub fn retry(&self, id: &str, progress: Progress) {
        let nodes = self.nodes.lock().unwrap();
        for node in nodes.values() {
            node.retry(id, progress);
        }
    }

    /// Mark `id` terminal in every node tracking it.
    pub fn complete(&self, id: &str, error: Option<FetchError>) {
        let nodes = self.nodes.lock().unwrap();
        for node in nodes.values() {
            if node.contains(id) {
                node.complete(id, error.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_progress_update() {
        let mut progress = TransferProgress::new();
        progress.update(500, 1000, 1.0);

        assert_eq!(progress.transferred_bytes, 500);
        assert_eq!(progress.total_bytes, 1000);
        assert!((progress.speed_bytes_per_sec - 500.0).abs() < 0.01);
        assert!((progress.eta_seconds - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_transfer_progress_reset_for_retry() {
        let mut progress = TransferProgress::new();
        progress.update(800, 1000, 2.0);
        progress.reset();
        assert_eq!(progress.transferred_bytes, 0);
        assert_eq!(progress.speed_bytes_per_sec, 0.0);
    }

    #[test]
    fn test_node_sums_with_move_reserve() {
        let ids = vec!["a".to_string(), "b".to_string()];
        let mut initial = HashMap::new();
        initial.insert("a".to_string(), Progress::new(100));
        initial.insert("b".to_string(), Progress::new(50));
        let node = ProgressNode::new(&ids, &initial, true);

        // one reserved unit per item for the post-transfer move
        assert_eq!(node.total_units(), 152);
        assert_eq!(node.completed_units(), 0);

        node.add(
            Progress {
                total_units: 100,
                completed_units: 40,
            },
            "a",
        );
        assert_eq!(node.completed_units(), 40);

        node.complete("a", None);
        // item a contributes total + move unit once stored
        assert_eq!(node.completed_units(), 101);
    }

    #[test]
    fn test_node_retry_resets_item() {
        let ids = vec!["a".to_string()];
        let node = ProgressNode::new(&ids, &HashMap::new(), true);
        node.add(
            Progress {
                total_units: 100,
                completed_units: 70,
            },
            "a",
        );
        node.retry("a", Progress::new(100));
        assert_eq!(node.completed_units(), 0);
        assert_eq!(node.total_units(), 101);
    }

    #[test]
    fn test_node_complete_with_error_keeps_units() {
        let ids = vec!["a".to_string()];
        let node = ProgressNode::new(&ids, &HashMap::new(), true);
        node.add(
            Progress {
                total_units: 10,
                completed_units: 4,
            },
            "a",
        );
        node.complete("a", Some(FetchError::Timeout));
        assert_eq!(node.completed_units(), 4);
        assert!(matches!(node.error("a"), Some(FetchError::Timeout)));
    }

    #[test]
    fn test_aggregator_memoizes_by_group_key() {
        let aggregator = ProgressAggregator::new();
        let first = aggregator.progress_node("group", &["a".to_string()]);
        first.add(Progress::new(10), "a");
        let second = aggregator.progress_node("group", &["a".to_string(), "b".to_string()]);
        // same shared node, extended with the new id
        assert!(second.contains("a"));
        assert!(second.contains("b"));
        assert_eq!(first.ids().len(), second.ids().len());
    }

    #[test]
    fn test_aggregator_merges_overlapping_nodes() {
        let aggregator = ProgressAggregator::new();
        let left = aggregator.progress_node("g1", &["a".to_string(), "b".to_string()]);
        left.add(
            Progress {
                total_units: 10,
                completed_units: 5,
            },
            "b",
        );
        let merged = aggregator.progress_node("g2", &["b".to_string(), "c".to_string()]);
        assert!(merged.contains("a"));
        assert!(merged.contains("b"));
        assert!(merged.contains("c"));
    }

    #[test]
    fn test_aggregator_update_reaches_all_nodes() {
        let aggregator = ProgressAggregator::new();
        let one = aggregator.progress_node("g1", &["a".to_string()]);
        let two = aggregator.progress_node("g2", &["a".to_string(), "z".to_string()]);
        aggregator.update(
            "a",
            Progress {
                total_units: 100,
                completed_units: 25,
            },
        );
        assert_eq!(one.completed_units(), 25);
        assert_eq!(two.completed_units(), 25);
    }
}
