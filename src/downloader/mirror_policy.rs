//! Weighted Mirror Policy
//!
//! Orders a resource's mirrors by descending weight with `main` as the final
//! fallback, and enforces a per-(resource, mirror) retry budget.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::downloader::downloadable::Downloadable;
use crate::error::FetchError;
use crate::resource::{Mirror, MirrorSelection, ResourceFile};

pub const DEFAULT_RETRY_BUDGET: u32 = 3;

/// Weighted mirror selection with a bounded retry budget per mirror.
pub struct WeightedMirrorPolicy {
    max_retries: u32,
    /// (resource id, mirror id) -> attempts handed out
    counters: Mutex<HashMap<(String, String), u32>>,
}

impl WeightedMirrorPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries: max_retries.max(1),
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Selection for a fresh request (no prior mirror).
    pub fn initial_selection(&self, resource: &ResourceFile) -> Option<MirrorSelection> {
        self.next_selection(resource, None, None)
    }

    /// Pick the mirror after `last_mirror_id`.
    ///
    /// The walk starts at the index following the prior mirror (index 0 with
    /// no prior), skips mirrors whose downloadable cannot be materialized, and
    /// clamps to the last materializable mirror when it runs off the end.
    /// Returns `None` once the chosen mirror's budget is spent.
    pub fn next_selection(
        &self,
        resource: &ResourceFile,
        last_mirror_id: Option<&str>,
        error: Option<&FetchError>,
    ) -> Option<MirrorSelection> {
        let mirrors = resource.mirrors();
        if mirrors.is_empty() {
            tracing::warn!("Resource {} has no mirrors", resource.id);
            return None;
        }

        let start = match last_mirror_id {
            None => 0,
            Some(id) => mirrors
                .iter()
                .position(|m| m.id == id)
                .map(|i| i + 1)
                .unwrap_or(0),
        };

        let chosen = Self::walk(&resource.id, &mirrors, start)?;
        let (mirror, downloadable) = chosen;

        {
            let mut counters = self.counters.lock().unwrap();
            let count = counters
                .entry((resource.id.clone(), mirror.id.clone()))
                .or_insert(0);
            if *count >= self.max_retries {
                tracing::debug!(
                    "Mirror {} exhausted for resource {} ({}/{} attempts)",
                    mirror.id,
                    resource.id,
                    count,
                    self.max_retries
                );
                return None;
            }
            *count += 1;
        }

        if let Some(err) = error {
            tracing::debug!(
                "Resource {}: falling over to mirror {} after {}",
                resource.id,
                mirror.id,
                err
            );
        }

        Some(MirrorSelection {
            resource_id: resource.id.clone(),
            mirror,
            downloadable,
        })
    }

    /// Walk forward from `start`, skipping unmaterializable mirrors; when the
    /// walk passes the end, clamp back to the last materializable mirror.
    fn walk(
        resource_id: &str,
        mirrors: &[Mirror],
        start: usize,
    ) -> Option<(Mirror, Downloadable)> {
        for mirror in mirrors.iter().skip(start) {
            if let Some(downloadable) = Downloadable::from_mirror(resource_id, mirror) {
                return Some((mirror.clone(), downloadable));
            }
        }
        for mirror in mirrors.iter().rev() {
            if let Some(downloadable) = Downloadable::from_mirror(resource_id, mirror) {
                return Some((mirror.clone(), downloadable));
            }
        }
        tracing::warn!("No mirror of resource {} is materializable", resource_id);
        None
    }

    /// Non-mutating probe: the mirror a subsequent `next_selection` would
    /// hand out, or `None` when its budget is already spent.
    pub fn peek_next(
        &self,
        resource: &ResourceFile,
        last_mirror_id: Option<&str>,
    ) -> Option<Mirror> {
        let mirrors = resource.mirrors();
        if mirrors.is_empty() {
            return None;
        }
        let start = match last_mirror_id {
            None => 0,
            Some(id) => mirrors
                .iter()
                .position(|m| m.id == id)
                .map(|i| i + 1)
                .unwrap_or(0),
        };
        let (mirror, _) = Self::walk(&resource.id, &mirrors, start)?;
        let counters = self.counters.lock().unwrap();
        let count = counters
            .get(&(resource.id.clone(), mirror.id.clone()))
            .copied()
            .unwrap_or(0);
        if count >= self.max_retries {
            None
        } else {
            Some(mirror)
        }
    }

    /// Clear all budget counters for a resource after it completes.
    pub fn download_complete(&self, resource_id: &str) {
        let mut counters = self.counters.lock().unwrap();
        counters.retain(|(rid, _), _| rid != resource_id);
    }

    #[cfg(test)]
    fn attempts(&self, resource_id: &str, mirror_id: &str) -> u32 {
        self.counters
            .lock()
            .unwrap()
            .get(&(resource_id.to_string(), mirror_id.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

impl Default for WeightedMirrorPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_BUDGET)
    }
}
