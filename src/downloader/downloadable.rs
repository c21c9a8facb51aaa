//! Downloadable
//!
//! The runtime handle for one mirror transfer. A downloadable is materialized
//! from a mirror when a selection is created and destroyed when the task
//! advances past it (success, cancel, or retry to the next mirror).

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::progress::{Progress, TransferProgress};
use crate::resource::Mirror;

/// Transport family selected by the mirror's URI scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadKind {
    Http,
    CloudAsset,
}

impl DownloadKind {
    /// Parse the transport family from a location string. Unknown schemes
    /// produce no kind, and therefore no downloadable.
    pub fn from_location(location: &str) -> Option<Self> {
        let scheme = location.split("://").next()?;
        match scheme {
            "http" | "https" => Some(Self::Http),
            "cloudkit" => Some(Self::CloudAsset),
            _ => None,
        }
    }
}

/// Durable description of an in-flight transfer, persisted by processors so
/// interrupted work can be reattached after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferDescriptor {
    pub resource_id: String,
    pub mirror_id: String,
    pub location: String,
    pub expected_bytes: u64,
}

#[derive(Debug)]
struct TransferState {
    progress: TransferProgress,
    started_at: Option<Instant>,
}

#[derive(Debug)]
struct Inner {
    resource_id: String,
    mirror_id: String,
    location: String,
    kind: DownloadKind,
    priority: AtomicI32,
    state: Mutex<TransferState>,
    cancel_token: CancellationToken,
}

/// Cloneable handle for one mirror fetch. Clones share transfer state.
#[derive(Debug, Clone)]
pub struct Downloadable {
    inner: Arc<Inner>,
}

impl Downloadable {
    /// Materialize a downloadable from a mirror. Returns `None` when the
    /// mirror's scheme maps to no known transport.
    pub fn from_mirror(resource_id: &str, mirror: &Mirror) -> Option<Self> {
        let kind = DownloadKind::from_location(&mirror.location)?;
        Some(Self::new(resource_id, &mirror.id, &mirror.location, kind, 0))
    }

    /// Reconstruct a downloadable from a persisted transfer descriptor.
    pub fn from_descriptor(descriptor: &TransferDescriptor) -> Option<Self> {
        let kind = DownloadKind::from_location(&descriptor.location)?;
        let downloadable = Self::new(
            &descriptor.resource_id,
            &descriptor.mirror_id,
            &descriptor.location,
            kind,
            0,
        );
        {
            let mut state = downloadable.inner.state.lock().unwrap();
            state.progress.total_bytes = descriptor.expected_bytes;
        }
        Some(downloadable)
    }

    fn new(
        resource_id: &str,
        mirror_id: &str,
        location: &str,
        kind: DownloadKind,
        priority: i32,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                resource_id: resource_id.to_string(),
                mirror_id: mirror_id.to_string(),
                location: location.to_string(),
                kind,
                priority: AtomicI32::new(priority),
                state: Mutex::new(TransferState {
                    progress: TransferProgress::new(),
                    started_at: None,
                }),
                cancel_token: CancellationToken::new(),
            }),
        }
    }

    pub fn resource_id(&self) -> &str {
        &self.inner.resource_id
    }

    /// The downloadable's identifier is its mirror id; request lookup matches
    /// it against any of a resource's mirrors so retries still resolve.
    pub fn mirror_id(&self) -> &str {
        &self.inner.mirror_id
    }

    pub fn location(&self) -> &str {
        &self.inner.location
    }

    pub fn kind(&self) -> DownloadKind {
        self.inner.kind
    }

    pub fn priority(&self) -> i32 {
        self.inner.priority.load(Ordering::Relaxed)
    }

    pub fn set_priority(&self, priority: i32) {
        self.inner.priority.store(priority, Ordering::Relaxed);
    }

    /// Request cooperative cancellation of the transfer.
    pub fn cancel(&self) {
        self.inner.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel_token.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel_token.clone()
    }

    /// Record transfer advancement; speed and ETA derive from the time of the
    /// first recorded byte.
    pub fn record_transfer(&self, transferred: u64, expected: u64) {
        let mut state = self.inner.state.lock().unwrap();
        let started = *state.started_at.get_or_insert_with(Instant::now);
        let elapsed = started.elapsed().as_secs_f64();
        state.progress.update(transferred, expected, elapsed);
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.inner.state.lock().unwrap().progress.transferred_bytes
    }

    pub fn expected_bytes(&self) -> u64 {
        self.inner.state.lock().unwrap().progress.total_bytes
    }

    /// Snapshot of the live transfer figures.
    pub fn transfer_progress(&self) -> TransferProgress {
        self.inner.state.lock().unwrap().progress.clone()
    }

    /// Unit view used by the progress aggregator.
    pub fn progress(&self) -> Progress {
        self.inner.state.lock().unwrap().progress.as_progress()
    }

    /// Durable descriptor for crash recovery.
    pub fn descriptor(&self) -> TransferDescriptor {
        let state = self.inner.state.lock().unwrap();
        TransferDescriptor {
            resource_id: self.inner.resource_id.clone(),
            mirror_id: self.inner.mirror_id.clone(),
            location: self.inner.location.clone(),
            expected_bytes: state.progress.total_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_location() {
        assert_eq!(
            DownloadKind::from_location("http://example/a"),
            Some(DownloadKind::Http)
        );
        assert_eq!(
            DownloadKind::from_location("https://example/a"),
            Some(DownloadKind::Http)
        );
        assert_eq!(
            DownloadKind::from_location("cloudkit://container:type:rec1"),
            Some(DownloadKind::CloudAsset)
        );
        assert_eq!(DownloadKind::from_location("ftp://example/a"), None);
        assert_eq!(DownloadKind::from_location("not a url"), None);
    }

    #[test]
    fn test_unknown_scheme_produces_no_downloadable() {
        let mirror = Mirror::new("m1", "gopher://example/a");
        assert!(Downloadable::from_mirror("r1", &mirror).is_none());
    }

    #[test]
    fn test_clones_share_transfer_state() {
        let mirror = Mirror::new("m1", "http://example/a");
        let downloadable = Downloadable::from_mirror("r1", &mirror).unwrap();
        let clone = downloadable.clone();

        downloadable.record_transfer(100, 1000);
        assert_eq!(clone.transferred_bytes(), 100);

        clone.set_priority(7);
        assert_eq!(downloadable.priority(), 7);
    }

    #[test]
    fn test_descriptor_round_trip() {
        let mirror = Mirror::new("m1", "http://example/file.bin");
        let downloadable = Downloadable::from_mirror("r1", &mirror).unwrap();
        downloadable.record_transfer(10, 4096);

        let descriptor = downloadable.descriptor();
        let json = serde_json::to_string(&descriptor).unwrap();
        let decoded: TransferDescriptor = serde_json::from_str(&json).unwrap();
        let revived = Downloadable::from_descriptor(&decoded).unwrap();

        assert_eq!(revived.resource_id(), "r1");
        assert_eq!(revived.mirror_id(), "m1");
        assert_eq!(revived.expected_bytes(), 4096);
    }

    #[test]
    fn test_cancel_sets_token() {
        let mirror = Mirror::new("m1", "http://example/a");
        let downloadable = Downloadable::from_mirror("r1", &mirror).unwrap();
        assert!(!downloadable.is_cancelled());
        downloadable.cancel();
        assert!(downloadable.is_cancelled());
    }
}
