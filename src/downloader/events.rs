//! Download Events
//!
//! Observer seams for queue and manager callbacks, plus the broadcast
//! notification bus for coarse external observers.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::downloader::downloadable::Downloadable;
use crate::downloader::task::DownloadTask;
use crate::error::{FetchError, FetchResult};
use crate::resource::{DownloadRequest, Mirror};

/// Single observer of a download queue.
///
/// `download_did_finish` may fail to request a retry against the next mirror
/// (the cache does this when it cannot store the transferred file).
#[async_trait]
pub trait QueueObserver: Send + Sync {
    async fn download_did_start(&self, task: &Arc<DownloadTask>, downloadable: &Downloadable);

    /// First byte arrived for a downloadable.
    async fn download_did_start_transfer(
        &self,
        _task: &Arc<DownloadTask>,
        _downloadable: &Downloadable,
    ) {
    }

    /// Throttled transfer updates.
    async fn download_did_transfer_data(
        &self,
        task: &Arc<DownloadTask>,
        downloadable: &Downloadable,
    );

    /// The transfer finished; `temp_path` must be moved or copied before
    /// returning. An error here sends the task back through the mirror
    /// policy.
    async fn download_did_finish(
        &self,
        task: &Arc<DownloadTask>,
        downloadable: &Downloadable,
        temp_path: &Path,
    ) -> FetchResult<()>;

    async fn download_did_fail(&self, task: &Arc<DownloadTask>, error: &FetchError);

    async fn download_will_retry(
        &self,
        task: &Arc<DownloadTask>,
        failed: &Downloadable,
        next: &Downloadable,
        error: &FetchError,
    );

    /// A processor drained all background work it had persisted.
    async fn processor_did_finish_background_events(&self, _processor_id: &str) {}
}

/// Application-facing observer registered with the resource manager.
#[async_trait]
pub trait ResourceObserver: Send + Sync {
    async fn did_start_downloading(&self, request: &DownloadRequest);

    async fn will_retry_failed_download(
        &self,
        request: &DownloadRequest,
        next_mirror: &Mirror,
        error: &FetchError,
    );

    /// Exactly one terminal callback per finished task.
    async fn did_finish_download(&self, request: &DownloadRequest, error: Option<&FetchError>);
}

/// Coarse notifications published on the external bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Notification {
    DownloadDidStart { resource_id: String },
    DownloadDidStartTransfer { resource_id: String },
    DownloadDidFinish { resource_id: String },
    DownloadError { resource_id: String, error: String },
    DidFinishBackgroundEvents { processor_id: String },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::DownloadDidStart { .. } => "DOWNLOAD_DID_START",
            Notification::DownloadDidStartTransfer { .. } => "DOWNLOAD_DID_START_TRANSFER",
            Notification::DownloadDidFinish { .. } => "DOWNLOAD_DID_FINISH",
            Notification::DownloadError { .. } => "DOWNLOAD_ERROR",
            Notification::DidFinishBackgroundEvents { .. } => "DID_FINISH_BACKGROUND_EVENTS",
        }
    }
}

/// Broadcast bus for publishing notifications to any number of subscribers.
pub struct NotificationBus {
    sender: tokio::sync::broadcast::Sender<Notification>,
}

impl NotificationBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to all subscribers. Lagging or absent subscribers never block
    /// the engine.
    pub fn publish(&self, notification: Notification) {
        let kind = notification.kind();
        match self.sender.send(notification) {
            Ok(count) => {
                tracing::trace!("Published {} to {} subscribers", kind, count);
            }
            Err(_) => {
                tracing::trace!("No subscribers for {}", kind);
            }
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(256)
    }
}
