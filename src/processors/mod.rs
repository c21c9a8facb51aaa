//! Download Processors
//!
//! Interchangeable transports. A processor consumes downloadables and reports
//! lifecycle events back to its queue over a typed channel; the queue never
//! blocks on a transfer.

pub mod cloud;
pub mod http;

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::downloader::downloadable::Downloadable;
use crate::error::{FetchError, FetchResult};

pub use cloud::{CloudAssetProcessor, CloudAssetService, CloudRecord, CloudRecordId};
pub use http::HttpProcessor;

/// Lifecycle events a processor emits for its transfers.
///
/// Events for a given downloadable are delivered in emission order.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Work accepted by the transport
    Began { downloadable: Downloadable },
    /// First byte arrived
    TransferStarted { downloadable: Downloadable },
    /// Bytes hit the disk
    DataTransferred {
        downloadable: Downloadable,
        transferred: u64,
        expected: u64,
    },
    /// Transfer finished; `temp_path` is a temporary file the receiver must
    /// move or copy before the path is reused
    FinishedTransfer {
        downloadable: Downloadable,
        temp_path: PathBuf,
    },
    /// Transfer failed
    Errored {
        downloadable: Downloadable,
        error: FetchError,
    },
    /// Transport bookkeeping for the downloadable is done
    Finished { downloadable: Downloadable },
    /// The transport drained all background work it had persisted
    FinishedBackgroundEvents { processor_id: String },
}

impl TransferEvent {
    pub fn downloadable(&self) -> Option<&Downloadable> {
        match self {
            TransferEvent::Began { downloadable }
            | TransferEvent::TransferStarted { downloadable }
            | TransferEvent::DataTransferred { downloadable, .. }
            | TransferEvent::FinishedTransfer { downloadable, .. }
            | TransferEvent::Errored { downloadable, .. }
            | TransferEvent::Finished { downloadable } => Some(downloadable),
            TransferEvent::FinishedBackgroundEvents { .. } => None,
        }
    }
}

pub type TransferEventSender = mpsc::UnboundedSender<TransferEvent>;
pub type TransferEventReceiver = mpsc::UnboundedReceiver<TransferEvent>;

/// Transport adapter contract.
#[async_trait]
pub trait DownloadProcessor: Send + Sync {
    /// Stable processor identifier (used in logs and notifications).
    fn id(&self) -> &str;

    /// Whether this transport understands the downloadable's location.
    fn can_process(&self, downloadable: &Downloadable) -> bool;

    /// Kick off the transfer. Must not block; progress and completion arrive
    /// as events.
    async fn process(&self, downloadable: Downloadable) -> FetchResult<()>;

    /// Pause in-flight transfers without losing their state.
    async fn pause(&self);

    /// Resume previously paused transfers.
    async fn resume(&self);

    /// Reconcile with transport-level persisted tasks; returns downloadables
    /// recovered from before a restart.
    async fn enqueue_pending(&self) -> Vec<Downloadable>;

    /// Wire the event channel the processor reports into.
    fn set_event_sender(&self, sender: TransferEventSender);
}
