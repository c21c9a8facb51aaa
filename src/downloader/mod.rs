//! Download Engine Module
//!
//! Queue, task lifecycle, mirror policy and event seams of the download
//! engine.

pub mod downloadable;
pub mod events;
pub mod mirror_policy;
pub mod queue;
pub mod task;

// Re-export commonly used types
pub use downloadable::{DownloadKind, Downloadable, TransferDescriptor};
pub use events::{Notification, NotificationBus, QueueObserver, ResourceObserver};
pub use mirror_policy::{WeightedMirrorPolicy, DEFAULT_RETRY_BUDGET};
pub use queue::{DownloadQueue, QueueConfig, QueueStats};
pub use task::{DownloadTask, TaskState};
