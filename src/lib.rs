//! fetchkit — concurrent, prioritized, resumable resource download engine.
//!
//! Resources identified by stable ids are fetched from one of several
//! weighted mirrors, persisted in a two-tier (memory + disk) cache indexed by
//! a database of local-file records, with progress aggregation, retries,
//! cancellation and cache maintenance across process restarts.
//!
//! The [`ResourceManager`] is the entry point:
//!
//! ```no_run
//! use fetchkit::{
//!     DownloadOptions, DownloadPriority, EngineConfig, Mirror, ResourceFile, ResourceManager,
//! };
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::default();
//! let manager = ResourceManager::new(&config)?;
//!
//! let resource = ResourceFile::new("asset-1", Mirror::new("m1", "http://cdn.example/asset-1.png"));
//! let requests = manager.request(vec![resource], DownloadOptions::cached()).await;
//! manager
//!     .process_requests(requests, DownloadPriority::Normal)
//!     .await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod db;
pub mod downloader;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod processors;
pub mod progress;
pub mod resource;

pub use cache::{ImageData, ImageDecoder, MemoryCache, ResourceCache, RetryOutcome, StorageRoots};
pub use config::EngineConfig;
pub use db::{LocalFileRecord, LocalFileStore};
pub use downloader::{
    DownloadKind, DownloadQueue, DownloadTask, Downloadable, Notification, NotificationBus,
    QueueConfig, QueueObserver, QueueStats, ResourceObserver, TaskState, TransferDescriptor,
    WeightedMirrorPolicy,
};
pub use error::{FetchError, FetchResult};
pub use manager::{ManagerStats, ResourceManager};
pub use metrics::{Metrics, MetricsSnapshot};
pub use processors::{
    CloudAssetProcessor, CloudAssetService, CloudRecord, CloudRecordId, DownloadProcessor,
    HttpProcessor, TransferEvent,
};
pub use progress::{Progress, ProgressAggregator, ProgressNode, TransferProgress};
pub use resource::{
    DownloadOptions, DownloadPriority, DownloadRequest, Mirror, MirrorSelection, ResourceFile,
    StoragePriority,
};
