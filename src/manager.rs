//! Resource Manager
//!
//! Top-level facade of the engine: composes the normal and priority download
//! queues with the two-tier cache, fans callbacks out to registered
//! observers, runs per-resource completion callbacks exactly once, and keeps
//! the engine metrics.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;

use crate::cache::{MemoryCache, ResourceCache, RetryOutcome};
use crate::config::EngineConfig;
use crate::db::LocalFileStore;
use crate::downloader::downloadable::Downloadable;
use crate::downloader::events::{Notification, NotificationBus, QueueObserver, ResourceObserver};
use crate::downloader::mirror_policy::WeightedMirrorPolicy;
use crate::downloader::queue::{DownloadQueue, QueueConfig, QueueStats};
use crate::downloader::task::DownloadTask;
use crate::error::{FetchError, FetchResult};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::processors::{CloudAssetProcessor, CloudAssetService, HttpProcessor};
use crate::progress::{ProgressAggregator, ProgressNode};
use crate::resource::{
    DownloadOptions, DownloadPriority, DownloadRequest, ResourceFile,
};

type CompletionHandler = Box<dyn FnOnce(bool, &str) + Send>;

/// Combined engine statistics
#[derive(Debug, Clone, Default)]
pub struct ManagerStats {
    pub normal: QueueStats,
    pub priority: Option<QueueStats>,
    pub metrics: MetricsSnapshot,
}

/// Facade over the download engine.
pub struct ResourceManager {
    cache: Arc<ResourceCache>,
    normal_queue: Arc<DownloadQueue>,
    priority_queue: Option<Arc<DownloadQueue>>,
    policy: Arc<WeightedMirrorPolicy>,
    metrics: Arc<Metrics>,
    aggregator: ProgressAggregator,
    notifications: NotificationBus,
    observers: Mutex<HashMap<u64, Weak<dyn ResourceObserver>>>,
    observer_seq: AtomicU64,
    completions: Mutex<HashMap<String, Vec<CompletionHandler>>>,
    /// Ids being moved between queues; their cancellation is not terminal
    migrating: Mutex<HashSet<String>>,
}

impl ResourceManager {
    /// Build a manager from configuration. Creates the storage directories,
    /// opens the record database, starts both queues and installs the HTTP
    /// processors. Requires a running tokio runtime.
    pub fn new(config: &EngineConfig) -> FetchResult<Arc<Self>> {
        let roots = config.storage_roots();
        std::fs::create_dir_all(&roots.support_dir)
            .map_err(|_| FetchError::CannotCreateDirectory(roots.support_dir.clone()))?;
        std::fs::create_dir_all(&roots.cache_dir)
            .map_err(|_| FetchError::CannotCreateDirectory(roots.cache_dir.clone()))?;

        let store = LocalFileStore::new(roots.support_dir.join("local_files.db"))?;
        let memory = MemoryCache::new(config.memory.file_capacity, config.memory.image_capacity);
        let policy = Arc::new(WeightedMirrorPolicy::new(config.retry.per_mirror_budget));
        let cache = Arc::new(ResourceCache::new(
            store,
            memory,
            Arc::clone(&policy),
            roots.clone(),
        ));

        let throttle = config.transfer_throttle();
        let mut normal_config = QueueConfig::named("normal", config.queues.normal_simultaneous);
        normal_config.transfer_throttle = throttle;
        let mut priority_config =
            QueueConfig::named("priority", config.queues.priority_simultaneous);
        priority_config.transfer_throttle = throttle;

        let normal_queue = DownloadQueue::new(normal_config);
        let priority_queue = DownloadQueue::new(priority_config);

        // each processor owns its scratch subtree so crash recovery never
        // revives the same descriptor on two queues
        let tmp_dir = roots.tmp_dir();
        normal_queue.add_processor(Arc::new(HttpProcessor::new(tmp_dir.join("http"))));
        priority_queue
            .add_processor(Arc::new(HttpProcessor::high_priority(tmp_dir.join("http-high"))));

        let manager = Arc::new(Self {
            cache,
            normal_queue,
            priority_queue: Some(priority_queue),
            policy,
            metrics: Arc::new(Metrics::new()),
            aggregator: ProgressAggregator::new(),
            notifications: NotificationBus::default(),
            observers: Mutex::new(HashMap::new()),
            observer_seq: AtomicU64::new(0),
            completions: Mutex::new(HashMap::new()),
            migrating: Mutex::new(HashSet::new()),
        });

        let observer: Arc<dyn QueueObserver> = Arc::clone(&manager) as Arc<dyn QueueObserver>;
        manager.normal_queue.set_observer(Arc::downgrade(&observer));
        if let Some(queue) = &manager.priority_queue {
            queue.set_observer(Arc::downgrade(&observer));
        }
        drop(observer);

        Ok(manager)
    }

    /// Register the cloud-asset service; installs the batching processor on
    /// both queues.
    pub fn register_cloud_service(&self, service: Arc<dyn CloudAssetService>) {
        let tmp_dir = self.cache.roots().tmp_dir();
        self.normal_queue.add_processor(Arc::new(CloudAssetProcessor::new(
            Arc::clone(&service),
            tmp_dir.join("cloud"),
        )));
        if let Some(queue) = &self.priority_queue {
            queue.add_processor(Arc::new(CloudAssetProcessor::new(
                service,
                tmp_dir.join("cloud-high"),
            )));
        }
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }

    pub fn normal_queue(&self) -> &Arc<DownloadQueue> {
        &self.normal_queue
    }

    pub fn priority_queue(&self) -> Option<&Arc<DownloadQueue>> {
        self.priority_queue.as_ref()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            normal: self.normal_queue.stats(),
            priority: self.priority_queue.as_ref().map(|q| q.stats()),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Subscribe to the coarse notification bus.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Admit resources for download. Duplicate ids are dropped (first
    /// occurrence wins) and resources already present and fresh produce no
    /// request.
    pub async fn request(
        &self,
        resources: Vec<ResourceFile>,
        options: DownloadOptions,
    ) -> Vec<DownloadRequest> {
        let mut seen = HashSet::new();
        let deduped: Vec<ResourceFile> = resources
            .into_iter()
            .filter(|r| seen.insert(r.id.clone()))
            .collect();

        let requests = self.cache.request_downloads(deduped, options).await;
        self.metrics.add_requested(requests.len() as u64);
        requests
    }

    /// Enqueue one admitted request.
    pub async fn process(self: &Arc<Self>, request: DownloadRequest, priority: DownloadPriority) {
        self.process_requests(vec![request], priority).await;
    }

    /// Enqueue a batch of admitted requests at the given priority.
    ///
    /// `urgent` displaces everything pending on the priority queue onto the
    /// normal queue (just above its current maximum) and runs the urgent
    /// batch together at high priority.
    pub async fn process_requests(
        self: &Arc<Self>,
        requests: Vec<DownloadRequest>,
        priority: DownloadPriority,
    ) {
        match priority {
            DownloadPriority::Normal => {
                for request in requests {
                    let task = self.make_task(&request);
                    task.set_priority(DownloadPriority::Normal.value());
                    self.normal_queue.download(task).await;
                }
            }
            DownloadPriority::High => {
                for request in requests {
                    self.dispatch_high(request).await;
                }
            }
            DownloadPriority::Urgent => {
                self.displace_priority_queue().await;
                for request in requests {
                    self.dispatch_urgent(request).await;
                }
            }
        }
    }

    async fn dispatch_high(self: &Arc<Self>, request: DownloadRequest) {
        let Some(priority_queue) = &self.priority_queue else {
            let task = self.make_task(&request);
            task.set_priority(DownloadPriority::High.value());
            self.normal_queue.download(task).await;
            return;
        };

        let id = request.resource_id().to_string();

        // an id already tracked keeps its task; recreating one would restart
        // the mirror walk behind the shared policy's back
        if let Some(task) = priority_queue.task(&id) {
            task.set_priority(DownloadPriority::High.value());
            return;
        }
        if let Some(task) = self.normal_queue.remove_pending(&id) {
            task.set_priority(DownloadPriority::High.value());
            priority_queue.download(task).await;
            return;
        }
        if self.normal_queue.contains(&id) {
            // running on the normal queue: cancel there and continue on the
            // priority queue with a task that re-consults the policy instead
            // of re-consuming the admission-time selection
            self.migrating.lock().unwrap().insert(id.clone());
            self.normal_queue.cancel(&id).await;
            let task = Arc::new(DownloadTask::continuation(
                request,
                Arc::clone(&self.policy),
            ));
            task.set_priority(DownloadPriority::High.value());
            priority_queue.download(task).await;
            return;
        }

        let task = self.make_task(&request);
        task.set_priority(DownloadPriority::High.value());
        priority_queue.download(task).await;
    }

    /// Move everything queued on the priority queue onto the normal queue,
    /// one notch above its current maximum priority.
    async fn displace_priority_queue(self: &Arc<Self>) {
        let Some(priority_queue) = &self.priority_queue else {
            return;
        };
        let displaced = priority_queue.drain_pending();
        if displaced.is_empty() {
            return;
        }

        let bumped = self.normal_queue.max_priority() + 1;
        tracing::info!(
            "Urgent batch: moving {} queued downloads to the normal queue at priority {}",
            displaced.len(),
            bumped
        );
        for task in displaced {
            task.set_priority(bumped);
            self.normal_queue.download(task).await;
            self.metrics.add_priority_decreased(1);
        }
    }

    async fn dispatch_urgent(self: &Arc<Self>, request: DownloadRequest) {
        let Some(priority_queue) = &self.priority_queue else {
            let task = self.make_task(&request);
            task.set_priority(DownloadPriority::Urgent.value());
            self.normal_queue.download(task).await;
            return;
        };

        let id = request.resource_id().to_string();
        self.metrics.add_priority_increased(1);

        // reuse a live task for the id rather than recreating one
        if let Some(task) = priority_queue.task(&id) {
            task.set_priority(DownloadPriority::High.value());
            return;
        }
        if let Some(task) = self.normal_queue.remove_pending(&id) {
            task.set_priority(DownloadPriority::High.value());
            priority_queue.download(task).await;
            return;
        }
        if self.normal_queue.contains(&id) {
            self.migrating.lock().unwrap().insert(id.clone());
            self.normal_queue.cancel(&id).await;
            let task = Arc::new(DownloadTask::continuation(
                request,
                Arc::clone(&self.policy),
            ));
            // the batch runs together at high
            task.set_priority(DownloadPriority::High.value());
            priority_queue.download(task).await;
            return;
        }

        let task = self.make_task(&request);
        // the batch runs together at high
        task.set_priority(DownloadPriority::High.value());
        priority_queue.download(task).await;
    }

    fn make_task(&self, request: &DownloadRequest) -> Arc<DownloadTask> {
        Arc::new(DownloadTask::new(request.clone(), Arc::clone(&self.policy)))
    }

    /// Task lookup across both queues (for wait-for-completion callers).
    pub fn task(&self, resource_id: &str) -> Option<Arc<DownloadTask>> {
        if let Some(task) = self.normal_queue.task(resource_id) {
            return Some(task);
        }
        self.priority_queue.as_ref()?.task(resource_id)
    }

    /// Cancel one request on both queues and forget its in-flight entry.
    pub async fn cancel(self: &Arc<Self>, request: &DownloadRequest) {
        let id = request.resource_id();
        self.normal_queue.cancel(id).await;
        if let Some(queue) = &self.priority_queue {
            queue.cancel(id).await;
        }
        self.cache.cancel(request);
    }

    /// Cancel everything; pending completion callbacks are fulfilled with
    /// failure.
    pub async fn cancel_all(self: &Arc<Self>) {
        self.normal_queue.cancel_all().await;
        if let Some(queue) = &self.priority_queue {
            queue.cancel_all().await;
        }

        let leftover: Vec<(String, Vec<CompletionHandler>)> = {
            let mut completions = self.completions.lock().unwrap();
            completions.drain().collect()
        };
        for (id, handlers) in leftover {
            for handler in handlers {
                handler(false, &id);
            }
        }
    }

    /// Activate or deactivate both queues.
    pub async fn set_active(self: &Arc<Self>, active: bool) {
        self.normal_queue.set_active(active).await;
        if let Some(queue) = &self.priority_queue {
            queue.set_active(active).await;
        }
    }

    /// Reactivate both queues and reattach transfers the transports persisted
    /// before a restart.
    pub async fn resume(self: &Arc<Self>) {
        self.set_active(true).await;

        let cache = Arc::clone(&self.cache);
        self.normal_queue
            .enqueue_pending(|d: &Downloadable| cache.download_request(d))
            .await;
        if let Some(queue) = &self.priority_queue {
            let cache = Arc::clone(&self.cache);
            queue
                .enqueue_pending(|d: &Downloadable| cache.download_request(d))
                .await;
        }
    }

    /// Pause all transports without losing transfer state.
    pub async fn pause_all(&self) {
        self.normal_queue.pause().await;
        if let Some(queue) = &self.priority_queue {
            queue.pause().await;
        }
    }

    /// Resume previously paused transports.
    pub async fn resume_all(&self) {
        self.normal_queue.resume().await;
        if let Some(queue) = &self.priority_queue {
            queue.resume().await;
        }
    }

    /// Register an observer. The manager keeps a weak handle; dropped
    /// observers are pruned on the next fan-out.
    pub fn add_observer(&self, observer: &Arc<dyn ResourceObserver>) -> u64 {
        let key = self.observer_seq.fetch_add(1, Ordering::Relaxed);
        self.observers
            .lock()
            .unwrap()
            .insert(key, Arc::downgrade(observer));
        key
    }

    /// Remove an observer by identity.
    pub fn remove_observer(&self, observer: &Arc<dyn ResourceObserver>) {
        let mut observers = self.observers.lock().unwrap();
        observers.retain(|_, weak| match weak.upgrade() {
            Some(existing) => !Arc::ptr_eq(&existing, observer),
            None => false,
        });
    }

    fn live_observers(&self) -> Vec<Arc<dyn ResourceObserver>> {
        let mut observers = self.observers.lock().unwrap();
        observers.retain(|_, weak| weak.strong_count() > 0);
        observers.values().filter_map(|w| w.upgrade()).collect()
    }

    /// Register a completion callback for a resource id, invoked exactly once
    /// with `(success, id)` when the resource reaches a terminal state.
    pub fn add_resource_completion<F>(&self, resource_id: &str, handler: F)
    where
        F: FnOnce(bool, &str) + Send + 'static,
    {
        self.completions
            .lock()
            .unwrap()
            .entry(resource_id.to_string())
            .or_default()
            .push(Box::new(handler));
    }

    fn run_completions(&self, resource_id: &str, success: bool) {
        let handlers = self.completions.lock().unwrap().remove(resource_id);
        if let Some(handlers) = handlers {
            for handler in handlers {
                handler(success, resource_id);
            }
        }
    }

    /// Grouped progress node over a set of download ids.
    pub fn progress_node(&self, group_key: &str, download_ids: &[String]) -> ProgressNode {
        self.aggregator.progress_node(group_key, download_ids)
    }
}

#[async_trait]
impl QueueObserver for ResourceManager {
    async fn download_did_start(&self, task: &Arc<DownloadTask>, downloadable: &Downloadable) {
        let request = task.request();
        self.metrics.incr_download_began();
        self.aggregator
            .update(task.id(), downloadable.progress());

        for observer in self.live_observers() {
            observer.did_start_downloading(request).await;
        }
        self.notifications.publish(Notification::DownloadDidStart {
            resource_id: task.id().to_string(),
        });
    }

    async fn download_did_start_transfer(
        &self,
        task: &Arc<DownloadTask>,
        _downloadable: &Downloadable,
    ) {
        self.notifications
            .publish(Notification::DownloadDidStartTransfer {
                resource_id: task.id().to_string(),
            });
    }

    async fn download_did_transfer_data(
        &self,
        task: &Arc<DownloadTask>,
        downloadable: &Downloadable,
    ) {
        let progress = downloadable.transfer_progress();
        self.metrics
            .set_download_speed_bytes(progress.speed_bytes_per_sec as u64);
        self.aggregator.update(task.id(), downloadable.progress());
    }

    async fn download_did_finish(
        &self,
        task: &Arc<DownloadTask>,
        downloadable: &Downloadable,
        temp_path: &Path,
    ) -> FetchResult<()> {
        let request = self.cache.download_finished(downloadable, temp_path).await?;
        let id = task.id();

        self.metrics.incr_download_completed();
        self.metrics
            .add_bytes_transferred(downloadable.transferred_bytes());
        self.aggregator.complete(id, None);

        for observer in self.live_observers() {
            observer.did_finish_download(&request, None).await;
        }
        self.run_completions(id, true);
        self.notifications.publish(Notification::DownloadDidFinish {
            resource_id: id.to_string(),
        });
        Ok(())
    }

    async fn download_did_fail(&self, task: &Arc<DownloadTask>, error: &FetchError) {
        let id = task.id().to_string();

        // queue moves cancel the old task; that is not a terminal outcome
        if matches!(error, FetchError::Cancelled)
            && self.migrating.lock().unwrap().remove(&id)
        {
            tracing::debug!("Suppressing cancel callbacks for migrating task {}", id);
            return;
        }

        let request = task.request().clone();
        if let Some(downloadable) = task.current_downloadable() {
            if let RetryOutcome::Unknown = self.cache.download_failed(&downloadable, error) {
                self.cache.cancel(&request);
            }
        } else {
            self.cache.cancel(&request);
        }

        if task.began() && !matches!(error, FetchError::Cancelled) {
            self.metrics.incr_failed();
        }
        self.aggregator.complete(&id, Some(error.clone()));

        for observer in self.live_observers() {
            observer.did_finish_download(&request, Some(error)).await;
        }
        self.run_completions(&id, false);
        self.notifications.publish(Notification::DownloadError {
            resource_id: id,
            error: error.to_string(),
        });
    }

    async fn processor_did_finish_background_events(&self, processor_id: &str) {
        self.notifications
            .publish(Notification::DidFinishBackgroundEvents {
                processor_id: processor_id.to_string(),
            });
    }

    async fn download_will_retry(
        &self,
        task: &Arc<DownloadTask>,
        _failed: &Downloadable,
        next: &Downloadable,
        error: &FetchError,
    ) {
        let request = task.request();
        self.metrics.incr_retried();
        self.aggregator.retry(task.id(), next.progress());

        let next_mirror = request
            .resource
            .mirror(next.mirror_id())
            .cloned()
            .unwrap_or_else(|| request.initial_mirror.clone());
        for observer in self.live_observers() {
            observer
                .will_retry_failed_download(request, &next_mirror, error)
                .await;
        }
    }
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("normal", &self.normal_queue.stats())
            .field(
                "priority",
                &self.priority_queue.as_ref().map(|q| q.stats()),
            )
            .finish()
    }
}
