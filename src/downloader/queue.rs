//! Download Queue
//!
//! Admission, priority ordering and dispatch of download tasks to transport
//! processors. The queue owns live tasks, enforces the concurrency cap, and
//! drives mirror retries from processor events.
//!
//! Locking discipline: queue state lives behind one mutex that is never held
//! across an await; dispatch snapshots what it needs, releases, then awaits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::downloader::downloadable::Downloadable;
use crate::downloader::events::QueueObserver;
use crate::downloader::mirror_policy::WeightedMirrorPolicy;
use crate::downloader::task::DownloadTask;
use crate::error::FetchError;
use crate::processors::{DownloadProcessor, TransferEvent, TransferEventReceiver};
use crate::resource::DownloadRequest;

/// Queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Name used in logs ("normal", "priority")
    pub name: String,

    /// Maximum concurrent running tasks; 0 is treated as 1
    pub simultaneous_downloads: usize,

    /// Minimum interval between transfer-data observer callbacks per task
    pub transfer_throttle: Duration,
}

impl QueueConfig {
    pub fn named(name: impl Into<String>, simultaneous_downloads: usize) -> Self {
        Self {
            name: name.into(),
            simultaneous_downloads,
            transfer_throttle: Duration::from_millis(250),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::named("normal", 20)
    }
}

/// Point-in-time queue counts
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

struct PendingEntry {
    seq: u64,
    task: Arc<DownloadTask>,
}

#[derive(Default)]
struct QueueState {
    pending: Vec<PendingEntry>,
    running: HashMap<String, Arc<DownloadTask>>,
    last_transfer_emit: HashMap<String, Instant>,
}

/// Prioritized, capped download queue.
pub struct DownloadQueue {
    name: String,
    cap: AtomicUsize,
    active: AtomicBool,
    seq: AtomicU64,
    transfer_throttle: Duration,
    state: Mutex<QueueState>,
    processors: Mutex<Vec<Arc<dyn DownloadProcessor>>>,
    observer: Mutex<Option<Weak<dyn QueueObserver>>>,
    events_tx: mpsc::UnboundedSender<TransferEvent>,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

impl DownloadQueue {
    /// Create a queue and start its event loop. Requires a running tokio
    /// runtime.
    pub fn new(config: QueueConfig) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Self {
            name: config.name,
            cap: AtomicUsize::new(config.simultaneous_downloads.max(1)),
            active: AtomicBool::new(true),
            seq: AtomicU64::new(0),
            transfer_throttle: config.transfer_throttle,
            state: Mutex::new(QueueState::default()),
            processors: Mutex::new(Vec::new()),
            observer: Mutex::new(None),
            events_tx,
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        });
        queue.spawn_event_loop(events_rx);
        queue
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a processor and wire it to this queue's event channel.
    pub fn add_processor(&self, processor: Arc<dyn DownloadProcessor>) {
        processor.set_event_sender(self.events_tx.clone());
        self.processors.lock().unwrap().push(processor);
    }

    pub fn set_observer(&self, observer: Weak<dyn QueueObserver>) {
        *self.observer.lock().unwrap() = Some(observer);
    }

    fn observer(&self) -> Option<Arc<dyn QueueObserver>> {
        self.observer.lock().unwrap().as_ref()?.upgrade()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub async fn set_active(self: &Arc<Self>, active: bool) {
        self.active.store(active, Ordering::SeqCst);
        if active {
            self.dispatch().await;
        }
    }

    /// Change the concurrency cap; 0 clamps to 1. Raising the cap dispatches
    /// immediately.
    pub async fn set_simultaneous_downloads(self: &Arc<Self>, cap: usize) {
        self.cap.store(cap.max(1), Ordering::SeqCst);
        self.dispatch().await;
    }

    pub fn simultaneous_downloads(&self) -> usize {
        self.cap.load(Ordering::SeqCst)
    }

    /// Whether `id` is queued or running.
    pub fn contains(&self, id: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.running.contains_key(id) || state.pending.iter().any(|e| e.task.id() == id)
    }

    /// Task lookup across both sets.
    pub fn task(&self, id: &str) -> Option<Arc<DownloadTask>> {
        let state = self.state.lock().unwrap();
        if let Some(task) = state.running.get(id) {
            return Some(Arc::clone(task));
        }
        state
            .pending
            .iter()
            .find(|e| e.task.id() == id)
            .map(|e| Arc::clone(&e.task))
    }

    pub fn stats(&self) -> QueueStats {
        let (queued, running) = {
            let state = self.state.lock().unwrap();
            (state.pending.len(), state.running.len())
        };
        QueueStats {
            queued,
            running,
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }

    /// Highest priority currently tracked (pending or running), or 0.
    pub fn max_priority(&self) -> i32 {
        let state = self.state.lock().unwrap();
        state
            .pending
            .iter()
            .map(|e| e.task.priority())
            .chain(state.running.values().map(|t| t.priority()))
            .max()
            .unwrap_or(0)
    }

    /// Admit a task. Enqueueing an id already queued or running is a no-op.
    pub async fn download(self: &Arc<Self>, task: Arc<DownloadTask>) {
        {
            let mut state = self.state.lock().unwrap();
            let id = task.id().to_string();
            if state.running.contains_key(&id) {
                tracing::debug!("Queue {}: {} already running, ignoring", self.name, id);
                return;
            }
            if state.pending.iter().any(|e| e.task.id() == id) {
                tracing::debug!("Queue {}: {} already queued, ignoring", self.name, id);
                return;
            }
            task.mark_queued();
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            state.pending.push(PendingEntry { seq, task });
        }
        self.dispatch().await;
    }

    /// Remove a single pending entry by id and return its task. Running
    /// tasks are untouched.
    pub fn remove_pending(&self, id: &str) -> Option<Arc<DownloadTask>> {
        let mut state = self.state.lock().unwrap();
        let idx = state.pending.iter().position(|e| e.task.id() == id)?;
        Some(state.pending.remove(idx).task)
    }

    /// Remove every pending entry and return the tasks, preserving queue
    /// order. Running tasks are untouched.
    pub fn drain_pending(&self) -> Vec<Arc<DownloadTask>> {
        let mut state = self.state.lock().unwrap();
        let mut entries: Vec<PendingEntry> = state.pending.drain(..).collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.task).collect()
    }

    /// Dispatch pending tasks while capacity allows.
    pub async fn dispatch(self: &Arc<Self>) {
        loop {
            if !self.is_active() {
                return;
            }

            let next = {
                let mut state = self.state.lock().unwrap();
                if state.running.len() >= self.simultaneous_downloads() || state.pending.is_empty()
                {
                    None
                } else {
                    // highest priority first, FIFO within a priority
                    let idx = state
                        .pending
                        .iter()
                        .enumerate()
                        .max_by_key(|(_, e)| (e.task.priority(), std::cmp::Reverse(e.seq)))
                        .map(|(i, _)| i);
                    idx.map(|i| {
                        let entry = state.pending.remove(i);
                        state
                            .running
                            .insert(entry.task.id().to_string(), Arc::clone(&entry.task));
                        entry.task
                    })
                }
            };

            let Some(task) = next else { return };

            let Some(downloadable) = task.advance(None, None) else {
                tracing::warn!("Queue {}: no mirror for {}", self.name, task.id());
                self.finish_task(&task, Some(FetchError::MirrorsExhausted(task.id().to_string())))
                    .await;
                continue;
            };

            let Some(processor) = self.processor_for(&downloadable) else {
                tracing::error!(
                    "Queue {}: no processor for {}",
                    self.name,
                    downloadable.location()
                );
                self.finish_task(
                    &task,
                    Some(FetchError::NoProcessorAvailable(
                        downloadable.location().to_string(),
                    )),
                )
                .await;
                continue;
            };

            task.mark_began();
            tracing::debug!(
                "Queue {}: dispatching {} via {} (priority {})",
                self.name,
                task.id(),
                processor.id(),
                downloadable.priority()
            );
            if let Some(observer) = self.observer() {
                observer.download_did_start(&task, &downloadable).await;
            }

            if let Err(err) = processor.process(downloadable.clone()).await {
                self.handle_transfer_error(&task, downloadable, err).await;
            }
        }
    }

    /// Latest matching registration wins, so an app-supplied processor can
    /// override a built-in one for the same scheme.
    fn processor_for(&self, downloadable: &Downloadable) -> Option<Arc<dyn DownloadProcessor>> {
        let processors = self.processors.lock().unwrap();
        processors
            .iter()
            .rev()
            .find(|p| p.can_process(downloadable))
            .cloned()
    }

    /// Cancel by resource id; queued entries are removed synchronously,
    /// running transfers cancel cooperatively through the transport.
    pub async fn cancel(self: &Arc<Self>, id: &str) {
        enum Found {
            Pending(Arc<DownloadTask>),
            Running(Arc<DownloadTask>),
            Missing,
        }

        let found = {
            let mut state = self.state.lock().unwrap();
            if let Some(idx) = state.pending.iter().position(|e| e.task.id() == id) {
                Found::Pending(state.pending.remove(idx).task)
            } else if let Some(task) = state.running.get(id) {
                Found::Running(Arc::clone(task))
            } else {
                Found::Missing
            }
        };

        match found {
            Found::Pending(task) => {
                task.complete(Some(FetchError::Cancelled));
                self.cancelled.fetch_add(1, Ordering::Relaxed);
                if let Some(observer) = self.observer() {
                    observer.download_did_fail(&task, &FetchError::Cancelled).await;
                }
                self.dispatch().await;
            }
            Found::Running(task) => {
                // terminal transition follows the transport's final event
                if !task.cancel() {
                    self.remove_running(task.id());
                    self.cancelled.fetch_add(1, Ordering::Relaxed);
                    if let Some(observer) = self.observer() {
                        observer.download_did_fail(&task, &FetchError::Cancelled).await;
                    }
                    self.dispatch().await;
                }
            }
            Found::Missing => {
                tracing::debug!("Queue {}: cancel for unknown id {}", self.name, id);
            }
        }
    }

    /// Cancel everything, queued and running.
    pub async fn cancel_all(self: &Arc<Self>) {
        let ids: Vec<String> = {
            let state = self.state.lock().unwrap();
            state
                .pending
                .iter()
                .map(|e| e.task.id().to_string())
                .chain(state.running.keys().cloned())
                .collect()
        };
        for id in ids {
            self.cancel(&id).await;
        }
    }

    /// Pause all registered processors.
    pub async fn pause(&self) {
        let processors: Vec<_> = self.processors.lock().unwrap().clone();
        for processor in processors {
            processor.pause().await;
        }
    }

    /// Resume all registered processors.
    pub async fn resume(&self) {
        let processors: Vec<_> = self.processors.lock().unwrap().clone();
        for processor in processors {
            processor.resume().await;
        }
    }

    /// Reattach transfers the transports persisted before a restart. Each
    /// recovered downloadable that resolves to a known request is installed
    /// in the running set and reported as started.
    pub async fn enqueue_pending<F>(self: &Arc<Self>, resolve: F)
    where
        F: Fn(&Downloadable) -> Option<DownloadRequest>,
    {
        let processors: Vec<_> = self.processors.lock().unwrap().clone();
        for processor in processors {
            let recovered = processor.enqueue_pending().await;
            for downloadable in recovered {
                let Some(request) = resolve(&downloadable) else {
                    tracing::warn!(
                        "Queue {}: dropping recovered transfer with unknown resource {}",
                        self.name,
                        downloadable.resource_id()
                    );
                    continue;
                };
                let policy = self.policy_for_recovery();
                let task = Arc::new(DownloadTask::recovered(
                    request,
                    policy,
                    downloadable.clone(),
                ));
                {
                    let mut state = self.state.lock().unwrap();
                    let id = task.id().to_string();
                    if state.running.contains_key(&id)
                        || state.pending.iter().any(|e| e.task.id() == id)
                    {
                        continue;
                    }
                    state.running.insert(id, Arc::clone(&task));
                }
                task.mark_began();
                tracing::info!(
                    "Queue {}: recovered transfer for {} from {}",
                    self.name,
                    task.id(),
                    processor.id()
                );
                if let Some(observer) = self.observer() {
                    observer.download_did_start(&task, &downloadable).await;
                }
            }
        }
    }

    fn policy_for_recovery(&self) -> Arc<WeightedMirrorPolicy> {
        // recovered tasks retry with a fresh budget; their original policy
        // state did not survive the restart
        Arc::new(WeightedMirrorPolicy::default())
    }

    fn remove_running(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        state.running.remove(id);
        state.last_transfer_emit.remove(id);
    }

    async fn finish_task(self: &Arc<Self>, task: &Arc<DownloadTask>, error: Option<FetchError>) {
        self.remove_running(task.id());
        match &error {
            None => {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            Some(FetchError::Cancelled) => {
                self.cancelled.fetch_add(1, Ordering::Relaxed);
            }
            Some(_) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        task.complete(error.clone());
        if let Some(err) = error {
            if let Some(observer) = self.observer() {
                observer.download_did_fail(task, &err).await;
            }
        }
    }

    fn spawn_event_loop(self: &Arc<Self>, mut events_rx: TransferEventReceiver) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let Some(queue) = weak.upgrade() else { break };
                queue.handle_event(event).await;
            }
        });
    }

    fn running_task(&self, resource_id: &str) -> Option<Arc<DownloadTask>> {
        self.state
            .lock()
            .unwrap()
            .running
            .get(resource_id)
            .map(Arc::clone)
    }

    async fn handle_event(self: &Arc<Self>, event: TransferEvent) {
        match event {
            TransferEvent::Began { downloadable } => {
                tracing::trace!(
                    "Queue {}: transport accepted {}",
                    self.name,
                    downloadable.resource_id()
                );
            }
            TransferEvent::TransferStarted { downloadable } => {
                if let Some(task) = self.running_task(downloadable.resource_id()) {
                    if let Some(observer) = self.observer() {
                        observer.download_did_start_transfer(&task, &downloadable).await;
                    }
                }
            }
            TransferEvent::DataTransferred {
                downloadable,
                transferred,
                expected,
            } => {
                downloadable.record_transfer(transferred, expected);
                let Some(task) = self.running_task(downloadable.resource_id()) else {
                    return;
                };
                let should_emit = {
                    let mut state = self.state.lock().unwrap();
                    let key = downloadable.resource_id().to_string();
                    match state.last_transfer_emit.get(&key) {
                        Some(last) if last.elapsed() < self.transfer_throttle => false,
                        _ => {
                            state.last_transfer_emit.insert(key, Instant::now());
                            true
                        }
                    }
                };
                if should_emit {
                    if let Some(observer) = self.observer() {
                        observer.download_did_transfer_data(&task, &downloadable).await;
                    }
                }
            }
            TransferEvent::FinishedTransfer {
                downloadable,
                temp_path,
            } => {
                let Some(task) = self.running_task(downloadable.resource_id()) else {
                    tracing::warn!(
                        "Queue {}: finished transfer for untracked resource {}",
                        self.name,
                        downloadable.resource_id()
                    );
                    return;
                };
                let store_result = match self.observer() {
                    Some(observer) => {
                        observer
                            .download_did_finish(&task, &downloadable, &temp_path)
                            .await
                    }
                    None => {
                        tracing::warn!(
                            "Queue {}: no observer to store transfer for {}",
                            self.name,
                            task.id()
                        );
                        Ok(())
                    }
                };
                match store_result {
                    Ok(()) => {
                        self.finish_task(&task, None).await;
                        self.dispatch().await;
                    }
                    Err(err) => {
                        tracing::warn!(
                            "Queue {}: store failed for {}: {}",
                            self.name,
                            task.id(),
                            err
                        );
                        self.handle_transfer_error(&task, downloadable, err).await;
                        self.dispatch().await;
                    }
                }
            }
            TransferEvent::Errored {
                downloadable,
                error,
            } => {
                let Some(task) = self.running_task(downloadable.resource_id()) else {
                    return;
                };
                self.handle_transfer_error(&task, downloadable, error).await;
                self.dispatch().await;
            }
            TransferEvent::Finished { downloadable } => {
                tracing::trace!(
                    "Queue {}: transport done with {}",
                    self.name,
                    downloadable.resource_id()
                );
            }
            TransferEvent::FinishedBackgroundEvents { processor_id } => {
                tracing::debug!(
                    "Queue {}: processor {} drained background events",
                    self.name,
                    processor_id
                );
                if let Some(observer) = self.observer() {
                    observer
                        .processor_did_finish_background_events(&processor_id)
                        .await;
                }
            }
        }
    }

    /// Drive the retry loop after a failed transfer or store. Each iteration
    /// either hands the next mirror to a processor or finishes the task.
    async fn handle_transfer_error(
        self: &Arc<Self>,
        task: &Arc<DownloadTask>,
        failed: Downloadable,
        error: FetchError,
    ) {
        let mut failed = failed;
        let mut error = error;
        loop {
            if matches!(error, FetchError::Cancelled) || !error.is_retryable() {
                self.finish_task(task, Some(error)).await;
                return;
            }

            let Some(next) = task.advance(Some(&failed), Some(&error)) else {
                tracing::warn!(
                    "Queue {}: mirrors exhausted for {}, failing with last error",
                    self.name,
                    task.id()
                );
                self.finish_task(task, Some(error)).await;
                return;
            };

            if let Some(observer) = self.observer() {
                observer.download_will_retry(task, &failed, &next, &error).await;
            }

            let Some(processor) = self.processor_for(&next) else {
                self.finish_task(
                    task,
                    Some(FetchError::NoProcessorAvailable(next.location().to_string())),
                )
                .await;
                return;
            };

            match processor.process(next.clone()).await {
                Ok(()) => return,
                Err(err) => {
                    failed = next;
                    error = err;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cap_is_clamped_to_one() {
        let queue = DownloadQueue::new(QueueConfig::named("test", 0));
        assert_eq!(queue.simultaneous_downloads(), 1);
        queue.set_simultaneous_downloads(0).await;
        assert_eq!(queue.simultaneous_downloads(), 1);
    }

    #[tokio::test]
    async fn test_drain_pending_preserves_order() {
        use crate::resource::{DownloadOptions, Mirror, ResourceFile};

        let queue = DownloadQueue::new(QueueConfig::named("test", 1));
        queue.set_active(false).await;

        let policy = Arc::new(WeightedMirrorPolicy::default());
        for name in ["a", "b", "c"] {
            let resource = Arc::new(ResourceFile::new(
                name,
                Mirror::new(format!("{name}-main"), format!("http://host/{name}")),
            ));
            let request = DownloadRequest {
                initial_mirror: resource.main.clone(),
                options: DownloadOptions::default(),
                resource,
            };
            let task = Arc::new(DownloadTask::new(request, Arc::clone(&policy)));
            queue.download(task).await;
        }

        let drained = queue.drain_pending();
        let ids: Vec<&str> = drained.iter().map(|t| t.id()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(queue.stats().queued, 0);
    }
}
