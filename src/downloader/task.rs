//! Download Task
//!
//! Per-resource lifecycle object. The task survives across mirror retries,
//! owns the current downloadable, and signals completion to waiters exactly
//! once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::downloader::downloadable::Downloadable;
use crate::downloader::mirror_policy::WeightedMirrorPolicy;
use crate::error::FetchError;
use crate::resource::DownloadRequest;

/// Task lifecycle state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Created but not yet admitted
    Idle,
    /// Waiting in a queue
    Queued,
    /// A downloadable is being processed
    Running,
    /// Finished successfully
    Completed,
    /// Terminal failure
    Failed,
    /// Cancelled before completion
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_cancel(&self) -> bool {
        matches!(self, Self::Idle | Self::Queued | Self::Running)
    }
}

/// Per-resource download task.
///
/// Keyed by its resource id in the queue; owns the live downloadable across
/// retries and carries the completion signal.
pub struct DownloadTask {
    request: DownloadRequest,
    policy: Arc<WeightedMirrorPolicy>,
    state: Mutex<TaskState>,
    current: Mutex<Option<Downloadable>>,
    /// Set once the request-time mirror selection has been consumed
    initial_consumed: AtomicBool,
    /// Set when a processor started work for this task
    began: AtomicBool,
    outcome: Mutex<Option<Result<(), FetchError>>>,
    completed: AtomicBool,
    notify: Notify,
    pub created_at: DateTime<Utc>,
}

impl DownloadTask {
    /// Create a task for an admitted request. The request's initial mirror is
    /// materialized immediately so scheduling priority can be set before the
    /// first dispatch.
    pub fn new(request: DownloadRequest, policy: Arc<WeightedMirrorPolicy>) -> Self {
        let current = Downloadable::from_mirror(&request.resource.id, &request.initial_mirror);
        Self {
            request,
            policy,
            state: Mutex::new(TaskState::Idle),
            current: Mutex::new(current),
            initial_consumed: AtomicBool::new(false),
            began: AtomicBool::new(false),
            outcome: Mutex::new(None),
            completed: AtomicBool::new(false),
            notify: Notify::new(),
            created_at: Utc::now(),
        }
    }

    /// Task for a resource whose admission-time selection was already spent
    /// by an earlier task. Its first advance consults the policy, so the
    /// shared retry counters keep charging every attempt.
    pub fn continuation(request: DownloadRequest, policy: Arc<WeightedMirrorPolicy>) -> Self {
        let task = Self::new(request, policy);
        task.initial_consumed.store(true, Ordering::SeqCst);
        task
    }

    /// Rebuild a task around a downloadable recovered from a processor's
    /// persisted descriptors. The recovered transfer is already running, so
    /// the initial selection counts as consumed.
    pub fn recovered(
        request: DownloadRequest,
        policy: Arc<WeightedMirrorPolicy>,
        downloadable: Downloadable,
    ) -> Self {
        let task = Self::new(request, policy);
        *task.current.lock().unwrap() = Some(downloadable);
        task.initial_consumed.store(true, Ordering::SeqCst);
        *task.state.lock().unwrap() = TaskState::Running;
        task
    }

    /// Resource id; the key the queue tracks the task under.
    pub fn id(&self) -> &str {
        &self.request.resource.id
    }

    pub fn request(&self) -> &DownloadRequest {
        &self.request
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock().unwrap()
    }

    pub fn mark_queued(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.is_terminal() {
            *state = TaskState::Queued;
        }
    }

    /// The live downloadable, if one has been chosen.
    pub fn current_downloadable(&self) -> Option<Downloadable> {
        self.current.lock().unwrap().clone()
    }

    /// Scheduling priority, read from the current downloadable.
    pub fn priority(&self) -> i32 {
        self.current
            .lock()
            .unwrap()
            .as_ref()
            .map(|d| d.priority())
            .unwrap_or(0)
    }

    pub fn set_priority(&self, priority: i32) {
        if let Some(downloadable) = self.current.lock().unwrap().as_ref() {
            downloadable.set_priority(priority);
        }
    }

    pub fn began(&self) -> bool {
        self.began.load(Ordering::SeqCst)
    }

    pub fn mark_began(&self) {
        self.began.store(true, Ordering::SeqCst);
    }

    /// Advance to the next downloadable.
    ///
    /// The first advance consumes the selection made when the request was
    /// admitted; later advances consult the mirror policy with the failed
    /// mirror. Returns `None` when the policy is exhausted.
    pub fn advance(
        &self,
        previous: Option<&Downloadable>,
        error: Option<&FetchError>,
    ) -> Option<Downloadable> {
        if previous.is_none() && !self.initial_consumed.swap(true, Ordering::SeqCst) {
            let current = self.current.lock().unwrap().clone();
            if let Some(downloadable) = current {
                *self.state.lock().unwrap() = TaskState::Running;
                return Some(downloadable);
            }
            // the initial mirror stopped materializing; fall through to the policy
        }

        let selection = self.policy.next_selection(
            &self.request.resource,
            previous.map(|d| d.mirror_id()),
            error,
        )?;

        let priority = self.priority();
        selection.downloadable.set_priority(priority);
        *self.current.lock().unwrap() = Some(selection.downloadable.clone());
        *self.state.lock().unwrap() = TaskState::Running;
        Some(selection.downloadable)
    }

    /// Cancel the task. With a live downloadable the transport is asked to
    /// cancel and the terminal transition follows its final event; without
    /// one the task completes as cancelled immediately.
    pub fn cancel(&self) -> bool {
        let current = self.current.lock().unwrap().clone();
        match current {
            Some(downloadable) if self.state().can_cancel() && self.began() => {
                downloadable.cancel();
                true
            }
            _ => {
                self.complete(Some(FetchError::Cancelled));
                false
            }
        }
    }

    /// Transition to a terminal state and wake waiters. Exactly one
    /// completion wins; later calls are no-ops.
    pub fn complete(&self, error: Option<FetchError>) {
        if self.completed.swap(true, Ordering::SeqCst) {
            tracing::warn!("Task {} completed more than once; ignoring", self.id());
            return;
        }

        let state = match &error {
            None => TaskState::Completed,
            Some(FetchError::Cancelled) => TaskState::Cancelled,
            Some(_) => TaskState::Failed,
        };
        *self.state.lock().unwrap() = state;
        *self.outcome.lock().unwrap() = Some(match error {
            None => Ok(()),
            Some(err) => Err(err),
        });
        self.notify.notify_waiters();
    }

    /// Suspend until the task reaches a terminal state.
    pub async fn wait_until_complete(&self) -> Result<(), FetchError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register as a waiter before checking, so a completion landing
            // in between still wakes us
            notified.as_mut().enable();
            if let Some(outcome) = self.outcome.lock().unwrap().clone() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Terminal error, if the task failed.
    pub fn terminal_error(&self) -> Option<FetchError> {
        match self.outcome.lock().unwrap().as_ref() {
            Some(Err(err)) => Some(err.clone()),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadTask")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}
