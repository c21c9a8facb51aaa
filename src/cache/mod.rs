//! Two-Tier Resource Cache
//!
//! Memory maps in front of a SQLite-indexed file store. The cache answers
//! "do I already have this?", deduplicates in-flight requests, moves finished
//! transfers into their storage tier, promotes files between tiers, and
//! cleans up orphans.

pub mod memory;
pub mod paths;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::db::{LocalFileRecord, LocalFileStore};
use crate::downloader::downloadable::Downloadable;
use crate::downloader::mirror_policy::WeightedMirrorPolicy;
use crate::error::{FetchError, FetchResult};
use crate::resource::{DownloadOptions, DownloadRequest, Mirror, ResourceFile, StoragePriority};

pub use memory::{ImageData, ImageDecoder, MemoryCache};
pub use paths::StorageRoots;

/// Outcome of reporting a failed downloadable to the cache.
#[derive(Debug, Clone)]
pub enum RetryOutcome {
    /// Another mirror is worth trying
    Retry {
        request: DownloadRequest,
        next_mirror: Mirror,
    },
    /// Nothing left to try; the request is terminal
    Exhausted { request: DownloadRequest },
    /// The downloadable matches no in-flight request
    Unknown,
}

/// Two-tier cache of resource files.
pub struct ResourceCache {
    store: LocalFileStore,
    memory: MemoryCache,
    policy: Arc<WeightedMirrorPolicy>,
    roots: StorageRoots,
    /// resource id -> admitted request; written only by the cache
    in_flight: Mutex<HashMap<String, DownloadRequest>>,
}

impl ResourceCache {
    pub fn new(
        store: LocalFileStore,
        memory: MemoryCache,
        policy: Arc<WeightedMirrorPolicy>,
        roots: StorageRoots,
    ) -> Self {
        Self {
            store,
            memory,
            policy,
            roots,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn roots(&self) -> &StorageRoots {
        &self.roots
    }

    pub fn policy(&self) -> &Arc<WeightedMirrorPolicy> {
        &self.policy
    }

    pub fn memory(&self) -> &MemoryCache {
        &self.memory
    }

    /// Admit resources for download.
    ///
    /// Existing records are promoted or demoted when the requested tier
    /// differs; fresh, present resources are filtered out; the rest get an
    /// initial mirror selection and an in-flight registration. Idempotent for
    /// already-downloaded and already-in-flight resources.
    pub async fn request_downloads(
        &self,
        resources: Vec<ResourceFile>,
        options: DownloadOptions,
    ) -> Vec<DownloadRequest> {
        let mut requests = Vec::new();

        for resource in resources {
            if let Ok(Some(record)) = self.store.get(&resource.id) {
                if record.storage != options.storage_priority && record.file_path.exists() {
                    if let Err(err) = self
                        .set_storage_priority(&resource.id, options.storage_priority)
                        .await
                    {
                        tracing::warn!(
                            "Tier change failed for {}: {}; keeping {:?}",
                            resource.id,
                            err,
                            record.storage
                        );
                    }
                }
            }

            if self.is_available(&resource) {
                tracing::debug!("Resource {} already present and fresh", resource.id);
                continue;
            }

            // check and insert under one lock so two concurrent callers for
            // the same resource produce at most one in-flight entry; the
            // selection is synchronous, so no await happens in between
            let admitted = {
                let mut in_flight = self.in_flight.lock().unwrap();
                if in_flight.contains_key(&resource.id) {
                    tracing::debug!("Resource {} already in flight", resource.id);
                    None
                } else if let Some(selection) = self.policy.initial_selection(&resource) {
                    let request = DownloadRequest {
                        resource: Arc::new(resource),
                        options,
                        initial_mirror: selection.mirror,
                    };
                    in_flight.insert(request.resource.id.clone(), request.clone());
                    Some(request)
                } else {
                    tracing::warn!(
                        "Resource {} yields no mirror selection, skipping",
                        resource.id
                    );
                    None
                }
            };
            if let Some(request) = admitted {
                requests.push(request);
            }
        }

        requests
    }

    /// Resolve the in-flight request a downloadable belongs to. Matching is
    /// by the downloadable's identifier against any of the resource's mirror
    /// ids, so a retry against a different mirror still resolves.
    pub fn download_request(&self, downloadable: &Downloadable) -> Option<DownloadRequest> {
        let in_flight = self.in_flight.lock().unwrap();
        if let Some(request) = in_flight.get(downloadable.resource_id()) {
            return Some(request.clone());
        }
        in_flight
            .values()
            .find(|r| r.resource.has_mirror(downloadable.mirror_id()))
            .cloned()
    }

    /// Store a finished transfer: move the temp file to a unique target under
    /// the request's tier, persist the record, warm the memory map, and clear
    /// the resource's retry budget.
    pub async fn download_finished(
        &self,
        downloadable: &Downloadable,
        temp_path: &Path,
    ) -> FetchResult<DownloadRequest> {
        let request = self.download_request(downloadable).ok_or_else(|| {
            FetchError::InvalidDownloadable(downloadable.resource_id().to_string())
        })?;
        let resource_id = request.resource.id.clone();

        let resources_dir = self.roots.resources_dir(request.options.storage_priority);
        let extension = paths::extension_for_location(downloadable.location());
        let target = paths::unique_target_path(&resources_dir, &resource_id, extension.as_deref())?;

        paths::move_file(temp_path, &target).await?;
        paths::exclude_from_backup(&target);

        let record = LocalFileRecord {
            id: resource_id.clone(),
            mirror_id: downloadable.mirror_id().to_string(),
            file_path: target.clone(),
            storage: request.options.storage_priority,
            created_at: request.resource.created_at,
        };
        self.store.upsert(&record)?;
        self.memory.set_file(&resource_id, target);

        self.policy.download_complete(&resource_id);
        self.in_flight.lock().unwrap().remove(&resource_id);

        tracing::info!(
            "Stored {} under {:?} tier",
            resource_id,
            request.options.storage_priority
        );
        Ok(request)
    }

    /// Report a failed downloadable. Retryable failures with remaining budget
    /// name the next mirror; anything else drops the in-flight entry and is
    /// terminal for the request.
    pub fn download_failed(&self, downloadable: &Downloadable, error: &FetchError) -> RetryOutcome {
        let Some(request) = self.download_request(downloadable) else {
            return RetryOutcome::Unknown;
        };

        if error.is_retryable() {
            if let Some(next_mirror) = self
                .policy
                .peek_next(&request.resource, Some(downloadable.mirror_id()))
            {
                return RetryOutcome::Retry {
                    request,
                    next_mirror,
                };
            }
        }

        self.in_flight
            .lock()
            .unwrap()
            .remove(request.resource.id.as_str());
        RetryOutcome::Exhausted { request }
    }

    /// Treat a request as cancelled: forget its in-flight entry.
    pub fn cancel(&self, request: &DownloadRequest) {
        self.in_flight
            .lock()
            .unwrap()
            .remove(request.resource.id.as_str());
    }

    /// Whether a request for this resource is currently in flight.
    pub fn is_in_flight(&self, resource_id: &str) -> bool {
        self.in_flight.lock().unwrap().contains_key(resource_id)
    }

    /// A resource is available when its record exists, the file exists, and
    /// the record is at least as fresh as the resource.
    pub fn is_available(&self, resource: &ResourceFile) -> bool {
        let Ok(Some(record)) = self.store.get(&resource.id) else {
            return false;
        };
        if !record.file_path.exists() {
            return false;
        }
        match (record.created_at, resource.created_at) {
            (_, None) => true,
            (Some(recorded), Some(wanted)) => recorded >= wanted,
            (None, Some(_)) => false,
        }
    }

    /// Stored file path for a resource id.
    pub fn file_url(&self, id: &str) -> Option<PathBuf> {
        if let Some(path) = self.memory.file_url(id) {
            return Some(path);
        }
        let record = self.store.get(id).ok().flatten()?;
        if record.file_path.exists() {
            self.memory.set_file(id, record.file_path.clone());
            Some(record.file_path)
        } else {
            None
        }
    }

    pub fn data(&self, id: &str) -> Option<Vec<u8>> {
        self.file_url(id)?;
        self.memory.data(id)
    }

    pub fn image(&self, id: &str) -> Option<Arc<ImageData>> {
        self.file_url(id)?;
        self.memory.image(id)
    }

    /// Move a stored resource between tiers. Equal tier is a no-op; each
    /// resource moves atomically on its own.
    pub async fn set_storage_priority(
        &self,
        id: &str,
        storage: StoragePriority,
    ) -> FetchResult<()> {
        let Some(record) = self.store.get(id)? else {
            return Err(FetchError::FileNotFound(PathBuf::from(id)));
        };
        if record.storage == storage {
            return Ok(());
        }

        let resources_dir = self.roots.resources_dir(storage);
        let extension = record
            .file_path
            .extension()
            .map(|e| e.to_string_lossy().to_string());
        let target = paths::unique_target_path(&resources_dir, id, extension.as_deref())?;
        paths::move_file(&record.file_path, &target).await?;
        paths::exclude_from_backup(&target);

        let updated = LocalFileRecord {
            storage,
            file_path: target.clone(),
            ..record
        };
        self.store.upsert(&updated)?;
        self.memory.set_file(id, target);
        tracing::info!("Moved {} to {:?} tier", id, storage);
        Ok(())
    }

    /// Delete every stored file and record not named in `excluding`. Records
    /// whose file disappeared are dropped regardless, and stray files with no
    /// owning record are removed from both tier subtrees.
    pub async fn cleanup(&self, excluding: &HashSet<String>) -> FetchResult<()> {
        let records = self.store.all()?;
        let mut kept_paths: HashSet<PathBuf> = HashSet::new();

        for record in records {
            if !excluding.contains(&record.id) {
                if record.file_path.exists() {
                    if let Err(err) = tokio::fs::remove_file(&record.file_path).await {
                        tracing::warn!("Cleanup: cannot delete {:?}: {}", record.file_path, err);
                    }
                }
                self.store.delete(&record.id)?;
                self.memory.remove(&record.id);
            } else if !record.file_path.exists() {
                tracing::debug!("Cleanup: record {} lost its file, dropping", record.id);
                self.store.delete(&record.id)?;
                self.memory.remove(&record.id);
            } else {
                kept_paths.insert(record.file_path.clone());
            }
        }

        for storage in [StoragePriority::Permanent, StoragePriority::Cached] {
            let dir = self.roots.resources_dir(storage);
            let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.is_file() && !kept_paths.contains(&path) {
                    tracing::debug!("Cleanup: removing orphan file {:?}", path);
                    if let Err(err) = tokio::fs::remove_file(&path).await {
                        tracing::warn!("Cleanup: cannot delete orphan {:?}: {}", path, err);
                    }
                }
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for ResourceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCache")
            .field("in_flight", &self.in_flight.lock().unwrap().len())
            .finish()
    }
}
