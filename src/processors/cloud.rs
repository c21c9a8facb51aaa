//! Cloud Asset Processor
//!
//! Transport for `cloudkit://` mirrors. Requests arriving within a short
//! throttle window are coalesced into one batched service fetch to stay under
//! service rate limits; per-record outcomes are routed back to the
//! originating downloadables.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::downloader::downloadable::{DownloadKind, Downloadable};
use crate::error::{FetchError, FetchResult};
use crate::processors::{DownloadProcessor, TransferEvent, TransferEventSender};

pub const DEFAULT_BATCH_WINDOW: Duration = Duration::from_millis(500);

/// Parsed `cloudkit://` location:
/// `cloudkit://<container>[:<zone>:<owner>]:<recordType>:<recordId>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudRecordId {
    pub container: String,
    pub zone: Option<String>,
    pub owner: Option<String>,
    pub record_type: String,
    pub record_name: String,
}

impl CloudRecordId {
    pub fn parse(location: &str) -> FetchResult<Self> {
        let rest = location
            .strip_prefix("cloudkit://")
            .ok_or_else(|| FetchError::InvalidRecordId(location.to_string()))?;

        let parts: Vec<&str> = rest.split(':').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(FetchError::InvalidRecordId(location.to_string()));
        }
        match parts.as_slice() {
            [container, record_type, record_name] => Ok(Self {
                container: container.to_string(),
                zone: None,
                owner: None,
                record_type: record_type.to_string(),
                record_name: record_name.to_string(),
            }),
            [container, zone, owner, record_type, record_name] => Ok(Self {
                container: container.to_string(),
                zone: Some(zone.to_string()),
                owner: Some(owner.to_string()),
                record_type: record_type.to_string(),
                record_name: record_name.to_string(),
            }),
            _ => Err(FetchError::InvalidRecordId(location.to_string())),
        }
    }
}

/// One record returned by the asset service.
#[derive(Debug, Clone)]
pub struct CloudRecord {
    pub record_name: String,
    /// Asset bytes; `None` when the record exists but carries no asset
    pub data: Option<Vec<u8>>,
}

/// Pluggable client for the actual cloud service; one call fetches a whole
/// batch of record ids.
#[async_trait]
pub trait CloudAssetService: Send + Sync {
    async fn fetch_records(&self, ids: &[CloudRecordId]) -> anyhow::Result<Vec<CloudRecord>>;
}

struct PendingFetch {
    record_id: CloudRecordId,
    downloadable: Downloadable,
}

struct Inner {
    id: String,
    service: Arc<dyn CloudAssetService>,
    tmp_root: PathBuf,
    batch_window: Duration,
    events: Mutex<Option<TransferEventSender>>,
    pending: Mutex<Vec<PendingFetch>>,
    flush_scheduled: AtomicBool,
    paused: tokio::sync::watch::Sender<bool>,
}

/// Batching cloud-asset transport.
pub struct CloudAssetProcessor {
    inner: Arc<Inner>,
}

impl CloudAssetProcessor {
    pub fn new(service: Arc<dyn CloudAssetService>, tmp_root: impl Into<PathBuf>) -> Self {
        Self::with_batch_window(service, tmp_root, DEFAULT_BATCH_WINDOW)
    }

    pub fn with_batch_window(
        service: Arc<dyn CloudAssetService>,
        tmp_root: impl Into<PathBuf>,
        batch_window: Duration,
    ) -> Self {
        let (paused, _) = tokio::sync::watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                id: "cloud-asset".to_string(),
                service,
                tmp_root: tmp_root.into(),
                batch_window,
                events: Mutex::new(None),
                pending: Mutex::new(Vec::new()),
                flush_scheduled: AtomicBool::new(false),
                paused,
            }),
        }
    }

    fn emit(sender: &TransferEventSender, event: TransferEvent) {
        let _ = sender.send(event);
    }

    /// Collect the window's pending fetches, issue one batched service call,
    /// and route each record's outcome to its downloadable.
    async fn flush(inner: Arc<Inner>) {
        tokio::time::sleep(inner.batch_window).await;

        // hold the batch while paused
        let mut paused = inner.paused.subscribe();
        while *paused.borrow() {
            if paused.changed().await.is_err() {
                return;
            }
        }

        inner.flush_scheduled.store(false, Ordering::SeqCst);
        let batch: Vec<PendingFetch> = {
            let mut pending = inner.pending.lock().unwrap();
            pending.drain(..).collect()
        };
        if batch.is_empty() {
            return;
        }

        let Some(sender) = inner.events.lock().unwrap().clone() else {
            return;
        };

        let (live, cancelled): (Vec<_>, Vec<_>) = batch
            .into_iter()
            .partition(|f| !f.downloadable.is_cancelled());
        for fetch in cancelled {
            Self::emit(
                &sender,
                TransferEvent::Errored {
                    downloadable: fetch.downloadable,
                    error: FetchError::Cancelled,
                },
            );
        }
        if live.is_empty() {
            return;
        }

        let ids: Vec<CloudRecordId> = live.iter().map(|f| f.record_id.clone()).collect();
        tracing::debug!("Cloud batch: fetching {} records", ids.len());

        let records = match inner.service.fetch_records(&ids).await {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!("Cloud batch fetch failed: {}", err);
                for fetch in live {
                    Self::emit(
                        &sender,
                        TransferEvent::Errored {
                            downloadable: fetch.downloadable,
                            error: FetchError::CloudUnavailable(err.to_string()),
                        },
                    );
                }
                return;
            }
        };

        for fetch in live {
            let downloadable = fetch.downloadable;
            let record = records
                .iter()
                .find(|r| r.record_name == fetch.record_id.record_name);

            let outcome = match record {
                None => Err(FetchError::NoRecord(fetch.record_id.record_name.clone())),
                Some(record) => match &record.data {
                    None => Err(FetchError::NoAssetData(record.record_name.clone())),
                    Some(data) => Self::store_asset(&inner, &sender, &downloadable, data).await,
                },
            };

            match outcome {
                Ok(temp_path) => {
                    Self::emit(
                        &sender,
                        TransferEvent::FinishedTransfer {
                            downloadable: downloadable.clone(),
                            temp_path,
                        },
                    );
                    Self::emit(&sender, TransferEvent::Finished { downloadable });
                }
                Err(error) => {
                    Self::emit(
                        &sender,
                        TransferEvent::Errored {
                            downloadable,
                            error,
                        },
                    );
                }
            }
        }
    }

    async fn store_asset(
        inner: &Inner,
        sender: &TransferEventSender,
        downloadable: &Downloadable,
        data: &[u8],
    ) -> FetchResult<PathBuf> {
        tokio::fs::create_dir_all(&inner.tmp_root)
            .await
            .map_err(|_| FetchError::CannotCreateDirectory(inner.tmp_root.clone()))?;

        Self::emit(
            sender,
            TransferEvent::TransferStarted {
                downloadable: downloadable.clone(),
            },
        );

        let temp_path = inner.tmp_root.join(format!("{}.asset", Uuid::new_v4()));
        tokio::fs::write(&temp_path, data).await?;

        Self::emit(
            sender,
            TransferEvent::DataTransferred {
                downloadable: downloadable.clone(),
                transferred: data.len() as u64,
                expected: data.len() as u64,
            },
        );
        Ok(temp_path)
    }
}

#[async_trait]
impl DownloadProcessor for CloudAssetProcessor {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn can_process(&self, downloadable: &Downloadable) -> bool {
        downloadable.kind() == DownloadKind::CloudAsset
    }

    async fn process(&self, downloadable: Downloadable) -> FetchResult<()> {
        if !self.can_process(&downloadable) {
            return Err(FetchError::CannotProcess(
                downloadable.location().to_string(),
            ));
        }
        if self.inner.events.lock().unwrap().is_none() {
            return Err(FetchError::ProcessorInactive);
        }
        let record_id = CloudRecordId::parse(downloadable.location())?;

        if let Some(sender) = self.inner.events.lock().unwrap().clone() {
            Self::emit(
                &sender,
                TransferEvent::Began {
                    downloadable: downloadable.clone(),
                },
            );
        }

        self.inner.pending.lock().unwrap().push(PendingFetch {
            record_id,
            downloadable,
        });

        if !self.inner.flush_scheduled.swap(true, Ordering::SeqCst) {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(Self::flush(inner));
        }
        Ok(())
    }

    async fn pause(&self) {
        let _ = self.inner.paused.send(true);
        tracing::info!("Processor {}: paused", self.inner.id);
    }

    async fn resume(&self) {
        let _ = self.inner.paused.send(false);
        tracing::info!("Processor {}: resumed", self.inner.id);
    }

    /// Cloud batches are short-lived and never persisted, so there is nothing
    /// to recover.
    async fn enqueue_pending(&self) -> Vec<Downloadable> {
        if let Some(sender) = self.inner.events.lock().unwrap().clone() {
            Self::emit(
                &sender,
                TransferEvent::FinishedBackgroundEvents {
                    processor_id: self.inner.id.clone(),
                },
            );
        }
        Vec::new()
    }

    fn set_event_sender(&self, sender: TransferEventSender) {
        *self.inner.events.lock().unwrap() = Some(sender);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Mirror;

    struct StaticService {
        records: Vec<CloudRecord>,
    }

    #[async_trait]
    impl CloudAssetService for StaticService {
        async fn fetch_records(&self, _ids: &[CloudRecordId]) -> anyhow::Result<Vec<CloudRecord>> {
            Ok(self.records.clone())
        }
    }

    #[test]
    fn test_parse_short_form() {
        let id = CloudRecordId::parse("cloudkit://container:Asset:rec-1").unwrap();
        assert_eq!(id.container, "container");
        assert_eq!(id.zone, None);
        assert_eq!(id.record_type, "Asset");
        assert_eq!(id.record_name, "rec-1");
    }

    #[test]
    fn test_parse_long_form() {
        let id = CloudRecordId::parse("cloudkit://container:zone:owner:Asset:rec-1").unwrap();
        assert_eq!(id.zone.as_deref(), Some("zone"));
        assert_eq!(id.owner.as_deref(), Some("owner"));
        assert_eq!(id.record_name, "rec-1");
    }

    #[test]
    fn test_parse_rejects_malformed_locations() {
        assert!(CloudRecordId::parse("cloudkit://container:Asset").is_err());
        assert!(CloudRecordId::parse("cloudkit://a:b:c:d").is_err());
        assert!(CloudRecordId::parse("http://container:Asset:rec-1").is_err());
        assert!(CloudRecordId::parse("cloudkit://a::c").is_err());
    }

    #[tokio::test]
    async fn test_batch_coalesces_and_routes_records() {
        let dir = tempfile::tempdir().unwrap();
        let service = Arc::new(StaticService {
            records: vec![
                CloudRecord {
                    record_name: "rec-1".to_string(),
                    data: Some(b"one".to_vec()),
                },
                CloudRecord {
                    record_name: "rec-2".to_string(),
                    data: None,
                },
            ],
        });
        let processor = CloudAssetProcessor::with_batch_window(
            service,
            dir.path(),
            Duration::from_millis(10),
        );
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        processor.set_event_sender(tx);

        let one = Downloadable::from_mirror(
            "r1",
            &Mirror::new("m1", "cloudkit://container:Asset:rec-1"),
        )
        .unwrap();
        let two = Downloadable::from_mirror(
            "r2",
            &Mirror::new("m2", "cloudkit://container:Asset:rec-2"),
        )
        .unwrap();
        processor.process(one).await.unwrap();
        processor.process(two).await.unwrap();

        let mut finished = None;
        let mut errored = None;
        for _ in 0..16 {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
                Ok(Some(TransferEvent::FinishedTransfer {
                    downloadable,
                    temp_path,
                })) => finished = Some((downloadable, temp_path)),
                Ok(Some(TransferEvent::Errored {
                    downloadable,
                    error,
                })) => errored = Some((downloadable, error)),
                Ok(Some(_)) => continue,
                _ => break,
            }
            if finished.is_some() && errored.is_some() {
                break;
            }
        }

        let (downloadable, temp_path) = finished.expect("rec-1 should finish");
        assert_eq!(downloadable.resource_id(), "r1");
        assert_eq!(tokio::fs::read(temp_path).await.unwrap(), b"one");

        let (downloadable, error) = errored.expect("rec-2 should error");
        assert_eq!(downloadable.resource_id(), "r2");
        assert!(matches!(error, FetchError::NoAssetData(_)));
    }

    #[tokio::test]
    async fn test_unknown_record_errors_with_no_record() {
        let dir = tempfile::tempdir().unwrap();
        let service = Arc::new(StaticService { records: vec![] });
        let processor = CloudAssetProcessor::with_batch_window(
            service,
            dir.path(),
            Duration::from_millis(10),
        );
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        processor.set_event_sender(tx);

        let downloadable = Downloadable::from_mirror(
            "r1",
            &Mirror::new("m1", "cloudkit://container:Asset:ghost"),
        )
        .unwrap();
        processor.process(downloadable).await.unwrap();

        loop {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("event expected")
            {
                Some(TransferEvent::Errored { error, .. }) => {
                    assert!(matches!(error, FetchError::NoRecord(_)));
                    break;
                }
                Some(_) => continue,
                None => panic!("channel closed before error event"),
            }
        }
    }
}
