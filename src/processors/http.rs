//! HTTP Download Processor
//!
//! Streams http(s) mirrors to temporary part files. Each transfer persists a
//! JSON sidecar descriptor so interrupted work can be revived by
//! `enqueue_pending` after a restart; revived transfers resume with a Range
//! request where the server allows it.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::downloader::downloadable::{DownloadKind, Downloadable, TransferDescriptor};
use crate::error::{FetchError, FetchResult};
use crate::processors::{DownloadProcessor, TransferEvent, TransferEventSender};

const DESCRIPTOR_SUFFIX: &str = "part.json";
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// HTTP transport backed by a shared reqwest client.
pub struct HttpProcessor {
    id: String,
    client: reqwest::Client,
    tmp_root: PathBuf,
    events: Mutex<Option<TransferEventSender>>,
    paused: tokio::sync::watch::Sender<bool>,
}

impl HttpProcessor {
    /// Standard-priority processor.
    pub fn new(tmp_root: impl Into<PathBuf>) -> Self {
        Self::with_client(
            "http",
            tmp_root,
            Self::client_builder().pool_max_idle_per_host(10),
        )
    }

    /// Same transfer semantics on a distinct session tuned for urgent work:
    /// its own client with a larger connection pool.
    pub fn high_priority(tmp_root: impl Into<PathBuf>) -> Self {
        Self::with_client(
            "http-high",
            tmp_root,
            Self::client_builder().pool_max_idle_per_host(30),
        )
    }

    fn client_builder() -> reqwest::ClientBuilder {
        reqwest::Client::builder()
            .user_agent(concat!("fetchkit/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(300))
    }

    fn with_client(id: &str, tmp_root: impl Into<PathBuf>, builder: reqwest::ClientBuilder) -> Self {
        let (paused, _) = tokio::sync::watch::channel(false);
        Self {
            id: id.to_string(),
            client: builder.build().unwrap_or_default(),
            tmp_root: tmp_root.into(),
            events: Mutex::new(None),
            paused,
        }
    }

    fn sender(&self) -> FetchResult<TransferEventSender> {
        self.events
            .lock()
            .unwrap()
            .clone()
            .ok_or(FetchError::ProcessorInactive)
    }

    fn emit(sender: &TransferEventSender, event: TransferEvent) {
        let _ = sender.send(event);
    }

    async fn prepare_transfer(&self, downloadable: &Downloadable) -> FetchResult<PathBuf> {
        tokio::fs::create_dir_all(&self.tmp_root)
            .await
            .map_err(|_| FetchError::CannotCreateDirectory(self.tmp_root.clone()))?;

        let part_path = self.tmp_root.join(format!("{}.part", Uuid::new_v4()));
        let descriptor = downloadable.descriptor();
        let json = serde_json::to_vec(&descriptor)
            .map_err(|e| FetchError::InvalidParameters(e.to_string()))?;
        tokio::fs::write(descriptor_path(&part_path), json).await?;
        Ok(part_path)
    }

    fn spawn_transfer(&self, downloadable: Downloadable, part_path: PathBuf) -> FetchResult<()> {
        let sender = self.sender()?;
        let client = self.client.clone();
        let paused = self.paused.subscribe();

        tokio::spawn(async move {
            Self::emit(
                &sender,
                TransferEvent::Began {
                    downloadable: downloadable.clone(),
                },
            );

            let result =
                Self::run_transfer(client, &downloadable, &part_path, &sender, paused).await;

            match result {
                Ok(()) => {
                    let _ = tokio::fs::remove_file(descriptor_path(&part_path)).await;
                    Self::emit(
                        &sender,
                        TransferEvent::FinishedTransfer {
                            downloadable: downloadable.clone(),
                            temp_path: part_path,
                        },
                    );
                }
                Err(error) => {
                    let _ = tokio::fs::remove_file(&part_path).await;
                    let _ = tokio::fs::remove_file(descriptor_path(&part_path)).await;
                    Self::emit(
                        &sender,
                        TransferEvent::Errored {
                            downloadable: downloadable.clone(),
                            error,
                        },
                    );
                }
            }

            Self::emit(&sender, TransferEvent::Finished { downloadable });
        });
        Ok(())
    }

    async fn run_transfer(
        client: reqwest::Client,
        downloadable: &Downloadable,
        part_path: &Path,
        sender: &TransferEventSender,
        mut paused: tokio::sync::watch::Receiver<bool>,
    ) -> FetchResult<()> {
        let cancel_token = downloadable.cancellation_token();

        // resume a revived transfer from the bytes already on disk
        let initial_bytes = match tokio::fs::metadata(part_path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let mut request = client.get(downloadable.location());
        if initial_bytes > 0 {
            request = request.header("Range", format!("bytes={}-", initial_bytes));
            tracing::info!(
                "Resuming transfer of {} from byte {}",
                downloadable.resource_id(),
                initial_bytes
            );
        }

        let response = request.send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::RANGE_NOT_SATISFIABLE {
            // everything was already on disk
            return Ok(());
        }
        if !status.is_success() {
            return Err(FetchError::from_status(
                status.as_u16(),
                status.canonical_reason().unwrap_or("request failed"),
            ));
        }

        let content_length = response.content_length().unwrap_or(0);
        let resuming = initial_bytes > 0 && status == reqwest::StatusCode::PARTIAL_CONTENT;
        let expected = if resuming {
            initial_bytes + content_length
        } else {
            content_length
        };
        // a server that ignored the Range header restarts the file
        let mut transferred = if resuming { initial_bytes } else { 0 };

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(!resuming)
            .append(resuming)
            .open(part_path)
            .await?;

        let mut stream = response.bytes_stream();
        let mut started = false;
        let mut last_emit = Instant::now();

        while let Some(chunk_result) = stream.next().await {
            if downloadable.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            // hold position while paused, still honouring cancellation
            while *paused.borrow() {
                tokio::select! {
                    _ = paused.changed() => {}
                    _ = cancel_token.cancelled() => {
                        return Err(FetchError::Cancelled);
                    }
                }
            }

            let chunk = chunk_result?;
            file.write_all(&chunk).await?;
            transferred += chunk.len() as u64;

            if !started {
                started = true;
                Self::emit(
                    sender,
                    TransferEvent::TransferStarted {
                        downloadable: downloadable.clone(),
                    },
                );
            }

            if last_emit.elapsed() >= PROGRESS_INTERVAL {
                last_emit = Instant::now();
                Self::emit(
                    sender,
                    TransferEvent::DataTransferred {
                        downloadable: downloadable.clone(),
                        transferred,
                        expected,
                    },
                );
            }
        }

        file.flush().await?;
        Self::emit(
            sender,
            TransferEvent::DataTransferred {
                downloadable: downloadable.clone(),
                transferred,
                expected: expected.max(transferred),
            },
        );
        Ok(())
    }
}

fn descriptor_path(part_path: &Path) -> PathBuf {
    let mut os = part_path.as_os_str().to_owned();
    os.push(".json");
    PathBuf::from(os)
}

#[async_trait]
impl DownloadProcessor for HttpProcessor {
    fn id(&self) -> &str {
        &self.id
    }

    fn can_process(&self, downloadable: &Downloadable) -> bool {
        downloadable.kind() == DownloadKind::Http
    }

    async fn process(&self, downloadable: Downloadable) -> FetchResult<()> {
        if !self.can_process(&downloadable) {
            return Err(FetchError::CannotProcess(
                downloadable.location().to_string(),
            ));
        }
        self.sender()?;
        let part_path = self.prepare_transfer(&downloadable).await?;
        self.spawn_transfer(downloadable, part_path)
    }

    async fn pause(&self) {
        let _ = self.paused.send(true);
        tracing::info!("Processor {}: paused", self.id);
    }

    async fn resume(&self) {
        let _ = self.paused.send(false);
        tracing::info!("Processor {}: resumed", self.id);
    }

    /// Scan the tmp root for descriptors left by a previous process and
    /// restart their transfers, resuming from the part bytes on disk.
    async fn enqueue_pending(&self) -> Vec<Downloadable> {
        let mut recovered = Vec::new();

        let Ok(mut entries) = tokio::fs::read_dir(&self.tmp_root).await else {
            return recovered;
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !path.to_string_lossy().ends_with(DESCRIPTOR_SUFFIX) {
                continue;
            }
            let Ok(bytes) = tokio::fs::read(&path).await else {
                continue;
            };
            let Ok(descriptor) = serde_json::from_slice::<TransferDescriptor>(&bytes) else {
                tracing::warn!("Dropping undecodable transfer descriptor {:?}", path);
                let _ = tokio::fs::remove_file(&path).await;
                continue;
            };
            let Some(downloadable) = Downloadable::from_descriptor(&descriptor) else {
                let _ = tokio::fs::remove_file(&path).await;
                continue;
            };

            // <name>.part.json -> <name>.part
            let part_path = path.with_extension("");
            if self.spawn_transfer(downloadable.clone(), part_path).is_ok() {
                recovered.push(downloadable);
            }
        }

        if let Some(sender) = self.events.lock().unwrap().clone() {
            Self::emit(
                &sender,
                TransferEvent::FinishedBackgroundEvents {
                    processor_id: self.id.clone(),
                },
            );
        }
        recovered
    }

    fn set_event_sender(&self, sender: TransferEventSender) {
        *self.events.lock().unwrap() = Some(sender);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Mirror;

    #[test]
    fn test_can_process_by_scheme() {
        let processor = HttpProcessor::new("/tmp/fetchkit-test");
        let http = Downloadable::from_mirror("r1", &Mirror::new("m1", "http://x/a")).unwrap();
        let cloud =
            Downloadable::from_mirror("r1", &Mirror::new("m2", "cloudkit://c:t:r")).unwrap();
        assert!(processor.can_process(&http));
        assert!(!processor.can_process(&cloud));
    }

    #[test]
    fn test_descriptor_path_appends_json() {
        let path = descriptor_path(Path::new("/tmp/abc.part"));
        assert_eq!(path, PathBuf::from("/tmp/abc.part.json"));
        assert_eq!(path.with_extension(""), PathBuf::from("/tmp/abc.part"));
    }

    #[tokio::test]
    async fn test_process_without_event_sender_is_inactive() {
        let dir = tempfile::tempdir().unwrap();
        let processor = HttpProcessor::new(dir.path());
        let downloadable =
            Downloadable::from_mirror("r1", &Mirror::new("m1", "http://x/a")).unwrap();
        assert!(matches!(
            processor.process(downloadable).await,
            Err(FetchError::ProcessorInactive)
        ));
    }

    #[tokio::test]
    async fn test_enqueue_pending_revives_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = TransferDescriptor {
            resource_id: "r1".to_string(),
            mirror_id: "m1".to_string(),
            location: "http://localhost:9/file".to_string(),
            expected_bytes: 128,
        };
        tokio::fs::write(
            dir.path().join("old.part.json"),
            serde_json::to_vec(&descriptor).unwrap(),
        )
        .await
        .unwrap();

        let processor = HttpProcessor::new(dir.path());
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        processor.set_event_sender(tx);

        let recovered = processor.enqueue_pending().await;
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].resource_id(), "r1");
        assert_eq!(recovered[0].expected_bytes(), 128);
    }
}
