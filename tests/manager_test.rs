use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tempfile::TempDir;
use uplink::errors::TusOp;
use uplink::{
    FinalizeRequest, FinalizeResponse, PersistStore, PersistedUpload, Result, ServerConfig,
    TusTransport, UploadError, UploadManager, UploadMetadata, UploadOptions, UploadStatus,
};

#[derive(Default)]
struct MockState {
    next_id: u32,
    /// Bytes the server holds per resource URL
    offsets: HashMap<String, u64>,
    /// Acknowledged byte ranges per URL, in ack order
    acked: Vec<(String, u64, u64)>,
    create_calls: u32,
    patch_calls: u32,
    head_calls: Vec<String>,
    delete_calls: Vec<String>,
    finalize_calls: Vec<(String, FinalizeRequest)>,
    /// Resources the server has forgotten
    gone: HashSet<String>,
    /// Status to return from create instead of succeeding
    fail_create: Option<u16>,
    fail_delete: bool,
    /// 1-based patch call that gets a 409; the server is pretended to be
    /// one chunk ahead of the client at that point
    conflict_on_patch: Option<u32>,
}

/// In-memory upload server.
struct MockTransport {
    state: Mutex<MockState>,
    chunk_size: u64,
    chunk_delay: Duration,
}

impl MockTransport {
    fn new(chunk_size: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState::default()),
            chunk_size,
            chunk_delay: Duration::ZERO,
        })
    }

    fn with_delay(chunk_size: u64, chunk_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState::default()),
            chunk_size,
            chunk_delay,
        })
    }
}

#[async_trait]
impl TusTransport for MockTransport {
    async fn create_upload(&self, _total_size: u64, _metadata: &UploadMetadata) -> Result<String> {
        let mut state = self.state.lock();
        if let Some(status) = state.fail_create {
            return Err(UploadError::Protocol { op: TusOp::Create, status });
        }
        state.next_id += 1;
        state.create_calls += 1;
        let url = format!("https://mock/tus/u{}", state.next_id);
        state.offsets.insert(url.clone(), 0);
        Ok(url)
    }

    async fn patch_chunk(&self, upload_url: &str, offset: u64, body: Bytes) -> Result<u64> {
        {
            let mut state = self.state.lock();
            state.patch_calls += 1;
            if state.gone.contains(upload_url) {
                return Err(UploadError::Protocol { op: TusOp::Chunk, status: 404 });
            }
            if state.conflict_on_patch == Some(state.patch_calls) {
                state.conflict_on_patch = None;
                // Server is a chunk ahead of what the client thinks.
                let bumped = offset + body.len() as u64;
                state.offsets.insert(upload_url.to_string(), bumped);
                return Err(UploadError::Protocol { op: TusOp::Chunk, status: 409 });
            }
            let server_offset = state.offsets.get(upload_url).copied().unwrap_or(0);
            if server_offset != offset {
                return Err(UploadError::Protocol { op: TusOp::Chunk, status: 409 });
            }
        }

        // The delay sits outside the lock so an abort mid-chunk drops the
        // future before the bytes are acknowledged.
        if self.chunk_delay > Duration::ZERO {
            tokio::time::sleep(self.chunk_delay).await;
        }

        let mut state = self.state.lock();
        let new_offset = offset + body.len() as u64;
        state.offsets.insert(upload_url.to_string(), new_offset);
        state.acked.push((upload_url.to_string(), offset, new_offset));
        Ok(new_offset)
    }

    async fn head_offset(&self, upload_url: &str) -> Result<u64> {
        let mut state = self.state.lock();
        if state.gone.contains(upload_url) {
            return Err(UploadError::Protocol { op: TusOp::Offset, status: 404 });
        }
        state.head_calls.push(upload_url.to_string());
        Ok(state.offsets.get(upload_url).copied().unwrap_or(0))
    }

    async fn delete_upload(&self, upload_url: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.delete_calls.push(upload_url.to_string());
        if state.fail_delete {
            return Err(UploadError::server(500, "delete timed out"));
        }
        state.offsets.remove(upload_url);
        Ok(())
    }

    async fn fetch_config(&self) -> Result<ServerConfig> {
        Ok(ServerConfig {
            enabled: true,
            endpoint: "https://mock/tus".to_string(),
            max_upload_size: 10 * 1024 * 1024 * 1024,
            chunk_size: self.chunk_size,
            upload_expiration_period: 86_400_000,
        })
    }

    async fn finalize(
        &self,
        server_upload_id: &str,
        request: &FinalizeRequest,
    ) -> Result<FinalizeResponse> {
        let mut state = self.state.lock();
        state
            .finalize_calls
            .push((server_upload_id.to_string(), request.clone()));
        Ok(FinalizeResponse {
            id: format!("doc-{server_upload_id}"),
            name: request.filename.clone(),
            content_type: "application/octet-stream".to_string(),
            size: 0,
        })
    }
}

fn write_file(dir: &TempDir, name: &str, size: usize) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, vec![0xAB; size]).unwrap();
    path
}

fn persist_path(dir: &TempDir) -> PathBuf {
    dir.path().join("uploads.json")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within timeout");
}

#[tokio::test]
async fn uploads_in_three_chunks_and_finalizes() {
    let dir = TempDir::new().unwrap();
    let mock = MockTransport::new(50);
    let manager = UploadManager::new(mock.clone(), persist_path(&dir));

    let file = write_file(&dir, "video.bin", 120);
    let options = UploadOptions {
        parent_folder_id: Some("folder-1".to_string()),
        ..Default::default()
    };
    let ticket = manager.start(&file, options).await.unwrap();
    let upload_id = ticket.upload_id();

    let finished = ticket.wait().await.unwrap();
    assert_eq!(finished.status, UploadStatus::Completed);
    assert_eq!(finished.progress, 100);
    assert_eq!(finished.uploaded_bytes, 120);
    assert_eq!(finished.document_id.as_deref(), Some("doc-u1"));

    let state = mock.state.lock();
    assert_eq!(state.create_calls, 1);
    let ranges: Vec<_> = state.acked.iter().map(|(_, a, b)| (*a, *b)).collect();
    assert_eq!(ranges, vec![(0, 50), (50, 100), (100, 120)]);
    assert_eq!(state.finalize_calls.len(), 1);
    assert_eq!(state.finalize_calls[0].0, "u1");
    assert_eq!(
        state.finalize_calls[0].1.parent_folder_id.as_deref(),
        Some("folder-1")
    );
    drop(state);

    // Terminal success purges the persisted record but keeps the list entry
    // until the user clears it.
    assert!(PersistStore::new(persist_path(&dir)).load_all().await.is_empty());
    assert!(manager.get_progress(upload_id).is_some());
    manager.clear_completed();
    assert!(manager.get_progress(upload_id).is_none());
}

#[tokio::test]
async fn offset_conflict_reprobes_and_completes() {
    let dir = TempDir::new().unwrap();
    let mock = MockTransport::new(50);
    mock.state.lock().conflict_on_patch = Some(2);
    let manager = UploadManager::new(mock.clone(), persist_path(&dir));

    let file = write_file(&dir, "conflicted.bin", 120);
    let ticket = manager.start(&file, UploadOptions::default()).await.unwrap();
    let finished = ticket.wait().await.unwrap();
    assert_eq!(finished.status, UploadStatus::Completed);

    let state = mock.state.lock();
    // One re-probe after the 409, then transmission continues from the
    // server-reported offset with no byte sent twice.
    assert_eq!(state.head_calls.len(), 1);
    let ranges: Vec<_> = state.acked.iter().map(|(_, a, b)| (*a, *b)).collect();
    assert_eq!(ranges, vec![(0, 50), (100, 120)]);
}

#[tokio::test]
async fn create_413_surfaces_file_too_large_with_zero_chunks() {
    let dir = TempDir::new().unwrap();
    let mock = MockTransport::new(50);
    mock.state.lock().fail_create = Some(413);
    let manager = UploadManager::new(mock.clone(), persist_path(&dir));

    let file = write_file(&dir, "huge.bin", 120);
    let ticket = manager.start(&file, UploadOptions::default()).await.unwrap();
    let upload_id = ticket.upload_id();

    let error = ticket.wait().await.unwrap_err();
    assert_eq!(error.i18n_key(), "upload.errors.fileTooLarge");

    let record = manager.get_progress(upload_id).unwrap();
    assert_eq!(record.status, UploadStatus::Error);
    assert_eq!(record.error_message.as_deref(), Some("upload.errors.fileTooLarge"));
    assert_eq!(mock.state.lock().patch_calls, 0);
}

#[tokio::test]
async fn pause_then_resume_sends_remaining_chunks_once() {
    let dir = TempDir::new().unwrap();
    let mock = MockTransport::with_delay(50, Duration::from_millis(100));
    let manager = UploadManager::new(mock.clone(), persist_path(&dir));

    let file = write_file(&dir, "paused.bin", 150);
    let ticket = manager.start(&file, UploadOptions::default()).await.unwrap();
    let upload_id = ticket.upload_id();

    // Wait for the first chunk ack, then pause while the second is in flight.
    {
        let manager = manager.clone();
        wait_until(move || {
            manager
                .get_progress(upload_id)
                .is_some_and(|p| p.uploaded_bytes == 50)
        })
        .await;
    }
    assert!(manager.pause(upload_id));
    assert!(manager.can_resume_directly(upload_id));
    assert_eq!(
        manager.get_progress(upload_id).unwrap().status,
        UploadStatus::Paused
    );

    // Let the aborted in-flight chunk drain; it must not be acknowledged.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(mock.state.lock().acked.len(), 1);

    assert!(manager.resume(upload_id));
    let finished = ticket.wait().await.unwrap();
    assert_eq!(finished.status, UploadStatus::Completed);

    let state = mock.state.lock();
    // Resume probed the server once and continued from its offset.
    assert_eq!(state.head_calls.len(), 1);
    let starts: Vec<_> = state.acked.iter().map(|(_, a, _)| *a).collect();
    assert_eq!(starts, vec![0, 50, 100]);
}

#[tokio::test]
async fn cancel_mid_transfer_removes_record_despite_delete_failure() {
    let dir = TempDir::new().unwrap();
    let mock = MockTransport::with_delay(50, Duration::from_millis(100));
    mock.state.lock().fail_delete = true;
    let manager = UploadManager::new(mock.clone(), persist_path(&dir));

    let file = write_file(&dir, "doomed.bin", 150);
    let ticket = manager.start(&file, UploadOptions::default()).await.unwrap();
    let upload_id = ticket.upload_id();

    {
        let manager = manager.clone();
        wait_until(move || {
            manager
                .get_progress(upload_id)
                .is_some_and(|p| p.uploaded_bytes >= 50)
        })
        .await;
    }
    manager.cancel(upload_id).await;

    let state = mock.state.lock();
    assert_eq!(state.delete_calls.len(), 1);
    assert!(state.delete_calls[0].starts_with("https://mock/tus/"));
    drop(state);

    // Local removal happens even though the DELETE failed.
    assert!(manager.get_progress(upload_id).is_none());
    assert!(!manager.can_resume_directly(upload_id));
    assert!(PersistStore::new(persist_path(&dir)).load_all().await.is_empty());
    assert!(matches!(ticket.wait().await, Err(UploadError::Cancelled)));
}

fn persisted(filename: &str, size: u64, upload_url: Option<&str>) -> PersistedUpload {
    PersistedUpload {
        filename: filename.to_string(),
        file_size: size,
        parent_folder_id: None,
        metadata: None,
        start_time: chrono::Utc::now(),
        upload_url: upload_url.map(String::from),
    }
}

#[tokio::test]
async fn reload_recovery_probes_offsets_and_purges_stale_records() {
    let dir = TempDir::new().unwrap();
    let mock = MockTransport::new(50);
    {
        let mut state = mock.state.lock();
        state.offsets.insert("https://mock/tus/alive".to_string(), 75);
        state.gone.insert("https://mock/tus/dead".to_string());
    }

    let persist = PersistStore::new(persist_path(&dir));
    let alive_id = uplink::UploadId::new();
    let dead_id = uplink::UploadId::new();
    let urlless_id = uplink::UploadId::new();
    persist
        .save(alive_id, persisted("alive.bin", 100, Some("https://mock/tus/alive")))
        .await;
    persist
        .save(dead_id, persisted("dead.bin", 100, Some("https://mock/tus/dead")))
        .await;
    persist.save(urlless_id, persisted("young.bin", 100, None)).await;

    let manager = UploadManager::new(mock.clone(), persist_path(&dir));
    assert_eq!(manager.recover_persisted().await, 3);

    {
        let manager = manager.clone();
        wait_until(move || {
            manager
                .get_progress(alive_id)
                .is_some_and(|p| p.uploaded_bytes == 75)
                && manager.get_progress(dead_id).is_none()
        })
        .await;
    }

    let alive = manager.get_progress(alive_id).unwrap();
    assert_eq!(alive.status, UploadStatus::Paused);
    assert_eq!(alive.progress, 75);

    // Only records with a known URL are probed, exactly once each.
    assert_eq!(mock.state.lock().head_calls, vec!["https://mock/tus/alive"]);

    // The stale record is purged from persistence too, silently.
    let remaining = PersistStore::new(persist_path(&dir)).load_all().await;
    assert!(remaining.contains_key(&alive_id));
    assert!(!remaining.contains_key(&dead_id));

    // No live transfer exists after a reload.
    assert!(!manager.can_resume_directly(alive_id));

    let urlless = manager.get_progress(urlless_id).unwrap();
    assert_eq!(urlless.status, UploadStatus::Paused);
    assert_eq!(urlless.uploaded_bytes, 0);
}

#[tokio::test]
async fn reselected_file_with_wrong_size_is_rejected_without_network() {
    let dir = TempDir::new().unwrap();
    let mock = MockTransport::new(50);

    let persist = PersistStore::new(persist_path(&dir));
    let upload_id = uplink::UploadId::new();
    persist.save(upload_id, persisted("orig.bin", 100, None)).await;

    let manager = UploadManager::new(mock.clone(), persist_path(&dir));
    manager.recover_persisted().await;

    let wrong_file = write_file(&dir, "orig.bin", 60);
    let error = manager
        .resume_with_file(upload_id, &wrong_file)
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        UploadError::FileMismatch { expected: 100, actual: 60 }
    ));

    let state = mock.state.lock();
    assert_eq!(state.patch_calls, 0);
    assert_eq!(state.create_calls, 0);
    assert!(state.head_calls.is_empty());
    drop(state);

    // The record is untouched and still resumable with the right file.
    assert!(manager.get_progress(upload_id).is_some());
}

#[tokio::test]
async fn reselected_file_resumes_from_server_offset() {
    let dir = TempDir::new().unwrap();
    let mock = MockTransport::new(50);
    mock.state
        .lock()
        .offsets
        .insert("https://mock/tus/prev".to_string(), 50);

    let persist = PersistStore::new(persist_path(&dir));
    let upload_id = uplink::UploadId::new();
    persist
        .save(upload_id, persisted("movie.bin", 150, Some("https://mock/tus/prev")))
        .await;

    let manager = UploadManager::new(mock.clone(), persist_path(&dir));
    manager.recover_persisted().await;
    {
        let manager = manager.clone();
        wait_until(move || {
            manager
                .get_progress(upload_id)
                .is_some_and(|p| p.uploaded_bytes == 50)
        })
        .await;
    }

    let file = write_file(&dir, "movie.bin", 150);
    let ticket = manager.resume_with_file(upload_id, &file).await.unwrap();
    let finished = ticket.wait().await.unwrap();
    assert_eq!(finished.status, UploadStatus::Completed);
    assert_eq!(finished.document_id.as_deref(), Some("doc-prev"));

    let state = mock.state.lock();
    // Never re-sends bytes the server already acknowledged.
    assert_eq!(state.create_calls, 0);
    let ranges: Vec<_> = state.acked.iter().map(|(_, a, b)| (*a, *b)).collect();
    assert_eq!(ranges, vec![(50, 100), (100, 150)]);
}

#[tokio::test]
async fn starting_same_file_adopts_previous_incomplete_upload() {
    let dir = TempDir::new().unwrap();
    let mock = MockTransport::new(50);
    mock.state
        .lock()
        .offsets
        .insert("https://mock/tus/old".to_string(), 50);

    let persist = PersistStore::new(persist_path(&dir));
    let old_id = uplink::UploadId::new();
    persist
        .save(old_id, persisted("big.bin", 150, Some("https://mock/tus/old")))
        .await;

    let manager = UploadManager::new(mock.clone(), persist_path(&dir));
    let file = write_file(&dir, "big.bin", 150);
    let ticket = manager.start(&file, UploadOptions::default()).await.unwrap();
    let new_id = ticket.upload_id();

    let finished = ticket.wait().await.unwrap();
    assert_eq!(finished.status, UploadStatus::Completed);
    assert_eq!(finished.upload_url.as_deref(), Some("https://mock/tus/old"));

    let state = mock.state.lock();
    // Exactly one server-side resource per logical upload: no create, and
    // the transfer continued from the adopted resource's offset.
    assert_eq!(state.create_calls, 0);
    let ranges: Vec<_> = state.acked.iter().map(|(_, a, b)| (*a, *b)).collect();
    assert_eq!(ranges, vec![(50, 100), (100, 150)]);
    drop(state);

    // The stale record is gone from persistence, the new one finished and
    // was purged as well.
    let remaining = PersistStore::new(persist_path(&dir)).load_all().await;
    assert!(!remaining.contains_key(&old_id));
    assert!(!remaining.contains_key(&new_id));
}

#[tokio::test]
async fn adopting_an_expired_resource_creates_a_fresh_upload() {
    let dir = TempDir::new().unwrap();
    let mock = MockTransport::new(50);
    mock.state
        .lock()
        .gone
        .insert("https://mock/tus/expired".to_string());

    let persist = PersistStore::new(persist_path(&dir));
    let old_id = uplink::UploadId::new();
    persist
        .save(old_id, persisted("big.bin", 150, Some("https://mock/tus/expired")))
        .await;

    let manager = UploadManager::new(mock.clone(), persist_path(&dir));
    let file = write_file(&dir, "big.bin", 150);
    let ticket = manager.start(&file, UploadOptions::default()).await.unwrap();

    // The adopted resource 404s on the offset probe; the upload degrades to
    // a fresh create instead of failing.
    let finished = ticket.wait().await.unwrap();
    assert_eq!(finished.status, UploadStatus::Completed);
    assert_eq!(finished.upload_url.as_deref(), Some("https://mock/tus/u1"));
    assert_eq!(finished.document_id.as_deref(), Some("doc-u1"));

    let state = mock.state.lock();
    assert_eq!(state.create_calls, 1);
    let ranges: Vec<_> = state.acked.iter().map(|(_, a, b)| (*a, *b)).collect();
    assert_eq!(ranges, vec![(0, 50), (50, 100), (100, 150)]);
    drop(state);

    assert!(PersistStore::new(persist_path(&dir)).load_all().await.is_empty());
}

#[tokio::test]
async fn regular_upload_tracking_and_cancel() {
    let dir = TempDir::new().unwrap();
    let mock = MockTransport::new(50);
    let manager = UploadManager::new(mock.clone(), persist_path(&dir));

    let upload_id = manager.track_regular("plain.txt", 10, None);
    let record = manager.get_progress(upload_id).unwrap();
    assert!(record.regular_upload);
    assert_eq!(record.status, UploadStatus::Uploading);

    let request_task = tokio::spawn(async {
        tokio::time::sleep(Duration::from_secs(60)).await;
    });
    manager.register_regular_abort(upload_id, request_task.abort_handle());

    manager.cancel(upload_id).await;
    assert!(manager.get_progress(upload_id).is_none());
    assert!(request_task.await.unwrap_err().is_cancelled());
    // Regular uploads have no server resource to release.
    assert!(mock.state.lock().delete_calls.is_empty());
}

#[tokio::test]
async fn regular_upload_completion_and_failure_reporting() {
    let dir = TempDir::new().unwrap();
    let mock = MockTransport::new(50);
    let manager = UploadManager::new(mock, persist_path(&dir));

    let done_id = manager.track_regular("done.txt", 10, None);
    manager.complete_regular(done_id, Some("doc-9".to_string()));
    // Completed regular uploads leave the list immediately.
    assert!(manager.get_progress(done_id).is_none());

    let failed_id = manager.track_regular("failed.txt", 10, None);
    manager.fail_regular(failed_id, "upload.failed");
    let record = manager.get_progress(failed_id).unwrap();
    assert_eq!(record.status, UploadStatus::Error);
    assert_eq!(record.error_message.as_deref(), Some("upload.failed"));

    // Hand-off path: untracked without a terminal status.
    let handed_off = manager.track_regular("dialog.txt", 10, None);
    manager.remove_regular(handed_off);
    assert!(manager.get_progress(handed_off).is_none());
}
