use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use crate::client::{TusTransport, UploadMetadata};
use crate::errors::{Result, UploadError};
use crate::finalize::Finalizer;
use crate::persist::PersistStore;
use crate::retry::RetryPolicy;
use crate::store::ProgressStore;
use crate::transfer::{find_previous_upload, ProgressMeter, Transfer, TransferHooks};
use crate::types::{
    PersistedUpload, ServerConfig, TotalProgress, UploadId, UploadOptions, UploadProgress,
    UploadStatus,
};

/// In-memory handle for one upload attempt. Exists from start (or resume
/// after reload) until a terminal transition; its presence is what makes an
/// upload directly resumable within the session.
struct Session {
    path: PathBuf,
    options: UploadOptions,
    chunk_size: u64,
    cancel: CancellationToken,
    running: bool,
    done_tx: Option<oneshot::Sender<Result<UploadProgress>>>,
}

/// Handle returned by [`UploadManager::start`]. Resolves once, to the
/// finalized progress or the terminal error.
#[derive(Debug)]
pub struct UploadTicket {
    upload_id: UploadId,
    done: oneshot::Receiver<Result<UploadProgress>>,
}

impl UploadTicket {
    pub fn upload_id(&self) -> UploadId {
        self.upload_id
    }

    /// Waits for the upload to reach a terminal state. Returns
    /// `Err(Cancelled)` when the upload was cancelled or superseded before
    /// finishing.
    pub async fn wait(self) -> Result<UploadProgress> {
        self.done.await.map_err(|_| UploadError::Cancelled)?
    }
}

/// Drives chunked, resumable uploads: lifecycle transitions, persistence
/// for reload recovery, finalization into document records, and tracking
/// for the regular (non-chunked) fallback path.
pub struct UploadManager {
    transport: Arc<dyn TusTransport>,
    store: ProgressStore,
    persist: Arc<PersistStore>,
    finalizer: Finalizer,
    retry: RetryPolicy,
    sessions: Mutex<HashMap<UploadId, Session>>,
    regular_aborts: Mutex<HashMap<UploadId, AbortHandle>>,
    config: Mutex<Option<ServerConfig>>,
}

impl UploadManager {
    pub fn new(transport: Arc<dyn TusTransport>, persist_path: impl Into<PathBuf>) -> Arc<Self> {
        Self::with_policy(transport, persist_path, RetryPolicy::default())
    }

    pub fn with_policy(
        transport: Arc<dyn TusTransport>,
        persist_path: impl Into<PathBuf>,
        retry: RetryPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            finalizer: Finalizer::new(transport.clone()),
            transport,
            store: ProgressStore::new(),
            persist: Arc::new(PersistStore::new(persist_path)),
            retry,
            sessions: Mutex::new(HashMap::new()),
            regular_aborts: Mutex::new(HashMap::new()),
            config: Mutex::new(None),
        })
    }

    // Progress queries, pass-throughs to the store.

    /// Live list subscription consumed by the host UI.
    pub fn subscribe(&self) -> watch::Receiver<Vec<UploadProgress>> {
        self.store.subscribe()
    }

    pub fn get_progress(&self, upload_id: UploadId) -> Option<UploadProgress> {
        self.store.get(upload_id)
    }

    pub fn total_progress(&self) -> TotalProgress {
        self.store.total_progress()
    }

    pub fn has_active_uploads(&self) -> bool {
        self.store.has_active()
    }

    pub fn clear_completed(&self) {
        self.store.clear_completed()
    }

    /// Server upload configuration, fetched once and cached. Falls back to
    /// the built-in defaults when the config endpoint is unreachable.
    pub async fn server_config(&self) -> ServerConfig {
        if let Some(config) = self.config.lock().clone() {
            return config;
        }
        match self.transport.fetch_config().await {
            Ok(config) => {
                *self.config.lock() = Some(config.clone());
                config
            }
            Err(error) => {
                tracing::warn!(%error, "config endpoint unavailable, using defaults");
                ServerConfig::default()
            }
        }
    }

    // Lifecycle operations.

    /// Starts a chunked upload of a local file. The record is persisted
    /// immediately so the upload survives a reload; if a previous
    /// incomplete upload of the same file is found, its server resource is
    /// adopted instead of creating a duplicate.
    pub async fn start(
        self: &Arc<Self>,
        path: impl Into<PathBuf>,
        options: UploadOptions,
    ) -> Result<UploadTicket> {
        let path = path.into();
        let file_meta = tokio::fs::metadata(&path).await?;
        if !file_meta.is_file() {
            return Err(UploadError::internal(format!("Not a file: {}", path.display())));
        }
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| UploadError::internal(format!("No filename: {}", path.display())))?;
        let total_size = file_meta.len();

        let upload_id = UploadId::new();
        let mut progress = UploadProgress::new(upload_id, filename.clone(), total_size);
        progress.parent_folder_id = options.parent_folder_id.clone();
        progress.metadata = options.metadata.clone();
        self.store.upsert(progress.clone());

        self.persist
            .save(
                upload_id,
                PersistedUpload {
                    filename,
                    file_size: total_size,
                    parent_folder_id: options.parent_folder_id.clone(),
                    metadata: options.metadata.clone(),
                    start_time: progress.start_time,
                    upload_url: None,
                },
            )
            .await;

        // A previous incomplete upload of the same file keeps its server
        // resource; adopt it so exactly one resource exists per logical
        // upload and the transfer continues from the server offset.
        let persisted = self.persist.load_all().await;
        let previous = {
            let sessions = self.sessions.lock();
            find_previous_upload(
                persisted
                    .iter()
                    .filter(|(id, _)| **id != upload_id && !sessions.contains_key(id)),
                &path,
                total_size,
            )
        };
        if let Some((stale_id, upload_url)) = previous {
            tracing::debug!(%stale_id, %upload_id, "adopting previous incomplete upload");
            self.store.remove(stale_id);
            self.persist.remove(stale_id).await;
            self.store.update(upload_id, |record| {
                record.upload_url = Some(upload_url.clone());
            });
            self.persist.set_upload_url(upload_id, &upload_url).await;
        }

        let chunk_size = self.server_config().await.chunk_size;
        let (done_tx, done_rx) = oneshot::channel();
        self.sessions.lock().insert(
            upload_id,
            Session {
                path,
                options,
                chunk_size,
                cancel: CancellationToken::new(),
                running: true,
                done_tx: Some(done_tx),
            },
        );

        tokio::spawn(self.clone().run_transfer(upload_id));
        Ok(UploadTicket { upload_id, done: done_rx })
    }

    /// Aborts the active transfer and marks the upload paused. Returns
    /// false when no in-memory session exists for the id (e.g. after a
    /// reload); that upload needs the re-select path instead.
    pub fn pause(&self, upload_id: UploadId) -> bool {
        {
            let sessions = self.sessions.lock();
            match sessions.get(&upload_id) {
                Some(session) => session.cancel.cancel(),
                None => return false,
            }
        }
        self.store.update(upload_id, |record| {
            record.status = UploadStatus::Paused;
            record.speed = None;
            record.eta = None;
        });
        true
    }

    /// Restarts a paused in-session upload. Returns false when no
    /// in-memory session exists.
    pub fn resume(self: &Arc<Self>, upload_id: UploadId) -> bool {
        {
            let mut sessions = self.sessions.lock();
            let Some(session) = sessions.get_mut(&upload_id) else {
                return false;
            };
            if session.running {
                return true;
            }
            session.cancel = CancellationToken::new();
            session.running = true;
        }
        self.store.update(upload_id, |record| {
            record.status = UploadStatus::Uploading;
            record.start_time = Utc::now();
            record.speed = None;
            record.eta = None;
        });
        tokio::spawn(self.clone().run_transfer(upload_id));
        true
    }

    /// True iff an in-memory session still exists for the id. False after
    /// a reload even when persisted metadata exists.
    pub fn can_resume_directly(&self, upload_id: UploadId) -> bool {
        self.sessions.lock().contains_key(&upload_id)
    }

    /// Resumes a persisted upload after a reload, with the file re-selected
    /// by the user. The file's byte size must match the persisted size
    /// exactly; a mismatch is rejected before any network call.
    pub async fn resume_with_file(
        self: &Arc<Self>,
        upload_id: UploadId,
        path: impl Into<PathBuf>,
    ) -> Result<UploadTicket> {
        let path = path.into();
        let record = self
            .store
            .get(upload_id)
            .ok_or_else(|| UploadError::internal(format!("Unknown upload: {upload_id}")))?;

        let file_meta = tokio::fs::metadata(&path).await?;
        if file_meta.len() != record.total_size {
            return Err(UploadError::FileMismatch {
                expected: record.total_size,
                actual: file_meta.len(),
            });
        }

        if record.upload_url.is_none() {
            // Nothing on the server to resume against.
            self.store.remove(upload_id);
            self.persist.remove(upload_id).await;
            return Err(UploadError::MissingUploadUrl);
        }

        let options = UploadOptions {
            parent_folder_id: record.parent_folder_id.clone(),
            metadata: record.metadata.clone(),
            allow_duplicate_file_names: false,
        };
        let chunk_size = self.server_config().await.chunk_size;
        let (done_tx, done_rx) = oneshot::channel();
        let stale = self.sessions.lock().insert(
            upload_id,
            Session {
                path,
                options,
                chunk_size,
                cancel: CancellationToken::new(),
                running: true,
                done_tx: Some(done_tx),
            },
        );
        if let Some(stale) = stale {
            stale.cancel.cancel();
        }

        self.store.update(upload_id, |record| {
            record.status = UploadStatus::Uploading;
            record.start_time = Utc::now();
        });
        tokio::spawn(self.clone().run_transfer(upload_id));
        Ok(UploadTicket { upload_id, done: done_rx })
    }

    /// Cancels an upload and releases its server-side storage. Best-effort:
    /// the record is removed from tracking and persistence even when the
    /// DELETE fails, and the call itself never errors.
    pub async fn cancel(&self, upload_id: UploadId) {
        if let Some(handle) = self.regular_aborts.lock().remove(&upload_id) {
            handle.abort();
            self.store.remove(upload_id);
            self.persist.remove(upload_id).await;
            return;
        }

        if let Some(session) = self.sessions.lock().remove(&upload_id) {
            session.cancel.cancel();
        }

        // Prefer the live record's URL, fall back to the persisted one.
        let upload_url = match self.store.get(upload_id).and_then(|r| r.upload_url) {
            Some(url) => Some(url),
            None => self
                .persist
                .load_all()
                .await
                .remove(&upload_id)
                .and_then(|r| r.upload_url),
        };

        if let Some(url) = upload_url {
            if let Err(error) = self.transport.delete_upload(&url).await {
                tracing::warn!(%error, %upload_id, "failed to release upload on server");
            }
        }

        self.store.remove(upload_id);
        self.persist.remove(upload_id).await;
    }

    /// Seeds the store from the persisted snapshot after a reload. Every
    /// record becomes `Paused` (no live transfer exists yet); records with
    /// a known resource URL get one asynchronous offset probe to learn the
    /// real uploaded byte count, and are purged silently when the server
    /// no longer knows them.
    pub async fn recover_persisted(self: &Arc<Self>) -> usize {
        let persisted = self.persist.load_all().await;
        let count = persisted.len();

        for (upload_id, record) in persisted {
            let mut progress = UploadProgress::new(upload_id, record.filename.clone(), record.file_size);
            progress.status = UploadStatus::Paused;
            progress.parent_folder_id = record.parent_folder_id.clone();
            progress.metadata = record.metadata.clone();
            progress.start_time = record.start_time;
            progress.upload_url = record.upload_url.clone();
            self.store.upsert(progress);

            if let Some(upload_url) = record.upload_url {
                let this = self.clone();
                tokio::spawn(async move {
                    this.reconcile_offset(upload_id, &upload_url).await;
                });
            }
        }
        count
    }

    async fn reconcile_offset(self: Arc<Self>, upload_id: UploadId, upload_url: &str) {
        match self.transport.head_offset(upload_url).await {
            Ok(offset) => {
                self.store.update(upload_id, |record| record.set_uploaded(offset));
            }
            Err(error) if error.is_gone() => {
                // Stale record, nothing the user could act on.
                tracing::debug!(%upload_id, "upload gone from server, purging record");
                self.store.remove(upload_id);
                self.persist.remove(upload_id).await;
            }
            Err(error) => {
                tracing::warn!(%error, %upload_id, "offset reconciliation failed");
            }
        }
    }

    // Transfer task.

    async fn run_transfer(self: Arc<Self>, upload_id: UploadId) {
        let Some((path, options, chunk_size, cancel)) = ({
            let sessions = self.sessions.lock();
            sessions.get(&upload_id).map(|s| {
                (s.path.clone(), s.options.clone(), s.chunk_size, s.cancel.clone())
            })
        }) else {
            return;
        };
        let Some(record) = self.store.get(upload_id) else {
            self.sessions.lock().remove(&upload_id);
            return;
        };

        let meter = ProgressMeter::new();
        let hooks = TransferHooks {
            on_progress: Some({
                let this = self.clone();
                Arc::new(move |uploaded, total| {
                    this.store.update(upload_id, |record| {
                        // A chunk ack landing after pause/cancel is a no-op.
                        if !matches!(
                            record.status,
                            UploadStatus::Pending | UploadStatus::Uploading
                        ) {
                            return;
                        }
                        record.status = UploadStatus::Uploading;
                        let bytes = uploaded.max(record.uploaded_bytes);
                        record.set_uploaded(bytes);
                        let (speed, eta) = meter.sample(uploaded, total);
                        record.speed = speed;
                        record.eta = eta;
                    });
                })
            }),
            on_url: Some({
                let this = self.clone();
                Arc::new(move |url: &str| {
                    this.store.update(upload_id, |record| {
                        if record.upload_url.is_none() {
                            record.upload_url = Some(url.to_string());
                        }
                    });
                    let persist = this.persist.clone();
                    let url = url.to_string();
                    tokio::spawn(async move {
                        persist.set_upload_url(upload_id, &url).await;
                    });
                })
            }),
        };

        let result = match record.upload_url.clone() {
            Some(url) => {
                let transfer = Transfer::with_url(
                    self.transport.clone(),
                    url,
                    &path,
                    record.total_size,
                    chunk_size,
                    self.retry.clone(),
                    cancel.clone(),
                );
                match transfer.run(&hooks).await {
                    Err(error) if error.is_gone() => {
                        // The server expired the resource; start over with a
                        // fresh one instead of surfacing a stale 404.
                        tracing::debug!(%upload_id, "upload resource gone from server, creating a new one");
                        self.store.update(upload_id, |record| {
                            record.upload_url = None;
                            record.set_uploaded(0);
                        });
                        self.creating_transfer(&record, &options, upload_id, chunk_size, cancel.clone(), &path)
                            .run(&hooks)
                            .await
                    }
                    other => other,
                }
            }
            None => {
                self.creating_transfer(&record, &options, upload_id, chunk_size, cancel.clone(), &path)
                    .run(&hooks)
                    .await
            }
        };

        match result {
            Ok(upload_url) => {
                self.store.update(upload_id, |record| {
                    if record.upload_url.is_none() {
                        record.upload_url = Some(upload_url.clone());
                    }
                    record.set_uploaded(record.total_size);
                    record.status = UploadStatus::Completed;
                });
                self.finish(upload_id, &options).await;
            }
            Err(UploadError::Cancelled) => {
                // Paused (session kept) or cancelled (session already gone).
                if let Some(session) = self.sessions.lock().get_mut(&upload_id) {
                    session.running = false;
                }
            }
            Err(error) => {
                tracing::debug!(%error, %upload_id, "transfer failed");
                self.fail(upload_id, error);
            }
        }
    }

    /// Transfer that must establish a fresh server resource.
    fn creating_transfer(
        &self,
        record: &UploadProgress,
        options: &UploadOptions,
        upload_id: UploadId,
        chunk_size: u64,
        cancel: CancellationToken,
        path: &Path,
    ) -> Transfer {
        let mut metadata = UploadMetadata {
            filename: Some(record.filename.clone()),
            filetype: Some("application/octet-stream".to_string()),
            custom: HashMap::new(),
        };
        metadata
            .custom
            .insert("uploadId".to_string(), upload_id.to_string());
        metadata.custom.insert(
            "parentFolderId".to_string(),
            options.parent_folder_id.clone().unwrap_or_default(),
        );
        Transfer::create(
            self.transport.clone(),
            path,
            record.total_size,
            chunk_size,
            metadata,
            self.retry.clone(),
            cancel,
        )
    }

    /// Transfer fully acknowledged; finalize into a document record.
    async fn finish(self: &Arc<Self>, upload_id: UploadId, options: &UploadOptions) {
        let Some(record) = self.store.get(upload_id) else {
            self.sessions.lock().remove(&upload_id);
            return;
        };

        match self.finalizer.finalize(&record, options).await {
            Ok(response) => {
                self.store.update(upload_id, |record| {
                    record.document_id = Some(response.id.clone());
                    record.status = UploadStatus::Completed;
                });
                self.persist.remove(upload_id).await;
                let done_tx = self
                    .sessions
                    .lock()
                    .remove(&upload_id)
                    .and_then(|mut s| s.done_tx.take());
                if let Some(tx) = done_tx {
                    let result = self
                        .store
                        .get(upload_id)
                        .ok_or_else(|| UploadError::internal("Upload record removed"));
                    let _ = tx.send(result);
                }
            }
            Err(error) => self.fail(upload_id, error),
        }
    }

    fn fail(&self, upload_id: UploadId, error: UploadError) {
        self.store.update(upload_id, |record| {
            record.status = UploadStatus::Error;
            record.error_message = Some(error.i18n_key().to_string());
            record.speed = None;
            record.eta = None;
        });
        let done_tx = self
            .sessions
            .lock()
            .remove(&upload_id)
            .and_then(|mut s| s.done_tx.take());
        if let Some(tx) = done_tx {
            let _ = tx.send(Err(error));
        }
    }

    // Regular (non-chunked) upload tracking.

    /// Registers a tracking entry for a regular multipart upload so the
    /// same progress UI and cancel semantics apply. No pause/resume;
    /// progress stays indeterminate until completion is reported.
    pub fn track_regular(
        &self,
        filename: impl Into<String>,
        total_size: u64,
        parent_folder_id: Option<String>,
    ) -> UploadId {
        let upload_id = UploadId::new();
        let mut progress = UploadProgress::new(upload_id, filename, total_size);
        progress.status = UploadStatus::Uploading;
        progress.parent_folder_id = parent_folder_id;
        progress.regular_upload = true;
        self.store.upsert(progress);
        upload_id
    }

    /// Stores the abort handle of the request task driving a regular
    /// upload, so [`cancel`](Self::cancel) can stop it.
    pub fn register_regular_abort(&self, upload_id: UploadId, handle: AbortHandle) {
        self.regular_aborts.lock().insert(upload_id, handle);
    }

    /// Reported by the caller when the regular upload path finished.
    pub fn complete_regular(&self, upload_id: UploadId, document_id: Option<String>) {
        self.regular_aborts.lock().remove(&upload_id);
        self.store.update(upload_id, |record| {
            record.status = UploadStatus::Completed;
            record.set_uploaded(record.total_size);
            record.document_id = document_id.clone();
        });
        self.store.remove(upload_id);
    }

    /// Reported by the caller when the regular upload path failed.
    pub fn fail_regular(&self, upload_id: UploadId, error_message: impl Into<String>) {
        self.regular_aborts.lock().remove(&upload_id);
        self.store.update(upload_id, |record| {
            record.status = UploadStatus::Error;
            record.error_message = Some(error_message.into());
        });
    }

    /// Untracks a regular upload without marking it completed or failed
    /// (e.g. when handing off to a duplicate-filename dialog).
    pub fn remove_regular(&self, upload_id: UploadId) {
        self.regular_aborts.lock().remove(&upload_id);
        self.store.remove(upload_id);
    }
}
