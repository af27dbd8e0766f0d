use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio_util::sync::CancellationToken;
use crate::client::{TusTransport, UploadMetadata};
use crate::errors::{Result, UploadError};
use crate::retry::{retry_transient, RetryPolicy};

/// Called after each acknowledged chunk with `(bytes_uploaded, total_bytes)`.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Called once, when the server assigns the upload resource URL.
pub type UrlFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Observation points reported by a running transfer.
#[derive(Clone, Default)]
pub struct TransferHooks {
    pub on_progress: Option<ProgressFn>,
    pub on_url: Option<UrlFn>,
}

/// Identifying attributes used to detect a previous incomplete upload of
/// the same file.
pub fn fingerprint(filename: &str, size: u64) -> String {
    format!("{filename}-{size}")
}

/// Speed and ETA per the progress contract: speed is bytes uploaded over
/// elapsed seconds since the transfer started, ETA is remaining bytes over
/// that speed. Both undefined until time has elapsed.
pub struct ProgressMeter {
    started: Instant,
}

impl ProgressMeter {
    pub fn new() -> Self {
        Self { started: Instant::now() }
    }

    pub fn sample(&self, uploaded: u64, total: u64) -> (Option<f64>, Option<f64>) {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return (None, None);
        }
        let speed = uploaded as f64 / elapsed;
        let eta = if speed > 0.0 {
            Some(total.saturating_sub(uploaded) as f64 / speed)
        } else {
            None
        };
        (Some(speed), eta)
    }
}

impl Default for ProgressMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// One chunked transfer of a local file to an upload resource. Drives the
/// create/probe/patch exchange; owns no shared state beyond the hooks.
pub struct Transfer {
    transport: Arc<dyn TusTransport>,
    path: PathBuf,
    total_size: u64,
    chunk_size: u64,
    metadata: UploadMetadata,
    retry: RetryPolicy,
    cancel: CancellationToken,
    upload_url: Option<String>,
}

impl Transfer {
    /// A transfer that must first create its server resource.
    pub fn create(
        transport: Arc<dyn TusTransport>,
        path: impl Into<PathBuf>,
        total_size: u64,
        chunk_size: u64,
        metadata: UploadMetadata,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            path: path.into(),
            total_size,
            chunk_size,
            metadata,
            retry,
            cancel,
            upload_url: None,
        }
    }

    /// A transfer bound to an existing server resource. The offset is
    /// probed before any chunk is sent, so bytes the server already holds
    /// are never re-sent.
    pub fn with_url(
        transport: Arc<dyn TusTransport>,
        upload_url: impl Into<String>,
        path: impl Into<PathBuf>,
        total_size: u64,
        chunk_size: u64,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            path: path.into(),
            total_size,
            chunk_size,
            metadata: UploadMetadata::default(),
            retry,
            cancel,
            upload_url: Some(upload_url.into()),
        }
    }

    /// Runs the transfer to completion. Returns the upload resource URL once
    /// the server has acknowledged every byte. `Err(Cancelled)` when aborted;
    /// server-side state is left intact so the transfer can resume later.
    pub async fn run(self, hooks: &TransferHooks) -> Result<String> {
        let (upload_url, mut offset) = match &self.upload_url {
            Some(url) => {
                let offset = self.guarded(self.transport.head_offset(url)).await?;
                (url.clone(), offset)
            }
            None => {
                let url = self
                    .guarded(self.transport.create_upload(self.total_size, &self.metadata))
                    .await?;
                if let Some(on_url) = &hooks.on_url {
                    on_url(&url);
                }
                (url, 0)
            }
        };

        self.emit(hooks, offset);

        if offset >= self.total_size {
            return Ok(upload_url);
        }

        let mut file = File::open(&self.path).await?;
        // Offset reached when the previous 409 was observed; a second
        // conflict without server-side movement means we are stuck.
        let mut last_conflict: Option<u64> = None;

        while offset < self.total_size {
            if self.cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }

            let chunk = read_chunk(&mut file, offset, self.chunk_size, self.total_size).await?;
            let sent = self
                .guarded(retry_transient(&self.retry, || {
                    self.transport.patch_chunk(&upload_url, offset, chunk.clone())
                }))
                .await;

            match sent {
                Ok(new_offset) => {
                    offset = new_offset;
                    last_conflict = None;
                    self.emit(hooks, offset);
                }
                Err(error) if error.is_offset_conflict() => {
                    // The server disagrees on the offset. Re-probe and
                    // continue from what it reports instead of failing.
                    let server_offset =
                        self.guarded(self.transport.head_offset(&upload_url)).await?;
                    tracing::debug!(offset, server_offset, "offset conflict, re-probing");
                    if last_conflict == Some(server_offset) {
                        return Err(UploadError::OffsetStalled { offset: server_offset });
                    }
                    last_conflict = Some(server_offset);
                    offset = server_offset;
                    self.emit(hooks, offset);
                }
                Err(error) => return Err(error),
            }
        }

        Ok(upload_url)
    }

    /// Races a protocol exchange against the cancellation token. An abort
    /// while a request is in flight drops the request future; a response
    /// that already landed is simply never observed.
    async fn guarded<T>(&self, future: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            result = future => result,
            _ = self.cancel.cancelled() => Err(UploadError::Cancelled),
        }
    }

    fn emit(&self, hooks: &TransferHooks, uploaded: u64) {
        if let Some(on_progress) = &hooks.on_progress {
            on_progress(uploaded, self.total_size);
        }
    }
}

async fn read_chunk(
    file: &mut File,
    offset: u64,
    chunk_size: u64,
    total_size: u64,
) -> Result<bytes::Bytes> {
    let len = chunk_size.min(total_size - offset) as usize;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buffer = vec![0u8; len];
    file.read_exact(&mut buffer).await?;
    Ok(bytes::Bytes::from(buffer))
}

/// Scans persisted records for a previous incomplete upload of the same
/// file. Returns the matching id and resource URL when one exists.
pub fn find_previous_upload<'a>(
    persisted: impl IntoIterator<Item = (&'a crate::types::UploadId, &'a crate::types::PersistedUpload)>,
    path: &Path,
    size: u64,
) -> Option<(crate::types::UploadId, String)> {
    let filename = path.file_name()?.to_str()?;
    let wanted = fingerprint(filename, size);
    persisted.into_iter().find_map(|(id, record)| {
        let url = record.upload_url.as_ref()?;
        (fingerprint(&record.filename, record.file_size) == wanted)
            .then(|| (*id, url.clone()))
    })
}
