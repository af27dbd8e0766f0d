use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use crate::types::{PersistedUpload, UploadId};

/// Durable snapshot of in-flight upload metadata, one JSON blob on disk.
/// Writes are best-effort: a failed write is logged and swallowed so
/// persistence problems never break a running upload. A corrupt or missing
/// blob reads as empty.
///
/// The blob is read-modify-written whole. Upload tasks hit the store
/// concurrently, so every access holds the mutex for the full
/// read-modify-write cycle.
pub struct PersistStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl PersistStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub async fn load_all(&self) -> HashMap<UploadId, PersistedUpload> {
        let _guard = self.guard.lock().await;
        self.read().await
    }

    async fn read(&self) -> HashMap<UploadId, PersistedUpload> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(_) => return HashMap::new(),
        };
        match serde_json::from_str(&data) {
            Ok(map) => map,
            Err(error) => {
                tracing::warn!(%error, path = %self.path.display(), "corrupt upload snapshot, starting empty");
                HashMap::new()
            }
        }
    }

    pub async fn save(&self, upload_id: UploadId, record: PersistedUpload) {
        let _guard = self.guard.lock().await;
        let mut map = self.read().await;
        map.insert(upload_id, record);
        self.write(&map).await;
    }

    /// Records the server resource URL once it becomes known. No-op when the
    /// upload is not persisted (e.g. already removed).
    pub async fn set_upload_url(&self, upload_id: UploadId, upload_url: &str) {
        let _guard = self.guard.lock().await;
        let mut map = self.read().await;
        if let Some(record) = map.get_mut(&upload_id) {
            record.upload_url = Some(upload_url.to_string());
            self.write(&map).await;
        }
    }

    pub async fn remove(&self, upload_id: UploadId) {
        let _guard = self.guard.lock().await;
        let mut map = self.read().await;
        if map.remove(&upload_id).is_some() {
            self.write(&map).await;
        }
    }

    async fn write(&self, map: &HashMap<UploadId, PersistedUpload>) {
        let data = match serde_json::to_string_pretty(map) {
            Ok(data) => data,
            Err(error) => {
                tracing::warn!(%error, "failed to serialize upload snapshot");
                return;
            }
        };
        if let Err(error) = tokio::fs::write(&self.path, data).await {
            tracing::warn!(%error, path = %self.path.display(), "failed to persist upload snapshot");
        }
    }
}
