use std::collections::HashMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tus protocol version sent on every request.
pub const TUS_RESUMABLE: &str = "1.0.0";

/// Default chunk size when the server config is unavailable (50 MB).
pub const DEFAULT_CHUNK_SIZE: u64 = 50 * 1024 * 1024;

/// Default maximum upload size when the server config is unavailable (10 GB).
pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Default upload expiration when the server config is unavailable (24 h, ms).
pub const DEFAULT_UPLOAD_EXPIRATION_MS: u64 = 86_400_000;

/// Files larger than this should go through the chunked path instead of a
/// regular multipart upload.
pub const CHUNKED_THRESHOLD_BYTES: u64 = 50 * 1024 * 1024;

/// Client-generated identifier for one upload attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct UploadId(Uuid);

impl UploadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum UploadStatus {
    /// Record created, transfer not started yet
    Pending,
    /// Chunks in flight
    Uploading,
    /// Paused by the user, or restored from persistence with no live transfer
    Paused,
    /// Transferred and finalized
    Completed,
    /// Terminal failure, `error_message` holds the translation key
    Error,
    /// Cancelled by the user
    Cancelled,
}

/// Progress of a single upload. One record per in-flight or recently
/// finished upload, published through the [`ProgressStore`](crate::store::ProgressStore).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadProgress {
    pub upload_id: UploadId,
    pub filename: String,
    pub total_size: u64,
    pub uploaded_bytes: u64,
    /// 0-100, always `percent(uploaded_bytes, total_size)`
    pub progress: u8,
    pub status: UploadStatus,
    /// Bytes per second since the transfer started
    pub speed: Option<f64>,
    /// Estimated seconds remaining
    pub eta: Option<f64>,
    /// Translation key describing a terminal failure
    pub error_message: Option<String>,
    /// Server-assigned resource URL, write-once per upload
    pub upload_url: Option<String>,
    pub parent_folder_id: Option<String>,
    pub metadata: Option<HashMap<String, String>>,
    pub start_time: DateTime<Utc>,
    /// Set after a successful finalize
    pub document_id: Option<String>,
    /// True for the non-chunked multipart fallback, which has no
    /// pause/resume and reports indeterminate progress
    pub regular_upload: bool,
}

impl UploadProgress {
    pub fn new(upload_id: UploadId, filename: impl Into<String>, total_size: u64) -> Self {
        Self {
            upload_id,
            filename: filename.into(),
            total_size,
            uploaded_bytes: 0,
            progress: 0,
            status: UploadStatus::Pending,
            speed: None,
            eta: None,
            error_message: None,
            upload_url: None,
            parent_folder_id: None,
            metadata: None,
            start_time: Utc::now(),
            document_id: None,
            regular_upload: false,
        }
    }

    /// Updates `uploaded_bytes` and the derived percentage together.
    pub fn set_uploaded(&mut self, bytes: u64) {
        self.uploaded_bytes = bytes;
        self.progress = percent(bytes, self.total_size);
    }
}

/// `round(uploaded / total * 100)`, clamped to [0, 100]. A zero-byte file
/// has nothing left to transfer, so it counts as fully transferred.
pub fn percent(uploaded: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (uploaded as f64 / total as f64 * 100.0).round();
    pct.clamp(0.0, 100.0) as u8
}

/// Options supplied by the host when starting an upload.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub parent_folder_id: Option<String>,
    pub metadata: Option<HashMap<String, String>>,
    pub allow_duplicate_file_names: bool,
}

/// Durable subset of [`UploadProgress`], keyed by [`UploadId`] in the
/// persistence blob so uploads can be recovered after a reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedUpload {
    pub filename: String,
    pub file_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_folder_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_url: Option<String>,
}

/// Upload configuration served by `GET {endpoint}/config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub max_upload_size: u64,
    pub chunk_size: u64,
    pub upload_expiration_period: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: String::new(),
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            upload_expiration_period: DEFAULT_UPLOAD_EXPIRATION_MS,
        }
    }
}

/// Body of `POST {endpoint}/{serverUploadId}/finalize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_folder_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
    pub allow_duplicate_file_names: bool,
}

/// Document record returned by the finalize endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeResponse {
    pub id: String,
    pub name: String,
    pub content_type: String,
    pub size: u64,
}

/// Aggregate across all uploads currently uploading or paused.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TotalProgress {
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    pub progress: u8,
}

/// Human-readable byte count, e.g. `1.50 MB`.
pub fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0 B".to_string();
    }
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let i = ((bytes as f64).ln() / 1024f64.ln()).floor() as usize;
    let i = i.min(UNITS.len() - 1);
    let value = bytes as f64 / 1024f64.powi(i as i32);
    format!("{} {}", format!("{:.2}", value).trim_end_matches('0').trim_end_matches('.'), UNITS[i])
}

/// Human-readable duration, `m:ss` below an hour, `Xh Ym` above.
pub fn format_duration(seconds: Option<f64>) -> String {
    let Some(seconds) = seconds else {
        return "--:--".to_string();
    };
    if seconds <= 0.0 {
        return "--:--".to_string();
    }
    let mins = (seconds / 60.0).floor() as u64;
    let secs = (seconds % 60.0).floor() as u64;
    if mins >= 60 {
        format!("{}h {}m", mins / 60, mins % 60)
    } else {
        format!("{}:{:02}", mins, secs)
    }
}
