//! Chunked, resumable upload manager for the document vault frontend.
//!
//! Drives large-file uploads against a tus-style endpoint: fixed-size
//! chunks, pause/resume/cancel, recovery after a reload from a persisted
//! snapshot, and finalization of each transfer into a document record.

pub mod client;
pub mod errors;
pub mod finalize;
pub mod manager;
pub mod persist;
pub mod retry;
pub mod store;
pub mod transfer;
pub mod types;

pub use client::{static_token, HttpTransport, TokenSource, TusTransport, UploadMetadata};
pub use errors::{Result, TusOp, UploadError};
pub use manager::{UploadManager, UploadTicket};
pub use persist::PersistStore;
pub use retry::RetryPolicy;
pub use store::ProgressStore;
pub use types::{
    format_bytes, format_duration, FinalizeRequest, FinalizeResponse, PersistedUpload,
    ServerConfig, TotalProgress, UploadId, UploadOptions, UploadProgress, UploadStatus,
    CHUNKED_THRESHOLD_BYTES, DEFAULT_CHUNK_SIZE,
};
