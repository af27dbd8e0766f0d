use std::sync::Arc;
use crate::client::TusTransport;
use crate::errors::{Result, UploadError};
use crate::types::{FinalizeRequest, FinalizeResponse, UploadOptions, UploadProgress};

/// Converts a fully-transferred upload into a persisted document record.
pub struct Finalizer {
    transport: Arc<dyn TusTransport>,
}

impl Finalizer {
    pub fn new(transport: Arc<dyn TusTransport>) -> Self {
        Self { transport }
    }

    /// Issues the finalize call for a completed transfer. The server-side
    /// upload id is the last path segment of the resource URL.
    pub async fn finalize(
        &self,
        progress: &UploadProgress,
        options: &UploadOptions,
    ) -> Result<FinalizeResponse> {
        let upload_url = progress
            .upload_url
            .as_deref()
            .ok_or(UploadError::MissingUploadUrl)?;
        let server_upload_id = server_upload_id(upload_url)?;

        let request = FinalizeRequest {
            filename: progress.filename.clone(),
            parent_folder_id: options.parent_folder_id.clone(),
            metadata: options.metadata.clone(),
            allow_duplicate_file_names: options.allow_duplicate_file_names,
        };

        self.transport.finalize(server_upload_id, &request).await
    }
}

/// Last non-empty path segment of the upload resource URL.
pub fn server_upload_id(upload_url: &str) -> Result<&str> {
    upload_url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .ok_or_else(|| UploadError::internal(format!("No upload id in URL: {upload_url}")))
}
