use std::collections::HashMap;
use std::sync::Arc;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use url::Url;
use crate::errors::{Result, TusOp, UploadError};
use crate::types::{FinalizeRequest, FinalizeResponse, ServerConfig, TUS_RESUMABLE};

/// Source of the bearer token attached to every request. The host session
/// owns the token and may rotate it between calls.
pub type TokenSource = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Fixed bearer token, mostly for tools and tests.
pub fn static_token(token: impl Into<String>) -> TokenSource {
    let token = token.into();
    Arc::new(move || Some(token.clone()))
}

/// Key/value pairs sent in the Upload-Metadata header on create.
/// Values are base64-encoded per the protocol.
#[derive(Debug, Clone, Default)]
pub struct UploadMetadata {
    pub filename: Option<String>,
    pub filetype: Option<String>,
    pub custom: HashMap<String, String>,
}

impl UploadMetadata {
    pub fn to_header(&self) -> String {
        let mut parts = Vec::new();
        if let Some(filename) = &self.filename {
            parts.push(format!("filename {}", STANDARD.encode(filename)));
        }
        if let Some(filetype) = &self.filetype {
            parts.push(format!("filetype {}", STANDARD.encode(filetype)));
        }
        let mut custom: Vec<_> = self.custom.iter().collect();
        custom.sort_by_key(|(k, _)| k.clone());
        for (key, value) in custom {
            parts.push(format!("{} {}", key, STANDARD.encode(value)));
        }
        parts.join(",")
    }
}

/// Protocol exchanges with the upload server. The manager and transfer
/// engine only talk to this trait; tests swap in an in-memory server.
#[async_trait]
pub trait TusTransport: Send + Sync {
    /// POST establishing a new upload resource. Returns the absolute
    /// resource URL from the Location header.
    async fn create_upload(&self, total_size: u64, metadata: &UploadMetadata) -> Result<String>;

    /// PATCH one chunk at `offset`. Returns the server's new offset.
    async fn patch_chunk(&self, upload_url: &str, offset: u64, body: Bytes) -> Result<u64>;

    /// HEAD probe for the bytes the server has durably received.
    async fn head_offset(&self, upload_url: &str) -> Result<u64>;

    /// DELETE releasing an abandoned upload resource.
    async fn delete_upload(&self, upload_url: &str) -> Result<()>;

    /// GET the server-side upload configuration.
    async fn fetch_config(&self) -> Result<ServerConfig>;

    /// POST converting a fully-transferred upload into a document record.
    async fn finalize(&self, server_upload_id: &str, request: &FinalizeRequest)
        -> Result<FinalizeResponse>;
}

/// reqwest-backed transport speaking the chunked upload protocol.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: String,
    token: TokenSource,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, token: TokenSource) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            token,
        }
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert("Tus-Resumable", HeaderValue::from_static(TUS_RESUMABLE));
        if let Some(token) = (self.token)() {
            headers.insert(
                "Authorization",
                HeaderValue::from_str(&format!("Bearer {token}"))?,
            );
        }
        Ok(headers)
    }

    fn parse_offset_header(status: u16, headers: &HeaderMap) -> Result<u64> {
        let value = headers
            .get("Upload-Offset")
            .ok_or_else(|| UploadError::server(status, "No 'Upload-Offset' header in response"))?;
        value
            .to_str()
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| UploadError::server(status, "Invalid 'Upload-Offset' header"))
    }

    /// Servers may return a relative Location; resolve it against the
    /// endpoint origin.
    fn resolve_location(&self, location: &str) -> Result<String> {
        if location.starts_with("http") {
            return Ok(location.to_string());
        }
        let url = Url::parse(&self.endpoint)
            .map_err(|_| UploadError::internal(format!("Invalid endpoint: {}", self.endpoint)))?;
        let origin = url.origin().ascii_serialization();
        Ok(format!("{origin}{location}"))
    }
}

#[async_trait]
impl TusTransport for HttpTransport {
    async fn create_upload(&self, total_size: u64, metadata: &UploadMetadata) -> Result<String> {
        let mut headers = self.headers()?;
        headers.insert("Upload-Length", HeaderValue::from_str(&total_size.to_string())?);
        let meta = metadata.to_header();
        if !meta.is_empty() {
            headers.insert("Upload-Metadata", HeaderValue::from_str(&meta)?);
        }

        let response = self
            .client
            .post(&self.endpoint)
            .headers(headers)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::CREATED {
            return Err(UploadError::Protocol { op: TusOp::Create, status: status.as_u16() });
        }

        let location = response
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                UploadError::server(status.as_u16(), "No 'Location' header in response")
            })?;

        self.resolve_location(location)
    }

    async fn patch_chunk(&self, upload_url: &str, offset: u64, body: Bytes) -> Result<u64> {
        let mut headers = self.headers()?;
        headers.insert("Upload-Offset", HeaderValue::from_str(&offset.to_string())?);
        headers.insert(
            "Content-Type",
            HeaderValue::from_static("application/offset+octet-stream"),
        );

        let response = self
            .client
            .patch(upload_url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::NO_CONTENT {
            return Err(UploadError::Protocol { op: TusOp::Chunk, status: status.as_u16() });
        }

        Self::parse_offset_header(status.as_u16(), response.headers())
    }

    async fn head_offset(&self, upload_url: &str) -> Result<u64> {
        let response = self
            .client
            .head(upload_url)
            .headers(self.headers()?)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::NO_CONTENT {
            return Err(UploadError::Protocol { op: TusOp::Offset, status: status.as_u16() });
        }

        Self::parse_offset_header(status.as_u16(), response.headers())
    }

    async fn delete_upload(&self, upload_url: &str) -> Result<()> {
        let response = self
            .client
            .delete(upload_url)
            .headers(self.headers()?)
            .send()
            .await?;

        let status = response.status();
        // A 404 means the resource is already gone, which is the goal here.
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            return Err(UploadError::server(status.as_u16(), "Failed to delete upload"));
        }
        Ok(())
    }

    async fn fetch_config(&self) -> Result<ServerConfig> {
        let response = self
            .client
            .get(format!("{}/config", self.endpoint))
            .headers(self.headers()?)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::server(status.as_u16(), "Failed to fetch upload config"));
        }
        Ok(response.json().await?)
    }

    async fn finalize(
        &self,
        server_upload_id: &str,
        request: &FinalizeRequest,
    ) -> Result<FinalizeResponse> {
        let response = self
            .client
            .post(format!("{}/{}/finalize", self.endpoint, server_upload_id))
            .headers(self.headers()?)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::Finalize { status: status.as_u16() });
        }
        Ok(response.json().await?)
    }
}
