use thiserror::Error;

/// Which protocol exchange a status code was observed on. The same status
/// means different things on create, chunk send and offset probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TusOp {
    /// POST creating the upload resource
    Create,
    /// PATCH sending a chunk
    Chunk,
    /// HEAD probing the current offset
    Offset,
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {op:?} returned status {status}")]
    Protocol { op: TusOp, status: u16 },

    #[error("Finalize failed with status {status}")]
    Finalize { status: u16 },

    #[error("Re-selected file size {actual} does not match persisted size {expected}")]
    FileMismatch { expected: u64, actual: u64 },

    #[error("Server error: status {status}, message: {message}")]
    Server { status: u16, message: String },

    #[error("Upload URL not available")]
    MissingUploadUrl,

    #[error("Server offset stalled at {offset} after a conflict")]
    OffsetStalled { offset: u64 },

    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),

    #[error("Invalid header name: {0}")]
    InvalidHeaderName(#[from] reqwest::header::InvalidHeaderName),

    #[error("Upload was cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl UploadError {
    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Transient failures are retried through the backoff ladder before
    /// being surfaced. Protocol errors are never retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Http(_) | Self::Io(_))
    }

    /// The server no longer knows the upload resource. Persisted records
    /// hitting this are purged rather than surfaced.
    pub fn is_gone(&self) -> bool {
        matches!(
            self,
            Self::Protocol {
                op: TusOp::Chunk | TusOp::Offset,
                status: 404,
            }
        )
    }

    /// A 409 on a chunk send: the client and server disagree on the offset
    /// and the caller must re-probe before sending more bytes.
    pub fn is_offset_conflict(&self) -> bool {
        matches!(
            self,
            Self::Protocol {
                op: TusOp::Chunk,
                status: 409,
            }
        )
    }

    /// Translation key shown inline next to the failed upload.
    pub fn i18n_key(&self) -> &'static str {
        match self {
            Self::Protocol { op: TusOp::Create, status } => match status {
                400 => "upload.errors.missingHeaders",
                404 => "upload.errors.parentFolderNotFound",
                409 => "upload.errors.duplicateFilename",
                413 => "upload.errors.fileTooLarge",
                507 => "upload.errors.quotaExceeded",
                _ => "upload.failed",
            },
            Self::Protocol { op: TusOp::Chunk, status } => match status {
                404 => "upload.errors.uploadNotFound",
                409 => "upload.errors.offsetMismatch",
                _ => "upload.failed",
            },
            Self::Protocol { op: TusOp::Offset, status } => match status {
                404 => "upload.errors.uploadNotFound",
                _ => "upload.failed",
            },
            Self::Finalize { status } => match status {
                400 => "upload.errors.uploadNotComplete",
                404 => "upload.errors.uploadNotFound",
                409 => "upload.errors.duplicateFilename",
                413 => "upload.errors.fileSizeExceedsQuota",
                507 => "upload.errors.quotaExceeded",
                _ => "upload.errors.finalizeFailed",
            },
            Self::FileMismatch { .. } => "upload.errors.fileMismatch",
            _ => "upload.failed",
        }
    }
}

/// Error alias
pub type Result<T, E = UploadError> = std::result::Result<T, E>;
