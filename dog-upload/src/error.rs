use thiserror::Error;

/// Result type for upload operations
pub type UploadResult<T> = Result<T, UploadError>;

/// Errors that can occur while accepting or assembling chunks
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Invalid chunk: {0}")]
    Validation(#[from] ValidationError),

    #[error("Protocol violation for upload {upload_id}: {reason}")]
    Protocol { upload_id: String, reason: String },

    #[error("Storage backend error: {source}")]
    Storage {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Upload session closed: {upload_id}")]
    SessionClosed { upload_id: String },

    #[error("Upload session not found: {upload_id}")]
    NotFound { upload_id: String },

    #[error("Upload {upload_id} is incomplete: next expected chunk {next_expected_index} of {declared_total}")]
    Incomplete {
        upload_id: String,
        next_expected_index: u32,
        declared_total: u32,
    },

    #[error("Invalid configuration value for {key}: {message}")]
    Config { key: String, message: String },
}

/// Reasons a chunk is rejected before any session state is touched
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("upload id is empty")]
    EmptyUploadId,

    #[error("upload id is {len} characters (max: {max})")]
    UploadIdTooLong { len: usize, max: usize },

    #[error("upload id contains disallowed character {0:?}")]
    UploadIdCharacter(char),

    #[error("declared total {total} is outside 1..={max}")]
    InvalidTotal { total: u32, max: u32 },

    #[error("chunk index {index} is outside 0..{total}")]
    IndexOutOfRange { index: u32, total: u32 },

    #[error("chunk payload is empty")]
    EmptyPayload,

    #[error("chunk payload is {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("checksum is not a sha-256 digest in hex or base64")]
    MalformedChecksum,

    #[error("checksum does not match chunk payload")]
    ChecksumMismatch,
}

impl UploadError {
    /// Create a storage error from any backend error type
    pub fn storage<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Storage {
            source: Box::new(error),
        }
    }

    /// Create a protocol violation error
    pub fn protocol<I: Into<String>, S: Into<String>>(upload_id: I, reason: S) -> Self {
        Self::Protocol {
            upload_id: upload_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a session closed error
    pub fn session_closed<S: Into<String>>(upload_id: S) -> Self {
        Self::SessionClosed {
            upload_id: upload_id.into(),
        }
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(upload_id: S) -> Self {
        Self::NotFound {
            upload_id: upload_id.into(),
        }
    }

    /// Create a configuration error
    pub fn config<K: Into<String>, S: Into<String>>(key: K, message: S) -> Self {
        Self::Config {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Whether the caller may resend the same chunk and expect progress
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage { .. } | Self::SessionClosed { .. })
    }

    /// Whether this error failed the session it was raised for
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol { .. })
    }
}

impl From<std::io::Error> for UploadError {
    fn from(err: std::io::Error) -> Self {
        Self::storage(err)
    }
}
