use bytes::Bytes;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use uuid::Uuid;

/// Stream of bytes read back from a store
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Caller-supplied identifier of one logical upload (e.g. a Dropzone `dzuuid`).
///
/// Never used as a path component; only validated and used as a map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UploadId(pub String);

impl UploadId {
    /// Create from existing string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for UploadId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for UploadId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque server-generated token naming one session's staging artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionToken(pub String);

impl SessionToken {
    /// Generate a new random session token
    pub fn new() -> Self {
        Self(format!("ses_{}", Uuid::new_v4().simple()))
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one upload session: caller id plus the token minted for it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadIdentity {
    pub upload_id: UploadId,
    pub token: SessionToken,
}

impl UploadIdentity {
    pub fn new(upload_id: UploadId) -> Self {
        Self {
            upload_id,
            token: SessionToken::new(),
        }
    }
}

impl std::fmt::Display for UploadIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.upload_id, self.token)
    }
}

/// Lifecycle state of an upload session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Accepting chunks
    Active,
    /// Every chunk is staged; promotion pending or being retried
    Completing,
    /// Promoted to the public namespace
    Complete,
    /// Closed after a protocol violation or abandoned promotion
    Failed,
    /// Closed by the reaper or by an abort
    Expired,
}

impl SessionState {
    /// Whether the session can no longer change
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Expired)
    }
}

/// One already-parsed chunk handed over by the transport layer
#[derive(Debug, Clone)]
pub struct IncomingChunk {
    pub upload_id: UploadId,
    pub index: u32,
    pub declared_total: u32,
    pub target_name_hint: Option<String>,
    pub payload: Bytes,
    /// SHA-256 of `payload`, hex or base64 encoded
    pub checksum: Option<String>,
}

impl IncomingChunk {
    pub fn new<P: Into<Bytes>>(upload_id: impl Into<UploadId>, index: u32, declared_total: u32, payload: P) -> Self {
        Self {
            upload_id: upload_id.into(),
            index,
            declared_total,
            target_name_hint: None,
            payload: payload.into(),
            checksum: None,
        }
    }

    pub fn with_target_name<S: Into<String>>(mut self, name: S) -> Self {
        self.target_name_hint = Some(name.into());
        self
    }

    pub fn with_checksum<S: Into<String>>(mut self, checksum: S) -> Self {
        self.checksum = Some(checksum.into());
        self
    }
}
