use async_trait::async_trait;

use crate::{ByteStream, SessionToken, UploadResult};

/// Storage primitives needed to assemble uploads - implemented by every backend.
///
/// Two namespaces live behind a store: a private staging namespace addressed
/// by session token, and a shared public namespace addressed by sanitized name.
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Locate the staging artifact for a session. Performs no I/O; the
    /// artifact is created by the first append.
    fn staging_handle(&self, token: &SessionToken) -> StagingHandle;

    /// Write `data` at byte `offset` of the staging artifact in a single write.
    ///
    /// `offset` is the length the caller believes is already staged. Bytes
    /// beyond it (left by a torn earlier write) are truncated first; an
    /// artifact shorter than `offset` is an error. Returns the new length.
    async fn append(&self, staging: &StagingHandle, offset: u64, data: &[u8]) -> UploadResult<u64>;

    /// Delete a staging artifact. Missing artifacts are not an error.
    async fn discard(&self, staging: &StagingHandle) -> UploadResult<()>;

    /// Current length of a staging artifact, if it exists
    async fn staging_len(&self, staging: &StagingHandle) -> UploadResult<Option<u64>>;

    /// Whether a public artifact already uses `name`
    async fn public_exists(&self, name: &str) -> UploadResult<bool>;

    /// Atomically expose the staging artifact as `name` without overwriting
    /// an existing public artifact.
    async fn promote(&self, staging: &StagingHandle, name: &str) -> UploadResult<Promotion>;

    /// Read a public artifact back as a stream
    async fn open_public(&self, name: &str) -> UploadResult<ByteStream>;
}

/// Backend-specific location of one session's staging artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingHandle {
    pub token: SessionToken,
    pub location: String,
}

/// Result of a promotion attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Promotion {
    /// The artifact is now public. `staging_left` is set when the public
    /// copy exists but the staging artifact could not be removed.
    Promoted { byte_count: u64, staging_left: bool },
    /// Another artifact already owns the name; nothing was moved
    NameTaken,
}
