use base64::Engine;
use sha2::{Digest, Sha256};

use crate::{IncomingChunk, UploadLimits, ValidationError};

/// Side-effect-free checks applied to every chunk before any session lookup
#[derive(Debug, Clone)]
pub struct ChunkValidator {
    limits: UploadLimits,
}

impl ChunkValidator {
    pub fn new(limits: UploadLimits) -> Self {
        Self { limits }
    }

    /// Validate identity, total, index, payload and checksum, in that order
    pub fn validate(&self, chunk: &IncomingChunk) -> Result<(), ValidationError> {
        self.validate_upload_id(chunk.upload_id.as_str())?;

        if chunk.declared_total == 0 || chunk.declared_total > self.limits.max_total_chunks {
            return Err(ValidationError::InvalidTotal {
                total: chunk.declared_total,
                max: self.limits.max_total_chunks,
            });
        }

        if chunk.index >= chunk.declared_total {
            return Err(ValidationError::IndexOutOfRange {
                index: chunk.index,
                total: chunk.declared_total,
            });
        }

        if chunk.payload.is_empty() {
            return Err(ValidationError::EmptyPayload);
        }
        if chunk.payload.len() > self.limits.max_chunk_bytes {
            return Err(ValidationError::PayloadTooLarge {
                size: chunk.payload.len(),
                max: self.limits.max_chunk_bytes,
            });
        }

        if let Some(checksum) = &chunk.checksum {
            let expected = decode_sha256(checksum).ok_or(ValidationError::MalformedChecksum)?;
            if Sha256::digest(&chunk.payload).as_slice() != expected.as_slice() {
                return Err(ValidationError::ChecksumMismatch);
            }
        }

        Ok(())
    }

    /// Upload ids are restricted to `[A-Za-z0-9_-]`
    pub fn validate_upload_id(&self, id: &str) -> Result<(), ValidationError> {
        if id.is_empty() {
            return Err(ValidationError::EmptyUploadId);
        }
        let len = id.chars().count();
        if len > self.limits.max_id_len {
            return Err(ValidationError::UploadIdTooLong {
                len,
                max: self.limits.max_id_len,
            });
        }
        if let Some(bad) = id.chars().find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-')) {
            return Err(ValidationError::UploadIdCharacter(bad));
        }
        Ok(())
    }
}

/// Accepts 64 hex characters or standard base64 of a 32-byte digest
fn decode_sha256(checksum: &str) -> Option<Vec<u8>> {
    let checksum = checksum.trim();
    let checksum = checksum.strip_prefix("sha256:").unwrap_or(checksum);

    if checksum.len() == 64 {
        if let Ok(digest) = hex::decode(checksum) {
            return Some(digest);
        }
    }

    base64::engine::general_purpose::STANDARD
        .decode(checksum)
        .ok()
        .filter(|bytes| bytes.len() == 32)
}
