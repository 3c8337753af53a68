use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{UploadError, UploadId, UploadIdentity, UploadResult, UploadSession};

/// Where a promoted artifact ended up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeResult {
    /// Reference handed to callers, e.g. `/uploads/video/clip.mp4`
    pub public_ref: String,
    pub public_name: String,
    pub byte_count: u64,
}

/// Receipt for a fully assembled and promoted upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedUpload {
    pub identity: UploadIdentity,
    pub declared_total: u32,
    pub public_ref: String,
    pub public_name: String,
    pub byte_count: u64,
    pub completed_at: DateTime<Utc>,
}

impl CompletedUpload {
    pub fn new(session: &UploadSession, result: FinalizeResult) -> Self {
        Self {
            identity: session.identity.clone(),
            declared_total: session.declared_total,
            public_ref: result.public_ref,
            public_name: result.public_name,
            byte_count: result.byte_count,
            completed_at: Utc::now(),
        }
    }
}

/// Outcome of submitting one chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Chunk accepted, waiting for more
    ChunkReceived {
        upload_id: UploadId,
        index: u32,
        next_expected_index: u32,
        declared_total: u32,
    },
    /// This chunk completed the upload
    Completed(CompletedUpload),
    /// Chunk was already accepted earlier; nothing changed
    DuplicateIgnored {
        upload_id: UploadId,
        index: u32,
        public_ref: Option<String>,
    },
}

impl ChunkOutcome {
    pub fn status(&self) -> ChunkStatus {
        match self {
            Self::ChunkReceived { .. } => ChunkStatus::ChunkReceived,
            Self::Completed(_) => ChunkStatus::Completed,
            Self::DuplicateIgnored { .. } => ChunkStatus::DuplicateIgnored,
        }
    }
}

/// Wire-level status of a chunk submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChunkStatus {
    ChunkReceived,
    Completed,
    DuplicateIgnored,
    Rejected,
}

/// Transport-agnostic response body for a chunk submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResponse {
    pub status: ChunkStatus,
    /// Public reference when completed, otherwise a human-readable message
    pub detail: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_expected_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub byte_count: Option<u64>,
}

impl ChunkResponse {
    /// Render either side of a submission result
    pub fn from_result(result: &UploadResult<ChunkOutcome>) -> Self {
        match result {
            Ok(outcome) => Self::from_outcome(outcome),
            Err(error) => Self::from_error(error),
        }
    }

    pub fn from_outcome(outcome: &ChunkOutcome) -> Self {
        match outcome {
            ChunkOutcome::ChunkReceived { index, next_expected_index, declared_total, .. } => Self {
                status: ChunkStatus::ChunkReceived,
                detail: format!("Chunk {} of {} received", index + 1, declared_total),
                retryable: false,
                next_expected_index: Some(*next_expected_index),
                byte_count: None,
            },
            ChunkOutcome::Completed(upload) => Self {
                status: ChunkStatus::Completed,
                detail: upload.public_ref.clone(),
                retryable: false,
                next_expected_index: None,
                byte_count: Some(upload.byte_count),
            },
            ChunkOutcome::DuplicateIgnored { index, public_ref, .. } => Self {
                status: ChunkStatus::DuplicateIgnored,
                detail: public_ref
                    .clone()
                    .unwrap_or_else(|| format!("Chunk {index} already received")),
                retryable: false,
                next_expected_index: None,
                byte_count: None,
            },
        }
    }

    pub fn from_error(error: &UploadError) -> Self {
        Self {
            status: ChunkStatus::Rejected,
            detail: error.to_string(),
            retryable: error.is_retryable(),
            next_expected_index: match error {
                UploadError::Incomplete { next_expected_index, .. } => Some(*next_expected_index),
                _ => None,
            },
            byte_count: None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
