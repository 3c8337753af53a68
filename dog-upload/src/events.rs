use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CompletedUpload, SessionToken, UploadId};

/// Lifecycle events broadcast for observability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum UploadEvent {
    /// First chunk of a new upload arrived
    SessionCreated {
        upload_id: UploadId,
        token: SessionToken,
        declared_total: u32,
        target_name: String,
        at: DateTime<Utc>,
    },

    /// A chunk was buffered or flushed
    ChunkAccepted {
        upload_id: UploadId,
        index: u32,
        next_expected_index: u32,
        at: DateTime<Utc>,
    },

    /// Artifact promoted to its public name
    Completed {
        upload_id: UploadId,
        public_ref: String,
        byte_count: u64,
        at: DateTime<Utc>,
    },

    /// Session failed (protocol violation or abandoned promotion)
    Failed {
        upload_id: UploadId,
        reason: String,
        at: DateTime<Utc>,
    },

    /// Session expired by the reaper
    Expired {
        upload_id: UploadId,
        at: DateTime<Utc>,
    },

    /// Session aborted by the caller
    Aborted {
        upload_id: UploadId,
        at: DateTime<Utc>,
    },
}

impl UploadEvent {
    pub fn upload_id(&self) -> &UploadId {
        match self {
            Self::SessionCreated { upload_id, .. }
            | Self::ChunkAccepted { upload_id, .. }
            | Self::Completed { upload_id, .. }
            | Self::Failed { upload_id, .. }
            | Self::Expired { upload_id, .. }
            | Self::Aborted { upload_id, .. } => upload_id,
        }
    }
}

/// Hook for the collaborator that records finished uploads (e.g. storing the
/// media URL on an entity). Called once per completed upload.
#[async_trait]
pub trait CompletionListener: Send + Sync {
    async fn on_completed(
        &self,
        upload: &CompletedUpload,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}
