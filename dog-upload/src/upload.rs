use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{SessionState, SessionToken, StagingHandle, UploadId, UploadIdentity};

/// Server-side state of one multi-chunk upload.
///
/// Owned by [`crate::UploadSessionStore`] and only mutated while its
/// per-session lock is held.
#[derive(Debug)]
pub struct UploadSession {
    pub identity: UploadIdentity,

    /// Fixed by the first chunk
    pub declared_total: u32,

    /// Every index below this is in the staging artifact, in order
    pub next_expected_index: u32,

    /// Chunks that arrived ahead of the cursor
    pub received_out_of_order: BTreeMap<u32, Bytes>,
    pub buffered_bytes: usize,

    /// Length of the staging artifact covering `[0, next_expected_index)`
    pub staged_bytes: u64,
    pub staging: StagingHandle,

    /// Sanitized, reserved public name
    pub target_name: String,
    /// Sanitized hint `target_name` was derived from
    pub name_base: String,

    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub state: SessionState,

    /// Consecutive failed promotions
    pub finalize_attempts: u32,
}

impl UploadSession {
    pub fn new(identity: UploadIdentity, declared_total: u32, staging: StagingHandle, target_name: String) -> Self {
        let now = Utc::now();
        Self {
            identity,
            declared_total,
            next_expected_index: 0,
            received_out_of_order: BTreeMap::new(),
            buffered_bytes: 0,
            staged_bytes: 0,
            staging,
            name_base: target_name.clone(),
            target_name,
            created_at: now,
            last_activity: now,
            state: SessionState::Active,
            finalize_attempts: 0,
        }
    }

    pub fn upload_id(&self) -> &UploadId {
        &self.identity.upload_id
    }

    pub fn token(&self) -> &SessionToken {
        &self.identity.token
    }

    /// Record activity from an accepted chunk
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Every chunk has been flushed to staging
    pub fn is_fully_staged(&self) -> bool {
        self.next_expected_index == self.declared_total
    }

    /// Snapshot for callers resuming an upload
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            upload_id: self.identity.upload_id.clone(),
            token: self.identity.token.clone(),
            state: self.state,
            declared_total: self.declared_total,
            next_expected_index: self.next_expected_index,
            buffered_indices: self.received_out_of_order.keys().copied().collect(),
            staged_bytes: self.staged_bytes,
            target_name: self.target_name.clone(),
            last_activity: self.last_activity,
        }
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub upload_id: UploadId,
    pub token: SessionToken,
    pub state: SessionState,
    pub declared_total: u32,
    pub next_expected_index: u32,
    pub buffered_indices: Vec<u32>,
    pub staged_bytes: u64,
    pub target_name: String,
    pub last_activity: DateTime<Utc>,
}
