use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    naming, CompletedUpload, SessionState, StagingHandle, StagingStore, UploadError, UploadId,
    UploadIdentity, UploadResult, UploadSession,
};

/// Shared handle to one session; the mutex is the session's exclusive lock
pub type SessionHandle = Arc<tokio::sync::Mutex<UploadSession>>;

const MAX_NAME_CANDIDATES: u32 = 10_000;

struct SessionEntry {
    token: crate::SessionToken,
    handle: SessionHandle,
}

/// Public names claimed by live sessions but not yet promoted
pub struct NameReservations {
    reserved: Mutex<HashSet<String>>,
    max_len: usize,
}

impl NameReservations {
    pub fn new(max_len: usize) -> Self {
        Self {
            reserved: Mutex::new(HashSet::new()),
            max_len,
        }
    }

    /// Reserve the first candidate derived from `base` that is neither
    /// reserved nor already public, starting at `first_attempt`.
    pub async fn reserve(
        &self,
        store: &dyn StagingStore,
        base: &str,
        first_attempt: u32,
    ) -> UploadResult<String> {
        for attempt in first_attempt..MAX_NAME_CANDIDATES {
            let candidate = naming::candidate(base, attempt, self.max_len);
            if self.reserved.lock().contains(&candidate) {
                continue;
            }
            if store.public_exists(&candidate).await? {
                continue;
            }
            // Re-check under the lock: another session may have claimed it
            // while we were looking at the store.
            if self.reserved.lock().insert(candidate.clone()) {
                return Ok(candidate);
            }
        }

        Err(UploadError::storage(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("no free public name derived from {base}"),
        )))
    }

    pub fn release(&self, name: &str) {
        self.reserved.lock().remove(name);
    }

    pub fn is_reserved(&self, name: &str) -> bool {
        self.reserved.lock().contains(name)
    }

    pub fn len(&self) -> usize {
        self.reserved.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reserved.lock().is_empty()
    }
}

/// Concurrency-safe registry of in-flight upload sessions.
///
/// Lookups and inserts go through a sharded map so unrelated uploads never
/// contend; each session carries its own async lock for chunk handling.
/// Map guards are never held across an `.await`.
pub struct UploadSessionStore {
    sessions: DashMap<UploadId, SessionEntry>,
    completed: DashMap<UploadId, CompletedUpload>,
    orphans: Mutex<Vec<StagingHandle>>,
    names: Arc<NameReservations>,
    store: Arc<dyn StagingStore>,
}

impl UploadSessionStore {
    pub fn new(store: Arc<dyn StagingStore>, names: Arc<NameReservations>) -> Self {
        Self {
            sessions: DashMap::new(),
            completed: DashMap::new(),
            orphans: Mutex::new(Vec::new()),
            names,
            store,
        }
    }

    /// Return the live session for `upload_id`, creating it if absent.
    ///
    /// The boolean is true when this call created the session. Concurrent
    /// callers for the same id all receive the same session.
    pub async fn resolve_or_create(
        &self,
        upload_id: &UploadId,
        declared_total: u32,
        target_name_hint: Option<&str>,
    ) -> UploadResult<(SessionHandle, bool)> {
        if let Some(entry) = self.sessions.get(upload_id) {
            return Ok((entry.handle.clone(), false));
        }

        let base = naming::sanitize(target_name_hint, self.names.max_len);
        let target_name = self.names.reserve(self.store.as_ref(), &base, 0).await?;

        let identity = UploadIdentity::new(upload_id.clone());
        let staging = self.store.staging_handle(&identity.token);
        let token = identity.token.clone();
        let mut session = UploadSession::new(identity, declared_total, staging, target_name.clone());
        session.name_base = base;

        let resolved = match self.sessions.entry(upload_id.clone()) {
            Entry::Occupied(existing) => Err(existing.get().handle.clone()),
            Entry::Vacant(slot) => {
                let handle: SessionHandle = Arc::new(tokio::sync::Mutex::new(session));
                slot.insert(SessionEntry {
                    token,
                    handle: handle.clone(),
                });
                Ok(handle)
            }
        };

        match resolved {
            Ok(handle) => {
                debug!("Created upload session {} -> {}", upload_id, target_name);
                Ok((handle, true))
            }
            Err(existing) => {
                // Lost the race to a concurrent first chunk.
                self.names.release(&target_name);
                Ok((existing, false))
            }
        }
    }

    /// Live session for `upload_id`, if any
    pub fn get(&self, upload_id: &UploadId) -> Option<SessionHandle> {
        self.sessions.get(upload_id).map(|entry| entry.handle.clone())
    }

    /// Drop `session` from the registry and, unless it completed, delete its
    /// staging artifact. A failed delete is queued for the reaper.
    pub async fn remove(&self, session: &UploadSession) -> UploadResult<()> {
        self.detach(session);
        if session.state == SessionState::Complete {
            return Ok(());
        }

        if let Err(e) = self.store.discard(&session.staging).await {
            warn!(
                "Could not delete staging for upload {}: {}; will retry on next sweep",
                session.upload_id(),
                e
            );
            self.queue_orphan(session.staging.clone());
            return Err(e);
        }
        Ok(())
    }

    /// Queue a staging artifact whose delete failed for the next sweep
    pub fn queue_orphan(&self, staging: StagingHandle) {
        self.orphans.lock().push(staging);
    }

    /// Drop `session` from the registry without touching storage
    pub fn detach(&self, session: &UploadSession) {
        let token = session.token();
        self.sessions.remove_if(session.upload_id(), |_, entry| &entry.token == token);
        self.names.release(&session.target_name);
    }

    /// Retire a completed session and remember its receipt
    pub fn complete(&self, session: &UploadSession, upload: CompletedUpload) {
        // Receipt first, so a chunk racing the detach finds it.
        self.completed.insert(session.upload_id().clone(), upload);
        self.detach(session);
    }

    /// Receipt of a recently completed upload
    pub fn completed(&self, upload_id: &UploadId) -> Option<CompletedUpload> {
        self.completed.get(upload_id).map(|entry| entry.value().clone())
    }

    /// Forget completed uploads finished before `older_than`
    pub fn prune_completed(&self, older_than: DateTime<Utc>) -> usize {
        let before = self.completed.len();
        self.completed.retain(|_, upload| upload.completed_at > older_than);
        before.saturating_sub(self.completed.len())
    }

    /// ACTIVE sessions idle since `older_than` or earlier.
    ///
    /// Sessions whose lock is held are busy by definition and skipped.
    pub fn list_expired(&self, older_than: DateTime<Utc>) -> Vec<SessionHandle> {
        self.sessions
            .iter()
            .filter_map(|entry| {
                let session = entry.handle.try_lock().ok()?;
                (session.state == SessionState::Active && session.last_activity <= older_than)
                    .then(|| entry.handle.clone())
            })
            .collect()
    }

    /// Retry deleting staging artifacts whose earlier delete failed.
    /// Returns how many were cleaned.
    pub async fn retry_orphans(&self) -> usize {
        let pending: Vec<StagingHandle> = std::mem::take(&mut *self.orphans.lock());
        let mut cleaned = 0;
        for staging in pending {
            match self.store.discard(&staging).await {
                Ok(()) => cleaned += 1,
                Err(e) => {
                    warn!("Still cannot delete staging {}: {}", staging.location, e);
                    self.orphans.lock().push(staging);
                }
            }
        }
        cleaned
    }

    /// Staging artifacts waiting for a delete retry
    pub fn orphan_count(&self) -> usize {
        self.orphans.lock().len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn names(&self) -> &Arc<NameReservations> {
        &self.names
    }
}
