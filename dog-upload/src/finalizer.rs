use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{error, info, instrument, warn};

use crate::{
    CompletedUpload, CompletionListener, FinalizeResult, Promotion, SessionState, StagingStore,
    UploadError, UploadEvent, UploadResult, UploadSession, UploadSessionStore,
};

/// Name collisions tolerated during one promotion before giving up
const MAX_PROMOTE_RENAMES: u32 = 8;

/// Promotes fully staged sessions to the public namespace
pub struct Finalizer {
    store: Arc<dyn StagingStore>,
    sessions: Arc<UploadSessionStore>,
    listeners: Vec<Arc<dyn CompletionListener>>,
    events: broadcast::Sender<UploadEvent>,
    public_base_url: String,
    max_attempts: u32,
}

impl Finalizer {
    pub fn new(
        store: Arc<dyn StagingStore>,
        sessions: Arc<UploadSessionStore>,
        events: broadcast::Sender<UploadEvent>,
        public_base_url: String,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            sessions,
            listeners: Vec::new(),
            events,
            public_base_url,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Notify `listener` of every completed upload
    pub fn add_listener(&mut self, listener: Arc<dyn CompletionListener>) {
        self.listeners.push(listener);
    }

    /// Public reference for a promoted name
    pub fn public_ref(&self, name: &str) -> String {
        format!("{}/{}", self.public_base_url, name)
    }

    /// Promote a COMPLETING session.
    ///
    /// On success the session is COMPLETE and listeners have been notified.
    /// On a storage failure the session stays COMPLETING with its staging
    /// artifact intact, until `max_attempts` consecutive failures mark it
    /// FAILED; the staging artifact is kept either way.
    #[instrument(skip(self, session), fields(upload_id = %session.upload_id()))]
    pub async fn finalize(&self, session: &mut UploadSession) -> UploadResult<CompletedUpload> {
        if session.state != SessionState::Completing || !session.is_fully_staged() {
            return Err(UploadError::Incomplete {
                upload_id: session.upload_id().to_string(),
                next_expected_index: session.next_expected_index,
                declared_total: session.declared_total,
            });
        }

        session.finalize_attempts += 1;
        let result = match self.promote(session).await {
            Ok(result) => result,
            Err(e) => {
                if session.finalize_attempts >= self.max_attempts {
                    session.state = SessionState::Failed;
                    error!(
                        "Giving up promoting upload {} after {} attempts: {}; staging kept at {}",
                        session.upload_id(),
                        session.finalize_attempts,
                        e,
                        session.staging.location
                    );
                    let _ = self.events.send(UploadEvent::Failed {
                        upload_id: session.upload_id().clone(),
                        reason: format!("promotion failed: {e}"),
                        at: Utc::now(),
                    });
                } else {
                    warn!(
                        "Promotion of upload {} failed (attempt {}): {}",
                        session.upload_id(),
                        session.finalize_attempts,
                        e
                    );
                }
                return Err(e);
            }
        };

        session.state = SessionState::Complete;
        let upload = CompletedUpload::new(session, result);
        info!(
            "Upload {} complete: {} ({} bytes)",
            session.upload_id(),
            upload.public_ref,
            upload.byte_count
        );

        for listener in &self.listeners {
            if let Err(e) = listener.on_completed(&upload).await {
                warn!("Completion listener failed for upload {}: {}", session.upload_id(), e);
            }
        }

        let _ = self.events.send(UploadEvent::Completed {
            upload_id: session.upload_id().clone(),
            public_ref: upload.public_ref.clone(),
            byte_count: upload.byte_count,
            at: upload.completed_at,
        });

        Ok(upload)
    }

    async fn promote(&self, session: &mut UploadSession) -> UploadResult<FinalizeResult> {
        for _ in 0..MAX_PROMOTE_RENAMES {
            match self.store.promote(&session.staging, &session.target_name).await? {
                Promotion::Promoted {
                    byte_count,
                    staging_left,
                } => {
                    if staging_left {
                        self.sessions.queue_orphan(session.staging.clone());
                    }
                    return Ok(FinalizeResult {
                        public_ref: self.public_ref(&session.target_name),
                        public_name: session.target_name.clone(),
                        byte_count,
                    });
                }
                Promotion::NameTaken => {
                    // Something outside our reservations took the name.
                    // Candidates come from the original base so suffixes never stack.
                    let names = self.sessions.names();
                    let next = names.reserve(self.store.as_ref(), &session.name_base, 1).await?;
                    warn!(
                        "Public name {} taken, promoting upload {} as {}",
                        session.target_name,
                        session.upload_id(),
                        next
                    );
                    names.release(&session.target_name);
                    session.target_name = next;
                }
            }
        }

        Err(UploadError::storage(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("no free public name for upload {}", session.upload_id()),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChunkAssembler, MemoryStagingStore, NameReservations, SessionToken, UploadIdentity, UploadLimits};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl CompletionListener for Recorder {
        async fn on_completed(
            &self,
            upload: &CompletedUpload,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.seen.lock().push(upload.public_ref.clone());
            Ok(())
        }
    }

    async fn staged_session(memory: &MemoryStagingStore, names: &NameReservations, name: &str) -> UploadSession {
        let identity = UploadIdentity {
            upload_id: "u1".into(),
            token: SessionToken::new(),
        };
        let target = names.reserve(memory, name, 0).await.unwrap();
        let staging = memory.staging_handle(&identity.token);
        let mut session = UploadSession::new(identity, 2, staging, target);
        let asm = ChunkAssembler::new(Arc::new(memory.clone()), UploadLimits::default());
        asm.apply(&mut session, 0, "AB".into()).await.unwrap();
        asm.apply(&mut session, 1, "C".into()).await.unwrap();
        session.state = SessionState::Completing;
        session
    }

    fn session_store(memory: &MemoryStagingStore) -> Arc<UploadSessionStore> {
        Arc::new(UploadSessionStore::new(
            Arc::new(memory.clone()),
            Arc::new(NameReservations::new(128)),
        ))
    }

    fn finalizer(memory: &MemoryStagingStore, sessions: Arc<UploadSessionStore>, attempts: u32) -> Finalizer {
        let (events, _) = broadcast::channel(16);
        Finalizer::new(Arc::new(memory.clone()), sessions, events, "/uploads/video".to_string(), attempts)
    }

    #[tokio::test]
    async fn test_promotes_and_notifies() {
        let memory = MemoryStagingStore::new();
        let sessions = session_store(&memory);
        let mut session = staged_session(&memory, sessions.names(), "clip.mp4").await;

        let recorder = Arc::new(Recorder::default());
        let mut fin = finalizer(&memory, sessions, 3);
        fin.add_listener(recorder.clone());

        let upload = fin.finalize(&mut session).await.unwrap();
        assert_eq!(upload.public_ref, "/uploads/video/clip.mp4");
        assert_eq!(upload.byte_count, 3);
        assert_eq!(session.state, SessionState::Complete);
        assert_eq!(memory.public_bytes("clip.mp4").unwrap().as_ref(), b"ABC");
        assert_eq!(memory.staging_count(), 0);
        assert_eq!(*recorder.seen.lock(), vec!["/uploads/video/clip.mp4".to_string()]);

        // A second finalize must not publish again.
        assert!(fin.finalize(&mut session).await.is_err());
        assert_eq!(memory.public_count(), 1);
    }

    #[tokio::test]
    async fn test_name_taken_at_promotion_picks_next_name() {
        let memory = MemoryStagingStore::new();
        let sessions = session_store(&memory);
        let mut session = staged_session(&memory, sessions.names(), "clip.mp4").await;
        memory.insert_public("clip.mp4", "someone else");

        let upload = finalizer(&memory, sessions.clone(), 3).finalize(&mut session).await.unwrap();
        assert_eq!(upload.public_name, "clip-1.mp4");
        assert_eq!(memory.public_bytes("clip.mp4").unwrap().as_ref(), b"someone else");
        assert_eq!(memory.public_bytes("clip-1.mp4").unwrap().as_ref(), b"ABC");
        assert!(!sessions.names().is_reserved("clip.mp4"));
    }

    #[tokio::test]
    async fn test_promote_failure_keeps_staging_until_attempts_run_out() {
        let memory = MemoryStagingStore::new();
        let sessions = session_store(&memory);
        let mut session = staged_session(&memory, sessions.names(), "clip.mp4").await;
        let fin = finalizer(&memory, sessions, 2);

        memory.fail_next_promotions(2);
        assert!(fin.finalize(&mut session).await.unwrap_err().is_retryable());
        assert_eq!(session.state, SessionState::Completing);

        assert!(fin.finalize(&mut session).await.is_err());
        assert_eq!(session.state, SessionState::Failed);
        assert_eq!(memory.staging_bytes(&session.staging).unwrap(), b"ABC");
        assert_eq!(memory.public_count(), 0);
    }

    #[tokio::test]
    async fn test_incomplete_session_is_refused() {
        let memory = MemoryStagingStore::new();
        let sessions = session_store(&memory);
        let identity = UploadIdentity {
            upload_id: "u1".into(),
            token: SessionToken::new(),
        };
        let staging = memory.staging_handle(&identity.token);
        let mut session = UploadSession::new(identity, 2, staging, "x".to_string());
        session.state = SessionState::Completing;

        let err = finalizer(&memory, sessions, 3).finalize(&mut session).await.unwrap_err();
        assert!(matches!(err, UploadError::Incomplete { next_expected_index: 0, declared_total: 2, .. }));
    }

    #[tokio::test]
    async fn test_renamed_promotion_starts_from_the_base_name() {
        let memory = MemoryStagingStore::new();
        let sessions = session_store(&memory);
        let mut session = staged_session(&memory, sessions.names(), "clip-3.mp4").await;
        session.name_base = "clip.mp4".to_string();
        memory.insert_public("clip-3.mp4", "someone else");

        let upload = finalizer(&memory, sessions.clone(), 3).finalize(&mut session).await.unwrap();
        assert_eq!(upload.public_name, "clip-1.mp4");
        assert!(memory.public_bytes("clip-3-1.mp4").is_none());
        assert!(!sessions.names().is_reserved("clip-3.mp4"));
    }

    #[tokio::test]
    async fn test_staging_left_after_promotion_is_queued_for_cleanup() {
        let memory = MemoryStagingStore::new();
        let sessions = session_store(&memory);
        let mut session = staged_session(&memory, sessions.names(), "clip.mp4").await;

        memory.fail_next_unlinks(1);
        let upload = finalizer(&memory, sessions.clone(), 3).finalize(&mut session).await.unwrap();
        assert_eq!(upload.byte_count, 3);
        assert_eq!(memory.staging_count(), 1);
        assert_eq!(sessions.orphan_count(), 1);

        assert_eq!(sessions.retry_orphans().await, 1);
        assert_eq!(memory.staging_count(), 0);
        assert_eq!(sessions.orphan_count(), 0);
        assert_eq!(memory.public_bytes("clip.mp4").unwrap().as_ref(), b"ABC");
    }
}
