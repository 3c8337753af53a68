use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::{
    AssemblyResult, ByteStream, ChunkAssembler, ChunkOutcome, ChunkValidator, CompletedUpload, CompletionListener,
    Finalizer, LocalFsStore, NameReservations, ReaperHandle, SessionReaper, SessionState, SessionStatus,
    StagingStore, UploadConfig, UploadError, UploadEvent, UploadId, UploadResult, UploadSession,
    UploadSessionStore, IncomingChunk,
};

/// Chunked upload intake. This is what transport handlers embed.
///
/// One instance serves any number of concurrent uploads; chunks of the same
/// upload are serialized on that upload's session lock.
pub struct ChunkUploadService {
    config: UploadConfig,
    validator: ChunkValidator,
    store: Arc<dyn StagingStore>,
    sessions: Arc<UploadSessionStore>,
    assembler: ChunkAssembler,
    finalizer: Finalizer,
    events: broadcast::Sender<UploadEvent>,
}

impl ChunkUploadService {
    /// Create a service over `store`
    pub fn new<S: StagingStore + 'static>(store: S, config: UploadConfig) -> Self {
        Self::from_arc(Arc::new(store), config)
    }

    /// Create a service over a shared store
    pub fn from_arc(store: Arc<dyn StagingStore>, config: UploadConfig) -> Self {
        let limits = config.limits.clone();
        let names = Arc::new(NameReservations::new(limits.max_target_name_len));
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let sessions = Arc::new(UploadSessionStore::new(store.clone(), names));

        Self {
            validator: ChunkValidator::new(limits.clone()),
            assembler: ChunkAssembler::new(store.clone(), limits),
            finalizer: Finalizer::new(
                store.clone(),
                sessions.clone(),
                events.clone(),
                config.public_base_url.clone(),
                config.max_finalize_attempts,
            ),
            sessions,
            store,
            events,
            config,
        }
    }

    /// Create a service over a local directory tree at `config.storage_root`
    pub async fn open_local(config: UploadConfig) -> UploadResult<Self> {
        let store = LocalFsStore::from_config(&config).await?;
        Ok(Self::new(store, config))
    }

    /// Notify `listener` of every completed upload
    pub fn with_listener(mut self, listener: Arc<dyn CompletionListener>) -> Self {
        self.finalizer.add_listener(listener);
        self
    }

    /// Accept one chunk.
    ///
    /// Chunks may arrive in any order and more than once; the upload is
    /// published once every index in `[0, declared_total)` has been staged.
    #[instrument(skip(self, chunk), fields(upload_id = %chunk.upload_id, index = chunk.index))]
    pub async fn submit_chunk(&self, chunk: IncomingChunk) -> UploadResult<ChunkOutcome> {
        self.validator.validate(&chunk)?;

        if let Some(outcome) = self.answer_from_receipt(&chunk)? {
            return Ok(outcome);
        }

        // A second pass covers a session closed while we waited on its lock.
        for _ in 0..2 {
            let (handle, created) = self
                .sessions
                .resolve_or_create(
                    &chunk.upload_id,
                    chunk.declared_total,
                    chunk.target_name_hint.as_deref(),
                )
                .await?;
            let mut session = handle.lock().await;

            if created {
                // The upload may have completed between the receipt check and
                // the resolve; a fresh session must not shadow it.
                if let Some(late) = self.answer_from_receipt(&chunk).transpose() {
                    self.sessions.detach(&session);
                    return late;
                }
                info!(
                    "Started upload {} ({} chunks) as {}",
                    session.upload_id(),
                    session.declared_total,
                    session.target_name
                );
                let _ = self.events.send(UploadEvent::SessionCreated {
                    upload_id: session.upload_id().clone(),
                    token: session.token().clone(),
                    declared_total: session.declared_total,
                    target_name: session.target_name.clone(),
                    at: Utc::now(),
                });
            }

            match session.state {
                SessionState::Active => return self.accept(&mut session, chunk).await,
                SessionState::Completing => {
                    self.check_total(&mut session, &chunk).await?;
                    // Everything is staged; any chunk retries the promotion.
                    return self.finish(&mut session).await.map(ChunkOutcome::Completed);
                }
                _ => {
                    drop(session);
                    if let Some(late) = self.answer_from_receipt(&chunk).transpose() {
                        return late;
                    }
                    debug!("Upload {} closed while waiting, resolving again", chunk.upload_id);
                }
            }
        }

        Err(UploadError::session_closed(chunk.upload_id.as_str()))
    }

    /// Late chunks for a recently completed upload
    fn answer_from_receipt(&self, chunk: &IncomingChunk) -> UploadResult<Option<ChunkOutcome>> {
        let Some(done) = self.sessions.completed(&chunk.upload_id) else {
            return Ok(None);
        };
        if done.declared_total != chunk.declared_total {
            return Err(UploadError::protocol(
                chunk.upload_id.as_str(),
                format!(
                    "declared total {} differs from completed upload's {}",
                    chunk.declared_total, done.declared_total
                ),
            ));
        }

        debug!("Chunk {} arrived after upload {} completed", chunk.index, chunk.upload_id);
        Ok(Some(ChunkOutcome::DuplicateIgnored {
            upload_id: chunk.upload_id.clone(),
            index: chunk.index,
            public_ref: Some(done.public_ref),
        }))
    }

    /// A chunk declaring a different total fails the session
    async fn check_total(&self, session: &mut UploadSession, chunk: &IncomingChunk) -> UploadResult<()> {
        if chunk.declared_total == session.declared_total {
            return Ok(());
        }
        let reason = format!(
            "declared total changed from {} to {}",
            session.declared_total, chunk.declared_total
        );
        self.fail(session, &reason).await;
        Err(UploadError::protocol(session.upload_id().as_str(), reason))
    }

    async fn accept(&self, session: &mut UploadSession, chunk: IncomingChunk) -> UploadResult<ChunkOutcome> {
        self.check_total(session, &chunk).await?;

        let index = chunk.index;
        let applied = match self.assembler.apply(session, index, chunk.payload).await {
            Ok(applied) => applied,
            Err(e) if e.is_protocol() => {
                self.fail(session, &e.to_string()).await;
                return Err(e);
            }
            Err(e) => {
                warn!(
                    "Chunk {} of upload {} not stored, cursor stays at {}: {}",
                    index,
                    session.upload_id(),
                    session.next_expected_index,
                    e
                );
                return Err(e);
            }
        };

        if applied == AssemblyResult::DuplicateIgnored {
            return Ok(ChunkOutcome::DuplicateIgnored {
                upload_id: session.upload_id().clone(),
                index,
                public_ref: None,
            });
        }

        let _ = self.events.send(UploadEvent::ChunkAccepted {
            upload_id: session.upload_id().clone(),
            index,
            next_expected_index: session.next_expected_index,
            at: Utc::now(),
        });

        if applied == AssemblyResult::Completed {
            session.state = SessionState::Completing;
            return self.finish(session).await.map(ChunkOutcome::Completed);
        }

        debug!(
            "Upload {} chunk {} accepted, next expected {}",
            session.upload_id(),
            index,
            session.next_expected_index
        );
        Ok(ChunkOutcome::ChunkReceived {
            upload_id: session.upload_id().clone(),
            index,
            next_expected_index: session.next_expected_index,
            declared_total: session.declared_total,
        })
    }

    async fn finish(&self, session: &mut UploadSession) -> UploadResult<CompletedUpload> {
        match self.finalizer.finalize(session).await {
            Ok(upload) => {
                self.sessions.complete(session, upload.clone());
                Ok(upload)
            }
            Err(e) => {
                if session.state == SessionState::Failed {
                    // Abandoned promotion keeps its staging artifact.
                    self.sessions.detach(session);
                }
                Err(e)
            }
        }
    }

    async fn fail(&self, session: &mut UploadSession, reason: &str) {
        session.state = SessionState::Failed;
        warn!("Upload {} failed: {}", session.upload_id(), reason);

        if let Err(e) = self.sessions.remove(session).await {
            warn!("Failed upload {} left staging behind: {}", session.upload_id(), e);
        }
        let _ = self.events.send(UploadEvent::Failed {
            upload_id: session.upload_id().clone(),
            reason: reason.to_string(),
            at: Utc::now(),
        });
    }

    /// Discard an in-flight upload and its staging artifact
    #[instrument(skip(self, upload_id), fields(upload_id = %upload_id))]
    pub async fn abort(&self, upload_id: &UploadId) -> UploadResult<()> {
        let handle = self
            .sessions
            .get(upload_id)
            .ok_or_else(|| UploadError::not_found(upload_id.as_str()))?;
        let mut session = handle.lock().await;
        if session.state.is_terminal() {
            return Err(UploadError::not_found(upload_id.as_str()));
        }

        session.state = SessionState::Expired;
        info!(
            "Aborting upload {} at chunk {} of {}",
            upload_id, session.next_expected_index, session.declared_total
        );
        let removed = self.sessions.remove(&session).await;

        let _ = self.events.send(UploadEvent::Aborted {
            upload_id: upload_id.clone(),
            at: Utc::now(),
        });
        removed
    }

    /// Retry promoting an upload whose chunks are all staged
    pub async fn retry_finalize(&self, upload_id: &UploadId) -> UploadResult<CompletedUpload> {
        if let Some(done) = self.sessions.completed(upload_id) {
            return Ok(done);
        }

        let handle = self
            .sessions
            .get(upload_id)
            .ok_or_else(|| UploadError::not_found(upload_id.as_str()))?;
        let mut session = handle.lock().await;
        match session.state {
            SessionState::Completing => self.finish(&mut session).await,
            SessionState::Active => Err(UploadError::Incomplete {
                upload_id: upload_id.to_string(),
                next_expected_index: session.next_expected_index,
                declared_total: session.declared_total,
            }),
            _ => Err(UploadError::not_found(upload_id.as_str())),
        }
    }

    /// Progress of an in-flight upload, for clients resuming after a disconnect
    pub async fn session_status(&self, upload_id: &UploadId) -> Option<SessionStatus> {
        let handle = self.sessions.get(upload_id)?;
        let session = handle.lock().await;
        Some(session.status())
    }

    /// Receipt of a recently completed upload
    pub fn completed(&self, upload_id: &UploadId) -> Option<CompletedUpload> {
        self.sessions.completed(upload_id)
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.events.subscribe()
    }

    /// Reaper configured from this service's settings
    pub fn reaper(&self) -> SessionReaper {
        SessionReaper::new(
            self.sessions.clone(),
            self.events.clone(),
            self.config.idle_timeout,
            self.config.completed_retention,
        )
        .with_interval(self.config.reaper_interval)
    }

    /// Start the reaper on a background task
    pub fn spawn_reaper(&self) -> ReaperHandle {
        self.reaper().spawn()
    }

    /// Read a published upload
    pub async fn open_public(&self, name: &str) -> UploadResult<ByteStream> {
        self.store.open_public(name).await
    }

    /// Registry of in-flight sessions
    pub fn sessions(&self) -> &Arc<UploadSessionStore> {
        &self.sessions
    }

    /// Settings this service was built with
    pub fn config(&self) -> &UploadConfig {
        &self.config
    }
}
