use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::{StagingStore, UploadError, UploadLimits, UploadResult, UploadSession};

/// What applying one chunk did to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyResult {
    /// Held in memory until the cursor reaches it
    Buffered,
    /// Written to staging; the cursor moved to the given index
    Flushed(u32),
    /// Already staged or buffered; nothing changed
    DuplicateIgnored,
    /// Every chunk is staged; ready for promotion
    Completed,
}

/// Orders chunks into a session's staging artifact.
///
/// Callers must hold the session's lock for the whole `apply` call.
pub struct ChunkAssembler {
    store: Arc<dyn StagingStore>,
    limits: UploadLimits,
}

impl ChunkAssembler {
    pub fn new(store: Arc<dyn StagingStore>, limits: UploadLimits) -> Self {
        Self { store, limits }
    }

    /// Incorporate chunk `index` into `session`.
    ///
    /// Budget violations are returned as [`UploadError::Protocol`]; storage
    /// failures leave the cursor at the last chunk that was fully written.
    pub async fn apply(
        &self,
        session: &mut UploadSession,
        index: u32,
        payload: Bytes,
    ) -> UploadResult<AssemblyResult> {
        // Finish a drain interrupted by an earlier storage failure.
        let recovered = self.drain(session).await?;

        let cursor = session.next_expected_index;
        if index < cursor {
            if recovered && session.is_fully_staged() {
                return Ok(AssemblyResult::Completed);
            }
            debug!("Ignoring duplicate chunk {} for upload {}", index, session.upload_id());
            return Ok(AssemblyResult::DuplicateIgnored);
        }

        if index > cursor {
            return self.buffer(session, index, payload);
        }

        self.check_total_size(session, payload.len())?;
        self.flush(session, &payload).await?;
        self.drain(session).await?;
        session.touch();

        if session.is_fully_staged() {
            Ok(AssemblyResult::Completed)
        } else {
            Ok(AssemblyResult::Flushed(session.next_expected_index))
        }
    }

    fn buffer(&self, session: &mut UploadSession, index: u32, payload: Bytes) -> UploadResult<AssemblyResult> {
        if session.received_out_of_order.contains_key(&index) {
            debug!("Chunk {} for upload {} is already buffered", index, session.upload_id());
            return Ok(AssemblyResult::DuplicateIgnored);
        }

        if session.received_out_of_order.len() >= self.limits.max_buffered_chunks {
            return Err(UploadError::protocol(
                session.upload_id().as_str(),
                format!(
                    "more than {} chunks buffered ahead of chunk {}",
                    self.limits.max_buffered_chunks, session.next_expected_index
                ),
            ));
        }
        if session.buffered_bytes + payload.len() > self.limits.max_buffered_bytes {
            return Err(UploadError::protocol(
                session.upload_id().as_str(),
                format!(
                    "more than {} bytes buffered ahead of chunk {}",
                    self.limits.max_buffered_bytes, session.next_expected_index
                ),
            ));
        }
        self.check_total_size(session, payload.len())?;

        session.buffered_bytes += payload.len();
        session.received_out_of_order.insert(index, payload);
        session.touch();
        Ok(AssemblyResult::Buffered)
    }

    fn check_total_size(&self, session: &UploadSession, incoming: usize) -> UploadResult<()> {
        let total = session.staged_bytes + session.buffered_bytes as u64 + incoming as u64;
        if total > self.limits.max_upload_bytes {
            return Err(UploadError::protocol(
                session.upload_id().as_str(),
                format!("upload exceeds {} bytes", self.limits.max_upload_bytes),
            ));
        }
        Ok(())
    }

    /// Append one chunk at the cursor and advance it
    async fn flush(&self, session: &mut UploadSession, payload: &[u8]) -> UploadResult<()> {
        let new_len = self
            .store
            .append(&session.staging, session.staged_bytes, payload)
            .await?;
        session.staged_bytes = new_len;
        session.next_expected_index += 1;
        Ok(())
    }

    /// Flush buffered chunks while the next one is at the cursor. A buffered
    /// chunk leaves the buffer only once its append succeeded.
    async fn drain(&self, session: &mut UploadSession) -> UploadResult<bool> {
        let mut flushed = false;
        loop {
            let cursor = session.next_expected_index;
            let Some(payload) = session.received_out_of_order.get(&cursor).cloned() else {
                return Ok(flushed);
            };
            self.flush(session, &payload).await?;
            session.received_out_of_order.remove(&cursor);
            session.buffered_bytes -= payload.len();
            flushed = true;
        }
    }
}
