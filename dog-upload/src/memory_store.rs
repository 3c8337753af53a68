use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::{ByteStream, Promotion, SessionToken, StagingHandle, StagingStore, UploadError, UploadResult};

#[derive(Default)]
struct Namespaces {
    staging: HashMap<String, Vec<u8>>,
    public: HashMap<String, Bytes>,
}

/// In-memory store for testing and development.
///
/// Supports fault injection so failure paths can be exercised
/// deterministically.
#[derive(Clone, Default)]
pub struct MemoryStagingStore {
    namespaces: Arc<Mutex<Namespaces>>,
    fail_appends: Arc<AtomicBool>,
    failing_promotions: Arc<AtomicU32>,
    failing_discards: Arc<AtomicU32>,
    failing_unlinks: Arc<AtomicU32>,
}

impl MemoryStagingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every append fail until switched off
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Make the next `count` promotions fail
    pub fn fail_next_promotions(&self, count: u32) {
        self.failing_promotions.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` promotions publish but leave staging behind
    pub fn fail_next_unlinks(&self, count: u32) {
        self.failing_unlinks.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` discards fail
    pub fn fail_next_discards(&self, count: u32) {
        self.failing_discards.store(count, Ordering::SeqCst);
    }

    /// Place an artifact directly in the public namespace
    pub fn insert_public<B: Into<Bytes>>(&self, name: &str, data: B) {
        self.namespaces.lock().public.insert(name.to_string(), data.into());
    }

    /// Bytes of a public artifact
    pub fn public_bytes(&self, name: &str) -> Option<Bytes> {
        self.namespaces.lock().public.get(name).cloned()
    }

    /// Bytes of a staging artifact
    pub fn staging_bytes(&self, staging: &StagingHandle) -> Option<Vec<u8>> {
        self.namespaces.lock().staging.get(&staging.location).cloned()
    }

    /// Number of staging artifacts currently held
    pub fn staging_count(&self) -> usize {
        self.namespaces.lock().staging.len()
    }

    /// Number of public artifacts currently held
    pub fn public_count(&self) -> usize {
        self.namespaces.lock().public.len()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn injected(what: &str) -> UploadError {
        UploadError::storage(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("injected {what} failure"),
        ))
    }
}

#[async_trait]
impl StagingStore for MemoryStagingStore {
    fn staging_handle(&self, token: &SessionToken) -> StagingHandle {
        StagingHandle {
            token: token.clone(),
            location: format!("staging/{}", token.as_str()),
        }
    }

    async fn append(&self, staging: &StagingHandle, offset: u64, data: &[u8]) -> UploadResult<u64> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(Self::injected("append"));
        }

        let mut namespaces = self.namespaces.lock();
        let artifact = namespaces.staging.entry(staging.location.clone()).or_default();
        let offset_len = offset as usize;
        if artifact.len() < offset_len {
            return Err(UploadError::storage(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("staging holds {} bytes, expected {}", artifact.len(), offset),
            )));
        }
        artifact.truncate(offset_len);
        artifact.extend_from_slice(data);
        Ok(artifact.len() as u64)
    }

    async fn discard(&self, staging: &StagingHandle) -> UploadResult<()> {
        if Self::take_failure(&self.failing_discards) {
            return Err(Self::injected("discard"));
        }
        self.namespaces.lock().staging.remove(&staging.location);
        Ok(())
    }

    async fn staging_len(&self, staging: &StagingHandle) -> UploadResult<Option<u64>> {
        Ok(self
            .namespaces
            .lock()
            .staging
            .get(&staging.location)
            .map(|a| a.len() as u64))
    }

    async fn public_exists(&self, name: &str) -> UploadResult<bool> {
        Ok(self.namespaces.lock().public.contains_key(name))
    }

    async fn promote(&self, staging: &StagingHandle, name: &str) -> UploadResult<Promotion> {
        if Self::take_failure(&self.failing_promotions) {
            return Err(Self::injected("promote"));
        }

        let mut namespaces = self.namespaces.lock();
        if namespaces.public.contains_key(name) {
            return Ok(Promotion::NameTaken);
        }
        let artifact = namespaces.staging.get(&staging.location).cloned().ok_or_else(|| {
            UploadError::storage(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("staging artifact {} is missing", staging.location),
            ))
        })?;
        let staging_left = Self::take_failure(&self.failing_unlinks);
        if !staging_left {
            namespaces.staging.remove(&staging.location);
        }
        let byte_count = artifact.len() as u64;
        namespaces.public.insert(name.to_string(), Bytes::from(artifact));
        Ok(Promotion::Promoted {
            byte_count,
            staging_left,
        })
    }

    async fn open_public(&self, name: &str) -> UploadResult<ByteStream> {
        let data = self.public_bytes(name).ok_or_else(|| {
            UploadError::storage(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("public artifact {name} not found"),
            ))
        })?;
        let stream = async_stream::stream! {
            yield Ok::<Bytes, std::io::Error>(data);
        };
        Ok(Box::pin(stream))
    }
}
