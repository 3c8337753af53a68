//! # dog-upload: Chunked upload assembly for DogRS
//!
//! `dog-upload` reassembles large files that arrive as independently delivered
//! chunks into a single durable artifact, and publishes it under a public name
//! only once every chunk is in place.
//!
//! ## Key Features
//!
//! - **Order tolerant**: out-of-order chunks are buffered (bounded) until the cursor reaches them
//! - **Idempotent**: retried chunks are acknowledged as duplicates, never appended twice
//! - **Atomic publish**: the public name appears only when the artifact is complete, and never clobbers
//! - **Self-cleaning**: an idle-session reaper removes abandoned staging artifacts
//! - **Storage agnostic**: local filesystem and in-memory backends, or bring your own `StagingStore`
//! - **Server agnostic**: no HTTP coupling; `ChunkResponse` renders results for any transport
//!
//! ## Quick Start
//!
//! ```rust
//! use dog_upload::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() -> UploadResult<()> {
//! let uploads = ChunkUploadService::new(MemoryStagingStore::new(), UploadConfig::default());
//!
//! // Chunks may arrive in any order; the first one names the upload.
//! uploads
//!     .submit_chunk(IncomingChunk::new("u1", 1, 3, "B").with_target_name("clip.mp4"))
//!     .await?;
//! uploads.submit_chunk(IncomingChunk::new("u1", 0, 3, "A")).await?;
//! let outcome = uploads.submit_chunk(IncomingChunk::new("u1", 2, 3, "C")).await?;
//!
//! let response = ChunkResponse::from_outcome(&outcome);
//! assert_eq!(response.status, ChunkStatus::Completed);
//! assert_eq!(response.detail, "/uploads/video/clip.mp4");
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────┐
//! │ Transport handler  │  ← HTTP, gRPC, CLI...
//! ├────────────────────┤
//! │ ChunkUploadService │  ← validate, resolve session, assemble, finalize
//! ├────────────────────┤
//! │ StagingStore       │  ← append / promote / discard primitives
//! └────────────────────┘
//! ```
//!
//! Run a [`SessionReaper`] (see [`ChunkUploadService::spawn_reaper`]) so
//! abandoned uploads do not leak staging artifacts.

mod assembler;
mod config;
mod error;
mod events;
mod finalizer;
mod fs_store;
mod memory_store;
pub mod naming;
mod reaper;
mod receipt;
mod service;
mod session_store;
pub mod store;
mod types;
mod upload;
mod validator;

// Re-export main types for clean API
pub use assembler::{AssemblyResult, ChunkAssembler};
pub use config::{UploadConfig, UploadLimits, ENV_PREFIX};
pub use error::{UploadError, UploadResult, ValidationError};
pub use events::{CompletionListener, UploadEvent};
pub use finalizer::Finalizer;
pub use fs_store::LocalFsStore;
pub use memory_store::MemoryStagingStore;
pub use reaper::{ReapReport, ReaperHandle, SessionReaper};
pub use receipt::{ChunkOutcome, ChunkResponse, ChunkStatus, CompletedUpload, FinalizeResult};
pub use service::ChunkUploadService;
pub use session_store::{NameReservations, SessionHandle, UploadSessionStore};
pub use store::{Promotion, StagingHandle, StagingStore};
pub use types::{ByteStream, IncomingChunk, SessionState, SessionToken, UploadId, UploadIdentity};
pub use upload::{SessionStatus, UploadSession};
pub use validator::ChunkValidator;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        ChunkOutcome, ChunkResponse, ChunkStatus, ChunkUploadService, CompletedUpload, CompletionListener,
        IncomingChunk, LocalFsStore, MemoryStagingStore, UploadConfig, UploadError, UploadId, UploadResult,
    };
}
