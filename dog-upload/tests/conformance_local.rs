use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tempfile::TempDir;

use dog_upload::{
    ChunkOutcome, ChunkResponse, ChunkStatus, ChunkUploadService, CompletedUpload, CompletionListener,
    IncomingChunk, LocalFsStore, UploadConfig, UploadError, UploadId, ValidationError,
};

/// Test factory functions
async fn create_test_service(root: &Path, config: UploadConfig) -> ChunkUploadService {
    let store = LocalFsStore::open(root).await.unwrap();
    ChunkUploadService::new(store, config)
}

fn staging_files(root: &Path) -> usize {
    std::fs::read_dir(root.join("staging")).unwrap().count()
}

fn public_files(root: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(root.join("public"))
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn completed(outcome: ChunkOutcome) -> CompletedUpload {
    match outcome {
        ChunkOutcome::Completed(upload) => upload,
        other => panic!("expected completion, got {other:?}"),
    }
}

/// C1. Out-Of-Order Chunks Assemble In Index Order
#[tokio::test]
async fn test_three_chunks_out_of_order() {
    let dir = TempDir::new().unwrap();
    let service = create_test_service(dir.path(), UploadConfig::default()).await;

    // Act: 1, 0, 2
    let first = service
        .submit_chunk(IncomingChunk::new("u1", 1, 3, "B").with_target_name("movie.mp4"))
        .await
        .unwrap();
    let second = service.submit_chunk(IncomingChunk::new("u1", 0, 3, "A")).await.unwrap();
    let third = service.submit_chunk(IncomingChunk::new("u1", 2, 3, "C")).await.unwrap();

    // Assert
    assert_eq!(first.status(), ChunkStatus::ChunkReceived);
    assert!(matches!(second, ChunkOutcome::ChunkReceived { next_expected_index: 2, .. }));
    let upload = completed(third);
    assert_eq!(upload.public_ref, "/uploads/video/movie.mp4");
    assert_eq!(upload.byte_count, 3);

    assert_eq!(std::fs::read(dir.path().join("public/movie.mp4")).unwrap(), b"ABC");
    assert_eq!(staging_files(dir.path()), 0);
}

/// C2. Resubmitting After Completion Is A Duplicate
#[tokio::test]
async fn test_duplicate_after_completion() {
    let dir = TempDir::new().unwrap();
    let service = create_test_service(dir.path(), UploadConfig::default()).await;

    for (index, payload) in ["A", "B", "C"].into_iter().enumerate() {
        service
            .submit_chunk(IncomingChunk::new("u1", index as u32, 3, payload))
            .await
            .unwrap();
    }

    let again = service.submit_chunk(IncomingChunk::new("u1", 0, 3, "A")).await.unwrap();
    assert_eq!(again.status(), ChunkStatus::DuplicateIgnored);
    assert_eq!(std::fs::read(dir.path().join("public/upload")).unwrap(), b"ABC");
    assert_eq!(public_files(dir.path()), vec!["upload".to_string()]);
}

/// C3. Reversed Delivery
#[tokio::test]
async fn test_reversed_order() {
    let dir = TempDir::new().unwrap();
    let service = create_test_service(dir.path(), UploadConfig::default()).await;
    let total = 10u32;

    let mut last = None;
    for index in (0..total).rev() {
        last = Some(
            service
                .submit_chunk(IncomingChunk::new("rev", index, total, format!("[{index}]")))
                .await
                .unwrap(),
        );
    }

    let upload = completed(last.unwrap());
    let expected: String = (0..total).map(|i| format!("[{i}]")).collect();
    assert_eq!(std::fs::read_to_string(dir.path().join("public/upload")).unwrap(), expected);
    assert_eq!(upload.byte_count, expected.len() as u64);
}

/// C4. Concurrent Chunks Share One Session
#[tokio::test]
async fn test_concurrent_chunks_produce_one_artifact() {
    let dir = TempDir::new().unwrap();
    let service = Arc::new(create_test_service(dir.path(), UploadConfig::default()).await);
    let total = 8u32;

    // Every chunk is sent twice, all at once.
    let submissions = (0..total).chain(0..total).map(|index| {
        let service = service.clone();
        async move {
            service
                .submit_chunk(IncomingChunk::new("race", index, total, vec![b'a' + index as u8]))
                .await
        }
    });
    let outcomes = futures::future::join_all(submissions).await;

    let completions = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, Ok(ChunkOutcome::Completed(_))))
        .count();
    assert_eq!(completions, 1);
    assert!(outcomes.iter().all(|outcome| outcome.is_ok()));
    assert_eq!(public_files(dir.path()), vec!["upload".to_string()]);
    assert_eq!(std::fs::read(dir.path().join("public/upload")).unwrap(), b"abcdefgh");
    assert_eq!(staging_files(dir.path()), 0);
}

/// C5. A Different Declared Total Fails The Session
#[tokio::test]
async fn test_changed_total_is_rejected() {
    let dir = TempDir::new().unwrap();
    let service = create_test_service(dir.path(), UploadConfig::default()).await;

    service.submit_chunk(IncomingChunk::new("u1", 0, 3, "A")).await.unwrap();
    let err = service
        .submit_chunk(IncomingChunk::new("u1", 1, 4, "B"))
        .await
        .unwrap_err();

    assert!(matches!(err, UploadError::Protocol { .. }));
    assert!(!err.is_retryable());
    assert!(service.session_status(&UploadId::from("u1")).await.is_none());
    assert_eq!(staging_files(dir.path()), 0);
    assert!(public_files(dir.path()).is_empty());
}

/// C6. An Index Beyond The Declared Total Is Invalid
#[tokio::test]
async fn test_index_beyond_total_is_rejected() {
    let dir = TempDir::new().unwrap();
    let service = create_test_service(dir.path(), UploadConfig::default()).await;

    service.submit_chunk(IncomingChunk::new("u1", 0, 2, "A")).await.unwrap();
    let err = service
        .submit_chunk(IncomingChunk::new("u1", 2, 2, "Z"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        UploadError::Validation(ValidationError::IndexOutOfRange { index: 2, total: 2 })
    ));
    let status = service.session_status(&UploadId::from("u1")).await.unwrap();
    assert_eq!(status.next_expected_index, 1);
    assert_eq!(status.staged_bytes, 1);
}

/// C7. Idle Sessions Expire Without Leaving Staging
#[tokio::test]
async fn test_idle_session_expires() {
    let dir = TempDir::new().unwrap();
    let config = UploadConfig::default().with_idle_timeout(Duration::ZERO);
    let service = create_test_service(dir.path(), config).await;

    service.submit_chunk(IncomingChunk::new("u1", 0, 3, "A")).await.unwrap();
    assert_eq!(staging_files(dir.path()), 1);

    let report = service.reaper().reap_once().await.unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(staging_files(dir.path()), 0);
    assert!(service.session_status(&UploadId::from("u1")).await.is_none());

    // A late chunk starts over.
    let outcome = service.submit_chunk(IncomingChunk::new("u1", 1, 3, "B")).await.unwrap();
    assert!(matches!(outcome, ChunkOutcome::ChunkReceived { next_expected_index: 0, .. }));
}

/// C8. Same Filename Hints Never Collide
#[tokio::test]
async fn test_same_filename_gets_distinct_names() {
    let dir = TempDir::new().unwrap();
    let service = create_test_service(dir.path(), UploadConfig::default()).await;

    let a = service
        .submit_chunk(IncomingChunk::new("a", 0, 1, "first").with_target_name("clip.mp4"))
        .await
        .unwrap();
    let b = service
        .submit_chunk(IncomingChunk::new("b", 0, 1, "second").with_target_name("clip.mp4"))
        .await
        .unwrap();

    assert_eq!(completed(a).public_name, "clip.mp4");
    assert_eq!(completed(b).public_name, "clip-1.mp4");
    assert_eq!(std::fs::read(dir.path().join("public/clip.mp4")).unwrap(), b"first");
    assert_eq!(std::fs::read(dir.path().join("public/clip-1.mp4")).unwrap(), b"second");
}

/// C9. Path Traversal Hints Stay Inside The Public Directory
#[tokio::test]
async fn test_path_traversal_hint_is_neutralized() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("root");
    let service = create_test_service(&root, UploadConfig::default()).await;

    let outcome = service
        .submit_chunk(IncomingChunk::new("evil", 0, 1, "x").with_target_name("../../etc/passwd"))
        .await
        .unwrap();

    let upload = completed(outcome);
    assert_eq!(upload.public_ref, "/uploads/video/passwd");
    assert_eq!(public_files(&root), vec!["passwd".to_string()]);
    assert!(!dir.path().join("etc").exists());
}

/// C10. Published Artifacts Read Back As A Stream
#[tokio::test]
async fn test_open_public_streams_artifact() {
    let dir = TempDir::new().unwrap();
    let service = create_test_service(dir.path(), UploadConfig::default()).await;
    let payload = vec![7u8; 200 * 1024];

    service
        .submit_chunk(IncomingChunk::new("big", 0, 1, payload.clone()).with_target_name("big.bin"))
        .await
        .unwrap();

    let mut stream = service.open_public("big.bin").await.unwrap();
    let mut read = Vec::new();
    while let Some(chunk) = stream.next().await {
        read.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(read, payload);
}

/// C11. Completion Listeners Run Once Per Upload
#[tokio::test]
async fn test_completion_listener_is_notified() {
    #[derive(Default)]
    struct MediaUrls {
        urls: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl CompletionListener for MediaUrls {
        async fn on_completed(
            &self,
            upload: &CompletedUpload,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.urls.lock().push(upload.public_ref.clone());
            Ok(())
        }
    }

    let dir = TempDir::new().unwrap();
    let listener = Arc::new(MediaUrls::default());
    let service = create_test_service(dir.path(), UploadConfig::default())
        .await
        .with_listener(listener.clone());

    service
        .submit_chunk(IncomingChunk::new("u1", 0, 2, "A").with_target_name("talk.webm"))
        .await
        .unwrap();
    service.submit_chunk(IncomingChunk::new("u1", 1, 2, "B")).await.unwrap();
    service.submit_chunk(IncomingChunk::new("u1", 1, 2, "B")).await.unwrap();

    assert_eq!(*listener.urls.lock(), vec!["/uploads/video/talk.webm".to_string()]);
}

/// C12. Corrupted Chunks Are Rejected Before Touching Storage
#[tokio::test]
async fn test_checksum_mismatch_is_rejected() {
    let dir = TempDir::new().unwrap();
    let service = create_test_service(dir.path(), UploadConfig::default()).await;

    let err = service
        .submit_chunk(
            IncomingChunk::new("u1", 0, 2, "A")
                .with_checksum("sha256:0000000000000000000000000000000000000000000000000000000000000000"),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, UploadError::Validation(ValidationError::ChecksumMismatch)));
    assert!(service.sessions().is_empty());
    assert_eq!(staging_files(dir.path()), 0);
}

/// C13. Responses Render For Any Transport
#[tokio::test]
async fn test_chunk_response_json() {
    let dir = TempDir::new().unwrap();
    let service = create_test_service(dir.path(), UploadConfig::default()).await;

    let received = service.submit_chunk(IncomingChunk::new("u1", 0, 2, "A")).await;
    let json = ChunkResponse::from_result(&received).to_json();
    assert_eq!(json["status"], "chunkReceived");
    assert_eq!(json["nextExpectedIndex"], 1);

    let done = service.submit_chunk(IncomingChunk::new("u1", 1, 2, "B")).await;
    let json = ChunkResponse::from_result(&done).to_json();
    assert_eq!(json["status"], "completed");
    assert_eq!(json["detail"], "/uploads/video/upload");
    assert_eq!(json["byteCount"], 2);

    let rejected = service.submit_chunk(IncomingChunk::new("", 0, 2, "A")).await;
    let json = ChunkResponse::from_result(&rejected).to_json();
    assert_eq!(json["status"], "rejected");
    assert_eq!(json["retryable"], false);
}
