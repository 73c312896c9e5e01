//! Transcode Dispatcher Integration Tests
//!
//! Upload → dispatch → converted artifact, against a real filesystem bucket.

mod common;

use std::sync::Arc;

use tempfile::TempDir;
use voxrelay::domain::StorageEvent;
use voxrelay::storage::ObjectStore;
use voxrelay::transcode::{DispatchOutcome, Dispatcher, SkipReason};

use common::{open_bucket, FailingTranscoder, PrefixTranscoder};

#[tokio::test]
async fn test_webm_upload_is_transcoded_to_ogg() {
    let temp = TempDir::new().unwrap();
    let bucket = open_bucket(&temp).await;
    let transcoder = Arc::new(PrefixTranscoder::default());
    let dispatcher = Dispatcher::new(bucket.clone(), transcoder.clone())
        .with_scratch_root(temp.path().join("scratch"));

    bucket
        .put_bytes("acme/voice-notes/note1.webm", b"webm-bytes", "audio/webm")
        .await
        .unwrap();

    let event = StorageEvent::new(bucket.bucket(), "acme/voice-notes/note1.webm", "audio/webm");
    let outcome = dispatcher.dispatch(&event).await;

    match &outcome {
        DispatchOutcome::Transcoded(converted) => {
            assert_eq!(converted.path, "acme/voice-notes/converted/note1.ogg");
            assert_eq!(converted.source_path, "acme/voice-notes/note1.webm");
        }
        other => panic!("expected transcode, got {:?}", other),
    }
    assert_eq!(transcoder.calls(), 1);

    let meta = bucket
        .metadata("acme/voice-notes/converted/note1.ogg")
        .await
        .unwrap();
    assert_eq!(meta.content_type, "audio/ogg");
    assert_eq!(
        bucket
            .get_bytes("acme/voice-notes/converted/note1.ogg")
            .await
            .unwrap(),
        b"OggSwebm-bytes"
    );

    // Raw upload is untouched
    assert_eq!(
        bucket.get_bytes("acme/voice-notes/note1.webm").await.unwrap(),
        b"webm-bytes"
    );

    // Scratch space was released
    let leftovers = std::fs::read_dir(temp.path().join("scratch")).unwrap().count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn test_canonical_upload_is_copied_without_transcoding() {
    let temp = TempDir::new().unwrap();
    let bucket = open_bucket(&temp).await;
    let transcoder = Arc::new(PrefixTranscoder::default());
    let dispatcher = Dispatcher::new(bucket.clone(), transcoder.clone());

    let original = b"OggS\x00\x02already-opus".to_vec();
    bucket
        .put_bytes("acme/voice-notes/note2.ogg", &original, "audio/ogg")
        .await
        .unwrap();

    let event = StorageEvent::new(bucket.bucket(), "acme/voice-notes/note2.ogg", "audio/ogg; codecs=opus");

    let outcome = dispatcher.dispatch(&event).await;
    assert!(matches!(outcome, DispatchOutcome::Copied(_)), "{:?}", outcome);
    assert_eq!(
        bucket
            .get_bytes("acme/voice-notes/converted/note2.ogg")
            .await
            .unwrap(),
        original
    );

    // A redelivered upload event leaves the artifact alone
    assert_eq!(
        dispatcher.dispatch(&event).await,
        DispatchOutcome::Skipped(SkipReason::ArtifactExists)
    );
    assert_eq!(
        bucket
            .get_bytes("acme/voice-notes/converted/note2.ogg")
            .await
            .unwrap(),
        original
    );

    assert_eq!(transcoder.calls(), 0);
}

#[tokio::test]
async fn test_first_converted_artifact_wins_for_a_shared_stem() {
    let temp = TempDir::new().unwrap();
    let bucket = open_bucket(&temp).await;
    let transcoder = Arc::new(PrefixTranscoder::default());
    let dispatcher = Dispatcher::new(bucket.clone(), transcoder.clone())
        .with_scratch_root(temp.path().join("scratch"));

    bucket
        .put_bytes("acme/voice-notes/note.ogg", b"FIRST", "audio/ogg")
        .await
        .unwrap();
    let first = dispatcher
        .dispatch(&StorageEvent::new("voice-media", "acme/voice-notes/note.ogg", "audio/ogg"))
        .await;
    assert!(matches!(first, DispatchOutcome::Copied(_)), "{:?}", first);

    bucket
        .put_bytes("acme/voice-notes/note.webm", b"SECOND", "audio/webm")
        .await
        .unwrap();
    let second = dispatcher
        .dispatch(&StorageEvent::new("voice-media", "acme/voice-notes/note.webm", "audio/webm"))
        .await;
    assert_eq!(second, DispatchOutcome::Skipped(SkipReason::ArtifactExists));

    assert_eq!(
        bucket
            .get_bytes("acme/voice-notes/converted/note.ogg")
            .await
            .unwrap(),
        b"FIRST"
    );
    assert_eq!(transcoder.calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_uploads_for_one_stem_publish_once() {
    let temp = TempDir::new().unwrap();
    let bucket = open_bucket(&temp).await;
    let transcoder = Arc::new(PrefixTranscoder::default());
    let dispatcher = Arc::new(Dispatcher::new(bucket.clone(), transcoder.clone()));

    let mut tasks = Vec::new();
    for ext in ["webm", "m4a", "wav", "mp3"] {
        let path = format!("acme/voice-notes/take.{}", ext);
        bucket
            .put_bytes(&path, ext.repeat(500).as_bytes(), "audio/webm")
            .await
            .unwrap();
        let dispatcher = dispatcher.clone();
        tasks.push(tokio::spawn(async move {
            dispatcher
                .dispatch(&StorageEvent::new("voice-media", path, "audio/webm"))
                .await
        }));
    }

    let mut published = 0;
    for task in tasks {
        match task.await.unwrap() {
            DispatchOutcome::Transcoded(_) => published += 1,
            DispatchOutcome::Skipped(SkipReason::ArtifactExists) => {}
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    assert_eq!(published, 1);

    // Exactly one writer's output, never a mix
    let artifact = bucket
        .get_bytes("acme/voice-notes/converted/take.ogg")
        .await
        .unwrap();
    let body = String::from_utf8(artifact[4..].to_vec()).unwrap();
    assert!(
        ["webm", "m4a", "wav", "mp3"]
            .iter()
            .any(|ext| body == ext.repeat(500)),
        "mixed artifact"
    );
}

#[tokio::test]
async fn test_converted_artifact_event_is_a_no_op() {
    let temp = TempDir::new().unwrap();
    let bucket = open_bucket(&temp).await;
    let transcoder = Arc::new(PrefixTranscoder::default());
    let dispatcher = Dispatcher::new(bucket.clone(), transcoder.clone());

    bucket
        .put_bytes("acme/voice-notes/note1.webm", b"raw", "audio/webm")
        .await
        .unwrap();
    let first = dispatcher
        .dispatch(&StorageEvent::new("voice-media", "acme/voice-notes/note1.webm", "audio/webm"))
        .await;
    assert!(first.produced_artifact());
    let before = bucket
        .get_bytes("acme/voice-notes/converted/note1.ogg")
        .await
        .unwrap();

    // Writing the artifact re-triggers the dispatcher on the converted path
    let echo = StorageEvent::new("voice-media", "acme/voice-notes/converted/note1.ogg", "audio/ogg");
    assert_eq!(
        dispatcher.dispatch(&echo).await,
        DispatchOutcome::Skipped(SkipReason::AlreadyConverted)
    );

    assert_eq!(transcoder.calls(), 1);
    assert_eq!(
        bucket
            .get_bytes("acme/voice-notes/converted/note1.ogg")
            .await
            .unwrap(),
        before
    );
    assert!(!bucket
        .exists("acme/voice-notes/converted/converted/note1.ogg")
        .await
        .unwrap());
}

#[tokio::test]
async fn test_failed_transcode_leaves_no_artifact() {
    let temp = TempDir::new().unwrap();
    let bucket = open_bucket(&temp).await;
    let dispatcher = Dispatcher::new(bucket.clone(), Arc::new(FailingTranscoder))
        .with_scratch_root(temp.path().join("scratch"));

    bucket
        .put_bytes("acme/voice-notes/broken.m4a", b"not audio", "audio/mp4")
        .await
        .unwrap();

    let outcome = dispatcher
        .dispatch(&StorageEvent::new("voice-media", "acme/voice-notes/broken.m4a", "audio/mp4"))
        .await;

    match outcome {
        DispatchOutcome::Failed(message) => assert!(message.contains("exit code 1")),
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(!bucket
        .exists("acme/voice-notes/converted/broken.ogg")
        .await
        .unwrap());
    assert_eq!(
        std::fs::read_dir(temp.path().join("scratch")).unwrap().count(),
        0
    );
}

#[tokio::test]
async fn test_parallel_dispatch_of_distinct_uploads() {
    let temp = TempDir::new().unwrap();
    let bucket = open_bucket(&temp).await;
    let transcoder = Arc::new(PrefixTranscoder::default());
    let dispatcher = Arc::new(Dispatcher::new(bucket.clone(), transcoder.clone()));

    let mut tasks = Vec::new();
    for i in 0..8 {
        let path = format!("tenant{}/voice-notes/clip.webm", i % 4);
        let path = if i >= 4 { path.replace("clip", "clip-b") } else { path };
        bucket
            .put_bytes(&path, format!("clip {}", i).as_bytes(), "audio/webm")
            .await
            .unwrap();

        let dispatcher = dispatcher.clone();
        tasks.push(tokio::spawn(async move {
            dispatcher
                .dispatch(&StorageEvent::new("voice-media", path, "audio/webm"))
                .await
        }));
    }

    for task in tasks {
        assert!(task.await.unwrap().produced_artifact());
    }
    assert_eq!(transcoder.calls(), 8);

    for tenant in 0..4 {
        for stem in ["clip", "clip-b"] {
            let converted = format!("tenant{}/voice-notes/converted/{}.ogg", tenant, stem);
            assert!(bucket.exists(&converted).await.unwrap(), "{}", converted);
        }
    }
}
