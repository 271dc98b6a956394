//! Attachment downloads during an export

mod common;

use chat_history_dl::{Direction, ExportPipeline, MemorySource, Message};
use common::{config_in, files_in, history_with_photos, photo, read_records};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn source_with_blobs(messages: Vec<Message>) -> Arc<MemorySource> {
    let handles: Vec<String> = messages
        .iter()
        .filter_map(|m| m.attachment.as_ref().map(|a| a.handle.clone()))
        .collect();
    let source = Arc::new(MemorySource::new(messages));
    for handle in handles {
        source.add_blob(&handle, handle.as_bytes().to_vec());
    }
    source
}

#[tokio::test]
async fn attachments_are_saved_next_to_their_records() {
    let dir = tempdir().unwrap();
    let media_dir = dir.path().join("media");
    let mut config = config_in(dir.path());
    config.direction = Direction::OldestFirst;
    config.media_dir = Some(media_dir.clone());
    let pipeline = ExportPipeline::new(source_with_blobs(history_with_photos(9, 3)), config);

    let summary = pipeline.run().await.unwrap();

    assert_eq!(summary.exported, 9);
    assert_eq!(summary.media_saved, 3);
    assert_eq!(
        files_in(&media_dir),
        vec![
            media_dir.join("photo_p3.jpg"),
            media_dir.join("photo_p6.jpg"),
            media_dir.join("photo_p9.jpg"),
        ]
    );
    assert_eq!(std::fs::read(media_dir.join("photo_p6.jpg")).unwrap(), b"h-p6");

    let records = read_records(&dir.path().join("messages.jsonl"));
    assert_eq!(records[2]["media"], true);
    assert_eq!(
        records[2]["media_path"],
        media_dir.join("photo_p3.jpg").display().to_string()
    );
    assert_eq!(records[0]["media"], false);
    assert!(records[0]["media_path"].is_null());
}

#[tokio::test]
async fn second_run_reuses_existing_attachments() {
    let dir = tempdir().unwrap();
    let mut config = config_in(dir.path());
    config.media_dir = Some(dir.path().join("media"));
    let source = source_with_blobs(history_with_photos(10, 2));

    let first = ExportPipeline::new(source.clone(), config.clone())
        .run()
        .await
        .unwrap();
    let second = ExportPipeline::new(source.clone(), config)
        .run()
        .await
        .unwrap();

    assert_eq!(first.media_saved, 5);
    assert_eq!(first.media_reused, 0);
    assert_eq!(second.media_saved, 0);
    assert_eq!(second.media_reused, 5);
    assert_eq!(source.download_calls("h-p4"), 1);
    assert_eq!(files_in(&dir.path().join("media")).len(), 5);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_exhaust_retries_then_mark_the_record() {
    let dir = tempdir().unwrap();
    let mut config = config_in(dir.path());
    config.media_dir = Some(dir.path().join("media"));
    config.retry.max_retries = 3;
    config.retry.initial_backoff = Duration::from_millis(100);
    let source = Arc::new(MemorySource::new(vec![
        Message::text(1, "before"),
        Message::text(2, "photo").with_attachment(photo("flaky")),
        Message::text(3, "after"),
    ]));
    source.add_blob("h-flaky", vec![1, 2, 3]);
    source.fail_downloads("h-flaky", u32::MAX);
    let pipeline = ExportPipeline::new(source.clone(), config);

    let summary = pipeline.run().await.unwrap();

    assert_eq!(source.download_calls("h-flaky"), 4);
    assert_eq!(summary.exported, 3);
    assert_eq!(summary.media_failed, 1);

    let records = read_records(&dir.path().join("messages.jsonl"));
    let flaky = records.iter().find(|r| r["id"] == 2).unwrap();
    assert_eq!(flaky["media"], true);
    assert!(flaky["media_path"].is_null());
    assert!(flaky["media_error"].as_str().unwrap().contains("media server busy"));
    assert!(files_in(&dir.path().join("media")).is_empty());
}

#[tokio::test(start_paused = true)]
async fn transient_failure_within_budget_still_saves() {
    let dir = tempdir().unwrap();
    let mut config = config_in(dir.path());
    config.media_dir = Some(dir.path().join("media"));
    let source = Arc::new(MemorySource::new(vec![
        Message::text(1, "photo").with_attachment(photo("slow")),
    ]));
    source.add_blob("h-slow", vec![9; 16]);
    source.fail_downloads("h-slow", 2);
    let pipeline = ExportPipeline::new(source.clone(), config);

    let summary = pipeline.run().await.unwrap();

    assert_eq!(source.download_calls("h-slow"), 3);
    assert_eq!(summary.media_saved, 1);
    assert_eq!(summary.media_failed, 0);
}

#[tokio::test]
async fn unavailable_attachment_is_not_retried() {
    let dir = tempdir().unwrap();
    let mut config = config_in(dir.path());
    config.media_dir = Some(dir.path().join("media"));
    let source = Arc::new(MemorySource::new(vec![
        Message::text(1, "gone").with_attachment(photo("expired")),
    ]));
    let pipeline = ExportPipeline::new(source.clone(), config);

    let summary = pipeline.run().await.unwrap();

    assert_eq!(source.download_calls("h-expired"), 1);
    assert_eq!(summary.media_failed, 1);
    assert_eq!(summary.exported, 1);
}

#[tokio::test]
async fn attachments_are_ignored_without_media_dir() {
    let dir = tempdir().unwrap();
    let source = source_with_blobs(history_with_photos(4, 1));
    let pipeline = ExportPipeline::new(source.clone(), config_in(dir.path()));

    let summary = pipeline.run().await.unwrap();

    assert_eq!(source.download_calls("h-p1"), 0);
    assert_eq!(summary.media_saved + summary.media_failed, 0);
    let records = read_records(&dir.path().join("messages.jsonl"));
    assert!(records.iter().all(|r| r["media"] == true && r["media_path"].is_null()));
}
