//! End-to-end exports into batched and unbatched output

mod common;

use chat_history_dl::{Direction, ExportOutcome, ExportPipeline, MemorySource, MessageId};
use common::{assert_monotonic, config_in, ids_in, part_files, read_records};
use std::sync::Arc;
use tempfile::tempdir;

#[tokio::test]
async fn large_history_splits_into_fixed_size_parts() {
    let dir = tempdir().unwrap();
    let mut config = config_in(dir.path());
    config.direction = Direction::OldestFirst;
    config.batch_size = Some(1000);
    let pipeline = ExportPipeline::new(Arc::new(MemorySource::with_count(2500)), config);

    let summary = pipeline.run().await.unwrap();

    assert_eq!(summary.outcome, ExportOutcome::Complete);
    assert_eq!(summary.exported, 2500);
    assert_eq!(summary.last_id, Some(MessageId(2500)));

    let parts = part_files(dir.path());
    assert_eq!(summary.files, parts);
    let names: Vec<_> = parts
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        names,
        vec![
            "messages_part00001.json",
            "messages_part00002.json",
            "messages_part00003.json"
        ]
    );

    let per_file: Vec<Vec<i64>> = parts.iter().map(|p| ids_in(p)).collect();
    assert_eq!(
        per_file.iter().map(Vec::len).collect::<Vec<_>>(),
        vec![1000, 1000, 500]
    );
    let all: Vec<i64> = per_file.concat();
    assert_monotonic(&all, false);
    assert_eq!(all.first(), Some(&1));
    assert_eq!(all.last(), Some(&2500));
    assert!(!dir.path().join("messages.jsonl").exists());
}

#[tokio::test]
async fn exact_multiple_of_batch_size_leaves_no_empty_part() {
    let dir = tempdir().unwrap();
    let mut config = config_in(dir.path());
    config.batch_size = Some(10);
    let pipeline = ExportPipeline::new(Arc::new(MemorySource::with_count(30)), config);

    let summary = pipeline.run().await.unwrap();

    assert_eq!(summary.files.len(), 3);
    assert_eq!(part_files(dir.path()).len(), 3);
    let all: Vec<i64> = summary.files.iter().flat_map(|p| ids_in(p)).collect();
    assert_monotonic(&all, true);
    assert_eq!(all.len(), 30);
}

#[tokio::test]
async fn unbatched_export_writes_one_file_newest_first() {
    let dir = tempdir().unwrap();
    let pipeline = ExportPipeline::new(
        Arc::new(MemorySource::with_count(250)),
        config_in(dir.path()),
    );

    let summary = pipeline.run().await.unwrap();

    let output = dir.path().join("messages.jsonl");
    assert_eq!(summary.files, vec![output.clone()]);
    let ids = ids_in(&output);
    assert_eq!(ids.len(), 250);
    assert_eq!(ids.first(), Some(&250));
    assert_monotonic(&ids, true);
    assert!(part_files(dir.path()).is_empty());
}

#[tokio::test]
async fn overlapping_pages_never_duplicate_records() {
    let dir = tempdir().unwrap();
    let mut config = config_in(dir.path());
    config.direction = Direction::OldestFirst;
    config.source.page_size = 25;
    let source = Arc::new(MemorySource::with_count(200));
    source.set_page_overlap(3);
    let pipeline = ExportPipeline::new(source, config);

    let summary = pipeline.run().await.unwrap();

    let ids = ids_in(&dir.path().join("messages.jsonl"));
    assert_eq!(summary.exported, 200);
    assert_eq!(ids, (1..=200).collect::<Vec<_>>());
}

#[tokio::test]
async fn empty_history_produces_empty_file() {
    let dir = tempdir().unwrap();
    let pipeline = ExportPipeline::new(Arc::new(MemorySource::new(Vec::new())), config_in(dir.path()));

    let summary = pipeline.run().await.unwrap();

    assert_eq!(summary.outcome, ExportOutcome::Complete);
    assert_eq!(summary.exported, 0);
    assert_eq!(summary.last_id, None);
    assert!(read_records(&dir.path().join("messages.jsonl")).is_empty());
}

#[tokio::test]
async fn output_directory_is_created() {
    let dir = tempdir().unwrap();
    let mut config = config_in(dir.path());
    config.output = dir.path().join("exports/nested/history.jsonl");
    config.batch_size = Some(4);
    let pipeline = ExportPipeline::new(Arc::new(MemorySource::with_count(6)), config);

    let summary = pipeline.run().await.unwrap();

    assert_eq!(
        summary.files,
        vec![
            dir.path().join("exports/nested/history_part00001.json"),
            dir.path().join("exports/nested/history_part00002.json"),
        ]
    );
}

#[tokio::test]
async fn provider_failure_keeps_written_records_intact() {
    let dir = tempdir().unwrap();
    let mut config = config_in(dir.path());
    config.direction = Direction::OldestFirst;
    config.batch_size = Some(15);
    config.source.page_size = 20;
    let source = Arc::new(MemorySource::with_count(100));
    source.fail_page_after(Some(MessageId(40)), 400, "PEER_ID_INVALID");
    let pipeline = ExportPipeline::new(source, config);

    let failure = pipeline.run().await.unwrap_err();

    assert_eq!(failure.progress.exported, 40);
    assert_eq!(failure.progress.last_id, Some(MessageId(40)));
    let all: Vec<i64> = part_files(dir.path()).iter().flat_map(|p| ids_in(p)).collect();
    assert_eq!(all, (1..=40).collect::<Vec<_>>());
    assert!(failure.to_string().contains("last id: 40"));
}
