//! Helpers for inspecting export output

use serde_json::Value;
use std::path::{Path, PathBuf};

/// Parse every line of a JSON-lines file
pub fn read_records(path: &Path) -> Vec<Value> {
    let text = std::fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("cannot read {}: {e}", path.display()));
    text.lines()
        .map(|line| {
            serde_json::from_str(line)
                .unwrap_or_else(|e| panic!("invalid record in {}: {e}: {line}", path.display()))
        })
        .collect()
}

/// Ids of the records in `path`, in file order
pub fn ids_in(path: &Path) -> Vec<i64> {
    read_records(path)
        .iter()
        .map(|record| record["id"].as_i64().expect("record without numeric id"))
        .collect()
}

/// Part files under `dir`, sorted by name
pub fn part_files(dir: &Path) -> Vec<PathBuf> {
    let mut parts: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.into_path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.contains("_part") && n.ends_with(".json"))
        })
        .collect();
    parts.sort();
    parts
}

/// Regular files directly under `dir`, sorted by name
pub fn files_in(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

/// Panic unless `ids` strictly increase (or strictly decrease when `descending`)
pub fn assert_monotonic(ids: &[i64], descending: bool) {
    for pair in ids.windows(2) {
        let ordered = if descending {
            pair[0] > pair[1]
        } else {
            pair[0] < pair[1]
        };
        assert!(ordered, "ids out of order: {} then {}", pair[0], pair[1]);
    }
}
