//! Durable, append-only output of exported records
//!
//! Records are written as JSON lines. Without batching everything goes to the
//! configured output path. With a batch size, records go to
//! `<stem>_part00001.json`, `<stem>_part00002.json`, ... next to the output
//! path, and a file is never touched again once it has been rotated away from.
//!
//! Every append is synced to disk before it returns. A failed write is rolled
//! back to the previous record boundary so a file never ends in half a record.

use crate::error::{Error, Result};
use crate::types::ExportedRecord;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Path of the `index`-th (1-based) batch file for `base`
///
/// ```
/// use chat_history_dl::writer::part_path;
/// use std::path::Path;
///
/// assert_eq!(
///     part_path(Path::new("out/messages.jsonl"), 3),
///     Path::new("out/messages_part00003.json")
/// );
/// ```
pub fn part_path(base: &Path, index: u32) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "messages".to_string());
    base.with_file_name(format!("{stem}_part{index:05}.json"))
}

struct OpenFile {
    file: File,
    path: PathBuf,
    /// Bytes known to be durable; used to roll back a failed write
    committed: u64,
    records: u64,
}

impl OpenFile {
    async fn create(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;
        tracing::debug!(path = %path.display(), "Opened output file");
        Ok(Self {
            file,
            path,
            committed: 0,
            records: 0,
        })
    }

    async fn write_line(&mut self, line: &[u8]) -> Result<()> {
        let written = async {
            self.file.write_all(line).await?;
            self.file.flush().await?;
            self.file.sync_data().await
        }
        .await;

        if let Err(e) = written {
            tracing::error!(path = %self.path.display(), error = %e, "Write failed, rolling back partial record");
            if let Err(rollback) = self.file.set_len(self.committed).await {
                tracing::error!(path = %self.path.display(), error = %rollback, "Rollback failed");
            }
            return Err(Error::Io(e));
        }

        self.committed += line.len() as u64;
        self.records += 1;
        Ok(())
    }

    async fn finish(mut self) -> Result<PathBuf> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(self.path)
    }
}

/// Accumulates records into one or more rotating output files
pub struct BatchWriter {
    base: PathBuf,
    batch_size: Option<u64>,
    current: Option<OpenFile>,
    next_part: u32,
    files: Vec<PathBuf>,
    written: u64,
    closed: bool,
}

impl BatchWriter {
    /// Prepare output under `base`
    ///
    /// Parent directories are created. Without batching the output file is
    /// created immediately, so an export of zero messages still leaves one
    /// (empty) file; batch files are created on their first record.
    pub async fn create(base: impl Into<PathBuf>, batch_size: Option<u64>) -> Result<Self> {
        let base = base.into();
        if batch_size == Some(0) {
            return Err(Error::config("batch_size", "batch size must be at least 1"));
        }
        if let Some(parent) = base.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut writer = Self {
            base,
            batch_size,
            current: None,
            next_part: 1,
            files: Vec::new(),
            written: 0,
            closed: false,
        };
        if writer.batch_size.is_none() {
            writer.open_next().await?;
        }
        Ok(writer)
    }

    async fn open_next(&mut self) -> Result<()> {
        let path = match self.batch_size {
            Some(_) => {
                let path = part_path(&self.base, self.next_part);
                self.next_part += 1;
                path
            }
            None => self.base.clone(),
        };
        self.current = Some(OpenFile::create(path.clone()).await?);
        self.files.push(path);
        Ok(())
    }

    /// Write one record durably
    ///
    /// Returns the path of a batch file that was completed by this record, if any.
    pub async fn append(&mut self, record: &ExportedRecord) -> Result<Option<PathBuf>> {
        if self.closed {
            return Err(Error::Other("append on a closed writer".to_string()));
        }

        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        if self.current.is_none() {
            self.open_next().await?;
        }
        let Some(current) = self.current.as_mut() else {
            return Err(Error::Other("no output file open".to_string()));
        };
        current.write_line(&line).await?;
        self.written += 1;

        let full = self
            .batch_size
            .is_some_and(|size| current.records >= size);
        if full {
            if let Some(done) = self.current.take() {
                let path = done.finish().await?;
                tracing::info!(path = %path.display(), "Batch file complete");
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    /// Flush and close the current file; safe to call more than once
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(current) = self.current.take() {
            current.finish().await?;
        }
        Ok(())
    }

    /// Files created so far, in write order
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Records written so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// True once [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
