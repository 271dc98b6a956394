//! Attachment download into the media directory
//!
//! File names are derived from the attachment kind and provider identity
//! (`<kind>_<id>.<ext>`), so re-running an export into the same directory
//! does not fetch anything that is already there. Bytes are written to a
//! `.part` file and renamed into place, which means a file under its final
//! name is always complete; a leftover `.part` file is simply fetched again.

use crate::config::RetryConfig;
use crate::error::{Error, ErrorClass, Result};
use crate::retry;
use crate::source::RemoteSource;
use crate::types::{AttachmentRef, MediaOutcome};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// Deterministic file name for an attachment
///
/// ```
/// use chat_history_dl::media::media_file_name;
/// use chat_history_dl::types::{AttachmentKind, AttachmentRef};
///
/// let photo = AttachmentRef {
///     kind: AttachmentKind::Photo,
///     id: "5012".into(),
///     handle: "h".into(),
///     size: None,
///     file_name: None,
///     mime_type: None,
/// };
/// assert_eq!(media_file_name(&photo), "photo_5012.jpg");
/// ```
pub fn media_file_name(attachment: &AttachmentRef) -> String {
    let id: String = attachment
        .id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "{}_{}.{}",
        attachment.kind.as_str(),
        id,
        extension_for(attachment)
    )
}

fn extension_for(attachment: &AttachmentRef) -> String {
    let from_name = attachment
        .file_name
        .as_deref()
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()));
    if let Some(ext) = from_name {
        return ext.to_ascii_lowercase();
    }

    let from_mime = attachment.mime_type.as_deref().and_then(|mime| {
        Some(match mime {
            "image/jpeg" => "jpg",
            "image/png" => "png",
            "image/gif" => "gif",
            "image/webp" => "webp",
            "video/mp4" => "mp4",
            "video/webm" => "webm",
            "video/quicktime" => "mov",
            "audio/mpeg" => "mp3",
            "audio/ogg" => "ogg",
            "application/pdf" => "pdf",
            "application/zip" => "zip",
            "text/plain" => "txt",
            _ => return None,
        })
    });

    from_mime
        .unwrap_or_else(|| attachment.kind.default_extension())
        .to_string()
}

/// Resolves attachments to files, retrying transient provider failures
pub struct MediaFetcher {
    source: Arc<dyn RemoteSource>,
    retry: RetryConfig,
}

impl MediaFetcher {
    /// Create a fetcher downloading through `source`
    pub fn new(source: Arc<dyn RemoteSource>, retry: RetryConfig) -> Self {
        Self { source, retry }
    }

    /// Path the attachment is stored at inside `dir`
    pub fn target_path(attachment: &AttachmentRef, dir: &Path) -> PathBuf {
        dir.join(media_file_name(attachment))
    }

    /// Make sure `attachment` exists under `dir`
    ///
    /// Provider failures (transient ones after the retry budget, permanent
    /// ones immediately) come back as [`MediaOutcome::Failed`] so the owning
    /// message can still be exported. Only local disk errors are returned as
    /// `Err`, since they make the whole export untrustworthy. A download
    /// shorter than the announced size is retried like a transient failure
    /// and never written.
    pub async fn fetch(&self, attachment: &AttachmentRef, dir: &Path) -> Result<MediaOutcome> {
        tokio::fs::create_dir_all(dir).await?;
        let target = Self::target_path(attachment, dir);

        if tokio::fs::try_exists(&target).await? {
            tracing::debug!(path = %target.display(), "Attachment already present, skipping download");
            return Ok(MediaOutcome::Reused(target));
        }

        let operation = format!("download {} {}", attachment.kind.as_str(), attachment.id);
        let source = Arc::clone(&self.source);
        let bytes = match retry::execute(&self.retry, &operation, || {
            let source = Arc::clone(&source);
            async move {
                let bytes = source.download_attachment(attachment).await?;
                check_complete(attachment, &bytes)?;
                Ok::<_, Error>(bytes)
            }
        })
        .await
        {
            Ok(bytes) => bytes,
            Err(e) if e.last_error.class() == ErrorClass::LocalIo => return Err(e.last_error),
            Err(e) => {
                tracing::warn!(
                    attachment = %attachment.id,
                    attempts = e.attempts,
                    error = %e.last_error,
                    "Attachment download failed"
                );
                return Ok(MediaOutcome::Failed(e.to_string()));
            }
        };

        write_atomically(&target, &bytes).await?;
        tracing::debug!(path = %target.display(), bytes = bytes.len(), "Attachment saved");
        Ok(MediaOutcome::Saved(target))
    }
}

/// A download shorter than the announced size is incomplete and is never saved
fn check_complete(attachment: &AttachmentRef, bytes: &[u8]) -> Result<()> {
    let received = bytes.len() as u64;
    match attachment.size {
        Some(expected) if received < expected => Err(Error::IncompleteDownload {
            handle: attachment.handle.clone(),
            expected,
            received,
        }),
        Some(expected) if received > expected => {
            tracing::debug!(
                attachment = %attachment.id,
                expected,
                received,
                "Attachment larger than provider estimate"
            );
            Ok(())
        }
        _ => Ok(()),
    }
}

async fn write_atomically(target: &Path, bytes: &[u8]) -> Result<()> {
    let mut partial = target.as_os_str().to_owned();
    partial.push(".part");
    let partial = PathBuf::from(partial);

    let mut file = tokio::fs::File::create(&partial).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&partial, target)
        .await
        .map_err(Error::Io)
}
