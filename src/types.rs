//! Core types and events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Provider message identifier, monotonic within a chat
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order in which history is walked
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Ascending ids, oldest message first
    OldestFirst,
    /// Descending ids, newest message first (default)
    #[default]
    NewestFirst,
}

impl Direction {
    /// True if `candidate` lies strictly beyond `cursor` when walking in this direction
    pub fn is_beyond(self, candidate: MessageId, cursor: MessageId) -> bool {
        match self {
            Direction::OldestFirst => candidate > cursor,
            Direction::NewestFirst => candidate < cursor,
        }
    }

    /// Wire form used by the history gateway
    pub fn as_order(self) -> &'static str {
        match self {
            Direction::OldestFirst => "asc",
            Direction::NewestFirst => "desc",
        }
    }
}

/// Chat to export: numeric id, `@username`, or invite link
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatTarget(pub String);

impl fmt::Display for ChatTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A chat resolved by the provider
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    /// Provider chat id
    pub id: i64,
    /// Display title, when the provider exposes one
    #[serde(default)]
    pub title: Option<String>,
}

/// The account the export runs as
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Provider user id
    pub id: i64,
    /// Username without the leading `@`
    #[serde(default)]
    pub username: Option<String>,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.username {
            Some(name) => write!(f, "@{name}"),
            None => write!(f, "@{}", self.id),
        }
    }
}

/// Message author
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    /// Provider user or channel id
    pub id: Option<i64>,
    /// Username without the leading `@`
    pub username: Option<String>,
    /// First name
    pub first_name: Option<String>,
    /// Last name
    pub last_name: Option<String>,
}

/// Kind of remote binary content
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    /// Compressed photo
    Photo,
    /// Video or animation
    Video,
    /// Any other file
    Document,
}

impl AttachmentKind {
    /// Name used as the media filename prefix
    pub fn as_str(self) -> &'static str {
        match self {
            AttachmentKind::Photo => "photo",
            AttachmentKind::Video => "video",
            AttachmentKind::Document => "document",
        }
    }

    /// Extension used when the provider gives no better hint
    pub fn default_extension(self) -> &'static str {
        match self {
            AttachmentKind::Photo => "jpg",
            AttachmentKind::Video => "mp4",
            AttachmentKind::Document => "bin",
        }
    }
}

/// Reference to remote binary content; resolved on demand
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    /// Photo, video or document
    pub kind: AttachmentKind,
    /// Stable provider identity of the content
    pub id: String,
    /// Opaque handle used to download the bytes
    pub handle: String,
    /// Size in bytes, if the provider knows it
    #[serde(default)]
    pub size: Option<u64>,
    /// Original file name, if any
    #[serde(default)]
    pub file_name: Option<String>,
    /// MIME type, if any
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// Aggregated reactions on a message
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reactions {
    /// Sum of all reaction counts, when the provider reports counts
    pub total: Option<u64>,
    /// Recent reactions: emoji, or `custom:<document_id>` for custom ones
    pub recent: Vec<Option<String>>,
}

/// One message as produced by the provider; never mutated after creation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Provider message id
    pub id: MessageId,
    /// Chat the message belongs to
    pub chat_id: Option<i64>,
    /// Author
    #[serde(default)]
    pub sender: Sender,
    /// Send time
    pub date: Option<DateTime<Utc>>,
    /// Body text
    #[serde(default)]
    pub text: Option<String>,
    /// Id of the message this one replies to
    #[serde(default)]
    pub reply_to: Option<MessageId>,
    /// View counter (channels)
    #[serde(default)]
    pub views: Option<u64>,
    /// Forward counter (channels)
    #[serde(default)]
    pub forwards: Option<u64>,
    /// Reactions
    #[serde(default)]
    pub reactions: Option<Reactions>,
    /// Attached media, at most one
    #[serde(default)]
    pub attachment: Option<AttachmentRef>,
    /// Provider-specific fields preserved opaquely
    #[serde(default)]
    pub raw: serde_json::Map<String, serde_json::Value>,
}

impl Message {
    /// Minimal text message, mostly useful for tests and in-memory sources
    pub fn text(id: i64, body: impl Into<String>) -> Self {
        Self {
            id: MessageId(id),
            chat_id: None,
            sender: Sender::default(),
            date: None,
            text: Some(body.into()),
            reply_to: None,
            views: None,
            forwards: None,
            reactions: None,
            attachment: None,
            raw: serde_json::Map::new(),
        }
    }

    /// Attach media to the message
    #[must_use]
    pub fn with_attachment(mut self, attachment: AttachmentRef) -> Self {
        self.attachment = Some(attachment);
        self
    }
}

/// Result of resolving an attachment to local storage
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MediaOutcome {
    /// Bytes were fetched and written to this path
    Saved(PathBuf),
    /// A complete file already existed at this path; nothing was fetched
    Reused(PathBuf),
    /// The attachment could not be resolved
    Failed(String),
}

/// Line written to the export file for one message
///
/// Timestamps are RFC 3339 strings in UTC.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportedRecord {
    /// Message id
    pub id: MessageId,
    /// Send time (RFC 3339, UTC)
    pub date: Option<String>,
    /// Chat id
    pub chat_id: Option<i64>,
    /// Author id
    pub sender_id: Option<i64>,
    /// Author username
    pub sender_username: Option<String>,
    /// Author first name
    pub sender_first_name: Option<String>,
    /// Author last name
    pub sender_last_name: Option<String>,
    /// Body text
    pub message: Option<String>,
    /// Replied-to message id
    pub reply_to_msg_id: Option<MessageId>,
    /// View counter
    pub views: Option<u64>,
    /// Forward counter
    pub forwards: Option<u64>,
    /// Reactions
    pub reactions: Option<Reactions>,
    /// Whether the message carried an attachment
    pub media: bool,
    /// Local path of the downloaded attachment, null when absent or failed
    pub media_path: Option<String>,
    /// Failure marker: why the attachment could not be downloaded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_error: Option<String>,
    /// Provider-specific passthrough fields
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub raw: serde_json::Map<String, serde_json::Value>,
}

impl ExportedRecord {
    /// Normalize a message, folding in the attachment outcome if one was attempted
    pub fn from_message(message: &Message, media: Option<&MediaOutcome>) -> Self {
        let (media_path, media_error) = match media {
            Some(MediaOutcome::Saved(path)) | Some(MediaOutcome::Reused(path)) => {
                (Some(path.display().to_string()), None)
            }
            Some(MediaOutcome::Failed(reason)) => (None, Some(reason.clone())),
            None => (None, None),
        };

        Self {
            id: message.id,
            date: message.date.map(|d| d.to_rfc3339()),
            chat_id: message.chat_id,
            sender_id: message.sender.id,
            sender_username: message.sender.username.clone(),
            sender_first_name: message.sender.first_name.clone(),
            sender_last_name: message.sender.last_name.clone(),
            message: message.text.clone(),
            reply_to_msg_id: message.reply_to,
            views: message.views,
            forwards: message.forwards,
            reactions: message.reactions.clone(),
            media: message.attachment.is_some(),
            media_path,
            media_error,
            raw: message.raw.clone(),
        }
    }
}

/// Why a run stopped before the stream was exhausted
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum PartialReason {
    /// Provider throttling kept escalating past the configured limit
    ThrottleEscalated {
        /// Number of escalated flood waits seen in a row
        escalations: u32,
        /// Last wait the provider asked for
        #[serde(with = "crate::config::duration_serde")]
        last_wait: Duration,
    },
    /// Provider kept asking to wait without letting a message through
    ThrottleStalled {
        /// Flood waits seen in a row
        waits: u32,
        /// Last wait the provider asked for
        #[serde(with = "crate::config::duration_serde")]
        last_wait: Duration,
    },
    /// The user interrupted the export
    Cancelled,
}

/// Final state of a run that did not hit a fatal error
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ExportOutcome {
    /// Every requested message was exported
    #[default]
    Complete,
    /// The run stopped early; what was written is intact
    Partial(PartialReason),
}

/// What a run produced
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSummary {
    /// Complete or partial
    pub outcome: ExportOutcome,
    /// Records written
    pub exported: u64,
    /// Last message id written, the boundary for a resumed run
    pub last_id: Option<MessageId>,
    /// Messages the provider returned in unusable form and that were skipped
    pub skipped: u64,
    /// Attachments fetched during this run
    pub media_saved: u64,
    /// Attachments already present on disk
    pub media_reused: u64,
    /// Attachments that could not be fetched
    pub media_failed: u64,
    /// Provider flood waits absorbed
    pub throttle_waits: u64,
    /// Output files in write order
    pub files: Vec<PathBuf>,
    /// Account the export ran as
    pub account: Option<Identity>,
}

impl ExportSummary {
    /// True if the run stopped early
    pub fn is_partial(&self) -> bool {
        matches!(self.outcome, ExportOutcome::Partial(_))
    }
}

/// Why the pipeline is pausing
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// Fixed per-message delay and/or periodic pause
    Pacing,
    /// Provider flood wait
    FloodWait,
}

/// Progress events published while an export runs
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExportEvent {
    /// Chat resolved, export starting
    Started {
        /// Resolved chat
        chat: Chat,
        /// Expected number of messages, if known
        total: Option<u64>,
    },
    /// A record was written
    Exported {
        /// Id of the record
        id: MessageId,
        /// Records written so far
        count: u64,
    },
    /// A message was skipped
    Skipped {
        /// Id of the skipped message
        id: MessageId,
        /// Why
        reason: String,
    },
    /// Attachment download failed; record exported with a failure marker
    MediaFailed {
        /// Owning message
        id: MessageId,
        /// Failure marker
        error: String,
    },
    /// Pipeline is pausing
    Paused {
        /// Why
        reason: PauseReason,
        /// How long
        #[serde(with = "crate::config::duration_serde")]
        duration: Duration,
    },
    /// A batch file was completed and closed
    FileRotated {
        /// The closed file
        path: PathBuf,
    },
    /// Run finished (complete or partial)
    Finished {
        /// Final summary
        summary: ExportSummary,
    },
}
