//! Error types for chat-history-dl
//!
//! This module provides the error taxonomy used throughout the exporter:
//! - A single [`Error`] enum covering provider, network, local I/O and configuration failures
//! - [`ErrorClass`] which sorts every error into the handling category the pipeline acts on
//! - [`ExportFailure`] which pairs a fatal error with the progress made before the abort

use crate::types::{ExportSummary, MessageId};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for chat-history-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for chat-history-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "batch_size")
        key: Option<String>,
    },

    /// Local I/O error (output files, media directory)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error talking to the provider
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Provider asked us to back off (flood control)
    #[error("throttled by provider: retry after {}s", .wait.as_secs_f64())]
    Throttled {
        /// Wait suggested by the provider
        wait: Duration,
    },

    /// Provider returned an error response
    #[error("provider error (status {status}): {message}")]
    Provider {
        /// HTTP-like status code reported by the provider
        status: u16,
        /// Provider message
        message: String,
    },

    /// Credentials were rejected
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Target chat does not exist or is not accessible
    #[error("chat not found: {0}")]
    ChatNotFound(String),

    /// Attachment cannot be fetched (missing, corrupt handle, permission denied)
    #[error("attachment {handle} unavailable: {reason}")]
    AttachmentUnavailable {
        /// Provider handle of the attachment
        handle: String,
        /// Why the provider refused it
        reason: String,
    },

    /// Attachment download ended before the size the provider announced
    #[error("incomplete download of {handle}: got {received} of {expected} bytes")]
    IncompleteDownload {
        /// Provider handle of the attachment
        handle: String,
        /// Size announced by the provider
        expected: u64,
        /// Bytes actually received
        received: u64,
    },

    /// Provider kept returning pages without anything past the cursor
    #[error("history does not advance past message {}", display_last_id(.after.to_owned()))]
    HistoryStalled {
        /// Cursor the pages were requested after
        after: Option<MessageId>,
    },

    /// Operation timed out
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Export was cancelled by the user
    #[error("export cancelled")]
    Cancelled,

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// How the pipeline treats an error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeouts, connection resets, provider busy: retried locally
    Transient,
    /// Flood control: absorbed as a pause unless it escalates
    Throttle,
    /// Missing, corrupt or forbidden resource: recorded, never retried
    Permanent,
    /// Bad credentials, missing chat, unrecoverable provider error: aborts the run
    Fatal,
    /// Local disk failure: aborts the run
    LocalIo,
}

impl Error {
    /// Classify this error for the pipeline's propagation policy
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Throttled { .. } => ErrorClass::Throttle,
            Error::Timeout(_) | Error::IncompleteDownload { .. } => ErrorClass::Transient,
            Error::Network(e) => {
                if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Fatal
                }
            }
            Error::Provider { status, .. } => {
                if *status >= 500 || *status == 408 {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Fatal
                }
            }
            Error::AttachmentUnavailable { .. } => ErrorClass::Permanent,
            Error::Io(_) => ErrorClass::LocalIo,
            Error::AuthFailed(_)
            | Error::ChatNotFound(_)
            | Error::Config { .. }
            | Error::Serialization(_)
            | Error::HistoryStalled { .. }
            | Error::Cancelled
            | Error::Other(_) => ErrorClass::Fatal,
        }
    }

    /// Shorthand for a configuration error on a specific key
    pub fn config(key: &str, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }
}

/// A fatal abort together with everything exported before it
///
/// The progress always carries the number of records written and the last
/// exported message id so a later run can be started from that boundary.
#[derive(Debug, Error)]
#[error(
    "export aborted after {} records (last id: {}): {error}",
    .progress.exported,
    display_last_id(.progress.last_id)
)]
pub struct ExportFailure {
    /// The error that stopped the run
    #[source]
    pub error: Error,
    /// Progress made before the abort
    pub progress: ExportSummary,
}

fn display_last_id(id: Option<MessageId>) -> String {
    id.map_or_else(|| "none".to_string(), |id| id.to_string())
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_status_decides_transient_or_fatal() {
        let busy = Error::Provider {
            status: 503,
            message: "busy".into(),
        };
        let timeout = Error::Provider {
            status: 408,
            message: "request timeout".into(),
        };
        let bad_request = Error::Provider {
            status: 400,
            message: "bad request".into(),
        };
        assert_eq!(busy.class(), ErrorClass::Transient);
        assert_eq!(timeout.class(), ErrorClass::Transient);
        assert_eq!(bad_request.class(), ErrorClass::Fatal);
    }

    #[test]
    fn taxonomy_covers_throttle_permanent_and_local_io() {
        assert_eq!(
            Error::Throttled {
                wait: Duration::from_secs(5)
            }
            .class(),
            ErrorClass::Throttle
        );
        assert_eq!(
            Error::AttachmentUnavailable {
                handle: "doc-1".into(),
                reason: "gone".into()
            }
            .class(),
            ErrorClass::Permanent
        );
        assert_eq!(
            Error::Io(std::io::Error::other("disk full")).class(),
            ErrorClass::LocalIo
        );
        assert_eq!(Error::AuthFailed("bad token".into()).class(), ErrorClass::Fatal);
        assert_eq!(Error::ChatNotFound("@nope".into()).class(), ErrorClass::Fatal);
    }

    #[test]
    fn short_download_is_transient_and_stalled_history_is_fatal() {
        let short = Error::IncompleteDownload {
            handle: "h-1".into(),
            expected: 10,
            received: 4,
        };
        assert_eq!(short.class(), ErrorClass::Transient);
        assert!(short.to_string().contains("got 4 of 10 bytes"));

        let stalled = Error::HistoryStalled {
            after: Some(MessageId(10)),
        };
        assert_eq!(stalled.class(), ErrorClass::Fatal);
        assert!(stalled.to_string().contains("past message 10"));
    }

    #[test]
    fn export_failure_reports_progress() {
        let failure = ExportFailure {
            error: Error::Provider {
                status: 400,
                message: "channel private".into(),
            },
            progress: ExportSummary {
                exported: 42,
                last_id: Some(MessageId(1042)),
                ..ExportSummary::default()
            },
        };
        let text = failure.to_string();
        assert!(text.contains("42 records"), "{text}");
        assert!(text.contains("last id: 1042"), "{text}");
        assert!(text.contains("channel private"), "{text}");
    }

    #[test]
    fn export_failure_without_records_says_none() {
        let failure = ExportFailure {
            error: Error::AuthFailed("rejected".into()),
            progress: ExportSummary::default(),
        };
        assert!(failure.to_string().contains("last id: none"));
    }
}
