//! # chat-history-dl
//!
//! Exports the message history of a remote chat into line-delimited JSON
//! files, with optional attachment downloads, while staying under the
//! provider's rate limits.
//!
//! ## Design
//!
//! - **Ordered** - records are written in exactly the order the provider returns them
//! - **Durable** - every record is synced before the next message is processed
//! - **Polite** - per-message and periodic pacing, flood waits slept through or escalated
//! - **Forgiving** - a failed attachment never costs the message its record
//!
//! ## Quick Start
//!
//! ```no_run
//! use chat_history_dl::{ExportConfig, ExportPipeline, HttpSource};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = ExportConfig::new("@rustlang");
//!     config.batch_size = Some(1000);
//!     config.apply_env()?;
//!
//!     let source = Arc::new(HttpSource::new(&config.source)?);
//!     let pipeline = ExportPipeline::new(source, config);
//!
//!     let summary = pipeline.run().await?;
//!     println!("exported {} messages", summary.exported);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Attachment downloads
pub mod media;
/// Export orchestration
pub mod pipeline;
/// Retry logic with exponential backoff
pub mod retry;
/// Remote history providers
pub mod source;
/// Pacing and flood-wait handling
pub mod throttle;
/// Core types and events
pub mod types;
/// Batched record output
pub mod writer;

// Re-export commonly used types
pub use config::{AuthMode, ExportConfig, PacingConfig, RetryConfig, SourceConfig};
pub use error::{Error, ErrorClass, ExportFailure, Result};
pub use media::MediaFetcher;
pub use pipeline::ExportPipeline;
pub use source::{HttpSource, MemorySource, MessageStream, RemoteSource};
pub use throttle::{ThrottleController, ThrottleDecision, ThrottlePhase};
pub use types::{
    AttachmentKind, AttachmentRef, Chat, ChatTarget, Direction, ExportEvent, ExportOutcome,
    ExportSummary, ExportedRecord, Identity, MediaOutcome, Message, MessageId, PartialReason,
};
pub use writer::BatchWriter;

use tokio_util::sync::CancellationToken;

/// Cancel `token` when the process receives a termination signal.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// The pipeline then stops at the next message boundary with a partial summary.
pub async fn cancel_on_signal(token: CancellationToken) {
    tokio::select! {
        _ = wait_for_signal() => token.cancel(),
        _ = token.cancelled() => {}
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal registration may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal, stopping export");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C), stopping export");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Received Ctrl+C, stopping export");
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal, stopping export");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal, stopping export");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
            std::future::pending::<()>().await;
        }
    }
}
