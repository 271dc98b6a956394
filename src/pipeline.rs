//! Export orchestration
//!
//! One run walks the remote history in the requested order and, for each
//! message: waits for the throttle controller, downloads the attachment (if a
//! media directory is configured), builds the record and appends it durably.
//! Everything happens on a single path of control so records are written in
//! exactly the order the provider returned them.

use crate::config::ExportConfig;
use crate::error::{Error, ExportFailure, Result};
use crate::media::MediaFetcher;
use crate::source::{MessageStream, PageEntry, RemoteSource};
use crate::throttle::{ThrottleController, ThrottleDecision};
use crate::types::{
    Chat, ExportEvent, ExportOutcome, ExportSummary, ExportedRecord, MediaOutcome, Message,
    PartialReason, PauseReason,
};
use crate::writer::BatchWriter;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Capacity of the progress event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Why the per-message loop stopped without a fatal error
enum LoopExit {
    Exhausted,
    Partial(PartialReason),
}

/// Exports one chat into local storage
pub struct ExportPipeline {
    source: Arc<dyn RemoteSource>,
    config: ExportConfig,
    event_tx: broadcast::Sender<ExportEvent>,
    cancel: CancellationToken,
}

impl ExportPipeline {
    /// Create a pipeline for `config` reading from `source`
    pub fn new(source: Arc<dyn RemoteSource>, config: ExportConfig) -> Self {
        let (event_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            source,
            config,
            event_tx,
            cancel: CancellationToken::new(),
        }
    }

    /// Subscribe to progress events
    pub fn subscribe(&self) -> broadcast::Receiver<ExportEvent> {
        self.event_tx.subscribe()
    }

    /// Token that stops the run at the next message boundary when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Configuration of this run
    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    fn emit(&self, event: ExportEvent) {
        self.event_tx.send(event).ok();
    }

    /// Run the export
    ///
    /// Returns a summary when the history (or the message limit) was
    /// exhausted, or when the run stopped early because of recurring flood
    /// waits or cancellation; the summary's outcome tells which. Transient
    /// page failures are retried in place with the configured retry policy.
    /// Authentication, chat resolution, provider and local I/O failures abort
    /// with an [`ExportFailure`] carrying the records written so far and the
    /// last exported id. Output files are closed on every path.
    pub async fn run(&self) -> std::result::Result<ExportSummary, ExportFailure> {
        let mut summary = ExportSummary::default();

        let chat = match self.prepare(&mut summary).await {
            Ok(chat) => chat,
            Err(error) => {
                tracing::error!(error = %error, "Export could not start");
                return Err(ExportFailure {
                    error,
                    progress: summary,
                });
            }
        };

        let mut writer =
            match BatchWriter::create(&self.config.output, self.config.batch_size).await {
                Ok(writer) => writer,
                Err(error) => {
                    return Err(ExportFailure {
                        error,
                        progress: summary,
                    });
                }
            };

        let result = self.export_messages(chat, &mut writer, &mut summary).await;
        let closed = writer.close().await;
        summary.files = writer.files().to_vec();

        let exit = match (result, closed) {
            (Ok(exit), Ok(())) => exit,
            (Err(error), _) | (Ok(_), Err(error)) => {
                tracing::error!(
                    error = %error,
                    exported = summary.exported,
                    last_id = ?summary.last_id,
                    "Export aborted"
                );
                return Err(ExportFailure {
                    error,
                    progress: summary,
                });
            }
        };

        if let LoopExit::Partial(reason) = exit {
            tracing::warn!(
                reason = ?reason,
                exported = summary.exported,
                last_id = ?summary.last_id,
                "Export stopped early"
            );
            summary.outcome = ExportOutcome::Partial(reason);
        } else {
            tracing::info!(
                exported = summary.exported,
                skipped = summary.skipped,
                media_failed = summary.media_failed,
                "Export complete"
            );
        }

        self.emit(ExportEvent::Finished {
            summary: summary.clone(),
        });
        Ok(summary)
    }

    /// Validate, log in and resolve the chat; nothing is written before this succeeds
    async fn prepare(&self, summary: &mut ExportSummary) -> Result<Chat> {
        self.config.validate()?;
        let auth = self.config.auth.as_ref().ok_or_else(|| {
            Error::config("auth", "no credentials configured (user session or bot token)")
        })?;

        let account = self.source.authenticate(auth).await?;
        tracing::info!(account = %account, "Authenticated");
        summary.account = Some(account);

        let chat = self.source.resolve_chat(&self.config.chat).await?;
        tracing::info!(chat_id = chat.id, title = ?chat.title, "Resolved chat");
        Ok(chat)
    }

    async fn export_messages(
        &self,
        chat: Chat,
        writer: &mut BatchWriter,
        summary: &mut ExportSummary,
    ) -> Result<LoopExit> {
        let total = match self.source.message_count(&chat).await {
            Ok(total) => total,
            Err(e) => {
                tracing::debug!(error = %e, "Message count unavailable");
                None
            }
        };
        let total = match (total, self.config.max_messages) {
            (Some(total), Some(max)) => Some(total.min(max)),
            (total, max) => total.or(max),
        };
        self.emit(ExportEvent::Started {
            chat: chat.clone(),
            total,
        });

        let media = self
            .config
            .media_dir
            .as_deref()
            .map(|dir| (MediaFetcher::new(Arc::clone(&self.source), self.config.retry.clone()), dir));
        let mut throttle = ThrottleController::new(self.config.pacing.clone(), self.cancel.clone());
        let mut stream = MessageStream::new(
            Arc::clone(&self.source),
            chat,
            self.config.direction,
            self.config.source.page_size,
            self.config.max_messages,
        )
        .with_retry(self.config.retry.clone());

        loop {
            if self.cancel.is_cancelled() {
                return Ok(LoopExit::Partial(PartialReason::Cancelled));
            }

            // Pacing gates the next message, so the last one is never followed by a sleep
            let entry = match stream.next().await {
                Ok(Some(entry)) => entry,
                Ok(None) => return Ok(LoopExit::Exhausted),
                Err(Error::Throttled { wait }) => {
                    summary.throttle_waits += 1;
                    if let Some(exit) = self.absorb_flood_wait(&mut throttle, wait).await? {
                        return Ok(exit);
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            if let Some(pause) = throttle.pending_pause() {
                self.emit(ExportEvent::Paused {
                    reason: PauseReason::Pacing,
                    duration: pause,
                });
            }
            match throttle.before_item().await {
                Ok(_) => {}
                Err(Error::Cancelled) => return Ok(LoopExit::Partial(PartialReason::Cancelled)),
                Err(e) => return Err(e),
            }

            match entry {
                PageEntry::Malformed(malformed) => {
                    tracing::warn!(
                        message_id = malformed.id.0,
                        reason = %malformed.reason,
                        "Skipping message that could not be decoded"
                    );
                    summary.skipped += 1;
                    self.emit(ExportEvent::Skipped {
                        id: malformed.id,
                        reason: malformed.reason,
                    });
                }
                PageEntry::Message(message) => {
                    let outcome = match &media {
                        Some((fetcher, dir)) if message.attachment.is_some() => {
                            match self.fetch_media(fetcher, &message, dir).await {
                                Ok(outcome) => outcome,
                                Err(Error::Cancelled) => {
                                    return Ok(LoopExit::Partial(PartialReason::Cancelled));
                                }
                                Err(e) => return Err(e),
                            }
                        }
                        _ => None,
                    };
                    self.write_record(writer, &message, outcome.as_ref(), summary)
                        .await?;
                }
            }

            throttle.after_item();
        }
    }

    /// Sleep through a provider flood wait, or stop if waits keep recurring past the limits
    async fn absorb_flood_wait(
        &self,
        throttle: &mut ThrottleController,
        suggested: std::time::Duration,
    ) -> Result<Option<LoopExit>> {
        if throttle.sleeps_through(suggested) {
            self.emit(ExportEvent::Paused {
                reason: PauseReason::FloodWait,
                duration: suggested,
            });
        }
        let decision = match throttle.on_provider_throttle(suggested).await {
            Ok(decision) => decision,
            Err(Error::Cancelled) => return Ok(Some(LoopExit::Partial(PartialReason::Cancelled))),
            Err(e) => return Err(e),
        };

        match decision {
            ThrottleDecision::Resumed { .. } => Ok(None),
            ThrottleDecision::Stalled { waits } => {
                Ok(Some(LoopExit::Partial(PartialReason::ThrottleStalled {
                    waits,
                    last_wait: suggested,
                })))
            }
            ThrottleDecision::Escalated { escalations, .. }
                if escalations > throttle.config().max_throttle_escalations =>
            {
                Ok(Some(LoopExit::Partial(PartialReason::ThrottleEscalated {
                    escalations,
                    last_wait: suggested,
                })))
            }
            ThrottleDecision::Escalated { wait, .. } => {
                self.emit(ExportEvent::Paused {
                    reason: PauseReason::FloodWait,
                    duration: wait,
                });
                match throttle.pause(wait).await {
                    Ok(()) => Ok(None),
                    Err(Error::Cancelled) => Ok(Some(LoopExit::Partial(PartialReason::Cancelled))),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Download the attachment of `message`; the record is written afterwards in order
    async fn fetch_media(
        &self,
        fetcher: &MediaFetcher,
        message: &Message,
        dir: &Path,
    ) -> Result<Option<MediaOutcome>> {
        let Some(attachment) = message.attachment.as_ref() else {
            return Ok(None);
        };
        let outcome = tokio::select! {
            outcome = fetcher.fetch(attachment, dir) => outcome?,
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
        };

        if let MediaOutcome::Failed(error) = &outcome {
            self.emit(ExportEvent::MediaFailed {
                id: message.id,
                error: error.clone(),
            });
        }
        Ok(Some(outcome))
    }

    async fn write_record(
        &self,
        writer: &mut BatchWriter,
        message: &Message,
        media: Option<&MediaOutcome>,
        summary: &mut ExportSummary,
    ) -> Result<()> {
        let record = ExportedRecord::from_message(message, media);
        if let Some(path) = writer.append(&record).await? {
            self.emit(ExportEvent::FileRotated { path });
        }

        match media {
            Some(MediaOutcome::Saved(_)) => summary.media_saved += 1,
            Some(MediaOutcome::Reused(_)) => summary.media_reused += 1,
            Some(MediaOutcome::Failed(_)) => summary.media_failed += 1,
            None => {}
        }
        summary.exported += 1;
        summary.last_id = Some(message.id);
        self.emit(ExportEvent::Exported {
            id: message.id,
            count: summary.exported,
        });
        Ok(())
    }
}
