//! Remote chat-history providers
//!
//! [`RemoteSource`] is the seam between the exporter and whatever serves the
//! history. The pipeline never iterates a source directly; it pulls messages
//! through a [`MessageStream`], a lazy cursor over pages that can be retried
//! at the same position after a flood wait.
//!
//! - [`http`] - source backed by an HTTP history gateway
//! - [`memory`] - in-memory source with fault injection

pub mod http;
pub mod memory;

use crate::config::{AuthMode, RetryConfig};
use crate::error::{Error, ErrorClass, Result};
use crate::retry::{self, IsRetryable};
use crate::types::{AttachmentRef, Chat, ChatTarget, Direction, Identity, Message, MessageId};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

pub use http::{CodePrompt, HttpSource};
pub use memory::MemorySource;

/// One page request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageRequest {
    /// Walk order
    pub direction: Direction,
    /// Exclusive cursor: only ids strictly beyond it in `direction`
    pub after: Option<MessageId>,
    /// Maximum number of entries to return
    pub limit: u32,
}

/// A message the provider returned but that could not be decoded
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MalformedMessage {
    /// Id of the offending message
    pub id: MessageId,
    /// Why it could not be decoded
    pub reason: String,
}

/// One entry of a page
#[derive(Clone, Debug, PartialEq)]
pub enum PageEntry {
    /// A usable message
    Message(Message),
    /// An entry that must be skipped
    Malformed(MalformedMessage),
}

impl PageEntry {
    /// Id of the entry
    pub fn id(&self) -> MessageId {
        match self {
            PageEntry::Message(m) => m.id,
            PageEntry::Malformed(m) => m.id,
        }
    }
}

/// A page of history; empty means the history is exhausted
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Page {
    /// Entries in `direction` order
    pub entries: Vec<PageEntry>,
}

/// Abstraction over a chat-history provider, enabling testability
#[async_trait::async_trait]
pub trait RemoteSource: Send + Sync {
    /// Log in; fails with [`Error::AuthFailed`](crate::Error::AuthFailed) on bad credentials
    async fn authenticate(&self, auth: &AuthMode) -> Result<Identity>;

    /// Resolve a numeric id, `@username` or invite link
    async fn resolve_chat(&self, target: &ChatTarget) -> Result<Chat>;

    /// Total number of messages in the chat, if the provider can tell
    async fn message_count(&self, chat: &Chat) -> Result<Option<u64>>;

    /// Fetch one page of messages
    async fn fetch_page(&self, chat: &Chat, request: &PageRequest) -> Result<Page>;

    /// Fetch the bytes of an attachment
    async fn download_attachment(&self, attachment: &AttachmentRef) -> Result<Vec<u8>>;
}

/// Re-requests allowed when a full page holds nothing past the cursor
const MAX_WIDENED_REQUESTS: u32 = 3;

/// Page fetch failure as seen by the retry executor
///
/// Only transient errors are retried here. Flood waits go back to the caller
/// so the throttle controller can account for them.
#[derive(Debug)]
struct PageFetchError(Error);

impl IsRetryable for PageFetchError {
    fn is_retryable(&self) -> bool {
        self.0.class() == ErrorClass::Transient
    }
}

impl fmt::Display for PageFetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Lazy, finite, pull-based sequence of page entries
///
/// The cursor only moves when a page has been received, so after an error
/// (e.g. a flood wait) calling [`next`](Self::next) again resumes at the same
/// position. Entries that are not strictly beyond the last yielded id are
/// dropped, which keeps the output free of duplicates when a provider
/// returns overlapping pages. A full page with nothing new is asked for again
/// with a larger limit; only a short page without progress ends the history.
/// The stream cannot be restarted; a new run needs an explicit starting cursor.
pub struct MessageStream {
    source: Arc<dyn RemoteSource>,
    chat: Chat,
    direction: Direction,
    page_size: u32,
    remaining: Option<u64>,
    cursor: Option<MessageId>,
    buffer: VecDeque<PageEntry>,
    exhausted: bool,
    retry: Option<RetryConfig>,
}

impl MessageStream {
    /// Stream `chat` in `direction`, yielding at most `limit` entries
    pub fn new(
        source: Arc<dyn RemoteSource>,
        chat: Chat,
        direction: Direction,
        page_size: u32,
        limit: Option<u64>,
    ) -> Self {
        Self {
            source,
            chat,
            direction,
            page_size: page_size.max(1),
            remaining: limit,
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
            retry: None,
        }
    }

    /// Retry transient page failures with `config` instead of returning them
    #[must_use]
    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    /// Start strictly after `cursor` instead of at the edge of the history
    #[must_use]
    pub fn starting_after(mut self, cursor: MessageId) -> Self {
        self.cursor = Some(cursor);
        self
    }

    /// Last id handed out (or the starting cursor)
    pub fn cursor(&self) -> Option<MessageId> {
        self.cursor
    }

    /// Next entry, `Ok(None)` once the history or the limit is exhausted
    pub async fn next(&mut self) -> Result<Option<PageEntry>> {
        if self.remaining == Some(0) {
            return Ok(None);
        }

        while self.buffer.is_empty() {
            if self.exhausted {
                return Ok(None);
            }
            self.fill().await?;
        }

        let Some(entry) = self.buffer.pop_front() else {
            return Ok(None);
        };
        self.cursor = Some(entry.id());
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
        }
        Ok(Some(entry))
    }

    async fn fill(&mut self) -> Result<()> {
        let mut limit = match self.remaining {
            Some(remaining) => remaining.min(u64::from(self.page_size)) as u32,
            None => self.page_size,
        };

        for _ in 0..=MAX_WIDENED_REQUESTS {
            let request = PageRequest {
                direction: self.direction,
                after: self.cursor,
                limit,
            };
            let page = self.fetch(&request).await?;
            tracing::debug!(
                chat_id = self.chat.id,
                after = ?request.after,
                limit,
                entries = page.entries.len(),
                "Fetched history page"
            );

            if page.entries.is_empty() {
                self.exhausted = true;
                return Ok(());
            }

            let fetched = page.entries.len();
            self.absorb(page);
            if !self.buffer.is_empty() {
                return Ok(());
            }
            if fetched < limit as usize {
                tracing::debug!(
                    chat_id = self.chat.id,
                    fetched,
                    "Short page holds nothing past the cursor, history exhausted"
                );
                self.exhausted = true;
                return Ok(());
            }

            tracing::warn!(
                chat_id = self.chat.id,
                after = ?self.cursor,
                fetched,
                "Full page made no progress past the cursor, asking for more"
            );
            limit = limit.saturating_add(fetched as u32);
        }

        Err(Error::HistoryStalled { after: self.cursor })
    }

    /// Queue the entries strictly beyond the cursor, in page order
    fn absorb(&mut self, page: Page) {
        let mut last = self.cursor;
        for entry in page.entries {
            let id = entry.id();
            if last.is_some_and(|last| !self.direction.is_beyond(id, last)) {
                tracing::debug!(message_id = id.0, "Dropping out-of-order or duplicate entry");
                continue;
            }
            last = Some(id);
            self.buffer.push_back(entry);
        }
    }

    async fn fetch(&self, request: &PageRequest) -> Result<Page> {
        let Some(config) = &self.retry else {
            return self.source.fetch_page(&self.chat, request).await;
        };

        let source = &self.source;
        let chat = &self.chat;
        retry::execute(config, "fetch history page", || async move {
            source
                .fetch_page(chat, request)
                .await
                .map_err(PageFetchError)
        })
        .await
        .map_err(|e| e.last_error.0)
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn chat() -> Chat {
        Chat {
            id: 1,
            title: None,
        }
    }

    async fn collect(stream: &mut MessageStream) -> Vec<i64> {
        let mut ids = Vec::new();
        while let Some(entry) = stream.next().await.unwrap() {
            ids.push(entry.id().0);
        }
        ids
    }

    #[tokio::test]
    async fn walks_all_pages_oldest_first() {
        let source = Arc::new(MemorySource::with_count(25));
        let mut stream = MessageStream::new(source.clone(), chat(), Direction::OldestFirst, 10, None);
        assert_eq!(collect(&mut stream).await, (1..=25).collect::<Vec<_>>());
        // 3 full/partial pages plus the terminating empty one
        assert_eq!(source.page_requests(), 4);
    }

    #[tokio::test]
    async fn walks_newest_first() {
        let source = Arc::new(MemorySource::with_count(5));
        let mut stream = MessageStream::new(source, chat(), Direction::NewestFirst, 2, None);
        assert_eq!(collect(&mut stream).await, vec![5, 4, 3, 2, 1]);
    }

    #[tokio::test]
    async fn limit_caps_entries_and_page_requests() {
        let source = Arc::new(MemorySource::with_count(100));
        let mut stream =
            MessageStream::new(source.clone(), chat(), Direction::OldestFirst, 10, Some(15));
        assert_eq!(collect(&mut stream).await, (1..=15).collect::<Vec<_>>());
        assert_eq!(source.page_requests(), 2, "second page only asks for 5");
        assert_eq!(source.last_request().unwrap().limit, 5);
    }

    #[tokio::test]
    async fn error_leaves_cursor_in_place() {
        let source = Arc::new(MemorySource::with_count(6));
        source.throttle_page_after(Some(MessageId(3)), Duration::from_secs(1));
        let mut stream = MessageStream::new(source.clone(), chat(), Direction::OldestFirst, 3, None);

        let mut ids = Vec::new();
        loop {
            match stream.next().await {
                Ok(Some(entry)) => ids.push(entry.id().0),
                Ok(None) => break,
                Err(Error::Throttled { .. }) => {
                    assert_eq!(stream.cursor(), Some(MessageId(3)));
                }
                Err(e) => panic!("unexpected error {e}"),
            }
        }
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn overlapping_pages_do_not_duplicate() {
        let source = Arc::new(MemorySource::with_count(6));
        source.set_page_overlap(1);
        let mut stream = MessageStream::new(source, chat(), Direction::OldestFirst, 3, None);
        assert_eq!(collect(&mut stream).await, vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn stale_full_page_is_widened_instead_of_ending_history() {
        let source = Arc::new(MemorySource::with_count(30));
        source.set_page_overlap(1);
        let mut stream =
            MessageStream::new(source.clone(), chat(), Direction::OldestFirst, 10, Some(11));

        assert_eq!(collect(&mut stream).await, (1..=11).collect::<Vec<_>>());
        assert_eq!(source.last_request().unwrap().limit, 2);
    }

    #[tokio::test]
    async fn provider_stuck_on_stale_pages_is_an_error() {
        // every page restarts at the oldest message, whatever the limit
        let source = Arc::new(MemorySource::with_count(100));
        source.set_page_overlap(1000);
        let mut stream = MessageStream::new(source.clone(), chat(), Direction::OldestFirst, 3, None)
            .starting_after(MessageId(90));

        let err = stream.next().await.unwrap_err();

        assert!(matches!(err, Error::HistoryStalled { after: Some(MessageId(90)) }));
        assert_eq!(stream.cursor(), Some(MessageId(90)));
        assert_eq!(source.page_requests(), 4);
        assert_eq!(source.last_request().unwrap().limit, 24);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_page_failure_is_retried_in_place() {
        let source = Arc::new(MemorySource::with_count(9));
        source.fail_page_after_times(Some(MessageId(3)), 503, "busy", 2);
        let mut stream = MessageStream::new(source.clone(), chat(), Direction::OldestFirst, 3, None)
            .with_retry(RetryConfig::default());

        assert_eq!(collect(&mut stream).await, (1..=9).collect::<Vec<_>>());
        // 3 pages plus the empty one, with two failed attempts in between
        assert_eq!(source.page_requests(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn flood_wait_is_not_absorbed_by_page_retries() {
        let source = Arc::new(MemorySource::with_count(6));
        source.throttle_page_after(Some(MessageId(3)), Duration::from_secs(30));
        let mut stream = MessageStream::new(source.clone(), chat(), Direction::OldestFirst, 3, None)
            .with_retry(RetryConfig::default());

        for _ in 0..3 {
            stream.next().await.unwrap();
        }
        assert!(matches!(stream.next().await, Err(Error::Throttled { .. })));
        assert_eq!(source.page_requests(), 2);
    }

    #[tokio::test]
    async fn starting_cursor_skips_earlier_history() {
        let source = Arc::new(MemorySource::with_count(10));
        let mut stream = MessageStream::new(source, chat(), Direction::OldestFirst, 4, None)
            .starting_after(MessageId(7));
        assert_eq!(collect(&mut stream).await, vec![8, 9, 10]);
    }
}
