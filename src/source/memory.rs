//! In-memory [`RemoteSource`] with fault injection
//!
//! Serves a fixed list of messages and attachment blobs. Faults (flood waits,
//! provider errors, malformed entries, failing downloads) can be scheduled to
//! exercise the pipeline's recovery paths without a network.

use super::{MalformedMessage, Page, PageEntry, PageRequest, RemoteSource};
use crate::config::AuthMode;
use crate::error::{Error, Result};
use crate::types::{AttachmentRef, Chat, ChatTarget, Direction, Identity, Message, MessageId};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug)]
struct PageFault {
    after: Option<MessageId>,
    remaining: u32,
    kind: PageFaultKind,
}

#[derive(Debug, Clone)]
enum PageFaultKind {
    Throttle(Duration),
    Provider { status: u16, message: String },
}

#[derive(Debug, Default)]
struct MemoryState {
    page_requests: u64,
    last_request: Option<PageRequest>,
    page_faults: Vec<PageFault>,
    overlap: usize,
    malformed: HashMap<MessageId, String>,
    blobs: HashMap<String, Vec<u8>>,
    download_failures: HashMap<String, u32>,
    download_throttles: HashMap<String, (u32, Duration)>,
    download_calls: HashMap<String, u32>,
    reject_auth: bool,
    known_chats: Option<HashSet<String>>,
}

/// In-memory chat history
#[derive(Debug)]
pub struct MemorySource {
    chat: Chat,
    identity: Identity,
    /// Sorted by ascending id
    messages: Vec<Message>,
    state: Mutex<MemoryState>,
}

impl MemorySource {
    /// Serve `messages` (any order) as the history of chat id 1
    pub fn new(mut messages: Vec<Message>) -> Self {
        messages.sort_by_key(|m| m.id);
        Self {
            chat: Chat {
                id: 1,
                title: Some("memory".to_string()),
            },
            identity: Identity {
                id: 1,
                username: Some("exporter".to_string()),
            },
            messages,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// History of `count` text messages with ids `1..=count`
    pub fn with_count(count: i64) -> Self {
        Self::new(
            (1..=count)
                .map(|id| Message::text(id, format!("message {id}")))
                .collect(),
        )
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Only these targets resolve; everything else is "chat not found"
    pub fn restrict_chats<I, S>(&self, targets: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state().known_chats = Some(targets.into_iter().map(Into::into).collect());
    }

    /// Make every login fail
    pub fn reject_auth(&self) {
        self.state().reject_auth = true;
    }

    /// Answer the next page request whose cursor is `after` with a flood wait
    pub fn throttle_page_after(&self, after: Option<MessageId>, wait: Duration) {
        self.throttle_page_after_times(after, wait, 1);
    }

    /// Like [`throttle_page_after`](Self::throttle_page_after), `times` times in a row
    pub fn throttle_page_after_times(&self, after: Option<MessageId>, wait: Duration, times: u32) {
        self.state().page_faults.push(PageFault {
            after,
            remaining: times,
            kind: PageFaultKind::Throttle(wait),
        });
    }

    /// Answer page requests whose cursor is `after` with a provider error
    pub fn fail_page_after(&self, after: Option<MessageId>, status: u16, message: &str) {
        self.fail_page_after_times(after, status, message, u32::MAX);
    }

    /// Like [`fail_page_after`](Self::fail_page_after), only for the next `times` requests
    pub fn fail_page_after_times(
        &self,
        after: Option<MessageId>,
        status: u16,
        message: &str,
        times: u32,
    ) {
        self.state().page_faults.push(PageFault {
            after,
            remaining: times,
            kind: PageFaultKind::Provider {
                status,
                message: message.to_string(),
            },
        });
    }

    /// Repeat this many already-seen entries at the start of every page after the first
    pub fn set_page_overlap(&self, overlap: usize) {
        self.state().overlap = overlap;
    }

    /// Serve message `id` as undecodable
    pub fn mark_malformed(&self, id: MessageId, reason: &str) {
        self.state().malformed.insert(id, reason.to_string());
    }

    /// Register attachment bytes under a handle
    pub fn add_blob(&self, handle: &str, bytes: Vec<u8>) {
        self.state().blobs.insert(handle.to_string(), bytes);
    }

    /// Fail the next `times` downloads of `handle` with a transient provider error
    pub fn fail_downloads(&self, handle: &str, times: u32) {
        self.state()
            .download_failures
            .insert(handle.to_string(), times);
    }

    /// Answer the next `times` downloads of `handle` with a flood wait
    pub fn throttle_downloads(&self, handle: &str, wait: Duration, times: u32) {
        self.state()
            .download_throttles
            .insert(handle.to_string(), (times, wait));
    }

    /// Number of download attempts for `handle`
    pub fn download_calls(&self, handle: &str) -> u32 {
        self.state().download_calls.get(handle).copied().unwrap_or(0)
    }

    /// Number of page requests served (including failed ones)
    pub fn page_requests(&self) -> u64 {
        self.state().page_requests
    }

    /// Most recent page request
    pub fn last_request(&self) -> Option<PageRequest> {
        self.state().last_request.clone()
    }

    fn take_fault(state: &mut MemoryState, after: Option<MessageId>) -> Option<PageFaultKind> {
        let fault = state
            .page_faults
            .iter_mut()
            .find(|f| f.after == after && f.remaining > 0)?;
        fault.remaining -= 1;
        Some(fault.kind.clone())
    }
}

#[async_trait::async_trait]
impl RemoteSource for MemorySource {
    async fn authenticate(&self, _auth: &AuthMode) -> Result<Identity> {
        if self.state().reject_auth {
            return Err(Error::AuthFailed("credentials rejected".to_string()));
        }
        Ok(self.identity.clone())
    }

    async fn resolve_chat(&self, target: &ChatTarget) -> Result<Chat> {
        let known = self
            .state()
            .known_chats
            .as_ref()
            .is_none_or(|chats| chats.contains(&target.0));
        if known {
            Ok(self.chat.clone())
        } else {
            Err(Error::ChatNotFound(target.0.clone()))
        }
    }

    async fn message_count(&self, _chat: &Chat) -> Result<Option<u64>> {
        Ok(Some(self.messages.len() as u64))
    }

    async fn fetch_page(&self, _chat: &Chat, request: &PageRequest) -> Result<Page> {
        let mut state = self.state();
        state.page_requests += 1;
        state.last_request = Some(request.clone());

        match Self::take_fault(&mut state, request.after) {
            Some(PageFaultKind::Throttle(wait)) => return Err(Error::Throttled { wait }),
            Some(PageFaultKind::Provider { status, message }) => {
                return Err(Error::Provider { status, message });
            }
            None => {}
        }

        let ordered: Vec<&Message> = match request.direction {
            Direction::OldestFirst => self.messages.iter().collect(),
            Direction::NewestFirst => self.messages.iter().rev().collect(),
        };
        let start = match request.after {
            Some(after) => {
                let first_new = ordered
                    .iter()
                    .position(|m| request.direction.is_beyond(m.id, after))
                    .unwrap_or(ordered.len());
                first_new.saturating_sub(state.overlap)
            }
            None => 0,
        };

        let entries = ordered
            .into_iter()
            .skip(start)
            .take(request.limit as usize)
            .map(|m| match state.malformed.get(&m.id) {
                Some(reason) => PageEntry::Malformed(MalformedMessage {
                    id: m.id,
                    reason: reason.clone(),
                }),
                None => PageEntry::Message(m.clone()),
            })
            .collect();
        Ok(Page { entries })
    }

    async fn download_attachment(&self, attachment: &AttachmentRef) -> Result<Vec<u8>> {
        let mut state = self.state();
        *state
            .download_calls
            .entry(attachment.handle.clone())
            .or_default() += 1;

        if let Some((left, wait)) = state.download_throttles.get_mut(&attachment.handle) {
            if *left > 0 {
                *left -= 1;
                return Err(Error::Throttled { wait: *wait });
            }
        }
        if let Some(left) = state.download_failures.get_mut(&attachment.handle) {
            if *left > 0 {
                *left -= 1;
                return Err(Error::Provider {
                    status: 503,
                    message: "media server busy".to_string(),
                });
            }
        }

        state
            .blobs
            .get(&attachment.handle)
            .cloned()
            .ok_or_else(|| Error::AttachmentUnavailable {
                handle: attachment.handle.clone(),
                reason: "file reference not found".to_string(),
            })
    }
}
