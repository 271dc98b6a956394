//! [`RemoteSource`] backed by an HTTP history gateway
//!
//! The gateway fronts the chat provider's session handling and exposes
//! history as paginated JSON. Flood control is reported as HTTP 429 with a
//! `Retry-After` header (or a `retry_after` field in the body).

use super::{MalformedMessage, Page, PageEntry, PageRequest, RemoteSource};
use crate::config::{AuthMode, SourceConfig};
use crate::error::{Error, Result};
use crate::types::{
    AttachmentKind, AttachmentRef, Chat, ChatTarget, Identity, Message, MessageId, Reactions,
    Sender,
};
use chrono::{DateTime, Utc};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

/// Asks the operator for a login code; receives a hint such as the masked phone number
pub type CodePrompt = Arc<dyn Fn(&str) -> Result<String> + Send + Sync>;

/// Fallback wait when a 429 carries no usable hint
const DEFAULT_THROTTLE_WAIT: Duration = Duration::from_secs(1);

/// HTTP gateway client
pub struct HttpSource {
    client: reqwest::Client,
    base: Url,
    token: Mutex<Option<String>>,
    code_prompt: Option<CodePrompt>,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    status: String,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    user: Option<Identity>,
    #[serde(default)]
    hint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    total: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    messages: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireReaction {
    #[serde(default)]
    emoticon: Option<String>,
    #[serde(default)]
    document_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WireReactionCount {
    #[serde(default)]
    count: u64,
}

#[derive(Debug, Deserialize)]
struct WireReactions {
    #[serde(default)]
    results: Option<Vec<WireReactionCount>>,
    #[serde(default)]
    recent: Vec<Option<WireReaction>>,
}

impl From<WireReactions> for Reactions {
    fn from(wire: WireReactions) -> Self {
        let total = wire.results.map(|r| r.iter().map(|c| c.count).sum());
        let recent = wire
            .recent
            .into_iter()
            .map(|r| {
                let r = r?;
                match (r.emoticon, r.document_id) {
                    (Some(emoji), _) => Some(emoji),
                    (None, Some(doc)) => Some(format!("custom:{doc}")),
                    (None, None) => None,
                }
            })
            .collect();
        Reactions { total, recent }
    }
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    id: i64,
    #[serde(default)]
    date: Option<DateTime<Utc>>,
    #[serde(default)]
    chat_id: Option<i64>,
    #[serde(default)]
    sender: Option<Sender>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    reply_to_msg_id: Option<i64>,
    #[serde(default)]
    views: Option<u64>,
    #[serde(default)]
    forwards: Option<u64>,
    #[serde(default)]
    reactions: Option<WireReactions>,
    #[serde(default)]
    media: Option<WireMedia>,
    #[serde(flatten)]
    raw: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireMedia {
    kind: AttachmentKind,
    id: String,
    handle: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    file_name: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
}

impl From<WireMessage> for Message {
    fn from(wire: WireMessage) -> Self {
        Message {
            id: MessageId(wire.id),
            chat_id: wire.chat_id,
            sender: wire.sender.unwrap_or_default(),
            date: wire.date,
            text: wire.message,
            reply_to: wire.reply_to_msg_id.map(MessageId),
            views: wire.views,
            forwards: wire.forwards,
            reactions: wire.reactions.map(Reactions::from),
            attachment: wire.media.map(|m| AttachmentRef {
                kind: m.kind,
                id: m.id,
                handle: m.handle,
                size: m.size,
                file_name: m.file_name,
                mime_type: m.mime_type,
            }),
            raw: wire.raw,
        }
    }
}

/// Decode one gateway entry; only a missing id makes the whole page unusable
fn decode_entry(value: serde_json::Value) -> Result<PageEntry> {
    let id = value
        .get("id")
        .and_then(serde_json::Value::as_i64)
        .ok_or_else(|| Error::Provider {
            status: 200,
            message: "gateway returned a message without an id".to_string(),
        })?;

    Ok(match serde_json::from_value::<WireMessage>(value) {
        Ok(wire) => PageEntry::Message(wire.into()),
        Err(e) => PageEntry::Malformed(MalformedMessage {
            id: MessageId(id),
            reason: e.to_string(),
        }),
    })
}

/// Wait requested by a 429, from `Retry-After` or a JSON `retry_after` field
fn retry_after(headers: &reqwest::header::HeaderMap, body: &str) -> Duration {
    let from_header = headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok());
    let from_body = || {
        serde_json::from_str::<serde_json::Value>(body)
            .ok()?
            .get("retry_after")?
            .as_f64()
    };
    from_header
        .or_else(from_body)
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .unwrap_or(DEFAULT_THROTTLE_WAIT)
}

/// Turn a non-success response into the matching error
async fn status_error(response: Response) -> Error {
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.text().await.unwrap_or_default();

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Error::Throttled {
            wait: retry_after(&headers, &body),
        };
    }
    if status == StatusCode::UNAUTHORIZED {
        return Error::AuthFailed(if body.is_empty() {
            "unauthorized".to_string()
        } else {
            body
        });
    }
    Error::Provider {
        status: status.as_u16(),
        message: if body.is_empty() {
            status.to_string()
        } else {
            body
        },
    }
}

impl HttpSource {
    /// Build a client for the configured gateway
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let mut base = Url::parse(&config.base_url)
            .map_err(|e| Error::config("base_url", format!("invalid gateway URL: {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("chat-history-dl/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base,
            token: Mutex::new(None),
            code_prompt: None,
        })
    }

    /// Use `prompt` when a user login needs a confirmation code
    #[must_use]
    pub fn with_code_prompt(mut self, prompt: CodePrompt) -> Self {
        self.code_prompt = Some(prompt);
        self
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| Error::Other(format!("cannot build gateway URL for {path}: {e}")))
    }

    fn bearer(&self) -> Option<String> {
        self.token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_bearer(&self, token: String) {
        *self
            .token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(token);
    }

    async fn get(&self, url: Url, query: &[(&str, String)]) -> Result<Response> {
        let mut request = self.client.get(url).query(query);
        if let Some(token) = self.bearer() {
            request = request.bearer_auth(token);
        }
        Ok(request.send().await?)
    }

    async fn post_auth(&self, path: &str, body: serde_json::Value) -> Result<AuthResponse> {
        let response = self.client.post(self.endpoint(path)?).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(response.json().await?)
    }

    fn accept_login(&self, response: AuthResponse, fallback_token: &str) -> Result<Identity> {
        if response.status != "ok" {
            return Err(Error::AuthFailed(format!(
                "unexpected login status '{}'",
                response.status
            )));
        }
        self.set_bearer(response.token.unwrap_or_else(|| fallback_token.to_string()));
        Ok(response.user.unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl RemoteSource for HttpSource {
    async fn authenticate(&self, auth: &AuthMode) -> Result<Identity> {
        match auth {
            AuthMode::Bot { token } => {
                let response = self
                    .post_auth("auth/bot", serde_json::json!({ "token": token }))
                    .await?;
                self.accept_login(response, token)
            }
            AuthMode::User {
                api_id,
                api_hash,
                session,
            } => {
                let mut response = self
                    .post_auth(
                        "auth/user",
                        serde_json::json!({
                            "api_id": api_id,
                            "api_hash": api_hash,
                            "session": session,
                        }),
                    )
                    .await?;

                if response.status == "code_required" {
                    let Some(prompt) = self.code_prompt.as_ref() else {
                        return Err(Error::AuthFailed(
                            "login code required but no interactive prompt is available"
                                .to_string(),
                        ));
                    };
                    let code = prompt(response.hint.as_deref().unwrap_or(""))?;
                    response = self
                        .post_auth(
                            "auth/code",
                            serde_json::json!({ "session": session, "code": code.trim() }),
                        )
                        .await?;
                }
                self.accept_login(response, session)
            }
        }
    }

    async fn resolve_chat(&self, target: &ChatTarget) -> Result<Chat> {
        let response = self
            .get(
                self.endpoint("chats/resolve")?,
                &[("target", target.0.clone())],
            )
            .await?;
        match response.status() {
            s if s.is_success() => Ok(response.json().await?),
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN | StatusCode::BAD_REQUEST => {
                Err(Error::ChatNotFound(target.0.clone()))
            }
            _ => Err(status_error(response).await),
        }
    }

    async fn message_count(&self, chat: &Chat) -> Result<Option<u64>> {
        let response = self
            .get(self.endpoint(&format!("chats/{}/count", chat.id))?, &[])
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let count: CountResponse = response.json().await?;
        Ok(count.total)
    }

    async fn fetch_page(&self, chat: &Chat, request: &PageRequest) -> Result<Page> {
        let mut query = vec![
            ("order", request.direction.as_order().to_string()),
            ("limit", request.limit.to_string()),
        ];
        if let Some(after) = request.after {
            query.push(("after", after.0.to_string()));
        }

        let response = self
            .get(self.endpoint(&format!("chats/{}/messages", chat.id))?, &query)
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let body: MessagesResponse = response.json().await?;
        let entries = body
            .messages
            .into_iter()
            .map(decode_entry)
            .collect::<Result<Vec<_>>>()?;
        Ok(Page { entries })
    }

    async fn download_attachment(&self, attachment: &AttachmentRef) -> Result<Vec<u8>> {
        let path = format!("media/{}", urlencoding::encode(&attachment.handle));
        let response = self.get(self.endpoint(&path)?, &[]).await?;

        match response.status() {
            s if s.is_success() => Ok(response.bytes().await?.to_vec()),
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN | StatusCode::GONE => {
                let status = response.status();
                Err(Error::AttachmentUnavailable {
                    handle: attachment.handle.clone(),
                    reason: status.to_string(),
                })
            }
            _ => Err(status_error(response).await),
        }
    }
}
