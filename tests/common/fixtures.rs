//! Test fixtures: configurations and message histories

use chat_history_dl::{AttachmentKind, AttachmentRef, AuthMode, ExportConfig, Message};
use std::path::Path;

/// Export configuration writing into `dir`, with bot credentials so no
/// environment lookup is needed
pub fn config_in(dir: &Path) -> ExportConfig {
    let mut config = ExportConfig::new("@history");
    config.output = dir.join("messages.jsonl");
    config.auth = Some(AuthMode::Bot {
        token: "test-token".to_string(),
    });
    config
}

/// Photo attachment whose download handle is `h-<id>`
pub fn photo(id: &str) -> AttachmentRef {
    AttachmentRef {
        kind: AttachmentKind::Photo,
        id: id.to_string(),
        handle: format!("h-{id}"),
        size: None,
        file_name: None,
        mime_type: None,
    }
}

/// `count` text messages where every `every`-th one carries a photo
pub fn history_with_photos(count: i64, every: i64) -> Vec<Message> {
    (1..=count)
        .map(|id| {
            let message = Message::text(id, format!("message {id}"));
            if id % every == 0 {
                message.with_attachment(photo(&format!("p{id}")))
            } else {
                message
            }
        })
        .collect()
}
