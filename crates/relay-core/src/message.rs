use chrono::{Local, LocalResult, TimeZone};
use serde::{Deserialize, Deserializer, Serialize};

/// Sender label used when an update carries neither user nor chat identity.
pub const UNKNOWN_SENDER: &str = "unknown";
/// Chat-id label used when an update carries no chat object.
pub const UNKNOWN_CHAT: &str = "unknown";
/// Display text substituted for payloads without a text body.
pub const NON_TEXT_PLACEHOLDER: &str = "[non-text message]";

/// One entry of the rolling message view. Immutable once built; the
/// hub only ever appends these to the buffer and serializes them out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanonicalMessage {
    pub id: i64,
    #[serde(rename = "chatId")]
    pub chat_id: String,
    pub from: String,
    pub text: String,
    pub timestamp: String,
    #[serde(rename = "autoSent")]
    pub auto_sent: bool,
}

impl CanonicalMessage {
    /// Normalize one upstream update. Returns `None` for update kinds
    /// that carry no message payload (callback queries and the like).
    pub fn from_update(update: &Update, auto_sent: bool) -> Option<Self> {
        let payload = update.payload()?;
        Some(Self {
            id: update.update_id,
            chat_id: payload
                .chat
                .as_ref()
                .map(|chat| chat.id.clone())
                .unwrap_or_else(|| UNKNOWN_CHAT.to_string()),
            from: payload.display_name(),
            text: payload
                .text
                .clone()
                .unwrap_or_else(|| NON_TEXT_PLACEHOLDER.to_string()),
            timestamp: format_local_timestamp(payload.date),
            auto_sent,
        })
    }

    /// Render the append-only log line for this message.
    pub fn log_line(&self) -> String {
        format!(
            "[{}] [UpdateID: {}] [ChatID: {}] {}: {}",
            self.timestamp, self.id, self.chat_id, self.from, self.text
        )
    }
}

/// Long-poll response envelope from the upstream feed.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateBatch {
    pub ok: bool,
    #[serde(default)]
    pub result: Vec<Update>,
}

/// One heterogeneous update from the feed. Exactly one of the payload
/// variants is populated for the kinds we relay.
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<UpdatePayload>,
    #[serde(default)]
    pub channel_post: Option<UpdatePayload>,
    #[serde(default)]
    pub edited_message: Option<UpdatePayload>,
}

impl Update {
    pub fn payload(&self) -> Option<&UpdatePayload> {
        self.message
            .as_ref()
            .or(self.channel_post.as_ref())
            .or(self.edited_message.as_ref())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdatePayload {
    #[serde(default)]
    pub from: Option<UpdateSender>,
    #[serde(default)]
    pub sender_chat: Option<SenderChat>,
    #[serde(default)]
    pub chat: Option<ChatRef>,
    #[serde(default)]
    pub text: Option<String>,
    pub date: i64,
}

impl UpdatePayload {
    /// Sender-name precedence: first+last > first > username >
    /// sender-chat title > [`UNKNOWN_SENDER`].
    pub fn display_name(&self) -> String {
        if let Some(from) = &self.from {
            match (nonempty(&from.first_name), nonempty(&from.last_name)) {
                (Some(first), Some(last)) => return format!("{first} {last}"),
                (Some(first), None) => return first.to_string(),
                _ => {}
            }
            if let Some(username) = nonempty(&from.username) {
                return username.to_string();
            }
        }
        if let Some(title) = self
            .sender_chat
            .as_ref()
            .and_then(|chat| nonempty(&chat.title))
        {
            return title.to_string();
        }
        UNKNOWN_SENDER.to_string()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateSender {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SenderChat {
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRef {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
}

/// If `text` starts with `keyword`, return the remainder with the
/// surrounding whitespace run stripped. `None` means no match.
pub fn strip_forward_keyword<'a>(text: &'a str, keyword: &str) -> Option<&'a str> {
    if keyword.is_empty() {
        return None;
    }
    text.strip_prefix(keyword).map(str::trim)
}

fn format_local_timestamp(epoch_secs: i64) -> String {
    match Local.timestamp_opt(epoch_secs, 0) {
        LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => {
            dt.format("%Y-%m-%d %H:%M:%S").to_string()
        }
        LocalResult::None => format!("epoch:{epoch_secs}"),
    }
}

fn nonempty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.trim().is_empty())
}

/// Deserialize an ID that can be either a string or a number into a String
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val: serde_json::Value = serde_json::Value::deserialize(deserializer)?;
    match val {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}
