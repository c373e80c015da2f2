use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::ids::{MessageId, SessionId};

/// Title every session starts with until its first message arrives.
pub const DEFAULT_SESSION_TITLE: &str = "New Chat";
/// Model used when nothing has been selected yet.
pub const DEFAULT_MODEL: &str = "llama2";
pub const TITLE_MAX_CHARS: usize = 30;
pub const TITLE_ELLIPSIS: &str = "...";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One immutable chat turn. Timestamps are Unix epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: MessageRole,
    pub content: String,
    #[serde(deserialize_with = "epoch_millis::deserialize")]
    pub timestamp: u64,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new_v7(),
            role,
            content: content.into(),
            timestamp: unix_timestamp_millis(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub title: String,
    pub messages: Vec<Message>,
    pub model: String,
    #[serde(deserialize_with = "epoch_millis::deserialize")]
    pub created_at: u64,
    #[serde(deserialize_with = "epoch_millis::deserialize")]
    pub updated_at: u64,
}

impl Session {
    pub(crate) fn new(model: impl Into<String>) -> Self {
        let now = unix_timestamp_millis();
        Self {
            id: SessionId::new_v7(),
            title: DEFAULT_SESSION_TITLE.to_string(),
            messages: Vec::new(),
            model: model.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Bumps `updated_at` without ever moving it backwards.
    pub(crate) fn touch(&mut self) {
        self.updated_at = self.updated_at.max(unix_timestamp_millis());
    }
}

/// Title derived from a session's first message: the first 30 characters,
/// followed by an ellipsis marker when the content is longer.
pub fn derive_title(content: &str) -> String {
    let mut characters = content.chars();
    let head: String = characters.by_ref().take(TITLE_MAX_CHARS).collect();
    if characters.next().is_some() {
        format!("{head}{TITLE_ELLIPSIS}")
    } else {
        head
    }
}

pub fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis() as u64)
}

// Older history wrote timestamps as RFC 3339 strings; they load as epoch millis.
mod epoch_millis {
    use chrono::{DateTime, Utc};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StoredTimestamp {
        Millis(u64),
        Rfc3339(DateTime<Utc>),
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        match StoredTimestamp::deserialize(deserializer)? {
            StoredTimestamp::Millis(millis) => Ok(millis),
            StoredTimestamp::Rfc3339(instant) => u64::try_from(instant.timestamp_millis())
                .map_err(|_| D::Error::custom(format!("timestamp {instant} predates the epoch"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_content_becomes_title_verbatim() {
        assert_eq!(derive_title("Hello"), "Hello");
        let exactly_thirty = "a".repeat(30);
        assert_eq!(derive_title(&exactly_thirty), exactly_thirty);
    }

    #[test]
    fn long_content_is_truncated_with_ellipsis() {
        assert_eq!(
            derive_title("Hello there, how are you doing today?"),
            "Hello there, how are you doing..."
        );
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        let content = "é".repeat(31);
        let title = derive_title(&content);
        assert_eq!(title, format!("{}...", "é".repeat(30)));
    }

    #[test]
    fn session_json_uses_camel_case_and_lowercase_roles() {
        let mut session = Session::new("llama2");
        session.messages.push(Message::user("hi"));
        let value = serde_json::to_value(&session).unwrap();
        assert!(value.get("createdAt").is_some());
        assert!(value.get("updatedAt").is_some());
        assert_eq!(value["messages"][0]["role"], "user");
    }

    #[test]
    fn rfc3339_timestamps_load_as_millis() {
        let message: Message = serde_json::from_str(
            r#"{"id":"0b6e3c1d-8f2a-4c55-9d7e-1a2b3c4d5e6f","role":"assistant","content":"Hi!","timestamp":"2024-11-02T10:00:01.500Z"}"#,
        )
        .unwrap();
        assert_eq!(message.timestamp, 1_730_541_601_500);

        let message: Message = serde_json::from_str(
            r#"{"id":"0b6e3c1d-8f2a-4c55-9d7e-1a2b3c4d5e6f","role":"user","content":"Hi","timestamp":1730541601500}"#,
        )
        .unwrap();
        assert_eq!(message.timestamp, 1_730_541_601_500);
    }

    #[test]
    fn timestamps_before_the_epoch_are_rejected() {
        let parsed = serde_json::from_str::<Message>(
            r#"{"id":"0b6e3c1d-8f2a-4c55-9d7e-1a2b3c4d5e6f","role":"user","content":"Hi","timestamp":"1969-12-31T23:59:59Z"}"#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn touch_never_moves_updated_at_backwards() {
        let mut session = Session::new("llama2");
        session.updated_at = u64::MAX - 1;
        session.touch();
        assert_eq!(session.updated_at, u64::MAX - 1);
    }
}
