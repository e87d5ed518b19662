/// Shared types for the chat sync engine
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How much of the last message is kept as the conversation preview
const PREVIEW_LEN: usize = 80;

/// Summary of one conversation thread (for the list view)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationSummary {
    /// Stable id, locally assigned (`local-<uuid>`) or server assigned
    pub id: String,
    /// Display name of the thread; also the de-duplication key
    pub title: String,
    /// Preview text of the last message
    #[serde(default)]
    pub last_message_preview: String,
    /// Timestamp of the last activity; ordering key for the list
    pub updated_at: DateTime<Utc>,
    /// Unread inbound messages since the conversation was last selected
    #[serde(default)]
    pub unread_count: u32,
    /// The remote identity, when known from the server or a directory match
    #[serde(default)]
    pub peer_id: Option<String>,
    /// Role of the peer as reported by the directory (e.g. "instructor")
    #[serde(default)]
    pub peer_role: Option<String>,
    /// Created this session, not yet confirmed by the server thread list.
    /// Memory-only, never persisted.
    #[serde(skip)]
    pub ephemeral: bool,
}

impl ConversationSummary {
    /// Title key used for de-duplication: trimmed and case-folded
    pub fn normalized_title(&self) -> String {
        normalize_title(&self.title)
    }

    /// Record new activity: update preview text and freshness timestamp
    pub fn touch(&mut self, preview: &str, at: DateTime<Utc>) {
        self.last_message_preview = preview.chars().take(PREVIEW_LEN).collect();
        if at > self.updated_at {
            self.updated_at = at;
        }
    }
}

pub fn normalize_title(title: &str) -> String {
    title.trim().to_lowercase()
}

/// One direct message, local or remote
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub receiver_id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    /// Awaiting send acknowledgement
    #[serde(default)]
    pub pending: bool,
    /// Send was rejected or never acknowledged
    #[serde(default)]
    pub failed: bool,
}

impl Message {
    /// True for messages authored by `user_id`
    pub fn is_from(&self, user_id: &str) -> bool {
        self.sender_id == user_id
    }
}

/// One candidate peer from the directory lookup service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerDirectoryEntry {
    #[serde(alias = "_id", alias = "userId", alias = "user_id")]
    pub id: String,
    #[serde(alias = "displayName", alias = "display_name", alias = "fullName")]
    pub name: String,
    #[serde(default)]
    pub role: Option<String>,
}

/// Real-time events emitted to the UI layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// A message was appended (inbound or an optimistic local send)
    NewMessage { message: Message },
    /// An existing message changed in place (ack, failure, receipt)
    MessageUpdated { message: Message },
    /// The conversation list changed (reconciliation, new thread, activity)
    ConversationsChanged,
    /// A peer started or stopped typing in a conversation
    TypingChanged {
        conversation_id: String,
        is_typing: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_title() {
        assert_eq!(normalize_title("  Ann Lee "), "ann lee");
        assert_eq!(normalize_title("ANN LEE"), "ann lee");
    }

    #[test]
    fn test_touch_truncates_preview_and_keeps_freshest() {
        let mut conv = ConversationSummary {
            id: "c1".to_string(),
            title: "Ann Lee".to_string(),
            last_message_preview: String::new(),
            updated_at: Utc::now(),
            unread_count: 0,
            peer_id: None,
            peer_role: None,
            ephemeral: false,
        };
        let newer = conv.updated_at + chrono::Duration::seconds(5);
        let older = conv.updated_at - chrono::Duration::seconds(5);

        let long = "x".repeat(200);
        conv.touch(&long, newer);
        assert_eq!(conv.last_message_preview.len(), 80);
        assert_eq!(conv.updated_at, newer);

        // A stale timestamp never rolls freshness backwards
        conv.touch("old", older);
        assert_eq!(conv.updated_at, newer);
        assert_eq!(conv.last_message_preview, "old");
    }
}
