/// Local snapshot persistence: the full conversation/message view, durable
/// across reloads. Sled-backed in production, in-memory for tests.
///
/// Loading is forgiving: absent or corrupt data becomes an empty snapshot,
/// and message records in the legacy shape are migrated to the current one.
use crate::error::{ChatError, Result};
use crate::types::{ConversationSummary, Message};
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

const SNAPSHOT_KEY: &[u8] = b"snapshot";

/// Legacy sender sentinel meaning "the local user"
const LEGACY_SELF_SENDER: &str = "me";

/// The full persisted local view
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub conversations: Vec<ConversationSummary>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// Injected persistence seam: the client never reaches for ambient storage
pub trait SnapshotStore: Send + Sync {
    /// Load the persisted view. Never fails: absent or corrupt data yields
    /// an empty snapshot.
    fn load(&self) -> Snapshot;

    /// Persist exactly the state given. Errors are logged and swallowed;
    /// persistence failure is never surfaced to the user.
    fn save(&self, snapshot: &Snapshot);
}

// ─── Sled store ──────────────────────────────────────────────────────────────

pub struct SledSnapshotStore {
    db: sled::Db,
    local_user_id: String,
}

impl SledSnapshotStore {
    pub fn new(data_dir: &Path, local_user_id: impl Into<String>) -> Result<Self> {
        let db = sled::open(data_dir.join("chat-snapshot.db"))
            .map_err(|e| ChatError::Storage(format!("Failed to open snapshot DB: {}", e)))?;
        Ok(Self {
            db,
            local_user_id: local_user_id.into(),
        })
    }
}

impl SnapshotStore for SledSnapshotStore {
    fn load(&self) -> Snapshot {
        let raw = match self.db.get(SNAPSHOT_KEY) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Snapshot::default(),
            Err(e) => {
                warn!("Snapshot load failed, starting empty: {}", e);
                return Snapshot::default();
            }
        };

        match serde_json::from_slice::<Value>(&raw) {
            Ok(value) => restore_snapshot(&value, &self.local_user_id),
            Err(e) => {
                warn!("Corrupt snapshot discarded: {}", e);
                Snapshot::default()
            }
        }
    }

    fn save(&self, snapshot: &Snapshot) {
        let bytes = match serde_json::to_vec(snapshot) {
            Ok(b) => b,
            Err(e) => {
                warn!("Snapshot serialize failed: {}", e);
                return;
            }
        };
        if let Err(e) = self.db.insert(SNAPSHOT_KEY, bytes) {
            warn!("Snapshot save failed: {}", e);
            return;
        }
        if let Err(e) = self.db.flush() {
            warn!("Snapshot flush failed: {}", e);
        }
    }
}

impl Clone for SledSnapshotStore {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            local_user_id: self.local_user_id.clone(),
        }
    }
}

// ─── In-memory store ─────────────────────────────────────────────────────────

/// Volatile store for tests and for running without a data directory
#[derive(Default)]
pub struct MemorySnapshotStore {
    inner: Mutex<Snapshot>,
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self) -> Snapshot {
        self.inner.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn save(&self, snapshot: &Snapshot) {
        if let Ok(mut inner) = self.inner.lock() {
            *inner = snapshot.clone();
        }
    }
}

// ─── Migration ───────────────────────────────────────────────────────────────

/// Rebuild a snapshot from raw persisted JSON, migrating legacy records
pub fn restore_snapshot(raw: &Value, local_user_id: &str) -> Snapshot {
    let conversations = raw
        .get("conversations")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| serde_json::from_value::<ConversationSummary>(v.clone()).ok())
                .collect()
        })
        .unwrap_or_default();

    let messages = raw
        .get("messages")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| restore_message(v, local_user_id))
                .collect()
        })
        .unwrap_or_default();

    Snapshot {
        conversations,
        messages,
    }
}

/// Restore one persisted message, migrating the legacy shape when needed.
/// Records with empty text after migration are discarded.
fn restore_message(value: &Value, local_user_id: &str) -> Option<Message> {
    // Current shape is keyed by the presence of `sender_id`
    let mut message = if value.get("sender_id").is_some() {
        serde_json::from_value::<Message>(value.clone()).ok()?
    } else {
        migrate_legacy_message(value, local_user_id)?
    };

    if message.text.trim().is_empty() {
        return None;
    }

    // An acknowledgement for a previous session's send can never arrive
    if message.pending {
        debug!("Stale pending message {} marked failed on load", message.id);
        message.pending = false;
        message.failed = true;
    }

    Some(message)
}

/// Best-effort mapping of the legacy record shape:
/// `sender: "me"` means the local user, `text`/`timestamp` (epoch millis)
/// map to `text`/`created_at`, and a missing id gets a fresh one.
fn migrate_legacy_message(value: &Value, local_user_id: &str) -> Option<Message> {
    let sender = value.get("sender").and_then(Value::as_str).unwrap_or("");
    let sender_id = if sender == LEGACY_SELF_SENDER {
        local_user_id.to_string()
    } else {
        sender.to_string()
    };

    let created_at = value
        .get("timestamp")
        .and_then(Value::as_i64)
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);

    Some(Message {
        id: value
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("local-{}", Uuid::new_v4())),
        conversation_id: value
            .get("conversation_id")
            .or_else(|| value.get("conversationId"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        sender_id,
        receiver_id: String::new(),
        text: value
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        created_at,
        delivered_at: None,
        read_at: None,
        pending: false,
        failed: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_migrates_legacy_message() {
        let raw = json!({
            "conversations": [],
            "messages": [
                { "sender": "me", "text": "hi", "timestamp": 1000i64 },
            ],
        });
        let snapshot = restore_snapshot(&raw, "u1");
        assert_eq!(snapshot.messages.len(), 1);
        let msg = &snapshot.messages[0];
        assert_eq!(msg.sender_id, "u1");
        assert_eq!(msg.text, "hi");
        assert_eq!(msg.created_at.to_rfc3339(), "1970-01-01T00:00:01+00:00");
        assert!(!msg.id.is_empty());
        assert!(msg.delivered_at.is_none());
        assert!(msg.read_at.is_none());
    }

    #[test]
    fn test_discards_empty_text_after_migration() {
        let raw = json!({
            "messages": [
                { "sender": "u9", "text": "   ", "timestamp": 1000i64 },
                { "sender": "u9", "timestamp": 1000i64 },
            ],
        });
        let snapshot = restore_snapshot(&raw, "u1");
        assert!(snapshot.messages.is_empty());
    }

    #[test]
    fn test_stale_pending_becomes_failed() {
        let raw = json!({
            "messages": [{
                "id": "local-1",
                "conversation_id": "c1",
                "sender_id": "u1",
                "text": "hi",
                "created_at": "2024-03-01T10:00:00Z",
                "pending": true,
            }],
        });
        let snapshot = restore_snapshot(&raw, "u1");
        assert!(!snapshot.messages[0].pending);
        assert!(snapshot.messages[0].failed);
    }

    #[test]
    fn test_sled_store_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let store = SledSnapshotStore::new(temp_dir.path(), "u1").unwrap();

        let snapshot = Snapshot {
            conversations: vec![ConversationSummary {
                id: "c1".to_string(),
                title: "Ann Lee".to_string(),
                last_message_preview: "hi".to_string(),
                updated_at: Utc::now(),
                unread_count: 0,
                peer_id: Some("u9".to_string()),
                peer_role: None,
                ephemeral: true,
            }],
            messages: vec![],
        };
        store.save(&snapshot);

        // Drop and reload
        drop(store);
        let store = SledSnapshotStore::new(temp_dir.path(), "u1").unwrap();
        let loaded = store.load();
        assert_eq!(loaded.conversations.len(), 1);
        assert_eq!(loaded.conversations[0].title, "Ann Lee");
        // The ephemeral flag is transient and never persisted
        assert!(!loaded.conversations[0].ephemeral);
    }

    #[test]
    fn test_corrupt_snapshot_loads_empty() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = SledSnapshotStore::new(temp_dir.path(), "u1").unwrap();
            store.db.insert(SNAPSHOT_KEY, &b"not json"[..]).unwrap();
            store.db.flush().unwrap();
        }
        let store = SledSnapshotStore::new(temp_dir.path(), "u1").unwrap();
        let loaded = store.load();
        assert!(loaded.conversations.is_empty());
        assert!(loaded.messages.is_empty());
    }
}
