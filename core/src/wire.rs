/// Tolerant parser for untyped inbound message payloads.
///
/// Servers are inconsistent about field names (`senderId` vs `sender_id` vs a
/// nested `sender.id`), so every field is read through an ordered fallback
/// chain. A field that matches nothing is dropped; a record without a sender
/// or a non-empty text is dropped entirely rather than guessed at.
use crate::types::Message;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use uuid::Uuid;

const ID_FIELDS: &[&str] = &["id", "_id", "messageId", "message_id"];
const SENDER_FIELDS: &[&str] = &["senderId", "sender_id", "sender.id", "sender"];
const RECEIVER_FIELDS: &[&str] = &["receiverId", "receiver_id", "receiver.id", "receiver"];
const TEXT_FIELDS: &[&str] = &["text", "message", "content"];
const CREATED_FIELDS: &[&str] = &["createdAt", "created_at", "timestamp"];
const DELIVERED_FIELDS: &[&str] = &["deliveredAt", "delivered_at"];
const READ_FIELDS: &[&str] = &["readAt", "read_at"];

/// Numeric timestamps at or above this are epoch milliseconds, below are seconds
const MILLIS_CUTOFF: i64 = 100_000_000_000;

/// Parse one inbound payload into a `Message`.
///
/// The conversation id is not part of the wire shape; the caller assigns it
/// once the target conversation is known. Returns `None` when no sender or
/// no non-empty text can be determined.
pub fn parse_message(value: &Value) -> Option<Message> {
    let sender_id = string_field(value, SENDER_FIELDS)?;
    let text = string_field(value, TEXT_FIELDS)?;
    if text.trim().is_empty() {
        return None;
    }

    let id = string_field(value, ID_FIELDS)
        .unwrap_or_else(|| format!("local-{}", Uuid::new_v4()));

    Some(Message {
        id,
        conversation_id: String::new(),
        sender_id,
        receiver_id: string_field(value, RECEIVER_FIELDS).unwrap_or_default(),
        text,
        created_at: timestamp_field(value, CREATED_FIELDS).unwrap_or_else(Utc::now),
        delivered_at: timestamp_field(value, DELIVERED_FIELDS),
        read_at: timestamp_field(value, READ_FIELDS),
        pending: false,
        failed: false,
    })
}

/// First non-empty string found along the fallback chain.
/// A key containing '.' descends into a nested object.
fn string_field(value: &Value, chain: &[&str]) -> Option<String> {
    for key in chain {
        if let Some(s) = lookup(value, key).and_then(Value::as_str) {
            if !s.is_empty() {
                return Some(s.to_string());
            }
        }
    }
    None
}

/// First parseable timestamp along the fallback chain:
/// RFC3339 string, or an epoch number (millis or seconds).
fn timestamp_field(value: &Value, chain: &[&str]) -> Option<DateTime<Utc>> {
    for key in chain {
        match lookup(value, key) {
            Some(Value::String(s)) => {
                if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                    return Some(ts.with_timezone(&Utc));
                }
            }
            Some(Value::Number(n)) => {
                if let Some(ts) = n.as_i64().and_then(epoch_to_datetime) {
                    return Some(ts);
                }
            }
            _ => {}
        }
    }
    None
}

pub(crate) fn epoch_to_datetime(raw: i64) -> Option<DateTime<Utc>> {
    if raw.abs() >= MILLIS_CUTOFF {
        Utc.timestamp_millis_opt(raw).single()
    } else {
        Utc.timestamp_opt(raw, 0).single()
    }
}

fn lookup<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    match key.split_once('.') {
        Some((head, rest)) => lookup(value.get(head)?, rest),
        None => value.get(key),
    }
}
