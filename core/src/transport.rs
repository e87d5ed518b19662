/// Transport seam: the bidirectional event channel to the chat server.
///
/// Requests (connect, join, send, receipts) are plain async calls resolving
/// to one acknowledgement each; server pushes arrive as a broadcast stream
/// of `TransportEvent`s. Incoming message payloads are deliberately untyped
/// (`serde_json::Value`) — field naming varies by server version, so parsing
/// is owned by `wire`, not by the transport.
use crate::error::Result;
use crate::types::ConversationSummary;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::broadcast;

/// Acknowledgement of a conversation join, carrying the thread's history
#[derive(Debug, Clone, Default)]
pub struct JoinAck {
    pub ok: bool,
    pub messages: Vec<Value>,
}

/// Acknowledgement of a direct-message send
#[derive(Debug, Clone, Default)]
pub struct SendAck {
    pub ok: bool,
    /// The server's copy of the message, when the send was accepted
    pub message: Option<Value>,
}

/// Events pushed by the server over the event channel
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A message addressed to the local user (raw payload, see `wire`)
    IncomingMessage(Value),
    /// A remote user started or stopped typing
    TypingStatus { user_id: String, is_typing: bool },
    /// A message the local user sent reached its recipient
    MessageDelivered {
        message_id: String,
        at: Option<DateTime<Utc>>,
    },
    /// A message the local user sent was read
    MessageRead {
        message_id: String,
        at: Option<DateTime<Utc>>,
    },
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the event channel for the given user
    async fn connect(&self, user_id: &str) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// The server's authoritative thread list
    async fn list_threads(&self) -> Result<Vec<ConversationSummary>>;

    /// Join the direct conversation with a peer, returning its history
    async fn join_conversation(&self, peer_id: &str) -> Result<JoinAck>;

    /// Send one direct message; exactly one acknowledgement per call
    async fn send_direct_message(&self, peer_id: &str, text: &str) -> Result<SendAck>;

    async fn send_typing_status(&self, peer_id: &str, is_typing: bool) -> Result<()>;

    /// Tell the server a received message was read
    async fn notify_message_read(&self, message_id: &str) -> Result<()>;

    /// Subscribe to server pushes. Each receiver sees every event from the
    /// moment of subscription.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}
