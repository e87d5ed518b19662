/// The chat client engine: one instance per authenticated user.
///
/// Owns the in-memory conversation/message state and drives every transition
/// described in the component design: session-gated thread refresh and
/// directory load, conversation selection with connect-on-demand and a join
/// timeout, the optimistic send pipeline, the inbound event router, read
/// receipts, and typing state. All state mutation is a full
/// read-modify-write under one lock followed by a snapshot save, so two
/// in-flight async completions cannot lose updates.
use crate::config::Config;
use crate::directory::{DirectoryClient, PeerDirectoryCache};
use crate::error::{ChatError, Result};
use crate::reconcile::{reconcile, rekeyed_ids};
use crate::resolver::PeerResolver;
use crate::snapshot::{MemorySnapshotStore, SledSnapshotStore, Snapshot, SnapshotStore};
use crate::transport::{Transport, TransportEvent};
use crate::types::{ChatEvent, ConversationSummary, Message, PeerDirectoryEntry};
use crate::wire;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// In-memory view of the chat panel
struct ChatState {
    conversations: Vec<ConversationSummary>,
    messages: Vec<Message>,
    /// The conversation currently open in the panel, if any
    active_conversation: Option<String>,
    /// Conversation whose history is being fetched (spinner state)
    loading_conversation: Option<String>,
    /// conversation_id -> typing indicator deadline
    typing_until: HashMap<String, DateTime<Utc>>,
    /// Session gate: the one-time thread refresh has run
    threads_refreshed: bool,
    /// Session gate: the one-time initial directory load has run
    directory_loaded: bool,
}

pub struct ChatClient {
    config: Config,
    store: Arc<dyn SnapshotStore>,
    transport: Arc<dyn Transport>,
    cache: PeerDirectoryCache,
    directory: Arc<dyn DirectoryClient>,
    resolver: Arc<PeerResolver>,
    state: Arc<RwLock<ChatState>>,
    events: broadcast::Sender<ChatEvent>,
}

impl ChatClient {
    pub fn new(
        config: Config,
        store: Arc<dyn SnapshotStore>,
        transport: Arc<dyn Transport>,
        directory: Arc<dyn DirectoryClient>,
    ) -> Self {
        let snapshot = store.load();
        info!(
            "Chat state loaded: {} conversations, {} messages",
            snapshot.conversations.len(),
            snapshot.messages.len()
        );

        let cache = PeerDirectoryCache::new();
        let resolver = Arc::new(PeerResolver::new(cache.clone(), directory.clone()));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            config,
            store,
            transport,
            cache,
            directory,
            resolver,
            state: Arc::new(RwLock::new(ChatState {
                conversations: snapshot.conversations,
                messages: snapshot.messages,
                active_conversation: None,
                loading_conversation: None,
                typing_until: HashMap::new(),
                threads_refreshed: false,
                directory_loaded: false,
            })),
            events,
        }
    }

    /// Build the snapshot store the config asks for: sled under `data_dir`,
    /// in-memory otherwise.
    pub fn default_store(config: &Config) -> Result<Arc<dyn SnapshotStore>> {
        match &config.data_dir {
            Some(dir) => Ok(Arc::new(SledSnapshotStore::new(dir, &config.user_id)?)),
            None => Ok(Arc::new(MemorySnapshotStore::default())),
        }
    }

    /// Subscribe to UI-facing events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    /// Spawn the inbound event router. The task holds the shared state, so
    /// there is exactly one live handler and it never sees a stale snapshot.
    pub fn start(&self) -> JoinHandle<()> {
        let client = self.clone();
        let mut rx = self.transport.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => client.handle_transport_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Event router lagged {} transport events", n);
                        continue;
                    }
                    Err(_) => break, // channel closed
                }
            }
        })
    }

    // ─── Session gate ────────────────────────────────────────────────────────

    /// Open the chat panel. The server-thread refresh runs at most once per
    /// session; repeated open/close cycles cost nothing.
    pub async fn open_panel(&self) {
        let first_open = {
            let mut state = self.state.write().await;
            !std::mem::replace(&mut state.threads_refreshed, true)
        };
        if first_open {
            self.refresh_threads().await;
        }
    }

    /// Initial directory load for the "start new conversation" affordance,
    /// once per session. Returns the cached listing.
    pub async fn load_directory(&self) -> Vec<PeerDirectoryEntry> {
        let first_load = {
            let mut state = self.state.write().await;
            !std::mem::replace(&mut state.directory_loaded, true)
        };
        if first_load {
            match self.directory.search_candidates(None).await {
                Ok(entries) => self.cache.merge(entries).await,
                Err(e) => warn!("Initial directory load failed: {}", e),
            }
        }
        self.cache.list().await
    }

    /// Explicit directory search. Always hits the network and refreshes the
    /// cache; a failed lookup leaves the cache as-is.
    pub async fn search_directory(&self, query: &str) -> Result<Vec<PeerDirectoryEntry>> {
        let entries = self.directory.search_candidates(Some(query)).await?;
        self.cache.merge(entries.clone()).await;
        Ok(entries)
    }

    /// Merge the server's authoritative thread list into the local view
    async fn refresh_threads(&self) {
        let server = match self.transport.list_threads().await {
            Ok(list) => list,
            Err(e) => {
                warn!("Thread refresh failed: {}", e);
                return;
            }
        };

        let (merged, remaps) = {
            let mut state = self.state.write().await;
            let merged = reconcile(&server, &state.conversations);
            let remaps = rekeyed_ids(&state.conversations, &merged);

            // Messages and the open panel follow a conversation whose entry
            // was re-keyed from a local id to the server's id
            for (old_id, new_id) in &remaps {
                for msg in state
                    .messages
                    .iter_mut()
                    .filter(|m| &m.conversation_id == old_id)
                {
                    msg.conversation_id = new_id.clone();
                }
                if state.active_conversation.as_deref() == Some(old_id.as_str()) {
                    state.active_conversation = Some(new_id.clone());
                }
            }

            state.conversations = merged.clone();
            self.persist(&state);
            (merged, remaps)
        };

        for (old_id, new_id) in &remaps {
            self.resolver.rekey(old_id, new_id).await;
        }
        for conv in &merged {
            if let Some(peer_id) = &conv.peer_id {
                self.resolver.record(&conv.id, peer_id).await;
            }
        }

        let _ = self.events.send(ChatEvent::ConversationsChanged);
    }

    // ─── Conversation lifecycle ──────────────────────────────────────────────

    /// Start (or return) a conversation with a directory entry. An existing
    /// conversation with the same normalized title is reused; otherwise a
    /// new ephemeral one appears immediately.
    pub async fn start_conversation(
        &self,
        entry: &PeerDirectoryEntry,
    ) -> Result<ConversationSummary> {
        let key = crate::types::normalize_title(&entry.name);
        let conversation = {
            let mut state = self.state.write().await;
            if let Some(existing) = state
                .conversations
                .iter()
                .find(|c| c.normalized_title() == key)
            {
                existing.clone()
            } else {
                let conversation = ConversationSummary {
                    id: format!("local-{}", Uuid::new_v4()),
                    title: entry.name.clone(),
                    last_message_preview: String::new(),
                    updated_at: Utc::now(),
                    unread_count: 0,
                    peer_id: Some(entry.id.clone()),
                    peer_role: entry.role.clone(),
                    ephemeral: true,
                };
                info!(
                    "Started conversation {} with {}",
                    conversation.id, entry.name
                );
                state.conversations.push(conversation.clone());
                self.persist(&state);
                let _ = self.events.send(ChatEvent::ConversationsChanged);
                conversation
            }
        };

        self.resolver.record(&conversation.id, &entry.id).await;
        Ok(conversation)
    }

    /// Select a conversation: connect on demand, join the thread, seed its
    /// history, clear unread state, and mark inbound messages read.
    ///
    /// Failures here never propagate — a connect/join error or a join
    /// timeout clears the loading state and leaves the conversation empty
    /// rather than blocking the panel.
    pub async fn select_conversation(&self, conversation_id: &str) -> Result<()> {
        let conversation = {
            let mut state = self.state.write().await;
            let conversation = state
                .conversations
                .iter_mut()
                .find(|c| c.id == conversation_id)
                .ok_or_else(|| {
                    ChatError::InvalidInput(format!("unknown conversation {}", conversation_id))
                })?;
            conversation.unread_count = 0;
            let conversation = conversation.clone();
            state.active_conversation = Some(conversation_id.to_string());
            state.loading_conversation = Some(conversation_id.to_string());
            self.persist(&state);
            conversation
        };
        let _ = self.events.send(ChatEvent::ConversationsChanged);

        // Locally-held inbound messages are read-stamped regardless of
        // whether the join below can run
        let Some(peer_id) = self.resolver.resolve(&conversation).await else {
            debug!("Selected conversation {} has no peer yet", conversation_id);
            self.clear_loading().await;
            self.mark_conversation_read(conversation_id).await;
            return Ok(());
        };

        if !self.transport.is_connected() {
            if let Err(e) = self.transport.connect(&self.config.user_id).await {
                warn!("Transport connect failed: {}", e);
                self.clear_loading().await;
                self.mark_conversation_read(conversation_id).await;
                return Ok(());
            }
        }

        match timeout(
            self.config.join_timeout,
            self.transport.join_conversation(&peer_id),
        )
        .await
        {
            Ok(Ok(ack)) if ack.ok => {
                self.seed_history(conversation_id, &ack.messages).await;
            }
            Ok(Ok(_)) => warn!("Join rejected for conversation {}", conversation_id),
            Ok(Err(e)) => warn!("Join failed for conversation {}: {}", conversation_id, e),
            Err(_) => warn!(
                "Join timed out after {:?} for conversation {}",
                self.config.join_timeout, conversation_id
            ),
        }

        self.clear_loading().await;
        self.mark_conversation_read(conversation_id).await;
        Ok(())
    }

    /// Merge a join acknowledgement's history into local state.
    /// Raw payloads go through the wire parser; records already held are
    /// kept, and a record recognized as the server copy of a local send is
    /// folded into the existing row.
    async fn seed_history(&self, conversation_id: &str, payloads: &[Value]) {
        let mut state = self.state.write().await;
        let mut changed = 0usize;
        let mut latest: Option<Message> = None;

        for payload in payloads {
            let Some(mut message) = wire::parse_message(payload) else {
                debug!("Dropped unparseable history record");
                continue;
            };
            message.conversation_id = conversation_id.to_string();
            if state.messages.iter().any(|m| m.id == message.id) {
                continue;
            }

            // A send acked without a server copy kept its temporary id; its
            // server copy arriving in the history would slip past the id
            // check and duplicate the row. Match it back by sender and text
            // and adopt the server id in place.
            if !message.id.starts_with("local-") {
                if let Some(existing) = state.messages.iter_mut().find(|m| {
                    m.conversation_id == conversation_id
                        && m.id.starts_with("local-")
                        && !m.failed
                        && m.sender_id == message.sender_id
                        && m.text == message.text
                }) {
                    existing.id = message.id.clone();
                    existing.created_at = message.created_at;
                    if existing.delivered_at.is_none() {
                        existing.delivered_at = message.delivered_at;
                    }
                    changed += 1;
                    continue;
                }
            }

            if latest
                .as_ref()
                .map(|m| message.created_at > m.created_at)
                .unwrap_or(true)
            {
                latest = Some(message.clone());
            }
            state.messages.push(message);
            changed += 1;
        }

        if let Some(last) = latest {
            if let Some(conv) = state
                .conversations
                .iter_mut()
                .find(|c| c.id == conversation_id)
            {
                conv.touch(&last.text, last.created_at);
            }
        }

        if changed > 0 {
            debug!(
                "Seeded {} history messages for conversation {}",
                changed, conversation_id
            );
            self.persist(&state);
            drop(state);
            let _ = self.events.send(ChatEvent::ConversationsChanged);
        }
    }

    async fn clear_loading(&self) {
        self.state.write().await.loading_conversation = None;
    }

    // ─── Optimistic send pipeline ────────────────────────────────────────────

    /// Send a direct message: the pending row appears immediately, then is
    /// rewritten in place once the server acknowledges, or marked failed.
    /// The returned message is the final state of the row.
    pub async fn send_message(&self, conversation_id: &str, text: &str) -> Result<Message> {
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(ChatError::InvalidInput(
                "message text must not be empty".to_string(),
            ));
        }

        let temp_id = format!("local-{}", Uuid::new_v4());
        let now = Utc::now();

        // Optimistic insert: visible before any network round trip
        let conversation = {
            let mut state = self.state.write().await;
            let conversation = state
                .conversations
                .iter_mut()
                .find(|c| c.id == conversation_id)
                .ok_or_else(|| {
                    ChatError::InvalidInput(format!("unknown conversation {}", conversation_id))
                })?;
            conversation.touch(&text, now);
            let conversation = conversation.clone();

            let message = Message {
                id: temp_id.clone(),
                conversation_id: conversation_id.to_string(),
                sender_id: self.config.user_id.clone(),
                receiver_id: String::new(),
                text: text.clone(),
                created_at: now,
                delivered_at: None,
                read_at: None,
                pending: true,
                failed: false,
            };
            state.messages.push(message.clone());
            self.persist(&state);
            let _ = self.events.send(ChatEvent::NewMessage { message });
            let _ = self.events.send(ChatEvent::ConversationsChanged);
            conversation
        };

        // No peer identity means no dispatch: straight to failed
        let Some(peer_id) = self.resolver.resolve(&conversation).await else {
            debug!("Send {} failed: conversation has no peer", temp_id);
            return self.finish_send(&temp_id, None, SendOutcome::Failed).await;
        };

        let outcome = match self.transport.send_direct_message(&peer_id, &text).await {
            Ok(ack) if ack.ok => SendOutcome::Acked(ack.message),
            Ok(_) => {
                warn!("Send {} rejected by server", temp_id);
                SendOutcome::Failed
            }
            Err(e) => {
                warn!("Send {} transport error: {}", temp_id, e);
                SendOutcome::Failed
            }
        };

        self.finish_send(&temp_id, Some(&peer_id), outcome).await
    }

    /// Rewrite the pending row in place — never remove-then-insert, so the
    /// visible list holds exactly one row per logical send throughout.
    async fn finish_send(
        &self,
        temp_id: &str,
        peer_id: Option<&str>,
        outcome: SendOutcome,
    ) -> Result<Message> {
        let mut state = self.state.write().await;
        let message = state
            .messages
            .iter_mut()
            .find(|m| m.id == temp_id)
            .ok_or_else(|| {
                ChatError::Transport(format!("pending message {} vanished", temp_id))
            })?;

        match outcome {
            SendOutcome::Acked(server_copy) => {
                if let Some(server) = server_copy.as_ref().and_then(wire::parse_message) {
                    message.id = server.id;
                    message.created_at = server.created_at;
                    if !server.text.trim().is_empty() {
                        message.text = server.text;
                    }
                    message.delivered_at = server.delivered_at.or_else(|| Some(Utc::now()));
                } else {
                    message.delivered_at = Some(Utc::now());
                }
                // Guard against echo ambiguity in the server copy
                message.sender_id = self.config.user_id.clone();
                message.pending = false;
                message.failed = false;
            }
            SendOutcome::Failed => {
                message.pending = false;
                message.failed = true;
            }
        }
        if let Some(peer_id) = peer_id {
            message.receiver_id = peer_id.to_string();
        }

        let message = message.clone();
        self.persist(&state);
        drop(state);
        let _ = self.events.send(ChatEvent::MessageUpdated {
            message: message.clone(),
        });
        Ok(message)
    }

    // ─── Inbound event router ────────────────────────────────────────────────

    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::IncomingMessage(payload) => self.handle_incoming(&payload).await,
            TransportEvent::TypingStatus { user_id, is_typing } => {
                self.handle_typing(&user_id, is_typing).await
            }
            TransportEvent::MessageDelivered { message_id, at } => {
                self.apply_receipt(&message_id, at, Receipt::Delivered).await
            }
            TransportEvent::MessageRead { message_id, at } => {
                self.apply_receipt(&message_id, at, Receipt::Read).await
            }
        }
    }

    async fn handle_incoming(&self, payload: &Value) {
        let Some(mut message) = wire::parse_message(payload) else {
            debug!("Dropped unparseable inbound payload");
            return;
        };

        // Echo suppression: our own sends come back through the ack path
        if message.is_from(&self.config.user_id) {
            return;
        }

        let sender_entry = self.cache.get(&message.sender_id).await;

        let mut state = self.state.write().await;

        // At-least-once transport: de-duplicate by id
        if state.messages.iter().any(|m| m.id == message.id) {
            return;
        }

        let target = if let Some(active) = state.active_conversation.clone() {
            Some(active)
        } else if let Some(entry) = &sender_entry {
            let key = crate::types::normalize_title(&entry.name);
            let existing = state
                .conversations
                .iter()
                .find(|c| c.normalized_title() == key)
                .map(|c| c.id.clone());
            match existing {
                Some(id) => Some(id),
                None => {
                    let conversation = ConversationSummary {
                        id: format!("local-{}", Uuid::new_v4()),
                        title: entry.name.clone(),
                        last_message_preview: String::new(),
                        updated_at: message.created_at,
                        unread_count: 0,
                        peer_id: Some(entry.id.clone()),
                        peer_role: entry.role.clone(),
                        ephemeral: true,
                    };
                    info!(
                        "New conversation {} from inbound sender {}",
                        conversation.id, entry.name
                    );
                    let id = conversation.id.clone();
                    state.conversations.push(conversation);
                    Some(id)
                }
            }
        } else {
            None
        };

        let Some(conversation_id) = target else {
            // Unresolvable sender with no open conversation: not recoverable
            debug!(
                "Dropped inbound message from unknown sender {}",
                message.sender_id
            );
            return;
        };

        message.conversation_id = conversation_id.clone();
        let sender_id = message.sender_id.clone();
        let is_active = state.active_conversation.as_deref() == Some(conversation_id.as_str());

        if let Some(conv) = state
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        {
            conv.touch(&message.text, message.created_at);
            if !is_active {
                conv.unread_count += 1;
            }
        }
        state.messages.push(message.clone());
        self.persist(&state);
        drop(state);

        self.resolver.record(&conversation_id, &sender_id).await;
        let _ = self.events.send(ChatEvent::NewMessage { message });
        let _ = self.events.send(ChatEvent::ConversationsChanged);
    }

    async fn handle_typing(&self, user_id: &str, is_typing: bool) {
        let Some(conversation_id) = self.resolver.conversation_for_user(user_id).await else {
            debug!("Typing event from unmapped user {}", user_id);
            return;
        };

        {
            let mut state = self.state.write().await;
            let now = Utc::now();
            if is_typing {
                let deadline = now
                    + chrono::Duration::from_std(self.config.typing_ttl)
                        .unwrap_or_else(|_| chrono::Duration::seconds(5));
                state.typing_until.insert(conversation_id.clone(), deadline);
            } else {
                state.typing_until.remove(&conversation_id);
            }
            // Drop expired indicators while we are here
            state.typing_until.retain(|_, deadline| *deadline > now);
        }

        let _ = self.events.send(ChatEvent::TypingChanged {
            conversation_id,
            is_typing,
        });
    }

    async fn apply_receipt(&self, message_id: &str, at: Option<DateTime<Utc>>, kind: Receipt) {
        let updated = {
            let mut state = self.state.write().await;
            let Some(message) = state.messages.iter_mut().find(|m| m.id == message_id) else {
                debug!("Receipt for unknown message {}", message_id);
                return;
            };
            let stamp = at.unwrap_or_else(Utc::now);
            match kind {
                Receipt::Delivered => message.delivered_at = Some(stamp),
                Receipt::Read => {
                    // A read message was necessarily delivered
                    message.read_at = Some(stamp);
                    message.delivered_at.get_or_insert(stamp);
                }
            }
            let message = message.clone();
            self.persist(&state);
            message
        };
        let _ = self.events.send(ChatEvent::MessageUpdated { message: updated });
    }

    // ─── Read receipts & typing out ──────────────────────────────────────────

    /// Mark the conversation's unread inbound messages read: stamp locally,
    /// then notify the transport fire-and-forget. Messages already carrying
    /// a read timestamp are skipped, so repeated views cost nothing.
    pub async fn mark_conversation_read(&self, conversation_id: &str) {
        let now = Utc::now();
        let newly_read = {
            let mut state = self.state.write().await;
            let user_id = self.config.user_id.clone();
            let mut changed = Vec::new();
            for message in state.messages.iter_mut().filter(|m| {
                m.conversation_id == conversation_id
                    && !m.is_from(&user_id)
                    && m.read_at.is_none()
            }) {
                message.read_at = Some(now);
                changed.push(message.clone());
            }
            if !changed.is_empty() {
                self.persist(&state);
            }
            changed
        };

        for message in newly_read {
            let transport = self.transport.clone();
            let message_id = message.id.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.notify_message_read(&message_id).await {
                    debug!("Read notify for {} failed: {}", message_id, e);
                }
            });
            let _ = self.events.send(ChatEvent::MessageUpdated { message });
        }
    }

    /// Forward the local user's typing state to the peer, best-effort
    pub async fn set_typing(&self, conversation_id: &str, is_typing: bool) {
        let conversation = {
            let state = self.state.read().await;
            state
                .conversations
                .iter()
                .find(|c| c.id == conversation_id)
                .cloned()
        };
        let Some(conversation) = conversation else {
            return;
        };
        let Some(peer_id) = self.resolver.resolve(&conversation).await else {
            return;
        };
        if let Err(e) = self.transport.send_typing_status(&peer_id, is_typing).await {
            debug!("Typing status send failed: {}", e);
        }
    }

    // ─── Accessors ───────────────────────────────────────────────────────────

    /// Conversation list, freshest first. Computed at read time.
    pub async fn conversations(&self) -> Vec<ConversationSummary> {
        let state = self.state.read().await;
        let mut list = state.conversations.clone();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        list
    }

    /// A conversation's messages sorted by creation time, independent of
    /// arrival order. Computed at read time, not stored order.
    pub async fn messages_for(&self, conversation_id: &str) -> Vec<Message> {
        let state = self.state.read().await;
        let mut list: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        list
    }

    pub async fn active_conversation(&self) -> Option<String> {
        self.state.read().await.active_conversation.clone()
    }

    pub async fn is_loading(&self) -> bool {
        self.state.read().await.loading_conversation.is_some()
    }

    /// Is the peer in this conversation currently typing?
    pub async fn is_peer_typing(&self, conversation_id: &str) -> bool {
        let state = self.state.read().await;
        state
            .typing_until
            .get(conversation_id)
            .map(|deadline| *deadline > Utc::now())
            .unwrap_or(false)
    }

    // ─── Persistence ─────────────────────────────────────────────────────────

    /// Persist the full view. Called at every mutation site while the write
    /// lock is held, so the saved snapshot is never a partial patch.
    fn persist(&self, state: &ChatState) {
        self.store.save(&Snapshot {
            conversations: state.conversations.clone(),
            messages: state.messages.clone(),
        });
    }
}

impl Clone for ChatClient {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            store: self.store.clone(),
            transport: self.transport.clone(),
            cache: self.cache.clone(),
            directory: self.directory.clone(),
            resolver: self.resolver.clone(),
            state: self.state.clone(),
            events: self.events.clone(),
        }
    }
}

enum SendOutcome {
    /// Positive acknowledgement, possibly carrying the server's copy
    Acked(Option<Value>),
    Failed,
}

enum Receipt {
    Delivered,
    Read,
}
