/// Peer resolution: mapping a conversation to the remote identity that
/// messages must be addressed to.
///
/// Fallback chain, short-circuiting on first success:
///   1. cached mapping for this conversation
///   2. peer id embedded in the conversation record (server thread list)
///   3. exact title match against a cached directory entry name
///   4. one unfiltered directory fetch when the cache is empty, then retry 3
///
/// A `None` result means the caller must mark the action failed; resolution
/// itself never errors out.
use crate::directory::{DirectoryClient, PeerDirectoryCache};
use crate::types::ConversationSummary;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub struct PeerResolver {
    /// conversation_id -> peer_id; the load-bearing cache that avoids
    /// repeated name-based guessing
    mapping: Arc<RwLock<HashMap<String, String>>>,
    cache: PeerDirectoryCache,
    directory: Arc<dyn DirectoryClient>,
}

impl PeerResolver {
    pub fn new(cache: PeerDirectoryCache, directory: Arc<dyn DirectoryClient>) -> Self {
        Self {
            mapping: Arc::new(RwLock::new(HashMap::new())),
            cache,
            directory,
        }
    }

    /// Resolve the remote identity for a conversation, recording the result
    /// for reuse on every subsequent send.
    pub async fn resolve(&self, conversation: &ConversationSummary) -> Option<String> {
        if let Some(peer_id) = self.mapping.read().await.get(&conversation.id).cloned() {
            return Some(peer_id);
        }

        if let Some(peer_id) = conversation.peer_id.clone() {
            self.record(&conversation.id, &peer_id).await;
            return Some(peer_id);
        }

        if let Some(entry) = self.cache.find_by_name(&conversation.title).await {
            self.record(&conversation.id, &entry.id).await;
            return Some(entry.id);
        }

        // Cold cache: one unfiltered fetch, then a single retry of the name match
        if self.cache.is_empty().await {
            match self.directory.search_candidates(None).await {
                Ok(entries) => self.cache.merge(entries).await,
                Err(e) => warn!("Directory fetch during resolution failed: {}", e),
            }
            if let Some(entry) = self.cache.find_by_name(&conversation.title).await {
                self.record(&conversation.id, &entry.id).await;
                return Some(entry.id);
            }
        }

        debug!(
            "No peer identity for conversation {} ({})",
            conversation.id, conversation.title
        );
        None
    }

    /// Record a known conversation -> peer association
    pub async fn record(&self, conversation_id: &str, peer_id: &str) {
        self.mapping
            .write()
            .await
            .insert(conversation_id.to_string(), peer_id.to_string());
    }

    /// Reverse lookup: which conversation does this remote user map to?
    /// Used to attribute typing events.
    pub async fn conversation_for_user(&self, peer_id: &str) -> Option<String> {
        self.mapping
            .read()
            .await
            .iter()
            .find(|(_, mapped)| mapped.as_str() == peer_id)
            .map(|(conversation_id, _)| conversation_id.clone())
    }

    /// Move a mapping to a new conversation id (server confirmed a
    /// locally-created conversation under its own id)
    pub async fn rekey(&self, old_id: &str, new_id: &str) {
        let mut mapping = self.mapping.write().await;
        if let Some(peer_id) = mapping.remove(old_id) {
            mapping.insert(new_id.to_string(), peer_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::types::PeerDirectoryEntry;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubDirectory {
        entries: Vec<PeerDirectoryEntry>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DirectoryClient for StubDirectory {
        async fn search_candidates(&self, _query: Option<&str>) -> Result<Vec<PeerDirectoryEntry>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.entries.clone())
        }
    }

    fn conversation(id: &str, title: &str, peer_id: Option<&str>) -> ConversationSummary {
        ConversationSummary {
            id: id.to_string(),
            title: title.to_string(),
            last_message_preview: String::new(),
            updated_at: Utc::now(),
            unread_count: 0,
            peer_id: peer_id.map(str::to_string),
            peer_role: None,
            ephemeral: false,
        }
    }

    fn resolver_with(entries: Vec<PeerDirectoryEntry>) -> (PeerResolver, Arc<StubDirectory>) {
        let directory = Arc::new(StubDirectory {
            entries,
            calls: AtomicUsize::new(0),
        });
        let resolver = PeerResolver::new(PeerDirectoryCache::new(), directory.clone());
        (resolver, directory)
    }

    #[tokio::test]
    async fn test_embedded_peer_id_wins_and_is_recorded() {
        let (resolver, directory) = resolver_with(vec![]);
        let conv = conversation("c1", "Ann Lee", Some("u9"));

        assert_eq!(resolver.resolve(&conv).await.as_deref(), Some("u9"));
        // Second resolve hits the mapping, not the record fields
        let bare = conversation("c1", "Ann Lee", None);
        assert_eq!(resolver.resolve(&bare).await.as_deref(), Some("u9"));
        assert_eq!(directory.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cold_cache_triggers_one_fetch_then_matches_by_name() {
        let (resolver, directory) = resolver_with(vec![PeerDirectoryEntry {
            id: "u9".to_string(),
            name: "Ann Lee".to_string(),
            role: Some("student".to_string()),
        }]);
        let conv = conversation("c1", "Ann Lee", None);

        assert_eq!(resolver.resolve(&conv).await.as_deref(), Some("u9"));
        assert_eq!(directory.calls.load(Ordering::SeqCst), 1);

        // Mapping now short-circuits; no further network
        assert_eq!(resolver.resolve(&conv).await.as_deref(), Some("u9"));
        assert_eq!(directory.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unresolvable_returns_none() {
        let (resolver, _) = resolver_with(vec![]);
        let conv = conversation("c1", "Nobody", None);
        assert!(resolver.resolve(&conv).await.is_none());
    }

    #[tokio::test]
    async fn test_rekey_and_reverse_lookup() {
        let (resolver, _) = resolver_with(vec![]);
        resolver.record("local-1", "u9").await;
        assert_eq!(
            resolver.conversation_for_user("u9").await.as_deref(),
            Some("local-1")
        );

        resolver.rekey("local-1", "srv-7").await;
        assert_eq!(
            resolver.conversation_for_user("u9").await.as_deref(),
            Some("srv-7")
        );
    }
}
