/// Directory lookup: candidate peers by search query, cached in memory.
/// The cache is refreshed on demand and on every explicit search; a lookup
/// failure leaves the cache as-is so resolution can still run against
/// whatever was fetched earlier.
use crate::error::{ChatError, Result};
use crate::types::PeerDirectoryEntry;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Seam for the remote lookup collaborator
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Search candidate peers. `None` returns the unfiltered listing.
    async fn search_candidates(&self, query: Option<&str>) -> Result<Vec<PeerDirectoryEntry>>;
}

/// REST client for the directory service: `GET {base}/search[?q=...]`
pub struct HttpDirectoryClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpDirectoryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl DirectoryClient for HttpDirectoryClient {
    async fn search_candidates(&self, query: Option<&str>) -> Result<Vec<PeerDirectoryEntry>> {
        let url = format!("{}/search", self.base_url.trim_end_matches('/'));
        let mut request = self.http.get(&url);
        if let Some(q) = query {
            request = request.query(&[("q", q)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ChatError::Directory(format!("search request: {}", e)))?
            .error_for_status()
            .map_err(|e| ChatError::Directory(format!("search status: {}", e)))?;

        response
            .json::<Vec<PeerDirectoryEntry>>()
            .await
            .map_err(|e| ChatError::Directory(format!("search body: {}", e)))
    }
}

/// In-memory cache of directory entries, keyed by peer id.
/// Names are not guaranteed unique; `find_by_name` returns the first match.
#[derive(Clone, Default)]
pub struct PeerDirectoryCache {
    entries: Arc<RwLock<HashMap<String, PeerDirectoryEntry>>>,
}

impl PeerDirectoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge freshly fetched entries into the cache
    pub async fn merge(&self, entries: Vec<PeerDirectoryEntry>) {
        let mut cache = self.entries.write().await;
        for entry in entries {
            debug!("Directory entry cached: {} ({})", entry.name, entry.id);
            cache.insert(entry.id.clone(), entry);
        }
    }

    pub async fn get(&self, peer_id: &str) -> Option<PeerDirectoryEntry> {
        self.entries.read().await.get(peer_id).cloned()
    }

    /// Exact match of a trimmed display name against cached entries
    pub async fn find_by_name(&self, name: &str) -> Option<PeerDirectoryEntry> {
        let wanted = name.trim();
        self.entries
            .read()
            .await
            .values()
            .find(|entry| entry.name.trim() == wanted)
            .cloned()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn list(&self) -> Vec<PeerDirectoryEntry> {
        self.entries.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, name: &str) -> PeerDirectoryEntry {
        PeerDirectoryEntry {
            id: id.to_string(),
            name: name.to_string(),
            role: None,
        }
    }

    #[tokio::test]
    async fn test_merge_and_lookup() {
        let cache = PeerDirectoryCache::new();
        assert!(cache.is_empty().await);

        cache.merge(vec![entry("u9", "Ann Lee"), entry("u10", "Bo Chen")]).await;
        assert!(!cache.is_empty().await);
        assert_eq!(cache.get("u9").await.unwrap().name, "Ann Lee");
        assert_eq!(cache.find_by_name(" Ann Lee ").await.unwrap().id, "u9");
        assert!(cache.find_by_name("nobody").await.is_none());
    }

    #[tokio::test]
    async fn test_merge_replaces_by_id() {
        let cache = PeerDirectoryCache::new();
        cache.merge(vec![entry("u9", "Ann Lee")]).await;
        cache.merge(vec![entry("u9", "Ann L. Lee")]).await;
        assert_eq!(cache.list().await.len(), 1);
        assert_eq!(cache.get("u9").await.unwrap().name, "Ann L. Lee");
    }
}
