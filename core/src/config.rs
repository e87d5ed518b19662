/// Configuration management
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_TYPING_TTL: Duration = Duration::from_secs(5);

/// Chat client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Identifier of the local authenticated user
    pub user_id: String,

    /// Base URL of the directory lookup service
    pub directory_url: String,

    /// How long to wait for a conversation join before clearing the loading state
    pub join_timeout: Duration,

    /// How long a peer's typing indicator stays alive without a refresh
    pub typing_ttl: Duration,

    /// Optional data directory for the persisted snapshot (in-memory store when unset)
    pub data_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            directory_url: "http://127.0.0.1:4000".to_string(),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            typing_ttl: DEFAULT_TYPING_TTL,
            data_dir: None,
        }
    }
}

impl Config {
    /// Create a config for the given user, applying environment overrides
    pub fn for_user(user_id: impl Into<String>) -> Result<Self> {
        let user_id = user_id.into();
        if user_id.trim().is_empty() {
            return Err(ChatError::Config("user_id must not be empty".to_string()));
        }

        let mut config = Self {
            user_id,
            ..Default::default()
        };

        // Env overrides (nice for scripts)
        if let Ok(url) = std::env::var("CLASSLINK_DIRECTORY_URL") {
            config.directory_url = url;
        }
        if let Some(secs) = std::env::var("CLASSLINK_JOIN_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            config.join_timeout = Duration::from_secs(secs);
        }
        if let Ok(dir) = std::env::var("CLASSLINK_DATA_DIR") {
            config.data_dir = Some(PathBuf::from(dir));
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_user_rejects_empty_id() {
        assert!(Config::for_user("   ").is_err());
    }

    #[test]
    fn test_for_user_defaults() {
        let config = Config::for_user("u1").unwrap();
        assert_eq!(config.user_id, "u1");
        assert_eq!(config.directory_url, "http://127.0.0.1:4000");
        assert_eq!(config.typing_ttl, DEFAULT_TYPING_TTL);
    }

    #[test]
    fn test_for_user_env_overrides() {
        std::env::set_var("CLASSLINK_JOIN_TIMEOUT_SECS", "3");
        std::env::set_var("CLASSLINK_DATA_DIR", "/tmp/classlink-data");
        let config = Config::for_user("u1").unwrap();
        std::env::remove_var("CLASSLINK_JOIN_TIMEOUT_SECS");
        std::env::remove_var("CLASSLINK_DATA_DIR");

        assert_eq!(config.join_timeout, Duration::from_secs(3));
        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/classlink-data")));
    }
}
