/// ClassLink Chat Core
///
/// The conversation/message synchronization engine for the ClassLink
/// course-management client: snapshot persistence, conversation
/// reconciliation, peer resolution, the optimistic send pipeline, and the
/// inbound event router. The event transport and the directory lookup
/// service are external collaborators behind the `Transport` and
/// `DirectoryClient` seams.

pub mod client;
pub mod config;
pub mod directory;
pub mod error;
pub mod reconcile;
pub mod resolver;
pub mod snapshot;
pub mod transport;
pub mod types;
pub mod wire;

pub use client::ChatClient;
pub use config::Config;
pub use error::{ChatError, Result};
pub use types::{ChatEvent, ConversationSummary, Message, PeerDirectoryEntry};
