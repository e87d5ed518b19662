/// Conversation reconciliation: merge the server's authoritative thread list
/// with the locally-held list into one de-duplicated, freshness-ordered list.
///
/// The de-duplication key is the normalized title. Two distinct peers with
/// accidentally identical normalized titles collapse into a single entry;
/// that is a known limitation of the title-based key, preserved on purpose.
use crate::types::{normalize_title, ConversationSummary};
use std::collections::HashMap;

/// Merge candidates in the order [server, local], keeping for each
/// normalized title whichever candidate has the strictly greater
/// `updated_at`. The result is sorted freshest-first. Idempotent and
/// order-independent for fixed inputs.
pub fn reconcile(
    server: &[ConversationSummary],
    local: &[ConversationSummary],
) -> Vec<ConversationSummary> {
    let mut by_title: HashMap<String, ConversationSummary> = HashMap::new();

    for candidate in server.iter().chain(local.iter()) {
        let key = normalize_title(&candidate.title);
        match by_title.get(&key) {
            Some(existing) if candidate.updated_at <= existing.updated_at => {}
            _ => {
                by_title.insert(key, candidate.clone());
            }
        }
    }

    let mut merged: Vec<ConversationSummary> = by_title.into_values().collect();
    merged.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
    merged
}

/// Pairs of (old local id, new id) for conversations whose entry was re-keyed
/// by reconciliation, so message ownership and peer mappings can follow.
pub fn rekeyed_ids(
    before: &[ConversationSummary],
    after: &[ConversationSummary],
) -> Vec<(String, String)> {
    let old_by_title: HashMap<String, &ConversationSummary> = before
        .iter()
        .map(|c| (normalize_title(&c.title), c))
        .collect();

    after
        .iter()
        .filter_map(|conv| {
            let old = old_by_title.get(&normalize_title(&conv.title))?;
            (old.id != conv.id).then(|| (old.id.clone(), conv.id.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn conv(id: &str, title: &str, updated_secs: i64) -> ConversationSummary {
        ConversationSummary {
            id: id.to_string(),
            title: title.to_string(),
            last_message_preview: String::new(),
            updated_at: Utc.timestamp_opt(updated_secs, 0).single().unwrap(),
            unread_count: 0,
            peer_id: None,
            peer_role: None,
            ephemeral: false,
        }
    }

    #[test]
    fn test_ephemeral_conversation_visible_before_server_confirms() {
        let server = vec![conv("srv-1", "Bo Chen", 100)];
        let local = vec![conv("local-1", "Ann Lee", 200)];

        let merged = reconcile(&server, &local);
        assert_eq!(merged.len(), 2);
        // Freshest first
        assert_eq!(merged[0].id, "local-1");
        assert_eq!(merged[1].id, "srv-1");
    }

    #[test]
    fn test_fresher_server_record_replaces_local_duplicate() {
        let server = vec![conv("srv-7", "Ann Lee", 300)];
        let local = vec![conv("local-1", "ann lee ", 200)];

        let merged = reconcile(&server, &local);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, "srv-7");
    }

    #[test]
    fn test_stale_server_record_does_not_replace_fresher_local() {
        let server = vec![conv("srv-7", "Ann Lee", 100)];
        let local = vec![conv("local-1", "Ann Lee", 200)];

        let merged = reconcile(&server, &local);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, "local-1");
    }

    #[test]
    fn test_equal_timestamps_keep_the_server_entry() {
        // Replacement requires strictly greater freshness
        let server = vec![conv("srv-7", "Ann Lee", 200)];
        let local = vec![conv("local-1", "Ann Lee", 200)];

        let merged = reconcile(&server, &local);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, "srv-7");
    }

    #[test]
    fn test_idempotent() {
        let server = vec![conv("srv-1", "Bo Chen", 100), conv("srv-7", "Ann Lee", 300)];
        let local = vec![conv("local-1", "Ann Lee", 200), conv("local-2", "Cy Day", 50)];

        let first = reconcile(&server, &local);
        let second = reconcile(&server, &first);
        assert_eq!(first, second);
    }

    #[test]
    fn test_rekeyed_ids() {
        let before = vec![conv("local-1", "Ann Lee", 200), conv("srv-1", "Bo Chen", 100)];
        let after = vec![conv("srv-7", "Ann Lee", 300), conv("srv-1", "Bo Chen", 100)];

        let remaps = rekeyed_ids(&before, &after);
        assert_eq!(remaps, vec![("local-1".to_string(), "srv-7".to_string())]);
    }
}
