//! Channel subscriptions.
//!
//! Stores which clients subscribed to which channel patterns, so a publish
//! on a concrete channel can find every recipient.

use comet_core::channel::matches;
use std::collections::{BTreeSet, HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::debug;

/// Registry of channel subscriptions.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    /// Subscribed client ids, keyed by channel pattern.
    patterns: RwLock<HashMap<String, HashSet<String>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a client. Returns `false` if it was already subscribed.
    pub async fn subscribe(&self, pattern: &str, client_id: &str) -> bool {
        let mut patterns = self.patterns.write().await;
        let added = patterns
            .entry(pattern.to_string())
            .or_default()
            .insert(client_id.to_string());
        if added {
            debug!(client_id, pattern, "subscribed");
        }
        added
    }

    /// Unsubscribe a client. Returns `false` if it was not subscribed.
    pub async fn unsubscribe(&self, pattern: &str, client_id: &str) -> bool {
        let mut patterns = self.patterns.write().await;
        let Some(clients) = patterns.get_mut(pattern) else {
            return false;
        };
        let removed = clients.remove(client_id);
        if clients.is_empty() {
            patterns.remove(pattern);
        }
        if removed {
            debug!(client_id, pattern, "unsubscribed");
        }
        removed
    }

    /// Drop every subscription held by a client.
    pub async fn unsubscribe_all(&self, client_id: &str) {
        let mut patterns = self.patterns.write().await;
        patterns.retain(|_, clients| {
            clients.remove(client_id);
            !clients.is_empty()
        });
    }

    /// Every client subscribed to a pattern matching `channel`, each once.
    pub async fn subscribers(&self, channel: &str) -> Vec<String> {
        let patterns = self.patterns.read().await;
        let recipients: BTreeSet<&String> = patterns
            .iter()
            .filter(|(pattern, _)| matches(pattern, channel))
            .flat_map(|(_, clients)| clients.iter())
            .collect();
        recipients.into_iter().cloned().collect()
    }

    /// Number of patterns with at least one subscriber.
    pub async fn count(&self) -> usize {
        self.patterns.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_route() {
        let registry = ChannelRegistry::new();
        assert!(registry.subscribe("/chat/room", "a").await);
        assert!(!registry.subscribe("/chat/room", "a").await);
        registry.subscribe("/chat/*", "b").await;
        registry.subscribe("/chat/**", "a").await;
        registry.subscribe("/other", "c").await;

        assert_eq!(registry.subscribers("/chat/room").await, ["a", "b"]);
        assert_eq!(registry.subscribers("/chat/room/x").await, ["a"]);
        assert!(registry.subscribers("/nobody").await.is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_cleans_up_empty_patterns() {
        let registry = ChannelRegistry::new();
        registry.subscribe("/a", "x").await;
        assert!(registry.unsubscribe("/a", "x").await);
        assert!(!registry.unsubscribe("/a", "x").await);
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn unsubscribe_all_removes_client_everywhere() {
        let registry = ChannelRegistry::new();
        registry.subscribe("/a", "x").await;
        registry.subscribe("/b", "x").await;
        registry.subscribe("/b", "y").await;

        registry.unsubscribe_all("x").await;

        assert!(registry.subscribers("/a").await.is_empty());
        assert_eq!(registry.subscribers("/b").await, ["y"]);
        assert_eq!(registry.count().await, 1);
    }
}
