//! Bounded, insertion-ordered key index used to suppress duplicate messages.
//!
//! The cache only remembers keys. Evicting a key means a later duplicate is no
//! longer suppressed; it never touches messages already stored elsewhere.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use chorus_wire::ChatMessage;

/// Default number of keys remembered
pub const DEFAULT_MAX_CACHE_SIZE: usize = 1000;

/// Derives the dedup key of a message
pub type KeyGenerator = Arc<dyn Fn(&ChatMessage) -> String + Send + Sync>;

/// Deduplication policy
#[derive(Clone)]
pub struct DedupConfig {
    /// Whether duplicate suppression is on
    pub enabled: bool,
    /// Custom key derivation (defaults to the message id)
    pub key_generator: Option<KeyGenerator>,
    /// Maximum number of keys kept before the oldest is evicted
    pub max_cache_size: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_generator: None,
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
        }
    }
}

impl fmt::Debug for DedupConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DedupConfig")
            .field("enabled", &self.enabled)
            .field("key_generator", &self.key_generator.is_some())
            .field("max_cache_size", &self.max_cache_size)
            .finish()
    }
}

impl DedupConfig {
    /// Disable deduplication
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Use a custom key generator
    pub fn with_key_generator(
        mut self,
        f: impl Fn(&ChatMessage) -> String + Send + Sync + 'static,
    ) -> Self {
        self.key_generator = Some(Arc::new(f));
        self
    }

    /// Compute the key for a message
    pub fn key_for(&self, message: &ChatMessage) -> String {
        match &self.key_generator {
            Some(generate) => generate(message),
            None => message.id.clone(),
        }
    }
}

/// FIFO-evicting key set
#[derive(Debug, Clone)]
pub struct DedupCache {
    capacity: usize,
    order: VecDeque<String>,
    keys: HashSet<String>,
}

impl DedupCache {
    /// Create a cache holding at most `capacity` keys (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity.min(1024)),
            keys: HashSet::new(),
        }
    }

    /// Insert a key. Returns `false` if it was already present.
    pub fn insert(&mut self, key: String) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        self.keys.insert(key.clone());
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
        true
    }

    /// Forget a key. Returns `true` if it was present.
    pub fn remove(&mut self, key: &str) -> bool {
        if !self.keys.remove(key) {
            return false;
        }
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.keys.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_rejects_duplicates() {
        let mut cache = DedupCache::new(10);
        assert!(cache.insert("a".into()));
        assert!(!cache.insert("a".into()));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_oldest_key_evicted() {
        let mut cache = DedupCache::new(2);
        cache.insert("a".into());
        cache.insert("b".into());
        cache.insert("c".into());
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(cache.contains("c"));
        assert_eq!(cache.len(), 2);
        // An evicted key is admitted again
        assert!(cache.insert("a".into()));
        assert!(!cache.contains("b"));
    }

    #[test]
    fn test_remove_then_reinsert() {
        let mut cache = DedupCache::new(5);
        cache.insert("a".into());
        cache.insert("b".into());
        assert!(cache.remove("a"));
        assert!(!cache.remove("a"));
        assert!(cache.insert("a".into()));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut cache = DedupCache::new(0);
        assert_eq!(cache.capacity(), 1);
        cache.insert("a".into());
        cache.insert("b".into());
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("b"));
    }

    #[test]
    fn test_custom_key_generator() {
        let config = DedupConfig::default().with_key_generator(|m| m.text_content());
        let a = ChatMessage::text("x", "y", "same");
        let b = ChatMessage::text("x", "y", "same");
        assert_ne!(a.id, b.id);
        assert_eq!(config.key_for(&a), config.key_for(&b));
        assert_eq!(DedupConfig::default().key_for(&a), a.id);
    }
}
