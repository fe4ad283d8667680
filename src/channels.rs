//! Channel-key store
//!
//! Publish authentication: a channel (stream name) maps to an opaque key
//! the publisher uses as the last path segment of its publish URL. The
//! mapping is bidirectional so the server can resolve an incoming key back
//! to the channel it authorises.
//!
//! The trait is the seam for a remote (e.g. Redis-backed) store; the
//! in-process map is the default.

use std::collections::HashMap;
use std::sync::Mutex;

const KEY_LEN: usize = 48;

/// Bidirectional channel <-> key registry
pub trait KeyStore: Send + Sync {
    /// Create (or replace) the key for a channel
    fn set_key(&self, channel: &str) -> String;

    /// Key for a channel, creating one on first use
    fn get_key(&self, channel: &str) -> String;

    /// Channel a key authorises, if the key is known
    fn get_channel(&self, key: &str) -> Option<String>;

    fn delete_channel(&self, channel: &str) -> bool;

    fn delete_key(&self, key: &str) -> bool;
}

/// In-process key store
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    inner: Mutex<Maps>,
}

#[derive(Debug, Default)]
struct Maps {
    channel_to_key: HashMap<String, String>,
    key_to_channel: HashMap<String, String>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn set_key(&self, channel: &str) -> String {
        let mut maps = self.inner.lock().unwrap();

        if let Some(old) = maps.channel_to_key.remove(channel) {
            maps.key_to_channel.remove(&old);
        }

        let key = loop {
            let candidate = nanoid::nanoid!(KEY_LEN);
            if !maps.key_to_channel.contains_key(&candidate) {
                break candidate;
            }
        };

        maps.channel_to_key
            .insert(channel.to_string(), key.clone());
        maps.key_to_channel
            .insert(key.clone(), channel.to_string());
        key
    }

    fn get_key(&self, channel: &str) -> String {
        if let Some(key) = self.inner.lock().unwrap().channel_to_key.get(channel) {
            return key.clone();
        }
        let key = self.set_key(channel);
        tracing::debug!(channel, "new channel key issued");
        key
    }

    fn get_channel(&self, key: &str) -> Option<String> {
        self.inner.lock().unwrap().key_to_channel.get(key).cloned()
    }

    fn delete_channel(&self, channel: &str) -> bool {
        let mut maps = self.inner.lock().unwrap();
        match maps.channel_to_key.remove(channel) {
            Some(key) => {
                maps.key_to_channel.remove(&key);
                true
            }
            None => false,
        }
    }

    fn delete_key(&self, key: &str) -> bool {
        let mut maps = self.inner.lock().unwrap();
        match maps.key_to_channel.remove(key) {
            Some(channel) => {
                maps.channel_to_key.remove(&channel);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_roundtrip() {
        let store = MemoryKeyStore::new();
        let key = store.get_key("movie");
        assert_eq!(key.len(), KEY_LEN);
        assert_eq!(store.get_channel(&key).as_deref(), Some("movie"));
    }

    #[test]
    fn get_key_is_stable() {
        let store = MemoryKeyStore::new();
        assert_eq!(store.get_key("movie"), store.get_key("movie"));
    }

    #[test]
    fn set_key_rotates() {
        let store = MemoryKeyStore::new();
        let old = store.get_key("movie");
        let new = store.set_key("movie");
        assert_ne!(old, new);
        assert!(store.get_channel(&old).is_none());
        assert_eq!(store.get_channel(&new).as_deref(), Some("movie"));
    }

    #[test]
    fn unknown_key_rejected() {
        let store = MemoryKeyStore::new();
        assert!(store.get_channel("bogus").is_none());
    }

    #[test]
    fn deletion_clears_both_directions() {
        let store = MemoryKeyStore::new();
        let key = store.get_key("movie");

        assert!(store.delete_channel("movie"));
        assert!(store.get_channel(&key).is_none());
        assert!(!store.delete_channel("movie"));

        let key = store.get_key("movie");
        assert!(store.delete_key(&key));
        assert_ne!(store.get_key("movie"), key);
    }
}
