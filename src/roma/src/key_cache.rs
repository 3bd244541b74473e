//! TTL-bounded cache of decrypted private keys.
//!
//! The key source (a vending service client) is an external collaborator;
//! this module only drives it: refresh on demand, decode what comes back,
//! and evict entries older than the TTL. The eviction cutoff is computed on
//! the local clock as `now − ttl`; under clock skew against the source's
//! `creation_time` stamps, keys may be evicted early or retained late by
//! the skew amount.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;

/// One decrypted private key held in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateKey {
    /// Key id clients reference in requests.
    pub key_id: String,
    /// The raw private key bytes.
    pub key_bytes: Vec<u8>,
    /// Creation time as reported by the key source.
    pub creation_time: SystemTime,
}

/// An undecoded key as returned by the key source.
#[derive(Debug, Clone)]
pub struct EncryptedPrivateKey {
    /// Key id clients reference in requests.
    pub key_id: String,
    /// Base64-encoded keyset carrying the key material. A keyset is a
    /// sequence of 4-byte little-endian length-prefixed entries and must
    /// hold exactly one key.
    pub private_key: String,
    /// Creation time as reported by the key source.
    pub creation_time: SystemTime,
}

/// The external key-vending seam: returns keys no older than `max_age`.
pub trait PrivateKeySource: Send + Sync {
    /// Fetch the current set of keys.
    fn list_private_keys(&self, max_age: Duration) -> anyhow::Result<Vec<EncryptedPrivateKey>>;
}

/// TTL-bounded mapping of key id to decrypted private key.
pub struct PrivateKeyCache {
    source: Box<dyn PrivateKeySource>,
    ttl: Duration,
    keys: Mutex<HashMap<String, PrivateKey>>,
}

impl PrivateKeyCache {
    /// Build a cache over `source` with the given entry TTL.
    pub fn new(source: Box<dyn PrivateKeySource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch fresh keys from the source, then evict entries older than the
    /// TTL on the local clock.
    ///
    /// Keys whose keyset fails to decode, or does not hold exactly one key,
    /// are skipped with an error log; a partial refresh still succeeds.
    pub fn refresh(&self) -> anyhow::Result<()> {
        tracing::debug!("refreshing private keys");
        let fetched = self.source.list_private_keys(self.ttl)?;

        let mut keys = self.keys.lock();
        for encrypted in fetched {
            let Ok(keyset_bytes) = BASE64.decode(encrypted.private_key.as_bytes()) else {
                tracing::error!(key_id = %encrypted.key_id, "could not base64-decode the keyset");
                continue;
            };
            let Some(entries) = parse_keyset(&keyset_bytes) else {
                tracing::error!(key_id = %encrypted.key_id, "could not parse the keyset");
                continue;
            };
            if entries.len() != 1 {
                tracing::error!(
                    key_id = %encrypted.key_id,
                    keys = entries.len(),
                    "keyset must contain exactly one key"
                );
                continue;
            }
            let key_bytes = entries.into_iter().next().unwrap_or_default();
            if key_bytes.is_empty() {
                tracing::error!(key_id = %encrypted.key_id, "key decoded to zero bytes");
                continue;
            }
            tracing::debug!(key_id = %encrypted.key_id, "caching private key");
            keys.insert(
                encrypted.key_id.clone(),
                PrivateKey {
                    key_id: encrypted.key_id,
                    key_bytes,
                    creation_time: encrypted.creation_time,
                },
            );
        }

        // Local-clock cutoff; see the module docs for skew behavior.
        let cutoff = SystemTime::now() - self.ttl;
        keys.retain(|_, key| key.creation_time >= cutoff);
        tracing::debug!(cached = keys.len(), "private key refresh complete");
        Ok(())
    }

    /// Look up a key by id.
    pub fn get_key(&self, key_id: &str) -> Option<PrivateKey> {
        self.keys.lock().get(key_id).cloned()
    }
}

/// Split a decoded keyset into its entries. A keyset is a sequence of
/// 4-byte little-endian length-prefixed entries; trailing or truncated
/// bytes make the whole keyset invalid.
fn parse_keyset(mut bytes: &[u8]) -> Option<Vec<Vec<u8>>> {
    let mut entries = Vec::new();
    while !bytes.is_empty() {
        let (len, rest) = bytes.split_at_checked(4)?;
        let len = u32::from_le_bytes(len.try_into().ok()?) as usize;
        let (entry, rest) = rest.split_at_checked(len)?;
        entries.push(entry.to_vec());
        bytes = rest;
    }
    Some(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource(Vec<EncryptedPrivateKey>);

    impl PrivateKeySource for FixedSource {
        fn list_private_keys(&self, _max_age: Duration) -> anyhow::Result<Vec<EncryptedPrivateKey>> {
            Ok(self.0.clone())
        }
    }

    fn keyset(keys: &[&[u8]]) -> String {
        let mut blob = Vec::new();
        for key in keys {
            blob.extend_from_slice(&(key.len() as u32).to_le_bytes());
            blob.extend_from_slice(key);
        }
        BASE64.encode(blob)
    }

    fn encoded_key(key_id: &str, bytes: &[u8], age: Duration) -> EncryptedPrivateKey {
        EncryptedPrivateKey {
            key_id: key_id.to_string(),
            private_key: keyset(&[bytes]),
            creation_time: SystemTime::now() - age,
        }
    }

    #[test]
    fn refresh_caches_decoded_keys() {
        let cache = PrivateKeyCache::new(
            Box::new(FixedSource(vec![encoded_key("k1", b"key material", Duration::ZERO)])),
            Duration::from_secs(3600),
        );
        cache.refresh().unwrap();

        let key = cache.get_key("k1").unwrap();
        assert_eq!(key.key_bytes, b"key material");
        assert!(cache.get_key("k2").is_none());
    }

    #[test]
    fn undecodable_keys_are_skipped() {
        let bad = EncryptedPrivateKey {
            key_id: "bad".to_string(),
            private_key: "not!!base64".to_string(),
            creation_time: SystemTime::now(),
        };
        let cache = PrivateKeyCache::new(
            Box::new(FixedSource(vec![bad, encoded_key("good", b"k", Duration::ZERO)])),
            Duration::from_secs(3600),
        );
        cache.refresh().unwrap();

        assert!(cache.get_key("bad").is_none());
        assert!(cache.get_key("good").is_some());
    }

    #[test]
    fn keysets_without_exactly_one_key_are_skipped() {
        let two_keys = EncryptedPrivateKey {
            key_id: "two".to_string(),
            private_key: keyset(&[b"first", b"second"]),
            creation_time: SystemTime::now(),
        };
        let empty = EncryptedPrivateKey {
            key_id: "empty".to_string(),
            private_key: keyset(&[]),
            creation_time: SystemTime::now(),
        };
        let cache = PrivateKeyCache::new(
            Box::new(FixedSource(vec![
                two_keys,
                empty,
                encoded_key("sole", b"k", Duration::ZERO),
            ])),
            Duration::from_secs(3600),
        );
        cache.refresh().unwrap();

        assert!(cache.get_key("two").is_none());
        assert!(cache.get_key("empty").is_none());
        assert_eq!(cache.get_key("sole").unwrap().key_bytes, b"k");
    }

    #[test]
    fn truncated_keysets_are_skipped() {
        let truncated = EncryptedPrivateKey {
            key_id: "truncated".to_string(),
            // Length prefix claims more bytes than follow.
            private_key: BASE64.encode(8u32.to_le_bytes().iter().chain(b"abc").copied().collect::<Vec<u8>>()),
            creation_time: SystemTime::now(),
        };
        let cache = PrivateKeyCache::new(
            Box::new(FixedSource(vec![truncated])),
            Duration::from_secs(3600),
        );
        cache.refresh().unwrap();

        assert!(cache.get_key("truncated").is_none());
    }

    #[test]
    fn stale_keys_are_evicted_after_refresh() {
        let cache = PrivateKeyCache::new(
            Box::new(FixedSource(vec![
                encoded_key("fresh", b"a", Duration::ZERO),
                encoded_key("stale", b"b", Duration::from_secs(7200)),
            ])),
            Duration::from_secs(3600),
        );
        cache.refresh().unwrap();

        assert!(cache.get_key("fresh").is_some());
        assert!(cache.get_key("stale").is_none());
    }
}
