//! Per-session symmetric key material.
//!
//! Two stores feed the connect-packet key section: the cache of keys the
//! client generated while negotiating with hosts, and the registry of
//! certificates supplied by an external authentication component. Both are
//! owned by the connection state, constructed at session start and torn
//! down with it.

use std::collections::{BTreeMap, HashMap};

/// Symmetric session key length in bytes. Generated key blobs and
/// certificate payloads carry the raw key first, followed by the
/// key-exchange ciphertext destined for the host.
pub const KEY_LEN: usize = 32;

/// Entry count above which the cache is purged.
pub const KEY_CACHE_HIGH_WATER: usize = 300;
/// Upper bound on entries removed in one purge.
pub const KEY_CACHE_PURGE_MAX: usize = 3000;

/// Bounded map from locally generated key id to key material.
///
/// Ids ascend, so the smallest id approximates the oldest entry; purging
/// walks the map in ascending-key order.
#[derive(Debug, Default)]
pub struct KeyCache {
    next_id: i32,
    keys: BTreeMap<i32, Vec<u8>>,
}

impl KeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a freshly negotiated key blob (`[key][encrypted exchange]`)
    /// and returns the id assigned to it. Id 0 is reserved for "no key".
    pub fn offer(&mut self, blob: Vec<u8>) -> i32 {
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == 0 {
            self.next_id = 1;
        }
        self.keys.insert(self.next_id, blob);
        self.next_id
    }

    /// Stores or replaces a blob under an externally chosen id.
    pub fn insert(&mut self, id: i32, blob: Vec<u8>) {
        self.keys.insert(id, blob);
    }

    pub fn lookup(&self, id: i32) -> Option<&[u8]> {
        self.keys.get(&id).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Removes up to `min(len - high_water, max_batch)` oldest entries once
    /// the count exceeds `high_water`. Returns how many were removed.
    pub fn purge_oldest(&mut self, high_water: usize, max_batch: usize) -> usize {
        if self.keys.len() <= high_water {
            return 0;
        }
        let purge = (self.keys.len() - high_water).min(max_batch);
        for _ in 0..purge {
            let oldest = match self.keys.keys().next() {
                Some(&id) => id,
                None => break,
            };
            self.keys.remove(&oldest);
        }
        purge
    }
}

/// Authentication payloads keyed by the textual form of a remote address.
///
/// Payload layout: `[key id: i32 LE][session key: KEY_LEN][exchange blob]`.
/// An external component registers entries at arbitrary times; the
/// connection core only ever reads them.
#[derive(Debug, Default)]
pub struct CertificateRegistry {
    map: HashMap<String, Vec<u8>>,
}

/// Bytes preceding the exchange blob in a certificate payload.
pub const CERT_METADATA_LEN: usize = 4 + KEY_LEN;

impl CertificateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any existing entry for the same address key.
    pub fn register(&mut self, addr_key: &str, payload: &[u8]) {
        self.map.insert(addr_key.to_owned(), payload.to_vec());
    }

    pub fn lookup(&self, addr_key: &str) -> Option<&[u8]> {
        self.map.get(addr_key).map(Vec::as_slice)
    }

    pub fn contains(&self, addr_key: &str) -> bool {
        self.map.contains_key(addr_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purge_removes_excess_over_high_water() {
        let mut cache = KeyCache::new();
        for _ in 0..305 {
            cache.offer(vec![0u8; KEY_LEN]);
        }
        assert_eq!(cache.purge_oldest(300, 3000), 5);
        assert_eq!(cache.len(), 300);
        // oldest ids went first
        assert!(cache.lookup(1).is_none());
        assert!(cache.lookup(5).is_none());
        assert!(cache.lookup(6).is_some());
    }

    #[test]
    fn purge_respects_batch_limit() {
        let mut cache = KeyCache::new();
        for _ in 0..20 {
            cache.offer(Vec::new());
        }
        assert_eq!(cache.purge_oldest(10, 4), 4);
        assert_eq!(cache.len(), 16);
    }

    #[test]
    fn purge_below_high_water_is_noop() {
        let mut cache = KeyCache::new();
        for _ in 0..300 {
            cache.offer(Vec::new());
        }
        assert_eq!(cache.purge_oldest(300, 3000), 0);
        assert_eq!(cache.len(), 300);
    }

    #[test]
    fn insert_replaces_existing_blob() {
        let mut cache = KeyCache::new();
        let id = cache.offer(b"old".to_vec());
        cache.insert(id, b"new".to_vec());
        assert_eq!(cache.lookup(id), Some(&b"new"[..]));
    }

    #[test]
    fn offer_never_hands_out_zero() {
        let mut cache = KeyCache::new();
        cache.next_id = -1;
        let id = cache.offer(Vec::new());
        assert_eq!(id, 1);
    }

    #[test]
    fn register_overwrites_in_place() {
        let mut reg = CertificateRegistry::new();
        reg.register("192.0.2.1:27015", b"first");
        reg.register("192.0.2.1:27015", b"second");
        assert_eq!(reg.lookup("192.0.2.1:27015"), Some(&b"second"[..]));
    }
}
