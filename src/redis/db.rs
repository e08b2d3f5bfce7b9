//! One logical database: the value map, the expiry map and the watch index.
//!
//! These are the low-level primitives. They know nothing about time, roles,
//! propagation or notifications; the server layers those on top.
//!
//! # Invariants
//!
//! - Every key in `expires` is also in `dict`
//! - `add` never replaces and `overwrite` never creates
//! - Removing a key removes its expiry first

use super::client::ClientId;
use super::data::ObjectRef;
use ahash::{AHashMap, AHashSet, RandomState};
use bytes::Bytes;
use indexmap::IndexMap;
use rand::seq::index;
use rand::Rng;

/// Tables never shrink below this many slots.
const HT_INITIAL_SIZE: usize = 4;
/// Shrink once fill drops below this percentage.
const HT_MIN_FILL: usize = 10;

/// Insertion-ordered map: any entry is reachable by position, so random
/// draws cost O(1) and a seeded rng always picks the same keys.
type KeyMap<V> = IndexMap<Bytes, V, RandomState>;

pub struct Database {
    pub id: usize,
    dict: KeyMap<ObjectRef>,
    expires: KeyMap<i64>,
    /// Reverse half of the watch index.
    watched_keys: AHashMap<Bytes, Vec<ClientId>>,
    blocking_keys: AHashSet<Bytes>,
    ready_keys: Vec<Bytes>,
    /// Moving average of sampled TTLs, in milliseconds.
    pub avg_ttl: i64,
}

impl Database {
    pub fn new(id: usize) -> Self {
        Database {
            id,
            dict: KeyMap::default(),
            expires: KeyMap::default(),
            watched_keys: AHashMap::new(),
            blocking_keys: AHashSet::new(),
            ready_keys: Vec::new(),
            avg_ttl: 0,
        }
    }

    #[cfg(debug_assertions)]
    pub fn verify_invariants(&self) {
        for key in self.expires.keys() {
            debug_assert!(
                self.dict.contains_key(key),
                "Invariant violated: expire set for missing key '{}'",
                String::from_utf8_lossy(key)
            );
        }
    }

    #[cfg(not(debug_assertions))]
    #[inline(always)]
    pub fn verify_invariants(&self) {}

    pub fn len(&self) -> usize {
        self.dict.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dict.is_empty()
    }

    pub fn expires_len(&self) -> usize {
        self.expires.len()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.dict.contains_key(key)
    }

    /// Raw lookup: no expiry check, no LRU update.
    pub fn get(&self, key: &[u8]) -> Option<&ObjectRef> {
        self.dict.get(key)
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut ObjectRef> {
        self.dict.get_mut(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &Bytes> {
        self.dict.keys()
    }

    /// Insert a key that must not exist yet.
    pub fn add(&mut self, key: Bytes, val: ObjectRef) {
        assert!(
            !self.dict.contains_key(&key),
            "add of existing key '{}'",
            String::from_utf8_lossy(&key)
        );
        if val.value().as_list().is_some() && self.blocking_keys.contains(&key) {
            self.signal_key_as_ready(key.clone());
        }
        self.dict.insert(key, val);
    }

    /// Replace the value of a key that must exist. The expiry is untouched.
    pub fn overwrite(&mut self, key: &[u8], val: ObjectRef) {
        match self.dict.get_mut(key) {
            Some(slot) => *slot = val,
            None => panic!("overwrite of missing key '{}'", String::from_utf8_lossy(key)),
        }
    }

    /// Remove a key and its expiry. Returns whether the key existed.
    pub fn delete(&mut self, key: &[u8]) -> bool {
        if !self.expires.is_empty() {
            self.expires.swap_remove(key);
        }
        self.dict.swap_remove(key).is_some()
    }

    pub fn set_expire(&mut self, key: &[u8], when_ms: i64) {
        let Some((k, _)) = self.dict.get_key_value(key) else {
            panic!("set_expire on missing key '{}'", String::from_utf8_lossy(key));
        };
        self.expires.insert(k.clone(), when_ms);
    }

    /// Absolute expiry in milliseconds, if the key has one.
    pub fn get_expire(&self, key: &[u8]) -> Option<i64> {
        let when = *self.expires.get(key)?;
        assert!(
            self.dict.contains_key(key),
            "expire without value for key '{}'",
            String::from_utf8_lossy(key)
        );
        Some(when)
    }

    /// Returns whether an expiry was removed.
    pub fn remove_expire(&mut self, key: &[u8]) -> bool {
        assert!(
            self.dict.contains_key(key),
            "remove_expire on missing key '{}'",
            String::from_utf8_lossy(key)
        );
        self.expires.swap_remove(key).is_some()
    }

    pub fn random_key<R: Rng>(&self, rng: &mut R) -> Option<Bytes> {
        if self.dict.is_empty() {
            return None;
        }
        let idx = rng.gen_range(0..self.dict.len());
        self.dict.get_index(idx).map(|(k, _)| k.clone())
    }

    /// Up to `count` distinct keys-with-expiry and their deadlines. Costs
    /// O(count) whatever the size of the table.
    pub fn sample_expires<R: Rng>(&self, rng: &mut R, count: usize) -> Vec<(Bytes, i64)> {
        let amount = count.min(self.expires.len());
        if amount == 0 {
            return Vec::new();
        }
        index::sample(rng, self.expires.len(), amount)
            .into_iter()
            .filter_map(|idx| self.expires.get_index(idx))
            .map(|(k, when)| (k.clone(), *when))
            .collect()
    }

    /// The expiry table is mostly empty slots; sampling it would waste time
    /// until the next resize.
    pub fn expires_too_sparse(&self) -> bool {
        let slots = self.expires.capacity();
        slots > HT_INITIAL_SIZE && self.expires.len() * 100 / slots < 1
    }

    /// Shrink tables that dropped below the minimum fill. Returns whether
    /// anything was resized.
    pub fn try_resize(&mut self) -> bool {
        let mut resized = false;
        if needs_resize(self.dict.len(), self.dict.capacity()) {
            self.dict.shrink_to_fit();
            resized = true;
        }
        if needs_resize(self.expires.len(), self.expires.capacity()) {
            self.expires.shrink_to_fit();
            resized = true;
        }
        resized
    }

    /// Remove every key. Returns how many were removed.
    pub fn flush(&mut self) -> usize {
        let removed = self.dict.len();
        self.dict = KeyMap::default();
        self.expires = KeyMap::default();
        self.avg_ttl = 0;
        removed
    }

    pub fn watchers(&self, key: &[u8]) -> Option<&[ClientId]> {
        self.watched_keys.get(key).map(Vec::as_slice)
    }

    pub fn watched_keys(&self) -> impl Iterator<Item = &Bytes> {
        self.watched_keys.keys()
    }

    /// Returns false if the client already watches the key.
    pub fn add_watcher(&mut self, key: Bytes, client: ClientId) -> bool {
        let clients = self.watched_keys.entry(key).or_default();
        if clients.contains(&client) {
            return false;
        }
        clients.push(client);
        true
    }

    /// Drops the entry once no client watches the key.
    pub fn remove_watcher(&mut self, key: &[u8], client: ClientId) {
        let Some(clients) = self.watched_keys.get_mut(key) else {
            panic!("unwatch of key '{}' nobody watches", String::from_utf8_lossy(key));
        };
        clients.retain(|c| *c != client);
        if clients.is_empty() {
            self.watched_keys.remove(key);
        }
    }

    pub fn add_blocking_key(&mut self, key: Bytes) {
        self.blocking_keys.insert(key);
    }

    pub fn remove_blocking_key(&mut self, key: &[u8]) {
        self.blocking_keys.remove(key);
    }

    fn signal_key_as_ready(&mut self, key: Bytes) {
        if !self.ready_keys.contains(&key) {
            self.ready_keys.push(key);
        }
    }

    pub fn take_ready_keys(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.ready_keys)
    }
}

fn needs_resize(used: usize, slots: usize) -> bool {
    slots > HT_INITIAL_SIZE && used * 100 / slots < HT_MIN_FILL
}
