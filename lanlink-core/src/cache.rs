//! Map whose entries expire a fixed time after their last touch.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Entry<V> {
    value: V,
    touched: Instant,
}

/// Entries are not removed on their own: call [`ExpiringMap::sweep`] periodically.
/// Lookups treat an expired entry as absent.
#[derive(Debug)]
pub struct ExpiringMap<K, V> {
    ttl: Duration,
    entries: HashMap<K, Entry<V>>,
}

impl<K: Eq + Hash + Clone, V> ExpiringMap<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace, returning the previous value if it had not expired.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.insert_at(key, value, Instant::now())
    }

    fn insert_at(&mut self, key: K, value: V, now: Instant) -> Option<V> {
        let ttl = self.ttl;
        self.entries
            .insert(key, Entry { value, touched: now })
            .filter(|old| now.duration_since(old.touched) < ttl)
            .map(|old| old.value)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|e| now.duration_since(e.touched) < self.ttl)
            .map(|e| &e.value)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let now = Instant::now();
        let ttl = self.ttl;
        self.entries
            .get_mut(key)
            .filter(|e| now.duration_since(e.touched) < ttl)
            .map(|e| &mut e.value)
    }

    /// Remove and return the value; an expired entry is dropped and `None` returned.
    pub fn take(&mut self, key: &K) -> Option<V> {
        self.take_at(key, Instant::now())
    }

    fn take_at(&mut self, key: &K, now: Instant) -> Option<V> {
        let entry = self.entries.remove(key)?;
        (now.duration_since(entry.touched) < self.ttl).then_some(entry.value)
    }

    /// Restart the entry's timer. Returns false if absent.
    pub fn touch(&mut self, key: &K) -> bool {
        match self.entries.get_mut(key) {
            Some(e) => {
                e.touched = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|e| e.value)
    }

    /// Remove every expired entry and hand them back so the caller can tear them down.
    pub fn sweep(&mut self) -> Vec<(K, V)> {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&mut self, now: Instant) -> Vec<(K, V)> {
        let ttl = self.ttl;
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.touched) >= ttl)
            .map(|(k, _)| k.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|k| self.entries.remove(&k).map(|e| (k, e.value)))
            .collect()
    }

    /// Remove everything, expired or not.
    pub fn drain(&mut self) -> Vec<(K, V)> {
        self.entries.drain().map(|(k, e)| (k, e.value)).collect()
    }
}
