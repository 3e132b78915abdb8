//! Bounded least-recently-used cache.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Fixed-capacity map that evicts the least recently used entry.
///
/// Reads count as use. A capacity of zero stores nothing.
#[derive(Debug)]
pub struct LruCache<K, V> {
    capacity: usize,
    tick: u64,
    entries: HashMap<K, (V, u64)>,
    recency: BTreeMap<u64, K>,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tick: 0,
            entries: HashMap::with_capacity(capacity),
            recency: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        let tick = self.next_tick();
        let (_, used) = self.entries.get_mut(key)?;
        self.recency.remove(used);
        *used = tick;
        self.recency.insert(tick, key.clone());
        self.entries.get(key).map(|(value, _)| value)
    }

    pub fn put(&mut self, key: K, value: V) {
        if self.capacity == 0 {
            return;
        }
        let tick = self.next_tick();

        if let Some((_, used)) = self.entries.get(&key) {
            self.recency.remove(used);
        } else if self.entries.len() >= self.capacity {
            if let Some((_, oldest)) = self.recency.pop_first() {
                self.entries.remove(&oldest);
            }
        }

        self.recency.insert(tick, key.clone());
        self.entries.insert(key, (value, tick));
    }

    /// Drop every entry whose key fails `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&K) -> bool) {
        let entries = &mut self.entries;
        self.recency.retain(|_, key| {
            let kept = keep(key);
            if !kept {
                entries.remove(key);
            }
            kept
        });
    }
}
