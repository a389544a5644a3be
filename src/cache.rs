//! Bounded in-process cache.
//!
//! Admission and eviction follow a small/main/ghost queue scheme: new
//! entries enter the small queue, entries touched at least twice graduate
//! to the main queue, and entries evicted from small without reuse leave a
//! ghost marker so a quick return is admitted straight to main.

use std::{
    cmp::min,
    collections::{HashMap, LinkedList},
    fmt::Debug,
    hash::Hash,
    sync::atomic::{AtomicU8, AtomicUsize, Ordering},
};

/// Maximum frequency counter for an entry.
const MAX_FREQUENCY_LIMIT: u8 = 3;

struct Entry<K, V> {
    key: K,
    value: V,
    freq: AtomicU8,
}

impl<K, V> Entry<K, V> {
    fn new(key: K, value: V) -> Self {
        Entry {
            key,
            value,
            freq: AtomicU8::new(0),
        }
    }
}

impl<K, V> Clone for Entry<K, V>
where
    K: Clone,
    V: Clone,
{
    fn clone(&self) -> Self {
        Entry {
            key: self.key.clone(),
            value: self.value.clone(),
            freq: AtomicU8::new(self.freq.load(Ordering::SeqCst)),
        }
    }
}

type List<K, V> = LinkedList<Entry<K, V>>;

pub struct Cache<K, V>
where
    K: PartialEq + Eq + Hash + Clone + Debug,
    V: Clone,
{
    max_main_size: usize,
    max_cache_size: usize,
    /// New entries are added to this queue.
    small: List<K, V>,
    /// Entries that have been accessed at least twice are moved here.
    main: List<K, V>,
    /// Keys evicted from small before their second access.
    ghost: LinkedList<K>,
    /// Map of all live entries for quick access.
    entries: HashMap<K, Entry<K, V>>,
    /// Stats.
    stats: Stats,
}

impl<K, V> Cache<K, V>
where
    K: PartialEq + Eq + Hash + Clone + Debug,
    V: Clone,
{
    pub fn new(max_cache_size: usize) -> Self {
        let max_small_size = max_cache_size / 10;
        let max_main_size = max_cache_size - max_small_size;

        Cache {
            max_main_size,
            max_cache_size,
            small: LinkedList::new(),
            main: LinkedList::new(),
            ghost: LinkedList::new(),
            entries: HashMap::new(),
            stats: Stats::new(),
        }
    }

    /// Returns the value for `key` if cached.
    pub fn get(&self, key: &K) -> Option<V> {
        if let Some(entry) = self.entries.get(key) {
            let freq = min(entry.freq.load(Ordering::SeqCst) + 1, MAX_FREQUENCY_LIMIT);
            entry.freq.store(freq, Ordering::SeqCst);
            self.stats.hit();
            Some(entry.value.clone())
        } else {
            self.stats.miss();
            None
        }
    }

    /// Inserts an entry, evicting as needed to stay within capacity.
    /// Keys returning shortly after eviction (still in the ghost queue) are
    /// admitted straight to the main queue.
    pub fn insert(&mut self, key: K, value: V) {
        if self.entries.contains_key(&key) {
            // Replacement: purge the resident entry and its queue nodes so
            // a later eviction cannot drop the fresh one.
            self.remove(&key);
        }
        self.evict();

        let was_ghost = {
            let before = self.ghost.len();
            let ghost = std::mem::take(&mut self.ghost);
            self.ghost = ghost.into_iter().filter(|k| *k != key).collect();
            self.ghost.len() != before
        };

        let entry = Entry::new(key.clone(), value);
        self.entries.insert(key, entry.clone());
        if was_ghost {
            self.main.push_back(entry);
        } else {
            self.small.push_back(entry);
        }
    }

    /// Drops an entry immediately, returning its value. Outstanding clones
    /// handed out by `get` are unaffected.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        let small = std::mem::take(&mut self.small);
        self.small = small.into_iter().filter(|e| e.key != *key).collect();
        let main = std::mem::take(&mut self.main);
        self.main = main.into_iter().filter(|e| e.key != *key).collect();
        let ghost = std::mem::take(&mut self.ghost);
        self.ghost = ghost.into_iter().filter(|k| k != key).collect();
        Some(entry.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> (usize, usize) {
        self.stats.get()
    }

    fn insert_m(&mut self, tail: Entry<K, V>) {
        self.main.push_front(tail);
    }

    fn insert_g(&mut self, tail: Entry<K, V>) {
        if self.ghost.len() >= self.max_cache_size {
            if let Some(key) = self.ghost.pop_back() {
                self.entries.remove(&key);
            }
        }
        self.entries.remove(&tail.key);
        self.ghost.push_front(tail.key);
    }

    fn evict(&mut self) {
        if self.small.len() + self.main.len() >= self.max_cache_size {
            if self.main.len() >= self.max_main_size || self.small.is_empty() {
                self.evict_m();
            } else {
                self.evict_s();
            }
        }
    }

    fn evict_m(&mut self) {
        while let Some(tail) = self.main.pop_front() {
            let freq = tail.freq.load(Ordering::SeqCst);
            if freq > 0 {
                tail.freq.store(freq - 1, Ordering::SeqCst);
                self.main.push_back(tail);
            } else {
                self.insert_g(tail);
                break;
            }
        }
    }

    fn evict_s(&mut self) {
        while let Some(tail) = self.small.pop_front() {
            if tail.freq.load(Ordering::SeqCst) > 1 {
                self.insert_m(tail);
            } else {
                self.insert_g(tail);
                break;
            }
        }
    }
}

struct Stats {
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl Stats {
    fn new() -> Self {
        Stats {
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::SeqCst);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::SeqCst);
    }

    fn get(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::SeqCst),
            self.misses.load(Ordering::SeqCst),
        )
    }
}
