//! Segmented-LRU bucket with frequency-aware admission.
//!
//! The bucket owns every cache entry. Entries live in one of three
//! generations, each a byte-budgeted LRU ring:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Bucket                              │
//! │                                                              │
//! │  insert ──▶ ┌──────────┐  overflow  ┌───────────────────┐    │
//! │             │   eden   │───────────▶│     probation     │    │
//! │             └──────────┘ (admission │ (evicted first)   │    │
//! │                  │ 2nd    contest)  └───────────────────┘    │
//! │                  │ touch               ▲           │ hit     │
//! │                  ▼                     │ demote    ▼         │
//! │             ┌────────────────────────────────────────────┐   │
//! │             │                protected                   │   │
//! │             │        (largest tier, hardest to evict)    │   │
//! │             └────────────────────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! New entries enter `eden` with frequency 1. When eden overflows its
//! budget, the overflow is placed into `protected` while that tier still
//! has headroom (warming an empty cache), and afterwards must win a
//! frequency contest against the probation LRU to be admitted at all.
//! One-shot scans therefore cycle through eden and probation without
//! displacing the protected working set.
//!
//! Weights are computed by a caller-supplied pure function over
//! `(key, value)`, keeping the generation and accounting logic independent
//! of the concrete entity schema.

use core::hash::Hash;

use hashbrown::HashMap;

use crate::accountant::CapacityAccountant;
use crate::list::LruList;

/// Share of the byte limit given to eden.
const EDEN_PCT: u64 = 5;
/// Share of the byte limit given to probation. Protected takes the rest.
const PROBATION_PCT: u64 = 19;
/// Eden entries reaching this frequency move to probation on access.
const EDEN_PROMOTE_AT: u32 = 2;

/// The generation an entry currently belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Generation {
    /// Admission tier for brand-new entries.
    Eden,
    /// Holding tier; evicted before the other two.
    Probation,
    /// The hot working set.
    Protected,
}

/// Computes the byte weight of an entry from its key and value.
pub type Weigher<K, V> = fn(&K, &V) -> u64;

/// Hit/miss counters plus current occupancy.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Keys found by `get_and_promote`.
    pub hits: u64,
    /// Keys probed but absent.
    pub misses: u64,
    /// Total byte weight of live entries.
    pub bytes: u64,
    /// Number of live entries.
    pub entries: usize,
}

impl CacheStats {
    /// Hit ratio in `[0, 1]`; zero when nothing was probed yet.
    pub fn ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Node<K, V> {
    key: K,
    value: V,
    frequency: u32,
    weight: u64,
}

struct Ring<K, V> {
    list: LruList<Node<K, V>>,
    budget: CapacityAccountant,
}

impl<K, V> Ring<K, V> {
    fn new(budget: u64) -> Self {
        Ring {
            list: LruList::new(),
            budget: CapacityAccountant::new(budget),
        }
    }
}

/// The map-of-key-to-entry plus generation rings and hit counters.
///
/// Not thread-safe on its own; the facade wraps it in a mutex.
pub struct Bucket<K, V> {
    map: HashMap<K, (Generation, usize)>,
    eden: Ring<K, V>,
    probation: Ring<K, V>,
    protected: Ring<K, V>,
    total: CapacityAccountant,
    weigher: Weigher<K, V>,
    hits: u64,
    misses: u64,
}

impl<K, V> core::fmt::Debug for Bucket<K, V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Bucket")
            .field("entries", &self.map.len())
            .field("bytes", &self.total.used())
            .field("limit", &self.total.limit())
            .finish()
    }
}

impl<K, V> Bucket<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Creates an empty bucket bounded by `limit` bytes.
    ///
    /// The limit is split 5% / 19% / 76% across eden, probation and
    /// protected, each floored at one byte so degenerate limits stay
    /// well-formed.
    pub fn new(limit: u64, weigher: Weigher<K, V>) -> Self {
        let eden_budget = (limit * EDEN_PCT / 100).max(1);
        let probation_budget = (limit * PROBATION_PCT / 100).max(1);
        let protected_budget = limit
            .saturating_sub(eden_budget)
            .saturating_sub(probation_budget)
            .max(1);
        Bucket {
            map: HashMap::new(),
            eden: Ring::new(eden_budget),
            probation: Ring::new(probation_budget),
            protected: Ring::new(protected_budget),
            total: CapacityAccountant::new(limit),
            weigher,
            hits: 0,
            misses: 0,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if the bucket holds no entries.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Total byte weight of live entries.
    pub fn size(&self) -> u64 {
        self.total.used()
    }

    /// The configured byte limit.
    pub fn limit(&self) -> u64 {
        self.total.limit()
    }

    fn ring(&self, generation: Generation) -> &Ring<K, V> {
        match generation {
            Generation::Eden => &self.eden,
            Generation::Probation => &self.probation,
            Generation::Protected => &self.protected,
        }
    }

    fn ring_mut(&mut self, generation: Generation) -> &mut Ring<K, V> {
        match generation {
            Generation::Eden => &mut self.eden,
            Generation::Probation => &mut self.probation,
            Generation::Protected => &mut self.protected,
        }
    }

    /// Moves the entry at `idx` from `from` to the MRU end of `to`,
    /// fixing budgets and the map handle.
    fn transfer(&mut self, from: Generation, idx: usize, to: Generation) -> usize {
        let node = self.ring_mut(from).list.remove(idx);
        let weight = node.weight;
        let key = node.key.clone();
        self.ring_mut(from).budget.credit(weight);
        let new_idx = self.ring_mut(to).list.push_front(node);
        self.ring_mut(to).budget.charge(weight);
        self.map.insert(key, (to, new_idx));
        new_idx
    }

    /// Drops the LRU entry of `generation`, returning `false` when the
    /// ring was empty.
    fn evict_lru(&mut self, generation: Generation) -> bool {
        let popped = self.ring_mut(generation).list.pop_back();
        match popped {
            Some((_, node)) => {
                self.ring_mut(generation).budget.credit(node.weight);
                self.total.credit(node.weight);
                self.map.remove(&node.key);
                true
            }
            None => false,
        }
    }

    /// Evicts probation, then eden, then protected LRU entries until the
    /// total weight fits the limit again.
    fn evict_to_limit(&mut self) {
        while self.total.is_over() {
            if self.evict_lru(Generation::Probation)
                || self.evict_lru(Generation::Eden)
                || self.evict_lru(Generation::Protected)
            {
                continue;
            }
            break;
        }
    }

    /// Frequency of the probation LRU entry, if any.
    fn probation_lru_frequency(&self) -> Option<u32> {
        self.probation.list.back().map(|node| node.frequency)
    }

    /// Handles eden overflow: spill to protected while it has headroom,
    /// then run the admission contest against the probation LRU.
    fn balance_eden(&mut self) {
        while self.eden.budget.is_over() {
            let Some((_, node)) = self.eden.list.pop_back() else {
                break;
            };
            self.eden.budget.credit(node.weight);

            if self.protected.budget.has_room_for(node.weight) {
                let key = node.key.clone();
                let weight = node.weight;
                let idx = self.protected.list.push_front(node);
                self.protected.budget.charge(weight);
                self.map.insert(key, (Generation::Protected, idx));
                continue;
            }

            let admit = self.probation.budget.has_room_for(node.weight)
                || self
                    .probation_lru_frequency()
                    .is_some_and(|lru| node.frequency > lru);
            if admit {
                let key = node.key.clone();
                let weight = node.weight;
                let idx = self.probation.list.push_front(node);
                self.probation.budget.charge(weight);
                self.map.insert(key, (Generation::Probation, idx));
            } else {
                self.total.credit(node.weight);
                self.map.remove(&node.key);
            }
        }
    }

    /// Demotes protected LRU entries to probation while protected is over
    /// budget, never demoting the last remaining entry.
    fn balance_protected(&mut self) {
        while self.protected.budget.is_over() && self.protected.list.len() > 1 {
            if let Some((_, node)) = self.protected.list.pop_back() {
                self.protected.budget.credit(node.weight);
                let key = node.key.clone();
                let weight = node.weight;
                let idx = self.probation.list.push_front(node);
                self.probation.budget.charge(weight);
                self.map.insert(key, (Generation::Probation, idx));
            } else {
                break;
            }
        }
    }

    /// Looks up each key, promoting and bumping the frequency of every
    /// hit. Returns the found subset.
    pub fn get_and_promote(&mut self, keys: &[K]) -> HashMap<K, V> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            let Some(&(generation, idx)) = self.map.get(key) else {
                self.misses += 1;
                continue;
            };
            self.hits += 1;
            match generation {
                Generation::Eden => {
                    let node = self.eden.list.get_mut(idx);
                    node.frequency = node.frequency.saturating_add(1);
                    let promote = node.frequency >= EDEN_PROMOTE_AT;
                    if promote {
                        let new_idx =
                            self.transfer(Generation::Eden, idx, Generation::Probation);
                        let node = self.probation.list.get(new_idx);
                        found.insert(node.key.clone(), node.value.clone());
                    } else {
                        self.eden.list.move_to_front(idx);
                        let node = self.eden.list.get(idx);
                        found.insert(node.key.clone(), node.value.clone());
                    }
                }
                Generation::Probation => {
                    let node = self.probation.list.get_mut(idx);
                    node.frequency = node.frequency.saturating_add(1);
                    let new_idx =
                        self.transfer(Generation::Probation, idx, Generation::Protected);
                    let node = self.protected.list.get(new_idx);
                    found.insert(node.key.clone(), node.value.clone());
                    self.balance_protected();
                }
                Generation::Protected => {
                    let node = self.protected.list.get_mut(idx);
                    node.frequency = node.frequency.saturating_add(1);
                    self.protected.list.move_to_front(idx);
                    let node = self.protected.list.get(idx);
                    found.insert(node.key.clone(), node.value.clone());
                }
            }
        }
        found
    }

    /// Inserts or overwrites an entry.
    ///
    /// New entries enter eden with frequency 1. Overwrites replace the
    /// value in place, keep the generation and reset the frequency to 1.
    pub fn set(&mut self, key: K, value: V) {
        self.set_with_frequency(key, value, 1);
    }

    fn set_with_frequency(&mut self, key: K, value: V, frequency: u32) {
        let weight = (self.weigher)(&key, &value);
        if let Some(&(generation, idx)) = self.map.get(&key) {
            let ring = self.ring_mut(generation);
            let node = ring.list.get_mut(idx);
            let old_weight = node.weight;
            node.value = value;
            node.frequency = frequency;
            node.weight = weight;
            ring.budget.credit(old_weight);
            ring.budget.charge(weight);
            ring.list.move_to_front(idx);
            self.total.credit(old_weight);
            self.total.charge(weight);
        } else {
            let idx = self.eden.list.push_front(Node {
                key: key.clone(),
                value,
                frequency,
                weight,
            });
            self.eden.budget.charge(weight);
            self.total.charge(weight);
            self.map.insert(key, (Generation::Eden, idx));
        }
        self.balance_eden();
        self.evict_to_limit();
    }

    /// Seeds the bucket from snapshot rows, trusting the supplied
    /// frequencies. Callers pass rows ordered least- to most-recent so
    /// the most recent end up at the MRU ends.
    pub fn bulk_update<I>(&mut self, rows: I)
    where
        I: IntoIterator<Item = (K, V, Generation, u32)>,
    {
        for (key, value, _, frequency) in rows {
            self.set_with_frequency(key, value, frequency);
        }
    }

    /// Returns the entries of `generation` ordered least- to most-popular,
    /// ties broken by recency (least recent first).
    pub fn items_to_write(&self, generation: Generation) -> Vec<(K, V, Generation, u32)> {
        let ring = self.ring(generation);
        let mut items: Vec<(K, V, Generation, u32)> = ring
            .list
            .iter_lru()
            .map(|node| {
                (
                    node.key.clone(),
                    node.value.clone(),
                    generation,
                    node.frequency,
                )
            })
            .collect();
        items.sort_by_key(|item| item.3);
        items
    }

    /// Iterates `(key, value, generation, frequency)` for every live
    /// entry, MRU first within each generation.
    pub fn iter_entries(&self) -> impl Iterator<Item = (&K, &V, Generation, u32)> {
        let walk = |generation: Generation| {
            let ring = self.ring(generation);
            let mut items: Vec<&Node<K, V>> = ring.list.iter_lru().collect();
            items.reverse();
            items
                .into_iter()
                .map(move |node| (&node.key, &node.value, generation, node.frequency))
        };
        walk(Generation::Eden)
            .chain(walk(Generation::Probation))
            .chain(walk(Generation::Protected))
    }

    /// Discards every entry, keeping the configured budgets.
    pub fn clear(&mut self) {
        self.map.clear();
        self.eden.list.clear();
        self.eden.budget.reset();
        self.probation.list.clear();
        self.probation.budget.reset();
        self.protected.list.clear();
        self.protected.budget.reset();
        self.total.reset();
        self.hits = 0;
        self.misses = 0;
    }

    /// Current counters and occupancy.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            bytes: self.total.used(),
            entries: self.map.len(),
        }
    }

    /// Zeroes the hit/miss counters.
    pub fn reset_stats(&mut self) {
        self.hits = 0;
        self.misses = 0;
    }

    #[cfg(test)]
    fn generation_of(&self, key: &K) -> Option<Generation> {
        self.map.get(key).map(|&(generation, _)| generation)
    }
}
