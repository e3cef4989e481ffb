//! Translation lookaside buffer: a bounded LRU cache of completed
//! translations, keyed by (StreamID, PASID, IOVA page, security state).
//!
//! Chapter 16.2: TLB entries are tagged with stream world and substream so
//! that invalidation can be scoped to a stream, a PASID within a stream, or
//! the whole device. The model keeps the same scoping rules over a software
//! map.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::lock;
use crate::types::{current_time_us, Iova, Pa, PagePermissions, Pasid, SecurityState, StreamId};

/// Lookup key of one cached translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TlbKey {
    pub stream_id: StreamId,
    pub pasid: Pasid,
    pub iova_page: Iova,
    pub security_state: SecurityState,
}

/// One cached translation. Addresses are page aligned; the page offset is
/// re-applied by the controller on a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    pub stream_id: StreamId,
    pub pasid: Pasid,
    pub iova_page: Iova,
    pub physical_page: Pa,
    pub permissions: PagePermissions,
    pub security_state: SecurityState,
    pub valid: bool,
    pub timestamp: u64,
}

impl TlbEntry {
    pub fn key(&self) -> TlbKey {
        TlbKey {
            stream_id: self.stream_id,
            pasid: self.pasid,
            iova_page: self.iova_page,
            security_state: self.security_state,
        }
    }
}

/// Counters exposed for monitoring. `hit_rate` is hits/lookups, or 0 when
/// no lookup has happened yet.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CacheStatistics {
    pub hit_count: u64,
    pub miss_count: u64,
    pub total_lookups: u64,
    pub current_size: usize,
    pub max_size: usize,
    pub eviction_count: u64,
    pub hit_rate: f64,
}

impl CacheStatistics {
    fn with_rate(mut self) -> Self {
        self.hit_rate = if self.total_lookups > 0 {
            self.hit_count as f64 / self.total_lookups as f64
        } else {
            0.0
        };
        self
    }
}

struct Cached {
    entry: TlbEntry,
    lru_seq: u64,
}

struct CacheState {
    entries: HashMap<TlbKey, Cached>,
    // LRU order: oldest sequence number first.
    order: BTreeMap<u64, TlbKey>,
    next_seq: u64,
    capacity: usize,
    max_age_us: u64,
    hits: u64,
    misses: u64,
    lookups: u64,
    evictions: u64,
}

impl CacheState {
    fn touch(&mut self, key: TlbKey) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(cached) = self.entries.get_mut(&key) {
            self.order.remove(&cached.lru_seq);
            cached.lru_seq = seq;
            self.order.insert(seq, key);
        }
    }

    fn remove(&mut self, key: &TlbKey) -> bool {
        match self.entries.remove(key) {
            Some(cached) => {
                self.order.remove(&cached.lru_seq);
                true
            }
            None => false,
        }
    }

    fn evict_oldest(&mut self) {
        if let Some((&seq, &key)) = self.order.iter().next() {
            self.order.remove(&seq);
            self.entries.remove(&key);
            self.evictions += 1;
        }
    }

    fn remove_matching<F: Fn(&TlbKey) -> bool>(&mut self, pred: F) {
        let victims: Vec<TlbKey> = self.entries.keys().filter(|k| pred(k)).copied().collect();
        for key in victims {
            self.remove(&key);
        }
    }
}

/// Bounded LRU translation cache with per-stream, per-PASID and global
/// invalidation.
pub struct TlbCache {
    state: Mutex<CacheState>,
}

/// Default freshness bound, 5000 ms as configured by the default cache
/// configuration.
pub const DEFAULT_MAX_AGE_US: u64 = 5_000_000;

impl TlbCache {
    pub fn new(capacity: usize) -> Self {
        Self::with_max_age(capacity, DEFAULT_MAX_AGE_US)
    }

    pub fn with_max_age(capacity: usize, max_age_us: u64) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_seq: 0,
                capacity,
                max_age_us,
                hits: 0,
                misses: 0,
                lookups: 0,
                evictions: 0,
            }),
        }
    }

    /// Look up a cached translation.
    ///
    /// Counts the lookup and a hit or miss. An entry past its maximum age
    /// behaves as a miss and is dropped on discovery.
    pub fn lookup(
        &self,
        stream_id: StreamId,
        pasid: Pasid,
        iova_page: Iova,
        security_state: SecurityState,
    ) -> Option<TlbEntry> {
        let key = TlbKey {
            stream_id,
            pasid,
            iova_page,
            security_state,
        };
        let mut state = lock(&self.state);
        state.lookups += 1;

        let (fresh, entry) = match state.entries.get(&key) {
            Some(cached) if cached.entry.valid => {
                let age = current_time_us().saturating_sub(cached.entry.timestamp);
                (age <= state.max_age_us, Some(cached.entry))
            }
            _ => (false, None),
        };

        match (fresh, entry) {
            (true, Some(entry)) => {
                state.hits += 1;
                state.touch(key);
                Some(entry)
            }
            (false, Some(_)) => {
                // Stale entry: drop it so the slow path refills the slot.
                state.remove(&key);
                state.misses += 1;
                None
            }
            _ => {
                state.misses += 1;
                None
            }
        }
    }

    /// Insert a translation, evicting the least recently used entry when
    /// the cache is at capacity. Re-inserting an existing key updates the
    /// entry in place.
    pub fn insert(&self, entry: TlbEntry) {
        let key = entry.key();
        let mut state = lock(&self.state);

        if state.entries.contains_key(&key) {
            if let Some(cached) = state.entries.get_mut(&key) {
                cached.entry = entry;
            }
            state.touch(key);
            return;
        }

        if state.capacity == 0 {
            return;
        }
        while state.entries.len() >= state.capacity {
            state.evict_oldest();
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(key, Cached { entry, lru_seq: seq });
        state.order.insert(seq, key);
    }

    /// Drop the entry for one exact key.
    pub fn invalidate(
        &self,
        stream_id: StreamId,
        pasid: Pasid,
        iova_page: Iova,
        security_state: SecurityState,
    ) -> bool {
        let key = TlbKey {
            stream_id,
            pasid,
            iova_page,
            security_state,
        };
        lock(&self.state).remove(&key)
    }

    /// Drop the entries for a page regardless of the security state they
    /// were tagged with. Used for unmap coherence, where the mutation
    /// covers every world.
    pub fn invalidate_any_security(&self, stream_id: StreamId, pasid: Pasid, iova_page: Iova) {
        lock(&self.state).remove_matching(|k| {
            k.stream_id == stream_id && k.pasid == pasid && k.iova_page == iova_page
        });
    }

    /// Drop every entry belonging to `stream_id`.
    pub fn invalidate_stream(&self, stream_id: StreamId) {
        lock(&self.state).remove_matching(|k| k.stream_id == stream_id);
    }

    /// Drop every entry belonging to (`stream_id`, `pasid`).
    pub fn invalidate_pasid(&self, stream_id: StreamId, pasid: Pasid) {
        lock(&self.state).remove_matching(|k| k.stream_id == stream_id && k.pasid == pasid);
    }

    /// Drop every entry.
    pub fn invalidate_all(&self) {
        let mut state = lock(&self.state);
        state.entries.clear();
        state.order.clear();
    }

    /// Change the capacity, evicting least recently used entries until the
    /// contents fit.
    pub fn resize(&self, new_capacity: usize) {
        let mut state = lock(&self.state);
        state.capacity = new_capacity;
        while state.entries.len() > new_capacity {
            state.evict_oldest();
        }
    }

    /// Change the freshness bound applied by [`TlbCache::lookup`].
    pub fn set_max_age_us(&self, max_age_us: u64) {
        lock(&self.state).max_age_us = max_age_us;
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.state).entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        lock(&self.state).capacity
    }

    pub fn hit_count(&self) -> u64 {
        lock(&self.state).hits
    }

    pub fn miss_count(&self) -> u64 {
        lock(&self.state).misses
    }

    pub fn total_lookups(&self) -> u64 {
        lock(&self.state).lookups
    }

    pub fn statistics(&self) -> CacheStatistics {
        let state = lock(&self.state);
        CacheStatistics {
            hit_count: state.hits,
            miss_count: state.misses,
            total_lookups: state.lookups,
            current_size: state.entries.len(),
            max_size: state.capacity,
            eviction_count: state.evictions,
            hit_rate: 0.0,
        }
        .with_rate()
    }

    pub fn reset_statistics(&self) {
        let mut state = lock(&self.state);
        state.hits = 0;
        state.misses = 0;
        state.lookups = 0;
        state.evictions = 0;
    }

    /// Drop all contents and statistics.
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        state.entries.clear();
        state.order.clear();
        state.hits = 0;
        state.misses = 0;
        state.lookups = 0;
        state.evictions = 0;
        state.next_seq = 0;
    }

}
