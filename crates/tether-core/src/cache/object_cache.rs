// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reference-counted object cache.
//!
//! Entries live in a [`DashMap`], so lookups on different keys never contend
//! on one lock. Each entry carries its own reference count; an entry is only
//! evicted once nobody references it and its idle or lease timeout passed.
//!
//! Access is handed out as a [`CacheLease`], which releases its reference
//! when dropped. A [`CacheItem`] is a non-owning pointer to an entry that can
//! later try to re-acquire a lease, which fails once the entry was evicted.

use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;

/// Capacity and eviction limits of a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelCacheSettings {
    /// Maximum number of cached entries; `0` disables caching.
    pub max_items: usize,
    /// How long an unreferenced entry may stay idle.
    pub idle_timeout: Duration,
    /// Maximum age of an entry.
    pub lease_timeout: Duration,
}

impl Default for ChannelCacheSettings {
    fn default() -> Self {
        Self {
            max_items: 16,
            idle_timeout: Duration::from_secs(120),
            lease_timeout: Duration::from_secs(600),
        }
    }
}

impl ChannelCacheSettings {
    /// Settings that cache nothing.
    pub fn empty() -> Self {
        Self {
            max_items: 0,
            idle_timeout: Duration::ZERO,
            lease_timeout: Duration::ZERO,
        }
    }

    /// Whether caching is disabled.
    pub fn is_empty(&self) -> bool {
        self.max_items == 0
    }
}

#[derive(Debug)]
struct EntryState {
    references: usize,
    cached: bool,
    idle_since: Instant,
}

struct CacheEntry<V> {
    value: Arc<V>,
    created: Instant,
    state: Mutex<EntryState>,
}

impl<V> CacheEntry<V> {
    fn new_referenced(value: Arc<V>, cached: bool) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            value,
            created: now,
            state: Mutex::new(EntryState {
                references: 1,
                cached,
                idle_since: now,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_add_reference(&self) -> bool {
        let mut state = self.state();
        if !state.cached {
            return false;
        }
        state.references += 1;
        true
    }

    /// Drop one reference; `true` when the entry is out of the cache and
    /// this was the last reference, so the caller owns disposal.
    fn release(&self) -> bool {
        let mut state = self.state();
        state.references = state.references.saturating_sub(1);
        if state.references > 0 {
            return false;
        }
        state.idle_since = Instant::now();
        !state.cached
    }

    /// Eviction check: returns (keep in map, dispose now).
    fn check(&self, now: Instant, settings: &ChannelCacheSettings, force: bool) -> (bool, bool) {
        let mut state = self.state();
        if !state.cached {
            return (false, false);
        }

        let lease_expired = now.duration_since(self.created) >= settings.lease_timeout;
        if state.references > 0 {
            if force || lease_expired {
                // Disposal happens on the last release.
                state.cached = false;
                return (false, false);
            }
            return (true, false);
        }

        let idle_expired = now.duration_since(state.idle_since) >= settings.idle_timeout;
        if force || lease_expired || idle_expired {
            state.cached = false;
            return (false, true);
        }
        (true, false)
    }

    fn references(&self) -> usize {
        self.state().references
    }
}

/// Non-owning pointer to a cache entry.
pub struct CacheItem<V> {
    entry: Arc<CacheEntry<V>>,
}

impl<V> Clone for CacheItem<V> {
    fn clone(&self) -> Self {
        Self {
            entry: self.entry.clone(),
        }
    }
}

impl<V> fmt::Debug for CacheItem<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheItem")
            .field("references", &self.entry.references())
            .finish()
    }
}

impl<V> CacheItem<V> {
    /// Acquire a new lease; fails once the entry was evicted.
    pub fn try_add_reference(&self) -> Option<CacheLease<V>> {
        self.entry.try_add_reference().then(|| CacheLease {
            entry: self.entry.clone(),
            released: false,
        })
    }

    /// The cached value.
    pub fn value(&self) -> &Arc<V> {
        &self.entry.value
    }

    /// Current reference count.
    pub fn references(&self) -> usize {
        self.entry.references()
    }
}

/// Owning reference to a cache entry; released on drop.
pub struct CacheLease<V> {
    entry: Arc<CacheEntry<V>>,
    released: bool,
}

impl<V> fmt::Debug for CacheLease<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheLease")
            .field("cached", &self.is_cached())
            .field("released", &self.released)
            .finish()
    }
}

impl<V> CacheLease<V> {
    /// Lease over a value that never enters any cache.
    ///
    /// Releasing it hands the value back for disposal.
    pub fn detached(value: Arc<V>) -> Self {
        Self {
            entry: CacheEntry::new_referenced(value, false),
            released: false,
        }
    }

    /// The leased value.
    pub fn value(&self) -> &Arc<V> {
        &self.entry.value
    }

    /// Non-owning pointer to the same entry.
    pub fn item(&self) -> CacheItem<V> {
        CacheItem {
            entry: self.entry.clone(),
        }
    }

    /// Whether the entry is still held by its cache.
    pub fn is_cached(&self) -> bool {
        self.entry.state().cached
    }

    /// Release the reference.
    ///
    /// Returns the value when the entry is no longer cached and this was its
    /// last reference; the caller must dispose it.
    pub fn release(mut self) -> Option<Arc<V>> {
        self.released = true;
        self.entry.release().then(|| self.entry.value.clone())
    }
}

impl<V> Drop for CacheLease<V> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.entry.release();
        }
    }
}

/// Keyed cache of reference-counted values.
pub struct ObjectCache<K, V> {
    entries: DashMap<K, Arc<CacheEntry<V>>>,
    settings: ChannelCacheSettings,
}

impl<K, V> fmt::Debug for ObjectCache<K, V>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectCache")
            .field("entries", &self.entries.len())
            .field("settings", &self.settings)
            .finish()
    }
}

impl<K, V> ObjectCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Empty cache.
    pub fn new(settings: ChannelCacheSettings) -> Self {
        Self {
            entries: DashMap::new(),
            settings,
        }
    }

    /// Limits in effect.
    pub fn settings(&self) -> ChannelCacheSettings {
        self.settings
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lease an existing entry.
    pub fn take(&self, key: &K) -> Option<CacheLease<V>> {
        let entry = self.entries.get(key).map(|e| e.value().clone())?;
        if entry.try_add_reference() {
            return Some(CacheLease {
                entry,
                released: false,
            });
        }
        self.entries.remove_if(key, |_, current| Arc::ptr_eq(current, &entry));
        None
    }

    /// Lease the entry for `key`, creating it if missing.
    ///
    /// When another caller created the entry concurrently, that one is joined.
    pub fn take_or_create(&self, key: K, create: impl FnOnce() -> V) -> CacheLease<V> {
        if let Some(lease) = self.take(&key) {
            return lease;
        }
        self.insert(key, Arc::new(create()), true)
    }

    /// Insert a freshly built value.
    ///
    /// If a live entry already exists, or the cache is full, the value gets a
    /// detached lease instead and never enters the cache.
    pub fn add(&self, key: K, value: Arc<V>) -> CacheLease<V> {
        self.insert(key, value, false)
    }

    fn insert(&self, key: K, value: Arc<V>, join_existing: bool) -> CacheLease<V> {
        if self.settings.is_empty() {
            return CacheLease::detached(value);
        }
        // Soft limit: concurrent inserts may overshoot by a few entries.
        if self.entries.len() >= self.settings.max_items && !self.entries.contains_key(&key) {
            return CacheLease::detached(value);
        }

        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get().clone();
                if existing.try_add_reference() {
                    if join_existing {
                        return CacheLease {
                            entry: existing,
                            released: false,
                        };
                    }
                    // Our extra reference on the existing entry is not needed.
                    existing.release();
                    return CacheLease::detached(value);
                }
                let entry = CacheEntry::new_referenced(value, true);
                occupied.insert(entry.clone());
                CacheLease {
                    entry,
                    released: false,
                }
            }
            Entry::Vacant(vacant) => {
                let entry = CacheEntry::new_referenced(value, true);
                vacant.insert(entry.clone());
                CacheLease {
                    entry,
                    released: false,
                }
            }
        }
    }

    /// Evict unreferenced entries past their idle or lease timeout.
    ///
    /// Returns the evicted values for the caller to dispose.
    pub fn sweep(&self) -> Vec<Arc<V>> {
        self.evict(false)
    }

    /// Evict everything. Values still leased are handed back by their last
    /// [`CacheLease::release`] instead.
    pub fn dispose_all(&self) -> Vec<Arc<V>> {
        self.evict(true)
    }

    fn evict(&self, force: bool) -> Vec<Arc<V>> {
        let now = Instant::now();
        let settings = self.settings;
        let mut evicted = Vec::new();
        self.entries.retain(|_, entry| {
            let (keep, dispose) = entry.check(now, &settings, force);
            if dispose {
                evicted.push(entry.value.clone());
            }
            keep
        });
        evicted
    }

    /// Snapshot of the cached values.
    pub fn values(&self) -> Vec<Arc<V>> {
        self.entries.iter().map(|e| e.value().value.clone()).collect()
    }

    /// Reference count of the entry for `key`.
    pub fn references(&self, key: &K) -> Option<usize> {
        self.entries.get(key).map(|e| e.value().references())
    }
}
