//! In-memory item storage.
//!
//! A thread-safe key/value store with:
//! - relative-time expiration driven by the coarse server clock
//! - memory usage tracking and capping with LRU eviction
//! - a delete-lock window: soft-deleted items stay pinned and hidden until a
//!   periodic sweep unlinks them
//! - a flush horizon (`flush_all`) expiring everything last touched at or
//!   before it
//!
//! Items are handed out as `Arc<Item>`; the reference count is the pin that
//! keeps reply bytes alive while they sit in outbound I/O segments. All
//! mutation goes through a single interior lock, the cache lock.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Largest item (key + value) the store will accept.
pub const ITEM_SIZE_MAX: usize = 1024 * 1024;

/// A single cached item.
///
/// `exptime` doubles as the deletion deadline while the item is soft-deleted.
#[derive(Debug)]
pub struct Item {
    key: Box<[u8]>,
    flags: u32,
    exptime: AtomicU32,
    data: Vec<u8>,
    /// Relative time the item was linked, reported by `metaget`.
    stored_at: u32,
    /// Relative time of the last access, compared against the flush horizon.
    last_access: AtomicU32,
    origin: Option<IpAddr>,
    deleted: AtomicBool,
}

impl Item {
    pub fn new(
        key: &[u8],
        flags: u32,
        exptime: u32,
        data: Vec<u8>,
        now: u32,
        origin: Option<IpAddr>,
    ) -> Item {
        Item {
            key: key.into(),
            flags,
            exptime: AtomicU32::new(exptime),
            data,
            stored_at: now,
            last_access: AtomicU32::new(now),
            origin,
            deleted: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn exptime(&self) -> u32 {
        self.exptime.load(Ordering::Relaxed)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn stored_at(&self) -> u32 {
        self.stored_at
    }

    pub fn origin(&self) -> Option<IpAddr> {
        self.origin
    }

    fn memory_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.key.len() + self.data.len()
    }

    fn is_expired(&self, now: u32) -> bool {
        let exptime = self.exptime();
        exptime != 0 && exptime <= now
    }

    fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Relaxed)
    }

    /// The delete-lock window has passed and the sweep may unlink the item.
    fn delete_lock_over(&self, now: u32) -> bool {
        now >= self.exptime()
    }

    fn touch(&self, now: u32) {
        self.last_access.store(now, Ordering::Relaxed);
    }
}

/// Storage policy for one of the update commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorePolicy {
    /// `set`: always store, overriding a delete lock.
    Set,
    /// `add`: store only if no visible item exists.
    Add,
    /// `replace`: store only if a visible item exists.
    Replace,
}

/// Result of an arithmetic mutate.
#[derive(Debug, PartialEq, Eq)]
pub enum DeltaResult {
    NotFound,
    Value(u32),
}

/// Result of storing an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreResult {
    Stored,
    /// The policy refused the store (add on present, replace on missing,
    /// delete lock in force).
    NotStored,
    /// Eviction is disabled and the item does not fit.
    OutOfMemory,
}

/// Point-in-time storage counters.
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub curr_items: usize,
    pub total_items: u64,
    pub mem_used: usize,
    pub maxbytes: usize,
    pub evictions: u64,
    pub pending_deletes: usize,
}

struct StoreInner {
    map: HashMap<Box<[u8]>, Arc<Item>>,
    /// Access order for LRU eviction (key -> access sequence number).
    access_order: HashMap<Box<[u8]>, u64>,
    access_seq: u64,
    mem_used: usize,
    /// Soft-deleted items pinned until their deadline passes.
    pending: Vec<Arc<Item>>,
}

/// Thread-safe item store.
pub struct Store {
    inner: Mutex<StoreInner>,
    maxbytes: usize,
    evict_to_free: bool,
    /// Items last accessed at or before this relative time are dead.
    oldest_live: AtomicU32,
    total_items: AtomicU64,
    evictions: AtomicU64,
}

impl Store {
    pub fn new(maxbytes: usize, evict_to_free: bool) -> Arc<Store> {
        Arc::new(Store {
            inner: Mutex::new(StoreInner {
                map: HashMap::new(),
                access_order: HashMap::new(),
                access_seq: 0,
                mem_used: 0,
                pending: Vec::with_capacity(200),
            }),
            maxbytes,
            evict_to_free,
            oldest_live: AtomicU32::new(0),
            total_items: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    pub fn maxbytes(&self) -> usize {
        self.maxbytes
    }

    /// Whether an item of this size can be stored at all, and whether storing
    /// it now would fail for lack of memory. Checked before the value body is
    /// read so oversized stores can be rejected up front.
    pub fn size_ok(&self, nkey: usize, vlen: usize) -> bool {
        nkey + vlen + std::mem::size_of::<Item>() <= ITEM_SIZE_MAX.min(self.maxbytes)
    }

    /// Fetch a visible item, refreshing its LRU position.
    pub fn get(&self, key: &[u8], now: u32) -> Option<Arc<Item>> {
        self.get_with_delete_flag(key, now).0
    }

    /// Fetch like `get`, additionally reporting whether the miss was caused
    /// by an item inside its delete-lock window.
    pub fn get_with_delete_flag(&self, key: &[u8], now: u32) -> (Option<Arc<Item>>, bool) {
        let mut inner = self.inner.lock().unwrap();
        self.lookup_locked(&mut inner, key, now)
    }

    fn lookup_locked(
        &self,
        inner: &mut StoreInner,
        key: &[u8],
        now: u32,
    ) -> (Option<Arc<Item>>, bool) {
        let it = match inner.map.get(key) {
            Some(it) => Arc::clone(it),
            None => return (None, false),
        };

        if it.is_deleted() && !it.delete_lock_over(now) {
            return (None, true);
        }

        if self.is_flushed(&it) || it.is_expired(now) {
            trace!(key = %String::from_utf8_lossy(key), "item expired on access");
            Self::unlink_locked(inner, &it);
            return (None, false);
        }

        it.touch(now);
        Self::record_access(inner, key);
        (Some(it), false)
    }

    fn is_flushed(&self, it: &Item) -> bool {
        let horizon = self.oldest_live.load(Ordering::Relaxed);
        horizon != 0 && it.last_access.load(Ordering::Relaxed) <= horizon
    }

    fn record_access(inner: &mut StoreInner, key: &[u8]) {
        inner.access_seq += 1;
        let seq = inner.access_seq;
        match inner.access_order.get_mut(key) {
            Some(slot) => *slot = seq,
            None => {
                inner.access_order.insert(key.into(), seq);
            }
        }
    }

    fn unlink_locked(inner: &mut StoreInner, it: &Arc<Item>) -> bool {
        match inner.map.get(it.key()) {
            Some(current) if Arc::ptr_eq(current, it) => {
                inner.mem_used -= it.memory_size();
                inner.map.remove(it.key());
                inner.access_order.remove(it.key());
                true
            }
            _ => false,
        }
    }

    fn link_locked(&self, inner: &mut StoreInner, it: Arc<Item>) {
        let size = it.memory_size();
        if let Some(old) = inner.map.insert(it.key.clone(), Arc::clone(&it)) {
            inner.mem_used -= old.memory_size();
        }
        inner.mem_used += size;
        Self::record_access(inner, it.key());
        self.total_items.fetch_add(1, Ordering::Relaxed);
    }

    /// Evict LRU items until `needed` more bytes fit, if eviction is enabled.
    fn ensure_memory_locked(&self, inner: &mut StoreInner, needed: usize) -> bool {
        while inner.mem_used + needed > self.maxbytes {
            if !self.evict_to_free {
                return false;
            }
            let victim = Self::find_lru_key(inner);
            match victim {
                Some(key) => {
                    debug!(key = %String::from_utf8_lossy(&key), "evicting LRU item");
                    if let Some(it) = inner.map.get(&key).cloned() {
                        Self::unlink_locked(inner, &it);
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                    } else {
                        inner.access_order.remove(&key);
                    }
                }
                None => break,
            }
        }
        inner.mem_used + needed <= self.maxbytes
    }

    /// Find the key with the lowest access sequence number.
    fn find_lru_key(inner: &StoreInner) -> Option<Box<[u8]>> {
        let mut min_seq = u64::MAX;
        let mut lru_key: Option<&Box<[u8]>> = None;

        for (key, &seq) in inner.access_order.iter() {
            if inner.map.contains_key(key) && seq < min_seq {
                min_seq = seq;
                lru_key = Some(key);
            }
        }

        lru_key
            .cloned()
            .or_else(|| inner.map.keys().next().cloned())
    }

    /// Store an item according to one of the update-command policies.
    pub fn store(&self, item: Item, policy: StorePolicy, now: u32) -> StoreResult {
        let size = item.memory_size();
        let mut inner = self.inner.lock().unwrap();

        let (old, delete_locked) = self.lookup_locked(&mut inner, item.key(), now);

        if old.is_some() && policy == StorePolicy::Add {
            /* add only adds a nonexistent item, but promote to head of LRU */
            Self::record_access(&mut inner, item.key());
            return StoreResult::NotStored;
        }
        if old.is_none() && policy == StorePolicy::Replace && !delete_locked {
            /* replace only replaces an existing value */
            return StoreResult::NotStored;
        }
        if delete_locked && policy != StorePolicy::Set {
            /* add and replace can't override delete locks */
            return StoreResult::NotStored;
        }

        if !self.ensure_memory_locked(&mut inner, size) {
            return StoreResult::OutOfMemory;
        }

        /* a set overrides the delete lock window; the hidden item is simply
         * replaced in the map and its deadline sweep becomes a no-op */
        self.link_locked(&mut inner, Arc::new(item));
        StoreResult::Stored
    }

    /// Immediately unlink an item fetched earlier. Returns false if the map
    /// has already moved on to a different item under the same key.
    pub fn unlink(&self, it: &Arc<Item>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        Self::unlink_locked(&mut inner, it)
    }

    /// Soft-delete: hide the item behind its delete lock and queue it for the
    /// sweep. The caller's reference is transferred to the queue.
    pub fn defer_delete(&self, it: Arc<Item>, deadline: u32) -> Result<(), DeferError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.pending.try_reserve(1).is_err() {
            /* can't delete it later; drop the reference and report */
            return Err(DeferError::OutOfMemory);
        }
        it.exptime.store(deadline, Ordering::Relaxed);
        it.deleted.store(true, Ordering::Relaxed);
        inner.pending.push(it);
        Ok(())
    }

    /// Sweep the deferred-delete queue: unlink everything whose deadline has
    /// passed, keep the rest.
    pub fn run_deferred_deletes(&self, now: u32) {
        let mut inner = self.inner.lock().unwrap();
        let pending = std::mem::take(&mut inner.pending);
        for it in pending {
            if it.delete_lock_over(now) {
                it.deleted.store(false, Ordering::Relaxed);
                Self::unlink_locked(&mut inner, &it);
                /* queue's reference dropped here */
            } else {
                inner.pending.push(it);
            }
        }
    }

    /// Add a delta to a numeric item, in place when the item is unshared,
    /// otherwise via a replacement item. Decrements saturate at zero.
    pub fn add_delta(&self, key: &[u8], incr: bool, delta: u32, now: u32) -> DeltaResult {
        let mut inner = self.inner.lock().unwrap();

        let (it, _) = self.lookup_locked(&mut inner, key, now);
        let it = match it {
            Some(it) => it,
            None => return DeltaResult::NotFound,
        };

        let value = ascii_to_u32(it.data());
        let value = if incr {
            value.wrapping_add(delta)
        } else if delta >= value {
            0
        } else {
            value - delta
        };
        let text = value.to_string();

        // `it` plus the map's entry hold two references; anything beyond that
        // is a reply in flight and forces a replacement item.
        drop(it);
        let entry = inner.map.get_mut(key).expect("entry vanished under lock");
        match Arc::get_mut(entry) {
            Some(exclusive) => {
                exclusive.data.clear();
                exclusive.data.extend_from_slice(text.as_bytes());
                exclusive.touch(now);
                Self::record_access(&mut inner, key);
            }
            None => {
                let old = Arc::clone(entry);
                let replacement = Item::new(
                    key,
                    old.flags(),
                    old.exptime(),
                    text.into_bytes(),
                    now,
                    old.origin(),
                );
                self.link_locked(&mut inner, Arc::new(replacement));
            }
        }

        DeltaResult::Value(value)
    }

    /// Expire every item last touched at or before `horizon`.
    pub fn flush_before(&self, horizon: u32) {
        self.oldest_live.store(horizon, Ordering::Relaxed);

        let mut inner = self.inner.lock().unwrap();
        let dead: Vec<Arc<Item>> = inner
            .map
            .values()
            .filter(|it| it.last_access.load(Ordering::Relaxed) <= horizon)
            .cloned()
            .collect();
        for it in dead {
            Self::unlink_locked(&mut inner, &it);
        }
    }

    /// Expire items whose keys match `pattern`. Returns how many were
    /// unlinked, or the pattern error.
    pub fn flush_regex(&self, pattern: &str) -> Result<usize, regex::Error> {
        let re = regex::bytes::Regex::new(pattern)?;
        let mut inner = self.inner.lock().unwrap();
        let dead: Vec<Arc<Item>> = inner
            .map
            .values()
            .filter(|it| re.is_match(it.key()))
            .cloned()
            .collect();
        let count = dead.len();
        for it in dead {
            Self::unlink_locked(&mut inner, &it);
        }
        Ok(count)
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.lock().unwrap();
        StoreStats {
            curr_items: inner.map.len(),
            total_items: self.total_items.load(Ordering::Relaxed),
            mem_used: inner.mem_used,
            maxbytes: self.maxbytes,
            evictions: self.evictions.load(Ordering::Relaxed),
            pending_deletes: inner.pending.len(),
        }
    }

    /// Item count per 32-byte size bucket, for `stats sizes`.
    pub fn size_histogram(&self) -> Vec<(usize, usize)> {
        let inner = self.inner.lock().unwrap();
        let mut histogram: HashMap<usize, usize> = HashMap::new();
        for it in inner.map.values() {
            let bucket = (it.key().len() + it.data().len()) / 32 * 32;
            *histogram.entry(bucket).or_default() += 1;
        }
        let mut sizes: Vec<_> = histogram.into_iter().collect();
        sizes.sort_unstable();
        sizes
    }

    /// Up to `limit` items (key, value length, expiration), for
    /// `stats cachedump`. A limit of zero dumps everything.
    pub fn cachedump(&self, limit: usize) -> Vec<(Box<[u8]>, usize, u32)> {
        let inner = self.inner.lock().unwrap();
        let take = if limit == 0 { inner.map.len() } else { limit };
        inner
            .map
            .values()
            .take(take)
            .map(|it| (it.key.clone(), it.data().len(), it.exptime()))
            .collect()
    }
}

/// Deferred-delete enqueue failure.
#[derive(Debug, PartialEq, Eq)]
pub enum DeferError {
    OutOfMemory,
}

/// Parse the leading base-10 digits of a byte string, wrapping like C
/// unsigned arithmetic. Anything after the digits is ignored; no digits
/// parse as zero.
fn ascii_to_u32(data: &[u8]) -> u32 {
    let mut value: u32 = 0;
    for &b in data {
        if !b.is_ascii_digit() {
            break;
        }
        value = value.wrapping_mul(10).wrapping_add((b - b'0') as u32);
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(key: &[u8], value: &[u8], exptime: u32, now: u32) -> Item {
        Item::new(key, 0, exptime, value.to_vec(), now, None)
    }

    fn stored(result: StoreResult) -> bool {
        result == StoreResult::Stored
    }

    #[test]
    fn set_get_roundtrip() {
        let store = Store::new(1024 * 1024, true);
        assert!(stored(store.store(item(b"k", b"v1", 0, 10), StorePolicy::Set, 10)));
        assert_eq!(store.get(b"k", 10).unwrap().data(), b"v1");

        assert!(stored(store.store(item(b"k", b"v2", 0, 11), StorePolicy::Set, 11)));
        assert_eq!(store.get(b"k", 11).unwrap().data(), b"v2");
    }

    #[test]
    fn add_only_stores_missing() {
        let store = Store::new(1024 * 1024, true);
        assert!(stored(store.store(item(b"k", b"v1", 0, 10), StorePolicy::Add, 10)));
        assert!(!stored(store.store(item(b"k", b"v2", 0, 10), StorePolicy::Add, 10)));
        assert_eq!(store.get(b"k", 10).unwrap().data(), b"v1");
    }

    #[test]
    fn replace_only_stores_existing() {
        let store = Store::new(1024 * 1024, true);
        assert!(!stored(store.store(item(b"k", b"v1", 0, 10), StorePolicy::Replace, 10)));
        assert!(stored(store.store(item(b"k", b"v1", 0, 10), StorePolicy::Set, 10)));
        assert!(stored(store.store(item(b"k", b"v2", 0, 10), StorePolicy::Replace, 10)));
        assert_eq!(store.get(b"k", 10).unwrap().data(), b"v2");
    }

    #[test]
    fn items_expire() {
        let store = Store::new(1024 * 1024, true);
        assert!(stored(store.store(item(b"k", b"v", 20, 10), StorePolicy::Set, 10)));
        assert!(store.get(b"k", 19).is_some());
        assert!(store.get(b"k", 20).is_none());
        // expired entry was unlinked on access, so add may claim the key
        assert!(stored(store.store(item(b"k", b"w", 0, 21), StorePolicy::Add, 21)));
    }

    #[test]
    fn delete_lock_hides_and_blocks() {
        let store = Store::new(1024 * 1024, true);
        assert!(stored(store.store(item(b"d", b"X", 0, 10), StorePolicy::Set, 10)));

        let it = store.get(b"d", 10).unwrap();
        store.defer_delete(it, 15).unwrap();

        // hidden from get, flagged as delete-locked
        let (hit, locked) = store.get_with_delete_flag(b"d", 12);
        assert!(hit.is_none());
        assert!(locked);

        // add and replace can't override the lock
        assert!(!stored(store.store(item(b"d", b"Y", 0, 12), StorePolicy::Add, 12)));
        assert!(!stored(store.store(item(b"d", b"Y", 0, 12), StorePolicy::Replace, 12)));

        // set can
        assert!(stored(store.store(item(b"d", b"Z", 0, 12), StorePolicy::Set, 12)));
        assert_eq!(store.get(b"d", 12).unwrap().data(), b"Z");
    }

    #[test]
    fn deferred_delete_sweeps_after_deadline() {
        let store = Store::new(1024 * 1024, true);
        assert!(stored(store.store(item(b"d", b"X", 0, 10), StorePolicy::Set, 10)));
        let it = store.get(b"d", 10).unwrap();
        store.defer_delete(it, 15).unwrap();

        store.run_deferred_deletes(12);
        assert_eq!(store.stats().pending_deletes, 1);

        store.run_deferred_deletes(15);
        assert_eq!(store.stats().pending_deletes, 0);
        assert!(store.get(b"d", 15).is_none());
        assert!(stored(store.store(item(b"d", b"Y", 0, 16), StorePolicy::Add, 16)));
    }

    #[test]
    fn sweep_skips_keys_retaken_by_set() {
        let store = Store::new(1024 * 1024, true);
        assert!(stored(store.store(item(b"d", b"X", 0, 10), StorePolicy::Set, 10)));
        let it = store.get(b"d", 10).unwrap();
        store.defer_delete(it, 15).unwrap();

        // set overrides the lock; the queued item no longer owns the key
        assert!(stored(store.store(item(b"d", b"Y", 0, 12), StorePolicy::Set, 12)));
        store.run_deferred_deletes(20);
        assert_eq!(store.get(b"d", 20).unwrap().data(), b"Y");
    }

    #[test]
    fn incr_wraps_and_decr_saturates() {
        let store = Store::new(1024 * 1024, true);
        assert!(stored(store.store(item(b"k", b"9", 0, 10), StorePolicy::Set, 10)));

        assert_eq!(store.add_delta(b"k", true, 2, 10), DeltaResult::Value(11));
        assert_eq!(store.get(b"k", 10).unwrap().data(), b"11");

        assert_eq!(store.add_delta(b"k", false, 100, 10), DeltaResult::Value(0));
        assert_eq!(store.get(b"k", 10).unwrap().data(), b"0");

        assert_eq!(store.add_delta(b"missing", true, 1, 10), DeltaResult::NotFound);
    }

    #[test]
    fn delta_replaces_shared_items() {
        let store = Store::new(1024 * 1024, true);
        assert!(stored(store.store(item(b"k", b"5", 0, 10), StorePolicy::Set, 10)));

        // a held reply slot forces the replacement path
        let pinned = store.get(b"k", 10).unwrap();
        assert_eq!(store.add_delta(b"k", true, 1, 10), DeltaResult::Value(6));
        assert_eq!(pinned.data(), b"5");
        assert_eq!(store.get(b"k", 10).unwrap().data(), b"6");
    }

    #[test]
    fn numeric_prefix_parsing() {
        assert_eq!(ascii_to_u32(b"123"), 123);
        assert_eq!(ascii_to_u32(b"12abc"), 12);
        assert_eq!(ascii_to_u32(b"abc"), 0);
        assert_eq!(ascii_to_u32(b""), 0);
    }

    #[test]
    fn flush_expires_existing_items() {
        let store = Store::new(1024 * 1024, true);
        assert!(stored(store.store(item(b"a", b"1", 0, 10), StorePolicy::Set, 10)));
        assert!(stored(store.store(item(b"b", b"2", 0, 10), StorePolicy::Set, 10)));

        store.flush_before(19);
        assert!(store.get(b"a", 20).is_none());
        assert!(store.get(b"b", 20).is_none());

        // items stored past the horizon live
        assert!(stored(store.store(item(b"c", b"3", 0, 20), StorePolicy::Set, 20)));
        assert!(store.get(b"c", 20).is_some());
    }

    #[test]
    fn flush_regex_matches_keys() {
        let store = Store::new(1024 * 1024, true);
        assert!(stored(store.store(item(b"user:1", b"a", 0, 10), StorePolicy::Set, 10)));
        assert!(stored(store.store(item(b"user:2", b"b", 0, 10), StorePolicy::Set, 10)));
        assert!(stored(store.store(item(b"other", b"c", 0, 10), StorePolicy::Set, 10)));

        assert_eq!(store.flush_regex("^user:").unwrap(), 2);
        assert!(store.get(b"user:1", 10).is_none());
        assert!(store.get(b"other", 10).is_some());

        assert!(store.flush_regex("[invalid").is_err());
    }

    #[test]
    fn eviction_keeps_memory_bounded() {
        let store = Store::new(2048, true);
        for i in 0u32..20 {
            let key = format!("key{i}");
            assert!(stored(store.store(
                item(key.as_bytes(), &[0u8; 64], 0, 10 + i),
                StorePolicy::Set,
                10 + i,
            )));
        }
        let stats = store.stats();
        assert!(stats.mem_used <= 2048);
        assert!(stats.evictions > 0);
    }

    #[test]
    fn eviction_disabled_fails_the_store() {
        let store = Store::new(1024, false);
        assert!(stored(store.store(item(b"a", &[0u8; 400], 0, 10), StorePolicy::Set, 10)));
        assert!(!stored(store.store(item(b"b", &[0u8; 900], 0, 10), StorePolicy::Set, 10)));
        assert!(store.get(b"a", 10).is_some());
    }
}
