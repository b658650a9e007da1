//! Byte-budgeted LRU cache over `(bucket, key)` pairs.
//!
//! The cache sits in front of the engine as a non-durable hint: every applied
//! mutation that touches a key removes that key here before the mutation
//! returns, so a populated entry is never newer than the engine. Entries are
//! accounted by `len(bucket) + len(key) + len(value)` against a byte budget;
//! exceeding the budget on insert evicts exactly one entry from the cold end.
//!
//! Recency is tracked with a monotonic tick per access and an ordered
//! tick -> entry index; a per-bucket key index makes dropping a whole bucket
//! proportional to the bucket, not the cache. One reader-writer lock guards
//! the whole structure: recency-mutating operations take the write side,
//! inspection takes the read side. Every operation is total.

use std::collections::BTreeMap;
use std::collections::HashMap;

use parking_lot::RwLock;

/// Callback invoked with `(bucket, key, value)` each time an entry leaves
/// the cache by eviction, removal, bucket drop, or purge.
pub type EvictCallback = Box<dyn Fn(&[u8], &[u8], &[u8]) + Send + Sync>;

struct Slot {
    value: Vec<u8>,
    tick: u64,
}

#[derive(Default)]
struct CacheInner {
    /// bucket -> key -> slot.
    items: HashMap<Vec<u8>, HashMap<Vec<u8>, Slot>>,
    /// Access tick -> (bucket, key), coldest first.
    recency: BTreeMap<u64, (Vec<u8>, Vec<u8>)>,
    size: u64,
    next_tick: u64,
}

impl CacheInner {
    fn entry_size(bucket: &[u8], key: &[u8], value: &[u8]) -> u64 {
        (bucket.len() + key.len() + value.len()) as u64
    }

    fn touch(&mut self, bucket: &[u8], key: &[u8]) {
        let slot = match self.items.get_mut(bucket).and_then(|b| b.get_mut(key)) {
            Some(slot) => slot,
            None => return,
        };
        let old_tick = slot.tick;
        let tick = self.next_tick;
        self.next_tick += 1;
        slot.tick = tick;
        if let Some(entry) = self.recency.remove(&old_tick) {
            self.recency.insert(tick, entry);
        }
    }

    /// Detach the entry, returning its value. The caller fires the callback.
    fn detach(&mut self, bucket: &[u8], key: &[u8]) -> Option<Vec<u8>> {
        let keys = self.items.get_mut(bucket)?;
        let slot = keys.remove(key)?;
        if keys.is_empty() {
            self.items.remove(bucket);
        }
        self.recency.remove(&slot.tick);
        self.size = self
            .size
            .saturating_sub(Self::entry_size(bucket, key, &slot.value));
        Some(slot.value)
    }

    fn oldest(&self) -> Option<(&Vec<u8>, &Vec<u8>)> {
        self.recency.values().next().map(|(b, k)| (b, k))
    }
}

/// Fixed-budget LRU cache keyed by `(bucket, key)`.
pub struct Cache {
    inner: RwLock<CacheInner>,
    max_bytes: u64,
    on_evict: Option<EvictCallback>,
}

impl Cache {
    /// Cache bounded to `max_bytes`; zero disables capacity eviction.
    pub fn new(max_bytes: u64, on_evict: Option<EvictCallback>) -> Self {
        Self {
            inner: RwLock::new(CacheInner::default()),
            max_bytes,
            on_evict,
        }
    }

    fn evicted(&self, bucket: &[u8], key: &[u8], value: &[u8]) {
        if let Some(cb) = &self.on_evict {
            cb(bucket, key, value);
        }
    }

    /// Insert or replace the entry, moving it to the hot end. Returns true
    /// if the insert pushed the cache over budget and evicted the coldest
    /// entry. Replacement re-accounts the byte delta of the new value.
    pub fn add(&self, bucket: &[u8], key: &[u8], value: &[u8]) -> bool {
        let mut inner = self.inner.write();

        let existing = inner
            .items
            .get_mut(bucket)
            .and_then(|b| b.get_mut(key))
            .map(|slot| {
                let old_len = slot.value.len() as u64;
                slot.value = value.to_vec();
                old_len
            });

        match existing {
            Some(old_len) => {
                inner.size = inner.size.saturating_sub(old_len) + value.len() as u64;
                inner.touch(bucket, key);
            }
            None => {
                let tick = inner.next_tick;
                inner.next_tick += 1;
                inner
                    .items
                    .entry(bucket.to_vec())
                    .or_default()
                    .insert(key.to_vec(), Slot { value: value.to_vec(), tick });
                inner.recency.insert(tick, (bucket.to_vec(), key.to_vec()));
                inner.size += CacheInner::entry_size(bucket, key, value);
            }
        }

        // One eviction per triggering insert; a single oversized entry can
        // leave the cache above budget until the next insert.
        let over = self.max_bytes > 0 && inner.size > self.max_bytes;
        if over {
            if let Some((b, k)) = inner.oldest().map(|(b, k)| (b.clone(), k.clone())) {
                if let Some(v) = inner.detach(&b, &k) {
                    drop(inner);
                    self.evicted(&b, &k, &v);
                }
            }
        }
        over
    }

    /// Look up the entry, marking it most recently used on a hit.
    pub fn get(&self, bucket: &[u8], key: &[u8]) -> Option<Vec<u8>> {
        let mut inner = self.inner.write();
        let value = inner
            .items
            .get(bucket)
            .and_then(|b| b.get(key))
            .map(|slot| slot.value.clone())?;
        inner.touch(bucket, key);
        tracing::trace!(key = %String::from_utf8_lossy(key), "cache hit");
        Some(value)
    }

    /// Look up the entry without touching recency.
    pub fn peek(&self, bucket: &[u8], key: &[u8]) -> Option<Vec<u8>> {
        let inner = self.inner.read();
        inner
            .items
            .get(bucket)
            .and_then(|b| b.get(key))
            .map(|slot| slot.value.clone())
    }

    /// Whether the entry is resident, without touching recency.
    pub fn contains(&self, bucket: &[u8], key: &[u8]) -> bool {
        let inner = self.inner.read();
        inner.items.get(bucket).is_some_and(|b| b.contains_key(key))
    }

    /// Remove the entry, returning whether it was resident.
    pub fn remove(&self, bucket: &[u8], key: &[u8]) -> bool {
        let mut inner = self.inner.write();
        match inner.detach(bucket, key) {
            Some(value) => {
                drop(inner);
                self.evicted(bucket, key, &value);
                true
            }
            None => false,
        }
    }

    /// Remove every entry under `bucket`, returning whether the bucket was
    /// resident.
    pub fn remove_bucket(&self, bucket: &[u8]) -> bool {
        let mut inner = self.inner.write();
        let keys: Vec<Vec<u8>> = match inner.items.get(bucket) {
            Some(b) => b.keys().cloned().collect(),
            None => return false,
        };
        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = inner.detach(bucket, &key) {
                removed.push((key, value));
            }
        }
        drop(inner);
        for (key, value) in removed {
            self.evicted(bucket, &key, &value);
        }
        true
    }

    /// Evict the coldest entry, returning it.
    pub fn remove_oldest(&self) -> Option<(Vec<u8>, Vec<u8>, Vec<u8>)> {
        let mut inner = self.inner.write();
        let (bucket, key) = inner.oldest().map(|(b, k)| (b.clone(), k.clone()))?;
        let value = inner.detach(&bucket, &key)?;
        drop(inner);
        self.evicted(&bucket, &key, &value);
        Some((bucket, key, value))
    }

    /// The coldest entry, without removing it.
    pub fn get_oldest(&self) -> Option<(Vec<u8>, Vec<u8>, Vec<u8>)> {
        let inner = self.inner.read();
        let (bucket, key) = inner.oldest()?;
        let value = inner.items.get(bucket)?.get(key)?.value.clone();
        Some((bucket.clone(), key.clone(), value))
    }

    /// Composite `bucket-key` identifiers, coldest to hottest. Diagnostics
    /// only.
    pub fn keys(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut keys = Vec::with_capacity(inner.recency.len());
        for (bucket, key) in inner.recency.values() {
            keys.push(format!(
                "{}-{}",
                String::from_utf8_lossy(bucket),
                String::from_utf8_lossy(key)
            ));
        }
        keys
    }

    /// Drop every entry and zero the accounting.
    pub fn purge(&self) {
        let mut inner = self.inner.write();
        let all: Vec<(Vec<u8>, Vec<u8>)> = inner
            .recency
            .values()
            .cloned()
            .collect();
        let mut removed = Vec::with_capacity(all.len());
        for (bucket, key) in all {
            if let Some(value) = inner.detach(&bucket, &key) {
                removed.push((bucket, key, value));
            }
        }
        inner.items.clear();
        inner.recency.clear();
        inner.size = 0;
        drop(inner);
        for (bucket, key, value) in removed {
            self.evicted(&bucket, &key, &value);
        }
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.inner.read().recency.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Accounted size in bytes.
    pub fn size(&self) -> u64 {
        self.inner.read().size
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use super::*;

    type Seen = Arc<Mutex<Vec<(Vec<u8>, Vec<u8>, Vec<u8>)>>>;

    fn recording_cache(max_bytes: u64) -> (Cache, Seen) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cache = Cache::new(
            max_bytes,
            Some(Box::new(move |b, k, v| {
                sink.lock().unwrap().push((b.to_vec(), k.to_vec(), v.to_vec()));
            })),
        );
        (cache, seen)
    }

    #[test]
    fn add_then_get_returns_the_inserted_value() {
        let cache = Cache::new(0, None);
        assert!(!cache.add(b"b", b"k1", b"v1"));
        assert_eq!(cache.get(b"b", b"k1").as_deref(), Some(&b"v1"[..]));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn replace_updates_value_and_accounting() {
        let cache = Cache::new(0, None);
        cache.add(b"b", b"k", b"v1");
        let before = cache.size();
        cache.add(b"b", b"k", b"longer-value");
        assert_eq!(cache.get(b"b", b"k").as_deref(), Some(&b"longer-value"[..]));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size(), before - 2 + "longer-value".len() as u64);
    }

    #[test]
    fn eviction_fires_callback_with_the_cold_entry() {
        // Budget fits exactly one (b, k1, v1) entry plus a byte.
        let budget = (1 + 2 + 2 + 1) as u64;
        let (cache, seen) = recording_cache(budget);

        assert!(!cache.add(b"b", b"k1", b"v1"));
        assert!(cache.add(b"b", b"k2", b"v2"));

        assert!(!cache.contains(b"b", b"k1"));
        assert!(cache.contains(b"b", b"k2"));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[(b"b".to_vec(), b"k1".to_vec(), b"v1".to_vec())]);
    }

    #[test]
    fn get_refreshes_recency_but_peek_does_not() {
        let cache = Cache::new(0, None);
        cache.add(b"b", b"k1", b"v1");
        cache.add(b"b", b"k2", b"v2");

        // k1 becomes hottest; k2 is now coldest.
        cache.get(b"b", b"k1");
        let (_, key, _) = cache.get_oldest().unwrap();
        assert_eq!(key, b"k2");

        // Peek must not disturb the order.
        cache.peek(b"b", b"k2");
        cache.peek(b"b", b"k1");
        let (_, key, _) = cache.get_oldest().unwrap();
        assert_eq!(key, b"k2");
    }

    #[test]
    fn zero_budget_disables_capacity_eviction() {
        let (cache, seen) = recording_cache(0);
        for i in 0..64u32 {
            let key = format!("key-{i}");
            assert!(!cache.add(b"b", key.as_bytes(), b"value"));
        }
        assert_eq!(cache.len(), 64);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn remove_bucket_fires_callback_once_per_resident_entry() {
        let (cache, seen) = recording_cache(0);
        cache.add(b"ns", b"k1", b"v1");
        cache.add(b"ns", b"k2", b"v2");
        cache.add(b"other", b"k3", b"v3");

        assert!(cache.remove_bucket(b"ns"));
        assert!(!cache.remove_bucket(b"ns"));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|(b, _, _)| b == b"ns"));
        drop(seen);
        assert!(cache.contains(b"other", b"k3"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn purge_zeroes_size_and_count() {
        let (cache, seen) = recording_cache(0);
        cache.add(b"a", b"k1", b"v1");
        cache.add(b"b", b"k2", b"v2");

        cache.purge();

        assert_eq!(cache.len(), 0);
        assert_eq!(cache.size(), 0);
        assert_eq!(seen.lock().unwrap().len(), 2);

        // The cache keeps working after a purge.
        cache.add(b"a", b"k1", b"v1");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn keys_lists_oldest_to_newest() {
        let cache = Cache::new(0, None);
        cache.add(b"b", b"k1", b"v1");
        cache.add(b"b", b"k2", b"v2");
        cache.add(b"b", b"k3", b"v3");
        cache.get(b"b", b"k1");

        assert_eq!(cache.keys(), vec!["b-k2", "b-k3", "b-k1"]);
    }

    #[test]
    fn remove_oldest_pops_the_cold_end() {
        let cache = Cache::new(0, None);
        assert!(cache.remove_oldest().is_none());

        cache.add(b"b", b"k1", b"v1");
        cache.add(b"b", b"k2", b"v2");

        let (bucket, key, value) = cache.remove_oldest().unwrap();
        assert_eq!((bucket.as_slice(), key.as_slice(), value.as_slice()), (&b"b"[..], &b"k1"[..], &b"v1"[..]));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn remove_reports_residency() {
        let cache = Cache::new(0, None);
        cache.add(b"b", b"k", b"v");
        assert!(cache.remove(b"b", b"k"));
        assert!(!cache.remove(b"b", b"k"));
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn size_stays_within_budget_plus_last_insert() {
        let budget = 64u64;
        let cache = Cache::new(budget, None);
        for i in 0..100u32 {
            let key = format!("key-{i:03}");
            cache.add(b"b", key.as_bytes(), b"0123456789");
            let entry = (1 + key.len() + 10) as u64;
            assert!(cache.size() <= budget + entry);
        }
    }
}
