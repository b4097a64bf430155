//! Generic TTL-bounded concurrent map — generalizes the teacher's inline
//! per-IP rate tracker (`clawd::ipc::ConnectionRateLimiter`, a `HashMap<IpAddr,
//! Vec<Instant>>` swept lazily on access) into a reusable `put`/`get`/`delete`/
//! `load_and_delete` primitive shared by the shared-key cache, replay cache,
//! token cache, and correlation/subscription maps.
//!
//! Bounded with a simple insertion-order cap so a flood of distinct keys
//! cannot exhaust memory.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use std::collections::VecDeque;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// A TTL-bounded map safe for concurrent access from multiple tasks.
///
/// Internally a single `Mutex` guards a `HashMap`; this is adequate because
/// every operation is O(1) plus an amortized sweep, matching the teacher's
/// own choice of a plain `Mutex<HashMap<..>>` for connection rate limiting
/// rather than a lock-free structure.
pub struct TtlMap<K, V> {
    inner: Mutex<Inner<K, V>>,
    max_entries: usize,
}

struct Inner<K, V> {
    map: HashMap<K, Entry<V>>,
    order: VecDeque<K>,
}

impl<K, V> TtlMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
            max_entries,
        }
    }

    /// Insert `value` under `key` with the given TTL, evicting the oldest
    /// entry first if the map is at capacity.
    pub fn put(&self, key: K, value: V, ttl: Duration) {
        let mut guard = self.inner.lock().expect("ttl map mutex poisoned");
        if !guard.map.contains_key(&key) {
            guard.order.push_back(key.clone());
            while guard.order.len() > self.max_entries {
                if let Some(evicted) = guard.order.pop_front() {
                    guard.map.remove(&evicted);
                }
            }
        }
        guard.map.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Fetch `key`'s value if present and not expired. Expired entries are
    /// removed lazily on access, like the teacher's per-IP window sweep.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut guard = self.inner.lock().expect("ttl map mutex poisoned");
        let now = Instant::now();
        let expired = guard.map.get(key).map(|e| e.expires_at <= now).unwrap_or(false);
        if expired {
            guard.map.remove(key);
        }
        guard.map.get(key).map(|e| e.value.clone())
    }

    /// `true` if `key` is present and not expired, without cloning the value.
    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn delete(&self, key: &K) {
        let mut guard = self.inner.lock().expect("ttl map mutex poisoned");
        guard.map.remove(key);
    }

    /// Atomically fetch-and-remove — used by the correlation map so the
    /// caller that wins the removal is the sole party that closes out a
    /// pending request.
    pub fn load_and_delete(&self, key: &K) -> Option<V> {
        let mut guard = self.inner.lock().expect("ttl map mutex poisoned");
        guard.map.remove(key).map(|e| e.value)
    }

    /// Insert `value` under `key` only if absent-or-expired, atomically —
    /// returns `true` if this call performed the insert (the caller is the
    /// first sighting), `false` if an unexpired entry was already present.
    /// Used by the replay cache, where a check-then-put under separate lock
    /// acquisitions would let two concurrent presentations of the same MAC
    /// both be accepted.
    pub fn put_if_absent(&self, key: K, value: V, ttl: Duration) -> bool {
        let mut guard = self.inner.lock().expect("ttl map mutex poisoned");
        let now = Instant::now();
        let occupied = guard.map.get(&key).map(|e| e.expires_at > now).unwrap_or(false);
        if occupied {
            return false;
        }
        if !guard.map.contains_key(&key) {
            guard.order.push_back(key.clone());
            while guard.order.len() > self.max_entries {
                if let Some(evicted) = guard.order.pop_front() {
                    guard.map.remove(&evicted);
                }
            }
        }
        guard.map.insert(
            key,
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("ttl map mutex poisoned").map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
