//! Replay cache — rejects a second envelope with the same `mac` seen within
//! the TTL window. Keyed directly on the MAC bytes, which are already a
//! uniform hash and need no further hashing.

use crate::cache::ttl_map::TtlMap;
use std::time::Duration;

pub struct ReplayCache {
    map: TtlMap<Vec<u8>, ()>,
    ttl: Duration,
}

impl ReplayCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            map: TtlMap::new(100_000),
            ttl,
        }
    }

    /// Returns `true` if `mac` was already seen within the TTL window
    /// (reject); otherwise records it and returns `false` (accept). The
    /// check-and-insert is atomic so two concurrent presentations of the
    /// same MAC cannot both be admitted.
    ///
    /// Must be called only after authenticity is established, so the table
    /// can't be poisoned with forged entries from unauthenticated senders.
    pub fn check_and_record(&self, mac: &[u8]) -> bool {
        !self.map.put_if_absent(mac.to_vec(), (), self.ttl)
    }
}
