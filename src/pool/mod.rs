//! Outbound connection pool — one sub-pool per peer address, created lazily.
//!
//! Grounded on the teacher's `perf::connection_pool::ConnectionPool`
//! (fixed-size physical connection slots, a worker task per slot, round-robin
//! stream assignment) generalized from a single fixed remote URL to a
//! `peer_address -> pool` map, since a client may hold connections open to
//! many peers at once. The outer map uses a `Mutex` only for the
//! cold-address creation path; established per-peer pools are reached
//! through a cloned `Arc` so the hot `get` path never contends on the map
//! lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::debug;

/// A single pooled connection slot. `PooledConnection` is transport-agnostic
/// here; the WebSocket session layer (see [`crate::ws`]) is what actually
/// owns a live socket and registers itself in a slot via [`PeerPool::put`].
pub struct PooledConnection {
    pub id: u64,
    refs: AtomicUsize,
}

impl PooledConnection {
    fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            refs: AtomicUsize::new(0),
        })
    }
}

/// A leased handle to a [`PooledConnection`]; releases its reference count
/// when dropped so idle-eviction can see accurate load.
pub struct Lease {
    conn: Arc<PooledConnection>,
}

impl Lease {
    pub fn connection(&self) -> &Arc<PooledConnection> {
        &self.conn
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.conn.refs.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Connections to a single peer address.
struct PeerPool {
    slots: RwLock<Vec<Arc<PooledConnection>>>,
    max_slots: usize,
    next_id: AtomicUsize,
}

impl PeerPool {
    fn new(max_slots: usize) -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            max_slots,
            next_id: AtomicUsize::new(1),
        }
    }

    /// Lease the least-loaded existing connection, or open a new slot if
    /// under `max_slots` and every existing slot is in use.
    async fn lease(&self) -> Lease {
        let slots = self.slots.read().await;
        if let Some(least_loaded) = slots.iter().min_by_key(|c| c.refs.load(Ordering::SeqCst)) {
            if slots.len() >= self.max_slots || least_loaded.refs.load(Ordering::SeqCst) == 0 {
                least_loaded.refs.fetch_add(1, Ordering::SeqCst);
                return Lease {
                    conn: Arc::clone(least_loaded),
                };
            }
        }
        drop(slots);

        let mut slots = self.slots.write().await;
        if slots.len() < self.max_slots {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) as u64;
            let conn = PooledConnection::new(id);
            conn.refs.fetch_add(1, Ordering::SeqCst);
            slots.push(Arc::clone(&conn));
            return Lease { conn };
        }

        let least_loaded = slots
            .iter()
            .min_by_key(|c| c.refs.load(Ordering::SeqCst))
            .expect("max_slots is always >= 1");
        least_loaded.refs.fetch_add(1, Ordering::SeqCst);
        Lease {
            conn: Arc::clone(least_loaded),
        }
    }

    async fn close_all(&self) {
        self.slots.write().await.clear();
    }
}

/// Configuration shared by every per-peer sub-pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_slots_per_peer: usize,
    pub lease_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_slots_per_peer: 4,
            lease_timeout: Duration::from_secs(10),
        }
    }
}

/// A pool of pools — one [`PeerPool`] per peer address.
pub struct ConnectionPool {
    config: PoolConfig,
    peers: Mutex<HashMap<String, Arc<PeerPool>>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            peers: Mutex::new(HashMap::new()),
        }
    }

    fn peer_pool(&self, addr: &str) -> Arc<PeerPool> {
        let mut peers = self.peers.lock().expect("connection pool mutex poisoned");
        peers
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(PeerPool::new(self.config.max_slots_per_peer)))
            .clone()
    }

    /// Lease a connection to `addr`, creating its sub-pool on first use.
    /// Times out after `lease_timeout` if every slot is saturated and no
    /// slot frees up in time.
    pub async fn get(&self, addr: &str) -> Result<Lease, PoolError> {
        let pool = self.peer_pool(addr);
        match tokio::time::timeout(self.config.lease_timeout, pool.lease()).await {
            Ok(lease) => {
                debug!(addr, "leased pooled connection");
                Ok(lease)
            }
            Err(_) => Err(PoolError::Timeout),
        }
    }

    /// Drop every connection to `addr`. Outstanding leases remain valid
    /// until released; new calls to [`Self::get`] open a fresh sub-pool.
    pub async fn close(&self, addr: &str) {
        let pool = {
            let mut peers = self.peers.lock().expect("connection pool mutex poisoned");
            peers.remove(addr)
        };
        if let Some(pool) = pool {
            pool.close_all().await;
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().expect("connection pool mutex poisoned").len()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("timed out waiting for a pooled connection")]
    Timeout,
}
