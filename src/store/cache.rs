use crate::database::models::{canonical_mac, Lease, LeaseState};
use chrono::Utc;
use mac_address::MacAddress;
use serde::Serialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

/// Per-node, read-side LRU of recent leases, indexed by MAC and by IP.
///
/// Strictly an optimization: allocation decisions always read the database,
/// and entries are inserted only after the store has confirmed a write.
/// Recency is a monotone tick bumped on access; eviction removes the entry
/// with the smallest tick. One mutex covers the map, the IP index and the
/// tick state, so every reader also updates recency exactly.
pub struct LeaseCache {
    max_size: usize,
    inner: Mutex<Inner>,
}

struct Entry {
    lease: Lease,
    tick: u64,
}

#[derive(Default)]
struct Inner {
    by_mac: HashMap<String, Entry>,
    ip_index: HashMap<Ipv4Addr, String>,
    next_tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

impl LeaseCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn get_by_mac(&self, mac: &MacAddress) -> Option<Lease> {
        let key = canonical_mac(mac);
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.next_tick += 1;
        let tick = inner.next_tick;
        if let Some(entry) = inner.by_mac.get_mut(&key) {
            entry.tick = tick;
            let lease = entry.lease.clone();
            inner.hits += 1;
            Some(lease)
        } else {
            inner.misses += 1;
            None
        }
    }

    pub fn get_by_ip(&self, ip: Ipv4Addr) -> Option<Lease> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.next_tick += 1;
        let tick = inner.next_tick;
        let key = match inner.ip_index.get(&ip) {
            Some(key) => key.clone(),
            None => {
                inner.misses += 1;
                return None;
            }
        };
        if let Some(entry) = inner.by_mac.get_mut(&key) {
            entry.tick = tick;
            let lease = entry.lease.clone();
            inner.hits += 1;
            Some(lease)
        } else {
            inner.misses += 1;
            None
        }
    }

    /// Insert or refresh. Both indices are updated; a stale IP mapping for
    /// the same MAC is dropped first.
    pub fn put(&self, lease: Lease) {
        let key = lease.mac_string();
        let ip = lease.ip;
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.next_tick += 1;
        let tick = inner.next_tick;

        // same MAC moving to a new IP: drop its old IP mapping
        if let Some(old) = inner.by_mac.get(&key) {
            let old_ip = old.lease.ip;
            if old_ip != ip {
                inner.ip_index.remove(&old_ip);
            }
        }
        // IP changing hands: drop the previous owner's entry, or its MAC
        // index would keep pointing at an address it no longer holds
        if let Some(prev_key) = inner.ip_index.get(&ip).filter(|k| **k != key).cloned() {
            inner.by_mac.remove(&prev_key);
        }

        inner.ip_index.insert(ip, key.clone());
        inner.by_mac.insert(key, Entry { lease, tick });

        if inner.by_mac.len() > self.max_size {
            Self::evict_lru(inner);
        }
    }

    pub fn remove_by_mac(&self, mac: &MacAddress) {
        let key = canonical_mac(mac);
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.by_mac.remove(&key) {
            inner.ip_index.remove(&entry.lease.ip);
        }
    }

    pub fn remove_by_ip(&self, ip: Ipv4Addr) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(key) = inner.ip_index.remove(&ip) {
            inner.by_mac.remove(&key);
        }
    }

    /// Drops entries that claim to be active but whose expiry has passed.
    /// Returns the number removed.
    pub fn expire_old(&self) -> usize {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        let stale: Vec<String> = inner
            .by_mac
            .iter()
            .filter(|(_, e)| e.lease.state == LeaseState::Active && e.lease.expires_at < now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            if let Some(entry) = inner.by_mac.remove(key) {
                inner.ip_index.remove(&entry.lease.ip);
            }
        }
        stale.len()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        let lookups = inner.hits + inner.misses;
        CacheStats {
            size: inner.by_mac.len(),
            max_size: self.max_size,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                inner.hits as f64 / lookups as f64
            },
        }
    }

    fn evict_lru(inner: &mut Inner) {
        let victim = inner
            .by_mac
            .iter()
            .min_by_key(|(_, e)| e.tick)
            .map(|(k, _)| k.clone());
        if let Some(key) = victim {
            if let Some(entry) = inner.by_mac.remove(&key) {
                inner.ip_index.remove(&entry.lease.ip);
            }
            inner.evictions += 1;
        }
    }
}
