use bytes::Bytes;
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::metrics::{CacheMetrics, EvictionReason};

/// Configuración del caché de bytes
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub ttl: Duration,
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 100,
            ttl: Duration::from_secs(600),              // 10 minutos
            cleanup_interval: Duration::from_secs(300), // 5 minutos
        }
    }
}

/// Arena slot. Free slots are recycled through `Inner::free`; a recycled
/// slot has every field overwritten before it is linked again.
#[derive(Debug)]
struct Slot {
    key: String,
    data: Bytes,
    expires_at: Instant,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Index plus MRU list. `index` and the list always hold the same keys.
#[derive(Debug, Default)]
struct Inner {
    index: HashMap<String, usize>,
    slots: Vec<Slot>,
    free: Vec<usize>,
    /// Most recently used.
    head: Option<usize>,
    /// Least recently used.
    tail: Option<usize>,
}

impl Inner {
    fn len(&self) -> usize {
        self.index.len()
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);

        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => self.tail = prev,
        }

        self.slots[idx].prev = None;
        self.slots[idx].next = None;
    }

    fn push_front(&mut self, idx: usize) {
        self.slots[idx].prev = None;
        self.slots[idx].next = self.head;

        if let Some(old_head) = self.head {
            self.slots[old_head].prev = Some(idx);
        }
        self.head = Some(idx);

        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn promote(&mut self, idx: usize) {
        if self.head != Some(idx) {
            self.unlink(idx);
            self.push_front(idx);
        }
    }

    fn insert(&mut self, key: &str, data: Bytes, expires_at: Instant) -> usize {
        let idx = match self.free.pop() {
            Some(idx) => {
                let slot = &mut self.slots[idx];
                slot.key.clear();
                slot.key.push_str(key);
                slot.data = data;
                slot.expires_at = expires_at;
                slot.prev = None;
                slot.next = None;
                idx
            }
            None => {
                self.slots.push(Slot {
                    key: key.to_owned(),
                    data,
                    expires_at,
                    prev: None,
                    next: None,
                });
                self.slots.len() - 1
            }
        };

        self.index.insert(key.to_owned(), idx);
        self.push_front(idx);
        idx
    }

    /// Unlinks the slot, drops its payload and returns it to the pool.
    fn release(&mut self, idx: usize) {
        self.unlink(idx);

        let slot = &mut self.slots[idx];
        self.index.remove(slot.key.as_str());
        slot.key.clear();
        slot.data = Bytes::new();

        self.free.push(idx);
    }

    fn expired(&self, now: Instant) -> Vec<usize> {
        let mut expired = Vec::new();
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let slot = &self.slots[idx];
            if slot.expires_at <= now {
                expired.push(idx);
            }
            cursor = slot.next;
        }
        expired
    }
}

/// TTL + LRU cache of opaque byte payloads keyed by source identifier.
///
/// All state sits behind one [`RwLock`]. Lookups start on an upgradable read
/// and only upgrade when they have to promote or evict; inserts, removals and
/// the background sweep take the write lock. No other lock is ever taken
/// while it is held.
#[derive(Debug)]
pub struct ByteCache {
    config: CacheConfig,
    inner: RwLock<Inner>,
    metrics: Arc<CacheMetrics>,
}

impl ByteCache {
    pub fn new(config: CacheConfig) -> Self {
        info!(
            "🗄️ Caché de audio iniciado: {} entradas, TTL {}",
            config.max_entries,
            humantime::format_duration(config.ttl)
        );

        Self {
            config,
            inner: RwLock::new(Inner::default()),
            metrics: Arc::new(CacheMetrics::new()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<CacheMetrics> {
        self.metrics.clone()
    }

    /// Returns the payload and marks it most recently used. An expired entry
    /// is evicted and reported as a miss.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let guard = self.inner.upgradable_read();
        let Some(&idx) = guard.index.get(key) else {
            self.metrics.record_get(false);
            return None;
        };

        let mut guard = RwLockUpgradableReadGuard::upgrade(guard);

        if guard.slots[idx].expires_at <= Instant::now() {
            guard.release(idx);
            self.metrics.record_eviction(EvictionReason::Expired);
            self.metrics.set_size(guard.len());
            self.metrics.record_get(false);
            debug!("⏰ Entrada expirada removida: {}", key);
            return None;
        }

        guard.promote(idx);
        let data = guard.slots[idx].data.clone();
        self.metrics.record_get(true);
        Some(data)
    }

    /// Inserts or refreshes `key`. A refresh replaces the payload, extends
    /// the expiry and promotes the entry; a new key may push out the least
    /// recently used one.
    pub fn set(&self, key: &str, data: Bytes) {
        let expires_at = Instant::now() + self.config.ttl;
        let mut guard = self.inner.write();

        if let Some(&idx) = guard.index.get(key) {
            let slot = &mut guard.slots[idx];
            slot.data = data;
            slot.expires_at = expires_at;
            guard.promote(idx);
        } else {
            guard.insert(key, data, expires_at);

            if guard.len() > self.config.max_entries {
                if let Some(lru) = guard.tail {
                    debug!("♻️ Desalojando entrada LRU: {}", guard.slots[lru].key);
                    guard.release(lru);
                    self.metrics.record_eviction(EvictionReason::Lru);
                }
            }
        }

        self.metrics.record_set();
        self.metrics.set_size(guard.len());
    }

    pub fn remove(&self, key: &str) -> bool {
        let mut guard = self.inner.write();
        let Some(&idx) = guard.index.get(key) else {
            return false;
        };

        guard.release(idx);
        self.metrics.record_eviction(EvictionReason::Explicit);
        self.metrics.set_size(guard.len());
        true
    }

    pub fn clear(&self) {
        let mut guard = self.inner.write();
        let removed = guard.len();
        *guard = Inner::default();
        for _ in 0..removed {
            self.metrics.record_eviction(EvictionReason::Explicit);
        }
        self.metrics.set_size(0);
    }

    pub fn size(&self) -> usize {
        self.inner.read().len()
    }

    /// Live payload lookup that neither promotes the entry nor counts as a
    /// request.
    pub fn peek(&self, key: &str) -> Option<Bytes> {
        let guard = self.inner.read();
        let &idx = guard.index.get(key)?;
        let slot = &guard.slots[idx];
        (slot.expires_at > Instant::now()).then(|| slot.data.clone())
    }

    /// Live entry check without touching recency.
    pub fn contains(&self, key: &str) -> bool {
        let guard = self.inner.read();
        guard
            .index
            .get(key)
            .is_some_and(|&idx| guard.slots[idx].expires_at > Instant::now())
    }

    /// Evicts every expired entry; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut guard = self.inner.write();
        let expired = guard.expired(Instant::now());

        for &idx in &expired {
            guard.release(idx);
            self.metrics.record_eviction(EvictionReason::Expired);
        }
        self.metrics.set_size(guard.len());

        expired.len()
    }

    /// Periodic sweep of expired entries.
    ///
    /// The task only keeps a weak reference and stops when the cache is
    /// dropped or `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        let period = self.config.cleanup_interval;

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some(cache) = cache.upgrade() else {
                    break;
                };

                let removed = cache.purge_expired();
                if removed > 0 {
                    info!("🧹 Limpieza de caché: {} entradas expiradas removidas", removed);
                }
            }

            debug!("Limpieza periódica del caché detenida");
        })
    }
}
