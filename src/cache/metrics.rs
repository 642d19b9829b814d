use anyhow::{Context, Result};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::atomic::{AtomicU64, Ordering};

/// Por qué salió una entrada del caché
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    Expired,
    Lru,
    Explicit,
}

/// Contadores del caché, actualizados en cada operación.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired_evictions: AtomicU64,
    lru_evictions: AtomicU64,
    explicit_evictions: AtomicU64,
    get_ops: AtomicU64,
    set_ops: AtomicU64,
    size: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_get(&self, hit: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.get_ops.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_set(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.set_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self, reason: EvictionReason) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        let counter = match reason {
            EvictionReason::Expired => &self.expired_evictions,
            EvictionReason::Lru => &self.lru_evictions,
            EvictionReason::Explicit => &self.explicit_evictions,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_size(&self, size: usize) {
        self.size.store(size as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStatistics {
        CacheStatistics {
            requests: self.requests.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired_evictions: self.expired_evictions.load(Ordering::Relaxed),
            lru_evictions: self.lru_evictions.load(Ordering::Relaxed),
            explicit_evictions: self.explicit_evictions.load(Ordering::Relaxed),
            get_ops: self.get_ops.load(Ordering::Relaxed),
            set_ops: self.set_ops.load(Ordering::Relaxed),
            size: self.size.load(Ordering::Relaxed),
        }
    }

    /// Prometheus text exposition of the current counters.
    pub fn render_prometheus(&self, prefix: &str) -> Result<String> {
        self.snapshot().render_prometheus(prefix)
    }
}

/// Copia puntual de las métricas
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatistics {
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired_evictions: u64,
    pub lru_evictions: u64,
    pub explicit_evictions: u64,
    pub get_ops: u64,
    pub set_ops: u64,
    pub size: u64,
}

impl CacheStatistics {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }

    pub fn miss_rate(&self) -> f64 {
        1.0 - self.hit_rate()
    }

    /// Exports this snapshot through a throwaway registry namespaced with
    /// `prefix`.
    pub fn render_prometheus(&self, prefix: &str) -> Result<String> {
        let registry = Registry::new_custom(Some(prefix.to_owned()), None)?;

        let counters = [
            ("requests_total", "Cache requests (gets and sets)", self.requests),
            ("hits_total", "Cache hits", self.hits),
            ("misses_total", "Cache misses", self.misses),
            ("get_operations_total", "Get operations", self.get_ops),
            ("set_operations_total", "Set operations", self.set_ops),
        ];
        for (name, help, value) in counters {
            let counter = IntCounter::new(name, help)?;
            counter.inc_by(value);
            registry.register(Box::new(counter))?;
        }

        let evictions = IntCounterVec::new(Opts::new("evictions_total", "Evicted entries"), &["reason"])?;
        for (reason, value) in [
            ("expired", self.expired_evictions),
            ("lru", self.lru_evictions),
            ("explicit", self.explicit_evictions),
        ] {
            evictions.with_label_values(&[reason]).inc_by(value);
        }
        registry.register(Box::new(evictions))?;

        let size = IntGauge::new("size", "Resident entries")?;
        size.set(i64::try_from(self.size).unwrap_or(i64::MAX));
        registry.register(Box::new(size))?;

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).context("prometheus output is not UTF-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let metrics = CacheMetrics::new();
        metrics.record_get(true);
        metrics.record_get(true);
        metrics.record_get(true);
        metrics.record_get(false);

        let stats = metrics.snapshot();
        assert_eq!(stats.requests, 4);
        assert_eq!(stats.get_ops, 4);
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert!((stats.miss_rate() - 0.25).abs() < f64::EPSILON);
        assert_eq!(CacheStatistics::default().hit_rate(), 0.0);
    }

    #[test]
    fn test_prometheus_rendering() {
        let metrics = CacheMetrics::new();
        metrics.record_set();
        metrics.record_eviction(EvictionReason::Lru);
        metrics.set_size(7);

        let text = metrics.render_prometheus("audio_cache").unwrap();
        assert!(text.contains("# TYPE audio_cache_hits_total counter"));
        assert!(text.contains("audio_cache_set_operations_total 1"));
        assert!(text.contains("audio_cache_evictions_total{reason=\"lru\"} 1"));
        assert!(text.contains("audio_cache_evictions_total{reason=\"expired\"} 0"));
        assert!(text.contains("audio_cache_size 7"));
        assert!(text.contains("# TYPE audio_cache_size gauge"));
    }

    #[test]
    fn test_prometheus_rejects_empty_prefix() {
        assert!(CacheMetrics::new().render_prometheus("").is_err());
    }
}
