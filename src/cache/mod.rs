//! # Cache Module
//!
//! Byte-level cache for encoded audio.
//!
//! Fetching and transcoding a track is by far the most expensive step of the
//! relay, so the DCA payload of every played song is memoized here, keyed by
//! the song URL. The cache is bounded in two directions:
//!
//! - **LRU Eviction**: at most `max_entries` payloads; inserting past the
//!   limit drops the least recently *accessed* entry.
//! - **TTL Support**: every entry expires `ttl` after its last `set`. Expired
//!   entries are dropped lazily by `get` and eagerly by a periodic sweep,
//!   since keys that are never requested again would otherwise stay resident.
//!
//! Entries live in a slot arena with an intrusive MRU list (prev/next slot
//! indices) and a key → slot index; freed slots are recycled.
//!
//! ## Configuration
//!
//! ```env
//! CACHE_SIZE=100                # Maximum number of payloads
//! CACHE_TTL=10m                 # Time-to-live
//! CACHE_CLEANUP_INTERVAL=5m     # Sweep period
//! ```
//!
//! ## Metrics
//!
//! Every operation updates [`CacheMetrics`]: requests, hits, misses,
//! evictions (by reason), get/set operation counts and the current size.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use music_relay::cache::{AudioCache, CacheConfig};
//!
//! let cache = AudioCache::new(CacheConfig::default());
//! cache.set("https://youtu.be/dQw4w9WgXcQ", Bytes::from_static(b"DCA1..."));
//!
//! if let Some(dca) = cache.get("https://youtu.be/dQw4w9WgXcQ") {
//!     println!("{} bytes en caché", dca.len());
//! }
//! ```

pub mod lru_cache;
pub mod metrics;

pub use lru_cache::{ByteCache, CacheConfig};
pub use metrics::{CacheMetrics, CacheStatistics, EvictionReason};

/// Cache of encoded DCA payloads keyed by song URL.
pub type AudioCache = ByteCache;
