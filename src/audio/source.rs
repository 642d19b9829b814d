use anyhow::{anyhow, Result};
use bytes::Bytes;
use dashmap::DashMap;
use std::{sync::Arc, time::Duration};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cache::AudioCache,
    sources::{AudioFetcher, Song},
};

type FetchGate = Arc<Mutex<()>>;

/// Resuelve canciones a bytes DCA, usando el caché antes de descargar.
///
/// Concurrent misses for the same key wait on a per-key gate, so only the
/// first caller runs the fetcher; the others find the result in the cache.
pub struct AudioSource {
    cache: Arc<AudioCache>,
    fetcher: Arc<dyn AudioFetcher>,
    fetch_timeout: Option<Duration>,
    in_flight: DashMap<String, FetchGate>,
}

impl AudioSource {
    pub fn new(cache: Arc<AudioCache>, fetcher: Arc<dyn AudioFetcher>) -> Self {
        Self {
            cache,
            fetcher,
            fetch_timeout: None,
            in_flight: DashMap::new(),
        }
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    pub fn cache(&self) -> &Arc<AudioCache> {
        &self.cache
    }

    /// Returns the encoded payload for `song`, fetching it on a cache miss.
    ///
    /// A failed or cancelled fetch leaves the cache untouched.
    pub async fn get(&self, cancel: &CancellationToken, song: &Song) -> Result<Bytes> {
        let key = song.cache_key();
        let key = key.as_str();

        if let Some(data) = self.cache.get(key) {
            debug!("✅ Cache hit: {}", song.title());
            return Ok(data);
        }

        let mut slot = InFlight {
            map: &self.in_flight,
            key,
            guard: None,
        };
        let gate = self.in_flight.entry(key.to_owned()).or_default().clone();

        slot.guard = Some(tokio::select! {
            _ = cancel.cancelled() => return Err(anyhow!("fetch cancelled: {}", song.title())),
            guard = gate.lock_owned() => guard,
        });

        // Otro llamador pudo haberlo descargado mientras esperábamos
        if let Some(data) = self.cache.peek(key) {
            debug!("✅ Cache hit tras esperar descarga en curso: {}", song.title());
            return Ok(data);
        }

        info!("⬇️ Descargando audio: {}", song.title());
        let fetched = tokio::select! {
            _ = cancel.cancelled() => return Err(anyhow!("fetch cancelled: {}", song.title())),
            result = self.fetch(cancel, song) => result,
        };
        let data = fetched.inspect_err(|e| warn!("❌ Falló la descarga de {}: {}", song.title(), e))?;

        self.cache.set(key, data.clone());
        info!("💾 {} bytes en caché para: {}", data.len(), song.title());
        Ok(data)
    }

    async fn fetch(&self, cancel: &CancellationToken, song: &Song) -> Result<Bytes> {
        let fetch = self.fetcher.fetch(cancel.clone(), song);
        match self.fetch_timeout {
            Some(limit) => tokio::time::timeout(limit, fetch)
                .await
                .map_err(|_| anyhow!("fetch timed out after {}", humantime::format_duration(limit)))?,
            None => fetch.await,
        }
    }
}

/// Releases the per-key gate and drops the map entry once nobody else holds
/// it, on every exit path of [`AudioSource::get`].
struct InFlight<'a> {
    map: &'a DashMap<String, FetchGate>,
    key: &'a str,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.map.remove_if(self.key, |_, gate| Arc::strong_count(gate) == 1);
    }
}
