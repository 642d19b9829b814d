use anyhow::{Context, Result};
use std::{fmt::Display, path::PathBuf, str::FromStr, time::Duration};

use crate::{
    audio::{dca::EncodeOptions, player::PlayerSettings},
    cache::CacheConfig,
    storage::StorageBackend,
};

#[derive(Debug, Clone)]
pub struct Config {
    // Caché
    pub cache_size: usize,
    pub cache_ttl: Duration,
    pub cache_cleanup_interval: Duration,

    // Reproducción
    pub read_buffer_size: usize,
    pub frame_channel_capacity: usize,
    pub position_report_frames: u64,
    pub fetch_timeout: Duration,
    pub max_queue_size: usize,

    // Codificación
    pub opus_bitrate: u32,
    pub frame_duration_ms: u32,

    // Almacenamiento
    pub storage: StorageBackend,

    // Herramientas externas
    pub ytdlp_path: String,
    pub ffmpeg_path: String,
}

impl Config {
    /// Loads `.env` (if present) and then the process environment.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from `lookup`, falling back to defaults for
    /// missing keys, and validates it.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let data_dir: PathBuf = lookup("DATA_DIR").map(PathBuf::from).unwrap_or_else(|| "./data".into());
        let storage = match lookup("STORAGE_BACKEND").as_deref().map(str::trim) {
            None | Some("") | Some("memory") => StorageBackend::Memory,
            Some("json") => StorageBackend::Json { data_dir },
            Some(other) => anyhow::bail!("STORAGE_BACKEND must be `memory` or `json`, got: {}", other),
        };

        let config = Self {
            cache_size: parse_or(&lookup, "CACHE_SIZE", defaults.cache_size)?,
            cache_ttl: duration_or(&lookup, "CACHE_TTL", defaults.cache_ttl)?,
            cache_cleanup_interval: duration_or(&lookup, "CACHE_CLEANUP_INTERVAL", defaults.cache_cleanup_interval)?,

            read_buffer_size: parse_or(&lookup, "READ_BUFFER_SIZE", defaults.read_buffer_size)?,
            frame_channel_capacity: parse_or(&lookup, "FRAME_CHANNEL_CAPACITY", defaults.frame_channel_capacity)?,
            position_report_frames: parse_or(&lookup, "POSITION_REPORT_FRAMES", defaults.position_report_frames)?,
            fetch_timeout: duration_or(&lookup, "FETCH_TIMEOUT", defaults.fetch_timeout)?,
            max_queue_size: parse_or(&lookup, "MAX_QUEUE_SIZE", defaults.max_queue_size)?,

            opus_bitrate: parse_or(&lookup, "OPUS_BITRATE", defaults.opus_bitrate)?,
            frame_duration_ms: parse_or(&lookup, "FRAME_DURATION_MS", defaults.frame_duration_ms)?,

            storage,

            ytdlp_path: lookup("YTDLP_PATH").unwrap_or(defaults.ytdlp_path),
            ffmpeg_path: lookup("FFMPEG_PATH").unwrap_or(defaults.ffmpeg_path),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Cache size, TTL and sweep period must be non-zero
    /// - Read buffer, frame channel and playlist capacity must be non-zero
    /// - Opus bitrate must be within 8kbps..=510kbps
    /// - Frame duration must be 20, 40 or 60 ms
    pub fn validate(&self) -> Result<()> {
        if self.cache_size == 0 {
            anyhow::bail!("Cache size must be greater than 0");
        }
        if self.cache_ttl.is_zero() {
            anyhow::bail!("Cache TTL must be greater than 0");
        }
        if self.cache_cleanup_interval.is_zero() {
            anyhow::bail!("Cache cleanup interval must be greater than 0");
        }

        if self.read_buffer_size == 0 {
            anyhow::bail!("Read buffer size must be greater than 0");
        }
        if self.frame_channel_capacity == 0 {
            anyhow::bail!("Frame channel capacity must be greater than 0");
        }
        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.opus_bitrate > 510_000 {
            anyhow::bail!("Opus bitrate cannot exceed 510kbps, got: {}", self.opus_bitrate);
        }
        if self.opus_bitrate < 8_000 {
            anyhow::bail!("Opus bitrate too low, minimum 8kbps, got: {}", self.opus_bitrate);
        }
        if !matches!(self.frame_duration_ms, 20 | 40 | 60) {
            anyhow::bail!("Frame duration must be 20, 40 or 60 ms, got: {}", self.frame_duration_ms);
        }

        Ok(())
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_entries: self.cache_size,
            ttl: self.cache_ttl,
            cleanup_interval: self.cache_cleanup_interval,
        }
    }

    pub fn player_settings(&self) -> PlayerSettings {
        PlayerSettings {
            read_buffer_size: self.read_buffer_size,
            frame_channel_capacity: self.frame_channel_capacity,
            report_every: self.position_report_frames,
        }
    }

    pub fn encode_options(&self) -> EncodeOptions {
        EncodeOptions {
            bitrate: self.opus_bitrate,
            frame_duration_ms: self.frame_duration_ms,
            source_url: None,
        }
    }

    /// Returns a summary of the current configuration for logging.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Cache: {} entries, TTL {}, sweep every {}\n  \
            Playback: {} KiB buffer, {} frames channel, report every {} frames\n  \
            Audio: {}kbps, {}ms frames, fetch timeout {}\n  \
            Storage: {} (max {} songs)\n  \
            Tools: {} / {}",
            self.cache_size,
            humantime::format_duration(self.cache_ttl),
            humantime::format_duration(self.cache_cleanup_interval),
            self.read_buffer_size / 1024,
            self.frame_channel_capacity,
            self.position_report_frames,
            self.opus_bitrate / 1000,
            self.frame_duration_ms,
            humantime::format_duration(self.fetch_timeout),
            self.storage.as_str(),
            self.max_queue_size,
            self.ytdlp_path,
            self.ffmpeg_path
        )
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        let cache = CacheConfig::default();
        let player = PlayerSettings::default();
        let encode = EncodeOptions::default();

        Self {
            cache_size: cache.max_entries,
            cache_ttl: cache.ttl,
            cache_cleanup_interval: cache.cleanup_interval,

            read_buffer_size: player.read_buffer_size,
            frame_channel_capacity: player.frame_channel_capacity,
            position_report_frames: player.report_every,
            fetch_timeout: Duration::from_secs(300),
            max_queue_size: 1000,

            opus_bitrate: encode.bitrate,       // 96kbps
            frame_duration_ms: encode.frame_duration_ms, // 20ms @ 48kHz

            storage: StorageBackend::Memory,

            ytdlp_path: "yt-dlp".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {}={:?}: {}", key, raw, e)),
        _ => Ok(default),
    }
}

fn duration_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Result<Duration> {
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            humantime::parse_duration(raw.trim()).with_context(|| format!("invalid {key}={raw:?}"))
        }
        _ => Ok(default),
    }
}
