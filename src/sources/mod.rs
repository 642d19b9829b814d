pub mod ytdlp;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::voice::UserId;

pub use ytdlp::YtDlpFetcher;

/// Resuelve una canción a bytes DCA listos para decodificar.
///
/// This is the expensive path (download + transcode) that
/// [`AudioSource`](crate::audio::source::AudioSource) shields with the byte
/// cache. Implementations must return an error instead of partial output.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AudioFetcher: Send + Sync {
    async fn fetch(&self, cancel: CancellationToken, song: &Song) -> Result<Bytes>;
}

/// Proveedor de una canción
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    YouTube,
    DirectUrl,
    /// Already DCA encoded; fetched as-is.
    Dca,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::YouTube => "youtube",
            SourceType::DirectUrl => "direct",
            SourceType::Dca => "dca",
        }
    }

    /// Detecta el tipo a partir de la URL
    pub fn detect(url: &str) -> Self {
        if url.contains("youtube.com") || url.contains("youtu.be") {
            SourceType::YouTube
        } else if url.ends_with(".dca") {
            SourceType::Dca
        } else {
            SourceType::DirectUrl
        }
    }
}

/// Representa una canción reproducible
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Song {
    source_type: SourceType,
    title: String,
    url: String,
    playable: bool,
    thumbnail: Option<String>,
    duration: Duration,
    start_offset: Option<Duration>,
    requested_by: Option<UserId>,
    added_at: DateTime<Utc>,
}

impl Song {
    pub fn new(title: impl Into<String>, url: impl Into<String>, source_type: SourceType) -> Self {
        Self {
            source_type,
            title: title.into(),
            url: url.into(),
            playable: true,
            thumbnail: None,
            duration: Duration::ZERO,
            start_offset: None,
            requested_by: None,
            added_at: Utc::now(),
        }
    }

    // Getters
    pub fn source_type(&self) -> SourceType {
        self.source_type
    }
    pub fn title(&self) -> &str {
        &self.title
    }
    pub fn url(&self) -> &str {
        &self.url
    }
    pub fn is_playable(&self) -> bool {
        self.playable
    }
    pub fn thumbnail(&self) -> Option<&str> {
        self.thumbnail.as_deref()
    }
    pub fn duration(&self) -> Duration {
        self.duration
    }
    pub fn start_offset(&self) -> Option<Duration> {
        self.start_offset
    }
    pub fn requested_by(&self) -> Option<UserId> {
        self.requested_by
    }
    pub fn added_at(&self) -> DateTime<Utc> {
        self.added_at
    }

    // Setters
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_thumbnail(mut self, thumbnail: impl Into<String>) -> Self {
        self.thumbnail = Some(thumbnail.into());
        self
    }

    pub fn with_start_offset(mut self, offset: Duration) -> Self {
        self.start_offset = Some(offset);
        self
    }

    pub fn with_requested_by(mut self, user_id: UserId) -> Self {
        self.requested_by = Some(user_id);
        self
    }

    pub fn with_playable(mut self, playable: bool) -> Self {
        self.playable = playable;
        self
    }

    /// Cache key for the encoded audio of this song.
    ///
    /// A song resumed mid-track is encoded from its offset, so the offset is
    /// part of the key (`<url>#t=<ms>`).
    pub fn cache_key(&self) -> String {
        match self.start_offset.filter(|o| !o.is_zero()) {
            Some(offset) => format!("{}#t={}", self.url, offset.as_millis()),
            None => self.url.clone(),
        }
    }
}

/// Canción en reproducción con la última posición reportada
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayedSong {
    pub song: Song,
    pub position: Duration,
}

impl PlayedSong {
    pub fn new(song: Song) -> Self {
        let position = song.start_offset().unwrap_or_default();
        Self { song, position }
    }

    pub fn with_position(mut self, position: Duration) -> Self {
        self.position = position;
        self
    }
}
