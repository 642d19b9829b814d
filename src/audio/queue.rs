use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info};

use crate::{
    error::StorageError,
    sources::{PlayedSong, Song},
    voice::ChannelId,
};

/// Playlist de un guild. Positions are 0-based.
#[async_trait]
pub trait PlaylistStore: Send + Sync {
    async fn prepend_song(&self, song: Song) -> Result<(), StorageError>;

    async fn append_songs(&self, songs: Vec<Song>) -> Result<(), StorageError>;

    async fn remove_song(&self, position: usize) -> Result<Song, StorageError>;

    async fn clear_playlist(&self) -> Result<(), StorageError>;

    async fn songs(&self) -> Result<Vec<Song>, StorageError>;

    /// Fails with [`StorageError::NoSongs`] when the playlist is empty.
    async fn pop_first_song(&self) -> Result<Song, StorageError>;
}

/// Estado de reproducción de un guild.
#[async_trait]
pub trait PlaybackStateStore: Send + Sync {
    async fn current_song(&self) -> Result<Option<PlayedSong>, StorageError>;

    async fn set_current_song(&self, song: Option<PlayedSong>) -> Result<(), StorageError>;

    async fn voice_channel(&self) -> Result<Option<ChannelId>, StorageError>;

    async fn set_voice_channel(&self, channel: ChannelId) -> Result<(), StorageError>;

    async fn text_channel(&self) -> Result<Option<ChannelId>, StorageError>;

    async fn set_text_channel(&self, channel: ChannelId) -> Result<(), StorageError>;
}

/// Snapshot of everything [`PlaybackStateStore`] tracks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaybackSnapshot {
    pub current_song: Option<PlayedSong>,
    pub voice_channel: Option<ChannelId>,
    pub text_channel: Option<ChannelId>,
}

/// Playlist operations over a plain deque, shared by every backend.
pub(crate) struct Playlist<'a> {
    pub songs: &'a mut VecDeque<Song>,
    pub max_size: usize,
}

impl Playlist<'_> {
    pub fn prepend(&mut self, song: Song) -> Result<(), StorageError> {
        self.ensure_room(1)?;
        info!("⏫ Agregado al inicio de la cola: {}", song.title());
        self.songs.push_front(song);
        Ok(())
    }

    pub fn append(&mut self, songs: Vec<Song>) -> Result<(), StorageError> {
        self.ensure_room(songs.len())?;
        for song in songs {
            info!("➕ Agregado a la cola: {}", song.title());
            self.songs.push_back(song);
        }
        Ok(())
    }

    pub fn remove(&mut self, position: usize) -> Result<Song, StorageError> {
        let len = self.songs.len();
        let song = self
            .songs
            .remove(position)
            .ok_or(StorageError::PositionOutOfRange { position, len })?;
        debug!("❌ Canción eliminada en posición {}", position);
        Ok(song)
    }

    pub fn clear(&mut self) {
        self.songs.clear();
        info!("🗑️ Cola limpiada");
    }

    pub fn pop_first(&mut self) -> Result<Song, StorageError> {
        self.songs.pop_front().ok_or(StorageError::NoSongs)
    }

    fn ensure_room(&self, extra: usize) -> Result<(), StorageError> {
        if self.songs.len() + extra > self.max_size {
            return Err(StorageError::PlaylistFull(self.max_size));
        }
        Ok(())
    }
}

/// Playlist en memoria
pub struct MemoryPlaylist {
    songs: Mutex<VecDeque<Song>>,
    max_size: usize,
}

impl MemoryPlaylist {
    pub fn new(max_size: usize) -> Self {
        Self {
            songs: Mutex::new(VecDeque::new()),
            max_size,
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut Playlist<'_>) -> T) -> T {
        let mut songs = self.songs.lock();
        f(&mut Playlist {
            songs: &mut *songs,
            max_size: self.max_size,
        })
    }
}

#[async_trait]
impl PlaylistStore for MemoryPlaylist {
    async fn prepend_song(&self, song: Song) -> Result<(), StorageError> {
        self.with(|p| p.prepend(song))
    }

    async fn append_songs(&self, songs: Vec<Song>) -> Result<(), StorageError> {
        self.with(|p| p.append(songs))
    }

    async fn remove_song(&self, position: usize) -> Result<Song, StorageError> {
        self.with(|p| p.remove(position))
    }

    async fn clear_playlist(&self) -> Result<(), StorageError> {
        self.with(|p| p.clear());
        Ok(())
    }

    async fn songs(&self) -> Result<Vec<Song>, StorageError> {
        Ok(self.songs.lock().iter().cloned().collect())
    }

    async fn pop_first_song(&self) -> Result<Song, StorageError> {
        self.with(|p| p.pop_first())
    }
}

/// Estado de reproducción en memoria
#[derive(Default)]
pub struct MemoryPlaybackState {
    inner: Mutex<PlaybackSnapshot>,
}

impl MemoryPlaybackState {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PlaybackStateStore for MemoryPlaybackState {
    async fn current_song(&self) -> Result<Option<PlayedSong>, StorageError> {
        Ok(self.inner.lock().current_song.clone())
    }

    async fn set_current_song(&self, song: Option<PlayedSong>) -> Result<(), StorageError> {
        self.inner.lock().current_song = song;
        Ok(())
    }

    async fn voice_channel(&self) -> Result<Option<ChannelId>, StorageError> {
        Ok(self.inner.lock().voice_channel)
    }

    async fn set_voice_channel(&self, channel: ChannelId) -> Result<(), StorageError> {
        self.inner.lock().voice_channel = Some(channel);
        Ok(())
    }

    async fn text_channel(&self) -> Result<Option<ChannelId>, StorageError> {
        Ok(self.inner.lock().text_channel)
    }

    async fn set_text_channel(&self, channel: ChannelId) -> Result<(), StorageError> {
        self.inner.lock().text_channel = Some(channel);
        Ok(())
    }
}
