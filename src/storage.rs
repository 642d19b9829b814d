use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{fs, sync::Mutex};
use tracing::{info, warn};

use crate::{
    audio::queue::{
        MemoryPlaybackState, MemoryPlaylist, PlaybackSnapshot, PlaybackStateStore, Playlist,
        PlaylistStore,
    },
    error::StorageError,
    sources::{PlayedSong, Song},
    voice::{ChannelId, GuildId},
};

/// Dónde se guardan playlist y estado de cada guild
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Json { data_dir: PathBuf },
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackend::Memory => "memory",
            StorageBackend::Json { .. } => "json",
        }
    }

    /// Opens the playlist and playback state of one guild.
    pub async fn open(&self, guild_id: GuildId, max_size: usize) -> Result<GuildStores, StorageError> {
        match self {
            StorageBackend::Memory => Ok(GuildStores {
                playlist: Arc::new(MemoryPlaylist::new(max_size)),
                state: Arc::new(MemoryPlaybackState::new()),
            }),
            StorageBackend::Json { data_dir } => {
                let storage = Arc::new(JsonStorage::open(data_dir, guild_id, max_size).await?);
                Ok(GuildStores {
                    playlist: storage.clone(),
                    state: storage,
                })
            }
        }
    }
}

/// Los dos almacenes que usa un `GuildPlayer`
#[derive(Clone)]
pub struct GuildStores {
    pub playlist: Arc<dyn PlaylistStore>,
    pub state: Arc<dyn PlaybackStateStore>,
}

/// Contenido del archivo `guild_<id>.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct GuildRecord {
    guild_id: GuildId,
    playlist: VecDeque<Song>,
    #[serde(flatten)]
    state: PlaybackSnapshot,
}

/// Playlist y estado de un guild persistidos en un archivo JSON.
///
/// The whole record is kept in memory and rewritten after every mutation;
/// writes go to a temporary file first and are renamed into place.
pub struct JsonStorage {
    path: PathBuf,
    max_size: usize,
    record: Mutex<GuildRecord>,
}

impl JsonStorage {
    pub async fn open(data_dir: &Path, guild_id: GuildId, max_size: usize) -> Result<Self, StorageError> {
        fs::create_dir_all(data_dir).await?;
        let path = data_dir.join(format!("guild_{guild_id}.json"));

        let record = match fs::read_to_string(&path).await {
            Ok(content) => {
                let record: GuildRecord = serde_json::from_str(&content)?;
                info!(
                    "📂 Estado cargado para guild {}: {} canciones en cola",
                    guild_id,
                    record.playlist.len()
                );
                record
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => GuildRecord {
                guild_id,
                ..Default::default()
            },
            Err(e) => return Err(e.into()),
        };

        if record.guild_id != guild_id {
            warn!(
                "⚠️ {} pertenece al guild {}, se usará para {}",
                path.display(),
                record.guild_id,
                guild_id
            );
        }

        Ok(Self {
            path,
            max_size,
            record: Mutex::new(record),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn save(&self, record: &GuildRecord) -> Result<(), StorageError> {
        let content = serde_json::to_vec_pretty(record)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Applies `f` to the record and persists it when `f` succeeds.
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut GuildRecord, usize) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut record = self.record.lock().await;
        let out = f(&mut *record, self.max_size)?;
        self.save(&record).await?;
        Ok(out)
    }

    async fn mutate_playlist<T>(
        &self,
        f: impl FnOnce(&mut Playlist<'_>) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        self.mutate(|record, max_size| {
            f(&mut Playlist {
                songs: &mut record.playlist,
                max_size,
            })
        })
        .await
    }
}

#[async_trait]
impl PlaylistStore for JsonStorage {
    async fn prepend_song(&self, song: Song) -> Result<(), StorageError> {
        self.mutate_playlist(|p| p.prepend(song)).await
    }

    async fn append_songs(&self, songs: Vec<Song>) -> Result<(), StorageError> {
        self.mutate_playlist(|p| p.append(songs)).await
    }

    async fn remove_song(&self, position: usize) -> Result<Song, StorageError> {
        self.mutate_playlist(|p| p.remove(position)).await
    }

    async fn clear_playlist(&self) -> Result<(), StorageError> {
        self.mutate_playlist(|p| {
            p.clear();
            Ok(())
        })
        .await
    }

    async fn songs(&self) -> Result<Vec<Song>, StorageError> {
        Ok(self.record.lock().await.playlist.iter().cloned().collect())
    }

    async fn pop_first_song(&self) -> Result<Song, StorageError> {
        self.mutate_playlist(|p| p.pop_first()).await
    }
}

#[async_trait]
impl PlaybackStateStore for JsonStorage {
    async fn current_song(&self) -> Result<Option<PlayedSong>, StorageError> {
        Ok(self.record.lock().await.state.current_song.clone())
    }

    async fn set_current_song(&self, song: Option<PlayedSong>) -> Result<(), StorageError> {
        self.mutate(|record, _| {
            record.state.current_song = song;
            Ok(())
        })
        .await
    }

    async fn voice_channel(&self) -> Result<Option<ChannelId>, StorageError> {
        Ok(self.record.lock().await.state.voice_channel)
    }

    async fn set_voice_channel(&self, channel: ChannelId) -> Result<(), StorageError> {
        self.mutate(|record, _| {
            record.state.voice_channel = Some(channel);
            Ok(())
        })
        .await
    }

    async fn text_channel(&self) -> Result<Option<ChannelId>, StorageError> {
        Ok(self.record.lock().await.state.text_channel)
    }

    async fn set_text_channel(&self, channel: ChannelId) -> Result<(), StorageError> {
        self.mutate(|record, _| {
            record.state.text_channel = Some(channel);
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::SourceType;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tempfile::TempDir;

    fn song(title: &str) -> Song {
        Song::new(title, format!("https://example.com/{title}.mp3"), SourceType::DirectUrl)
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let guild = GuildId(42);

        {
            let storage = JsonStorage::open(dir.path(), guild, 10).await.unwrap();
            storage.append_songs(vec![song("a"), song("b")]).await.unwrap();
            storage.pop_first_song().await.unwrap();
            storage
                .set_current_song(Some(PlayedSong::new(song("a")).with_position(Duration::from_secs(12))))
                .await
                .unwrap();
            storage.set_voice_channel(ChannelId(1)).await.unwrap();
            storage.set_text_channel(ChannelId(2)).await.unwrap();
            assert!(storage.path().ends_with("guild_42.json"));
        }

        let storage = JsonStorage::open(dir.path(), guild, 10).await.unwrap();
        let songs = storage.songs().await.unwrap();
        assert_eq!(songs.len(), 1);
        assert_eq!(songs[0].title(), "b");

        let current = storage.current_song().await.unwrap().unwrap();
        assert_eq!(current.song.title(), "a");
        assert_eq!(current.position, Duration::from_secs(12));
        assert_eq!(storage.voice_channel().await.unwrap(), Some(ChannelId(1)));
        assert_eq!(storage.text_channel().await.unwrap(), Some(ChannelId(2)));
    }

    #[tokio::test]
    async fn test_failed_mutation_is_not_persisted() {
        let dir = TempDir::new().unwrap();
        let storage = JsonStorage::open(dir.path(), GuildId(1), 1).await.unwrap();

        assert!(matches!(storage.pop_first_song().await, Err(StorageError::NoSongs)));
        assert!(!storage.path().exists());

        storage.append_songs(vec![song("a")]).await.unwrap();
        assert!(matches!(
            storage.append_songs(vec![song("b")]).await,
            Err(StorageError::PlaylistFull(1))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("guild_5.json"), b"{not json").unwrap();

        assert!(matches!(
            JsonStorage::open(dir.path(), GuildId(5), 10).await,
            Err(StorageError::Json(_))
        ));
    }

    #[tokio::test]
    async fn test_backend_selection() {
        let dir = TempDir::new().unwrap();
        let memory = StorageBackend::Memory.open(GuildId(1), 10).await.unwrap();
        memory.playlist.append_songs(vec![song("a")]).await.unwrap();
        assert_eq!(memory.playlist.songs().await.unwrap().len(), 1);

        let backend = StorageBackend::Json {
            data_dir: dir.path().to_path_buf(),
        };
        assert_eq!(backend.as_str(), "json");
        let json = backend.open(GuildId(2), 10).await.unwrap();
        json.state.set_text_channel(ChannelId(9)).await.unwrap();
        assert!(dir.path().join("guild_2.json").exists());
    }
}
