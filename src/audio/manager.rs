use anyhow::{bail, Result};
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{
    player::{GuildPlayer, PlayerSettings},
    source::AudioSource,
};
use crate::{
    storage::StorageBackend,
    voice::{GuildId, TextChannel, VoiceConnection},
};

/// Crea la conexión de voz de un guild.
pub type VoiceFactory = Box<dyn Fn(GuildId) -> Arc<dyn VoiceConnection> + Send + Sync>;

struct ManagedPlayer {
    player: Arc<GuildPlayer>,
    task: JoinHandle<()>,
}

/// Registro de reproductores por guild.
///
/// Players are created on first use and their loop is spawned on a child of
/// the manager's shutdown token.
pub struct PlayerManager {
    players: DashMap<GuildId, ManagedPlayer>,
    voice_factory: VoiceFactory,
    text: Arc<dyn TextChannel>,
    source: Arc<AudioSource>,
    storage: StorageBackend,
    max_queue_size: usize,
    settings: PlayerSettings,
    shutdown: CancellationToken,
}

impl PlayerManager {
    pub fn new(
        voice_factory: VoiceFactory,
        text: Arc<dyn TextChannel>,
        source: Arc<AudioSource>,
        storage: StorageBackend,
        max_queue_size: usize,
        settings: PlayerSettings,
    ) -> Self {
        Self {
            players: DashMap::new(),
            voice_factory,
            text,
            source,
            storage,
            max_queue_size,
            settings,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn get(&self, guild_id: GuildId) -> Option<Arc<GuildPlayer>> {
        self.players.get(&guild_id).map(|entry| entry.player.clone())
    }

    pub async fn get_or_create(&self, guild_id: GuildId) -> Result<Arc<GuildPlayer>> {
        if self.shutdown.is_cancelled() {
            bail!("player manager is shut down");
        }
        if let Some(player) = self.get(guild_id) {
            return Ok(player);
        }

        let stores = self.storage.open(guild_id, self.max_queue_size).await?;
        let player = Arc::new(GuildPlayer::new(
            guild_id,
            (self.voice_factory)(guild_id),
            self.text.clone(),
            stores,
            self.source.clone(),
            self.settings.clone(),
        ));

        match self.players.entry(guild_id) {
            Entry::Occupied(entry) => Ok(entry.get().player.clone()),
            Entry::Vacant(entry) => {
                let task = {
                    let player = player.clone();
                    let cancel = self.shutdown.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = player.run(cancel).await {
                            error!("❌ Loop de guild {} terminó con error: {:#}", player.guild_id(), e);
                        }
                    })
                };
                info!("🆕 Reproductor creado para guild {}", guild_id);
                entry.insert(ManagedPlayer {
                    player: player.clone(),
                    task,
                });
                Ok(player)
            }
        }
    }

    pub fn guilds(&self) -> Vec<GuildId> {
        self.players.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Cancela todos los loops, espera a que terminen y cierra la voz.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        for guild_id in self.guilds() {
            let Some((_, managed)) = self.players.remove(&guild_id) else {
                continue;
            };

            if let Err(e) = managed.task.await {
                error!("❌ Tarea de guild {} falló: {}", guild_id, e);
            }
            if let Err(e) = managed.player.voice().close().await {
                warn!("⚠️ Error cerrando voz de guild {}: {}", guild_id, e);
            }
        }

        info!("👋 Reproductores detenidos");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::dca::{DcaEncoder, EncodeOptions},
        cache::{AudioCache, CacheConfig},
        sources::{MockAudioFetcher, SourceType, Song},
        ui::LogTextChannel,
        voice::{ChannelId, PacedVoice},
    };
    use bytes::Bytes;
    use parking_lot::Mutex;

    fn dca_payload(frames: usize) -> Bytes {
        let mut encoder = DcaEncoder::new(Vec::new(), &EncodeOptions::default().metadata()).unwrap();
        for _ in 0..frames {
            encoder.write_frame(&[0xF8, 0xFF, 0xFE]).unwrap();
        }
        Bytes::from(encoder.finish().unwrap())
    }

    fn manager(fetcher: MockAudioFetcher, voices: Arc<Mutex<Vec<Arc<PacedVoice>>>>) -> PlayerManager {
        let source = Arc::new(AudioSource::new(
            Arc::new(AudioCache::new(CacheConfig::default())),
            Arc::new(fetcher),
        ));

        PlayerManager::new(
            Box::new(move |guild_id: GuildId| {
                let voice = Arc::new(PacedVoice::new(guild_id));
                voices.lock().push(voice.clone());
                voice as Arc<dyn VoiceConnection>
            }),
            Arc::new(LogTextChannel::new()),
            source,
            StorageBackend::Memory,
            100,
            PlayerSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_one_player_per_guild() {
        let voices = Arc::new(Mutex::new(Vec::new()));
        let manager = manager(MockAudioFetcher::new(), voices.clone());

        let a = manager.get_or_create(GuildId(1)).await.unwrap();
        let again = manager.get_or_create(GuildId(1)).await.unwrap();
        let b = manager.get_or_create(GuildId(2)).await.unwrap();

        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(manager.len(), 2);
        assert_eq!(voices.lock().len(), 2);
        assert!(manager.get(GuildId(3)).is_none());

        manager.shutdown().await;
        assert!(manager.is_empty());
        assert!(manager.get_or_create(GuildId(1)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_plays_through_paced_voice() {
        let mut fetcher = MockAudioFetcher::new();
        fetcher.expect_fetch().times(1).returning(|_, _| Ok(dca_payload(50)));

        let voices = Arc::new(Mutex::new(Vec::new()));
        let manager = manager(fetcher, voices.clone());
        let player = manager.get_or_create(GuildId(7)).await.unwrap();

        player
            .add_songs(
                ChannelId(2),
                ChannelId(1),
                vec![Song::new("Intro", "https://example.com/intro.mp3", SourceType::DirectUrl)],
            )
            .await
            .unwrap();
        player.wait_idle().await;

        let voice = voices.lock()[0].clone();
        assert_eq!(voice.frames_sent(), 50);
        assert_eq!(voice.current_channel(), None);

        manager.shutdown().await;
        assert!(voice.join(ChannelId(1)).await.is_err());
    }
}
