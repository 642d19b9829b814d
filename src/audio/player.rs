use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::{io::Cursor, sync::Arc, time::Duration};
use tokio::{
    io::BufReader,
    sync::{mpsc, watch},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    dca::DcaDecoder,
    source::AudioSource,
    streamer::{self, PositionCallback, POSITION_REPORT_INTERVAL},
};
use crate::{
    error::StorageError,
    sources::{PlayedSong, Song},
    storage::GuildStores,
    ui::messages,
    voice::{ChannelId, GuildId, MessageId, TextChannel, VoiceConnection},
};

/// Read buffer placed between the fetched payload and the frame decoder.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1 << 20;

/// Frames buffered between the decoder and the voice transport.
pub const DEFAULT_FRAME_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayerState {
    /// Waiting for a trigger.
    #[default]
    Idle,
    /// Handling a trigger.
    Dispatching,
    /// Draining the playlist.
    Playing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Play,
    Join,
    Leave,
}

/// Unidad de trabajo de la cola del guild
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trigger {
    pub command: Command,
    pub voice_channel: Option<ChannelId>,
    pub text_channel: Option<ChannelId>,
}

impl Trigger {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            voice_channel: None,
            text_channel: None,
        }
    }

    pub fn with_voice_channel(mut self, channel: ChannelId) -> Self {
        self.voice_channel = Some(channel);
        self
    }

    pub fn with_text_channel(mut self, channel: ChannelId) -> Self {
        self.text_channel = Some(channel);
        self
    }
}

#[derive(Debug, Clone)]
pub struct PlayerSettings {
    pub read_buffer_size: usize,
    pub frame_channel_capacity: usize,
    /// Frames between two position reports.
    pub report_every: u64,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            frame_channel_capacity: DEFAULT_FRAME_CHANNEL_CAPACITY,
            report_every: POSITION_REPORT_INTERVAL,
        }
    }
}

/// Reproductor de un guild.
///
/// Commands are queued as [`Trigger`]s and consumed by a single [`run`]
/// loop, so songs of one guild never overlap. A failing song is logged and
/// reported to the text channel; the loop then moves on to the next one.
///
/// [`run`]: GuildPlayer::run
pub struct GuildPlayer {
    guild_id: GuildId,
    voice: Arc<dyn VoiceConnection>,
    text: Arc<dyn TextChannel>,
    stores: GuildStores,
    source: Arc<AudioSource>,
    settings: PlayerSettings,
    triggers: mpsc::UnboundedSender<Trigger>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Trigger>>>,
    /// Triggers queued but not yet handled.
    pending: watch::Sender<usize>,
    state: Mutex<PlayerState>,
    current_song: Mutex<Option<CancellationToken>>,
    drain: Mutex<Option<CancellationToken>>,
}

impl GuildPlayer {
    pub fn new(
        guild_id: GuildId,
        voice: Arc<dyn VoiceConnection>,
        text: Arc<dyn TextChannel>,
        stores: GuildStores,
        source: Arc<AudioSource>,
        settings: PlayerSettings,
    ) -> Self {
        let (triggers, inbox) = mpsc::unbounded_channel();

        Self {
            guild_id,
            voice,
            text,
            stores,
            source,
            settings,
            triggers,
            inbox: Mutex::new(Some(inbox)),
            pending: watch::Sender::new(0),
            state: Mutex::new(PlayerState::Idle),
            current_song: Mutex::new(None),
            drain: Mutex::new(None),
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn state(&self) -> PlayerState {
        *self.state.lock()
    }

    pub fn voice(&self) -> &Arc<dyn VoiceConnection> {
        &self.voice
    }

    /// Agrega canciones y pide reproducción sin esperar al loop.
    pub async fn add_songs(&self, text_channel: ChannelId, voice_channel: ChannelId, songs: Vec<Song>) -> Result<()> {
        let count = songs.len();
        self.stores.playlist.append_songs(songs).await?;
        info!("➕ {} canciones agregadas en guild {}", count, self.guild_id);

        self.enqueue(
            Trigger::new(Command::Play)
                .with_voice_channel(voice_channel)
                .with_text_channel(text_channel),
        );
        Ok(())
    }

    /// Corta la canción actual; el loop sigue con la siguiente.
    pub fn skip_song(&self) -> bool {
        match self.current_song.lock().as_ref() {
            Some(token) => {
                token.cancel();
                info!("⏭️ Canción saltada en guild {}", self.guild_id);
                true
            }
            None => false,
        }
    }

    pub async fn stop(&self) -> Result<()> {
        self.stores.playlist.clear_playlist().await?;
        self.skip_song();
        info!("⏹️ Reproducción detenida en guild {}", self.guild_id);
        Ok(())
    }

    pub async fn remove_song(&self, position: usize) -> Result<Song> {
        Ok(self.stores.playlist.remove_song(position).await?)
    }

    pub async fn playlist(&self) -> Result<Vec<Song>> {
        Ok(self.stores.playlist.songs().await?)
    }

    pub async fn played_song(&self) -> Result<Option<PlayedSong>> {
        Ok(self.stores.state.current_song().await?)
    }

    /// Vuelve a encolar la canción que quedó a medias al apagar.
    ///
    /// The song is put back at the head of the playlist, starting at its last
    /// persisted position. Returns whether anything was restored.
    pub async fn resume_interrupted(&self) -> Result<bool> {
        let Some(played) = self.stores.state.current_song().await? else {
            return Ok(false);
        };

        info!(
            "🔄 Reanudando {} en {} para guild {}",
            played.song.title(),
            messages::format_duration(played.position),
            self.guild_id
        );
        self.stores
            .playlist
            .prepend_song(played.song.with_start_offset(played.position))
            .await?;
        self.stores.state.set_current_song(None).await?;
        Ok(true)
    }

    pub fn join(&self, voice_channel: ChannelId) {
        self.enqueue(Trigger::new(Command::Join).with_voice_channel(voice_channel));
    }

    /// Sale del canal de voz, interrumpiendo la playlist en curso.
    pub fn leave(&self) {
        if let Some(drain) = self.drain.lock().as_ref() {
            drain.cancel();
        }
        self.enqueue(Trigger::new(Command::Leave));
    }

    /// Resolves once every queued trigger has been handled.
    pub async fn wait_idle(&self) {
        let mut pending = self.pending.subscribe();
        let _ = pending.wait_for(|n| *n == 0).await;
    }

    fn enqueue(&self, trigger: Trigger) {
        self.pending.send_modify(|n| *n += 1);
        if self.triggers.send(trigger).is_err() {
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
            warn!("⚠️ Loop de guild {} detenido, {:?} descartado", self.guild_id, trigger.command);
        }
    }

    fn set_state(&self, state: PlayerState) {
        *self.state.lock() = state;
    }

    /// Loop principal del guild. Returns when `cancel` fires, after leaving
    /// the voice channel.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut inbox = self
            .inbox
            .lock()
            .take()
            .with_context(|| format!("player loop for guild {} already running", self.guild_id))?;

        info!("▶️ Loop de reproducción iniciado para guild {}", self.guild_id);

        loop {
            let trigger = tokio::select! {
                _ = cancel.cancelled() => break,
                trigger = inbox.recv() => match trigger {
                    Some(trigger) => trigger,
                    None => break,
                },
            };

            self.set_state(PlayerState::Dispatching);
            self.dispatch(&cancel, trigger).await;
            self.set_state(PlayerState::Idle);
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
        }

        self.set_state(PlayerState::Idle);
        self.leave_voice().await;
        self.pending.send_replace(0);
        info!("⏹️ Loop de reproducción detenido para guild {}", self.guild_id);
        Ok(())
    }

    async fn dispatch(&self, cancel: &CancellationToken, trigger: Trigger) {
        debug!("📨 {:?} en guild {}", trigger.command, self.guild_id);

        if let Err(e) = self.remember_channels(&trigger).await {
            warn!("⚠️ No se pudieron guardar los canales de guild {}: {}", self.guild_id, e);
        }

        match trigger.command {
            Command::Play => self.drain_playlist(cancel).await,
            Command::Join => {
                if let Err(e) = self.join_voice().await {
                    error!("❌ Error uniéndose al canal de voz en guild {}: {:#}", self.guild_id, e);
                }
            }
            Command::Leave => self.leave_voice().await,
        }
    }

    async fn remember_channels(&self, trigger: &Trigger) -> Result<(), StorageError> {
        if let Some(channel) = trigger.voice_channel {
            self.stores.state.set_voice_channel(channel).await?;
        }
        if let Some(channel) = trigger.text_channel {
            self.stores.state.set_text_channel(channel).await?;
        }
        Ok(())
    }

    async fn join_voice(&self) -> Result<()> {
        let channel = self
            .stores
            .state
            .voice_channel()
            .await?
            .context("no voice channel configured")?;

        if self.voice.current_channel() != Some(channel) {
            self.voice.join(channel).await?;
        }
        Ok(())
    }

    async fn leave_voice(&self) {
        if self.voice.current_channel().is_none() {
            return;
        }
        if let Err(e) = self.voice.leave().await {
            warn!("⚠️ Error saliendo del canal de voz en guild {}: {}", self.guild_id, e);
        }
    }

    async fn drain_playlist(&self, cancel: &CancellationToken) {
        match self.stores.playlist.songs().await {
            Ok(songs) if songs.is_empty() => {
                debug!("Playlist vacía en guild {}", self.guild_id);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                error!("❌ Error leyendo playlist de guild {}: {}", self.guild_id, e);
                return;
            }
        }

        if let Err(e) = self.join_voice().await {
            error!("❌ Error uniéndose al canal de voz en guild {}: {:#}", self.guild_id, e);
            return;
        }

        let drain = cancel.child_token();
        *self.drain.lock() = Some(drain.clone());
        self.set_state(PlayerState::Playing);

        while !drain.is_cancelled() {
            let song = match self.stores.playlist.pop_first_song().await {
                Ok(song) => song,
                Err(StorageError::NoSongs) => {
                    info!("📭 Playlist terminada en guild {}", self.guild_id);
                    break;
                }
                Err(e) => {
                    error!("❌ Error leyendo playlist de guild {}: {}", self.guild_id, e);
                    break;
                }
            };

            let song_cancel = drain.child_token();
            *self.current_song.lock() = Some(song_cancel.clone());

            let text_channel = self.stores.state.text_channel().await.unwrap_or_else(|e| {
                warn!("⚠️ Canal de texto no disponible en guild {}: {}", self.guild_id, e);
                None
            });

            let result = self.play_song(&song_cancel, &song, text_channel).await;
            self.current_song.lock().take();

            if let Err(e) = result {
                error!("❌ Error reproduciendo {} en guild {}: {:#}", song.title(), self.guild_id, e);
                self.notify_failure(text_channel, &song, &e).await;
            }
        }

        self.current_song.lock().take();
        self.drain.lock().take();
        self.leave_voice().await;
    }

    async fn play_song(&self, cancel: &CancellationToken, song: &Song, text_channel: Option<ChannelId>) -> Result<()> {
        let played = PlayedSong::new(song.clone());
        info!("🎵 Reproduciendo en guild {}: {}", self.guild_id, song.title());

        let message = match text_channel {
            Some(channel) => match self.text.send_message(channel, &messages::now_playing(&played)).await {
                Ok(id) => Some((channel, id)),
                Err(e) => {
                    warn!("⚠️ No se pudo enviar mensaje en guild {}: {}", self.guild_id, e);
                    None
                }
            },
            None => None,
        };

        self.stores.state.set_current_song(Some(played.clone())).await?;
        let result = self.stream_song(cancel, &played, message).await;

        if let Err(e) = self.stores.state.set_current_song(None).await {
            warn!("⚠️ No se pudo limpiar la canción actual de guild {}: {}", self.guild_id, e);
        }
        result
    }

    async fn stream_song(
        &self,
        cancel: &CancellationToken,
        played: &PlayedSong,
        message: Option<(ChannelId, MessageId)>,
    ) -> Result<()> {
        let song = &played.song;
        let data = match self.source.get(cancel, song).await {
            Ok(data) => data,
            Err(_) if cancel.is_cancelled() => {
                info!("⏭️ Descarga cancelada: {}", song.title());
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.join_voice().await?;

        let reader = BufReader::with_capacity(self.settings.read_buffer_size, Cursor::new(data));
        let mut decoder = DcaDecoder::new(reader);
        decoder.read_metadata().await.context("invalid DCA header")?;
        let frame_duration = decoder.frame_duration();
        let (frames_tx, frames_rx) = mpsc::channel(self.settings.frame_channel_capacity);
        let (position_tx, position_rx) = watch::channel(played.position);

        let offset = played.position;
        let on_position: PositionCallback = Box::new(move |elapsed| {
            position_tx.send_replace(offset + elapsed);
        });
        let report_every = self.settings.report_every;

        let stream = async move {
            let summary =
                streamer::stream_frames(cancel, &mut decoder, &frames_tx, report_every, Some(on_position)).await;
            drop(frames_tx);
            summary
        };
        let send = self.voice.send_audio(cancel.clone(), frame_duration, frames_rx);
        let report = self.report_positions(played, message, position_rx);

        let (streamed, sent, ()) = tokio::join!(stream, send, report);
        sent.context("voice send failed")?;
        let summary = streamed?;

        if cancel.is_cancelled() {
            info!("⏭️ {} interrumpida tras {} frames", song.title(), summary.frames_sent);
        } else {
            info!("✅ {} terminada ({} frames)", song.title(), summary.frames_sent);
        }

        if let Some((channel, id)) = message {
            let content = messages::finished(song, offset + summary.position);
            if let Err(e) = self.text.edit_message(channel, id, &content).await {
                debug!("No se pudo editar mensaje final: {}", e);
            }
        }
        Ok(())
    }

    /// Persists and displays reported positions. Only the latest report is
    /// applied when several arrive while an update is in flight.
    async fn report_positions(
        &self,
        played: &PlayedSong,
        message: Option<(ChannelId, MessageId)>,
        mut positions: watch::Receiver<Duration>,
    ) {
        while positions.changed().await.is_ok() {
            let position = *positions.borrow_and_update();
            let update = played.clone().with_position(position);

            if let Err(e) = self.stores.state.set_current_song(Some(update.clone())).await {
                warn!("⚠️ No se pudo guardar la posición en guild {}: {}", self.guild_id, e);
            }

            if let Some((channel, id)) = message {
                if let Err(e) = self.text.edit_message(channel, id, &messages::now_playing(&update)).await {
                    debug!("No se pudo actualizar mensaje: {}", e);
                }
            }
        }
    }

    async fn notify_failure(&self, text_channel: Option<ChannelId>, song: &Song, error: &anyhow::Error) {
        let Some(channel) = text_channel else {
            return;
        };
        if let Err(e) = self.text.send_message(channel, &messages::play_failed(song, error)).await {
            warn!("⚠️ No se pudo notificar el fallo en guild {}: {}", self.guild_id, e);
        }
    }
}
