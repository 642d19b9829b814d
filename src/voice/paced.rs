use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ChannelId, FrameReceiver, GuildId, VoiceConnection};
use crate::error::VoiceError;

/// Local voice sink that consumes opus frames at real-time pace, one frame
/// per `frame_duration` of the stream being sent.
///
/// Frames are counted and dropped. Useful for running the relay without a
/// chat transport and for measuring throughput of the decode path.
pub struct PacedVoice {
    guild_id: GuildId,
    connection: Mutex<Option<Connection>>,
    closed: AtomicBool,
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

struct Connection {
    channel: ChannelId,
    token: CancellationToken,
}

impl PacedVoice {
    pub fn new(guild_id: GuildId) -> Self {
        Self {
            guild_id,
            connection: Mutex::new(None),
            closed: AtomicBool::new(false),
            frames_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        }
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl VoiceConnection for PacedVoice {
    async fn join(&self, channel: ChannelId) -> Result<(), VoiceError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(VoiceError::Closed);
        }

        let mut connection = self.connection.lock();
        if let Some(current) = connection.as_ref() {
            if current.channel == channel {
                return Ok(());
            }
            current.token.cancel();
        }

        *connection = Some(Connection {
            channel,
            token: CancellationToken::new(),
        });
        info!("🔊 Guild {} conectada al canal de voz {}", self.guild_id, channel);
        Ok(())
    }

    async fn leave(&self) -> Result<(), VoiceError> {
        if let Some(connection) = self.connection.lock().take() {
            connection.token.cancel();
            info!("👋 Guild {} salió del canal de voz {}", self.guild_id, connection.channel);
        }
        Ok(())
    }

    async fn send_audio(
        &self,
        cancel: CancellationToken,
        frame_duration: Duration,
        mut frames: FrameReceiver,
    ) -> Result<(), VoiceError> {
        let connection = self
            .connection
            .lock()
            .as_ref()
            .map(|c| c.token.clone())
            .ok_or(VoiceError::NotConnected)?;

        let mut pacer = interval(frame_duration);
        pacer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = connection.cancelled() => return Err(VoiceError::Closed),
                frame = frames.recv() => frame,
            };

            let Some(frame) = frame else {
                debug!("Fin de frames para guild {}", self.guild_id);
                return Ok(());
            };

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = connection.cancelled() => return Err(VoiceError::Closed),
                _ = pacer.tick() => {}
            }

            self.frames_sent.fetch_add(1, Ordering::Relaxed);
            self.bytes_sent.fetch_add(frame.len() as u64, Ordering::Relaxed);
        }
    }

    async fn close(&self) -> Result<(), VoiceError> {
        self.closed.store(true, Ordering::Release);
        self.leave().await
    }

    fn current_channel(&self) -> Option<ChannelId> {
        self.connection.lock().as_ref().map(|c| c.channel)
    }
}
