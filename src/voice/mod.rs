//! # Voice Module
//!
//! Transport-facing seams of the relay: identifiers shared by every guild
//! component plus the [`VoiceConnection`] and [`TextChannel`] capabilities
//! the player drives.
//!
//! The real chat/voice transport lives outside this crate. Anything that can
//! join a channel and accept a stream of opus frames can back a
//! [`VoiceConnection`]; [`paced::PacedVoice`] is the local implementation used
//! by the binary, which consumes frames at real-time pace without a network.

pub mod paced;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::VoiceError;

pub use paced::PacedVoice;

/// Receiving half of a song's frame channel.
pub type FrameReceiver = mpsc::Receiver<Bytes>;

macro_rules! snowflake {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(pub u64);

            impl $name {
                pub fn get(self) -> u64 {
                    self.0
                }
            }

            impl From<u64> for $name {
                fn from(id: u64) -> Self {
                    Self(id)
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )*
    };
}

snowflake! {
    /// Server/tenant scope; each guild owns one player loop and one playlist.
    GuildId,
    /// Voice or text channel.
    ChannelId,
    /// A message posted to a text channel.
    MessageId,
    /// The user that requested a song.
    UserId,
}

/// Voice transport for one guild.
///
/// `close` and `leave` may be called while `send_audio` is running on another
/// task; implementations end the send as soon as they notice.
#[async_trait]
pub trait VoiceConnection: Send + Sync {
    /// Joins `channel`. Joining the channel already joined is a no-op.
    async fn join(&self, channel: ChannelId) -> Result<(), VoiceError>;

    async fn leave(&self) -> Result<(), VoiceError>;

    /// Sends every frame from `frames` until the channel closes or `cancel`
    /// fires. Each frame carries `frame_duration` of audio. Losing the
    /// connection mid-stream is an error.
    async fn send_audio(
        &self,
        cancel: CancellationToken,
        frame_duration: Duration,
        frames: FrameReceiver,
    ) -> Result<(), VoiceError>;

    async fn close(&self) -> Result<(), VoiceError>;

    fn current_channel(&self) -> Option<ChannelId>;
}

/// Text channel used for "now playing" and failure notices.
#[async_trait]
pub trait TextChannel: Send + Sync {
    async fn send_message(&self, channel: ChannelId, content: &str) -> anyhow::Result<MessageId>;

    async fn edit_message(
        &self,
        channel: ChannelId,
        message: MessageId,
        content: &str,
    ) -> anyhow::Result<()>;
}
