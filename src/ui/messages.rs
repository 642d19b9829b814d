use async_trait::async_trait;
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tracing::info;

use crate::{
    sources::{PlayedSong, Song},
    voice::{ChannelId, MessageId, TextChannel},
};

const PROGRESS_BAR_WIDTH: usize = 20;

/// Mensaje de "reproduciendo ahora" con la posición actual
pub fn now_playing(played: &PlayedSong) -> String {
    let song = &played.song;
    let mut text = format!("🎵 Reproduciendo Ahora: **{}**", song.title());

    if song.duration().is_zero() {
        text.push_str(&format!("\n⏱️ {} / 🔴 En vivo", format_duration(played.position)));
    } else {
        text.push_str(&format!(
            "\n{} {} / {}",
            progress_bar(played.position, song.duration(), PROGRESS_BAR_WIDTH),
            format_duration(played.position),
            format_duration(song.duration())
        ));
    }

    if let Some(user) = song.requested_by() {
        text.push_str(&format!("\n👤 Solicitado por <@{user}>"));
    }
    text
}

/// Mensaje final cuando la canción terminó
pub fn finished(song: &Song, played_for: Duration) -> String {
    let total = if song.duration().is_zero() {
        played_for
    } else {
        song.duration()
    };

    format!(
        "✅ Reproducido: **{}**\n{} {}",
        song.title(),
        progress_bar(total, total, PROGRESS_BAR_WIDTH),
        format_duration(total)
    )
}

pub fn play_failed(song: &Song, error: &anyhow::Error) -> String {
    format!("❌ No se pudo reproducir **{}**: {}", song.title(), error)
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}

fn progress_bar(position: Duration, total: Duration, width: usize) -> String {
    let ratio = if total.is_zero() {
        0.0
    } else {
        (position.as_secs_f64() / total.as_secs_f64()).clamp(0.0, 1.0)
    };
    let filled = (ratio * width as f64).round() as usize;
    "█".repeat(filled) + &"▒".repeat(width - filled)
}

/// Canal de texto que solo escribe en el log.
///
/// Used by the binary when no chat transport is attached.
#[derive(Default)]
pub struct LogTextChannel {
    next_id: AtomicU64,
}

impl LogTextChannel {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TextChannel for LogTextChannel {
    async fn send_message(&self, channel: ChannelId, content: &str) -> anyhow::Result<MessageId> {
        let id = MessageId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        info!("💬 [#{} msg {}] {}", channel, id, content.replace('\n', " | "));
        Ok(id)
    }

    async fn edit_message(&self, channel: ChannelId, message: MessageId, content: &str) -> anyhow::Result<()> {
        info!("✏️ [#{} msg {}] {}", channel, message, content.replace('\n', " | "));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sources::SourceType, voice::UserId};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(0)), "0:00");
        assert_eq!(format_duration(Duration::from_secs(65)), "1:05");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1:02:05");
    }

    #[test]
    fn test_progress_bar() {
        assert_eq!(progress_bar(Duration::ZERO, Duration::from_secs(10), 4), "▒▒▒▒");
        assert_eq!(progress_bar(Duration::from_secs(5), Duration::from_secs(10), 4), "██▒▒");
        assert_eq!(progress_bar(Duration::from_secs(99), Duration::from_secs(10), 4), "████");
        assert_eq!(progress_bar(Duration::from_secs(1), Duration::ZERO, 4), "▒▒▒▒");
    }

    #[test]
    fn test_now_playing_message() {
        let song = Song::new("Bohemian Rhapsody", "https://youtu.be/x", SourceType::YouTube)
            .with_duration(Duration::from_secs(354))
            .with_requested_by(UserId(7));
        let text = now_playing(&PlayedSong::new(song).with_position(Duration::from_secs(60)));

        assert!(text.contains("**Bohemian Rhapsody**"));
        assert!(text.contains("1:00 / 5:54"));
        assert!(text.contains("<@7>"));
    }

    #[test]
    fn test_finished_uses_played_time_for_streams() {
        let song = Song::new("Radio", "https://example.com/live", SourceType::DirectUrl);
        assert!(finished(&song, Duration::from_secs(90)).contains("1:30"));

        let song = song.with_duration(Duration::from_secs(200));
        assert!(finished(&song, Duration::from_secs(90)).contains("3:20"));
    }

    #[tokio::test]
    async fn test_log_channel_assigns_ids() {
        let channel = LogTextChannel::new();
        let first = channel.send_message(ChannelId(1), "a").await.unwrap();
        let second = channel.send_message(ChannelId(1), "b").await.unwrap();
        assert_ne!(first, second);
        channel.edit_message(ChannelId(1), first, "c").await.unwrap();
    }
}
