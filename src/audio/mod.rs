//! # Audio Module
//!
//! Audio pipeline of the relay, from a queued song to opus frames on a voice
//! connection.
//!
//! ## Architecture
//!
//! ### [`dca`] - Frame Codec
//! - Reads and writes the DCA container: magic, JSON metadata, then
//!   length-prefixed opus frames
//! - Encodes 48kHz stereo PCM into DCA with opus
//!
//! ### [`streamer`] - Frame Streaming
//! - Pushes decoded frames into a bounded channel (backpressure)
//! - Reports playback position every N frames
//!
//! ### [`source`] - Audio Source
//! - Resolves songs to DCA bytes through the byte cache
//! - At most one fetch in flight per song
//!
//! ### [`queue`] - Playlist and Playback State
//! - Storage traits plus in-memory backends
//!
//! ### [`player`] / [`manager`] - Orchestration
//! - One trigger-driven loop per guild; songs play serially
//! - Failing songs are reported and skipped
//!
//! ## Audio Quality
//!
//! - **Sample Rate**: 48kHz
//! - **Channels**: Stereo
//! - **Frames**: 20ms by default (40/60ms supported by the encoder)
//! - **Encoding**: Opus at 96kbps (configurable)
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use music_relay::audio::dca::DcaDecoder;
//!
//! # async fn example(file: tokio::fs::File) -> anyhow::Result<()> {
//! let mut decoder = DcaDecoder::new(tokio::io::BufReader::new(file));
//! while let Some(frame) = decoder.next_frame().await? {
//!     println!("{} bytes", frame.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod dca;
pub mod manager;
pub mod player;
pub mod queue;
pub mod source;
pub mod streamer;

pub use manager::PlayerManager;
pub use player::{GuildPlayer, PlayerSettings, PlayerState};
pub use source::AudioSource;
