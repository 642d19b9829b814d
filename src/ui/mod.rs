//! Text rendering for the messages the player posts to a text channel.

pub mod messages;

pub use messages::LogTextChannel;
