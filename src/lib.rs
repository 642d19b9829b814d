//! Per-guild opus relay: DCA framing, a TTL/LRU byte cache for fetched
//! audio, and a trigger-driven player loop per guild.

pub mod audio;
pub mod cache;
pub mod config;
pub mod error;
pub mod sources;
pub mod storage;
pub mod ui;
pub mod voice;
