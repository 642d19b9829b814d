use std::io;

use thiserror::Error;

/// Errores del contenedor DCA.
#[derive(Debug, Error)]
pub enum DcaError {
    #[error("metadata already read")]
    AlreadyRead,

    #[error("negative metadata length: {0}")]
    NegativeMetadataLength(i32),

    #[error("metadata of {0} bytes exceeds the container limit")]
    MetadataTooLarge(usize),

    #[error("stream has no metadata header")]
    NoMetadataHeader,

    #[error("negative frame length: {0}")]
    NegativeFrameLength(i16),

    #[error("invalid metadata: {0}")]
    InvalidMetadata(#[from] serde_json::Error),

    #[error("unexpected end of stream inside a frame")]
    UnexpectedEof,

    #[error("frame of {0} bytes does not fit a 16-bit length")]
    FrameTooLarge(usize),

    #[error("unsupported frame duration: {0}ms")]
    UnsupportedFrameDuration(u32),

    #[error("opus encoder: {0}")]
    Opus(#[from] audiopus::Error),

    #[error(transparent)]
    Io(io::Error),
}

impl DcaError {
    /// Corrupt container data, as opposed to I/O or encoder failures.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::NegativeMetadataLength(_)
                | Self::MetadataTooLarge(_)
                | Self::NegativeFrameLength(_)
                | Self::InvalidMetadata(_)
        )
    }
}

impl From<io::Error> for DcaError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Self::UnexpectedEof
        } else {
            Self::Io(err)
        }
    }
}

/// Errores de los backends de playlist y estado.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no songs in playlist")]
    NoSongs,

    #[error("position {position} out of range (playlist has {len} songs)")]
    PositionOutOfRange { position: usize, len: usize },

    #[error("playlist is full (max {0} songs)")]
    PlaylistFull(usize),

    #[error("storage io: {0}")]
    Io(#[from] io::Error),

    #[error("storage json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errores del transporte de voz.
#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("not connected to a voice channel")]
    NotConnected,

    #[error("voice connection closed")]
    Closed,

    #[error("voice transport: {0}")]
    Transport(String),
}
