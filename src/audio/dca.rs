//! DCA container: a 4-byte magic, a little-endian `i32` metadata length, a
//! JSON metadata blob, then opus frames each prefixed by a little-endian
//! `i16` length.
//!
//! The decoder is incremental over any [`AsyncRead`]; the encoder writes to a
//! blocking [`Write`] since it runs next to the (CPU bound) opus encoder.

use audiopus::{coder::Encoder as OpusEncoder, Application, Bitrate, Channels, SampleRate};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{io::Write, time::Duration};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::error::DcaError;

pub const DCA_MAGIC: &[u8; 4] = b"DCA1";

/// Duración por defecto de un frame cuando no hay metadata
pub const DEFAULT_FRAME_DURATION: Duration = Duration::from_millis(20);

pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: u16 = 2;

/// Upper bound on the metadata blob; anything larger is treated as corruption.
pub const MAX_METADATA_LEN: usize = 1 << 20;

/// Recommended maximum opus packet size.
const MAX_OPUS_PACKET: usize = 4_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DcaMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dca: Option<DcaInfo>,
    #[serde(default)]
    pub opus: OpusInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<OriginInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DcaInfo {
    pub version: i64,
    pub tool: Option<ToolInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolInfo {
    pub name: String,
    pub version: String,
    pub url: Option<String>,
}

/// Parámetros del stream opus
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpusInfo {
    #[serde(rename = "abr")]
    pub bitrate: u32,
    pub sample_rate: u32,
    pub mode: String,
    /// Samples per frame across all channels (960 * channels for 20 ms).
    pub frame_size: u32,
    pub channels: u16,
    pub vbr: bool,
}

impl OpusInfo {
    /// `frame_size / channels / 960 * 20ms`, or `None` for degenerate values.
    pub fn frame_duration(&self) -> Option<Duration> {
        if self.frame_size == 0 || self.channels == 0 {
            return None;
        }

        let per_channel = f64::from(self.frame_size) / f64::from(self.channels);
        Some(Duration::from_nanos((per_channel / 960.0 * 20_000_000.0).round() as u64))
    }
}

/// Origen del audio antes de codificar
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OriginInfo {
    pub source: Option<String>,
    #[serde(rename = "abr")]
    pub bitrate: Option<u32>,
    pub channels: Option<u16>,
    pub encoding: Option<String>,
    pub url: Option<String>,
}

/// Incremental DCA decoder.
///
/// Metadata is read at most once, and always before the first frame: either
/// explicitly through [`read_metadata`](Self::read_metadata) or transparently
/// by the first [`next_frame`](Self::next_frame) call.
pub struct DcaDecoder<R> {
    reader: R,
    metadata: Option<DcaMetadata>,
    has_header: bool,
    metadata_read: bool,
    first_frame_read: bool,
    frames_read: u64,
}

impl<R: AsyncRead + Unpin> DcaDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            metadata: None,
            has_header: true,
            metadata_read: false,
            first_frame_read: false,
            frames_read: 0,
        }
    }

    /// Legacy header-less stream: frames start at byte 0 and are 20 ms each.
    pub fn without_metadata(reader: R) -> Self {
        Self {
            has_header: false,
            ..Self::new(reader)
        }
    }

    pub async fn read_metadata(&mut self) -> Result<&DcaMetadata, DcaError> {
        if !self.has_header {
            return Err(DcaError::NoMetadataHeader);
        }
        if self.metadata_read {
            return Err(DcaError::AlreadyRead);
        }
        self.metadata_read = true;

        let mut magic = [0u8; 4];
        self.reader.read_exact(&mut magic).await?;
        if &magic != DCA_MAGIC {
            debug!("Cabecera DCA desconocida: {:?}", magic);
        }

        let len = self.reader.read_i32_le().await?;
        if len < 0 {
            return Err(DcaError::NegativeMetadataLength(len));
        }
        let len = len as usize;
        if len > MAX_METADATA_LEN {
            return Err(DcaError::MetadataTooLarge(len));
        }

        let mut raw = vec![0u8; len];
        self.reader.read_exact(&mut raw).await?;
        let metadata: DcaMetadata = serde_json::from_slice(&raw)?;

        debug!(
            "Metadata DCA: {}Hz, {} canales, frame_size {}",
            metadata.opus.sample_rate, metadata.opus.channels, metadata.opus.frame_size
        );
        Ok(self.metadata.insert(metadata))
    }

    /// Next opus frame, or `Ok(None)` on EOF at a frame boundary.
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>, DcaError> {
        if !self.first_frame_read {
            if self.has_header && !self.metadata_read {
                self.read_metadata().await?;
            }
            self.first_frame_read = true;
        }

        let mut len_buf = [0u8; 2];
        match read_to_fill(&mut self.reader, &mut len_buf).await? {
            0 => return Ok(None),
            2 => {}
            _ => return Err(DcaError::UnexpectedEof),
        }

        let len = i16::from_le_bytes(len_buf);
        if len < 0 {
            return Err(DcaError::NegativeFrameLength(len));
        }

        let mut frame = vec![0u8; len as usize];
        self.reader.read_exact(&mut frame).await?;
        self.frames_read += 1;

        Ok(Some(Bytes::from(frame)))
    }

    pub fn metadata(&self) -> Option<&DcaMetadata> {
        self.metadata.as_ref()
    }

    pub fn frame_duration(&self) -> Duration {
        self.metadata
            .as_ref()
            .and_then(|m| m.opus.frame_duration())
            .unwrap_or(DEFAULT_FRAME_DURATION)
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }
}

/// Reads until `buf` is full or the stream ends; returns the bytes read.
async fn read_to_fill<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<usize, DcaError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Writes a DCA stream frame by frame.
pub struct DcaEncoder<W: Write> {
    writer: W,
    frames_written: u64,
}

impl<W: Write> DcaEncoder<W> {
    /// Writes the magic and metadata header immediately.
    pub fn new(mut writer: W, metadata: &DcaMetadata) -> Result<Self, DcaError> {
        let json = serde_json::to_vec(metadata)?;
        if json.len() > MAX_METADATA_LEN {
            return Err(DcaError::MetadataTooLarge(json.len()));
        }

        writer.write_all(DCA_MAGIC)?;
        writer.write_all(&(json.len() as i32).to_le_bytes())?;
        writer.write_all(&json)?;

        Ok(Self {
            writer,
            frames_written: 0,
        })
    }

    /// Header-less output for legacy consumers.
    pub fn without_metadata(writer: W) -> Self {
        Self {
            writer,
            frames_written: 0,
        }
    }

    pub fn write_frame(&mut self, frame: &[u8]) -> Result<(), DcaError> {
        let len = i16::try_from(frame.len()).map_err(|_| DcaError::FrameTooLarge(frame.len()))?;
        self.writer.write_all(&len.to_le_bytes())?;
        self.writer.write_all(frame)?;
        self.frames_written += 1;
        Ok(())
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn finish(mut self) -> Result<W, DcaError> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

/// Opciones de codificación opus
#[derive(Debug, Clone)]
pub struct EncodeOptions {
    pub bitrate: u32,
    /// 20, 40 or 60.
    pub frame_duration_ms: u32,
    pub source_url: Option<String>,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            bitrate: 96_000,
            frame_duration_ms: 20,
            source_url: None,
        }
    }
}

impl EncodeOptions {
    /// Interleaved samples in one frame.
    pub fn samples_per_frame(&self) -> usize {
        (SAMPLE_RATE / 1000 * self.frame_duration_ms) as usize * CHANNELS as usize
    }

    pub fn metadata(&self) -> DcaMetadata {
        DcaMetadata {
            dca: Some(DcaInfo {
                version: 1,
                tool: Some(ToolInfo {
                    name: env!("CARGO_PKG_NAME").to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    url: None,
                }),
            }),
            opus: OpusInfo {
                bitrate: self.bitrate,
                sample_rate: SAMPLE_RATE,
                mode: "audio".to_string(),
                frame_size: self.samples_per_frame() as u32,
                channels: CHANNELS,
                vbr: true,
            },
            origin: Some(OriginInfo {
                source: Some("pcm".to_string()),
                bitrate: None,
                channels: Some(CHANNELS),
                encoding: Some("s16le".to_string()),
                url: self.source_url.clone(),
            }),
        }
    }

    fn validate(&self) -> Result<(), DcaError> {
        match self.frame_duration_ms {
            20 | 40 | 60 => Ok(()),
            other => Err(DcaError::UnsupportedFrameDuration(other)),
        }
    }
}

/// PCM i16 estéreo 48kHz → paquetes opus.
pub struct OpusPcmEncoder {
    encoder: OpusEncoder,
    packet: Vec<u8>,
}

impl OpusPcmEncoder {
    pub fn new(options: &EncodeOptions) -> Result<Self, DcaError> {
        let mut encoder = OpusEncoder::new(SampleRate::Hz48000, Channels::Stereo, Application::Audio)?;
        encoder.set_bitrate(Bitrate::BitsPerSecond(options.bitrate as i32))?;

        Ok(Self {
            encoder,
            packet: vec![0u8; MAX_OPUS_PACKET],
        })
    }

    /// Encodes one full interleaved frame.
    pub fn encode(&mut self, pcm: &[i16]) -> Result<&[u8], DcaError> {
        let len = self.encoder.encode(pcm, &mut self.packet)?;
        Ok(&self.packet[..len])
    }
}

/// Encodes interleaved 48 kHz stereo PCM into a complete DCA stream.
///
/// The final partial frame is zero padded. Returns the writer and the number
/// of frames written.
pub fn encode_pcm<W: Write>(
    pcm: &[i16],
    options: &EncodeOptions,
    writer: W,
) -> Result<(W, u64), DcaError> {
    options.validate()?;

    let samples_per_frame = options.samples_per_frame();
    let mut opus = OpusPcmEncoder::new(options)?;
    let mut dca = DcaEncoder::new(writer, &options.metadata())?;
    let mut padded = vec![0i16; samples_per_frame];

    for chunk in pcm.chunks(samples_per_frame) {
        let frame = if chunk.len() == samples_per_frame {
            chunk
        } else {
            padded[..chunk.len()].copy_from_slice(chunk);
            padded[chunk.len()..].fill(0);
            &padded[..]
        };

        let packet = opus.encode(frame)?;
        dca.write_frame(packet)?;
    }

    let frames = dca.frames_written();
    Ok((dca.finish()?, frames))
}

/// Rewrites a DCA stream so playback starts at `offset`. Whole frames that
/// end before `offset` are dropped; the metadata header is kept.
pub async fn seek(data: &[u8], offset: Duration) -> Result<Vec<u8>, DcaError> {
    let mut decoder = DcaDecoder::new(data);
    let metadata = decoder.read_metadata().await?.clone();
    let skip = (offset.as_nanos() / decoder.frame_duration().as_nanos().max(1)) as u64;

    let mut encoder = DcaEncoder::new(Vec::with_capacity(data.len()), &metadata)?;
    while let Some(frame) = decoder.next_frame().await? {
        if decoder.frames_read() > skip {
            encoder.write_frame(&frame)?;
        }
    }
    encoder.finish()
}

/// Converts little-endian s16 bytes (ffmpeg `-f s16le`) into samples.
pub fn pcm_from_le_bytes(raw: &[u8]) -> Vec<i16> {
    raw.chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn metadata_20ms() -> DcaMetadata {
        EncodeOptions::default().metadata()
    }

    fn container(frames: &[&[u8]]) -> Vec<u8> {
        let mut encoder = DcaEncoder::new(Vec::new(), &metadata_20ms()).unwrap();
        for frame in frames {
            encoder.write_frame(frame).unwrap();
        }
        encoder.finish().unwrap()
    }

    async fn count_frames<R: AsyncRead + Unpin>(decoder: &mut DcaDecoder<R>) -> Result<u64, DcaError> {
        let mut count = 0;
        while decoder.next_frame().await?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    #[tokio::test]
    async fn test_decodes_frames_until_clean_eof() {
        let data = container(&[b"one", b"", b"three"]);
        let mut decoder = DcaDecoder::new(&data[..]);

        let metadata = decoder.read_metadata().await.unwrap().clone();
        assert_eq!(metadata, metadata_20ms());

        assert_eq!(decoder.next_frame().await.unwrap(), Some(Bytes::from_static(b"one")));
        assert_eq!(decoder.next_frame().await.unwrap(), Some(Bytes::new()));
        assert_eq!(decoder.next_frame().await.unwrap(), Some(Bytes::from_static(b"three")));
        assert_eq!(decoder.next_frame().await.unwrap(), None);
        assert_eq!(decoder.frames_read(), 3);
        assert_eq!(decoder.frame_duration(), Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_seek_drops_leading_frames() {
        let frames: Vec<Vec<u8>> = (0..100u8).map(|i| vec![i; 3]).collect();
        let refs: Vec<&[u8]> = frames.iter().map(Vec::as_slice).collect();
        let data = container(&refs);

        let seeked = seek(&data, Duration::from_millis(1_010)).await.unwrap();
        let mut decoder = DcaDecoder::new(&seeked[..]);

        assert_eq!(decoder.read_metadata().await.unwrap(), &metadata_20ms());
        assert_eq!(decoder.next_frame().await.unwrap(), Some(Bytes::from(vec![50u8; 3])));
        assert_eq!(count_frames(&mut decoder).await.unwrap(), 49);

        let past_end = seek(&data, Duration::from_secs(10)).await.unwrap();
        assert_eq!(count_frames(&mut DcaDecoder::new(&past_end[..])).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_metadata_is_read_once() {
        let data = container(&[b"x"]);
        let mut decoder = DcaDecoder::new(&data[..]);

        decoder.read_metadata().await.unwrap();
        assert!(matches!(decoder.read_metadata().await, Err(DcaError::AlreadyRead)));
    }

    #[tokio::test]
    async fn test_first_frame_reads_metadata_transparently() {
        let data = container(&[b"x", b"y"]);
        let mut decoder = DcaDecoder::new(&data[..]);

        assert_eq!(decoder.next_frame().await.unwrap(), Some(Bytes::from_static(b"x")));
        assert!(decoder.metadata().is_some());
        assert!(matches!(decoder.read_metadata().await, Err(DcaError::AlreadyRead)));
    }

    #[tokio::test]
    async fn test_negative_frame_length_is_corruption() {
        let mut data = container(&[]);
        data.extend_from_slice(&(-5i16).to_le_bytes());
        data.extend_from_slice(&[0u8; 8]);
        let mut decoder = DcaDecoder::new(&data[..]);

        let err = decoder.next_frame().await.unwrap_err();
        assert!(matches!(err, DcaError::NegativeFrameLength(-5)));
        assert!(err.is_corruption());
    }

    #[tokio::test]
    async fn test_negative_metadata_length_is_corruption() {
        let mut data = DCA_MAGIC.to_vec();
        data.extend_from_slice(&(-1i32).to_le_bytes());
        let mut decoder = DcaDecoder::new(&data[..]);

        let err = decoder.read_metadata().await.unwrap_err();
        assert!(matches!(err, DcaError::NegativeMetadataLength(-1)));
    }

    #[tokio::test]
    async fn test_malformed_metadata_json() {
        let mut data = DCA_MAGIC.to_vec();
        data.extend_from_slice(&5i32.to_le_bytes());
        data.extend_from_slice(b"{oops");
        let mut decoder = DcaDecoder::new(&data[..]);

        let err = decoder.next_frame().await.unwrap_err();
        assert!(matches!(err, DcaError::InvalidMetadata(_)));
    }

    #[tokio::test]
    async fn test_truncated_length_is_unexpected_eof() {
        let mut data = container(&[b"ok"]);
        data.push(0x04);
        let mut decoder = DcaDecoder::new(&data[..]);

        assert!(decoder.next_frame().await.unwrap().is_some());
        assert!(matches!(decoder.next_frame().await, Err(DcaError::UnexpectedEof)));
    }

    #[tokio::test]
    async fn test_truncated_payload_is_unexpected_eof() {
        let mut data = container(&[]);
        data.extend_from_slice(&10i16.to_le_bytes());
        data.extend_from_slice(b"short");
        let mut decoder = DcaDecoder::new(&data[..]);

        assert!(matches!(decoder.next_frame().await, Err(DcaError::UnexpectedEof)));
    }

    #[tokio::test]
    async fn test_legacy_stream_without_header() {
        let mut encoder = DcaEncoder::without_metadata(Vec::new());
        encoder.write_frame(b"a").unwrap();
        encoder.write_frame(b"b").unwrap();
        let data = encoder.finish().unwrap();

        let mut decoder = DcaDecoder::without_metadata(&data[..]);
        assert_eq!(count_frames(&mut decoder).await.unwrap(), 2);
        assert_eq!(decoder.frame_duration(), DEFAULT_FRAME_DURATION);
        assert!(matches!(decoder.read_metadata().await, Err(DcaError::NoMetadataHeader)));
    }

    #[test]
    fn test_frame_duration_from_metadata() {
        let opus = |frame_size, channels| OpusInfo {
            frame_size,
            channels,
            ..OpusInfo::default()
        };

        assert_eq!(opus(1920, 2).frame_duration(), Some(Duration::from_millis(20)));
        assert_eq!(opus(3840, 2).frame_duration(), Some(Duration::from_millis(40)));
        assert_eq!(opus(960, 1).frame_duration(), Some(Duration::from_millis(20)));
        assert_eq!(opus(0, 2).frame_duration(), None);
        assert_eq!(opus(1920, 0).frame_duration(), None);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut encoder = DcaEncoder::without_metadata(Vec::new());
        let frame = vec![0u8; i16::MAX as usize + 1];

        assert!(matches!(encoder.write_frame(&frame), Err(DcaError::FrameTooLarge(_))));
    }

    #[test]
    fn test_unsupported_frame_duration() {
        let options = EncodeOptions {
            frame_duration_ms: 30,
            ..EncodeOptions::default()
        };

        assert!(matches!(
            encode_pcm(&[], &options, Vec::new()),
            Err(DcaError::UnsupportedFrameDuration(30))
        ));
    }

    #[tokio::test]
    async fn test_encode_then_decode_keeps_frame_count() {
        let options = EncodeOptions::default();
        let samples_per_frame = options.samples_per_frame();

        // 250 frames completos + uno parcial
        let total = samples_per_frame * 250 + 100;
        let pcm: Vec<i16> = (0..total)
            .map(|i| ((i as f32 * 0.05).sin() * 8_000.0) as i16)
            .collect();

        let (data, written) = encode_pcm(&pcm, &options, Vec::new()).unwrap();
        assert_eq!(written, 251);

        let mut decoder = DcaDecoder::new(&data[..]);
        assert_eq!(count_frames(&mut decoder).await.unwrap(), 251);
        assert_eq!(decoder.frame_duration(), Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_encode_40ms_frames() {
        let options = EncodeOptions {
            frame_duration_ms: 40,
            ..EncodeOptions::default()
        };
        let pcm = vec![0i16; options.samples_per_frame() * 10];

        let (data, written) = encode_pcm(&pcm, &options, Vec::new()).unwrap();
        let mut decoder = DcaDecoder::new(&data[..]);

        assert_eq!(count_frames(&mut decoder).await.unwrap(), written);
        assert_eq!(decoder.frame_duration(), Duration::from_millis(40));
    }

    #[test]
    fn test_pcm_from_le_bytes() {
        assert_eq!(pcm_from_le_bytes(&[0x01, 0x00, 0xff, 0xff, 0x07]), vec![1, -1]);
    }
}
