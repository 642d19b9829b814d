use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{AudioFetcher, SourceType, Song};
use crate::audio::dca::{self, EncodeOptions, CHANNELS, SAMPLE_RATE};

/// Descarga con yt-dlp + FFmpeg y codifica a DCA en proceso.
///
/// YouTube URLs are resolved to a direct media URL with `yt-dlp --get-url`;
/// FFmpeg then decodes any URL to raw s16le PCM, which is opus encoded on
/// the blocking pool. `.dca` sources are local files, read as-is unless the
/// song starts at an offset.
pub struct YtDlpFetcher {
    ytdlp_path: String,
    ffmpeg_path: String,
    options: EncodeOptions,
    cookies: Option<PathBuf>,
}

impl YtDlpFetcher {
    pub fn new(ytdlp_path: impl Into<String>, ffmpeg_path: impl Into<String>, options: EncodeOptions) -> Self {
        Self {
            ytdlp_path: ytdlp_path.into(),
            ffmpeg_path: ffmpeg_path.into(),
            options,
            cookies: None,
        }
    }

    /// Usa el primer archivo de cookies que encuentre
    pub async fn with_cookies_lookup(mut self) -> Self {
        self.cookies = find_cookies_file().await;
        self
    }

    /// Verifica que yt-dlp y ffmpeg estén disponibles
    pub async fn verify_dependencies(&self) -> Result<()> {
        match Command::new(&self.ytdlp_path).arg("--version").output().await {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                info!("✅ yt-dlp versión: {}", version.trim());
            }
            _ => {
                error!("❌ yt-dlp no encontrado. Instala con: pip install yt-dlp");
                bail!("yt-dlp no disponible ({})", self.ytdlp_path);
            }
        }

        match Command::new(&self.ffmpeg_path).arg("-version").output().await {
            Ok(output) if output.status.success() => info!("✅ ffmpeg disponible"),
            _ => {
                error!("❌ ffmpeg no encontrado. Instala con: sudo apt install ffmpeg");
                bail!("ffmpeg no disponible ({})", self.ffmpeg_path);
            }
        }

        Ok(())
    }

    /// Obtiene la URL directa del mejor audio
    async fn resolve_stream_url(&self, cancel: &CancellationToken, url: &str) -> Result<String> {
        let mut cmd = Command::new(&self.ytdlp_path);
        cmd.args([
            "-f",
            "bestaudio/best",
            "--get-url",
            "--no-playlist",
            "--quiet",
            "--no-warnings",
            "--socket-timeout",
            "15",
            "--retries",
            "2",
        ]);
        if let Some(cookies) = &self.cookies {
            cmd.arg("--cookies").arg(cookies);
        }
        cmd.arg(url);

        let stdout = run(cancel, cmd, "yt-dlp").await?;
        let resolved = String::from_utf8_lossy(&stdout)
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_owned)
            .with_context(|| format!("yt-dlp no devolvió URL para {url}"))?;

        debug!("🔗 URL resuelta para {}", url);
        Ok(resolved)
    }

    /// Decodifica `input` a PCM s16le estéreo 48kHz
    async fn decode_pcm(&self, cancel: &CancellationToken, input: &str, offset: Option<Duration>) -> Result<Vec<u8>> {
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(ffmpeg_args(input, offset));
        run(cancel, cmd, "ffmpeg").await
    }

    async fn transcode(&self, cancel: &CancellationToken, song: &Song, input: &str) -> Result<Bytes> {
        let raw = self.decode_pcm(cancel, input, song.start_offset()).await?;
        if raw.is_empty() {
            bail!("ffmpeg no produjo audio para {}", song.title());
        }

        let options = EncodeOptions {
            source_url: Some(song.url().to_owned()),
            ..self.options.clone()
        };

        let (out, frames) = tokio::task::spawn_blocking(move || {
            let pcm = dca::pcm_from_le_bytes(&raw);
            dca::encode_pcm(&pcm, &options, Vec::with_capacity(raw.len() / 8))
        })
        .await
        .context("encoder task panicked")??;

        info!("🎵 {} frames codificados: {}", frames, song.title());
        Ok(Bytes::from(out))
    }
}

#[async_trait]
impl AudioFetcher for YtDlpFetcher {
    async fn fetch(&self, cancel: CancellationToken, song: &Song) -> Result<Bytes> {
        match song.source_type() {
            SourceType::Dca => {
                let path = local_path(song.url());
                let data = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("no se pudo leer {}", path.display()))?;

                match song.start_offset().filter(|o| !o.is_zero()) {
                    Some(offset) => {
                        debug!("⏩ Saltando a {:?} en {}", offset, song.title());
                        let seeked = dca::seek(&data, offset)
                            .await
                            .with_context(|| format!("DCA inválido: {}", path.display()))?;
                        Ok(Bytes::from(seeked))
                    }
                    None => Ok(Bytes::from(data)),
                }
            }
            SourceType::YouTube => {
                let stream_url = self.resolve_stream_url(&cancel, song.url()).await?;
                self.transcode(&cancel, song, &stream_url).await
            }
            SourceType::DirectUrl => self.transcode(&cancel, song, song.url()).await,
        }
    }
}

/// Runs `cmd` to completion and returns its stdout. The child is killed when
/// `cancel` fires.
async fn run(cancel: &CancellationToken, mut cmd: Command, name: &str) -> Result<Vec<u8>> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().with_context(|| format!("no se pudo ejecutar {name}"))?;

    let output = tokio::select! {
        _ = cancel.cancelled() => bail!("{name} cancelado"),
        output = child.wait_with_output() => output?,
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!("{} falló: {}", name, stderr.trim());
        bail!("{name} failed ({}): {}", output.status, stderr.trim());
    }

    Ok(output.stdout)
}

fn ffmpeg_args(input: &str, offset: Option<Duration>) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-nostdin"]
        .into_iter()
        .map(String::from)
        .collect();

    if let Some(offset) = offset.filter(|o| !o.is_zero()) {
        args.push("-ss".into());
        args.push(format!("{:.3}", offset.as_secs_f64()));
    }

    args.extend([
        "-i".into(),
        input.into(),
        "-vn".into(),
        "-f".into(),
        "s16le".into(),
        "-ar".into(),
        SAMPLE_RATE.to_string(),
        "-ac".into(),
        CHANNELS.to_string(),
        "pipe:1".into(),
    ]);
    args
}

fn local_path(url: &str) -> &Path {
    Path::new(url.strip_prefix("file://").unwrap_or(url))
}

/// Busca archivo de cookies disponible
async fn find_cookies_file() -> Option<PathBuf> {
    let mut candidates = vec![PathBuf::from("./cookies.txt")];
    if let Ok(home) = std::env::var("HOME") {
        candidates.insert(0, Path::new(&home).join(".config/yt-dlp/cookies.txt"));
    }

    for path in candidates {
        if tokio::fs::metadata(&path).await.is_ok() {
            info!("🍪 Cookies encontradas en: {}", path.display());
            return Some(path);
        }
    }

    warn!("🍪 No se encontraron cookies - algunos videos pueden fallar");
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ffmpeg_args_with_offset() {
        let args = ffmpeg_args("https://cdn.example.com/a.webm", Some(Duration::from_millis(90_500)));
        let ss = args.iter().position(|a| a == "-ss").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();

        assert_eq!(args[ss + 1], "90.500");
        assert!(ss < input, "-ss must precede -i for input seeking");
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
        assert!(args.windows(2).any(|w| w[0] == "-ar" && w[1] == "48000"));
        assert!(args.windows(2).any(|w| w[0] == "-ac" && w[1] == "2"));
    }

    #[test]
    fn test_ffmpeg_args_without_offset() {
        assert!(!ffmpeg_args("a.mp3", None).contains(&"-ss".to_string()));
        assert!(!ffmpeg_args("a.mp3", Some(Duration::ZERO)).contains(&"-ss".to_string()));
    }

    #[test]
    fn test_local_path() {
        assert_eq!(local_path("file:///tmp/a.dca"), Path::new("/tmp/a.dca"));
        assert_eq!(local_path("/tmp/b.dca"), Path::new("/tmp/b.dca"));
    }

    #[tokio::test]
    async fn test_dca_source_is_read_as_is() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intro.dca");
        std::fs::write(&path, b"DCA1payload").unwrap();

        let fetcher = YtDlpFetcher::new("yt-dlp", "ffmpeg", EncodeOptions::default());
        let song = Song::new("Intro", path.to_string_lossy(), SourceType::Dca);

        let data = fetcher.fetch(CancellationToken::new(), &song).await.unwrap();
        assert_eq!(data, Bytes::from_static(b"DCA1payload"));
    }

    #[tokio::test]
    async fn test_dca_source_honours_start_offset() {
        let mut encoder = dca::DcaEncoder::new(Vec::new(), &EncodeOptions::default().metadata()).unwrap();
        for i in 0..10u8 {
            encoder.write_frame(&[i]).unwrap();
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intro.dca");
        std::fs::write(&path, encoder.finish().unwrap()).unwrap();

        let fetcher = YtDlpFetcher::new("yt-dlp", "ffmpeg", EncodeOptions::default());
        let song = Song::new("Intro", path.to_string_lossy(), SourceType::Dca)
            .with_start_offset(Duration::from_millis(100));

        let data = fetcher.fetch(CancellationToken::new(), &song).await.unwrap();
        let mut decoder = dca::DcaDecoder::new(&data[..]);
        assert_eq!(decoder.next_frame().await.unwrap(), Some(Bytes::from_static(&[5])));
    }

    #[tokio::test]
    async fn test_missing_binary_is_an_error() {
        let fetcher = YtDlpFetcher::new("/nonexistent/yt-dlp", "/nonexistent/ffmpeg", EncodeOptions::default());
        let song = Song::new("X", "https://example.com/x.mp3", SourceType::DirectUrl);

        assert!(fetcher.fetch(CancellationToken::new(), &song).await.is_err());
        assert!(fetcher.verify_dependencies().await.is_err());
    }
}
