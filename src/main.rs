use anyhow::{bail, Result};
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use music_relay::{
    audio::{AudioSource, PlayerManager},
    cache::AudioCache,
    config::Config,
    sources::{Song, SourceType, YtDlpFetcher},
    ui::LogTextChannel,
    voice::{ChannelId, GuildId, PacedVoice, VoiceConnection},
};

/// Relay de audio opus por guild
#[derive(Parser, Debug, PartialEq)]
#[clap(name = "music-relay", version)]
#[clap(about = "Plays songs into a guild voice channel through the DCA relay")]
struct Args {
    /// Verify that yt-dlp and ffmpeg are installed, then exit
    #[clap(long)]
    health_check: bool,

    /// Guild to play in
    #[clap(long, env = "RELAY_GUILD", default_value = "1")]
    guild: u64,

    /// Voice channel to join
    #[clap(long, env = "RELAY_VOICE_CHANNEL", default_value = "1")]
    voice: u64,

    /// Text channel for playback messages
    #[clap(long, env = "RELAY_TEXT_CHANNEL", default_value = "2")]
    text: u64,

    /// Song URLs or local .dca files
    #[clap(value_name = "URL")]
    urls: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("music_relay=debug".parse()?),
        )
        .init();

    info!("🎵 Iniciando Music Relay v{}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    let (guild, voice, text) = (GuildId(args.guild), ChannelId(args.voice), ChannelId(args.text));

    // Cargar configuración
    let config = Config::load()?;
    debug!("{}", config.summary());

    let fetcher = YtDlpFetcher::new(&config.ytdlp_path, &config.ffmpeg_path, config.encode_options())
        .with_cookies_lookup()
        .await;

    if args.health_check {
        fetcher.verify_dependencies().await?;
        println!("OK");
        return Ok(());
    }

    let shutdown = CancellationToken::new();

    // Inicializar caché
    let cache = Arc::new(AudioCache::new(config.cache_config()));
    let sweeper = cache.spawn_sweeper(shutdown.child_token());

    let source = Arc::new(AudioSource::new(cache.clone(), Arc::new(fetcher)).with_fetch_timeout(config.fetch_timeout));

    let manager = PlayerManager::new(
        Box::new(|guild_id: GuildId| Arc::new(PacedVoice::new(guild_id)) as Arc<dyn VoiceConnection>),
        Arc::new(LogTextChannel::new()),
        source,
        config.storage.clone(),
        config.max_queue_size,
        config.player_settings(),
    );

    let player = manager.get_or_create(guild).await?;
    if player.resume_interrupted().await? {
        info!("🔄 Canción interrumpida restaurada en la cola");
    }

    let songs: Vec<Song> = args
        .urls
        .iter()
        .map(|url| Song::new(url.as_str(), url.as_str(), SourceType::detect(url)))
        .collect();

    if songs.is_empty() && player.playlist().await?.is_empty() {
        manager.shutdown().await;
        bail!("nothing to play: pass at least one URL");
    }

    player.add_songs(text, voice, songs).await?;

    // Manejar shutdown graceful
    tokio::select! {
        _ = player.wait_idle() => info!("✅ Playlist terminada"),
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("⚠️ Error esperando Ctrl+C: {}", e);
            }
            info!("⚠️ Señal de shutdown recibida, cerrando...");
        }
    }

    manager.shutdown().await;
    shutdown.cancel();
    sweeper.await?;

    let stats = cache.metrics().snapshot();
    info!(
        "📊 Caché: {} hits, {} misses ({:.1}% hit rate), {} entradas",
        stats.hits,
        stats.misses,
        stats.hit_rate() * 100.0,
        stats.size
    );
    match cache.metrics().render_prometheus("music_relay_cache") {
        Ok(text) => debug!("\n{}", text),
        Err(e) => warn!("⚠️ No se pudieron exportar métricas: {:#}", e),
    }

    Ok(())
}
