use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use music_sync_core::{
    AudioFeatures, ColorExtractor, ColorHarmonyEngine, ColorRole, ColorSample, EngineConfig,
    EnhancedTempo, HostError, HostEvent, HostPlayerApi, PerformanceSample, RecordingSurface, Rgb,
    SceneDescriptor, SceneParticipant, SyncEngine, TrackInfo,
};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> music_sync_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Simulate {
            tracks,
            frames,
            frame_ms,
            slow_frame_ms,
        } => run_simulation(config, tracks, frames, frame_ms, slow_frame_ms).await,
        Commands::Tempo {
            tempo,
            danceability,
            energy,
        } => run_tempo(&config, tempo, danceability, energy),
        Commands::Palette { colors } => run_palette(config, &colors),
    }
}

async fn run_simulation(
    config: EngineConfig,
    tracks: Vec<String>,
    frames: u32,
    frame_ms: f64,
    slow_frame_ms: Option<f32>,
) -> music_sync_core::Result<()> {
    tracing::info!(tracks = tracks.len(), frames, frame_ms, "starting simulation");

    let surface = RecordingSurface::new();
    let mut engine = SyncEngine::new(
        config,
        Arc::new(SimulatedHost),
        Arc::new(SimulatedHost),
        Box::new(surface.clone()),
    )?;
    for descriptor in SceneDescriptor::defaults() {
        engine.register_participant(Box::new(SceneParticipant::new(descriptor)))?;
    }

    let frames_per_track = (frames / tracks.len().max(1) as u32).max(1);
    let mut now = 0.0;
    let mut beats = 0u64;
    for frame in 0..frames {
        if frame % frames_per_track == 0 {
            let index = (frame / frames_per_track) as usize;
            if let Some(id) = tracks.get(index) {
                engine.push_event(HostEvent::TrackChanged {
                    track: TrackInfo::new(id.as_str()).with_art(format!("art://{id}")),
                    started_at_ms: now,
                });
            }
        }

        let frame_time = slow_frame_ms.unwrap_or(frame_ms as f32);
        engine.push_event(HostEvent::Performance(PerformanceSample::from_frame_time(
            frame_time,
        )));

        let report = engine.tick(now);
        if let Some(beat) = report.beat {
            beats += 1;
            tracing::debug!(index = beat.beat_index, bpm = beat.bpm, "beat");
        }

        tokio::time::sleep(Duration::from_millis(frame_ms as u64)).await;
        now += frame_ms;
    }
    engine.stop();

    let state = engine.state();
    let stats = engine.batcher_stats();
    let cache = engine.cache().stats();
    println!("beats:            {beats}");
    println!("state version:    {}", state.version);
    println!("quality level:    {:.2}", state.quality_level);
    println!("colour temp:      {:.0} K", state.color_temperature_kelvin);
    println!("values applied:   {}", stats.applied);
    println!("values skipped:   {} ({:.1}%)", stats.skipped, stats.skip_rate() * 100.0);
    println!("surface writes:   {}", surface.write_calls());
    println!("feature fetches:  {} ({} cache hits)", cache.fetches, cache.hits);
    Ok(())
}

fn run_tempo(
    config: &EngineConfig,
    tempo: f32,
    danceability: f32,
    energy: f32,
) -> music_sync_core::Result<()> {
    let payload = json!({
        "tempo": tempo,
        "danceability": danceability,
        "energy": energy,
        "valence": 0.5,
    });
    let features = AudioFeatures::from_host("cli", &payload)?;
    let enhanced = EnhancedTempo::from_features(&features, &config.beat);
    println!("{}", serde_json::to_string_pretty(&enhanced)?);
    Ok(())
}

fn run_palette(config: EngineConfig, colors: &[String]) -> music_sync_core::Result<()> {
    const ROLES: [ColorRole; 5] = [
        ColorRole::Vibrant,
        ColorRole::DarkVibrant,
        ColorRole::LightVibrant,
        ColorRole::Prominent,
        ColorRole::Desaturated,
    ];

    let samples = colors
        .iter()
        .zip(ROLES)
        .map(|(hex, role)| -> music_sync_core::Result<ColorSample> {
            Ok(ColorSample::new(role, hex.parse()?))
        })
        .collect::<music_sync_core::Result<Vec<_>>>()?;

    let engine = ColorHarmonyEngine::new(config.color)?;
    let palette = engine.harmonize(&samples);
    println!("{}", serde_json::to_string_pretty(&palette)?);
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

/// Stand-in for the player: features and art colours are derived from the
/// track id so repeated runs are reproducible.
struct SimulatedHost;

fn seed(track_id: &str) -> u32 {
    track_id
        .bytes()
        .fold(2_166_136_261u32, |hash, byte| (hash ^ byte as u32).wrapping_mul(16_777_619))
}

#[async_trait]
impl HostPlayerApi for SimulatedHost {
    async fn audio_features(&self, track_id: &str) -> Result<Value, HostError> {
        tokio::time::sleep(Duration::from_millis(40)).await;
        let seed = seed(track_id);
        let unit = |shift: u32| ((seed >> shift) & 0xff) as f32 / 255.0;
        Ok(json!({
            "tempo": 80.0 + unit(0) * 90.0,
            "energy": unit(8),
            "danceability": unit(16),
            "valence": unit(24),
            "duration_ms": 180_000.0,
        }))
    }
}

#[async_trait]
impl ColorExtractor for SimulatedHost {
    async fn extract(&self, art_url: &str) -> Result<Vec<ColorSample>, HostError> {
        tokio::time::sleep(Duration::from_millis(25)).await;
        let [r, g, b, _] = seed(art_url).to_be_bytes();
        Ok(vec![
            ColorSample::new(ColorRole::Vibrant, Rgb::new(r, g, b)),
            ColorSample::new(ColorRole::DarkVibrant, Rgb::new(r / 3, g / 3, b / 3)),
        ])
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Music-synchronised visual effects engine", long_about = None)]
struct Cli {
    /// Engine configuration file (JSON). Defaults are used when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Drive the engine against a simulated player and print batching stats.
    Simulate {
        /// Track ids to play in order.
        #[arg(short, long, num_args = 1.., default_values = ["intro", "anthem", "ballad"])]
        tracks: Vec<String>,
        /// Number of frames to run.
        #[arg(short, long, default_value_t = 600)]
        frames: u32,
        /// Frame interval in milliseconds.
        #[arg(long, default_value_t = 16.0)]
        frame_ms: f64,
        /// Report this frame time to the coordinator instead of the interval.
        #[arg(long)]
        slow_frame_ms: Option<f32>,
    },
    /// Compute the enhanced tempo for a set of audio features.
    Tempo {
        #[arg(long)]
        tempo: f32,
        #[arg(long, default_value_t = 0.5)]
        danceability: f32,
        #[arg(long, default_value_t = 0.5)]
        energy: f32,
    },
    /// Blend hex colours (vibrant, dark vibrant, light vibrant, ...) into the
    /// base palette.
    Palette {
        #[arg(required = true)]
        colors: Vec<String>,
    },
}
