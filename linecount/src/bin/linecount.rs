/// Line-crossing counter command line
///
/// Usage:
///   linecount run --config counter.json [--frames 5000] [--clip recordings/day1]
///   linecount tune --config counter.json
///   linecount backfill --config counter.json --clip recordings/day1 [--start 2024-05-01T08:00:00Z]
///   linecount rollup --config counter.json --day 2024-05-01
///   linecount export --config counter.json --day 2024-05-01
///   linecount record --config counter.json --out recordings/mock --frames 600
///
/// Only the synthetic detector ships with the crate, so `run`, `tune` and
/// `backfill` need `model.mock_mode` (or `LINECOUNT_MOCK_MODE=true`).
use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use linecount::cancel::CancellationToken;
use linecount::config::{AppConfig, FileConfigProvider};
use linecount::detector_trait::{ClipSource, Detector, DetectorFactory, FrameSource};
use linecount::export::export_csv;
use linecount::pipeline::backfill;
use linecount::processor::FrameProcessor;
use linecount::service::{CountingService, ServiceParts, TuningTask};
use linecount::state::LiveState;
use linecount::store::{EventStore, JsonlEventStore};
use linecount::synthetic::{
    write_clip, ClipDir, RecordedClip, SceneDetector, SyntheticClip, SyntheticScene,
};
use linecount::tuner::load_profile;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "linecount", version, about = "Line-crossing object counter")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the counting service until the source ends or the frame limit is hit
    Run {
        #[arg(long)]
        config: PathBuf,
        /// Stop after this many frames
        #[arg(long)]
        frames: Option<u64>,
        /// Replay a clip directory instead of the live mock scene
        #[arg(long)]
        clip: Option<PathBuf>,
    },
    /// Run one tuning pass now
    Tune {
        #[arg(long)]
        config: PathBuf,
    },
    /// Replay a recorded clip into the event store
    Backfill {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        clip: PathBuf,
        /// Timestamp of the clip's first frame (RFC 3339); defaults to now
        #[arg(long)]
        start: Option<DateTime<Utc>>,
    },
    /// Print one day's totals as JSON
    Rollup {
        #[arg(long)]
        config: PathBuf,
        /// UTC day, YYYY-MM-DD
        #[arg(long)]
        day: NaiveDate,
    },
    /// Write one day's events to `<storage.csv_dir>/<day>_counts.csv`
    Export {
        #[arg(long)]
        config: PathBuf,
        /// UTC day, YYYY-MM-DD
        #[arg(long)]
        day: NaiveDate,
    },
    /// Write frames of the mock scene to a clip directory
    Record {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = 600)]
        frames: u64,
    },
}

/// Load config, start logging at the configured level, then layer the saved profile
fn load_config(path: &Path) -> Result<AppConfig> {
    let mut config =
        AppConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?;
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.ops.log_level.as_str()),
    )
    .init();
    linecount::init()?;

    if let Some(profile) = load_profile(&config.tuner.profile_path)? {
        config.apply_profile(&profile);
        config.validate().context("configuration with tuning profile applied")?;
    }
    Ok(config)
}

fn require_mock(config: &AppConfig) -> Result<()> {
    if !config.model.mock_mode {
        bail!("no detector backend is available; enable model.mock_mode or set LINECOUNT_MOCK_MODE=true");
    }
    Ok(())
}

fn detector_factory(config: &AppConfig) -> Arc<dyn DetectorFactory> {
    let scene = config.scene_config();
    Arc::new(move || -> linecount::Result<Box<dyn Detector>> {
        Ok(Box::new(SceneDetector::new(scene.clone())))
    })
}

fn tuning_clip(config: &AppConfig) -> Arc<dyn ClipSource> {
    match &config.tuner.clip_dir {
        Some(dir) => Arc::new(ClipDir {
            dir: dir.clone(),
            fps: config.tuner.clip_fps,
            start: Utc::now(),
        }),
        None => Arc::new(SyntheticClip::new(
            config.scene_config(),
            config.tuner.max_clip_frames as u64,
            Utc::now(),
        )),
    }
}

fn run(config_path: &Path, frames: Option<u64>, clip: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;
    require_mock(&config)?;

    let source: Box<dyn FrameSource> = match clip {
        Some(dir) => Box::new(RecordedClip::open(dir, config.camera.fps, Utc::now())?),
        None => Box::new(SyntheticScene::new(config.scene_config(), Utc::now())),
    };
    let store: Arc<dyn EventStore> = Arc::new(JsonlEventStore::open(&config.storage.events_path)?);

    let service = CountingService::start(
        &config,
        ServiceParts {
            source,
            detectors: detector_factory(&config),
            store,
            provider: Arc::new(FileConfigProvider::new(config_path, &config)),
            tuning_clip: config.tuner.enabled.then(|| tuning_clip(&config)),
            max_frames: frames,
        },
    )?;
    let state = Arc::clone(service.state());
    let summary = service.wait()?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    if let Some(drift) = state.drift() {
        println!("{}", serde_json::to_string_pretty(&drift)?);
    }
    Ok(())
}

fn tune(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    require_mock(&config)?;

    let state = Arc::new(LiveState::new(Arc::new(FileConfigProvider::new(config_path, &config)))?);
    let task = TuningTask::new(
        config.tuner.clone(),
        config.processor_settings(),
        state,
        detector_factory(&config),
        tuning_clip(&config),
    );
    let report = task.tune(&CancellationToken::new())?;
    println!("{}", serde_json::to_string_pretty(&report.outcome)?);
    Ok(())
}

fn run_backfill(config_path: &Path, clip: &Path, start: Option<DateTime<Utc>>) -> Result<()> {
    let config = load_config(config_path)?;
    require_mock(&config)?;

    let mut source = RecordedClip::open(clip, config.tuner.clip_fps, start.unwrap_or_else(Utc::now))?;
    let mut detector = detector_factory(&config).create()?;
    let mut processor = FrameProcessor::new(&config.processor_settings())?;
    let store = JsonlEventStore::open(&config.storage.events_path)?;
    let report = backfill(
        &mut source,
        &mut *detector,
        &mut processor,
        &config.counting.line,
        &store,
        &CancellationToken::new(),
    )?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn rollup(config_path: &Path, day: NaiveDate) -> Result<()> {
    let config = load_config(config_path)?;
    let store = JsonlEventStore::open(&config.storage.events_path)?;
    println!("{}", serde_json::to_string_pretty(&store.rollup(day)?)?);
    Ok(())
}

fn export(config_path: &Path, day: NaiveDate) -> Result<()> {
    let config = load_config(config_path)?;
    let store = JsonlEventStore::open(&config.storage.events_path)?;
    let (path, rows) = export_csv(&store, day, &config.storage.csv_dir)?;
    println!("{} ({} events)", path.display(), rows);
    Ok(())
}

fn record(config_path: &Path, out: &Path, frames: u64) -> Result<()> {
    let config = load_config(config_path)?;
    let scene = SyntheticScene::new(config.scene_config(), Utc::now());
    write_clip(&scene, frames, out)?;
    log::info!("Wrote {} frames to {}", frames, out.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, frames, clip } => run(&config, frames, clip)?,
        Commands::Tune { config } => tune(&config)?,
        Commands::Backfill { config, clip, start } => run_backfill(&config, &clip, start)?,
        Commands::Rollup { config, day } => rollup(&config, day)?,
        Commands::Export { config, day } => export(&config, day)?,
        Commands::Record { config, out, frames } => record(&config, &out, frames)?,
    }

    Ok(())
}
