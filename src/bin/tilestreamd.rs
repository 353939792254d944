//! tilestreamd - tiled-stream reconstruction daemon
//!
//! Runs the engine against the synthetic `stub://` upstream:
//! 1. Loads engine configuration (file named by TILESTREAM_CONFIG, then env)
//! 2. Feeds tile detections, tile images and crops from a producer thread
//! 3. Logs every reconstructed frame and a periodic health line
//! 4. Stops on Ctrl-C or when the producer runs out of frames

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tilestream::{Engine, EngineConfig, SyntheticConfig, SyntheticTileSource};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Reconstruct full frames from tiled detection streams"
)]
struct Args {
    /// Engine config file (JSON, or TOML by extension).
    #[arg(long, env = "TILESTREAM_CONFIG")]
    config: Option<PathBuf>,

    /// Synthetic upstream URL.
    #[arg(long, env = "TILESTREAM_SOURCE_URL", default_value = "stub://tiles")]
    source_url: String,

    /// Frames to produce before shutting down.
    #[arg(long, default_value_t = 100)]
    frames: u64,

    /// Producer frame rate. Zero runs unpaced.
    #[arg(long, default_value_t = 10)]
    fps: u32,

    #[arg(long, env = "TILESTREAM_SEED", default_value_t = 0)]
    seed: u64,

    /// Probability of losing each tile detection batch.
    #[arg(long, default_value_t = 0.0)]
    detection_drop_rate: f64,

    /// Probability of losing each tile image.
    #[arg(long, default_value_t = 0.0)]
    tile_drop_rate: f64,

    /// Probability of losing each crop.
    #[arg(long, default_value_t = 0.0)]
    crop_drop_rate: f64,

    /// Probability that a tile also reports an overlapping duplicate box.
    #[arg(long, default_value_t = 0.0)]
    duplicate_rate: f64,

    /// Probability that a tile also reports a low-confidence box.
    #[arg(long, default_value_t = 0.0)]
    low_confidence_rate: f64,

    /// Start this many tiles before a frame boundary.
    #[arg(long, default_value_t = 0)]
    ragged_start: usize,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = EngineConfig::load_from(args.config.as_deref())?;
    let geometry = config.geometry()?;
    log::info!(
        "tilestreamd {}: {} tiles (step {}, overlap {}) over {}x{}",
        env!("CARGO_PKG_VERSION"),
        geometry.tile_count(),
        config.tiling.step,
        config.tiling.overlap,
        config.tiling.frame_width,
        config.tiling.frame_height
    );

    let mut source = SyntheticTileSource::new(
        SyntheticConfig {
            url: args.source_url.clone(),
            seed: args.seed,
            detection_drop_rate: args.detection_drop_rate,
            tile_drop_rate: args.tile_drop_rate,
            crop_drop_rate: args.crop_drop_rate,
            duplicate_rate: args.duplicate_rate,
            low_confidence_rate: args.low_confidence_rate,
            ragged_start: args.ragged_start,
            ..SyntheticConfig::default()
        },
        geometry,
    )?;

    let (inputs, results, engine) = Engine::spawn(&config, None)?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            running.store(false, Ordering::SeqCst);
        })
        .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;
    }

    let pace = (args.fps > 0).then(|| Duration::from_secs_f64(1.0 / args.fps as f64));
    let frames = args.frames;
    let producer = {
        let running = running.clone();
        std::thread::Builder::new()
            .name("tilestream-producer".into())
            .spawn(move || {
                let stats = source.feed(&inputs, frames, &running, pace);
                // dropping the inputs lets every engine loop drain and exit
                drop(inputs);
                stats
            })?
    };

    let mut emitted = 0u64;
    let mut partial = 0u64;
    let mut last_health = Instant::now();
    for result in results.iter() {
        emitted += 1;
        if !result.detections.completeness.is_complete() || !result.mosaic.completeness.is_complete()
        {
            partial += 1;
        }
        log::info!(
            "frame {}: {} detections, {} crops, mosaic {}x{} ({:?})",
            result.sequence_number,
            result.detections.detections.len(),
            result.crops.len(),
            result.mosaic.frame.width(),
            result.mosaic.frame.height(),
            result.mosaic.completeness
        );
        if last_health.elapsed() >= HEALTH_LOG_INTERVAL {
            log::info!("health: {} frames emitted, {} partial", emitted, partial);
            last_health = Instant::now();
        }
        if !running.load(Ordering::SeqCst) {
            log::info!("shutdown signal received, stopping engine");
            break;
        }
    }
    drop(results);

    let source_stats = producer
        .join()
        .map_err(|_| anyhow!("producer thread panicked"))?;
    match source_stats {
        Ok(stats) => log::info!("source stats: {:?}", stats),
        Err(e) => log::warn!("producer stopped: {}", e),
    }

    let stats = engine.stop()?;
    log::info!(
        "engine stopped: {} frames emitted, {} startup drops (detections) / {} (tiles)",
        stats.frames_emitted,
        stats.detections_dropped_at_startup,
        stats.tiles_dropped_at_startup
    );
    log::info!(
        "reassembly {:?}; mosaic {:?}; sync {:?}; crops {:?}",
        stats.reassembly,
        stats.mosaic,
        stats.sync,
        stats.crops
    );
    if stats.crops_overflowed > 0 {
        log::warn!("{} crops dropped by a full crop buffer", stats.crops_overflowed);
    }
    let restarts = stats.detection_restarts + stats.mosaic_restarts + stats.join_restarts;
    if restarts > 0 {
        log::warn!(
            "upstream restarts: detections {}, mosaic {}, join {} ({} messages skipped)",
            stats.detection_restarts,
            stats.mosaic_restarts,
            stats.join_restarts,
            stats.skipped_after_restart
        );
    }
    Ok(())
}
