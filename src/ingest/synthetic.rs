//! Synthetic upstream (`stub://`) for the daemon and tests.
//!
//! Produces what a tiled inference pipeline would publish for each frame:
//! one detection batch and one tile image per tile in row-major order, plus one
//! crop per detection. Frames are rendered from their sequence number alone, so
//! a consumer can check a reconstructed mosaic, or a crop, against
//! `render_frame`.
//!
//! Besides the object each tile reports, a tile may also report a shifted,
//! lower-confidence duplicate of it and a low-confidence box elsewhere. Both
//! precede the object in the batch and both get their own crop, so suppression
//! removes boxes whose crops are still in the crop stream.
//!
//! Output is deterministic for a given seed. Drop probabilities simulate lossy
//! transport; a ragged start simulates attaching mid-frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Result};
use image::{imageops, Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::geometry::TileGeometry;
use crate::message::{CropRecord, Detection, Frame, TileDetections};
use crate::pipeline::EngineInputs;

#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    /// Must be a `stub://` URL.
    pub url: String,
    pub seed: u64,
    pub detection_drop_rate: f64,
    pub tile_drop_rate: f64,
    pub crop_drop_rate: f64,
    /// Probability that a tile also reports an overlapping duplicate of its
    /// object.
    pub duplicate_rate: f64,
    /// Probability that a tile also reports a box below any sane confidence
    /// threshold.
    pub low_confidence_rate: f64,
    /// Number of trailing tiles of a frame already in flight when the source
    /// starts. Zero starts on a frame boundary.
    pub ragged_start: usize,
    pub first_sequence: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            url: "stub://tiles".to_string(),
            seed: 0,
            detection_drop_rate: 0.0,
            tile_drop_rate: 0.0,
            crop_drop_rate: 0.0,
            duplicate_rate: 0.0,
            low_confidence_rate: 0.0,
            ragged_start: 0,
            first_sequence: 1,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyntheticStats {
    pub cycles: u64,
    pub detections_sent: u64,
    pub detections_dropped: u64,
    pub tiles_sent: u64,
    pub tiles_dropped: u64,
    pub crops_sent: u64,
    pub crops_dropped: u64,
}

/// Everything upstream publishes for one frame, after drops.
#[derive(Debug)]
pub struct SyntheticCycle {
    pub sequence_number: u64,
    pub detections: Vec<TileDetections>,
    pub tiles: Vec<Frame>,
    pub crops: Vec<CropRecord>,
}

pub struct SyntheticTileSource {
    config: SyntheticConfig,
    geometry: TileGeometry,
    rng: StdRng,
    next_sequence: u64,
    ragged_pending: bool,
    stats: SyntheticStats,
}

impl SyntheticTileSource {
    pub fn new(config: SyntheticConfig, geometry: TileGeometry) -> Result<Self> {
        if !config.url.starts_with("stub://") {
            return Err(anyhow!(
                "synthetic source only supports stub:// URLs, got {}",
                config.url
            ));
        }
        for (name, rate) in [
            ("detection_drop_rate", config.detection_drop_rate),
            ("tile_drop_rate", config.tile_drop_rate),
            ("crop_drop_rate", config.crop_drop_rate),
            ("duplicate_rate", config.duplicate_rate),
            ("low_confidence_rate", config.low_confidence_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(anyhow!("{} must be within 0..=1, got {}", name, rate));
            }
        }
        if config.ragged_start >= geometry.tile_count() {
            return Err(anyhow!(
                "ragged_start must be below the tile count ({}), got {}",
                geometry.tile_count(),
                config.ragged_start
            ));
        }
        log::info!(
            "synthetic source {} (seed {}, {} tiles per frame)",
            config.url,
            config.seed,
            geometry.tile_count()
        );
        Ok(Self {
            rng: StdRng::seed_from_u64(config.seed),
            next_sequence: config.first_sequence,
            ragged_pending: config.ragged_start > 0,
            geometry,
            config,
            stats: SyntheticStats::default(),
        })
    }

    pub fn stats(&self) -> SyntheticStats {
        self.stats
    }

    /// Produce the next frame's messages. The first cycle is the ragged tail
    /// when a ragged start is configured.
    pub fn next_cycle(&mut self) -> SyntheticCycle {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        self.stats.cycles += 1;

        let (width, height) = self.geometry.frame_size();
        let frame = render_frame(width, height, seq);
        let tile_count = self.geometry.tile_count();
        let first_tile = if std::mem::take(&mut self.ragged_pending) {
            tile_count - self.config.ragged_start
        } else {
            0
        };

        let mut cycle = SyntheticCycle {
            sequence_number: seq,
            detections: Vec::with_capacity(tile_count),
            tiles: Vec::with_capacity(tile_count),
            crops: Vec::with_capacity(tile_count),
        };
        for ordinal in first_tile..tile_count {
            let Some(tile_index) = self.geometry.tile_at(ordinal) else {
                continue;
            };
            let Some(rect) = self.geometry.crop_pixels(tile_index) else {
                continue;
            };

            let detections = self.tile_detections();
            for detection in &detections {
                let Some(in_frame) = self.geometry.to_frame_space(detection, tile_index, seq)
                else {
                    continue;
                };
                let (x, y, w, h) = in_frame.pixel_box(width, height);
                let crop =
                    imageops::crop_imm(&frame, x as u32, y as u32, (w as u32).max(1), (h as u32).max(1))
                        .to_image();
                if self.roll(self.config.crop_drop_rate) {
                    self.stats.crops_dropped += 1;
                } else {
                    self.stats.crops_sent += 1;
                    cycle.crops.push(CropRecord::new(seq, crop));
                }
            }
            if self.roll(self.config.detection_drop_rate) {
                self.stats.detections_dropped += 1;
            } else {
                self.stats.detections_sent += 1;
                cycle.detections.push(TileDetections::new(seq, detections));
            }

            let tile = imageops::crop_imm(&frame, rect.x_offset, rect.y_offset, rect.width, rect.height)
                .to_image();
            if self.roll(self.config.tile_drop_rate) {
                self.stats.tiles_dropped += 1;
            } else {
                self.stats.tiles_sent += 1;
                cycle.tiles.push(Frame::new(seq, tile));
            }
        }
        cycle
    }

    /// Push `cycles` frames into the engine, blocking while its queues are
    /// full. Stops early once `running` clears or an input queue closes.
    pub fn feed(
        &mut self,
        inputs: &EngineInputs,
        cycles: u64,
        running: &AtomicBool,
        pace: Option<Duration>,
    ) -> Result<SyntheticStats> {
        for _ in 0..cycles {
            if !running.load(Ordering::SeqCst) {
                log::info!("synthetic source stopping early");
                break;
            }
            let cycle = self.next_cycle();
            for batch in cycle.detections {
                inputs.send_detections(batch)?;
            }
            for tile in cycle.tiles {
                inputs.send_tile(tile)?;
            }
            for crop in cycle.crops {
                inputs.send_crop(crop)?;
            }
            if let Some(pace) = pace {
                std::thread::sleep(pace);
            }
        }
        Ok(self.stats)
    }

    /// The tile's object, in the tile's core and clear of the overlap bands so
    /// neighbouring tiles never report it, preceded by the optional extras.
    fn tile_detections(&mut self) -> Vec<Detection> {
        let x = self.rng.gen_range(0.30..0.35);
        let y = self.rng.gen_range(0.30..0.35);
        let size = self.rng.gen_range(0.15..0.25);
        let confidence = self.rng.gen_range(0.6..0.99);
        let object = Detection::new(x, y, x + size, y + size, confidence);

        let mut detections = Vec::with_capacity(3);
        if self.roll(self.config.low_confidence_rate) {
            let x = self.rng.gen_range(0.55..0.60);
            let y = self.rng.gen_range(0.55..0.60);
            let size = self.rng.gen_range(0.10..0.15);
            let confidence = self.rng.gen_range(0.1..0.4);
            detections.push(Detection::new(x, y, x + size, y + size, confidence));
        }
        if self.roll(self.config.duplicate_rate) {
            detections.push(Detection::new(
                object.xmin + 0.01,
                object.ymin + 0.01,
                object.xmax + 0.01,
                object.ymax + 0.01,
                object.confidence * 0.9,
            ));
        }
        detections.push(object);
        detections
    }

    fn roll(&mut self, probability: f64) -> bool {
        probability > 0.0 && self.rng.gen_bool(probability)
    }
}

/// Ground-truth image of frame `sequence_number`.
pub fn render_frame(width: u32, height: u32, sequence_number: u64) -> RgbImage {
    let shade = (sequence_number % 251) as u8;
    RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, shade ^ ((x / 64 + y / 64) as u8)])
    })
}
