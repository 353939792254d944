//! Threaded engine runtime.
//!
//! Wires the reconstruction stages together:
//!
//! ```text
//! detections ─▶ StartupAligner ─▶ DetectionReassembler ─┐
//!                                                       ├─▶ SequenceSynchronizer ─▶ CropMatcher ─▶ FrameResult
//! tile images ─▶ StartupAligner ─▶ FrameMosaicBuilder ──┘          ▲
//!                                                                   │
//! crops ─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each stage is owned by exactly one thread; stages hand artifacts to each
//! other over channels only. Full input queues block the producer. The crop
//! loop drains its queue into a bounded crop buffer that drops its oldest crop
//! when full, so a join stalled on alignment or drift never blocks crop
//! delivery and never grows memory. After each joined frame the matcher
//! discards every crop at or below that frame's sequence number.
//!
//! A full cycle of stale messages on an input means the upstream restarted its
//! sequence numbers: that stage resets and realigns, and the join stage drops
//! everything keyed by the old numbering.
//! Shutdown is cooperative: loops check the shared running flag between
//! messages and end when their input disconnects. In-flight partial frames are
//! dropped on shutdown, never flushed.

mod stages;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{anyhow, Context, Result};

use crate::align::StartupAligner;
use crate::config::EngineConfig;
use crate::crop::{crop_buffer, CropMatcher, CropStats, MatchedCrop};
use crate::decode::CropDecoder;
use crate::message::{CropRecord, Frame, TileDetections};
use crate::mosaic::{FrameMosaicBuilder, MosaicFrame, MosaicStats};
use crate::reassemble::{DetectionReassembler, ReassembledFrame, ReassemblyStats};
use crate::sync::{SequenceSynchronizer, SyncStats};

use stages::{CropLoopReport, DetectionLoopReport, JoinLoopReport, MosaicLoopReport};

/// Identifiers the join stage synchronizes on.
pub const DETECTIONS_ID: &str = "detections";
pub const MOSAIC_ID: &str = "mosaic";

/// One fully reconstructed frame.
#[derive(Debug)]
pub struct FrameResult {
    pub sequence_number: u64,
    pub mosaic: MosaicFrame,
    pub detections: ReassembledFrame,
    /// Detections paired with their crops, labelled by the decoder if any.
    pub crops: Vec<MatchedCrop>,
}

/// Producer side of the engine's input queues.
///
/// Dropping it disconnects the queues and lets the engine wind down.
pub struct EngineInputs {
    pub detections: SyncSender<TileDetections>,
    pub tiles: SyncSender<Frame>,
    pub crops: SyncSender<CropRecord>,
}

impl EngineInputs {
    pub fn send_detections(&self, batch: TileDetections) -> Result<()> {
        self.detections
            .send(batch)
            .map_err(|_| anyhow!("detection queue closed"))
    }

    pub fn send_tile(&self, tile: Frame) -> Result<()> {
        self.tiles
            .send(tile)
            .map_err(|_| anyhow!("tile image queue closed"))
    }

    pub fn send_crop(&self, crop: CropRecord) -> Result<()> {
        self.crops
            .send(crop)
            .map_err(|_| anyhow!("crop queue closed"))
    }
}

/// Aggregated counters from every stage, collected at shutdown.
#[derive(Clone, Debug, Default)]
pub struct EngineStats {
    pub detections_dropped_at_startup: u64,
    pub tiles_dropped_at_startup: u64,
    pub reassembly: ReassemblyStats,
    pub mosaic: MosaicStats,
    pub sync: SyncStats,
    pub crops_received: u64,
    /// Crops dropped because the crop buffer was full.
    pub crops_overflowed: u64,
    pub crops: CropStats,
    /// Upstream restarts detected by the detection and mosaic stages.
    pub detection_restarts: u64,
    pub mosaic_restarts: u64,
    /// Restarts handled by the join stage, and the old-numbering messages it
    /// skipped while waiting for the other stream.
    pub join_restarts: u64,
    pub skipped_after_restart: u64,
    pub frames_emitted: u64,
}

pub struct EngineHandle {
    running: Arc<AtomicBool>,
    detection_loop: Option<JoinHandle<DetectionLoopReport>>,
    mosaic_loop: Option<JoinHandle<MosaicLoopReport>>,
    crop_loop: Option<JoinHandle<CropLoopReport>>,
    join_loop: Option<JoinHandle<JoinLoopReport>>,
}

impl EngineHandle {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask every loop to stop after its current message.
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Stop and wait for all loops.
    ///
    /// A loop blocked on an idle queue only notices the request once a message
    /// arrives or the queue disconnects, so drop `EngineInputs` first.
    pub fn stop(mut self) -> Result<EngineStats> {
        self.request_stop();
        let mut stats = EngineStats::default();
        if let Some(join) = self.detection_loop.take() {
            let report = join
                .join()
                .map_err(|_| anyhow!("detection loop panicked"))?;
            stats.detections_dropped_at_startup = report.dropped_at_startup;
            stats.detection_restarts = report.restarts;
            stats.reassembly = report.reassembly;
        }
        if let Some(join) = self.mosaic_loop.take() {
            let report = join.join().map_err(|_| anyhow!("mosaic loop panicked"))?;
            stats.tiles_dropped_at_startup = report.dropped_at_startup;
            stats.mosaic_restarts = report.restarts;
            stats.mosaic = report.mosaic;
        }
        if let Some(join) = self.crop_loop.take() {
            let report = join.join().map_err(|_| anyhow!("crop loop panicked"))?;
            stats.crops_received = report.forwarded;
            stats.crops_overflowed = report.overflowed;
        }
        if let Some(join) = self.join_loop.take() {
            let report = join.join().map_err(|_| anyhow!("join loop panicked"))?;
            stats.sync = report.sync;
            stats.crops = report.crops;
            stats.join_restarts = report.restarts;
            stats.skipped_after_restart = report.skipped_after_restart;
            stats.frames_emitted = report.frames_emitted;
        }
        Ok(stats)
    }
}

pub struct Engine;

impl Engine {
    /// Validate `config`, build every stage and start the loops.
    ///
    /// Returns the input queues, the stream of reconstructed frames, and the
    /// handle that stops the engine. Misconfiguration fails here, before any
    /// thread starts.
    pub fn spawn(
        config: &EngineConfig,
        decoder: Option<Box<dyn CropDecoder>>,
    ) -> Result<(EngineInputs, Receiver<FrameResult>, EngineHandle)> {
        config.validate()?;
        let geometry = config.geometry()?;
        let tile_count = geometry.tile_count();
        let capacity = config.queue_capacity;

        let detection_aligner = StartupAligner::new(tile_count)?;
        let tile_aligner = StartupAligner::new(tile_count)?;
        let reassembler = DetectionReassembler::new(geometry.clone(), config.nms);
        let mosaic = FrameMosaicBuilder::new(geometry);
        let synchronizer = SequenceSynchronizer::with_limits(
            2,
            config.sync.capacity,
            config.sync.eviction_batch_size,
        )?;

        let (detections_tx, detections_rx) = mpsc::sync_channel(capacity);
        let (tiles_tx, tiles_rx) = mpsc::sync_channel(capacity);
        let (crops_tx, crops_rx) = mpsc::sync_channel(capacity);
        let (crop_writer, crop_reader) = crop_buffer(config.crop_buffer_capacity)?;
        let (joined_tx, joined_rx) = mpsc::sync_channel(capacity);
        let (results_tx, results_rx) = mpsc::sync_channel(capacity);
        let matcher = CropMatcher::with_capacity(crop_reader, config.crop_lookahead_capacity)?;

        let running = Arc::new(AtomicBool::new(true));

        let detection_loop = {
            let running = running.clone();
            let joined_tx = joined_tx.clone();
            std::thread::Builder::new()
                .name("tilestream-detections".into())
                .spawn(move || {
                    stages::run_detection_loop(
                        detections_rx,
                        detection_aligner,
                        reassembler,
                        joined_tx,
                        running,
                    )
                })
                .context("failed to spawn detection loop")?
        };
        let mosaic_loop = {
            let running = running.clone();
            std::thread::Builder::new()
                .name("tilestream-mosaic".into())
                .spawn(move || {
                    stages::run_mosaic_loop(tiles_rx, tile_aligner, mosaic, joined_tx, running)
                })
                .context("failed to spawn mosaic loop")?
        };
        let crop_loop = {
            let running = running.clone();
            std::thread::Builder::new()
                .name("tilestream-crops".into())
                .spawn(move || stages::run_crop_loop(crops_rx, crop_writer, running))
                .context("failed to spawn crop loop")?
        };
        let join_loop = {
            let running = running.clone();
            std::thread::Builder::new()
                .name("tilestream-join".into())
                .spawn(move || {
                    stages::run_join_loop(
                        joined_rx,
                        synchronizer,
                        matcher,
                        decoder,
                        results_tx,
                        running,
                    )
                })
                .context("failed to spawn join loop")?
        };

        log::info!(
            "engine started: {} tiles, queue capacity {}",
            tile_count,
            capacity
        );

        Ok((
            EngineInputs {
                detections: detections_tx,
                tiles: tiles_tx,
                crops: crops_tx,
            },
            results_rx,
            EngineHandle {
                running,
                detection_loop: Some(detection_loop),
                mosaic_loop: Some(mosaic_loop),
                crop_loop: Some(crop_loop),
                join_loop: Some(join_loop),
            },
        ))
    }
}
