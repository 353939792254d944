//! Per-frame reassembly of tiled detection batches.
//!
//! Every tile of a frame produces one detection batch, tagged with the frame's
//! sequence number. `DetectionReassembler` maps each batch into frame space,
//! accumulates one full cycle, runs NMS to drop the duplicates that overlapping
//! tiles produce, and emits one `ReassembledFrame`.
//!
//! Drift handling: if a batch for a newer frame shows up while the current
//! window is still open, some tiles were lost upstream. The open window is
//! emitted as a `Partial` frame and accumulation restarts on the new frame.
//! Reassembly never blocks waiting for a tile that is not coming.

mod nms;

pub use nms::{survivors, NmsConfig, DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_OVERLAP_THRESHOLD};

use crate::geometry::TileGeometry;
use crate::message::{Completeness, FrameDetection, Sequenced, TileDetections};

/// Merged, duplicate-suppressed detections of one frame.
#[derive(Clone, Debug)]
pub struct ReassembledFrame {
    pub sequence_number: u64,
    /// Suppression survivors, in arrival order.
    pub detections: Vec<FrameDetection>,
    /// Every mapped detection of the cycle before suppression, in arrival
    /// order. Upstream publishes one crop per entry, in this order.
    pub candidates: Vec<FrameDetection>,
    /// Ascending index into `candidates` of each entry of `detections`.
    pub survivors: Vec<usize>,
    pub completeness: Completeness,
}

impl ReassembledFrame {
    /// Build a frame from its candidates, running suppression.
    pub fn from_candidates(
        sequence_number: u64,
        candidates: Vec<FrameDetection>,
        completeness: Completeness,
        nms: &NmsConfig,
        frame_size: (u32, u32),
    ) -> Self {
        let survivors = survivors(&candidates, nms, frame_size.0, frame_size.1);
        let detections = survivors.iter().map(|&i| candidates[i].clone()).collect();
        Self {
            sequence_number,
            detections,
            candidates,
            survivors,
            completeness,
        }
    }
}

impl Sequenced for ReassembledFrame {
    fn sequence_number(&self) -> u64 {
        self.sequence_number
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    pub complete: u64,
    pub partial: u64,
    pub stale_batches: u64,
    pub duplicate_tiles: u64,
}

pub struct DetectionReassembler {
    geometry: TileGeometry,
    nms: NmsConfig,
    /// Sequence number of the open accumulation window.
    current: Option<u64>,
    /// Newest sequence number already emitted.
    last_closed: Option<u64>,
    accumulator: Vec<FrameDetection>,
    received: Vec<bool>,
    /// Next tile position within the cycle; equals tiles received so far.
    tile_cursor: usize,
    stats: ReassemblyStats,
}

impl DetectionReassembler {
    pub fn new(geometry: TileGeometry, nms: NmsConfig) -> Self {
        let tile_count = geometry.tile_count();
        Self {
            geometry,
            nms,
            current: None,
            last_closed: None,
            accumulator: Vec::new(),
            received: vec![false; tile_count],
            tile_cursor: 0,
            stats: ReassemblyStats::default(),
        }
    }

    pub fn geometry(&self) -> &TileGeometry {
        &self.geometry
    }

    pub fn tile_cursor(&self) -> usize {
        self.tile_cursor
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }

    /// Ingest the batch for the tile at row-major ordinal `tile_index`.
    ///
    /// Tiles of one frame may arrive in any order.
    pub fn ingest(&mut self, batch: TileDetections, tile_index: usize) -> Option<ReassembledFrame> {
        self.ingest_at(batch, Some(tile_index))
    }

    /// Ingest a batch whose tile position is implied by arrival order
    /// (row-major, one batch per tile).
    pub fn ingest_next(&mut self, batch: TileDetections) -> Option<ReassembledFrame> {
        self.ingest_at(batch, None)
    }

    /// Drop any open window without emitting it and forget the last emitted
    /// sequence number, so a restarted upstream is accepted again.
    pub fn reset(&mut self) {
        self.current = None;
        self.last_closed = None;
        self.clear_window();
    }

    fn ingest_at(
        &mut self,
        batch: TileDetections,
        tile_index: Option<usize>,
    ) -> Option<ReassembledFrame> {
        let seq = batch.sequence_number;
        log::debug!(
            "got {} detections for sequence number {}",
            batch.detections.len(),
            seq
        );

        if self.last_closed.is_some_and(|closed| seq <= closed) {
            return self.reject_stale(seq);
        }

        let mut flushed = None;
        match self.current {
            Some(current) if seq < current => return self.reject_stale(seq),
            Some(current) if seq > current => {
                log::warn!(
                    "detection drift: sequence {} arrived with {}/{} tiles of sequence {}",
                    seq,
                    self.tile_cursor,
                    self.geometry.tile_count(),
                    current
                );
                flushed = self.emit(current);
                self.current = Some(seq);
            }
            Some(_) => {}
            None => self.current = Some(seq),
        }

        let ordinal = tile_index.unwrap_or(self.tile_cursor);
        let Some(tile) = self.geometry.tile_at(ordinal) else {
            log::warn!(
                "dropping detections for tile {} (grid has {} tiles)",
                ordinal,
                self.geometry.tile_count()
            );
            return flushed;
        };
        if self.received[ordinal] {
            log::warn!(
                "duplicate detections for tile {} of sequence {}, ignoring",
                ordinal,
                seq
            );
            self.stats.duplicate_tiles += 1;
            return flushed;
        }

        for detection in &batch.detections {
            if let Some(mapped) = self.geometry.to_frame_space(detection, tile, seq) {
                self.accumulator.push(mapped);
            }
        }
        self.received[ordinal] = true;
        self.tile_cursor += 1;

        if self.tile_cursor >= self.geometry.tile_count() {
            log::debug!("sending results for sequence number {}", seq);
            return self.emit(seq);
        }
        flushed
    }

    fn reject_stale(&mut self, seq: u64) -> Option<ReassembledFrame> {
        log::warn!(
            "dropping stale detections for sequence {} (current {:?}, last emitted {:?})",
            seq,
            self.current,
            self.last_closed
        );
        self.stats.stale_batches += 1;
        None
    }

    fn emit(&mut self, seq: u64) -> Option<ReassembledFrame> {
        let received = self.tile_cursor;
        let detections = std::mem::take(&mut self.accumulator);
        self.clear_window();
        self.current = None;
        self.last_closed = Some(seq);
        if received == 0 {
            return None;
        }

        let completeness = Completeness::from_counts(received, self.geometry.tile_count());
        if completeness.is_complete() {
            self.stats.complete += 1;
        } else {
            self.stats.partial += 1;
        }
        Some(ReassembledFrame::from_candidates(
            seq,
            detections,
            completeness,
            &self.nms,
            self.geometry.frame_size(),
        ))
    }

    fn clear_window(&mut self) {
        self.accumulator.clear();
        self.received.iter_mut().for_each(|seen| *seen = false);
        self.tile_cursor = 0;
    }
}
