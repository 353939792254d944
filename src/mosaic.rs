//! Full-frame mosaic from tile images.
//!
//! Tiles of one frame are blitted into a shared canvas at their grid offsets.
//! Later tiles overwrite the overlap bands of earlier ones; there is no
//! blending. Cycle completion and drift follow the same rules as detection
//! reassembly.

use image::imageops;
use image::RgbImage;

use crate::geometry::{MosaicLayout, TileGeometry};
use crate::message::{Completeness, Frame, Sequenced};

/// Reconstructed full frame.
#[derive(Debug)]
pub struct MosaicFrame {
    pub frame: Frame,
    pub completeness: Completeness,
}

impl Sequenced for MosaicFrame {
    fn sequence_number(&self) -> u64 {
        self.frame.sequence_number
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MosaicStats {
    pub complete: u64,
    pub partial: u64,
    pub stale_tiles: u64,
    pub rejected_tiles: u64,
}

struct Window {
    sequence_number: u64,
    tile_size: (u32, u32),
    layout: MosaicLayout,
    canvas: RgbImage,
}

pub struct FrameMosaicBuilder {
    geometry: TileGeometry,
    window: Option<Window>,
    last_closed: Option<u64>,
    received: Vec<bool>,
    tile_cursor: usize,
    stats: MosaicStats,
}

impl FrameMosaicBuilder {
    pub fn new(geometry: TileGeometry) -> Self {
        let tile_count = geometry.tile_count();
        Self {
            geometry,
            window: None,
            last_closed: None,
            received: vec![false; tile_count],
            tile_cursor: 0,
            stats: MosaicStats::default(),
        }
    }

    pub fn geometry(&self) -> &TileGeometry {
        &self.geometry
    }

    pub fn tile_cursor(&self) -> usize {
        self.tile_cursor
    }

    pub fn stats(&self) -> MosaicStats {
        self.stats
    }

    /// Write `tile` at row-major ordinal `tile_index` of its frame.
    pub fn ingest(&mut self, tile: Frame, tile_index: usize) -> Option<MosaicFrame> {
        self.ingest_at(tile, Some(tile_index))
    }

    /// Write `tile` at the position implied by arrival order.
    pub fn ingest_next(&mut self, tile: Frame) -> Option<MosaicFrame> {
        self.ingest_at(tile, None)
    }

    /// Drop the open canvas and forget the last emitted sequence number.
    pub fn reset(&mut self) {
        self.window = None;
        self.last_closed = None;
        self.clear_received();
    }

    fn ingest_at(&mut self, tile: Frame, tile_index: Option<usize>) -> Option<MosaicFrame> {
        let seq = tile.sequence_number;
        if self.last_closed.is_some_and(|closed| seq <= closed) {
            return self.reject_stale(seq);
        }

        let mut flushed = None;
        match self.window.as_ref().map(|w| w.sequence_number) {
            Some(current) if seq < current => return self.reject_stale(seq),
            Some(current) if seq > current => {
                log::warn!(
                    "mosaic drift: sequence {} arrived with {}/{} tiles of sequence {}",
                    seq,
                    self.tile_cursor,
                    self.geometry.tile_count(),
                    current
                );
                flushed = self.emit();
            }
            _ => {}
        }

        let ordinal = tile_index.unwrap_or(self.tile_cursor);
        if ordinal >= self.geometry.tile_count() {
            log::warn!(
                "dropping tile image {} (grid has {} tiles)",
                ordinal,
                self.geometry.tile_count()
            );
            self.stats.rejected_tiles += 1;
            return flushed;
        }
        if self.received[ordinal] {
            log::warn!("duplicate tile image {} for sequence {}, ignoring", ordinal, seq);
            self.stats.rejected_tiles += 1;
            return flushed;
        }

        let window = self.window.get_or_insert_with(|| {
            let tile_size = (tile.width(), tile.height());
            let layout = self.geometry.mosaic_layout(tile_size.0, tile_size.1);
            let canvas = RgbImage::new(layout.canvas_width, layout.canvas_height);
            Window {
                sequence_number: seq,
                tile_size,
                layout,
                canvas,
            }
        });
        if (tile.width(), tile.height()) != window.tile_size {
            log::warn!(
                "tile image {} is {}x{}, expected {}x{}; dropping",
                ordinal,
                tile.width(),
                tile.height(),
                window.tile_size.0,
                window.tile_size.1
            );
            self.stats.rejected_tiles += 1;
            return flushed;
        }

        let (x, y) = window.layout.offsets[ordinal];
        imageops::replace(&mut window.canvas, &tile.image, x as i64, y as i64);
        self.received[ordinal] = true;
        self.tile_cursor += 1;

        if self.tile_cursor >= self.geometry.tile_count() {
            return self.emit();
        }
        flushed
    }

    fn reject_stale(&mut self, seq: u64) -> Option<MosaicFrame> {
        log::warn!("dropping stale tile image for sequence {}", seq);
        self.stats.stale_tiles += 1;
        None
    }

    fn emit(&mut self) -> Option<MosaicFrame> {
        let received = self.tile_cursor;
        let window = self.window.take()?;
        self.clear_received();
        self.last_closed = Some(window.sequence_number);

        let completeness = Completeness::from_counts(received, self.geometry.tile_count());
        if completeness.is_complete() {
            self.stats.complete += 1;
        } else {
            self.stats.partial += 1;
        }
        Some(MosaicFrame {
            frame: Frame::new(window.sequence_number, window.canvas),
            completeness,
        })
    }

    fn clear_received(&mut self) {
        self.received.iter_mut().for_each(|seen| *seen = false);
        self.tile_cursor = 0;
    }
}
