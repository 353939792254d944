//! Tile geometry: mapping between tile-local and frame coordinates.
//!
//! A frame is cut into a square `grid x grid` of overlapping tiles. Tile
//! `(row, col)` starts at `(col * step, row * step)` (fractions of the frame) and
//! spans `step + overlap` in each direction. Tiles are numbered row-major.
//!
//! All crop rectangles are materialised in absolute pixels once, at
//! construction. Both `crop_rect` and `to_frame_space` derive from those pixel
//! values, so the two can never disagree by a rounding step.

use anyhow::{anyhow, Result};

/// Slack for floating-point error when flooring fractional pixel positions.
const PIXEL_EPSILON: f64 = 1e-6;

/// Position of a tile within the grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TileIndex {
    pub grid_row: usize,
    pub grid_col: usize,
}

impl TileIndex {
    pub fn new(grid_row: usize, grid_col: usize) -> Self {
        Self { grid_row, grid_col }
    }

    /// Row-major ordinal for a grid `grid_width` tiles wide.
    pub fn ordinal(&self, grid_width: usize) -> usize {
        self.grid_row * grid_width + self.grid_col
    }
}

/// Crop rectangle in absolute frame pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelRect {
    pub x_offset: u32,
    pub y_offset: u32,
    pub width: u32,
    pub height: u32,
}

/// Canvas size and per-tile pixel offsets for tiles delivered at one uniform
/// resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MosaicLayout {
    pub canvas_width: u32,
    pub canvas_height: u32,
    /// `(x, y)` of each tile's top-left corner, by ordinal.
    pub offsets: Vec<(u32, u32)>,
}

#[derive(Clone, Debug)]
pub struct TileGeometry {
    grid_width: usize,
    step: f64,
    overlap: f64,
    frame_width: u32,
    frame_height: u32,
    crops: Vec<PixelRect>,
}

impl TileGeometry {
    /// Build the tiling scheme. Rejects any configuration that cannot tile
    /// the frame: zero or non-square tile counts, non-positive step, negative
    /// overlap, empty frames, or tiles that would run past the frame edge.
    pub fn new(
        tile_count: usize,
        step: f32,
        overlap: f32,
        frame_width: u32,
        frame_height: u32,
    ) -> Result<Self> {
        if tile_count == 0 {
            return Err(anyhow!("tile_count must be greater than zero"));
        }
        let grid_width = integer_sqrt(tile_count)
            .ok_or_else(|| anyhow!("tile_count {} is not a square grid", tile_count))?;
        if !step.is_finite() || step <= 0.0 {
            return Err(anyhow!("tile step must be a positive fraction, got {}", step));
        }
        if !overlap.is_finite() || overlap < 0.0 {
            return Err(anyhow!("tile overlap must be non-negative, got {}", overlap));
        }
        if frame_width == 0 || frame_height == 0 {
            return Err(anyhow!(
                "frame size must be non-zero, got {}x{}",
                frame_width,
                frame_height
            ));
        }

        let step = step as f64;
        let overlap = overlap as f64;
        let extent = (grid_width - 1) as f64 * step + step + overlap;
        if extent > 1.0 + PIXEL_EPSILON {
            return Err(anyhow!(
                "tiles extend past the frame: {} x {:.3} step + {:.3} overlap = {:.3}",
                grid_width,
                step,
                overlap,
                extent
            ));
        }

        let crop_width = floor_px((step + overlap) * frame_width as f64);
        let crop_height = floor_px((step + overlap) * frame_height as f64);
        if crop_width == 0 || crop_height == 0 {
            return Err(anyhow!(
                "tiles collapse to zero pixels on a {}x{} frame",
                frame_width,
                frame_height
            ));
        }

        let mut crops = Vec::with_capacity(tile_count);
        for ordinal in 0..tile_count {
            let row = ordinal / grid_width;
            let col = ordinal % grid_width;
            let x_offset = floor_px(col as f64 * step * frame_width as f64);
            let y_offset = floor_px(row as f64 * step * frame_height as f64);
            crops.push(PixelRect {
                x_offset,
                y_offset,
                width: crop_width.min(frame_width - x_offset),
                height: crop_height.min(frame_height - y_offset),
            });
        }

        Ok(Self {
            grid_width,
            step,
            overlap,
            frame_width,
            frame_height,
            crops,
        })
    }

    pub fn tile_count(&self) -> usize {
        self.crops.len()
    }

    pub fn grid_width(&self) -> usize {
        self.grid_width
    }

    pub fn frame_size(&self) -> (u32, u32) {
        (self.frame_width, self.frame_height)
    }

    /// Tile at a row-major ordinal, or `None` when the ordinal is off the grid.
    pub fn tile_at(&self, ordinal: usize) -> Option<TileIndex> {
        if ordinal >= self.tile_count() {
            return None;
        }
        Some(TileIndex::new(
            ordinal / self.grid_width,
            ordinal % self.grid_width,
        ))
    }

    pub fn crop_pixels(&self, tile: TileIndex) -> Option<PixelRect> {
        if tile.grid_row >= self.grid_width || tile.grid_col >= self.grid_width {
            return None;
        }
        self.crops.get(tile.ordinal(self.grid_width)).copied()
    }

    /// Crop rectangle of `tile` as `(x0, y0, x1, y1)` in frame-normalized units.
    pub fn crop_rect(&self, tile: TileIndex) -> Option<(f32, f32, f32, f32)> {
        let rect = self.crop_pixels(tile)?;
        let fw = self.frame_width as f64;
        let fh = self.frame_height as f64;
        Some((
            (rect.x_offset as f64 / fw) as f32,
            (rect.y_offset as f64 / fh) as f32,
            ((rect.x_offset + rect.width) as f64 / fw) as f32,
            ((rect.y_offset + rect.height) as f64 / fh) as f32,
        ))
    }

    /// Map a tile-local detection into frame space.
    ///
    /// Returns `None` only for a tile off the grid. The result is clamped
    /// into the frame with `max >= min` on both axes.
    pub fn to_frame_space(
        &self,
        detection: &crate::Detection,
        tile: TileIndex,
        frame_sequence_number: u64,
    ) -> Option<crate::FrameDetection> {
        let rect = self.crop_pixels(tile)?;
        let fw = self.frame_width as f64;
        let fh = self.frame_height as f64;
        let map_x = |local: f32| {
            (local as f64 * rect.width as f64 + rect.x_offset as f64) / fw
        };
        let map_y = |local: f32| {
            (local as f64 * rect.height as f64 + rect.y_offset as f64) / fh
        };

        let xmin = clamp_unit(map_x(detection.xmin));
        let ymin = clamp_unit(map_y(detection.ymin));
        let xmax = clamp_unit(map_x(detection.xmax)).max(xmin);
        let ymax = clamp_unit(map_y(detection.ymax)).max(ymin);

        Some(crate::FrameDetection {
            xmin: xmin as f32,
            ymin: ymin as f32,
            xmax: xmax as f32,
            ymax: ymax as f32,
            confidence: detection.confidence,
            label: detection.label.clone(),
            frame_sequence_number,
            tile_index: tile.ordinal(self.grid_width),
        })
    }

    /// Layout of a mosaic assembled from tiles that are each `tile_width` x
    /// `tile_height` pixels.
    ///
    /// Neighbouring tiles advance by the step's share of a tile, so adjacent
    /// tiles overlap by `tile_width - stride_x` pixels.
    pub fn mosaic_layout(&self, tile_width: u32, tile_height: u32) -> MosaicLayout {
        let share = self.step / (self.step + self.overlap);
        let stride_x = floor_px(tile_width as f64 * share);
        let stride_y = floor_px(tile_height as f64 * share);
        let steps = (self.grid_width - 1) as u32;

        let offsets = (0..self.tile_count())
            .map(|ordinal| {
                let row = (ordinal / self.grid_width) as u32;
                let col = (ordinal % self.grid_width) as u32;
                (col * stride_x, row * stride_y)
            })
            .collect();

        MosaicLayout {
            canvas_width: stride_x * steps + tile_width,
            canvas_height: stride_y * steps + tile_height,
            offsets,
        }
    }
}

fn floor_px(value: f64) -> u32 {
    (value + PIXEL_EPSILON).floor().max(0.0) as u32
}

fn clamp_unit(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

fn integer_sqrt(n: usize) -> Option<usize> {
    let root = (n as f64).sqrt().round() as usize;
    (root * root == n).then_some(root)
}
