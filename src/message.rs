//! Message types flowing through the engine.
//!
//! Every message carries the sequence number of the logical frame it belongs to
//! and exposes it through [`Sequenced`]. Stages are keyed on that number only;
//! nothing else about a message's origin is trusted.
//!
//! - `Frame`: owned RGB image (a tile image, or a reconstructed mosaic).
//! - `TileDetections`: one detection batch for one tile, tile-local coordinates.
//! - `FrameDetection`: a detection after transform into frame space.
//! - `CropRecord`: the image crop one detection was made in.

use image::RgbImage;

/// Anything tagged with a frame sequence number.
pub trait Sequenced {
    fn sequence_number(&self) -> u64;
}

// ----------------------------------------------------------------------------
// Frame: owned image buffer
// ----------------------------------------------------------------------------

/// Owned image tagged with a sequence number.
///
/// Deliberately not `Clone`: a frame has exactly one owner at a time and is
/// handed between stages by move.
#[derive(Debug)]
pub struct Frame {
    pub sequence_number: u64,
    pub image: RgbImage,
}

impl Frame {
    pub fn new(sequence_number: u64, image: RgbImage) -> Self {
        Self {
            sequence_number,
            image,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

impl Sequenced for Frame {
    fn sequence_number(&self) -> u64 {
        self.sequence_number
    }
}

// ----------------------------------------------------------------------------
// Detections
// ----------------------------------------------------------------------------

/// Bounding box normalized (0..1) to the tile it was detected in.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
    pub confidence: f32,
    pub label: Option<String>,
}

impl Detection {
    pub fn new(xmin: f32, ymin: f32, xmax: f32, ymax: f32, confidence: f32) -> Self {
        Self {
            xmin,
            ymin,
            xmax,
            ymax,
            confidence,
            label: None,
        }
    }
}

/// All detections the inference pass produced for one tile.
#[derive(Clone, Debug, Default)]
pub struct TileDetections {
    pub sequence_number: u64,
    pub detections: Vec<Detection>,
}

impl TileDetections {
    pub fn new(sequence_number: u64, detections: Vec<Detection>) -> Self {
        Self {
            sequence_number,
            detections,
        }
    }
}

impl Sequenced for TileDetections {
    fn sequence_number(&self) -> u64 {
        self.sequence_number
    }
}

/// Detection in full-frame normalized coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameDetection {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
    pub confidence: f32,
    pub label: Option<String>,
    pub frame_sequence_number: u64,
    /// Row-major ordinal of the tile the detection came from.
    pub tile_index: usize,
}

impl FrameDetection {
    /// Box in absolute pixels of a `width` x `height` frame: `(x, y, w, h)`.
    pub fn pixel_box(&self, width: u32, height: u32) -> (f64, f64, f64, f64) {
        let w = width as f64;
        let h = height as f64;
        let x0 = (self.xmin as f64 * w).floor();
        let y0 = (self.ymin as f64 * h).floor();
        let x1 = (self.xmax as f64 * w).floor();
        let y1 = (self.ymax as f64 * h).floor();
        (x0, y0, (x1 - x0).max(0.0), (y1 - y0).max(0.0))
    }
}

impl Sequenced for FrameDetection {
    fn sequence_number(&self) -> u64 {
        self.frame_sequence_number
    }
}

// ----------------------------------------------------------------------------
// Crops
// ----------------------------------------------------------------------------

/// Image crop around one detection, from the independently sequenced crop stream.
#[derive(Debug)]
pub struct CropRecord {
    pub sequence_number: u64,
    pub image: RgbImage,
}

impl CropRecord {
    pub fn new(sequence_number: u64, image: RgbImage) -> Self {
        Self {
            sequence_number,
            image,
        }
    }
}

impl Sequenced for CropRecord {
    fn sequence_number(&self) -> u64 {
        self.sequence_number
    }
}

/// Whether a reconstructed artifact saw every tile of its cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completeness {
    Complete,
    /// Drift cut the cycle short; only `received` of `expected` tiles arrived.
    Partial { received: usize, expected: usize },
}

impl Completeness {
    pub(crate) fn from_counts(received: usize, expected: usize) -> Self {
        if received >= expected {
            Completeness::Complete
        } else {
            Completeness::Partial { received, expected }
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Completeness::Complete)
    }
}
