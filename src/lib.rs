//! Tiled-stream reconstruction engine.
//!
//! An upstream inference pipeline splits every video frame into an N x N grid
//! of overlapping tiles and publishes, per tile, a detection batch and the tile
//! image, plus one image crop per detection. Each stream arrives on its own
//! queue at its own pace. This crate puts the frames back together:
//!
//! - tile detections are mapped into frame coordinates and merged with
//!   non-maximum suppression (`reassemble`);
//! - tile images are stitched into a full-frame mosaic (`mosaic`);
//! - the two are joined by frame sequence number (`sync`);
//! - every surviving box is paired with the crop it was made in (`crop`).
//!
//! Streams may start mid-frame (`align`) and may lose messages; losses surface
//! as partial frames or missing crop matches, never as cross-frame mixups.
//!
//! # Module Structure
//!
//! - `geometry`: tile grid layout and coordinate transforms
//! - `message`: sequenced message types
//! - `pipeline`: threaded engine wiring every stage together
//! - `config`: engine configuration (file + environment)
//! - `ingest`: synthetic upstream for the daemon and tests

pub mod align;
pub mod config;
pub mod crop;
pub mod decode;
pub mod geometry;
pub mod ingest;
pub mod message;
pub mod mosaic;
pub mod pipeline;
pub mod reassemble;
pub mod sync;

pub use align::{AlignState, StartupAligner};
pub use config::EngineConfig;
pub use crop::{
    crop_buffer, CropBufferReader, CropBufferWriter, CropMatch, CropMatcher, CropSource, CropStats,
    MatchedCrop,
};
pub use decode::CropDecoder;
pub use geometry::{MosaicLayout, PixelRect, TileGeometry, TileIndex};
pub use ingest::{SyntheticConfig, SyntheticTileSource};
pub use message::{
    Completeness, CropRecord, Detection, Frame, FrameDetection, Sequenced, TileDetections,
};
pub use mosaic::{FrameMosaicBuilder, MosaicFrame, MosaicStats};
pub use pipeline::{Engine, EngineHandle, EngineInputs, EngineStats, FrameResult};
pub use reassemble::{DetectionReassembler, NmsConfig, ReassembledFrame, ReassemblyStats};
pub use sync::{SequenceSynchronizer, SyncGroup, SyncStats};
