//! Upstream sources feeding the engine.
//!
//! Real deployments publish tile detections, tile images and crops from their
//! own inference pipeline straight into `EngineInputs`. The only source shipped
//! here is the synthetic `stub://` generator used by the daemon and tests.

pub mod synthetic;

pub use synthetic::{render_frame, SyntheticConfig, SyntheticCycle, SyntheticStats, SyntheticTileSource};
