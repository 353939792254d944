use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;

use crate::crop::{DEFAULT_CROP_BUFFER_CAPACITY, DEFAULT_LOOKAHEAD_CAPACITY};
use crate::geometry::TileGeometry;
use crate::reassemble::{NmsConfig, DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_OVERLAP_THRESHOLD};
use crate::sync::{DEFAULT_EVICTION_BATCH, DEFAULT_SYNC_CAPACITY};

const DEFAULT_TILE_COUNT: usize = 9;
const DEFAULT_TILE_STEP: f32 = 0.3;
const DEFAULT_TILE_OVERLAP: f32 = 0.1;
const DEFAULT_FRAME_WIDTH: u32 = 1280;
const DEFAULT_FRAME_HEIGHT: u32 = 720;
const DEFAULT_QUEUE_CAPACITY: usize = 30;

#[derive(Debug, Deserialize, Default)]
struct EngineConfigFile {
    tiling: Option<TilingConfigFile>,
    nms: Option<NmsConfigFile>,
    sync: Option<SyncConfigFile>,
    crops: Option<CropConfigFile>,
    queues: Option<QueueConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct TilingConfigFile {
    tile_count: Option<usize>,
    step: Option<f32>,
    overlap: Option<f32>,
    frame_width: Option<u32>,
    frame_height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct NmsConfigFile {
    confidence_threshold: Option<f32>,
    overlap_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct SyncConfigFile {
    capacity: Option<usize>,
    eviction_batch_size: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct CropConfigFile {
    lookahead_capacity: Option<usize>,
    buffer_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct QueueConfigFile {
    capacity: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tiling: TilingSettings,
    pub nms: NmsConfig,
    pub sync: SyncSettings,
    pub crop_lookahead_capacity: usize,
    /// Crops waiting for the join stage; the oldest is dropped when full.
    pub crop_buffer_capacity: usize,
    /// Bound of every input queue; full queues block the producer.
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TilingSettings {
    pub tile_count: usize,
    pub step: f32,
    pub overlap: f32,
    pub frame_width: u32,
    pub frame_height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub capacity: usize,
    pub eviction_batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tiling: TilingSettings {
                tile_count: DEFAULT_TILE_COUNT,
                step: DEFAULT_TILE_STEP,
                overlap: DEFAULT_TILE_OVERLAP,
                frame_width: DEFAULT_FRAME_WIDTH,
                frame_height: DEFAULT_FRAME_HEIGHT,
            },
            nms: NmsConfig {
                confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
                overlap_threshold: DEFAULT_OVERLAP_THRESHOLD,
            },
            sync: SyncSettings {
                capacity: DEFAULT_SYNC_CAPACITY,
                eviction_batch_size: DEFAULT_EVICTION_BATCH,
            },
            crop_lookahead_capacity: DEFAULT_LOOKAHEAD_CAPACITY,
            crop_buffer_capacity: DEFAULT_CROP_BUFFER_CAPACITY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Defaults, then the file named by `TILESTREAM_CONFIG` (if set), then
    /// `TILESTREAM_*` environment overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("TILESTREAM_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Like `load`, with the config file path given explicitly.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: EngineConfigFile) -> Self {
        let defaults = Self::default();
        let tiling = file.tiling.unwrap_or_default();
        let nms = file.nms.unwrap_or_default();
        let sync = file.sync.unwrap_or_default();
        let crops = file.crops.unwrap_or_default();
        Self {
            tiling: TilingSettings {
                tile_count: tiling.tile_count.unwrap_or(defaults.tiling.tile_count),
                step: tiling.step.unwrap_or(defaults.tiling.step),
                overlap: tiling.overlap.unwrap_or(defaults.tiling.overlap),
                frame_width: tiling.frame_width.unwrap_or(defaults.tiling.frame_width),
                frame_height: tiling.frame_height.unwrap_or(defaults.tiling.frame_height),
            },
            nms: NmsConfig {
                confidence_threshold: nms
                    .confidence_threshold
                    .unwrap_or(defaults.nms.confidence_threshold),
                overlap_threshold: nms
                    .overlap_threshold
                    .unwrap_or(defaults.nms.overlap_threshold),
            },
            sync: SyncSettings {
                capacity: sync.capacity.unwrap_or(defaults.sync.capacity),
                eviction_batch_size: sync
                    .eviction_batch_size
                    .unwrap_or(defaults.sync.eviction_batch_size),
            },
            crop_lookahead_capacity: crops
                .lookahead_capacity
                .unwrap_or(defaults.crop_lookahead_capacity),
            crop_buffer_capacity: crops
                .buffer_capacity
                .unwrap_or(defaults.crop_buffer_capacity),
            queue_capacity: file
                .queues
                .and_then(|queues| queues.capacity)
                .unwrap_or(defaults.queue_capacity),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(count) = env_parse::<usize>("TILESTREAM_TILE_COUNT")? {
            self.tiling.tile_count = count;
        }
        if let Some(step) = env_parse::<f32>("TILESTREAM_TILE_STEP")? {
            self.tiling.step = step;
        }
        if let Some(overlap) = env_parse::<f32>("TILESTREAM_TILE_OVERLAP")? {
            self.tiling.overlap = overlap;
        }
        if let Some(width) = env_parse::<u32>("TILESTREAM_FRAME_WIDTH")? {
            self.tiling.frame_width = width;
        }
        if let Some(height) = env_parse::<u32>("TILESTREAM_FRAME_HEIGHT")? {
            self.tiling.frame_height = height;
        }
        if let Some(threshold) = env_parse::<f32>("TILESTREAM_CONFIDENCE_THRESHOLD")? {
            self.nms.confidence_threshold = threshold;
        }
        if let Some(threshold) = env_parse::<f32>("TILESTREAM_OVERLAP_THRESHOLD")? {
            self.nms.overlap_threshold = threshold;
        }
        if let Some(capacity) = env_parse::<usize>("TILESTREAM_SYNC_CAPACITY")? {
            self.sync.capacity = capacity;
        }
        if let Some(batch) = env_parse::<usize>("TILESTREAM_EVICTION_BATCH_SIZE")? {
            self.sync.eviction_batch_size = batch;
        }
        if let Some(capacity) = env_parse::<usize>("TILESTREAM_CROP_LOOKAHEAD_CAPACITY")? {
            self.crop_lookahead_capacity = capacity;
        }
        if let Some(capacity) = env_parse::<usize>("TILESTREAM_CROP_BUFFER_CAPACITY")? {
            self.crop_buffer_capacity = capacity;
        }
        if let Some(capacity) = env_parse::<usize>("TILESTREAM_QUEUE_CAPACITY")? {
            self.queue_capacity = capacity;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.geometry()?;
        for (name, value) in [
            ("confidence_threshold", self.nms.confidence_threshold),
            ("overlap_threshold", self.nms.overlap_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be within 0..=1, got {}", name, value));
            }
        }
        if self.sync.capacity == 0 {
            return Err(anyhow!("sync capacity must be greater than zero"));
        }
        if self.sync.eviction_batch_size == 0 || self.sync.eviction_batch_size > self.sync.capacity
        {
            return Err(anyhow!(
                "eviction_batch_size must be between 1 and the sync capacity ({})",
                self.sync.capacity
            ));
        }
        if self.crop_lookahead_capacity == 0 {
            return Err(anyhow!("crop lookahead capacity must be greater than zero"));
        }
        if self.crop_buffer_capacity == 0 {
            return Err(anyhow!("crop buffer capacity must be greater than zero"));
        }
        if self.queue_capacity == 0 {
            return Err(anyhow!("queue capacity must be greater than zero"));
        }
        Ok(())
    }

    pub fn geometry(&self) -> Result<TileGeometry> {
        TileGeometry::new(
            self.tiling.tile_count,
            self.tiling.step,
            self.tiling.overlap,
            self.tiling.frame_width,
            self.tiling.frame_height,
        )
    }
}

fn read_config_file(path: &Path) -> Result<EngineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    let Ok(value) = std::env::var(key) else {
        return Ok(None);
    };
    if value.trim().is_empty() {
        return Ok(None);
    }
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| anyhow!("{} has an invalid value: {}", key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = EngineConfig::default();
        cfg.validate().expect("defaults are valid");
        assert_eq!(cfg.geometry().unwrap().tile_count(), 9);
        assert_eq!(cfg.sync.capacity, 200);
        assert_eq!(cfg.sync.eviction_batch_size, 10);
        assert_eq!(cfg.crop_lookahead_capacity, 20);
        assert_eq!(cfg.crop_buffer_capacity, 512);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let file: EngineConfigFile =
            serde_json::from_str(r#"{ "nms": { "overlap_threshold": 0.01 } }"#).unwrap();
        let cfg = EngineConfig::from_file(file);
        assert_eq!(cfg.nms.overlap_threshold, 0.01);
        assert_eq!(cfg.nms.confidence_threshold, DEFAULT_CONFIDENCE_THRESHOLD);
        assert_eq!(cfg.tiling.tile_count, DEFAULT_TILE_COUNT);
    }

    #[test]
    fn rejects_bad_values() {
        let mut cfg = EngineConfig::default();
        cfg.tiling.tile_count = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.nms.overlap_threshold = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.sync.eviction_batch_size = 500;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.queue_capacity = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.crop_buffer_capacity = 0;
        assert!(cfg.validate().is_err());
    }
}
